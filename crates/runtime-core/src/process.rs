//! Process identity and primary-process gating

use crate::{Device, Rank};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tracing::info;

/// Whether this process performs side effects for the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Rank 0: owns console output and the checkpoint root
    Primary,

    /// Every other rank
    Secondary,
}

impl Role {
    pub fn is_primary(self) -> bool {
        self == Role::Primary
    }
}

/// Identity of this process inside its group
///
/// Passed explicitly to every operation that branches on rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessContext {
    /// Rank in the group
    pub rank: Rank,

    /// Number of processes in the group
    pub world_size: usize,

    /// Local accelerator index
    pub local_device_index: usize,
}

impl ProcessContext {
    pub fn new(rank: Rank, world_size: usize, local_device_index: usize) -> Self {
        Self {
            rank,
            world_size,
            local_device_index,
        }
    }

    /// Context for a single-process group
    pub fn single() -> Self {
        Self::new(0, 1, 0)
    }

    pub fn role(&self) -> Role {
        if self.rank == 0 {
            Role::Primary
        } else {
            Role::Secondary
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role().is_primary()
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Accelerator assigned to this process
    pub fn device(&self) -> Device {
        Device::Accelerator(self.local_device_index)
    }

    /// Emit a message on the primary process only
    pub fn log(&self, message: impl Display) {
        if self.is_primary() {
            info!(rank = self.rank, "{}", message);
        }
    }
}
