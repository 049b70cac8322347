//! Core type definitions for the distributed training strategy

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Process identity within a group (0-indexed)
pub type Rank = usize;

/// Optimizer step counter
pub type Step = u64;

/// How much training state is partitioned across the process group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PartitionStage {
    /// Every process holds full parameters, gradients, and optimizer state
    NoPartition,

    /// Optimizer state is sharded
    OptimizerPartition,

    /// Optimizer state and gradients are sharded
    OptimizerAndGradientPartition,

    /// Parameters are sharded too; full tensors exist only inside a gather scope
    FullPartition,
}

impl PartitionStage {
    /// Numeric stage (0-3)
    pub fn as_u8(self) -> u8 {
        match self {
            PartitionStage::NoPartition => 0,
            PartitionStage::OptimizerPartition => 1,
            PartitionStage::OptimizerAndGradientPartition => 2,
            PartitionStage::FullPartition => 3,
        }
    }

    /// Returns true if parameters may be physically sharded
    pub fn shards_parameters(self) -> bool {
        self == PartitionStage::FullPartition
    }
}

impl TryFrom<u8> for PartitionStage {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PartitionStage::NoPartition),
            1 => Ok(PartitionStage::OptimizerPartition),
            2 => Ok(PartitionStage::OptimizerAndGradientPartition),
            3 => Ok(PartitionStage::FullPartition),
            other => Err(Error::InvalidConfig {
                message: format!("partition stage must be 0-3, got {}", other),
            }),
        }
    }
}

impl From<PartitionStage> for u8 {
    fn from(stage: PartitionStage) -> Self {
        stage.as_u8()
    }
}

impl fmt::Display for PartitionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage-{}", self.as_u8())
    }
}

/// Role of a model in the training setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelRole {
    /// The trainable policy/actor model
    Primary,

    /// Auxiliary model (critic, reward, reference)
    Auxiliary,

    /// Exponential moving-average copy of a primary model
    Shadow,
}

/// Where tensor data lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Host memory
    Cpu,

    /// Accelerator by local device index
    Accelerator(usize),
}

impl Device {
    /// Returns true for host memory
    pub fn is_cpu(self) -> bool {
        self == Device::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(index) => write!(f, "accel:{}", index),
        }
    }
}

/// Metric reduction requested by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceOp {
    Mean,
    Max,
    Sum,
}

impl FromStr for ReduceOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mean" => Ok(ReduceOp::Mean),
            "max" => Ok(ReduceOp::Max),
            "sum" => Ok(ReduceOp::Sum),
            other => Err(Error::invalid_argument(format!(
                "reduce op must be one of mean, max, sum; got {:?}",
                other
            ))),
        }
    }
}
