//! Collective transport trait definition
//!
//! Defines the synchronous interface every process-group transport must
//! implement. Each call is a barrier: all ranks must reach the matching call
//! in the same order or the group hangs until the configured timeout.

use std::time::Duration;

use runtime_core::{Device, Rank, Result, Tensor};

/// Reduction applied by the transport itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveOp {
    /// Elementwise sum
    Sum,

    /// Elementwise maximum
    Max,
}

/// Process-group transport
///
/// Implementors provide all-reduce, all-gather, and barrier over buffers
/// resident on the accelerator returned by [`Collective::device`].
pub trait Collective: Send + Sync {
    /// Join the process group
    ///
    /// # Arguments
    /// * `timeout` - Applied to every subsequent collective call
    ///
    /// # Errors
    /// Returns error if the group cannot be formed
    fn init(&self, timeout: Duration) -> Result<()>;

    /// Returns true once [`Collective::init`] succeeded
    fn is_initialized(&self) -> bool;

    /// Rank of this process
    fn rank(&self) -> Rank;

    /// Number of processes in the group
    fn world_size(&self) -> usize;

    /// Device that collective buffers must live on
    fn device(&self) -> Device;

    /// Reduce `buffer` in place across all ranks
    ///
    /// # Errors
    /// Returns error if uninitialized, if the buffer is not on
    /// [`Collective::device`], if shapes disagree across ranks, or on timeout
    fn all_reduce(&self, buffer: &mut Tensor, op: CollectiveOp) -> Result<()>;

    /// Collect one buffer from every rank, ordered by rank
    ///
    /// # Errors
    /// Same conditions as [`Collective::all_reduce`]
    fn all_gather(&self, buffer: &Tensor) -> Result<Vec<Tensor>>;

    /// Block until every rank arrives
    fn barrier(&self) -> Result<()>;
}
