//! In-process collective transport
//!
//! Simulates an N-rank process group inside one OS process, one thread per
//! rank. Every rank deposits its buffer into a shared round and blocks until
//! the round is complete, which reproduces the barrier semantics (and the
//! deadlock hazard) of a real transport.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use runtime_core::{Device, Error, Rank, Result, Tensor};
use tracing::{debug, instrument, warn};

use crate::transport::{Collective, CollectiveOp};

/// Per-rank call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub all_reduce: usize,
    pub all_gather: usize,
    pub barrier: usize,
}

impl CallCounts {
    /// Total collective calls
    pub fn total(&self) -> usize {
        self.all_reduce + self.all_gather + self.barrier
    }
}

#[derive(Debug, Default)]
struct CallStats {
    all_reduce: AtomicUsize,
    all_gather: AtomicUsize,
    barrier: AtomicUsize,
}

struct Contribution {
    operation: &'static str,
    buffer: Tensor,
}

struct RoundState {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Contribution>>,
    published: Option<Arc<Vec<Contribution>>>,
    readers_left: usize,
}

struct Rendezvous {
    world_size: usize,
    state: Mutex<RoundState>,
    cond: Condvar,
}

impl Rendezvous {
    fn new(world_size: usize) -> Self {
        Self {
            world_size,
            state: Mutex::new(RoundState {
                generation: 0,
                arrived: 0,
                slots: (0..world_size).map(|_| None).collect(),
                published: None,
                readers_left: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Deposit one contribution and wait for the rest of the round
    fn exchange(
        &self,
        rank: Rank,
        contribution: Contribution,
        timeout: Duration,
    ) -> Result<Arc<Vec<Contribution>>> {
        let operation = contribution.operation;
        let deadline = Instant::now() + timeout;
        let timed_out = || Error::CollectiveTimeout {
            operation: operation.to_string(),
            rank,
            timeout_ms: timeout.as_millis() as u64,
        };

        let mut state = self.state.lock();

        // The previous round must be fully consumed before slots are reused
        while state.published.is_some() {
            if self.cond.wait_until(&mut state, deadline).timed_out()
                && state.published.is_some()
            {
                return Err(timed_out());
            }
        }

        if state.slots[rank].is_some() {
            return Err(Error::Collective {
                message: format!("rank {} entered {} twice in one round", rank, operation),
            });
        }
        state.slots[rank] = Some(contribution);
        state.arrived += 1;
        let generation = state.generation;

        if state.arrived == self.world_size {
            let round: Vec<Contribution> = state.slots.iter_mut().filter_map(Option::take).collect();
            state.published = Some(Arc::new(round));
            state.readers_left = self.world_size;
            state.arrived = 0;
            state.generation += 1;
            self.cond.notify_all();
        } else {
            while state.generation == generation {
                if self.cond.wait_until(&mut state, deadline).timed_out()
                    && state.generation == generation
                {
                    warn!(rank, operation, "Collective call timed out");
                    return Err(timed_out());
                }
            }
        }

        let published = state.published.clone().ok_or_else(|| Error::Internal {
            message: "collective round completed without a result".to_string(),
        })?;
        state.readers_left -= 1;
        if state.readers_left == 0 {
            state.published = None;
            self.cond.notify_all();
        }

        Ok(published)
    }
}

/// One rank's handle onto an in-process group
pub struct LocalCollective {
    rank: Rank,
    rendezvous: Arc<Rendezvous>,
    timeout_ms: AtomicU64,
    initialized: AtomicBool,
    stats: CallStats,
}

impl LocalCollective {
    /// Create handles for every rank of a group; hand one to each thread
    pub fn group(world_size: usize) -> Vec<LocalCollective> {
        let rendezvous = Arc::new(Rendezvous::new(world_size));
        (0..world_size)
            .map(|rank| LocalCollective {
                rank,
                rendezvous: Arc::clone(&rendezvous),
                timeout_ms: AtomicU64::new(0),
                initialized: AtomicBool::new(false),
                stats: CallStats::default(),
            })
            .collect()
    }

    /// Single-process group
    pub fn single() -> LocalCollective {
        let mut group = Self::group(1);
        group.remove(0)
    }

    /// Snapshot of this rank's collective call counts
    pub fn call_counts(&self) -> CallCounts {
        CallCounts {
            all_reduce: self.stats.all_reduce.load(Ordering::SeqCst),
            all_gather: self.stats.all_gather.load(Ordering::SeqCst),
            barrier: self.stats.barrier.load(Ordering::SeqCst),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::SeqCst))
    }

    fn check_ready(&self, operation: &str, buffer: &Tensor) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized {
                operation: operation.to_string(),
            });
        }
        if buffer.device() != self.device() {
            return Err(Error::invalid_argument(format!(
                "{} buffer must live on {}, found {}",
                operation,
                self.device(),
                buffer.device()
            )));
        }
        Ok(())
    }

    fn round(&self, operation: &'static str, buffer: Tensor) -> Result<Vec<Tensor>> {
        let published = self.rendezvous.exchange(
            self.rank,
            Contribution { operation, buffer },
            self.timeout(),
        )?;

        if let Some(other) = published.iter().find(|c| c.operation != operation) {
            return Err(Error::Collective {
                message: format!(
                    "rank {} called {} while another rank called {}",
                    self.rank, operation, other.operation
                ),
            });
        }

        Ok(published.iter().map(|c| c.buffer.clone()).collect())
    }
}

impl Collective for LocalCollective {
    fn init(&self, timeout: Duration) -> Result<()> {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        debug!(
            rank = self.rank,
            world_size = self.world_size(),
            timeout_ms = timeout.as_millis() as u64,
            "Joined in-process group"
        );
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.rendezvous.world_size
    }

    fn device(&self) -> Device {
        Device::Accelerator(self.rank)
    }

    #[instrument(skip(self, buffer), fields(rank = self.rank, numel = buffer.numel()))]
    fn all_reduce(&self, buffer: &mut Tensor, op: CollectiveOp) -> Result<()> {
        self.check_ready("all_reduce", buffer)?;
        self.stats.all_reduce.fetch_add(1, Ordering::SeqCst);

        let contributions = self.round("all_reduce", buffer.clone())?;

        // Fold in rank order so every rank lands on bit-identical results
        let mut reduced: Option<Vec<f32>> = None;
        for (rank, contribution) in contributions.iter().enumerate() {
            if contribution.shape() != buffer.shape() {
                return Err(Error::ShapeMismatch {
                    name: format!("all_reduce contribution from rank {}", rank),
                    expected: buffer.shape().to_vec(),
                    actual: contribution.shape().to_vec(),
                });
            }
            match reduced.as_mut() {
                None => reduced = Some(contribution.data().to_vec()),
                Some(acc) => {
                    for (a, x) in acc.iter_mut().zip(contribution.data()) {
                        *a = match op {
                            CollectiveOp::Sum => *a + x,
                            CollectiveOp::Max => a.max(*x),
                        };
                    }
                }
            }
        }

        if let Some(reduced) = reduced {
            buffer.data_mut().copy_from_slice(&reduced);
        }
        Ok(())
    }

    #[instrument(skip(self, buffer), fields(rank = self.rank, numel = buffer.numel()))]
    fn all_gather(&self, buffer: &Tensor) -> Result<Vec<Tensor>> {
        self.check_ready("all_gather", buffer)?;
        self.stats.all_gather.fetch_add(1, Ordering::SeqCst);

        let device = self.device();
        Ok(self
            .round("all_gather", buffer.clone())?
            .into_iter()
            .map(|t| t.into_device(device))
            .collect())
    }

    fn barrier(&self) -> Result<()> {
        let marker = Tensor::zeros(&[0]).into_device(self.device());
        self.check_ready("barrier", &marker)?;
        self.stats.barrier.fetch_add(1, Ordering::SeqCst);
        self.round("barrier", marker).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<T, F>(world_size: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(LocalCollective) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = LocalCollective::group(world_size)
            .into_iter()
            .map(|comm| {
                let f = Arc::clone(&f);
                thread::spawn(move || {
                    comm.init(Duration::from_secs(10)).unwrap();
                    f(comm)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_all_reduce_sum_and_max() {
        let results = run_group(3, |comm| {
            let device = comm.device();
            let value = comm.rank() as f32 + 1.0;
            let mut sum = Tensor::from_vec(vec![value, -value]).into_device(device);
            comm.all_reduce(&mut sum, CollectiveOp::Sum).unwrap();
            let mut max = Tensor::from_vec(vec![value, -value]).into_device(device);
            comm.all_reduce(&mut max, CollectiveOp::Max).unwrap();
            (sum.into_data(), max.into_data())
        });

        for (sum, max) in results {
            assert_eq!(sum, vec![6.0, -6.0]);
            assert_eq!(max, vec![3.0, -1.0]);
        }
    }

    #[test]
    fn test_all_gather_is_rank_ordered() {
        let results = run_group(4, |comm| {
            let t = Tensor::scalar(comm.rank() as f32).into_device(comm.device());
            let parts = comm.all_gather(&t).unwrap();
            parts.iter().map(|p| p.data()[0]).collect::<Vec<_>>()
        });

        for gathered in results {
            assert_eq!(gathered, vec![0.0, 1.0, 2.0, 3.0]);
        }
    }

    #[test]
    fn test_repeated_rounds() {
        let results = run_group(2, |comm| {
            let mut total = 0.0;
            for step in 0..50 {
                let mut t = Tensor::scalar(step as f32).into_device(comm.device());
                comm.all_reduce(&mut t, CollectiveOp::Sum).unwrap();
                total += t.data()[0];
            }
            comm.barrier().unwrap();
            (total, comm.call_counts())
        });

        for (total, counts) in results {
            assert_eq!(total, 2.0 * (0..50).sum::<i32>() as f32);
            assert_eq!(counts.all_reduce, 50);
            assert_eq!(counts.barrier, 1);
        }
    }

    #[test]
    fn test_requires_init() {
        let comm = LocalCollective::single();
        let mut t = Tensor::scalar(1.0).into_device(comm.device());
        let result = comm.all_reduce(&mut t, CollectiveOp::Sum);
        assert!(matches!(result, Err(Error::NotInitialized { .. })));
        assert_eq!(comm.call_counts().total(), 0);
    }

    #[test]
    fn test_rejects_host_buffers() {
        let comm = LocalCollective::single();
        comm.init(Duration::from_secs(1)).unwrap();
        let mut t = Tensor::scalar(1.0);
        let result = comm.all_reduce(&mut t, CollectiveOp::Sum);
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn test_missing_peer_times_out() {
        let mut group = LocalCollective::group(2);
        let comm = group.remove(0);
        comm.init(Duration::from_millis(50)).unwrap();

        let mut t = Tensor::scalar(1.0).into_device(comm.device());
        let result = comm.all_reduce(&mut t, CollectiveOp::Sum);
        assert!(matches!(result, Err(Error::CollectiveTimeout { rank: 0, .. })));
    }

    #[test]
    fn test_mismatched_operations_are_reported() {
        let results = run_group(2, |comm| {
            let t = Tensor::scalar(1.0).into_device(comm.device());
            if comm.rank() == 0 {
                comm.all_gather(&t).map(|_| ())
            } else {
                comm.barrier()
            }
        });
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(Error::Collective { .. }))));
    }
}
