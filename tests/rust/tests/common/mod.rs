//! Helpers shared by the multi-rank tests

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use collective::{Collective, LocalCollective};
use runtime_core::logging::{init_tracing, DEFAULT_DIRECTIVES};
use runtime_core::{DistributedConfig, ModelRole, PartitionStage, StrategyConfig, Tensor};
use strategy::{LocalBackend, TrainingStrategy};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Run `f` once per simulated rank on its own thread and collect results by rank
pub fn run_ranks<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Arc<LocalCollective>) -> anyhow::Result<T> + Send + Sync + 'static,
{
    init_tracing(DEFAULT_DIRECTIVES);
    let f = Arc::new(f);
    let handles: Vec<_> = LocalCollective::group(world_size)
        .into_iter()
        .map(|comm| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(Arc::new(comm)))
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked").expect("rank failed"))
        .collect()
}

/// Per-thread runtime for the async checkpoint calls
pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

pub fn config(stage: PartitionStage, train_batch_size: usize) -> StrategyConfig {
    StrategyConfig {
        partition_stage: stage,
        train_batch_size,
        micro_train_batch_size: 2,
        distributed: DistributedConfig {
            collective_timeout: TEST_TIMEOUT,
            local_rank: Some(0),
        },
        ..StrategyConfig::default()
    }
}

/// Strategy joined to `comm`, with the backend kept for inspection
pub fn setup(
    config: StrategyConfig,
    comm: Arc<LocalCollective>,
) -> anyhow::Result<(TrainingStrategy, Arc<LocalBackend>)> {
    let backend = Arc::new(LocalBackend::new());
    let mut strategy = TrainingStrategy::new(config, backend.clone());
    let comm: Arc<dyn Collective> = comm;
    strategy.setup_distributed(comm)?;
    Ok((strategy, backend))
}

pub fn policy() -> engine::Model {
    engine::Model::new("policy", ModelRole::Primary)
        .with_parameter("layers.0.weight", Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]), true)
        .with_parameter("layers.0.bias", Tensor::from_vec(vec![0.5, -0.5]), true)
        .with_parameter("embed.weight", Tensor::from_vec(vec![9.0, 8.0, 7.0]), false)
        .with_buffer("rotary.inv_freq", Tensor::from_vec(vec![1.0, 0.1]))
}
