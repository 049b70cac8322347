//! Engine - Models, partitioned parameters, and the training-engine seam
//!
//! Provides:
//! - **Parameters** with explicit residency (replicated, partitioned, gathered)
//! - **Partition-aware access**: a scoped guard that materializes sharded
//!   parameters and releases them on every exit path
//! - **Models** with buffers and low-rank adapters
//! - **Engine traits** (`EngineBackend`, `TrainingEngine`) and typed engine configuration

pub mod config;
pub mod interface;
pub mod model;
pub mod parameter;
pub mod partition;

pub use config::{EngineConfig, EvalOptions, OffloadDevice, TrainOptions};
pub use interface::{
    ClientState, EngineBackend, EngineRequest, Initialized, LoadOptions, LoadedCheckpoint,
    LrScheduler, ManagedModel, Optimizer, TrainingEngine,
};
pub use model::{LowRankAdapter, Model};
pub use parameter::{Parameter, ParameterHandle, Residency, ShardLayout};
pub use partition::{
    gathered_scope, params_to_fetch, with_gathered, GatheredParameters, ParameterPartitioner,
    ShardedPartitioner,
};
