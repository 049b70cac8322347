//! Strategy - Distributed training coordination
//!
//! Wraps models with a partitioning engine, reduces metrics across the
//! process group, keeps EMA shadows in sync, and manages checkpoints.
//!
//! ```no_run
//! use std::sync::Arc;
//! use collective::LocalCollective;
//! use strategy::{LocalBackend, TrainingStrategy};
//!
//! # fn main() -> runtime_core::Result<()> {
//! let mut strategy = TrainingStrategy::new(Default::default(), Arc::new(LocalBackend::new()));
//! strategy.setup_distributed(Arc::new(LocalCollective::single()))?;
//! strategy.print("ready");
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod ema;
pub mod optimizer;
pub mod prepare;
pub mod strategy;

pub use backend::{LocalBackend, LATEST_FILE};
pub use ema::{EmaSynchronizer, DEFAULT_EMA_BETA};
pub use optimizer::{create_optimizer, AdamKind, AdamOptimizer, AdamSettings, ParamGroup, WarmupSchedule};
pub use prepare::{
    Component, ModelPreparer, PrepareEntry, Prepared, PreparedEntry, PreparedTraining,
};
pub use strategy::{TrainingStrategy, LOCAL_RANK_ENV};
