//! Runtime Core - Foundation for the distributed training strategy
//!
//! Provides core types, tensors, configuration, error handling, and process
//! identity shared by the collective, engine, and checkpoint layers.

pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod seed;
pub mod tensor;
pub mod types;

pub use config::{DistributedConfig, RetentionConfig, StrategyConfig};
pub use error::{Error, Result};
pub use process::{ProcessContext, Role};
pub use seed::SeedSequence;
pub use tensor::{StateDict, Tensor};
pub use types::*;
