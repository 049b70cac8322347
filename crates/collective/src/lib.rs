//! Collective - Process-group communication for the training strategy
//!
//! Provides:
//! - **Transport trait** (`Collective`) for all-reduce, all-gather, and barrier
//! - **In-process transport** (`LocalCollective`) simulating an N-rank group with threads
//! - **Reduction engine** that reduces or gathers nested metric values leaf by leaf
//!
//! # Example
//!
//! ```rust
//! use collective::{Collective, LocalCollective, ReductionEngine, Value};
//! use runtime_core::ReduceOp;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn example() -> runtime_core::Result<()> {
//! let comm = LocalCollective::single();
//! comm.init(Duration::from_secs(60))?;
//!
//! let engine = ReductionEngine::new(Arc::new(comm));
//! let metrics = Value::map([("loss", 0.5f32), ("reward", 1.25f32)]);
//! let reduced = engine.reduce(metrics, ReduceOp::Mean)?;
//! assert_eq!(reduced.get("loss").and_then(Value::as_scalar), Some(0.5));
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

mod local;
mod reduce;
mod transport;
mod value;

pub use local::{CallCounts, LocalCollective};
pub use reduce::ReductionEngine;
pub use transport::{Collective, CollectiveOp};
pub use value::{LeafVisitor, Value};
