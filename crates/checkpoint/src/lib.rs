//! Checkpoint management for distributed training
//!
//! Provides bounded-retention checkpoint roots, an atomic state-dict file
//! format, and rank-aware save/load of full and weights-only checkpoints.

pub mod manager;
pub mod retention;
pub mod writer;

pub use manager::{bare_checkpoint_path, CheckpointManager, KeyRewrite, CONFIG_FILE, WEIGHTS_FILE};
pub use retention::{enforce_retention, scan_checkpoint_dirs, CheckpointDirectory, RetentionPolicy};
pub use writer::{read_state_dict, write_atomic, write_state_dict, StateDictFile};
