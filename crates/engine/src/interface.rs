//! Seams to the partitioned training engine

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use collective::Collective;
use runtime_core::{Error, PartitionStage, Result, Tensor};

use crate::config::EngineConfig;
use crate::model::Model;
use crate::partition::ParameterPartitioner;

/// Caller-defined state stored next to an engine checkpoint
pub type ClientState = serde_json::Map<String, serde_json::Value>;

/// An optimizer the engine drives
pub trait Optimizer: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn learning_rate(&self) -> f32;

    /// Number of parameters across all groups
    fn num_parameters(&self) -> usize;
}

/// A learning-rate schedule the engine steps with the optimizer
pub trait LrScheduler: Send + Sync + fmt::Debug {
    fn step(&self);

    fn last_lr(&self) -> f32;

    /// Steps taken so far
    fn steps(&self) -> u64;

    /// Resume from a saved step count
    fn set_steps(&self, steps: u64);
}

/// Which parts of an engine checkpoint to restore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub load_module_strict: bool,
    pub load_optimizer_states: bool,
    pub load_lr_scheduler_states: bool,
    pub load_module_only: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            load_module_strict: true,
            load_optimizer_states: true,
            load_lr_scheduler_states: true,
            load_module_only: false,
        }
    }
}

/// Result of a successful engine checkpoint load
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    /// Directory the checkpoint was read from
    pub path: PathBuf,

    pub client_state: ClientState,
}

/// An engine-wrapped model
///
/// `save_checkpoint` and `load_checkpoint` are collective: every rank calls
/// them with the same arguments.
#[async_trait]
pub trait TrainingEngine: Send + Sync {
    /// The wrapped model
    fn module(&self) -> &Model;

    fn module_mut(&mut self) -> &mut Model;

    fn config(&self) -> &EngineConfig;

    /// Accumulate gradients for one micro batch
    fn backward(&mut self, loss: &Tensor) -> Result<()>;

    /// Advance one micro step; the optimizer runs at accumulation boundaries
    fn step(&mut self) -> Result<()>;

    /// Optimizer steps taken so far
    fn global_steps(&self) -> u64;

    async fn save_checkpoint(
        &mut self,
        dir: &Path,
        tag: Option<&str>,
        client_state: &ClientState,
        save_latest: bool,
    ) -> Result<()>;

    /// Restore from `dir`; `tag == None` follows the `latest` pointer
    ///
    /// Returns `Ok(None)` when there is nothing to load.
    async fn load_checkpoint(
        &mut self,
        dir: &Path,
        tag: Option<&str>,
        options: &LoadOptions,
    ) -> Result<Option<LoadedCheckpoint>>;
}

/// Everything the engine needs to wrap one model
pub struct EngineRequest {
    pub model: Model,
    pub optimizer: Option<Arc<dyn Optimizer>>,
    pub scheduler: Option<Arc<dyn LrScheduler>>,
    pub config: EngineConfig,
    pub local_rank: usize,
    pub collective: Arc<dyn Collective>,
    pub partitioner: Arc<dyn ParameterPartitioner>,
}

/// Engine-wrapped replacements for a request's inputs
pub struct Initialized {
    pub engine: Box<dyn TrainingEngine>,
    pub optimizer: Option<Arc<dyn Optimizer>>,
    pub scheduler: Option<Arc<dyn LrScheduler>>,
}

/// Builds engines from models and configuration
pub trait EngineBackend: Send + Sync {
    fn initialize(&self, request: EngineRequest) -> Result<Initialized>;
}

/// A model before or after engine wrapping
pub enum ManagedModel {
    Bare(Model),
    Wrapped(Box<dyn TrainingEngine>),
}

impl ManagedModel {
    /// The plain model, whether or not it is wrapped
    pub fn unwrap_model(&self) -> &Model {
        match self {
            ManagedModel::Bare(model) => model,
            ManagedModel::Wrapped(engine) => engine.module(),
        }
    }

    pub fn unwrap_model_mut(&mut self) -> &mut Model {
        match self {
            ManagedModel::Bare(model) => model,
            ManagedModel::Wrapped(engine) => engine.module_mut(),
        }
    }

    pub fn is_wrapped(&self) -> bool {
        matches!(self, ManagedModel::Wrapped(_))
    }

    /// Partition stage in effect; bare models are never partitioned
    pub fn stage(&self) -> PartitionStage {
        match self {
            ManagedModel::Bare(_) => PartitionStage::NoPartition,
            ManagedModel::Wrapped(engine) => engine.config().stage(),
        }
    }

    /// The engine, or an error for a model that was never prepared
    pub fn engine_mut(&mut self) -> Result<&mut dyn TrainingEngine> {
        match self {
            ManagedModel::Bare(model) => Err(Error::invalid_argument(format!(
                "model {} is not engine-wrapped; call prepare first",
                model.name()
            ))),
            ManagedModel::Wrapped(engine) => Ok(engine.as_mut()),
        }
    }
}

impl From<Model> for ManagedModel {
    fn from(model: Model) -> Self {
        ManagedModel::Bare(model)
    }
}

impl fmt::Debug for ManagedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagedModel::Bare(model) => f.debug_tuple("Bare").field(&model.name()).finish(),
            ManagedModel::Wrapped(engine) => f
                .debug_struct("Wrapped")
                .field("model", &engine.module().name())
                .field("stage", &engine.config().stage())
                .finish(),
        }
    }
}
