//! In-process engine backend
//!
//! Wraps models the way a partitioned engine would: shards parameters under
//! full partitioning, applies the offload policy, tracks accumulation
//! boundaries, and writes one resident-state file per rank on checkpoint.
//! Numeric optimizer updates are left to the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use checkpoint::{read_state_dict, write_atomic, write_state_dict};
use collective::Collective;
use engine::{
    ClientState, EngineBackend, EngineConfig, EngineRequest, Initialized, LoadOptions,
    LoadedCheckpoint, LrScheduler, Model, Optimizer, TrainingEngine,
};
use parking_lot::Mutex;
use runtime_core::{Device, Error, Rank, Result, Tensor};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

/// Name of the file pointing at the most recent tag
pub const LATEST_FILE: &str = "latest";

/// Engine backend that runs inside this process
#[derive(Debug, Default)]
pub struct LocalBackend {
    configs: Mutex<Vec<EngineConfig>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configurations passed to `initialize`, in call order
    pub fn configs(&self) -> Vec<EngineConfig> {
        self.configs.lock().clone()
    }

    pub fn initialize_calls(&self) -> usize {
        self.configs.lock().len()
    }
}

impl EngineBackend for LocalBackend {
    fn initialize(&self, request: EngineRequest) -> Result<Initialized> {
        let EngineRequest {
            mut model,
            optimizer,
            scheduler,
            config,
            local_rank,
            collective,
            partitioner,
        } = request;

        if !collective.is_initialized() {
            return Err(Error::NotInitialized {
                operation: "engine initialize".to_string(),
            });
        }

        let device = Device::Accelerator(local_rank);
        model.set_offloaded(config.offloads_parameters(), device);
        if config.stage().shards_parameters() {
            for param in model.parameters() {
                partitioner.partition(param)?;
            }
        }

        let world_size = collective.world_size();
        let accumulation_steps = (config.train_batch_size
            / config.train_micro_batch_size_per_gpu.max(1)
            / world_size.max(1))
        .max(1) as u64;

        debug!(
            model = model.name(),
            stage = %config.stage(),
            accumulation_steps,
            "Local engine initialized"
        );
        self.configs.lock().push(config.clone());

        let engine = LocalEngine {
            model,
            config,
            collective,
            optimizer: optimizer.clone(),
            scheduler: scheduler.clone(),
            accumulation_steps,
            micro_steps: 0,
            global_steps: 0,
            pending_loss: 0.0,
            last_loss: None,
        };

        Ok(Initialized {
            engine: Box::new(engine),
            optimizer,
            scheduler,
        })
    }
}

/// Engine produced by [`LocalBackend`]
pub struct LocalEngine {
    model: Model,
    config: EngineConfig,
    collective: Arc<dyn Collective>,
    optimizer: Option<Arc<dyn Optimizer>>,
    scheduler: Option<Arc<dyn LrScheduler>>,
    accumulation_steps: u64,
    micro_steps: u64,
    global_steps: u64,
    pending_loss: f32,
    last_loss: Option<f32>,
}

impl LocalEngine {
    fn rank(&self) -> Rank {
        self.collective.rank()
    }

    /// Run the blocking collective barrier on the blocking pool
    async fn barrier(&self) -> Result<()> {
        let collective = Arc::clone(&self.collective);
        tokio::task::spawn_blocking(move || collective.barrier())
            .await
            .map_err(|e| Error::Collective {
                message: format!("barrier task failed: {}", e),
            })?
    }

    fn state_file(&self, dir: &Path, tag: &str) -> PathBuf {
        dir.join(tag)
            .join(format!("mp_rank_{:02}_model_states.ckpt", self.rank()))
    }

    /// Mean loss of the last completed accumulation window
    pub fn last_loss(&self) -> Option<f32> {
        self.last_loss
    }
}

#[async_trait]
impl TrainingEngine for LocalEngine {
    fn module(&self) -> &Model {
        &self.model
    }

    fn module_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn backward(&mut self, loss: &Tensor) -> Result<()> {
        if self.optimizer.is_none() {
            return Err(Error::Engine {
                message: format!("model {} was prepared for evaluation", self.model.name()),
            });
        }
        let value = match loss.data() {
            [value] => *value,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "loss must hold one element, got shape {:?}",
                    loss.shape()
                )))
            }
        };
        if !value.is_finite() {
            return Err(Error::Engine {
                message: format!("non-finite loss {}", value),
            });
        }
        self.pending_loss += value;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        if self.optimizer.is_none() {
            return Err(Error::Engine {
                message: format!("model {} has no optimizer", self.model.name()),
            });
        }
        self.micro_steps += 1;
        if self.micro_steps % self.accumulation_steps != 0 {
            return Ok(());
        }

        self.global_steps += 1;
        self.last_loss = Some(self.pending_loss / self.accumulation_steps as f32);
        self.pending_loss = 0.0;
        if let Some(scheduler) = &self.scheduler {
            scheduler.step();
        }
        debug!(
            model = self.model.name(),
            global_step = self.global_steps,
            loss = ?self.last_loss,
            "Optimizer step"
        );
        Ok(())
    }

    fn global_steps(&self) -> u64 {
        self.global_steps
    }

    #[instrument(skip_all, fields(dir = %dir.display(), tag = ?tag))]
    async fn save_checkpoint(
        &mut self,
        dir: &Path,
        tag: Option<&str>,
        client_state: &ClientState,
        save_latest: bool,
    ) -> Result<()> {
        let tag = tag
            .map(str::to_string)
            .unwrap_or_else(|| format!("global_step{}", self.global_steps));

        // Wait for the primary's retention sweep before writing into the root
        self.barrier().await?;

        let mut metadata = ClientState::new();
        metadata.insert("client_state".to_string(), client_state.clone().into());
        metadata.insert("global_steps".to_string(), json!(self.global_steps));
        metadata.insert("micro_steps".to_string(), json!(self.micro_steps));
        metadata.insert("world_size".to_string(), json!(self.collective.world_size()));
        metadata.insert("stage".to_string(), json!(self.config.stage().as_u8()));
        if let Some(scheduler) = &self.scheduler {
            metadata.insert("scheduler_steps".to_string(), json!(scheduler.steps()));
        }

        let path = self.state_file(dir, &tag);
        write_state_dict(&path, &self.model.resident_state(), &metadata).await?;

        self.barrier().await?;
        if save_latest && self.rank() == 0 {
            write_atomic(&dir.join(LATEST_FILE), tag.as_bytes()).await?;
        }
        info!(tag = %tag, "Engine checkpoint saved");
        Ok(())
    }

    #[instrument(skip_all, fields(dir = %dir.display(), tag = ?tag))]
    async fn load_checkpoint(
        &mut self,
        dir: &Path,
        tag: Option<&str>,
        options: &LoadOptions,
    ) -> Result<Option<LoadedCheckpoint>> {
        let tag = match tag {
            Some(tag) => tag.to_string(),
            None => match tokio::fs::read_to_string(dir.join(LATEST_FILE)).await {
                Ok(tag) => tag.trim().to_string(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("No latest pointer, nothing to load");
                    return Ok(None);
                }
                Err(e) => return Err(Error::Io(e)),
            },
        };

        let path = self.state_file(dir, &tag);
        let file = read_state_dict(&path).await?;

        let saved_world = file.metadata.get("world_size").and_then(|v| v.as_u64());
        if saved_world != Some(self.collective.world_size() as u64) {
            return Err(Error::CheckpointCorrupted {
                path: path.display().to_string(),
                reason: format!(
                    "saved with world size {:?}, loading with {}",
                    saved_world,
                    self.collective.world_size()
                ),
            });
        }

        self.model
            .load_resident_state(&file.state, options.load_module_strict)?;

        if !options.load_module_only {
            if let Some(steps) = file.metadata.get("global_steps").and_then(|v| v.as_u64()) {
                self.global_steps = steps;
            }
            if let Some(steps) = file.metadata.get("micro_steps").and_then(|v| v.as_u64()) {
                self.micro_steps = steps;
            }
            if options.load_lr_scheduler_states {
                let saved = file.metadata.get("scheduler_steps").and_then(|v| v.as_u64());
                if let (Some(scheduler), Some(steps)) = (&self.scheduler, saved) {
                    scheduler.set_steps(steps);
                }
            }
        }

        let client_state = match file.metadata.get("client_state") {
            Some(serde_json::Value::Object(state)) => state.clone(),
            _ => ClientState::new(),
        };
        info!(tag = %tag, global_steps = self.global_steps, "Engine checkpoint loaded");

        Ok(Some(LoadedCheckpoint {
            path: dir.join(&tag),
            client_state,
        }))
    }
}
