//! Training strategy facade
//!
//! One [`TrainingStrategy`] per process. Call
//! [`setup_distributed`](TrainingStrategy::setup_distributed) once, prepare
//! models, then drive backward/step, metric reduction, EMA updates, and
//! checkpoints through it.

use std::path::Path;
use std::sync::Arc;

use checkpoint::{CheckpointManager, KeyRewrite, RetentionPolicy};
use collective::{Collective, ReductionEngine, Value};
use engine::{
    ClientState, EngineBackend, LoadOptions, LoadedCheckpoint, ManagedModel, Model,
    ParameterPartitioner, ShardedPartitioner,
};
use rand_chacha::ChaCha8Rng;
use runtime_core::{
    Device, Error, PartitionStage, ProcessContext, Rank, ReduceOp, Result, SeedSequence,
    StrategyConfig, Tensor,
};
use tracing::{info, instrument};

use crate::ema::{EmaSynchronizer, DEFAULT_EMA_BETA};
use crate::optimizer::{create_optimizer, AdamOptimizer, AdamSettings};
use crate::prepare::{ModelPreparer, PrepareEntry, Prepared};

/// Environment variable consulted when no local rank is configured
pub const LOCAL_RANK_ENV: &str = "LOCAL_RANK";

/// Cadence counter name used by [`TrainingStrategy::moving_average`]
const EMA_COUNTER: &str = "ema";

struct Distributed {
    ctx: ProcessContext,
    reduction: ReductionEngine,
    partitioner: Arc<dyn ParameterPartitioner>,
    preparer: ModelPreparer,
    ema: EmaSynchronizer,
    checkpoints: CheckpointManager,
}

/// Per-process coordinator for distributed training
pub struct TrainingStrategy {
    config: StrategyConfig,
    backend: Arc<dyn EngineBackend>,
    seeds: SeedSequence,
    dist: Option<Distributed>,
}

impl TrainingStrategy {
    pub fn new(config: StrategyConfig, backend: Arc<dyn EngineBackend>) -> Self {
        let seeds = SeedSequence::new(config.seed);
        Self {
            config,
            backend,
            seeds,
            dist: None,
        }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Join the process group and derive per-process settings
    ///
    /// Initializes `collective` with the configured timeout if it is not
    /// initialized yet. The local device index comes from the configuration,
    /// then `LOCAL_RANK`, then the global rank.
    #[instrument(skip_all)]
    pub fn setup_distributed(&mut self, collective: Arc<dyn Collective>) -> Result<()> {
        if !collective.is_initialized() {
            collective.init(self.config.distributed.collective_timeout)?;
        }

        let world_size = collective.world_size();
        self.config.validate(world_size)?;

        let rank = collective.rank();
        let local_rank = match self.config.distributed.local_rank {
            Some(local_rank) => local_rank,
            None => local_rank_from_env()?.unwrap_or(rank),
        };
        let ctx = ProcessContext::new(rank, world_size, local_rank);
        let accumulation_steps = self.config.accumulation_steps(world_size);

        let partitioner: Arc<dyn ParameterPartitioner> =
            Arc::new(ShardedPartitioner::new(Arc::clone(&collective)));
        let preparer = ModelPreparer::new(
            self.config.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&collective),
            Arc::clone(&partitioner),
            local_rank,
        );

        self.dist = Some(Distributed {
            ctx,
            reduction: ReductionEngine::new(collective),
            partitioner,
            preparer,
            ema: EmaSynchronizer::new(accumulation_steps),
            checkpoints: CheckpointManager::new(RetentionPolicy::from(&self.config.retention), ctx),
        });

        ctx.log(format_args!(
            "Distributed setup: world_size={} accumulation_steps={} stage={}",
            world_size, accumulation_steps, self.config.partition_stage
        ));
        Ok(())
    }

    fn dist(&self, operation: &str) -> Result<&Distributed> {
        self.dist.as_ref().ok_or_else(|| Error::NotInitialized {
            operation: operation.to_string(),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.dist.is_some()
    }

    pub fn process_context(&self) -> Result<ProcessContext> {
        Ok(self.dist("process_context")?.ctx)
    }

    /// Micro batches per optimizer step on this process
    pub fn accumulation_steps(&self) -> Result<u64> {
        Ok(self.dist("accumulation_steps")?.ema.accumulation_steps())
    }

    pub fn partitioner(&self) -> Result<Arc<dyn ParameterPartitioner>> {
        Ok(Arc::clone(&self.dist("partitioner")?.partitioner))
    }

    /// Deterministic generator for a named consumer
    pub fn rng(&self, name: &str) -> ChaCha8Rng {
        self.seeds.generator(name)
    }

    /// Adam with decay and no-decay groups, CPU variant when offloading
    pub fn create_optimizer(&self, model: &Model, settings: AdamSettings) -> AdamOptimizer {
        create_optimizer(model, settings, self.config.adam_offload)
    }

    /// Wrap models with the engine; see [`ModelPreparer::prepare`]
    pub fn prepare(&self, entries: Vec<PrepareEntry>, is_rlhf: bool) -> Result<Prepared> {
        self.dist("prepare")?.preparer.prepare(entries, is_rlhf)
    }

    pub fn backward(&self, loss: &Tensor, model: &mut ManagedModel) -> Result<()> {
        model.engine_mut()?.backward(loss)
    }

    pub fn optimizer_step(&self, model: &mut ManagedModel) -> Result<()> {
        model.engine_mut()?.step()
    }

    /// Blend `live` into `shadow` once per optimizer step
    ///
    /// Gathers parameter pairs when the strategy runs fully partitioned.
    /// Returns whether a blend ran.
    pub fn moving_average(
        &self,
        live: &ManagedModel,
        shadow: &ManagedModel,
        beta: f32,
        device: Device,
    ) -> Result<bool> {
        let dist = self.dist("moving_average")?;
        let partitioner = if self.config.partition_stage == PartitionStage::FullPartition {
            Some(dist.partitioner.as_ref())
        } else {
            None
        };
        dist.ema.update(
            EMA_COUNTER,
            live.unwrap_model(),
            shadow.unwrap_model(),
            beta,
            device,
            partitioner,
        )
    }

    /// [`moving_average`](Self::moving_average) with the default decay on the host
    pub fn moving_average_default(&self, live: &ManagedModel, shadow: &ManagedModel) -> Result<bool> {
        self.moving_average(live, shadow, DEFAULT_EMA_BETA, Device::Cpu)
    }

    pub fn all_reduce(&self, data: Value, op: ReduceOp) -> Result<Value> {
        self.dist("all_reduce")?.reduction.reduce(data, op)
    }

    /// Gather every leaf across ranks
    ///
    /// Scalar leaves become tensors of `world_size` elements, so a single
    /// process gets `Scalar(x)` back as a one-element tensor.
    pub fn all_gather(&self, data: Value) -> Result<Value> {
        self.dist("all_gather")?.reduction.gather(data)
    }

    /// Log on the primary process only
    pub fn print(&self, message: impl std::fmt::Display) {
        match &self.dist {
            Some(dist) => dist.ctx.log(message),
            None => info!("{}", message),
        }
    }

    /// Returns true on rank 0; a process outside any group counts as rank 0
    pub fn is_rank_0(&self) -> bool {
        self.dist.as_ref().map_or(true, |d| d.ctx.is_primary())
    }

    pub fn get_rank(&self) -> Rank {
        self.dist.as_ref().map_or(0, |d| d.ctx.rank())
    }

    pub async fn save_ckpt(
        &self,
        model: &mut ManagedModel,
        save_dir: &Path,
        tag: &str,
        client_state: &ClientState,
        save_latest: bool,
    ) -> Result<()> {
        self.dist("save_ckpt")?
            .checkpoints
            .save_full(model, save_dir, tag, client_state, save_latest)
            .await
    }

    pub async fn load_ckpt(
        &self,
        model: &mut ManagedModel,
        load_dir: &Path,
        tag: Option<&str>,
        options: &LoadOptions,
    ) -> Result<Option<LoadedCheckpoint>> {
        self.dist("load_ckpt")?
            .checkpoints
            .load(model, load_dir, tag, options)
            .await
    }

    /// Weights-only export of the merged model
    pub async fn save_model(&self, model: &ManagedModel, path: &Path) -> Result<()> {
        let dist = self.dist("save_model")?;
        dist.checkpoints
            .save_weights_only(model, path, dist.partitioner.as_ref())
            .await
    }

    pub async fn load_model(
        &self,
        model: &mut ManagedModel,
        path: &Path,
        strict: bool,
        key_rewrite: Option<KeyRewrite<'_>>,
    ) -> Result<()> {
        self.dist("load_model")?
            .checkpoints
            .load_weights(model, path, strict, key_rewrite)
            .await
    }

    /// Weights-only export plus `config.json`
    pub async fn save_pretrained(
        &self,
        model: &ManagedModel,
        output_dir: &Path,
        model_config: &serde_json::Value,
    ) -> Result<()> {
        let dist = self.dist("save_pretrained")?;
        dist.checkpoints
            .save_pretrained(model, output_dir, model_config, dist.partitioner.as_ref())
            .await
    }
}

fn local_rank_from_env() -> Result<Option<usize>> {
    match std::env::var(LOCAL_RANK_ENV) {
        Ok(value) => value.trim().parse().map(Some).map_err(|_| Error::InvalidConfig {
            message: format!("{}={} is not a valid local rank", LOCAL_RANK_ENV, value),
        }),
        Err(_) => Ok(None),
    }
}
