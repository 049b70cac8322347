//! Engine configuration handed to `EngineBackend::initialize`

use runtime_core::{PartitionStage, Result, StrategyConfig};
use serde::{Deserialize, Serialize};

/// Steps between engine progress reports
pub const STEPS_PER_PRINT: u64 = 100;

/// Tensor-parallel gather partition size used while training
pub const TRAIN_TP_GATHER_PARTITION_SIZE: usize = 4;

/// Where offloaded state lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffloadDevice {
    None,
    Cpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffloadConfig {
    pub device: OffloadDevice,
    pub pin_memory: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZeroOptimization {
    pub stage: PartitionStage,
    pub offload_param: OffloadConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub offload_optimizer: Option<OffloadConfig>,

    /// Hierarchical partition group size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zero_hpz_partition_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bf16Config {
    pub enabled: bool,
}

/// Inference engine sharing the training weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridEngineConfig {
    pub enabled: bool,
    pub max_out_tokens: usize,
    pub inference_tp_size: usize,
    pub tp_gather_partition_size: usize,
    pub pin_parameters: bool,
}

/// Full engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub steps_per_print: u64,
    pub zero_optimization: ZeroOptimization,
    pub bf16: Bf16Config,
    pub gradient_clipping: f32,
    pub prescale_gradients: bool,
    pub wall_clock_breakdown: bool,
    pub hybrid_engine: HybridEngineConfig,
    pub train_micro_batch_size_per_gpu: usize,
    pub train_batch_size: usize,
}

/// Per-entry inputs for a training configuration
#[derive(Debug, Clone, Copy)]
pub struct TrainOptions {
    /// Entry is the primary trainable model
    pub is_primary: bool,

    /// Reinforcement-learning mode
    pub is_rlhf: bool,
}

/// Per-entry inputs for an evaluation configuration
#[derive(Debug, Clone, Copy)]
pub struct EvalOptions {
    /// Entry is the primary model
    pub is_primary: bool,

    /// Entry is an EMA shadow
    pub is_shadow: bool,
}

impl EngineConfig {
    /// Configuration for a (model, optimizer, scheduler) training entry
    ///
    /// The aggregate batch size doubles when a primary model in RL mode also
    /// trains on a pretraining corpus, since it sees two backward passes per
    /// step.
    pub fn train(config: &StrategyConfig, options: TrainOptions) -> Self {
        let stage = config.partition_stage;
        let hybrid = options.is_primary
            && config.inference_tensor_parallel_size > 1
            && stage == PartitionStage::FullPartition;

        let mut train_batch_size = config.train_batch_size;
        if options.is_rlhf && options.is_primary && config.uses_pretrain_corpus {
            train_batch_size *= 2;
        }

        Self {
            steps_per_print: STEPS_PER_PRINT,
            zero_optimization: ZeroOptimization {
                stage,
                offload_param: OffloadConfig {
                    device: OffloadDevice::None,
                    pin_memory: true,
                },
                offload_optimizer: Some(OffloadConfig {
                    device: if config.adam_offload {
                        OffloadDevice::Cpu
                    } else {
                        OffloadDevice::None
                    },
                    pin_memory: true,
                }),
                zero_hpz_partition_size: Some(config.partition_group_size),
            },
            bf16: Bf16Config {
                enabled: config.use_bf16,
            },
            gradient_clipping: config.max_grad_norm,
            prescale_gradients: false,
            wall_clock_breakdown: false,
            hybrid_engine: HybridEngineConfig {
                enabled: hybrid,
                max_out_tokens: config.max_generation_tokens,
                inference_tp_size: config.inference_tensor_parallel_size,
                tp_gather_partition_size: TRAIN_TP_GATHER_PARTITION_SIZE,
                pin_parameters: true,
            },
            train_micro_batch_size_per_gpu: config.micro_train_batch_size,
            train_batch_size,
        }
    }

    /// Configuration for an evaluation-only model
    ///
    /// Anything below full partitioning keeps no gradient state, so it runs
    /// unpartitioned. Shadow models always run unpartitioned on the host. The
    /// hybrid engine follows the same rule as training, checked against the
    /// final stage.
    pub fn eval(config: &StrategyConfig, options: EvalOptions) -> Self {
        let mut stage = if config.partition_stage == PartitionStage::FullPartition {
            PartitionStage::FullPartition
        } else {
            PartitionStage::NoPartition
        };
        let mut offload = OffloadDevice::None;
        if options.is_shadow {
            stage = PartitionStage::NoPartition;
            offload = OffloadDevice::Cpu;
        }
        let hybrid = options.is_primary
            && config.inference_tensor_parallel_size > 1
            && stage == PartitionStage::FullPartition;

        Self {
            steps_per_print: STEPS_PER_PRINT,
            zero_optimization: ZeroOptimization {
                stage,
                offload_param: OffloadConfig {
                    device: offload,
                    pin_memory: true,
                },
                offload_optimizer: None,
                zero_hpz_partition_size: None,
            },
            bf16: Bf16Config {
                enabled: config.use_bf16,
            },
            gradient_clipping: 1.0,
            prescale_gradients: false,
            wall_clock_breakdown: false,
            hybrid_engine: HybridEngineConfig {
                enabled: hybrid,
                max_out_tokens: config.max_generation_tokens,
                inference_tp_size: config.inference_tensor_parallel_size,
                tp_gather_partition_size: config.inference_tensor_parallel_size,
                pin_parameters: true,
            },
            train_micro_batch_size_per_gpu: config.micro_train_batch_size,
            train_batch_size: config.train_batch_size,
        }
    }

    pub fn stage(&self) -> PartitionStage {
        self.zero_optimization.stage
    }

    /// Returns true if parameters are offloaded to host memory
    pub fn offloads_parameters(&self) -> bool {
        self.zero_optimization.offload_param.device == OffloadDevice::Cpu
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
