//! Strategy configuration types

use crate::{Error, PartitionStage, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Seed fanned out to every random generator
    pub seed: u64,

    /// Gradient clipping threshold (0 disables clipping)
    pub max_grad_norm: f32,

    /// Per-process micro batch size
    pub micro_train_batch_size: usize,

    /// Aggregate batch size across the group and accumulation steps
    pub train_batch_size: usize,

    /// Partitioning stage handed to the engine
    pub partition_stage: PartitionStage,

    /// Generation length budget for the hybrid inference engine
    pub max_generation_tokens: usize,

    /// Tensor-parallel degree for hybrid inference
    pub inference_tensor_parallel_size: usize,

    /// Train in bfloat16
    pub use_bf16: bool,

    /// Keep optimizer state in host memory
    pub adam_offload: bool,

    /// Hierarchical partition group size (zpg)
    pub partition_group_size: usize,

    /// A pretraining corpus is mixed into RL updates
    pub uses_pretrain_corpus: bool,

    /// Checkpoint retention settings
    pub retention: RetentionConfig,

    /// Process-group settings
    pub distributed: DistributedConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            max_grad_norm: 0.0,
            micro_train_batch_size: 1,
            train_batch_size: 1,
            partition_stage: PartitionStage::OptimizerAndGradientPartition,
            max_generation_tokens: 512,
            inference_tensor_parallel_size: 1,
            use_bf16: true,
            adam_offload: false,
            partition_group_size: 1,
            uses_pretrain_corpus: false,
            retention: RetentionConfig::default(),
            distributed: DistributedConfig::default(),
        }
    }
}

impl StrategyConfig {
    /// Parse from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to pretty JSON
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check batch sizes and retention limits against a world size
    pub fn validate(&self, world_size: usize) -> Result<()> {
        if self.micro_train_batch_size == 0 || self.train_batch_size == 0 {
            return Err(Error::InvalidConfig {
                message: "batch sizes must be positive".to_string(),
            });
        }
        if world_size == 0 {
            return Err(Error::InvalidConfig {
                message: "world size must be positive".to_string(),
            });
        }
        if self.accumulation_steps(world_size) == 0 {
            return Err(Error::InvalidConfig {
                message: format!(
                    "train_batch_size {} is smaller than micro_train_batch_size {} x world size {}",
                    self.train_batch_size, self.micro_train_batch_size, world_size
                ),
            });
        }
        if self.retention.max_checkpoints == 0 {
            return Err(Error::InvalidConfig {
                message: "retention.max_checkpoints must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Micro batches per optimizer step on each process
    pub fn accumulation_steps(&self, world_size: usize) -> u64 {
        if self.micro_train_batch_size == 0 || world_size == 0 {
            return 0;
        }
        (self.train_batch_size / self.micro_train_batch_size / world_size) as u64
    }
}

/// Checkpoint retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Maximum number of checkpoint directories kept under a save root
    pub max_checkpoints: usize,

    /// Maximum cumulative size of the save root in GiB
    pub max_disk_gb: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_checkpoints: 3,
            max_disk_gb: 1000,
        }
    }
}

impl RetentionConfig {
    /// Size budget in bytes
    pub fn max_disk_bytes(&self) -> u64 {
        self.max_disk_gb.saturating_mul(1024 * 1024 * 1024)
    }
}

/// Process-group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Timeout applied by the transport to every collective call
    #[serde(with = "humantime_serde")]
    pub collective_timeout: Duration,

    /// Local device index; falls back to `LOCAL_RANK` when unset
    pub local_rank: Option<usize>,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            collective_timeout: Duration::from_secs(30 * 60),
            local_rank: None,
        }
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StrategyConfig::default();
        assert_eq!(config.seed, 42);
        assert_eq!(
            config.partition_stage,
            PartitionStage::OptimizerAndGradientPartition
        );
        assert_eq!(config.retention.max_checkpoints, 3);
        assert_eq!(config.retention.max_disk_bytes(), 1000 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_config_serialization() {
        let config = StrategyConfig {
            partition_stage: PartitionStage::FullPartition,
            ..Default::default()
        };
        let json = config.to_json_string().unwrap();
        assert!(json.contains("\"partition_stage\": 3"));
        let parsed = StrategyConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed.partition_stage, PartitionStage::FullPartition);
        assert_eq!(
            parsed.distributed.collective_timeout,
            config.distributed.collective_timeout
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed =
            StrategyConfig::from_json_str(r#"{"train_batch_size": 128, "adam_offload": true}"#)
                .unwrap();
        assert_eq!(parsed.train_batch_size, 128);
        assert!(parsed.adam_offload);
        assert_eq!(parsed.micro_train_batch_size, 1);
    }

    #[test]
    fn test_accumulation_steps() {
        let config = StrategyConfig {
            micro_train_batch_size: 4,
            train_batch_size: 64,
            ..Default::default()
        };
        assert_eq!(config.accumulation_steps(4), 4);
        assert!(config.validate(4).is_ok());
        assert!(matches!(
            config.validate(32),
            Err(Error::InvalidConfig { .. })
        ));
    }
}
