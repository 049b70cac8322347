//! Optimizer construction and learning-rate schedules

use std::sync::atomic::{AtomicU64, Ordering};

use engine::{LrScheduler, Model, Optimizer};
use serde::{Deserialize, Serialize};

/// Name fragments of parameters trained without weight decay
pub const NO_DECAY_NAMES: [&str; 5] = [
    "bias",
    "layer_norm.weight",
    "layernorm.weight",
    "norm.weight",
    "ln_f.weight",
];

/// Adam implementation the engine should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdamKind {
    /// Host-memory Adam for offloaded optimizer state
    CpuAdam,

    /// Fused accelerator Adam
    FusedAdam,
}

/// Parameters sharing one weight-decay setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub names: Vec<String>,
    pub weight_decay: f32,
}

/// Hyperparameters for [`create_optimizer`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamSettings {
    pub lr: f32,
    pub betas: (f32, f32),
    pub weight_decay: f32,
}

impl Default for AdamSettings {
    fn default() -> Self {
        Self {
            lr: 1e-6,
            betas: (0.9, 0.95),
            weight_decay: 0.0,
        }
    }
}

/// Adam optimizer description handed to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamOptimizer {
    pub kind: AdamKind,
    pub settings: AdamSettings,
    pub groups: Vec<ParamGroup>,
}

impl AdamOptimizer {
    /// Group holding parameters that receive weight decay
    pub fn decay_group(&self) -> Option<&ParamGroup> {
        self.groups.first()
    }

    pub fn no_decay_group(&self) -> Option<&ParamGroup> {
        self.groups.get(1)
    }
}

impl Optimizer for AdamOptimizer {
    fn name(&self) -> &str {
        match self.kind {
            AdamKind::CpuAdam => "cpu_adam",
            AdamKind::FusedAdam => "fused_adam",
        }
    }

    fn learning_rate(&self) -> f32 {
        self.settings.lr
    }

    fn num_parameters(&self) -> usize {
        self.groups.iter().map(|g| g.names.len()).sum()
    }
}

fn is_no_decay(name: &str) -> bool {
    NO_DECAY_NAMES.iter().any(|fragment| name.contains(fragment))
}

/// Split the trainable parameters of `model` into decay and no-decay groups
///
/// Biases and norm weights get no weight decay. Frozen parameters are left
/// out.
pub fn create_optimizer(model: &Model, settings: AdamSettings, adam_offload: bool) -> AdamOptimizer {
    let mut decay = Vec::new();
    let mut no_decay = Vec::new();
    for (name, param) in model.named_parameters() {
        if !param.requires_grad() {
            continue;
        }
        if is_no_decay(name) {
            no_decay.push(name.clone());
        } else {
            decay.push(name.clone());
        }
    }

    AdamOptimizer {
        kind: if adam_offload {
            AdamKind::CpuAdam
        } else {
            AdamKind::FusedAdam
        },
        settings,
        groups: vec![
            ParamGroup {
                names: decay,
                weight_decay: settings.weight_decay,
            },
            ParamGroup {
                names: no_decay,
                weight_decay: 0.0,
            },
        ],
    }
}

/// Linear warmup to a constant learning rate
#[derive(Debug)]
pub struct WarmupSchedule {
    base_lr: f32,
    warmup_steps: u64,
    steps: AtomicU64,
}

impl WarmupSchedule {
    pub fn new(base_lr: f32, warmup_steps: u64) -> Self {
        Self {
            base_lr,
            warmup_steps,
            steps: AtomicU64::new(0),
        }
    }
}

impl LrScheduler for WarmupSchedule {
    fn step(&self) {
        self.steps.fetch_add(1, Ordering::Relaxed);
    }

    fn last_lr(&self) -> f32 {
        let steps = self.steps.load(Ordering::Relaxed);
        if self.warmup_steps == 0 || steps >= self.warmup_steps {
            return self.base_lr;
        }
        self.base_lr * steps as f32 / self.warmup_steps as f32
    }

    fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    fn set_steps(&self, steps: u64) {
        self.steps.store(steps, Ordering::Relaxed);
    }
}
