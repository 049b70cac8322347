//! Parameter handles and their residency

use std::sync::Arc;

use parking_lot::RwLock;
use runtime_core::{Device, Error, Rank, Result, Tensor};

/// Shared handle to a parameter
pub type ParameterHandle = Arc<Parameter>;

/// How a sharded parameter is split across ranks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    /// Logical shape of the whole parameter
    pub full_shape: Vec<usize>,

    /// Elements in the whole parameter
    pub numel: usize,

    /// Elements per shard (the last shard is zero-padded)
    pub shard_len: usize,

    /// Rank owning the resident shard
    pub rank: Rank,
}

impl ShardLayout {
    pub fn new(full_shape: Vec<usize>, world_size: usize, rank: Rank) -> Self {
        let numel: usize = full_shape.iter().product();
        let shard_len = numel.div_ceil(world_size.max(1));
        Self {
            full_shape,
            numel,
            shard_len,
            rank,
        }
    }

    /// Slice this rank's shard out of full row-major data
    pub fn shard_of(&self, full: &[f32]) -> Vec<f32> {
        let start = (self.rank * self.shard_len).min(full.len());
        let end = (start + self.shard_len).min(full.len());
        let mut shard = full[start..end].to_vec();
        shard.resize(self.shard_len, 0.0);
        shard
    }
}

/// Where a parameter's data currently lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Residency {
    /// Whole tensor resident and never sharded
    Replicated,

    /// Only this rank's shard is resident
    Partitioned(ShardLayout),

    /// Sharded parameter temporarily materialized in full
    Gathered(ShardLayout),
}

impl Residency {
    pub fn is_materialized(&self) -> bool {
        !matches!(self, Residency::Partitioned(_))
    }
}

#[derive(Debug)]
struct ParamState {
    data: Tensor,
    residency: Residency,
}

/// A named model parameter with interior mutability
///
/// Full data is readable only while the parameter is materialized; a
/// partitioned parameter exposes just its resident shard.
#[derive(Debug)]
pub struct Parameter {
    name: String,
    requires_grad: bool,
    state: RwLock<ParamState>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, data: Tensor, requires_grad: bool) -> ParameterHandle {
        Arc::new(Self {
            name: name.into(),
            requires_grad,
            state: RwLock::new(ParamState {
                data,
                residency: Residency::Replicated,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn residency(&self) -> Residency {
        self.state.read().residency.clone()
    }

    pub fn is_materialized(&self) -> bool {
        self.state.read().residency.is_materialized()
    }

    /// Logical shape, whether or not the data is resident
    pub fn shape(&self) -> Vec<usize> {
        let state = self.state.read();
        match &state.residency {
            Residency::Replicated => state.data.shape().to_vec(),
            Residency::Partitioned(layout) | Residency::Gathered(layout) => {
                layout.full_shape.clone()
            }
        }
    }

    pub fn device(&self) -> Device {
        self.state.read().data.device()
    }

    /// Copy of the full data
    ///
    /// # Errors
    /// Returns [`Error::ParameterNotMaterialized`] while only a shard is resident
    pub fn data(&self) -> Result<Tensor> {
        let state = self.state.read();
        self.check_materialized(&state)?;
        Ok(state.data.clone())
    }

    /// Replace the full data, keeping the current device
    pub fn set_data(&self, data: Tensor) -> Result<()> {
        self.update(|current| {
            if current.shape() != data.shape() {
                return Err(Error::ShapeMismatch {
                    name: self.name.clone(),
                    expected: current.shape().to_vec(),
                    actual: data.shape().to_vec(),
                });
            }
            *current = data.into_device(current.device());
            Ok(())
        })
    }

    /// Mutate the full data in place
    pub fn update<T>(&self, f: impl FnOnce(&mut Tensor) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        self.check_materialized(&state)?;
        f(&mut state.data)
    }

    /// Resident buffer: the shard when partitioned, the whole tensor otherwise
    pub fn local_data(&self) -> Tensor {
        self.state.read().data.clone()
    }

    /// Replace the resident buffer, e.g. a shard read back from disk
    pub fn set_local_data(&self, data: Tensor) -> Result<()> {
        let mut state = self.state.write();
        if state.data.numel() != data.numel() {
            return Err(Error::ShapeMismatch {
                name: self.name.clone(),
                expected: state.data.shape().to_vec(),
                actual: data.shape().to_vec(),
            });
        }
        let device = state.data.device();
        state.data = data.reshape(state.data.shape().to_vec())?.into_device(device);
        Ok(())
    }

    /// Move the resident buffer to `device`
    pub fn move_to(&self, device: Device) {
        let mut state = self.state.write();
        let data = std::mem::replace(&mut state.data, Tensor::zeros(&[0]));
        state.data = data.into_device(device);
    }

    /// Swap the resident buffer and residency together; used by partitioners
    pub fn set_resident(&self, data: Tensor, residency: Residency) {
        let mut state = self.state.write();
        state.data = data;
        state.residency = residency;
    }

    fn check_materialized(&self, state: &ParamState) -> Result<()> {
        if !state.residency.is_materialized() {
            return Err(Error::ParameterNotMaterialized {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}
