//! Models as ordered collections of parameters, buffers, and adapters

use std::collections::BTreeSet;
use std::sync::Arc;

use runtime_core::{Device, Error, ModelRole, Result, StateDict, Tensor};
use tracing::warn;

use crate::parameter::{Parameter, ParameterHandle};

/// Low-rank delta on a base weight: `W + scaling * up @ down`
#[derive(Debug, Clone)]
pub struct LowRankAdapter {
    /// Name of the adapted base parameter
    pub target: String,

    /// `rank x in_features`
    pub down: ParameterHandle,

    /// `out_features x rank`
    pub up: ParameterHandle,

    pub scaling: f32,
}

impl LowRankAdapter {
    /// Dense delta; both factors must be materialized
    pub fn delta(&self) -> Result<Tensor> {
        let mut delta = self.up.data()?.matmul(&self.down.data()?)?;
        delta.scale_(self.scaling);
        Ok(delta)
    }

    pub fn parameters(&self) -> [ParameterHandle; 2] {
        [Arc::clone(&self.down), Arc::clone(&self.up)]
    }
}

/// A model the strategy can prepare, average, and persist
///
/// Parameter order is fixed at construction and identical on every rank.
#[derive(Debug, Clone)]
pub struct Model {
    name: String,
    role: ModelRole,
    parameters: Vec<(String, ParameterHandle)>,
    buffers: Vec<(String, Tensor)>,
    adapters: Vec<LowRankAdapter>,
    offloaded: bool,
}

impl Model {
    pub fn new(name: impl Into<String>, role: ModelRole) -> Self {
        Self {
            name: name.into(),
            role,
            parameters: Vec::new(),
            buffers: Vec::new(),
            adapters: Vec::new(),
            offloaded: false,
        }
    }

    /// Append a parameter
    pub fn with_parameter(mut self, name: impl Into<String>, data: Tensor, requires_grad: bool) -> Self {
        let name = name.into();
        let param = Parameter::new(name.clone(), data, requires_grad);
        self.parameters.push((name, param));
        self
    }

    /// Append a persistent non-trainable tensor
    pub fn with_buffer(mut self, name: impl Into<String>, data: Tensor) -> Self {
        self.buffers.push((name.into(), data));
        self
    }

    /// Attach a low-rank adapter to an existing 2-D parameter
    ///
    /// The factors are registered as trainable parameters named
    /// `{target}.lora_down` and `{target}.lora_up`.
    pub fn with_adapter(mut self, target: &str, down: Tensor, up: Tensor, scaling: f32) -> Result<Self> {
        let base_shape = self
            .parameter(target)
            .ok_or_else(|| Error::invalid_argument(format!("no parameter named {}", target)))?
            .shape();

        match (base_shape.as_slice(), down.shape(), up.shape()) {
            ([out, inp], [r1, inp2], [out2, r2]) if inp == inp2 && out == out2 && r1 == r2 => {}
            _ => {
                return Err(Error::ShapeMismatch {
                    name: format!("{} adapter", target),
                    expected: base_shape,
                    actual: down.shape().to_vec(),
                })
            }
        }

        let down_name = format!("{}.lora_down", target);
        let up_name = format!("{}.lora_up", target);
        let down = Parameter::new(down_name.clone(), down, true);
        let up = Parameter::new(up_name.clone(), up, true);
        self.parameters.push((down_name, Arc::clone(&down)));
        self.parameters.push((up_name, Arc::clone(&up)));
        self.adapters.push(LowRankAdapter {
            target: target.to_string(),
            down,
            up,
            scaling,
        });
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ModelRole {
        self.role
    }

    pub fn is_shadow(&self) -> bool {
        self.role == ModelRole::Shadow
    }

    pub fn is_offloaded(&self) -> bool {
        self.offloaded
    }

    /// Move every parameter and buffer to host memory, or back to `device`
    pub fn set_offloaded(&mut self, offloaded: bool, device: Device) {
        let target = if offloaded { Device::Cpu } else { device };
        for (_, param) in &self.parameters {
            param.move_to(target);
        }
        for (_, buffer) in &mut self.buffers {
            *buffer = buffer.to(target);
        }
        self.offloaded = offloaded;
    }

    pub fn named_parameters(&self) -> &[(String, ParameterHandle)] {
        &self.parameters
    }

    pub fn parameters(&self) -> impl Iterator<Item = &ParameterHandle> {
        self.parameters.iter().map(|(_, p)| p)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterHandle> {
        self.parameters.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn named_buffers(&self) -> &[(String, Tensor)] {
        &self.buffers
    }

    pub fn adapters(&self) -> &[LowRankAdapter] {
        &self.adapters
    }

    /// Returns true if adapters can be merged into base weights
    pub fn is_adapted(&self) -> bool {
        !self.adapters.is_empty()
    }

    /// Base parameters, excluding adapter factors
    pub fn base_parameters(&self) -> impl Iterator<Item = &(String, ParameterHandle)> {
        let factors: BTreeSet<&str> = self
            .adapters
            .iter()
            .flat_map(|a| [a.down.name(), a.up.name()])
            .collect();
        self.parameters
            .iter()
            .filter(move |(name, _)| !factors.contains(name.as_str()))
    }

    /// Adapters attached to `target`
    pub fn adapters_for<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a LowRankAdapter> {
        self.adapters.iter().filter(move |a| a.target == target)
    }

    /// Full data of `param` with every adapter on it folded in
    ///
    /// The parameter and its adapter factors must be materialized.
    pub fn merged_data(&self, name: &str, param: &Parameter) -> Result<Tensor> {
        let mut data = param.data()?;
        for adapter in self.adapters_for(name) {
            let delta = adapter.delta()?.into_device(data.device());
            data.add_scaled_(&delta, 1.0)?;
        }
        Ok(data)
    }

    /// Every parameter and buffer by name
    ///
    /// # Errors
    /// Fails if any parameter is only resident as a shard
    pub fn state_dict(&self) -> Result<StateDict> {
        let mut state = StateDict::new();
        for (name, param) in &self.parameters {
            state.insert(name.clone(), param.data()?);
        }
        for (name, buffer) in &self.buffers {
            state.insert(name.clone(), buffer.clone());
        }
        Ok(state)
    }

    /// Copy matching entries from `state` into this model
    ///
    /// Strict loading fails on missing or unexpected keys; non-strict loading
    /// logs them and loads the rest. Shape mismatches always fail.
    pub fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<()> {
        let known: BTreeSet<&str> = self
            .parameters
            .iter()
            .map(|(n, _)| n.as_str())
            .chain(self.buffers.iter().map(|(n, _)| n.as_str()))
            .collect();
        let missing: Vec<String> = known
            .iter()
            .filter(|n| !state.contains_key(**n))
            .map(|n| n.to_string())
            .collect();
        let unexpected: Vec<String> = state
            .keys()
            .filter(|k| !known.contains(k.as_str()))
            .cloned()
            .collect();

        if strict && (!missing.is_empty() || !unexpected.is_empty()) {
            return Err(Error::StateDictMismatch {
                missing,
                unexpected,
            });
        }
        if !missing.is_empty() || !unexpected.is_empty() {
            warn!(
                model = %self.name,
                missing = ?missing,
                unexpected = ?unexpected,
                "Loading state dict non-strictly"
            );
        }

        for (name, param) in &self.parameters {
            if let Some(tensor) = state.get(name) {
                param.set_data(tensor.clone())?;
            }
        }
        for (name, buffer) in &mut self.buffers {
            if let Some(tensor) = state.get(name) {
                if tensor.shape() != buffer.shape() {
                    return Err(Error::ShapeMismatch {
                        name: name.clone(),
                        expected: buffer.shape().to_vec(),
                        actual: tensor.shape().to_vec(),
                    });
                }
                *buffer = tensor.to(buffer.device());
            }
        }
        Ok(())
    }

    /// Resident buffers of every parameter (shards when partitioned) and buffers
    pub fn resident_state(&self) -> StateDict {
        let mut state = StateDict::new();
        for (name, param) in &self.parameters {
            state.insert(name.clone(), param.local_data());
        }
        for (name, buffer) in &self.buffers {
            state.insert(name.clone(), buffer.clone());
        }
        state
    }

    /// Inverse of [`resident_state`](Self::resident_state) for the same layout
    pub fn load_resident_state(&mut self, state: &StateDict, strict: bool) -> Result<()> {
        for (name, param) in &self.parameters {
            match state.get(name) {
                Some(tensor) => param.set_local_data(tensor.clone())?,
                None if strict => {
                    return Err(Error::StateDictMismatch {
                        missing: vec![name.clone()],
                        unexpected: Vec::new(),
                    })
                }
                None => warn!(model = %self.name, param = %name, "Parameter missing from checkpoint"),
            }
        }
        for (name, buffer) in &mut self.buffers {
            if let Some(tensor) = state.get(name) {
                *buffer = tensor.to(buffer.device());
            }
        }
        Ok(())
    }

    /// Independent copy with fresh parameter handles, e.g. an EMA shadow
    pub fn deep_copy(&self, name: impl Into<String>, role: ModelRole) -> Result<Model> {
        let mut copy = Model::new(name, role);
        for (param_name, param) in &self.parameters {
            copy = copy.with_parameter(param_name.clone(), param.data()?, param.requires_grad());
        }
        for (buffer_name, buffer) in &self.buffers {
            copy = copy.with_buffer(buffer_name.clone(), buffer.clone());
        }
        for adapter in &self.adapters {
            let down = copy.parameter(adapter.down.name()).cloned();
            let up = copy.parameter(adapter.up.name()).cloned();
            if let (Some(down), Some(up)) = (down, up) {
                copy.adapters.push(LowRankAdapter {
                    target: adapter.target.clone(),
                    down,
                    up,
                    scaling: adapter.scaling,
                });
            }
        }
        copy.offloaded = self.offloaded;
        Ok(copy)
    }
}
