//! Exponential moving average of model parameters

use std::sync::Arc;

use dashmap::DashMap;
use engine::{params_to_fetch, with_gathered, Model, ParameterHandle, ParameterPartitioner};
use runtime_core::{Device, Error, Result};
use tracing::debug;

/// Default decay for the shadow model
pub const DEFAULT_EMA_BETA: f32 = 0.992;

/// Blends live parameters into shadow models once per optimizer step
///
/// Cadence counters are kept per logical name, so one synchronizer can serve
/// several live/shadow pairs.
#[derive(Debug)]
pub struct EmaSynchronizer {
    accumulation_steps: u64,
    counters: DashMap<String, u64>,
}

impl EmaSynchronizer {
    pub fn new(accumulation_steps: u64) -> Self {
        Self {
            accumulation_steps: accumulation_steps.max(1),
            counters: DashMap::new(),
        }
    }

    pub fn accumulation_steps(&self) -> u64 {
        self.accumulation_steps
    }

    /// Calls recorded under `name`
    pub fn calls(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| *c).unwrap_or(0)
    }

    /// Count one micro step under `name` and blend on accumulation boundaries
    ///
    /// `shadow <- beta * shadow + (1 - beta) * live` for every trainable
    /// parameter pair, with live data moved to `device` first. Pass a
    /// partitioner when parameters may be sharded; each pair is then gathered
    /// for the duration of its update. Returns whether a blend ran.
    pub fn update(
        &self,
        name: &str,
        live: &Model,
        shadow: &Model,
        beta: f32,
        device: Device,
        partitioner: Option<&dyn ParameterPartitioner>,
    ) -> Result<bool> {
        let step = {
            let mut counter = self.counters.entry(name.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        if step % self.accumulation_steps != 0 {
            return Ok(false);
        }

        let live_params = live.named_parameters();
        let shadow_params = shadow.named_parameters();
        if live_params.len() != shadow_params.len() {
            return Err(Error::invalid_argument(format!(
                "live model {} has {} parameters, shadow {} has {}",
                live.name(),
                live_params.len(),
                shadow.name(),
                shadow_params.len()
            )));
        }

        let mut blended = 0usize;
        for ((live_name, live_param), (shadow_name, shadow_param)) in
            live_params.iter().zip(shadow_params)
        {
            if !live_param.requires_grad() {
                continue;
            }
            if live_name != shadow_name {
                return Err(Error::invalid_argument(format!(
                    "parameter order differs: {} vs {}",
                    live_name, shadow_name
                )));
            }

            match partitioner {
                Some(partitioner) => {
                    let pair = [Arc::clone(live_param), Arc::clone(shadow_param)];
                    let fetch = params_to_fetch(&pair);
                    let enabled = !fetch.is_empty();
                    let _gathered = with_gathered(partitioner, fetch, enabled)?;
                    blend(live_param, shadow_param, beta, device)?;
                }
                None => blend(live_param, shadow_param, beta, device)?,
            }
            blended += 1;
        }

        debug!(name, step, blended, beta, "EMA update");
        Ok(true)
    }
}

fn blend(live: &ParameterHandle, shadow: &ParameterHandle, beta: f32, device: Device) -> Result<()> {
    let live_data = live.data()?.into_device(device);
    shadow.update(|shadow_data| shadow_data.lerp_toward_(&live_data, beta))
}
