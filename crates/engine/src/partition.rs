//! Partition-aware parameter access
//!
//! Under full partitioning each rank holds one shard of every parameter.
//! [`with_gathered`] materializes full tensors for the lifetime of a guard and
//! returns them to sharded residency when the guard drops, on every exit path.

use std::sync::Arc;

use collective::Collective;
use runtime_core::{Result, Tensor};
use tracing::{debug, warn};

use crate::parameter::{ParameterHandle, Residency, ShardLayout};

/// Materializes and releases parameter shards
///
/// `materialize` is a collective call: every rank must pass the same
/// parameters in the same order. `release` is local.
pub trait ParameterPartitioner: Send + Sync {
    /// Split a replicated parameter so only this rank's shard stays resident
    fn partition(&self, param: &ParameterHandle) -> Result<()>;

    /// Reassemble full data for every partitioned parameter in `params`
    ///
    /// Returns the handles this call gathered. Parameters that were already
    /// materialized are skipped and left out of the result.
    fn materialize(&self, params: &[ParameterHandle]) -> Result<Vec<ParameterHandle>>;

    /// Drop non-owned data from every gathered parameter in `params`
    fn release(&self, params: &[ParameterHandle]);
}

/// Even flat sharding over a collective transport
pub struct ShardedPartitioner {
    collective: Arc<dyn Collective>,
}

impl ShardedPartitioner {
    pub fn new(collective: Arc<dyn Collective>) -> Self {
        Self { collective }
    }

    fn gather_one(&self, param: &ParameterHandle, layout: &ShardLayout) -> Result<Tensor> {
        let shard = param.local_data();
        let origin = shard.device();
        let parts = self
            .collective
            .all_gather(&shard.into_device(self.collective.device()))?;

        let mut flat: Vec<f32> = parts.into_iter().flat_map(Tensor::into_data).collect();
        flat.truncate(layout.numel);
        Ok(Tensor::new(layout.full_shape.clone(), flat)?.into_device(origin))
    }
}

impl ParameterPartitioner for ShardedPartitioner {
    fn partition(&self, param: &ParameterHandle) -> Result<()> {
        if param.residency() != Residency::Replicated {
            return Ok(());
        }

        let full = param.data()?;
        let layout = ShardLayout::new(
            full.shape().to_vec(),
            self.collective.world_size(),
            self.collective.rank(),
        );
        let shard = Tensor::from_vec(layout.shard_of(full.data())).into_device(full.device());
        param.set_resident(shard, Residency::Partitioned(layout));
        Ok(())
    }

    fn materialize(&self, params: &[ParameterHandle]) -> Result<Vec<ParameterHandle>> {
        let mut gathered: Vec<ParameterHandle> = Vec::with_capacity(params.len());

        for param in params {
            let layout = match param.residency() {
                Residency::Partitioned(layout) => layout,
                _ => continue,
            };

            match self.gather_one(param, &layout) {
                Ok(full) => {
                    param.set_resident(full, Residency::Gathered(layout));
                    gathered.push(Arc::clone(param));
                }
                Err(e) => {
                    warn!(param = param.name(), error = %e, "Parameter gather failed");
                    self.release(&gathered);
                    return Err(e);
                }
            }
        }

        debug!(count = gathered.len(), "Materialized parameters");
        Ok(gathered)
    }

    fn release(&self, params: &[ParameterHandle]) {
        for param in params {
            if let Residency::Gathered(layout) = param.residency() {
                let full = param.local_data();
                let shard = Tensor::from_vec(layout.shard_of(full.data())).into_device(full.device());
                param.set_resident(shard, Residency::Partitioned(layout));
            }
        }
    }
}

/// Parameters that are only resident as a shard on this rank
pub fn params_to_fetch(params: &[ParameterHandle]) -> Vec<ParameterHandle> {
    params
        .iter()
        .filter(|p| !p.is_materialized())
        .cloned()
        .collect()
}

/// Guard holding a set of parameters materialized
///
/// Dropping the guard releases only what it gathered itself; parameters held
/// by an enclosing scope stay materialized.
#[must_use = "parameters are released as soon as the guard is dropped"]
pub struct GatheredParameters<'a> {
    partitioner: &'a dyn ParameterPartitioner,
    params: Vec<ParameterHandle>,
    owned: Vec<ParameterHandle>,
}

impl GatheredParameters<'_> {
    /// Returns true if this guard materialized anything
    pub fn is_active(&self) -> bool {
        !self.owned.is_empty()
    }

    pub fn params(&self) -> &[ParameterHandle] {
        &self.params
    }
}

impl Drop for GatheredParameters<'_> {
    fn drop(&mut self) {
        if !self.owned.is_empty() {
            self.partitioner.release(&self.owned);
        }
    }
}

/// Materialize `params` until the returned guard drops
///
/// With `enabled == false` nothing is gathered and residency is untouched.
pub fn with_gathered(
    partitioner: &dyn ParameterPartitioner,
    params: Vec<ParameterHandle>,
    enabled: bool,
) -> Result<GatheredParameters<'_>> {
    let owned = if enabled {
        partitioner.materialize(&params)?
    } else {
        Vec::new()
    };
    Ok(GatheredParameters {
        partitioner,
        params,
        owned,
    })
}

/// Run `f` with `params` materialized
pub fn gathered_scope<T>(
    partitioner: &dyn ParameterPartitioner,
    params: Vec<ParameterHandle>,
    enabled: bool,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let _guard = with_gathered(partitioner, params, enabled)?;
    f()
}
