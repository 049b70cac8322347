//! Checkpoint manager for full, weights-only, and pretrained exports

use std::path::{Path, PathBuf};
use std::sync::Arc;

use engine::{
    params_to_fetch, with_gathered, ClientState, LoadOptions, LoadedCheckpoint, ManagedModel,
    Model, ParameterPartitioner,
};
use runtime_core::{Device, Error, ProcessContext, Result, StateDict};
use tracing::{debug, info, instrument};

use crate::retention::{enforce_retention, RetentionPolicy};
use crate::writer::{read_state_dict, write_atomic, write_state_dict};

/// File name of a weights-only export inside a pretrained directory
pub const WEIGHTS_FILE: &str = "model_weights.bin";

/// File name of the model configuration inside a pretrained directory
pub const CONFIG_FILE: &str = "config.json";

/// Extension of a bare state-dict checkpoint
pub const BARE_CHECKPOINT_EXTENSION: &str = "ckpt";

/// Rewrites state-dict keys while loading
pub type KeyRewrite<'a> = &'a dyn Fn(&str) -> String;

/// Saves and restores checkpoints for one process of the group
///
/// Only the primary process touches the checkpoint root; every process takes
/// part in the collective calls a save or load makes.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    policy: RetentionPolicy,
    ctx: ProcessContext,
}

impl CheckpointManager {
    pub fn new(policy: RetentionPolicy, ctx: ProcessContext) -> Self {
        Self { policy, ctx }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Save a resumable checkpoint under `dir/tag`
    ///
    /// The primary process sweeps `dir` down to the retention policy first,
    /// so peak disk usage stays bounded. Engine-wrapped models delegate to the
    /// engine; bare models fall back to `dir/{tag}.ckpt` written by the
    /// primary process.
    #[instrument(skip_all, fields(dir = %dir.display(), tag = tag, rank = self.ctx.rank))]
    pub async fn save_full(
        &self,
        model: &mut ManagedModel,
        dir: &Path,
        tag: &str,
        client_state: &ClientState,
        save_latest: bool,
    ) -> Result<()> {
        if self.ctx.is_primary() {
            tokio::fs::create_dir_all(dir).await?;
            let evicted = enforce_retention(dir, &self.policy).await?;
            if !evicted.is_empty() {
                debug!(count = evicted.len(), "Retention sweep evicted checkpoints");
            }
        }

        match model {
            ManagedModel::Wrapped(engine) => {
                engine
                    .save_checkpoint(dir, Some(tag), client_state, save_latest)
                    .await?;
            }
            ManagedModel::Bare(model) => {
                if self.ctx.is_primary() {
                    let path = bare_checkpoint_path(dir, tag);
                    write_state_dict(&path, &model.state_dict()?, client_state).await?;
                }
            }
        }

        self.ctx.log(format_args!("Saved checkpoint {} to {}", tag, dir.display()));
        Ok(())
    }

    /// Restore a checkpoint written by [`save_full`](Self::save_full)
    ///
    /// Bare models need an explicit tag and are loaded non-strictly.
    #[instrument(skip_all, fields(dir = %dir.display(), tag = ?tag, rank = self.ctx.rank))]
    pub async fn load(
        &self,
        model: &mut ManagedModel,
        dir: &Path,
        tag: Option<&str>,
        options: &LoadOptions,
    ) -> Result<Option<LoadedCheckpoint>> {
        match model {
            ManagedModel::Wrapped(engine) => engine.load_checkpoint(dir, tag, options).await,
            ManagedModel::Bare(model) => {
                let tag = tag.ok_or_else(|| {
                    Error::invalid_argument("loading a bare model requires a checkpoint tag")
                })?;
                let path = bare_checkpoint_path(dir, tag);
                let file = read_state_dict(&path).await?;
                model.load_state_dict(&file.state, false)?;
                Ok(Some(LoadedCheckpoint {
                    path,
                    client_state: file.metadata,
                }))
            }
        }
    }

    /// Export merged weights and buffers to a single state-dict file
    ///
    /// Adapters are folded into their base weights in the export; the live
    /// model keeps them separate. Under full partitioning every process
    /// gathers each parameter in turn and only the primary process keeps the
    /// result.
    #[instrument(skip_all, fields(path = %path.display(), rank = self.ctx.rank))]
    pub async fn save_weights_only(
        &self,
        model: &ManagedModel,
        path: &Path,
        partitioner: &dyn ParameterPartitioner,
    ) -> Result<()> {
        let plain = model.unwrap_model();
        let state = if model.stage().shards_parameters() {
            self.collect_sharded(plain, partitioner)?
        } else if self.ctx.is_primary() {
            Some(collect_replicated(plain)?)
        } else {
            None
        };

        if let Some(state) = state {
            write_state_dict(path, &state, &ClientState::new()).await?;
            info!(tensors = state.len(), "Exported model weights");
        }
        Ok(())
    }

    /// Load a weights file onto the plain model
    ///
    /// Parameters must be materialized; load before sharding the model.
    #[instrument(skip_all, fields(path = %path.display(), strict))]
    pub async fn load_weights(
        &self,
        model: &mut ManagedModel,
        path: &Path,
        strict: bool,
        key_rewrite: Option<KeyRewrite<'_>>,
    ) -> Result<()> {
        let file = read_state_dict(path).await?;
        let state: StateDict = match key_rewrite {
            Some(rewrite) => file
                .state
                .into_iter()
                .map(|(name, tensor)| (rewrite(&name), tensor))
                .collect(),
            None => file.state,
        };
        model.unwrap_model_mut().load_state_dict(&state, strict)
    }

    /// Weights-only export plus `config.json` into `output_dir`
    pub async fn save_pretrained(
        &self,
        model: &ManagedModel,
        output_dir: &Path,
        model_config: &serde_json::Value,
        partitioner: &dyn ParameterPartitioner,
    ) -> Result<()> {
        if self.ctx.is_primary() {
            tokio::fs::create_dir_all(output_dir).await?;
        }
        self.save_weights_only(model, &output_dir.join(WEIGHTS_FILE), partitioner)
            .await?;

        if self.ctx.is_primary() {
            let config = serde_json::to_vec_pretty(model_config)?;
            write_atomic(&output_dir.join(CONFIG_FILE), &config).await?;
        }
        Ok(())
    }

    fn collect_sharded(
        &self,
        plain: &Model,
        partitioner: &dyn ParameterPartitioner,
    ) -> Result<Option<StateDict>> {
        let mut state = StateDict::new();

        for (name, param) in plain.base_parameters() {
            let mut involved = vec![Arc::clone(param)];
            for adapter in plain.adapters_for(name) {
                involved.extend(adapter.parameters());
            }
            let fetch = params_to_fetch(&involved);
            let enabled = !fetch.is_empty();

            let _gathered = with_gathered(partitioner, fetch, enabled)?;
            let merged = plain.merged_data(name, param)?;
            if self.ctx.is_primary() {
                state.insert(name.clone(), merged.into_device(Device::Cpu));
            }
        }

        if !self.ctx.is_primary() {
            return Ok(None);
        }
        for (name, buffer) in plain.named_buffers() {
            state.insert(name.clone(), buffer.to(Device::Cpu));
        }
        Ok(Some(state))
    }
}

fn collect_replicated(plain: &Model) -> Result<StateDict> {
    let mut state = StateDict::new();
    for (name, param) in plain.base_parameters() {
        state.insert(name.clone(), plain.merged_data(name, param)?.into_device(Device::Cpu));
    }
    for (name, buffer) in plain.named_buffers() {
        state.insert(name.clone(), buffer.to(Device::Cpu));
    }
    Ok(state)
}

/// Path of a bare state-dict checkpoint
pub fn bare_checkpoint_path(dir: &Path, tag: &str) -> PathBuf {
    dir.join(format!("{}.{}", tag, BARE_CHECKPOINT_EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;
    use collective::{Collective, LocalCollective};
    use engine::{Residency, ShardedPartitioner};
    use runtime_core::{ModelRole, Tensor};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn model() -> Model {
        Model::new("policy", ModelRole::Primary)
            .with_parameter("proj.weight", Tensor::new(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap(), true)
            .with_parameter("proj.bias", Tensor::from_vec(vec![0.0, 0.0]), true)
            .with_buffer("rope.inv_freq", Tensor::from_vec(vec![1.0, 0.5]))
    }

    fn single_partitioner() -> ShardedPartitioner {
        let comm = LocalCollective::single();
        comm.init(Duration::from_secs(5)).unwrap();
        ShardedPartitioner::new(Arc::new(comm))
    }

    #[tokio::test]
    async fn test_bare_save_and_load() {
        let root = tempdir().unwrap();
        let manager = CheckpointManager::new(RetentionPolicy::new(3, u64::MAX), ProcessContext::single());
        let mut managed = ManagedModel::from(model());
        let mut client_state = ClientState::new();
        client_state.insert("consumed_samples".to_string(), 640.into());

        manager
            .save_full(&mut managed, root.path(), "global_step_10", &client_state, true)
            .await
            .unwrap();
        assert!(root.path().join("global_step_10.ckpt").exists());

        let mut restored = ManagedModel::from(model());
        restored
            .unwrap_model()
            .parameter("proj.bias")
            .unwrap()
            .set_data(Tensor::from_vec(vec![7.0, 7.0]))
            .unwrap();
        let loaded = manager
            .load(&mut restored, root.path(), Some("global_step_10"), &LoadOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(loaded.client_state["consumed_samples"], 640);
        let bias = restored.unwrap_model().parameter("proj.bias").unwrap().data().unwrap();
        assert_eq!(bias.data(), &[0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_bare_load_requires_tag() {
        let root = tempdir().unwrap();
        let manager = CheckpointManager::new(RetentionPolicy::new(3, u64::MAX), ProcessContext::single());
        let mut managed = ManagedModel::from(model());
        let result = manager
            .load(&mut managed, root.path(), None, &LoadOptions::default())
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn test_save_full_sweeps_before_writing() {
        let root = tempdir().unwrap();
        for name in ["step_1", "step_2"] {
            std::fs::create_dir_all(root.path().join(name)).unwrap();
            std::fs::write(root.path().join(name).join("state.bin"), [0u8; 4]).unwrap();
        }
        let manager = CheckpointManager::new(RetentionPolicy::new(2, u64::MAX), ProcessContext::single());
        let mut managed = ManagedModel::from(model());

        manager
            .save_full(&mut managed, root.path(), "step_3", &ClientState::new(), false)
            .await
            .unwrap();

        let dirs: Vec<_> = std::fs::read_dir(root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .collect();
        assert_eq!(dirs.len(), 1);
    }

    #[tokio::test]
    async fn test_secondary_process_writes_nothing() {
        let root = tempdir().unwrap();
        let manager = CheckpointManager::new(RetentionPolicy::new(3, u64::MAX), ProcessContext::new(1, 2, 1));
        let mut managed = ManagedModel::from(model());

        manager
            .save_full(&mut managed, root.path(), "step_1", &ClientState::new(), false)
            .await
            .unwrap();
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_weights_export_merges_adapters() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(RetentionPolicy::new(3, u64::MAX), ProcessContext::single());
        let adapted = model()
            .with_adapter(
                "proj.weight",
                Tensor::new(vec![1, 2], vec![1.0, 0.0]).unwrap(),
                Tensor::new(vec![2, 1], vec![2.0, 0.0]).unwrap(),
                1.0,
            )
            .unwrap();
        let managed = ManagedModel::from(adapted);
        let path = dir.path().join(WEIGHTS_FILE);

        manager
            .save_weights_only(&managed, &path, &single_partitioner())
            .await
            .unwrap();

        let file = read_state_dict(&path).await.unwrap();
        let keys: Vec<_> = file.state.keys().cloned().collect();
        assert_eq!(keys, vec!["proj.bias", "proj.weight", "rope.inv_freq"]);
        assert_eq!(file.state["proj.weight"].data(), &[3.0, 0.0, 0.0, 1.0]);

        let live = managed.unwrap_model().parameter("proj.weight").unwrap().data().unwrap();
        assert_eq!(live.data(), &[1.0, 0.0, 0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_load_weights_with_key_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        let mut state = StateDict::new();
        state.insert("model.proj.bias".to_string(), Tensor::from_vec(vec![4.0, 5.0]));
        write_state_dict(&path, &state, &ClientState::new()).await.unwrap();

        let manager = CheckpointManager::new(RetentionPolicy::new(3, u64::MAX), ProcessContext::single());
        let mut managed = ManagedModel::from(model());
        let strip = |key: &str| key.trim_start_matches("model.").to_string();

        assert!(manager
            .load_weights(&mut managed, &path, true, Some(&strip))
            .await
            .is_err());
        manager
            .load_weights(&mut managed, &path, false, Some(&strip))
            .await
            .unwrap();

        let bias = managed.unwrap_model().parameter("proj.bias").unwrap().data().unwrap();
        assert_eq!(bias.data(), &[4.0, 5.0]);
    }

    #[test]
    fn test_sharded_collect_gathers_on_every_rank() {
        let handles: Vec<_> = LocalCollective::group(2)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    comm.init(Duration::from_secs(10)).unwrap();
                    let comm = Arc::new(comm);
                    let partitioner = ShardedPartitioner::new(comm.clone());
                    let ctx = ProcessContext::new(comm.rank(), 2, comm.rank());
                    let plain = model();
                    for param in plain.parameters() {
                        partitioner.partition(param).unwrap();
                    }

                    let manager = CheckpointManager::new(RetentionPolicy::new(3, u64::MAX), ctx);
                    let state = manager.collect_sharded(&plain, &partitioner).unwrap();
                    let residency_restored = plain
                        .parameters()
                        .all(|p| matches!(p.residency(), Residency::Partitioned(_)));
                    (comm.rank(), state, comm.call_counts().all_gather, residency_restored)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0].2, results[1].2);
        assert_eq!(results[0].2, 2);
        for (rank, state, _, restored) in results {
            assert!(restored);
            if rank == 0 {
                let state = state.unwrap();
                assert_eq!(state["proj.weight"].data(), &[1.0, 0.0, 0.0, 1.0]);
                assert_eq!(state["rope.inv_freq"].data(), &[1.0, 0.5]);
            } else {
                assert!(state.is_none());
            }
        }
    }
}
