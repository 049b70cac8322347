//! End-to-end training simulation
//!
//! Two simulated ranks prepare a fully partitioned policy with an EMA shadow,
//! run accumulation windows, export merged weights, and round-trip resumable
//! checkpoints through the retention sweep.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use checkpoint::{read_state_dict, scan_checkpoint_dirs, CONFIG_FILE, WEIGHTS_FILE};
use collective::{LocalCollective, Value};
use common::{config, policy, run_ranks, runtime, setup};
use engine::{ClientState, LoadOptions, ManagedModel, Model};
use runtime_core::{ModelRole, PartitionStage, ReduceOp, StrategyConfig, Tensor};
use serde_json::json;
use strategy::{AdamSettings, PrepareEntry, TrainingStrategy, WarmupSchedule, LATEST_FILE};
use tempfile::tempdir;

/// Prepared (live, shadow) pair; the shadow starts as a copy of `policy()`
fn prepare_pair(strategy: &TrainingStrategy, base: Model) -> Result<(ManagedModel, ManagedModel)> {
    let shadow = policy().deep_copy("policy_ema", ModelRole::Shadow)?;
    let optimizer = Arc::new(strategy.create_optimizer(&base, AdamSettings::default()));
    let scheduler = Arc::new(WarmupSchedule::new(1e-6, 4));

    let mut prepared = strategy
        .prepare(
            vec![
                PrepareEntry::training(base, optimizer, scheduler),
                PrepareEntry::from(shadow),
            ],
            true,
        )?
        .into_vec();
    let shadow = prepared.remove(1).into_model();
    let live = prepared.remove(0).into_training()?.model;
    Ok((live, shadow))
}

fn sim_config() -> StrategyConfig {
    // 8 / (2 micro x 2 ranks) = 2 micro batches per optimizer step
    config(PartitionStage::FullPartition, 8)
}

#[test]
fn test_ema_follows_accumulation_cadence() {
    let results = run_ranks(2, |comm| {
        let (strategy, _) = setup(sim_config(), comm)?;
        let base = policy();
        base.parameter("layers.0.bias")
            .unwrap()
            .set_data(Tensor::from_vec(vec![1.5, -1.5]))?;
        let (mut live, shadow) = prepare_pair(&strategy, base)?;

        let mut blended = Vec::new();
        for micro in 0..4 {
            strategy.backward(&Tensor::scalar(1.0 + micro as f32), &mut live)?;
            strategy.optimizer_step(&mut live)?;
            blended.push(strategy.moving_average_default(&live, &shadow)?);
        }

        let bias = shadow.unwrap_model().parameter("layers.0.bias").unwrap().data()?;
        let frozen = shadow.unwrap_model().parameter("embed.weight").unwrap().data()?;
        let live_sharded = live.unwrap_model().parameters().all(|p| !p.is_materialized());
        Ok((blended, bias.into_data(), frozen.into_data(), live_sharded))
    });

    let beta = strategy::DEFAULT_EMA_BETA;
    // Two blends of live 1.5 into shadow 0.5
    let once = beta * 0.5 + (1.0 - beta) * 1.5;
    let twice = beta * once + (1.0 - beta) * 1.5;
    for (blended, bias, frozen, live_sharded) in results {
        assert_eq!(blended, vec![false, true, false, true]);
        assert!((bias[0] - twice).abs() < 1e-6);
        assert!((bias[1] + twice).abs() < 1e-6);
        assert_eq!(frozen, vec![9.0, 8.0, 7.0]);
        assert!(live_sharded);
    }
}

#[test]
fn test_weights_export_gathers_evenly_on_every_rank() {
    let dir = tempdir().unwrap();
    let export_dir = dir.path().join("export");

    let export = export_dir.clone();
    let results = run_ranks(2, move |comm: Arc<LocalCollective>| {
        let rt = runtime()?;
        let (strategy, _) = setup(sim_config(), comm.clone())?;
        let base = policy()
            .with_parameter("proj.weight", Tensor::new(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0])?, true)
            .with_adapter(
                "proj.weight",
                Tensor::new(vec![1, 2], vec![1.0, 2.0])?,
                Tensor::new(vec![2, 1], vec![1.0, 1.0])?,
                0.5,
            )?;
        let (live, _) = prepare_pair(&strategy, base)?;

        let gathers_before = comm.call_counts().all_gather;
        rt.block_on(strategy.save_pretrained(&live, &export, &json!({"hidden_size": 2})))?;
        let gathers = comm.call_counts().all_gather - gathers_before;

        let still_sharded = live.unwrap_model().parameters().all(|p| !p.is_materialized());
        Ok((gathers, still_sharded))
    });

    assert_eq!(results[0].0, results[1].0);
    assert!(results[0].0 > 0);
    assert!(results.iter().all(|(_, sharded)| *sharded));

    let rt = runtime().unwrap();
    let file = rt.block_on(read_state_dict(&export_dir.join(WEIGHTS_FILE))).unwrap();
    assert_eq!(file.state["layers.0.weight"].data(), &[1.0, 2.0, 3.0, 4.0, 5.0]);
    // I + 0.5 * [[1, 2], [1, 2]]
    assert_eq!(file.state["proj.weight"].data(), &[1.5, 1.0, 0.5, 2.0]);
    assert!(!file.state.contains_key("proj.weight.lora_down"));
    assert!(file.state.contains_key("rotary.inv_freq"));
    assert!(export_dir.join(CONFIG_FILE).exists());
}

#[test]
fn test_checkpoint_resume_with_retention() {
    let dir = tempdir().unwrap();
    let ckpt_root: PathBuf = dir.path().join("ckpt");

    let root = ckpt_root.clone();
    let saved = run_ranks(2, move |comm| {
        let rt = runtime()?;
        let mut cfg = sim_config();
        cfg.retention.max_checkpoints = 2;
        let (strategy, _) = setup(cfg, comm)?;
        let (mut live, _) = prepare_pair(&strategy, policy())?;

        for window in 0..3u64 {
            for _ in 0..2 {
                strategy.backward(&Tensor::scalar(2.0), &mut live)?;
                strategy.optimizer_step(&mut live)?;
            }
            let mut client_state = ClientState::new();
            client_state.insert("consumed_samples".to_string(), json!((window + 1) * 8));
            let tag = format!("global_step{}", window + 1);
            rt.block_on(strategy.save_ckpt(&mut live, &root, &tag, &client_state, true))?;
        }

        let loss = strategy.all_reduce(Value::Scalar(2.0), ReduceOp::Mean)?;
        Ok(loss.as_scalar())
    });
    assert!(saved.iter().all(|loss| *loss == Some(2.0)));

    let rt = runtime().unwrap();
    let remaining = rt.block_on(scan_checkpoint_dirs(&ckpt_root)).unwrap();
    let names: Vec<_> = remaining
        .iter()
        .filter_map(|d| d.path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    // The sweep before the third save keeps one slot free for it
    assert_eq!(names, vec!["global_step2", "global_step3"]);
    assert_eq!(
        std::fs::read_to_string(ckpt_root.join(LATEST_FILE)).unwrap(),
        "global_step3"
    );

    let root = ckpt_root.clone();
    let resumed = run_ranks(2, move |comm| {
        let rt = runtime()?;
        let (strategy, _) = setup(sim_config(), comm)?;
        let fresh = policy();
        fresh
            .parameter("layers.0.weight")
            .unwrap()
            .set_data(Tensor::from_vec(vec![0.0; 5]))?;
        let (mut live, _) = prepare_pair(&strategy, fresh)?;

        let loaded = rt
            .block_on(strategy.load_ckpt(&mut live, &root, None, &LoadOptions::default()))?
            .expect("latest checkpoint");
        let steps = live.engine_mut()?.global_steps();

        let weight = {
            let partitioner = strategy.partitioner()?;
            let param = Arc::clone(live.unwrap_model().parameter("layers.0.weight").unwrap());
            let _guard = engine::with_gathered(partitioner.as_ref(), vec![Arc::clone(&param)], true)?;
            param.data()?.into_data()
        };
        Ok((loaded.client_state["consumed_samples"].clone(), steps, weight))
    });

    for (consumed, steps, weight) in resumed {
        assert_eq!(consumed, json!(24));
        assert_eq!(steps, 3);
        assert_eq!(weight, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}
