//! Engine wrapping and scoped parameter gathering across simulated ranks

mod common;

use std::sync::Arc;

use common::{config, policy, run_ranks, setup};
use engine::{with_gathered, ParameterPartitioner, Residency};
use runtime_core::{Error, PartitionStage};
use strategy::{AdamSettings, Component, PrepareEntry, WarmupSchedule};

fn malformed_groups() -> Vec<Vec<Component>> {
    let model = policy();
    let optimizer = Arc::new(strategy::create_optimizer(&model, AdamSettings::default(), false));
    let scheduler = Arc::new(WarmupSchedule::new(1e-6, 10));
    vec![
        vec![Component::Model(policy()), Component::Optimizer(optimizer.clone())],
        vec![
            Component::Model(policy()),
            Component::Optimizer(optimizer.clone()),
            Component::Scheduler(scheduler.clone()),
            Component::Scheduler(scheduler),
        ],
    ]
}

#[test]
fn test_malformed_groups_fail_without_collective_traffic() {
    let results = run_ranks(2, |comm| {
        let (strategy, backend) = setup(config(PartitionStage::FullPartition, 4), comm.clone())?;
        let before = comm.call_counts();

        let mut errors = Vec::new();
        for group in malformed_groups() {
            // A valid eval entry ahead of the bad group must not be initialized either
            let entries = vec![PrepareEntry::from(policy()), PrepareEntry::Group(group)];
            errors.push(strategy.prepare(entries, false).err());
        }

        let after = comm.call_counts();
        Ok((errors, before.total(), after.total(), backend.initialize_calls()))
    });

    for (errors, before, after, initialize_calls) in results {
        for error in errors {
            assert!(matches!(error, Some(Error::InvalidArgument { .. })));
        }
        assert_eq!(before, after);
        assert_eq!(initialize_calls, 0);
    }
}

#[test]
fn test_disabled_gather_is_a_no_op() {
    let results = run_ranks(2, |comm| {
        let (strategy, _) = setup(config(PartitionStage::FullPartition, 4), comm.clone())?;
        let partitioner = strategy.partitioner()?;
        let model = policy();
        for param in model.parameters() {
            partitioner.partition(param)?;
        }

        let params: Vec<_> = model.parameters().cloned().collect();
        let residency_before: Vec<Residency> = params.iter().map(|p| p.residency()).collect();
        let gathers_before = comm.call_counts().all_gather;
        {
            let guard = with_gathered(partitioner.as_ref(), params.clone(), false)?;
            assert!(!guard.is_active());
            assert!(params.iter().all(|p| !p.is_materialized()));
        }
        let residency_after: Vec<Residency> = params.iter().map(|p| p.residency()).collect();

        Ok((
            residency_before == residency_after,
            comm.call_counts().all_gather - gathers_before,
        ))
    });

    for (unchanged, gathers) in results {
        assert!(unchanged);
        assert_eq!(gathers, 0);
    }
}

#[test]
fn test_enabled_gather_restores_shards_on_drop() {
    let results = run_ranks(2, |comm| {
        let (strategy, _) = setup(config(PartitionStage::FullPartition, 4), comm)?;
        let partitioner = strategy.partitioner()?;
        let model = policy();
        let weight = Arc::clone(model.parameter("layers.0.weight").unwrap());
        partitioner.partition(&weight)?;
        let shard = weight.local_data();

        let full = {
            let _guard = with_gathered(partitioner.as_ref(), vec![Arc::clone(&weight)], true)?;
            weight.data()?.into_data()
        };
        Ok((full, shard == weight.local_data(), weight.is_materialized()))
    });

    for (full, shard_restored, materialized) in results {
        assert_eq!(full, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(shard_restored);
        assert!(!materialized);
    }
}
