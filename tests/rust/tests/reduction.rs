//! Metric reduction and gather across simulated ranks

mod common;

use anyhow::Result;
use collective::Value;
use common::{config, run_ranks, setup};
use runtime_core::{PartitionStage, ReduceOp, Tensor};

fn metrics(rank: usize) -> Value {
    Value::map([
        ("loss", Value::Scalar(rank as f32 + 1.0)),
        (
            "reward",
            Value::map([
                ("mean", Value::Scalar(10.0 * rank as f32)),
                ("per_token", Value::Tensor(Tensor::from_vec(vec![rank as f32, 1.0]))),
            ]),
        ),
    ])
}

#[test]
fn test_reduce_preserves_structure_across_ranks() {
    let results = run_ranks(4, |comm| {
        let (strategy, _) = setup(config(PartitionStage::NoPartition, 8), comm)?;
        let rank = strategy.get_rank();
        let sum = strategy.all_reduce(metrics(rank), ReduceOp::Sum)?;
        let mean = strategy.all_reduce(metrics(rank), ReduceOp::Mean)?;
        let max = strategy.all_reduce(metrics(rank), ReduceOp::Max)?;
        Ok((sum, mean, max))
    });

    for (sum, mean, max) in results {
        assert_eq!(sum.get("loss").and_then(Value::as_scalar), Some(10.0));
        assert_eq!(mean.get("loss").and_then(Value::as_scalar), Some(2.5));
        assert_eq!(max.get("loss").and_then(Value::as_scalar), Some(4.0));

        let reward = max.get("reward").unwrap();
        assert_eq!(reward.get("mean").and_then(Value::as_scalar), Some(30.0));
        let per_token = sum.get("reward").unwrap().get("per_token").unwrap();
        assert_eq!(per_token.as_tensor().unwrap().data(), &[6.0, 4.0]);
    }
}

#[test]
fn test_single_process_reduce_is_identity() -> Result<()> {
    let results = run_ranks(1, |comm| {
        let (strategy, _) = setup(config(PartitionStage::NoPartition, 2), comm)?;
        let mut out = Vec::new();
        for op in [ReduceOp::Sum, ReduceOp::Mean, ReduceOp::Max] {
            out.push(strategy.all_reduce(metrics(4), op)?);
        }
        Ok(out)
    });

    for reduced in results.into_iter().flatten() {
        assert_eq!(reduced, metrics(4));
    }
    Ok(())
}

#[test]
fn test_gather_orders_contributions_by_rank() {
    let results = run_ranks(4, |comm| {
        let (strategy, _) = setup(config(PartitionStage::NoPartition, 8), comm)?;
        let rank = strategy.get_rank() as f32;
        Ok(strategy.all_gather(Value::Scalar(rank))?)
    });

    for gathered in results {
        assert_eq!(gathered.as_tensor().unwrap().data(), &[0.0, 1.0, 2.0, 3.0]);
    }
}

#[test]
fn test_single_process_gather_returns_buffer() {
    let results = run_ranks(1, |comm| {
        let (strategy, _) = setup(config(PartitionStage::NoPartition, 2), comm)?;
        Ok(strategy.all_gather(Value::Scalar(7.0))?)
    });
    assert_eq!(results[0].as_tensor().unwrap().data(), &[7.0]);
}
