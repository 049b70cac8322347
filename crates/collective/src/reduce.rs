//! Structure-preserving reductions across the process group

use std::sync::Arc;

use runtime_core::{Device, ReduceOp, Result, Tensor};

use crate::transport::{Collective, CollectiveOp};
use crate::value::{LeafVisitor, Value};

/// Reduces and gathers nested metric values across ranks
///
/// Host-resident leaves are staged onto the transport device for the call and
/// returned to host memory afterwards.
#[derive(Clone)]
pub struct ReductionEngine {
    collective: Arc<dyn Collective>,
}

impl ReductionEngine {
    pub fn new(collective: Arc<dyn Collective>) -> Self {
        Self { collective }
    }

    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    /// Reduce every leaf across ranks; scalars stay scalars
    ///
    /// `Mean` divides each contribution by the world size before a sum
    /// reduction.
    pub fn reduce(&self, data: Value, op: ReduceOp) -> Result<Value> {
        data.accept(&mut ReduceVisitor { engine: self, op })
    }

    /// Concatenate every leaf across ranks along axis 0, rank 0 first
    ///
    /// Scalar leaves come back as tensors of `world_size` elements.
    pub fn gather(&self, data: Value) -> Result<Value> {
        data.accept(&mut GatherVisitor { engine: self })
    }

    fn reduce_tensor(&self, tensor: Tensor, op: ReduceOp) -> Result<Tensor> {
        let (mut staged, origin) = self.stage(tensor);

        if op == ReduceOp::Mean {
            let world_size = self.world_size() as f32;
            staged.data_mut().iter_mut().for_each(|x| *x /= world_size);
        }

        let wire_op = match op {
            ReduceOp::Max => CollectiveOp::Max,
            ReduceOp::Mean | ReduceOp::Sum => CollectiveOp::Sum,
        };
        self.collective.all_reduce(&mut staged, wire_op)?;

        Ok(staged.into_device(origin))
    }

    fn gather_tensor(&self, tensor: Tensor) -> Result<Tensor> {
        let (staged, origin) = self.stage(tensor);
        let parts = self.collective.all_gather(&staged)?;
        Ok(Tensor::concat(&parts)?.into_device(origin))
    }

    /// Move a host tensor onto the transport device, remembering where it came from
    fn stage(&self, tensor: Tensor) -> (Tensor, Device) {
        let origin = tensor.device();
        if origin.is_cpu() {
            (tensor.into_device(self.collective.device()), origin)
        } else {
            (tensor, origin)
        }
    }
}

struct ReduceVisitor<'a> {
    engine: &'a ReductionEngine,
    op: ReduceOp,
}

impl LeafVisitor for ReduceVisitor<'_> {
    fn visit_scalar(&mut self, _path: &[String], value: f32) -> Result<Value> {
        let reduced = self.engine.reduce_tensor(Tensor::scalar(value), self.op)?;
        Ok(Value::Scalar(reduced.data()[0]))
    }

    fn visit_tensor(&mut self, _path: &[String], tensor: Tensor) -> Result<Value> {
        Ok(Value::Tensor(self.engine.reduce_tensor(tensor, self.op)?))
    }
}

struct GatherVisitor<'a> {
    engine: &'a ReductionEngine,
}

impl LeafVisitor for GatherVisitor<'_> {
    fn visit_scalar(&mut self, _path: &[String], value: f32) -> Result<Value> {
        Ok(Value::Tensor(self.engine.gather_tensor(Tensor::scalar(value))?))
    }

    fn visit_tensor(&mut self, _path: &[String], tensor: Tensor) -> Result<Value> {
        Ok(Value::Tensor(self.engine.gather_tensor(tensor)?))
    }
}
