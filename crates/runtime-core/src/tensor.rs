//! Host-side tensor buffer shared by the collective, engine, and checkpoint layers

use crate::{Device, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named tensors in a model, ordered by name
pub type StateDict = BTreeMap<String, Tensor>;

/// Dense row-major f32 buffer tagged with its residency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
    device: Device,
}

impl Tensor {
    /// Create a host tensor, checking that `data` matches `shape`
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(Error::invalid_argument(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                numel,
                data.len()
            )));
        }
        Ok(Self {
            shape,
            data,
            device: Device::Cpu,
        })
    }

    /// 1-D host tensor
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
            device: Device::Cpu,
        }
    }

    /// Single-element 1-D host tensor
    pub fn scalar(value: f32) -> Self {
        Self::from_vec(vec![value])
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; numel],
            device: Device::Cpu,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Copy to another device
    pub fn to(&self, device: Device) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.clone(),
            device,
        }
    }

    /// Move to another device without copying the buffer
    pub fn into_device(mut self, device: Device) -> Tensor {
        self.device = device;
        self
    }

    /// Reinterpret with a new shape of equal element count
    pub fn reshape(mut self, shape: Vec<usize>) -> Result<Tensor> {
        let numel: usize = shape.iter().product();
        if numel != self.data.len() {
            return Err(Error::invalid_argument(format!(
                "cannot reshape {} elements into {:?}",
                self.data.len(),
                shape
            )));
        }
        self.shape = shape;
        Ok(self)
    }

    /// Concatenate along axis 0. All parts must agree on trailing dimensions.
    pub fn concat(parts: &[Tensor]) -> Result<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| Error::invalid_argument("cannot concatenate zero tensors"))?;
        let trailing = first.shape.get(1..).unwrap_or(&[]).to_vec();

        let mut leading = 0;
        let mut data = Vec::with_capacity(parts.iter().map(Tensor::numel).sum());
        for part in parts {
            if part.shape.get(1..).unwrap_or(&[]) != trailing.as_slice() {
                return Err(Error::ShapeMismatch {
                    name: "concat".to_string(),
                    expected: trailing.clone(),
                    actual: part.shape.clone(),
                });
            }
            leading += part.shape.first().copied().unwrap_or(1);
            data.extend_from_slice(&part.data);
        }

        let mut shape = vec![leading];
        shape.extend(trailing);
        Ok(Tensor {
            shape,
            data,
            device: first.device,
        })
    }

    /// Multiply every element by `factor`
    pub fn scale_(&mut self, factor: f32) {
        self.data.iter_mut().for_each(|x| *x *= factor);
    }

    /// `self += factor * other`
    pub fn add_scaled_(&mut self, other: &Tensor, factor: f32) -> Result<()> {
        self.check_same_shape("add_scaled", other)?;
        for (x, y) in self.data.iter_mut().zip(&other.data) {
            *x += factor * y;
        }
        Ok(())
    }

    /// `self = beta * self + (1 - beta) * other`
    pub fn lerp_toward_(&mut self, other: &Tensor, beta: f32) -> Result<()> {
        self.check_same_shape("lerp", other)?;
        for (x, y) in self.data.iter_mut().zip(&other.data) {
            *x = (1.0 - beta) * y + beta * *x;
        }
        Ok(())
    }

    /// 2-D matrix product `self @ rhs`
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        let (m, k) = match self.shape.as_slice() {
            [m, k] => (*m, *k),
            _ => return Err(Error::invalid_argument("matmul lhs must be 2-D")),
        };
        let n = match rhs.shape.as_slice() {
            [k2, n] if *k2 == k => *n,
            _ => {
                return Err(Error::ShapeMismatch {
                    name: "matmul".to_string(),
                    expected: vec![k, 0],
                    actual: rhs.shape.clone(),
                })
            }
        };

        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            for p in 0..k {
                let a = self.data[i * k + p];
                if a == 0.0 {
                    continue;
                }
                let row = &rhs.data[p * n..(p + 1) * n];
                for (o, b) in out[i * n..(i + 1) * n].iter_mut().zip(row) {
                    *o += a * b;
                }
            }
        }

        Ok(Tensor {
            shape: vec![m, n],
            data: out,
            device: self.device,
        })
    }

    fn check_same_shape(&self, op: &str, other: &Tensor) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::ShapeMismatch {
                name: op.to_string(),
                expected: self.shape.clone(),
                actual: other.shape.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_numel() {
        assert!(Tensor::new(vec![2, 2], vec![1.0; 3]).is_err());
        let t = Tensor::new(vec![2, 2], vec![1.0; 4]).unwrap();
        assert_eq!(t.numel(), 4);
        assert!(t.device().is_cpu());
    }

    #[test]
    fn test_concat_rows() {
        let a = Tensor::new(vec![1, 2], vec![1.0, 2.0]).unwrap();
        let b = Tensor::new(vec![2, 2], vec![3.0, 4.0, 5.0, 6.0]).unwrap();
        let c = Tensor::concat(&[a, b]).unwrap();
        assert_eq!(c.shape(), &[3, 2]);
        assert_eq!(c.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_lerp_toward() {
        let mut shadow = Tensor::from_vec(vec![10.0, 0.0]);
        let live = Tensor::from_vec(vec![0.0, 10.0]);
        shadow.lerp_toward_(&live, 0.9).unwrap();
        assert!((shadow.data()[0] - 9.0).abs() < 1e-6);
        assert!((shadow.data()[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_matmul() {
        let a = Tensor::new(vec![2, 1], vec![1.0, 2.0]).unwrap();
        let b = Tensor::new(vec![1, 3], vec![1.0, 0.0, -1.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 3]);
        assert_eq!(c.data(), &[1.0, 0.0, -1.0, 2.0, 0.0, -2.0]);
    }
}
