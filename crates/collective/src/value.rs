//! Nested metric values

use std::collections::BTreeMap;

use runtime_core::{Result, Tensor};

/// Scalar, tensor, or string-keyed mapping of values
///
/// Maps are ordered by key so every rank visits leaves, and therefore issues
/// collective calls, in the same order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f32),
    Tensor(Tensor),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Build a map from key/value pairs
    pub fn map<K, V, I>(entries: I) -> Value
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            Value::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Look up a key in a map value
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    /// Rebuild this value with every leaf passed through `visitor`
    pub fn accept<V: LeafVisitor + ?Sized>(self, visitor: &mut V) -> Result<Value> {
        self.accept_at(&mut Vec::new(), visitor)
    }

    fn accept_at<V: LeafVisitor + ?Sized>(
        self,
        path: &mut Vec<String>,
        visitor: &mut V,
    ) -> Result<Value> {
        match self {
            Value::Scalar(v) => visitor.visit_scalar(path, v),
            Value::Tensor(t) => visitor.visit_tensor(path, t),
            Value::Map(entries) => {
                let mut out = BTreeMap::new();
                for (key, value) in entries {
                    path.push(key.clone());
                    let visited = value.accept_at(path, visitor);
                    path.pop();
                    out.insert(key, visited?);
                }
                Ok(Value::Map(out))
            }
        }
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Scalar(v)
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Tensor(t)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(entries)
    }
}

/// Transforms the leaves of a [`Value`]; maps are traversed by [`Value::accept`]
pub trait LeafVisitor {
    /// `path` holds the map keys leading to this leaf
    fn visit_scalar(&mut self, path: &[String], value: f32) -> Result<Value>;

    fn visit_tensor(&mut self, path: &[String], tensor: Tensor) -> Result<Value>;
}
