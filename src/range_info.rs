use crate::interval::{Bound, Interval, IntervalError, bound_serde, broadcast_zip, vector_bound};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RangeStoreError {
    #[error("Range info for \"{0}\" was already written")]
    AlreadyWritten(String),
    #[error("Integer info for \"{0}\" was already attached")]
    IntegerInfoAlreadyPresent(String),
    #[error("No range info for \"{0}\"")]
    UnknownTensor(String),
}

/// Integer component of a tensor: `real = scale * integer + bias`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegerInfo {
    pub int_range: Interval,
    #[serde(with = "bound_serde")]
    pub scale: Bound,
    #[serde(with = "bound_serde")]
    pub bias: Bound,
}

impl IntegerInfo {
    /// Unit scale, zero bias: the tensor is its own integer representation.
    pub fn identity(int_range: Interval) -> Self {
        Self {
            int_range,
            scale: vector_bound(vec![1.0]),
            bias: vector_bound(vec![0.0]),
        }
    }

    /// Real-valued interval implied by the integer component.
    pub fn real_range(&self) -> Result<Interval, IntervalError> {
        self.int_range.map_affine(&self.scale, &self.bias)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeInfo {
    pub range: Interval,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integer: Option<IntegerInfo>,
    #[serde(default)]
    pub is_initializer: bool,
}

impl RangeInfo {
    pub fn new(range: Interval) -> Self {
        Self {
            range,
            integer: None,
            is_initializer: false,
        }
    }

    /// Range info of a graph constant. Integral constants also carry integer
    /// info with unit scale and zero bias.
    pub fn initializer(value: ArrayD<f64>) -> Self {
        let integer = if value.iter().all(|x| x.fract() == 0.0) {
            Some(IntegerInfo::identity(Interval::point(value.clone())))
        } else {
            None
        };
        Self {
            range: Interval::point(value),
            integer,
            is_initializer: true,
        }
    }

    /// Result of evaluating a node whose inputs were all constant.
    pub fn constant(value: ArrayD<f64>) -> Self {
        Self {
            range: Interval::point(value),
            integer: None,
            is_initializer: true,
        }
    }

    pub fn has_integer_info(&self) -> bool {
        self.integer.is_some()
    }

    /// Whether `scale * int_range + bias` reproduces `range` within `tolerance`.
    ///
    /// Returns `Ok(true)` for tensors without integer info. NaN anywhere in the
    /// reconstruction counts as inconsistent.
    pub fn check_integer_consistency(&self, tolerance: f64) -> Result<bool, IntervalError> {
        let Some(integer) = &self.integer else {
            return Ok(true);
        };
        let implied = integer.real_range()?;
        let close = |a: f64, b: f64| if (a - b).abs() <= tolerance { 1.0 } else { 0.0 };
        let min_ok = broadcast_zip(&implied.min, &self.range.min, close)?;
        let max_ok = broadcast_zip(&implied.max, &self.range.max, close)?;
        Ok(min_ok.iter().chain(max_ok.iter()).all(|&x| x == 1.0))
    }
}

/// Tensor name -> range info arena.
///
/// Entries are written once by their producer and read afterwards; the only
/// later mutation is attaching integer info to an entry that lacks it.
/// Iteration follows insertion order.
#[derive(Clone, Debug, Default)]
pub struct RangeStore {
    entries: Vec<(String, RangeInfo)>,
    index: HashMap<String, usize>,
}

impl RangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, info: RangeInfo) -> Result<(), RangeStoreError> {
        if self.index.contains_key(name) {
            return Err(RangeStoreError::AlreadyWritten(name.to_string()));
        }
        self.index.insert(name.to_string(), self.entries.len());
        self.entries.push((name.to_string(), info));
        Ok(())
    }

    pub fn attach_integer_info(&mut self, name: &str, integer: IntegerInfo) -> Result<(), RangeStoreError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| RangeStoreError::UnknownTensor(name.to_string()))?;
        let entry = &mut self.entries[idx].1;
        if entry.integer.is_some() {
            return Err(RangeStoreError::IntegerInfoAlreadyPresent(name.to_string()));
        }
        entry.integer = Some(integer);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RangeInfo> {
        self.index.get(name).map(|&i| &self.entries[i].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RangeInfo)> {
        self.entries.iter().map(|(name, info)| (name.as_str(), info))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
