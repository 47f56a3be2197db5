//! Interval arithmetic over scalar and channel-indexed bounds.
//!
//! A bound is an `ArrayD<f64>`: rank 0 for a per-tensor scalar, rank 1 for a
//! per-channel vector, or a full tensor for constants. Binary arithmetic
//! between bounds follows numpy co-broadcasting, but reports mismatches as
//! errors instead of panicking.

use ndarray::{Array1, ArrayD, ArrayView2, IxDyn, Zip};
use serde::de::Error as _;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type Bound = ArrayD<f64>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IntervalError {
    #[error("Cannot broadcast shapes {0:?} and {1:?}")]
    BroadcastError(Vec<usize>, Vec<usize>),
    #[error("Dot product length mismatch: matrix has {0} columns, bound has shape {1:?}")]
    LengthMismatch(usize, Vec<usize>),
    #[error("Invalid bound encoding: {0}")]
    InvalidEncoding(String),
}

pub fn scalar_bound(value: f64) -> Bound {
    ArrayD::from_elem(IxDyn(&[]), value)
}

pub fn vector_bound(values: Vec<f64>) -> Bound {
    Array1::from(values).into_dyn()
}

/// Shape both operands co-broadcast to, following numpy rules.
pub fn co_broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out.push(match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        });
    }
    Some(out)
}

/// Elementwise `f(a, b)` under co-broadcasting.
pub fn broadcast_zip(
    a: &Bound,
    b: &Bound,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Bound, IntervalError> {
    let mismatch = || IntervalError::BroadcastError(a.shape().to_vec(), b.shape().to_vec());
    let shape = co_broadcast_shape(a.shape(), b.shape()).ok_or_else(mismatch)?;
    let a_view = a.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
    let b_view = b.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
    Ok(Zip::from(&a_view)
        .and(&b_view)
        .map_collect(|&x, &y| f(x, y)))
}

fn expand_operand(bound: &Bound, cols: usize) -> Result<Vec<f64>, IntervalError> {
    match bound.shape() {
        [] => Ok(vec![bound[IxDyn(&[])]; cols]),
        [n] if *n == cols => Ok(bound.iter().copied().collect()),
        [1] => Ok(vec![bound[IxDyn(&[0])]; cols]),
        shape => Err(IntervalError::LengthMismatch(cols, shape.to_vec())),
    }
}

/// Exact interval of `y = A·x` for all `x` with `vmin <= x <= vmax` elementwise.
///
/// `vmin` and `vmax` are either scalars or vectors of length `cols`. Returns
/// `(ymin, ymax)`, each of length `rows`.
pub fn matvec_extremum(
    matrix: ArrayView2<f64>,
    vmin: &Bound,
    vmax: &Bound,
) -> Result<(Array1<f64>, Array1<f64>), IntervalError> {
    let cols = matrix.ncols();
    let vmin = expand_operand(vmin, cols)?;
    let vmax = expand_operand(vmax, cols)?;
    let mut out_min = Array1::zeros(matrix.nrows());
    let mut out_max = Array1::zeros(matrix.nrows());
    for (r, row) in matrix.outer_iter().enumerate() {
        let mut lo = 0.0;
        let mut hi = 0.0;
        for ((&a, &xmin), &xmax) in row.iter().zip(&vmin).zip(&vmax) {
            if a > 0.0 {
                hi += a * xmax;
                lo += a * xmin;
            } else {
                hi += a * xmin;
                lo += a * xmax;
            }
        }
        out_min[r] = lo;
        out_max[r] = hi;
    }
    Ok((out_min, out_max))
}

/// A `(min, max)` pair of bounds.
#[derive(Clone, Debug, PartialEq)]
pub struct Interval {
    pub min: Bound,
    pub max: Bound,
}

impl Interval {
    pub fn new(min: Bound, max: Bound) -> Self {
        Self { min, max }
    }

    pub fn scalar(min: f64, max: f64) -> Self {
        Self::new(scalar_bound(min), scalar_bound(max))
    }

    pub fn per_channel(min: Vec<f64>, max: Vec<f64>) -> Self {
        Self::new(vector_bound(min), vector_bound(max))
    }

    /// Degenerate interval holding a single known value.
    pub fn point(value: Bound) -> Self {
        Self::new(value.clone(), value)
    }

    pub fn is_scalar(&self) -> bool {
        self.min.ndim() == 0 && self.max.ndim() == 0
    }

    pub fn is_point(&self) -> bool {
        self.min == self.max
    }

    /// Collapse a channel-wise interval to a scalar one when every channel agrees.
    pub fn simplify(&self) -> Interval {
        if self.min.ndim() == 0 || self.max.ndim() == 0 || self.min.is_empty() || self.max.is_empty() {
            return self.clone();
        }
        let first_min = self.min.iter().next().copied();
        let first_max = self.max.iter().next().copied();
        match (first_min, first_max) {
            (Some(lo), Some(hi))
                if self.min.iter().all(|&x| x == lo) && self.max.iter().all(|&x| x == hi) =>
            {
                Interval::scalar(lo, hi)
            }
            _ => self.clone(),
        }
    }

    /// Channels whose interval collapsed to a single value, in channel order.
    pub fn stuck_channels(&self) -> Result<Vec<(usize, f64)>, IntervalError> {
        let eq = broadcast_zip(&self.min, &self.max, |lo, hi| if lo == hi { 1.0 } else { 0.0 })?;
        let lo = self.min.broadcast(eq.raw_dim()).ok_or_else(|| {
            IntervalError::BroadcastError(self.min.shape().to_vec(), eq.shape().to_vec())
        })?;
        Ok(eq
            .iter()
            .zip(lo.iter())
            .enumerate()
            .filter(|(_, (flag, _))| **flag == 1.0)
            .map(|(i, (_, value))| (i, *value))
            .collect())
    }

    /// `scale * x + bias` applied to both ends, without reordering.
    pub fn map_affine(&self, scale: &Bound, bias: &Bound) -> Result<Interval, IntervalError> {
        let min = broadcast_zip(&broadcast_zip(scale, &self.min, |s, x| s * x)?, bias, |a, b| a + b)?;
        let max = broadcast_zip(&broadcast_zip(scale, &self.max, |s, x| s * x)?, bias, |a, b| a + b)?;
        Ok(Interval::new(min, max))
    }
}

/// Serde helpers encoding a bound as a bare number or nested lists.
pub mod bound_serde {
    use super::{Bound, IntervalError};
    use ndarray::{ArrayD, IxDyn};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn to_value(bound: &Bound) -> Value {
        fn rec(view: ndarray::ArrayViewD<f64>) -> Value {
            if view.ndim() == 0 {
                let x = view[IxDyn(&[])];
                serde_json::Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
            } else {
                Value::Array(view.outer_iter().map(rec).collect())
            }
        }
        rec(bound.view())
    }

    pub fn from_value(value: &Value) -> Result<Bound, IntervalError> {
        fn rec(value: &Value, depth: usize, shape: &mut Vec<usize>, data: &mut Vec<f64>) -> Result<(), IntervalError> {
            match value {
                Value::Number(n) => {
                    if depth != shape.len() {
                        return Err(IntervalError::InvalidEncoding("ragged nesting".to_string()));
                    }
                    data.push(n.as_f64().unwrap_or(f64::NAN));
                    Ok(())
                }
                Value::Null if depth == shape.len() => {
                    data.push(f64::NAN);
                    Ok(())
                }
                Value::Array(items) => {
                    if depth == shape.len() && data.is_empty() {
                        shape.push(items.len());
                    } else if shape.get(depth) != Some(&items.len()) {
                        return Err(IntervalError::InvalidEncoding("ragged nesting".to_string()));
                    }
                    for item in items {
                        rec(item, depth + 1, shape, data)?;
                    }
                    Ok(())
                }
                other => Err(IntervalError::InvalidEncoding(format!("unexpected value {other}"))),
            }
        }
        let mut shape = vec![];
        let mut data = vec![];
        rec(value, 0, &mut shape, &mut data)?;
        ArrayD::from_shape_vec(IxDyn(&shape), data)
            .map_err(|e| IntervalError::InvalidEncoding(e.to_string()))
    }

    pub fn serialize<S: Serializer>(bound: &Bound, serializer: S) -> Result<S::Ok, S::Error> {
        to_value(bound).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bound, D::Error> {
        let value = Value::deserialize(deserializer)?;
        from_value(&value).map_err(D::Error::custom)
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&bound_serde::to_value(&self.min))?;
        tuple.serialize_element(&bound_serde::to_value(&self.max))?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (min, max) = <(serde_json::Value, serde_json::Value)>::deserialize(deserializer)?;
        Ok(Interval::new(
            bound_serde::from_value(&min).map_err(D::Error::custom)?,
            bound_serde::from_value(&max).map_err(D::Error::custom)?,
        ))
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.min, self.max)
    }
}
