use super::ops::{self, PoolKind, normalize_axis};
use super::{EvalError, NodeEvaluator};
use crate::dtype::DataType;
use crate::graph::{Graph, Node};
use crate::interval::broadcast_zip;
use ndarray::{ArrayD, Ix2, IxDyn};

/// Built-in evaluator for the operators found in quantized feed-forward
/// networks. Every tensor is carried as `f64`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceEvaluator;

fn required<'a>(node: &Node, inputs: &[Option<&'a ArrayD<f64>>], idx: usize) -> Result<&'a ArrayD<f64>, EvalError> {
    inputs
        .get(idx)
        .copied()
        .flatten()
        .ok_or_else(|| EvalError::MissingInput(node.name.clone(), idx))
}

fn optional<'a>(inputs: &[Option<&'a ArrayD<f64>>], idx: usize) -> Option<&'a ArrayD<f64>> {
    inputs.get(idx).copied().flatten()
}

fn as_i64s(tensor: &ArrayD<f64>) -> Vec<i64> {
    tensor.iter().map(|&x| x as i64).collect()
}

fn single_value(node: &Node, tensor: &ArrayD<f64>, what: &str) -> Result<f64, EvalError> {
    match tensor.iter().next() {
        Some(&x) if tensor.len() == 1 => Ok(x),
        _ => Err(EvalError::InvalidInput(
            node.name.clone(),
            format!("{} must hold a single value, got shape {:?}", what, tensor.shape()),
        )),
    }
}

fn unary(x: &ArrayD<f64>, f: impl Fn(f64) -> f64) -> ArrayD<f64> {
    x.mapv(f)
}

/// Reshape a per-channel parameter so it broadcasts against a rank-`rank`
/// tensor along `axis`. Scalars and single-element tensors pass through.
fn along_axis(param: &ArrayD<f64>, rank: usize, axis: usize) -> Result<ArrayD<f64>, EvalError> {
    if param.len() <= 1 || param.ndim() != 1 {
        return Ok(param.clone());
    }
    let mut shape = vec![1; rank];
    shape[axis] = param.len();
    Ok(param.to_shape(IxDyn(&shape))?.into_owned())
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum RoundingMode {
    Round,
    Floor,
    Ceil,
    RoundToZero,
}

impl RoundingMode {
    fn parse(node: &Node) -> Result<Self, EvalError> {
        let mode = node.attr_string("rounding_mode").unwrap_or_else(|| "ROUND".to_string());
        match mode.to_uppercase().as_str() {
            "ROUND" => Ok(Self::Round),
            "FLOOR" => Ok(Self::Floor),
            "CEIL" => Ok(Self::Ceil),
            "ROUND_TO_ZERO" => Ok(Self::RoundToZero),
            other => Err(EvalError::UnsupportedAttribute(
                node.name.clone(),
                format!("rounding_mode={}", other),
            )),
        }
    }

    fn apply(self, x: f64) -> f64 {
        match self {
            Self::Round => x.round_ties_even(),
            Self::Floor => x.floor(),
            Self::Ceil => x.ceil(),
            Self::RoundToZero => x.trunc(),
        }
    }
}

fn quant(node: &Node, inputs: &[Option<&ArrayD<f64>>]) -> Result<ArrayD<f64>, EvalError> {
    let x = required(node, inputs, 0)?;
    let scale = required(node, inputs, 1)?;
    let zeropt = required(node, inputs, 2)?;
    let bitwidth = single_value(node, required(node, inputs, 3)?, "bit width")?;
    let signed = node.attr_bool("signed").unwrap_or(true);
    let narrow = node.attr_bool("narrow").unwrap_or(false);
    let rounding = RoundingMode::parse(node)?;

    let narrow = if narrow { 1.0 } else { 0.0 };
    let (lo, hi) = if signed {
        (-(2f64.powf(bitwidth - 1.0)) + narrow, 2f64.powf(bitwidth - 1.0) - 1.0)
    } else {
        (0.0, 2f64.powf(bitwidth) - 1.0 - narrow)
    };

    // 1. Scale into the integer domain
    let q = broadcast_zip(&broadcast_zip(x, scale, |x, s| x / s)?, zeropt, |q, z| q + z)?;
    // 2. Clip, then round
    let q = q.mapv(|v| rounding.apply(v.clamp(lo, hi)));
    // 3. Back to the real domain
    Ok(broadcast_zip(&broadcast_zip(&q, zeropt, |q, z| q - z)?, scale, |q, s| q * s)?)
}

fn bipolar_quant(node: &Node, inputs: &[Option<&ArrayD<f64>>]) -> Result<ArrayD<f64>, EvalError> {
    let x = required(node, inputs, 0)?;
    let scale = required(node, inputs, 1)?;
    let sign = broadcast_zip(x, scale, |x, s| if x / s >= 0.0 { 1.0 } else { -1.0 })?;
    Ok(broadcast_zip(&sign, scale, |v, s| v * s)?)
}

fn linear_quant_params(
    node: &Node,
    inputs: &[Option<&ArrayD<f64>>],
    graph: &Graph,
    rank: usize,
) -> Result<(ArrayD<f64>, ArrayD<f64>, DataType), EvalError> {
    let axis = normalize_axis(node.attr_int("axis").unwrap_or(1), rank.max(1))?;
    let scale = along_axis(required(node, inputs, 1)?, rank, axis)?;
    let (zero_point, dtype) = match optional(inputs, 2) {
        Some(zp) => {
            let dtype = node
                .input(2)
                .and_then(|name| graph.dtype(name))
                .unwrap_or(DataType::UInt(8));
            (along_axis(zp, rank, axis)?, dtype)
        }
        None => (ArrayD::zeros(IxDyn(&[])), DataType::UInt(8)),
    };
    Ok((scale, zero_point, dtype))
}

fn quantize_linear(node: &Node, inputs: &[Option<&ArrayD<f64>>], graph: &Graph) -> Result<ArrayD<f64>, EvalError> {
    let x = required(node, inputs, 0)?;
    let (scale, zero_point, dtype) = linear_quant_params(node, inputs, graph, x.ndim())?;
    let (lo, hi) = (dtype.min(), dtype.max());
    let q = broadcast_zip(x, &scale, |x, s| (x / s).round_ties_even())?;
    Ok(broadcast_zip(&q, &zero_point, |q, z| (q + z).clamp(lo, hi))?)
}

fn dequantize_linear(node: &Node, inputs: &[Option<&ArrayD<f64>>], graph: &Graph) -> Result<ArrayD<f64>, EvalError> {
    let x = required(node, inputs, 0)?;
    let (scale, zero_point, _) = linear_quant_params(node, inputs, graph, x.ndim())?;
    let shifted = broadcast_zip(x, &zero_point, |x, z| x - z)?;
    Ok(broadcast_zip(&shifted, &scale, |x, s| x * s)?)
}

fn batch_normalization(node: &Node, inputs: &[Option<&ArrayD<f64>>]) -> Result<ArrayD<f64>, EvalError> {
    let x = required(node, inputs, 0)?;
    let rank = x.ndim();
    if rank < 2 {
        return Err(EvalError::InvalidInput(node.name.clone(), "input rank below 2".to_string()));
    }
    let epsilon = node.attr_float("epsilon").unwrap_or(1e-5);
    let param = |idx: usize| -> Result<ArrayD<f64>, EvalError> { along_axis(required(node, inputs, idx)?, rank, 1) };
    let (gamma, beta, mean, var) = (param(1)?, param(2)?, param(3)?, param(4)?);

    let inv_std = var.mapv(|v| 1.0 / (v + epsilon).sqrt());
    let centered = broadcast_zip(x, &mean, |x, m| x - m)?;
    let normalized = broadcast_zip(&centered, &inv_std, |x, s| x * s)?;
    let scaled = broadcast_zip(&normalized, &gamma, |x, g| x * g)?;
    Ok(broadcast_zip(&scaled, &beta, |x, b| x + b)?)
}

fn split(node: &Node, inputs: &[Option<&ArrayD<f64>>]) -> Result<Vec<ArrayD<f64>>, EvalError> {
    let x = required(node, inputs, 0)?;
    let axis = normalize_axis(node.attr_int("axis").unwrap_or(0), x.ndim())?;
    let sizes: Vec<usize> = match optional(inputs, 1) {
        Some(sizes) => as_i64s(sizes).into_iter().map(|s| s.max(0) as usize).collect(),
        None => match node.attr_ints("split") {
            Some(sizes) => sizes.into_iter().map(|s| s.max(0) as usize).collect(),
            None => ops::even_split_sizes(x.shape()[axis], node.outputs.len()),
        },
    };
    Ok(ops::split(x, axis, &sizes)?)
}

fn pad(node: &Node, inputs: &[Option<&ArrayD<f64>>]) -> Result<ArrayD<f64>, EvalError> {
    let x = required(node, inputs, 0)?;
    if let Some(mode) = node.attr_string("mode") {
        if mode != "constant" {
            return Err(EvalError::UnsupportedAttribute(node.name.clone(), format!("mode={}", mode)));
        }
    }
    let pads = match optional(inputs, 1) {
        Some(p) => as_i64s(p),
        None => node
            .attr_ints("pads")
            .ok_or_else(|| EvalError::MissingInput(node.name.clone(), 1))?,
    };
    let value = match optional(inputs, 2) {
        Some(v) => single_value(node, v, "constant_value")?,
        None => node.attr_float("value").unwrap_or(0.0),
    };
    Ok(ops::pad_constant(x, &pads, value)?)
}

fn pool(node: &Node, inputs: &[Option<&ArrayD<f64>>], kind: PoolKind) -> Result<ArrayD<f64>, EvalError> {
    let x = required(node, inputs, 0)?;
    if let Some(auto_pad) = node.attr_string("auto_pad") {
        if auto_pad != "NOTSET" && auto_pad != "VALID" {
            return Err(EvalError::UnsupportedAttribute(node.name.clone(), format!("auto_pad={}", auto_pad)));
        }
    }
    if node.attr_bool("ceil_mode").unwrap_or(false) {
        return Err(EvalError::UnsupportedAttribute(node.name.clone(), "ceil_mode=1".to_string()));
    }
    let kernel: Vec<usize> = node
        .attr_ints("kernel_shape")
        .ok_or_else(|| EvalError::InvalidInput(node.name.clone(), "missing kernel_shape".to_string()))?
        .into_iter()
        .map(|k| k as usize)
        .collect();
    let spatial = kernel.len();
    let strides: Vec<usize> = node
        .attr_ints("strides")
        .map(|s| s.into_iter().map(|v| v as usize).collect())
        .unwrap_or_else(|| vec![1; spatial]);
    let pads: Vec<usize> = node
        .attr_ints("pads")
        .map(|p| p.into_iter().map(|v| v.max(0) as usize).collect())
        .unwrap_or_else(|| vec![0; 2 * spatial]);
    Ok(ops::pool(x, kind, &kernel, &strides, &pads)?)
}

fn resize(node: &Node, inputs: &[Option<&ArrayD<f64>>]) -> Result<ArrayD<f64>, EvalError> {
    let x = required(node, inputs, 0)?;
    let mode = node.attr_string("mode").unwrap_or_else(|| "nearest".to_string());
    if mode != "nearest" {
        return Err(EvalError::UnsupportedAttribute(node.name.clone(), format!("mode={}", mode)));
    }
    let scales: Vec<f64> = if node.op_type == "Upsample" {
        match optional(inputs, 1) {
            Some(s) => s.iter().copied().collect(),
            None => node
                .attr_floats("scales")
                .ok_or_else(|| EvalError::MissingInput(node.name.clone(), 1))?,
        }
    } else {
        match (optional(inputs, 2), optional(inputs, 3)) {
            (Some(s), _) if !s.is_empty() => s.iter().copied().collect(),
            (_, Some(sizes)) => sizes
                .iter()
                .zip(x.shape())
                .map(|(&size, &dim)| size / dim as f64)
                .collect(),
            _ => return Err(EvalError::MissingInput(node.name.clone(), 2)),
        }
    };
    Ok(ops::resize_nearest(x, &scales)?)
}

fn gemm(node: &Node, inputs: &[Option<&ArrayD<f64>>]) -> Result<ArrayD<f64>, EvalError> {
    let a = required(node, inputs, 0)?.view().into_dimensionality::<Ix2>()?;
    let b = required(node, inputs, 1)?.view().into_dimensionality::<Ix2>()?;
    let alpha = node.attr_float("alpha").unwrap_or(1.0);
    let beta = node.attr_float("beta").unwrap_or(1.0);
    let a = if node.attr_bool("transA").unwrap_or(false) { a.reversed_axes() } else { a };
    let b = if node.attr_bool("transB").unwrap_or(false) { b.reversed_axes() } else { b };
    if a.ncols() != b.nrows() {
        return Err(EvalError::InvalidInput(
            node.name.clone(),
            format!("cannot multiply {:?} by {:?}", a.shape(), b.shape()),
        ));
    }
    let product = (a.dot(&b) * alpha).into_dyn();
    match optional(inputs, 2) {
        Some(c) => Ok(broadcast_zip(&product, c, |p, c| p + beta * c)?),
        None => Ok(product),
    }
}

fn constant(node: &Node) -> Result<ArrayD<f64>, EvalError> {
    if let Some(x) = node.attr_float("value_float") {
        return Ok(ArrayD::from_elem(IxDyn(&[]), x));
    }
    if let Some(x) = node.attr_int("value_int") {
        return Ok(ArrayD::from_elem(IxDyn(&[]), x as f64));
    }
    for name in ["value_floats", "value_ints", "value"] {
        if let Some(values) = node.attr_floats(name) {
            return Ok(ArrayD::from_shape_vec(IxDyn(&[values.len()]), values)?);
        }
    }
    Err(EvalError::InvalidInput(node.name.clone(), "constant without a value".to_string()))
}

impl NodeEvaluator for ReferenceEvaluator {
    fn evaluate(
        &self,
        node: &Node,
        inputs: &[Option<&ArrayD<f64>>],
        graph: &Graph,
    ) -> Result<Vec<ArrayD<f64>>, EvalError> {
        let binary = |f: fn(f64, f64) -> f64| -> Result<Vec<ArrayD<f64>>, EvalError> {
            let a = required(node, inputs, 0)?;
            let b = required(node, inputs, 1)?;
            Ok(vec![broadcast_zip(a, b, f)?])
        };

        let out = match node.op_type.as_str() {
            "Identity" => required(node, inputs, 0)?.clone(),
            "Relu" => unary(required(node, inputs, 0)?, |x| x.max(0.0)),
            "Sigmoid" => unary(required(node, inputs, 0)?, |x| 1.0 / (1.0 + (-x).exp())),
            "Clip" => {
                let lo = match optional(inputs, 1) {
                    Some(v) => single_value(node, v, "min")?,
                    None => node.attr_float("min").unwrap_or(f64::NEG_INFINITY),
                };
                let hi = match optional(inputs, 2) {
                    Some(v) => single_value(node, v, "max")?,
                    None => node.attr_float("max").unwrap_or(f64::INFINITY),
                };
                unary(required(node, inputs, 0)?, |x| x.max(lo).min(hi))
            }
            "Add" => return binary(|a, b| a + b),
            "Sub" => return binary(|a, b| a - b),
            "Mul" => return binary(|a, b| a * b),
            "Div" => return binary(|a, b| a / b),
            "Quant" => quant(node, inputs)?,
            "BipolarQuant" => bipolar_quant(node, inputs)?,
            "QuantizeLinear" => quantize_linear(node, inputs, graph)?,
            "DequantizeLinear" => dequantize_linear(node, inputs, graph)?,
            "BatchNormalization" => batch_normalization(node, inputs)?,
            "Reshape" => {
                let shape = as_i64s(required(node, inputs, 1)?);
                ops::reshape(required(node, inputs, 0)?, &shape)?
            }
            "Flatten" => ops::flatten(required(node, inputs, 0)?, node.attr_int("axis").unwrap_or(1))?,
            "Transpose" => ops::transpose(required(node, inputs, 0)?, node.attr_ints("perm"))?,
            "Concat" => {
                let parts: Vec<&ArrayD<f64>> = inputs.iter().flatten().copied().collect();
                let rank = parts.first().map(|p| p.ndim()).unwrap_or(0);
                let axis = node
                    .attr_int("axis")
                    .ok_or_else(|| EvalError::InvalidInput(node.name.clone(), "missing axis".to_string()))?;
                ops::concat(normalize_axis(axis, rank)?, &parts)?
            }
            "Split" => return split(node, inputs),
            "Pad" => pad(node, inputs)?,
            "MaxPool" => pool(node, inputs, PoolKind::Max)?,
            "AveragePool" => pool(
                node,
                inputs,
                PoolKind::Average {
                    count_include_pad: node.attr_bool("count_include_pad").unwrap_or(false),
                },
            )?,
            "GlobalAveragePool" => ops::global_average_pool(required(node, inputs, 0)?)?,
            "Resize" | "Upsample" => resize(node, inputs)?,
            "MatMul" => ops::matmul(required(node, inputs, 0)?, required(node, inputs, 1)?)?,
            "Gemm" => gemm(node, inputs)?,
            "Constant" => constant(node)?,
            other => return Err(EvalError::UnsupportedOperator(other.to_string())),
        };
        Ok(vec![out])
    }
}
