use super::{RangeRule, RuleContext, RuleError, constant_operand, input_name, input_range};
use crate::graph::Node;
use crate::interval::{Bound, Interval, IntervalError, broadcast_zip, matvec_extremum, vector_bound};
use crate::range_info::{RangeInfo, RangeStore};
use ndarray::{Array1, Array2, ArrayView2, Ix2, IxDyn, Slice, s};

fn matrix_operand(node: &Node, weight: Bound, what: &str) -> Result<Array2<f64>, RuleError> {
    let ndim = weight.ndim();
    weight.into_dimensionality::<Ix2>().map_err(|_| {
        RuleError::MalformedOperand(node.name.clone(), format!("{} must be 2-D, got rank {}", what, ndim))
    })
}

fn single_output(node: &Node, range: Interval) -> Vec<RangeInfo> {
    node.outputs.iter().map(|_| RangeInfo::new(range.clone())).collect()
}

/// Fully-connected layer (`Gemm`) with constant weight and optional constant bias.
#[derive(Clone, Debug, PartialEq)]
pub struct DenseRule {
    alpha: f64,
    beta: f64,
}

impl DenseRule {
    pub fn from_node(node: &Node) -> Result<Self, RuleError> {
        let trans_a = node.attr_bool("transA").unwrap_or(false);
        let trans_b = node.attr_bool("transB").unwrap_or(true);
        if trans_a || !trans_b {
            return Err(RuleError::UnsupportedConfiguration(
                node.name.clone(),
                format!("Gemm with transA={} transB={}", trans_a as u8, trans_b as u8),
            ));
        }
        Ok(Self {
            alpha: node.attr_float("alpha").unwrap_or(1.0),
            beta: node.attr_float("beta").unwrap_or(1.0),
        })
    }
}

impl RangeRule for DenseRule {
    fn compute(&self, _ctx: &RuleContext, node: &Node, store: &RangeStore) -> Result<Vec<RangeInfo>, RuleError> {
        let input = input_range(node, store, 0)?;
        let weight = matrix_operand(node, constant_operand(node, store, 1)?, "Gemm weight")?;

        let (lo, hi) = matvec_extremum(weight.view(), &input.range.min, &input.range.max)?;
        let (lo, hi) = (lo * self.alpha, hi * self.alpha);
        let (lo, hi) = if self.alpha < 0.0 { (hi, lo) } else { (lo, hi) };
        let (mut lo, mut hi) = (lo.into_dyn(), hi.into_dyn());

        if node.input(2).is_some() {
            let bias = constant_operand(node, store, 2)?;
            if bias.ndim() != 1 {
                return Err(RuleError::MalformedOperand(
                    node.name.clone(),
                    format!("Gemm bias must be 1-D, got shape {:?}", bias.shape()),
                ));
            }
            let beta = self.beta;
            lo = broadcast_zip(&lo, &bias, |x, b| x + beta * b)?;
            hi = broadcast_zip(&hi, &bias, |x, b| x + beta * b)?;
        }
        Ok(single_output(node, Interval::new(lo, hi)))
    }
}

/// Generic matrix multiply `x · W`: the kernel runs on `Wᵀ`.
#[derive(Clone, Debug, PartialEq)]
pub struct MatMulRule;

impl RangeRule for MatMulRule {
    fn compute(&self, _ctx: &RuleContext, node: &Node, store: &RangeStore) -> Result<Vec<RangeInfo>, RuleError> {
        let input = input_range(node, store, 0)?;
        let weight = matrix_operand(node, constant_operand(node, store, 1)?, "MatMul weight")?;
        let (lo, hi) = matvec_extremum(weight.t(), &input.range.min, &input.range.max)?;
        Ok(single_output(node, Interval::new(lo.into_dyn(), hi.into_dyn())))
    }
}

/// Repeat every element of a per-channel bound `k` times; scalars pass through.
fn replicate(node: &Node, name: &str, bound: &Bound, k: usize, weight_shape: &[usize]) -> Result<Bound, RuleError> {
    match bound.ndim() {
        0 => Ok(bound.clone()),
        1 => Ok(vector_bound(
            bound.iter().flat_map(|&x| std::iter::repeat_n(x, k)).collect(),
        )),
        _ => Err(RuleError::UnrecognizedRange(
            node.name.clone(),
            name.to_string(),
            bound.shape().to_vec(),
            weight_shape.to_vec(),
        )),
    }
}

fn channel_slice(bound: &Bound, channel: usize, k: usize) -> Result<Bound, IntervalError> {
    if bound.ndim() == 0 {
        return Ok(bound.clone());
    }
    if (channel + 1) * k > bound.len() {
        return Err(IntervalError::LengthMismatch(k, bound.shape().to_vec()));
    }
    Ok(bound
        .slice_axis(ndarray::Axis(0), Slice::from(channel * k..(channel + 1) * k))
        .to_owned())
}

/// Evaluate the kernel row by row. With `depthwise`, row `i` only sees the
/// replicated bound slice of input channel `i`.
fn per_output_channel(
    node: &Node,
    matrix: ArrayView2<f64>,
    input: &Interval,
    k_total: usize,
    depthwise: bool,
    weight_shape: &[usize],
) -> Result<Interval, RuleError> {
    let name = input_name(node, 0)?;
    let vmin = replicate(node, name, &input.min, k_total, weight_shape)?;
    let vmax = replicate(node, name, &input.max, k_total, weight_shape)?;

    let mut out_min = Vec::with_capacity(matrix.nrows());
    let mut out_max = Vec::with_capacity(matrix.nrows());
    for i in 0..matrix.nrows() {
        let row = matrix.slice(s![i..i + 1, ..]);
        let (lo, hi) = if depthwise {
            matvec_extremum(
                row,
                &channel_slice(&vmin, i, k_total)?,
                &channel_slice(&vmax, i, k_total)?,
            )?
        } else {
            matvec_extremum(row, &vmin, &vmax)?
        };
        out_min.push(lo[0]);
        out_max.push(hi[0]);
    }
    Ok(Interval::new(
        Array1::from(out_min).into_dyn(),
        Array1::from(out_max).into_dyn(),
    ))
}

fn group_attribute(node: &Node) -> Result<usize, RuleError> {
    let group = node.attr_int("group").unwrap_or(1);
    if group < 1 {
        return Err(RuleError::UnsupportedConfiguration(node.name.clone(), format!("group={}", group)));
    }
    Ok(group as usize)
}

fn reject_bias(node: &Node) -> Result<(), RuleError> {
    if node.input(2).is_some() {
        return Err(RuleError::UnsupportedConfiguration(
            node.name.clone(),
            format!("{} with bias", node.op_type),
        ));
    }
    Ok(())
}

fn conv_weight(node: &Node, store: &RangeStore) -> Result<Bound, RuleError> {
    let weight = constant_operand(node, store, 1)?;
    if weight.ndim() < 2 || weight.shape()[0] == 0 || weight.shape()[1] == 0 {
        return Err(RuleError::MalformedOperand(
            node.name.clone(),
            format!("{} weight shape {:?}", node.op_type, weight.shape()),
        ));
    }
    Ok(weight)
}

/// Convolution without bias; dense or fully depthwise.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvRule {
    group: usize,
}

impl ConvRule {
    pub fn from_node(node: &Node) -> Result<Self, RuleError> {
        reject_bias(node)?;
        Ok(Self {
            group: group_attribute(node)?,
        })
    }
}

impl RangeRule for ConvRule {
    fn compute(&self, _ctx: &RuleContext, node: &Node, store: &RangeStore) -> Result<Vec<RangeInfo>, RuleError> {
        let input = input_range(node, store, 0)?;
        let weight = conv_weight(node, store)?;
        let (ofm, ifm) = (weight.shape()[0], weight.shape()[1]);
        let depthwise = self.group > 1;
        if depthwise && self.group != ofm {
            return Err(RuleError::UnsupportedConfiguration(
                node.name.clone(),
                format!("grouped Conv with group={} and {} output channels", self.group, ofm),
            ));
        }

        // (ofm, ifm, k0, k1, ..) -> (ofm, ifm * k0 * k1 * ..)
        let cols = weight.len() / ofm;
        let matrix = weight.to_shape((ofm, cols))?;
        let k_total = cols / ifm;

        let range = per_output_channel(node, matrix.view(), &input.range, k_total, depthwise, weight.shape())?;
        Ok(single_output(node, range))
    }
}

/// Ungrouped transposed convolution without bias.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvTransposeRule;

impl ConvTransposeRule {
    pub fn from_node(node: &Node) -> Result<Self, RuleError> {
        reject_bias(node)?;
        let group = group_attribute(node)?;
        if group != 1 {
            return Err(RuleError::UnsupportedConfiguration(
                node.name.clone(),
                format!("grouped ConvTranspose with group={}", group),
            ));
        }
        Ok(Self)
    }
}

impl RangeRule for ConvTransposeRule {
    fn compute(&self, _ctx: &RuleContext, node: &Node, store: &RangeStore) -> Result<Vec<RangeInfo>, RuleError> {
        let input = input_range(node, store, 0)?;
        let weight = conv_weight(node, store)?;
        let (ifm, ofm) = (weight.shape()[0], weight.shape()[1]);

        // (ifm, ofm, k..) -> (ofm, ifm, k..) -> (ofm, ifm * k..)
        let mut perm: Vec<usize> = (0..weight.ndim()).collect();
        perm.swap(0, 1);
        let swapped = weight.view().permuted_axes(IxDyn(&perm));
        let cols = weight.len() / ofm;
        let matrix = swapped.to_shape((ofm, cols))?;
        let k_total = cols / ifm;

        let range = per_output_channel(node, matrix.view(), &input.range, k_total, false, weight.shape())?;
        Ok(single_output(node, range))
    }
}
