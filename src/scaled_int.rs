//! Scaled-integer reconstruction.
//!
//! A second walk over a completed store that recovers, where possible, the
//! integer interval behind each real-valued range together with the affine
//! parameters linking them: `real = scale * integer + bias`.

use crate::dtype::DataType;
use crate::graph::Node;
use crate::interval::{Bound, Interval, broadcast_zip};
use crate::range_info::{IntegerInfo, RangeInfo, RangeStore};
use crate::rules::{AnyRangeRule, OpKind, RangeRule, RuleContext, RuleError, input_name, input_range};

pub trait IntegerRule {
    /// Attach integer info to the outputs of `node`. Returns `false` when the
    /// node was skipped for lack of integer info on its inputs.
    fn propagate(&self, ctx: &RuleContext, node: &Node, store: &mut RangeStore) -> Result<bool, RuleError>;
}

/// Scale and bias mapping `int_range` onto `real`.
///
/// A channel whose integer interval is a single point yields NaN.
fn match_affine(real: &Interval, int_range: &Interval) -> Result<(Bound, Bound), RuleError> {
    let real_span = broadcast_zip(&real.max, &real.min, |hi, lo| hi - lo)?;
    let int_span = broadcast_zip(&int_range.max, &int_range.min, |hi, lo| hi - lo)?;
    let scale = broadcast_zip(&real_span, &int_span, |r, i| r / i)?;
    let scaled_max = broadcast_zip(&scale, &int_range.max, |s, i| s * i)?;
    let bias = broadcast_zip(&real.max, &scaled_max, |r, s| r - s)?;
    Ok((scale, bias))
}

fn first_output(node: &Node) -> Result<&str, RuleError> {
    node.outputs
        .iter()
        .map(String::as_str)
        .find(|name| !name.is_empty())
        .ok_or_else(|| RuleError::MalformedOperand(node.name.clone(), "node has no outputs".to_string()))
}

fn output_range<'a>(node: &Node, store: &'a RangeStore, name: &str) -> Result<&'a RangeInfo, RuleError> {
    store
        .get(name)
        .ok_or_else(|| RuleError::MissingRange(node.name.clone(), name.to_string()))
}

/// Shape-only operators: integer info is copied from the single dynamic input.
#[derive(Clone, Debug, PartialEq)]
pub struct IdentityIntegerRule;

impl IntegerRule for IdentityIntegerRule {
    fn propagate(&self, ctx: &RuleContext, node: &Node, store: &mut RangeStore) -> Result<bool, RuleError> {
        let dynamic = ctx.graph.dynamic_inputs(node).len();
        if dynamic != 1 {
            return Err(RuleError::DynamicInputCount(node.name.clone(), dynamic));
        }
        let Some(integer) = input_range(node, store, 0)?.integer.clone() else {
            log::warn!("{} has no integer info on inputs, cannot propagate", node.name);
            return Ok(false);
        };
        for name in node.outputs.iter().filter(|x| !x.is_empty()) {
            store.attach_integer_info(name, integer.clone())?;
        }
        Ok(true)
    }
}

/// Quantizer with initializer scale, zero-point and bit width.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantIntegerRule;

impl QuantIntegerRule {
    fn initializer<'a>(ctx: &RuleContext<'a>, node: &Node, idx: usize) -> Result<&'a Bound, RuleError> {
        let name = input_name(node, idx)?;
        ctx.graph
            .get_initializer(name)
            .ok_or_else(|| RuleError::MissingInitializer(node.name.clone(), name.to_string()))
    }

    /// Integer datatype produced by the quantizer.
    fn integer_type(node: &Node, bitwidth: &Bound) -> Result<DataType, RuleError> {
        let malformed = |why: String| RuleError::MalformedOperand(node.name.clone(), why);
        if bitwidth.ndim() > 1 || bitwidth.len() != 1 {
            return Err(malformed(format!("bit width must be a single value, got shape {:?}", bitwidth.shape())));
        }
        let bits = bitwidth.iter().copied().next().unwrap_or(f64::NAN);
        if bits.fract() != 0.0 || bits < 1.0 {
            return Err(malformed(format!("bit width {} is not a positive integer", bits)));
        }
        let signed = node.attr_bool("signed").unwrap_or(true);
        match (bits as u32, signed) {
            (1, true) => Ok(DataType::Bipolar),
            (1, false) => Ok(DataType::Binary),
            (bits, signed) => DataType::int(bits, signed).map_err(|e| malformed(e.to_string())),
        }
    }
}

impl IntegerRule for QuantIntegerRule {
    fn propagate(&self, ctx: &RuleContext, node: &Node, store: &mut RangeStore) -> Result<bool, RuleError> {
        let scale = Self::initializer(ctx, node, 1)?;
        let zeropt = Self::initializer(ctx, node, 2)?;
        let bitwidth = Self::initializer(ctx, node, 3)?;
        let out_name = first_output(node)?;
        let out = output_range(node, store, out_name)?;

        // S * (q - Z) = S * q + (-S * Z)
        let bias = broadcast_zip(scale, zeropt, |s, z| -(s * z))?;
        let int_range = if out.is_initializer {
            if !out.range.is_point() {
                return Err(RuleError::NonConstantOperand(node.name.clone(), out_name.to_string()));
            }
            let q = broadcast_zip(&out.range.min, scale, |x, s| x / s)?;
            Interval::point(broadcast_zip(&q, zeropt, |q, z| (q + z).round_ties_even())?)
        } else {
            let dtype = Self::integer_type(node, bitwidth)?;
            let narrow = node.attr_bool("narrow").unwrap_or(false);
            let adjust = if narrow && dtype.signed() { 1.0 } else { 0.0 };
            Interval::scalar(dtype.min() + adjust, dtype.max())
        };

        store.attach_integer_info(
            out_name,
            IntegerInfo {
                int_range,
                scale: scale.clone(),
                bias,
            },
        )?;
        Ok(true)
    }
}

/// ReLU keeps the scale and bias of its integer-bearing input.
#[derive(Clone, Debug, PartialEq)]
pub struct ReluIntegerRule;

impl IntegerRule for ReluIntegerRule {
    fn propagate(&self, _ctx: &RuleContext, node: &Node, store: &mut RangeStore) -> Result<bool, RuleError> {
        let source = node
            .inputs
            .iter()
            .filter(|name| !name.is_empty())
            .find_map(|name| store.get(name).and_then(|info| info.integer.clone()));
        let Some(source) = source else {
            log::warn!("{} has no integer info on inputs, cannot propagate", node.name);
            return Ok(false);
        };
        let out_name = first_output(node)?;
        let out = output_range(node, store, out_name)?;

        let invert = |real: &Bound| -> Result<Bound, RuleError> {
            let shifted = broadcast_zip(real, &source.bias, |r, b| r - b)?;
            Ok(broadcast_zip(&shifted, &source.scale, |x, s| (x / s).round_ties_even())?)
        };
        let int_range = Interval::new(invert(&out.range.min)?, invert(&out.range.max)?);

        store.attach_integer_info(
            out_name,
            IntegerInfo {
                int_range,
                scale: source.scale,
                bias: source.bias,
            },
        )?;
        Ok(true)
    }
}

/// Linear operators: the real-valued rule is rerun on integer intervals when
/// every input is integer-bearing, otherwise the informative input's integer
/// interval is carried through.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearIntegerRule;

impl LinearIntegerRule {
    fn integer_output(ctx: &RuleContext, node: &Node, inputs: &[(&str, &RangeInfo)]) -> Result<Interval, RuleError> {
        let mut int_store = RangeStore::new();
        for &(name, info) in inputs {
            let Some(integer) = &info.integer else {
                continue;
            };
            if integer.scale.iter().any(|&s| !(s >= 0.0)) {
                return Err(RuleError::NegativeScale(node.name.clone(), name.to_string()));
            }
            if integer.bias.iter().any(|&b| b != 0.0) {
                return Err(RuleError::NonZeroBias(node.name.clone(), name.to_string()));
            }
            if !int_store.contains(name) {
                int_store.insert(
                    name,
                    RangeInfo {
                        range: integer.int_range.clone(),
                        integer: None,
                        is_initializer: info.is_initializer,
                    },
                )?;
            }
        }
        let rule = AnyRangeRule::from_node(node)?.ok_or_else(|| {
            RuleError::UnsupportedConfiguration(node.name.clone(), format!("no range rule for {}", node.op_type))
        })?;
        rule.compute(ctx, node, &int_store)?
            .into_iter()
            .next()
            .map(|info| info.range)
            .ok_or_else(|| RuleError::MalformedOperand(node.name.clone(), "node has no outputs".to_string()))
    }
}

impl IntegerRule for LinearIntegerRule {
    fn propagate(&self, ctx: &RuleContext, node: &Node, store: &mut RangeStore) -> Result<bool, RuleError> {
        let inputs = node
            .inputs
            .iter()
            .filter(|name| !name.is_empty())
            .map(|name| {
                store
                    .get(name)
                    .map(|info| (name.as_str(), info))
                    .ok_or_else(|| RuleError::MissingRange(node.name.clone(), name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let int_range = if inputs.iter().all(|(_, info)| info.has_integer_info()) {
            Self::integer_output(ctx, node, &inputs)?
        } else {
            match inputs.iter().find_map(|(_, info)| info.integer.as_ref()) {
                Some(integer) => integer.int_range.clone(),
                None => {
                    log::warn!("{} has no integer info on inputs, cannot propagate", node.name);
                    return Ok(false);
                }
            }
        };

        let out_name = first_output(node)?;
        let out = output_range(node, store, out_name)?;
        let (scale, bias) = match_affine(&out.range, &int_range)?;
        store.attach_integer_info(out_name, IntegerInfo { int_range, scale, bias })?;
        Ok(true)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AnyIntegerRule {
    Identity(IdentityIntegerRule),
    Quant(QuantIntegerRule),
    Relu(ReluIntegerRule),
    Linear(LinearIntegerRule),
}

impl AnyIntegerRule {
    pub fn for_kind(kind: &OpKind) -> Option<Self> {
        match kind {
            OpKind::Conv | OpKind::MatMul | OpKind::BatchNormalization | OpKind::Add => {
                Some(AnyIntegerRule::Linear(LinearIntegerRule))
            }
            OpKind::Relu => Some(AnyIntegerRule::Relu(ReluIntegerRule)),
            OpKind::Quant => Some(AnyIntegerRule::Quant(QuantIntegerRule)),
            OpKind::Pad | OpKind::MaxPool | OpKind::Reshape => Some(AnyIntegerRule::Identity(IdentityIntegerRule)),
            _ => None,
        }
    }
}

impl IntegerRule for AnyIntegerRule {
    fn propagate(&self, ctx: &RuleContext, node: &Node, store: &mut RangeStore) -> Result<bool, RuleError> {
        match self {
            AnyIntegerRule::Identity(x) => x.propagate(ctx, node, store),
            AnyIntegerRule::Quant(x) => x.propagate(ctx, node, store),
            AnyIntegerRule::Relu(x) => x.propagate(ctx, node, store),
            AnyIntegerRule::Linear(x) => x.propagate(ctx, node, store),
        }
    }
}

/// Walk the graph once more and attach integer info where it can be derived.
/// Returns the names of the nodes that were skipped.
pub fn reconstruct_integer_ranges(ctx: &RuleContext, store: &mut RangeStore) -> Result<Vec<String>, RuleError> {
    let mut skipped = vec![];
    for node in ctx.graph.nodes() {
        let Some(rule) = AnyIntegerRule::for_kind(&node.op_kind()) else {
            log::warn!("Skipping {} : no integer rule for {}", node.name, node.op_type);
            skipped.push(node.name.clone());
            continue;
        };
        if let Some(missing) = node.outputs.iter().find(|name| !name.is_empty() && !store.contains(name)) {
            log::warn!("Skipping {} : no range info for output {}", node.name, missing);
            skipped.push(node.name.clone());
            continue;
        }
        if !rule.propagate(ctx, node, store)? {
            skipped.push(node.name.clone());
        }
    }
    log::info!(
        "Scaled-integer pass skipped {} of {} nodes",
        skipped.len(),
        ctx.graph.nodes().len()
    );
    Ok(skipped)
}
