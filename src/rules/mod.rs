//! Operator rule set: how each operator kind maps input ranges to output ranges.

mod affine;
mod monotonic;

pub use affine::{ConvRule, ConvTransposeRule, DenseRule, MatMulRule};
pub use monotonic::{DeclaredRangeRule, MonotonicRule};

use crate::evaluator::{EvalError, NodeEvaluator};
use crate::graph::{Graph, Node};
use crate::interval::IntervalError;
use crate::range_info::{RangeInfo, RangeStore, RangeStoreError};
use ndarray::ArrayD;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Node {0}: non-constant operand \"{1}\"")]
    NonConstantOperand(String, String),
    #[error("Node {0}: unsupported configuration: {1}")]
    UnsupportedConfiguration(String, String),
    #[error("Node {0}: cannot infer range of \"{1}\", dtype annotation is missing")]
    MissingDataType(String, String),
    #[error("Node {0}: unrecognized range representation for \"{1}\" (bound shape {2:?}, tensor shape {3:?})")]
    UnrecognizedRange(String, String, Vec<usize>, Vec<usize>),
    #[error("Node {0}: no range info for input \"{1}\"")]
    MissingRange(String, String),
    #[error("Node {0}: shape of \"{1}\" is unknown")]
    MissingShape(String, String),
    #[error("Node {0}: missing input {1}")]
    MissingInput(String, usize),
    #[error("Node {0}: \"{1}\" must be an initializer")]
    MissingInitializer(String, String),
    #[error("Node {0}: input \"{1}\" needs a nonnegative scale")]
    NegativeScale(String, String),
    #[error("Node {0}: input \"{1}\" needs a zero bias")]
    NonZeroBias(String, String),
    #[error("Node {0}: expected a single dynamic input, found {1}")]
    DynamicInputCount(String, usize),
    #[error("Node {0}: malformed operand: {1}")]
    MalformedOperand(String, String),
    #[error("Node {0}: channel axis {1} out of range for rank {2}")]
    ChannelAxisOutOfRange(String, usize, usize),
    #[error("Node {0}: evaluation failed: {1}")]
    EvalError(String, #[source] EvalError),
    #[error(transparent)]
    IntervalError(#[from] IntervalError),
    #[error(transparent)]
    RangeStoreError(#[from] RangeStoreError),
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
}

/// Operator kinds known to either analysis pass.
#[derive(Clone, Debug, PartialEq, Eq, Hash, strum_macros::EnumString)]
pub enum OpKind {
    Gemm,
    MatMul,
    Conv,
    ConvTranspose,
    Trunc,
    QuantMaxNorm,
    Transpose,
    Flatten,
    Reshape,
    Quant,
    BipolarQuant,
    Mul,
    Sub,
    Div,
    Add,
    BatchNormalization,
    Relu,
    Pad,
    AveragePool,
    MaxPool,
    Resize,
    Upsample,
    GlobalAveragePool,
    QuantizeLinear,
    DequantizeLinear,
    Clip,
    Sigmoid,
    Concat,
    Split,
    #[strum(default)]
    Unsupported(String),
}

impl OpKind {
    pub fn parse(op_type: &str) -> Self {
        Self::from_str(op_type).unwrap_or_else(|_| Self::Unsupported(op_type.to_string()))
    }

    pub fn has_range_rule(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsupported(name) => write!(f, "{}", name),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Injected capabilities shared by every rule invocation.
#[derive(Clone, Copy)]
pub struct RuleContext<'a> {
    pub graph: &'a Graph,
    pub evaluator: &'a dyn NodeEvaluator,
    pub channel_axis: usize,
}

pub trait RangeRule {
    /// Output ranges of `node`, one per entry of `node.outputs`, computed from
    /// the input ranges already present in `store`.
    fn compute(&self, ctx: &RuleContext, node: &Node, store: &RangeStore) -> Result<Vec<RangeInfo>, RuleError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum AnyRangeRule {
    Dense(DenseRule),
    MatMul(MatMulRule),
    Conv(ConvRule),
    ConvTranspose(ConvTransposeRule),
    Monotonic(MonotonicRule),
    DeclaredRange(DeclaredRangeRule),
}

impl AnyRangeRule {
    /// Rule for `node`, or `None` when its operator kind has no rule.
    /// Unsupported attribute combinations are reported as errors.
    pub fn from_node(node: &Node) -> Result<Option<Self>, RuleError> {
        Ok(Some(match node.op_kind() {
            OpKind::Gemm => AnyRangeRule::Dense(DenseRule::from_node(node)?),
            OpKind::MatMul => AnyRangeRule::MatMul(MatMulRule),
            OpKind::Conv => AnyRangeRule::Conv(ConvRule::from_node(node)?),
            OpKind::ConvTranspose => AnyRangeRule::ConvTranspose(ConvTransposeRule::from_node(node)?),
            OpKind::Trunc | OpKind::QuantMaxNorm => AnyRangeRule::DeclaredRange(DeclaredRangeRule),
            OpKind::Unsupported(_) => return Ok(None),
            _ => AnyRangeRule::Monotonic(MonotonicRule),
        }))
    }
}

macro_rules! delegate {
    ($name:ident($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        fn $name(&self, $($arg: $ty),*) -> $ret {
            match self {
                AnyRangeRule::Dense(x) => x.$name($($arg),*),
                AnyRangeRule::MatMul(x) => x.$name($($arg),*),
                AnyRangeRule::Conv(x) => x.$name($($arg),*),
                AnyRangeRule::ConvTranspose(x) => x.$name($($arg),*),
                AnyRangeRule::Monotonic(x) => x.$name($($arg),*),
                AnyRangeRule::DeclaredRange(x) => x.$name($($arg),*),
            }
        }
    }
}

impl RangeRule for AnyRangeRule {
    delegate!(compute(ctx: &RuleContext, node: &Node, store: &RangeStore) -> Result<Vec<RangeInfo>, RuleError>);
}

pub(crate) fn input_name(node: &Node, idx: usize) -> Result<&str, RuleError> {
    node.input(idx)
        .ok_or_else(|| RuleError::MissingInput(node.name.clone(), idx))
}

pub(crate) fn input_range<'a>(node: &Node, store: &'a RangeStore, idx: usize) -> Result<&'a RangeInfo, RuleError> {
    let name = input_name(node, idx)?;
    store
        .get(name)
        .ok_or_else(|| RuleError::MissingRange(node.name.clone(), name.to_string()))
}

/// Value of a constant operand: an initializer entry whose bounds coincide.
pub(crate) fn constant_operand(node: &Node, store: &RangeStore, idx: usize) -> Result<ArrayD<f64>, RuleError> {
    let info = input_range(node, store, idx)?;
    if !info.is_initializer || !info.range.is_point() {
        return Err(RuleError::NonConstantOperand(
            node.name.clone(),
            input_name(node, idx)?.to_string(),
        ));
    }
    Ok(info.range.min.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_kind_parsing() {
        assert_eq!(OpKind::parse("Conv"), OpKind::Conv);
        assert_eq!(OpKind::parse("QuantMaxNorm"), OpKind::QuantMaxNorm);
        assert_eq!(OpKind::parse("Softmax"), OpKind::Unsupported("Softmax".to_string()));
        assert_eq!(OpKind::parse("Softmax").to_string(), "Softmax");
        assert_eq!(OpKind::BatchNormalization.to_string(), "BatchNormalization");
        assert!(!OpKind::parse("LSTM").has_range_rule());
    }

    #[test]
    fn test_rule_dispatch() {
        let node = |op_type: &str| Node {
            name: "n".to_string(),
            op_type: op_type.to_string(),
            inputs: vec![],
            outputs: vec![],
            attributes: Default::default(),
        };
        assert_eq!(AnyRangeRule::from_node(&node("MatMul")).unwrap(), Some(AnyRangeRule::MatMul(MatMulRule)));
        assert_eq!(AnyRangeRule::from_node(&node("Trunc")).unwrap(), Some(AnyRangeRule::DeclaredRange(DeclaredRangeRule)));
        assert_eq!(AnyRangeRule::from_node(&node("Split")).unwrap(), Some(AnyRangeRule::Monotonic(MonotonicRule)));
        assert_eq!(AnyRangeRule::from_node(&node("Softmax")).unwrap(), None);
    }
}
