pub mod ops;
mod reference;

pub use ops::NDArrayOperationError;
pub use reference::ReferenceEvaluator;

use crate::graph::{Graph, Node};
use crate::interval::IntervalError;
use ndarray::ArrayD;

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    #[error("Missing input {1} for op {0}")]
    MissingInput(String, usize),
    #[error("Invalid input for op {0}: {1}")]
    InvalidInput(String, String),
    #[error("Unsupported attribute value for op {0}: {1}")]
    UnsupportedAttribute(String, String),
    #[error(transparent)]
    NDArrayOperationError(#[from] NDArrayOperationError),
    #[error(transparent)]
    IntervalError(#[from] IntervalError),
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
}

/// Evaluates a single node on concrete values.
///
/// `inputs` is aligned with `node.inputs`; omitted optional inputs are `None`.
/// Implementations must be pure: the analysis calls them repeatedly with
/// different prototype tensors and relies on identical answers for identical
/// inputs.
pub trait NodeEvaluator {
    fn evaluate(
        &self,
        node: &Node,
        inputs: &[Option<&ArrayD<f64>>],
        graph: &Graph,
    ) -> Result<Vec<ArrayD<f64>>, EvalError>;
}

impl<F> NodeEvaluator for F
where
    F: Fn(&Node, &[Option<&ArrayD<f64>>], &Graph) -> Result<Vec<ArrayD<f64>>, EvalError>,
{
    fn evaluate(
        &self,
        node: &Node,
        inputs: &[Option<&ArrayD<f64>>],
        graph: &Graph,
    ) -> Result<Vec<ArrayD<f64>>, EvalError> {
        self(node, inputs, graph)
    }
}

/// Evaluate `node` with every input taken from the graph's initializers.
pub fn evaluate_on_initializers(
    evaluator: &dyn NodeEvaluator,
    node: &Node,
    graph: &Graph,
) -> Result<Vec<ArrayD<f64>>, EvalError> {
    let inputs: Vec<Option<&ArrayD<f64>>> = node
        .inputs
        .iter()
        .map(|name| graph.get_initializer(name))
        .collect();
    evaluator.evaluate(node, &inputs, graph)
}
