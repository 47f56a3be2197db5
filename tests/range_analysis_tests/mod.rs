use rangeprop::interval::Bound;
use rangeprop::{AnalysisConfig, AnalysisOutcome, Graph, Interval, ReferenceEvaluator, analyze};

pub mod affine;
pub mod monotonic;
pub mod report;
pub mod scaled_int;

fn load(json: &str) -> Graph {
    Graph::from_json(json).unwrap()
}

fn run(graph: &Graph, config: &AnalysisConfig) -> AnalysisOutcome {
    analyze(graph, &ReferenceEvaluator, config).unwrap()
}

fn test_eq_bound(value: &Bound, correct: &Bound, atol: f64) {
    assert_eq!(value.shape(), correct.shape());
    for (a, b) in value.iter().zip(correct.iter()) {
        let err = (a - b).abs();
        assert!(err <= atol, "{a} != {b}: {err} > {atol}");
    }
}

fn test_eq_interval(value: &Interval, correct: &Interval) {
    test_eq_bound(&value.min, &correct.min, 1e-9);
    test_eq_bound(&value.max, &correct.max, 1e-9);
}

/// Dense layer followed by a ReLU.
pub const DENSE_GRAPH: &str = r#"{
    "name": "dense",
    "inputs": [{"name": "x", "shape": [1, 2]}],
    "outputs": [{"name": "y", "shape": [1, 2]}],
    "value_info": [{"name": "h", "shape": [1, 2]}],
    "initializers": [
        {"name": "w", "shape": [2, 2], "data": [1, -1, 2, 3]},
        {"name": "b", "shape": [2], "data": [0, 0]}
    ],
    "nodes": [
        {"name": "fc", "op_type": "Gemm", "inputs": ["x", "w", "b"], "outputs": ["h"]},
        {"name": "act", "op_type": "Relu", "inputs": ["h"], "outputs": ["y"]}
    ]
}"#;

/// A constant-only node feeding a masked multiply.
pub const CONSTANT_GRAPH: &str = r#"{
    "name": "constant",
    "inputs": [{"name": "x", "shape": [1, 2]}],
    "outputs": [{"name": "y", "shape": [1, 2]}],
    "initializers": [
        {"name": "a", "shape": [1, 2], "data": [1, -1]},
        {"name": "b", "shape": [1, 2], "data": [-1, 1]}
    ],
    "nodes": [
        {"name": "mask", "op_type": "Add", "inputs": ["a", "b"], "outputs": ["k"]},
        {"name": "masked", "op_type": "Mul", "inputs": ["x", "k"], "outputs": ["y"]}
    ]
}"#;

/// Two-channel depthwise convolution with opposite-signed kernels.
pub const DEPTHWISE_GRAPH: &str = r#"{
    "name": "depthwise",
    "inputs": [{"name": "x", "shape": [1, 2, 1, 2]}],
    "outputs": [{"name": "y", "shape": [1, 2, 1, 1]}],
    "initializers": [{"name": "w", "shape": [2, 1, 1, 2], "data": [1, 2, -1, -3]}],
    "nodes": [
        {"name": "dw", "op_type": "Conv", "inputs": ["x", "w"], "outputs": ["y"], "attributes": {"group": 2}}
    ]
}"#;

/// Saturating 4-bit quantizer, ReLU, then an integer matrix product.
pub const QUANT_CHAIN_GRAPH: &str = r#"{
    "name": "quant_chain",
    "inputs": [{"name": "x", "shape": [1, 2]}],
    "outputs": [{"name": "y", "shape": [1, 2]}],
    "value_info": [{"name": "q", "shape": [1, 2]}, {"name": "r", "shape": [1, 2]}],
    "initializers": [
        {"name": "scale", "shape": [], "data": [0.5]},
        {"name": "zeropt", "shape": [], "data": [0]},
        {"name": "bitwidth", "shape": [], "data": [4]},
        {"name": "w", "shape": [2, 2], "data": [1, -1, 2, 0]}
    ],
    "nodes": [
        {"name": "quant", "op_type": "Quant", "inputs": ["x", "scale", "zeropt", "bitwidth"], "outputs": ["q"]},
        {"name": "act", "op_type": "Relu", "inputs": ["q"], "outputs": ["r"]},
        {"name": "fc", "op_type": "MatMul", "inputs": ["r", "w"], "outputs": ["y"]}
    ]
}"#;

/// Narrow quantizer, a reshape and a constant offset.
pub const RESHAPE_BIAS_GRAPH: &str = r#"{
    "name": "reshape_bias",
    "inputs": [{"name": "x", "shape": [1, 2]}],
    "outputs": [{"name": "y", "shape": [1, 2]}],
    "value_info": [{"name": "q", "shape": [1, 2]}, {"name": "rq", "shape": [1, 2]}],
    "initializers": [
        {"name": "scale", "shape": [], "data": [0.5]},
        {"name": "zeropt", "shape": [], "data": [0]},
        {"name": "bitwidth", "shape": [], "data": [4]},
        {"name": "target", "shape": [2], "data": [1, 2]},
        {"name": "offset", "shape": [], "data": [0.25]}
    ],
    "nodes": [
        {"name": "quant", "op_type": "Quant", "inputs": ["x", "scale", "zeropt", "bitwidth"], "outputs": ["q"], "attributes": {"narrow": 1}},
        {"name": "reshape", "op_type": "Reshape", "inputs": ["q", "target"], "outputs": ["rq"]},
        {"name": "shift", "op_type": "Add", "inputs": ["rq", "offset"], "outputs": ["y"]}
    ]
}"#;

/// Quantized matrix product with an all-zero weight column.
pub const STUCK_GRAPH: &str = r#"{
    "name": "stuck",
    "inputs": [{"name": "x", "shape": [1, 2]}],
    "outputs": [{"name": "y", "shape": [1, 2]}],
    "value_info": [{"name": "q", "shape": [1, 2]}],
    "initializers": [
        {"name": "scale", "shape": [], "data": [0.5]},
        {"name": "zeropt", "shape": [], "data": [0]},
        {"name": "bitwidth", "shape": [], "data": [4]},
        {"name": "w", "shape": [2, 2], "data": [1, 0, 1, 0]}
    ],
    "nodes": [
        {"name": "quant", "op_type": "Quant", "inputs": ["x", "scale", "zeropt", "bitwidth"], "outputs": ["q"]},
        {"name": "fc", "op_type": "MatMul", "inputs": ["q", "w"], "outputs": ["y"]}
    ]
}"#;
