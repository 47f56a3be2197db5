use super::{DENSE_GRAPH, DEPTHWISE_GRAPH, load, run, test_eq_interval};
use rangeprop::{AnalysisConfig, Graph, InputRange, Interval, ReferenceEvaluator, RuleError, analyze, AnalysisError};

fn two_channel_unit(base: &AnalysisConfig) -> AnalysisConfig {
    AnalysisConfig {
        input_range: InputRange::PerChannel {
            min: vec![0.0, 0.0],
            max: vec![1.0, 1.0],
        },
        ..base.clone()
    }
}

pub fn test_dense_layer(base: &AnalysisConfig) {
    let graph = load(DENSE_GRAPH);
    let outcome = run(&graph, &two_channel_unit(base));
    test_eq_interval(
        &outcome.store.get("h").unwrap().range,
        &Interval::per_channel(vec![-1.0, 0.0], vec![1.0, 5.0]),
    );
    test_eq_interval(
        &outcome.store.get("y").unwrap().range,
        &Interval::per_channel(vec![0.0, 0.0], vec![1.0, 5.0]),
    );
    assert!(outcome.skipped.is_empty());
    assert!(outcome.stuck_channels.is_empty());
}

pub fn test_depthwise_conv(base: &AnalysisConfig) {
    let graph = load(DEPTHWISE_GRAPH);
    let config = AnalysisConfig {
        input_range: InputRange::PerChannel {
            min: vec![0.0, -1.0],
            max: vec![1.0, 2.0],
        },
        ..base.clone()
    };
    let outcome = run(&graph, &config);
    // channel 0: x0 + 2 x1 over [0, 1]; channel 1: -x0 - 3 x1 over [-1, 2]
    test_eq_interval(
        &outcome.store.get("y").unwrap().range,
        &Interval::per_channel(vec![0.0, -8.0], vec![3.0, 4.0]),
    );
}

pub fn test_dynamic_weight_is_fatal(base: &AnalysisConfig) {
    let graph = Graph::from_json(
        r#"{
        "inputs": [{"name": "x", "shape": [1, 2]}, {"name": "w", "shape": [2, 2]}],
        "nodes": [{"name": "fc", "op_type": "MatMul", "inputs": ["x", "w"], "outputs": ["y"]}]
    }"#,
    )
    .unwrap();
    let config = AnalysisConfig {
        input_range: InputRange::Uniform { min: 0.0, max: 1.0 },
        ..base.clone()
    };
    let err = analyze(&graph, &ReferenceEvaluator, &config).unwrap_err();
    assert!(matches!(err, AnalysisError::RuleError(RuleError::NonConstantOperand(node, name)) if node == "fc" && name == "w"));
}

pub fn test_biased_conv_is_fatal(base: &AnalysisConfig) {
    let graph = Graph::from_json(
        r#"{
        "inputs": [{"name": "x", "shape": [1, 1, 1, 1]}],
        "initializers": [
            {"name": "w", "shape": [1, 1, 1, 1], "data": [2]},
            {"name": "b", "shape": [1], "data": [1]}
        ],
        "nodes": [{"name": "conv", "op_type": "Conv", "inputs": ["x", "w", "b"], "outputs": ["y"]}]
    }"#,
    )
    .unwrap();
    let config = AnalysisConfig {
        input_range: InputRange::Uniform { min: 0.0, max: 1.0 },
        ..base.clone()
    };
    let err = analyze(&graph, &ReferenceEvaluator, &config).unwrap_err();
    assert!(matches!(err, AnalysisError::RuleError(RuleError::UnsupportedConfiguration(..))));
}
