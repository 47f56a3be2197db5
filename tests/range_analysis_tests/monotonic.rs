use super::{CONSTANT_GRAPH, load, run, test_eq_interval};
use rangeprop::{AnalysisConfig, AnalysisError, Graph, InputRange, Interval, ReferenceEvaluator, analyze};

pub fn test_constant_only_node(base: &AnalysisConfig) {
    let graph = load(CONSTANT_GRAPH);
    let config = AnalysisConfig {
        input_range: InputRange::Uniform { min: -1.0, max: 1.0 },
        ..base.clone()
    };
    let outcome = run(&graph, &config);
    let k = outcome.store.get("k").unwrap();
    assert!(k.is_initializer);
    assert_eq!(k.range, Interval::point(ndarray::array![[0.0, 0.0]].into_dyn()));

    let y = outcome.store.get("y").unwrap();
    assert!(!y.is_initializer);
    test_eq_interval(&y.range, &Interval::scalar(0.0, 0.0));
    let stuck: Vec<usize> = outcome.stuck_channels[0].1.iter().map(|(channel, _)| *channel).collect();
    assert_eq!(outcome.stuck_channels[0].0, "y");
    assert_eq!(stuck, vec![0, 1]);
}

pub fn test_input_range_from_datatype(base: &AnalysisConfig) {
    let graph = Graph::from_json(
        r#"{
        "inputs": [{"name": "x", "shape": [1, 3], "dtype": "UINT4"}],
        "value_info": [{"name": "y", "shape": [1, 3]}],
        "initializers": [{"name": "s", "shape": [], "data": [0.5]}],
        "nodes": [{"name": "scale", "op_type": "Mul", "inputs": ["x", "s"], "outputs": ["y"]}]
    }"#,
    )
    .unwrap();
    let outcome = run(&graph, base);
    test_eq_interval(&outcome.store.get("x").unwrap().range, &Interval::scalar(0.0, 15.0));
    test_eq_interval(&outcome.store.get("y").unwrap().range, &Interval::scalar(0.0, 7.5));
}

pub fn test_missing_input_range(base: &AnalysisConfig) {
    let graph = Graph::from_json(
        r#"{
        "inputs": [{"name": "x", "shape": [1, 3]}],
        "nodes": [{"name": "act", "op_type": "Relu", "inputs": ["x"], "outputs": ["y"]}]
    }"#,
    )
    .unwrap();
    let err = analyze(&graph, &ReferenceEvaluator, base).unwrap_err();
    assert!(matches!(err, AnalysisError::UnknownInputRange(name) if name == "x"));
}

pub fn test_unsupported_node_skips_dependents(base: &AnalysisConfig) {
    let graph = Graph::from_json(
        r#"{
        "inputs": [{"name": "x", "shape": [1, 2]}],
        "value_info": [{"name": "a", "shape": [1, 2]}, {"name": "b", "shape": [1, 2]}],
        "nodes": [
            {"name": "soft", "op_type": "Softmax", "inputs": ["x"], "outputs": ["a"]},
            {"name": "act", "op_type": "Relu", "inputs": ["a"], "outputs": ["b"]}
        ]
    }"#,
    )
    .unwrap();
    let config = AnalysisConfig {
        input_range: InputRange::Uniform { min: -1.0, max: 1.0 },
        ..base.clone()
    };
    let outcome = run(&graph, &config);
    assert_eq!(outcome.skipped, vec!["soft".to_string(), "act".to_string()]);
    assert!(!outcome.store.contains("a"));
    assert!(!outcome.store.contains("b"));
}
