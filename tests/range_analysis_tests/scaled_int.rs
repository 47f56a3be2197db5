use super::{QUANT_CHAIN_GRAPH, RESHAPE_BIAS_GRAPH, STUCK_GRAPH, load, run, test_eq_bound, test_eq_interval};
use rangeprop::interval::{scalar_bound, vector_bound};
use rangeprop::{AnalysisConfig, InputRange, Interval};

fn scaled_int(base: &AnalysisConfig) -> AnalysisConfig {
    AnalysisConfig {
        input_range: InputRange::Uniform { min: -10.0, max: 10.0 },
        scaled_int: true,
        ..base.clone()
    }
}

pub fn test_quant_chain_integer_ranges(base: &AnalysisConfig) {
    let graph = load(QUANT_CHAIN_GRAPH);
    let outcome = run(&graph, &scaled_int(base));
    assert!(outcome.integer_skipped.is_empty());

    let q = outcome.store.get("q").unwrap();
    test_eq_interval(&q.range, &Interval::scalar(-4.0, 3.5));
    let q_int = q.integer.as_ref().unwrap();
    test_eq_interval(&q_int.int_range, &Interval::scalar(-8.0, 7.0));
    test_eq_bound(&q_int.scale, &scalar_bound(0.5), 0.0);

    let r_int = outcome.store.get("r").unwrap().integer.as_ref().unwrap();
    test_eq_interval(&r_int.int_range, &Interval::scalar(0.0, 7.0));

    let y = outcome.store.get("y").unwrap();
    test_eq_interval(&y.range, &Interval::per_channel(vec![0.0, -3.5], vec![10.5, 0.0]));
    let y_int = y.integer.as_ref().unwrap();
    test_eq_interval(&y_int.int_range, &Interval::per_channel(vec![0.0, -7.0], vec![21.0, 0.0]));
    test_eq_bound(&y_int.scale, &vector_bound(vec![0.5, 0.5]), 1e-12);
    test_eq_bound(&y_int.bias, &vector_bound(vec![0.0, 0.0]), 1e-12);
}

pub fn test_integer_info_reproduces_ranges(base: &AnalysisConfig) {
    let graph = load(QUANT_CHAIN_GRAPH);
    let outcome = run(&graph, &scaled_int(base));
    for (name, info) in outcome.store.iter() {
        assert!(info.check_integer_consistency(1e-9).unwrap(), "{name}");
    }
}

pub fn test_reshape_and_constant_offset_integer_ranges(base: &AnalysisConfig) {
    let graph = load(RESHAPE_BIAS_GRAPH);
    let outcome = run(&graph, &scaled_int(base));
    assert!(outcome.integer_skipped.is_empty());

    let q_int = outcome.store.get("q").unwrap().integer.clone().unwrap();
    test_eq_interval(&q_int.int_range, &Interval::scalar(-7.0, 7.0));
    let rq_int = outcome.store.get("rq").unwrap().integer.clone().unwrap();
    assert_eq!(rq_int, q_int);

    let y = outcome.store.get("y").unwrap();
    test_eq_interval(&y.range, &Interval::scalar(-3.25, 3.75));
    let y_int = y.integer.as_ref().unwrap();
    test_eq_interval(&y_int.int_range, &Interval::scalar(-7.0, 7.0));
    test_eq_bound(&y_int.scale, &scalar_bound(0.5), 1e-12);
    test_eq_bound(&y_int.bias, &scalar_bound(0.25), 1e-12);
    assert!(y.check_integer_consistency(1e-9).unwrap());
}

pub fn test_stuck_channel_gives_nan_scale(base: &AnalysisConfig) {
    let graph = load(STUCK_GRAPH);
    let outcome = run(&graph, &scaled_int(base));
    let y = outcome.store.get("y").unwrap();
    test_eq_interval(&y.range, &Interval::per_channel(vec![-8.0, 0.0], vec![7.0, 0.0]));
    let y_int = y.integer.as_ref().unwrap();
    test_eq_interval(&y_int.int_range, &Interval::per_channel(vec![-16.0, 0.0], vec![14.0, 0.0]));
    let scale: Vec<f64> = y_int.scale.iter().copied().collect();
    assert_eq!(scale[0], 0.5);
    assert!(scale[1].is_nan());
    assert!(!y.check_integer_consistency(1e-9).unwrap());
    assert_eq!(outcome.stuck_channels.len(), 1);
    assert_eq!(outcome.stuck_channels[0].0, "y");
    assert_eq!(outcome.stuck_channels[0].1.len(), 1);
    assert_eq!(outcome.stuck_channels[0].1[0].0, 1);
}

pub fn test_scaled_int_disabled(base: &AnalysisConfig) {
    let graph = load(QUANT_CHAIN_GRAPH);
    let config = AnalysisConfig {
        scaled_int: false,
        ..scaled_int(base)
    };
    let outcome = run(&graph, &config);
    assert!(!outcome.store.get("q").unwrap().has_integer_info());
    assert!(!outcome.store.get("y").unwrap().has_integer_info());
}
