use super::{CONSTANT_GRAPH, DENSE_GRAPH, QUANT_CHAIN_GRAPH, STUCK_GRAPH, load};
use rangeprop::{AnalysisConfig, InputRange, Report, ReportMode, ReferenceEvaluator, analyze, range_analysis};

fn uniform(base: &AnalysisConfig, report_mode: ReportMode) -> AnalysisConfig {
    AnalysisConfig {
        input_range: InputRange::Uniform { min: -1.0, max: 1.0 },
        report_mode,
        ..base.clone()
    }
}

/// A stuck-channel report narrowed to zero-valued channels equals a direct
/// zero-stuck report of the same run.
fn check_zero_stuck_equivalence(json: &str, base: &AnalysisConfig) {
    let graph = load(json);
    let stuck = range_analysis(&graph, &ReferenceEvaluator, &uniform(base, ReportMode::StuckChannel)).unwrap();
    let zero = range_analysis(&graph, &ReferenceEvaluator, &uniform(base, ReportMode::ZerostuckChannel)).unwrap();
    assert!(matches!(stuck, Report::StuckChannels(_)));
    assert!(matches!(zero, Report::ZeroStuckChannels(_)));
    assert_eq!(stuck.zero_stuck_only(), zero);
}

pub fn test_zero_stuck_equivalence_dense(base: &AnalysisConfig) {
    check_zero_stuck_equivalence(DENSE_GRAPH, base);
}

pub fn test_zero_stuck_equivalence_constant(base: &AnalysisConfig) {
    check_zero_stuck_equivalence(CONSTANT_GRAPH, base);
}

pub fn test_zero_stuck_equivalence_quant_chain(base: &AnalysisConfig) {
    check_zero_stuck_equivalence(QUANT_CHAIN_GRAPH, base);
}

pub fn test_zero_stuck_equivalence_stuck(base: &AnalysisConfig) {
    check_zero_stuck_equivalence(STUCK_GRAPH, base);
}

pub fn test_strip_initializers(base: &AnalysisConfig) {
    let graph = load(CONSTANT_GRAPH);
    let stripped = range_analysis(&graph, &ReferenceEvaluator, &uniform(base, ReportMode::Range)).unwrap();
    assert_eq!(stripped.names(), vec!["x", "y"]);

    let config = AnalysisConfig {
        strip_initializers: false,
        ..uniform(base, ReportMode::Range)
    };
    let full = range_analysis(&graph, &ReferenceEvaluator, &config).unwrap();
    assert_eq!(full.names(), vec!["x", "a", "b", "k", "y"]);
}

pub fn test_key_filter_and_rendering(base: &AnalysisConfig) {
    let graph = load(QUANT_CHAIN_GRAPH);
    let config = AnalysisConfig {
        input_range: InputRange::Uniform { min: -10.0, max: 10.0 },
        report_mode: ReportMode::Range,
        key_filter: "r".to_string(),
        scaled_int: true,
        ..base.clone()
    };
    let report = range_analysis(&graph, &ReferenceEvaluator, &config).unwrap();
    // "zeropt" matches too but is a constant
    assert_eq!(report.names(), vec!["r"]);
    let text = report.to_string();
    assert!(text.starts_with("r: (0.0, 3.5) int_range=(0.0, 7.0), scale=0.5, bias="), "{text}");

    let json: serde_json::Value = serde_json::from_str(&report.to_json(false).unwrap()).unwrap();
    assert_eq!(json["r"]["range"], serde_json::json!([0.0, 3.5]));
    assert_eq!(json["r"]["integer"]["int_range"], serde_json::json!([0.0, 7.0]));
}

pub fn test_stuck_report_lists_values(base: &AnalysisConfig) {
    let graph = load(CONSTANT_GRAPH);
    let outcome = analyze(&graph, &ReferenceEvaluator, &uniform(base, ReportMode::StuckChannel)).unwrap();
    let report = Report::build(&outcome, ReportMode::StuckChannel, "", true);
    assert_eq!(report.names(), vec!["y"]);
    let zero = Report::build(&outcome, ReportMode::ZerostuckChannel, "", true);
    assert_eq!(zero.to_string(), "y: {0, 1}\n");
}
