pub mod config;
pub mod dtype;
pub mod evaluator;
pub mod graph;
pub mod interval;
pub mod normalize;
pub mod range_info;
pub mod report;
pub mod rules;
pub mod scaled_int;
pub mod walker;

pub use config::{AnalysisConfig, ConfigError, InputRange};
pub use dtype::{DataType, DataTypeError};
pub use evaluator::{EvalError, NodeEvaluator, ReferenceEvaluator};
pub use graph::{Graph, GraphError, Node};
pub use interval::{Bound, Interval, IntervalError};
pub use range_info::{IntegerInfo, RangeInfo, RangeStore, RangeStoreError};
pub use report::{Report, ReportError, ReportMode};
pub use rules::{OpKind, RuleError};
pub use walker::{AnalysisOutcome, RangeAnalysis};

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Could not infer range for input \"{0}\" from its datatype, please specify an input range")]
    UnknownInputRange(String),
    #[error(transparent)]
    GraphError(#[from] GraphError),
    #[error(transparent)]
    RuleError(#[from] RuleError),
    #[error(transparent)]
    EvalError(#[from] EvalError),
    #[error(transparent)]
    IntervalError(#[from] IntervalError),
    #[error(transparent)]
    RangeStoreError(#[from] RangeStoreError),
    #[error(transparent)]
    ConfigError(#[from] ConfigError),
    #[error(transparent)]
    ReportError(#[from] ReportError),
    #[error(transparent)]
    DataTypeError(#[from] DataTypeError),
}

/// Run the analysis passes selected by `config` over `graph`.
pub fn analyze(
    graph: &Graph,
    evaluator: &dyn NodeEvaluator,
    config: &AnalysisConfig,
) -> Result<AnalysisOutcome, AnalysisError> {
    let normalized;
    let graph = if config.normalize {
        normalized = normalize::normalize(graph, evaluator);
        &normalized
    } else {
        graph
    };

    let analysis = RangeAnalysis::new(graph, evaluator).with_channel_axis(config.channel_axis);
    let mut outcome = analysis.run(&config.input_range)?;

    if config.scaled_int {
        outcome.integer_skipped = scaled_int::reconstruct_integer_ranges(&analysis.context(), &mut outcome.store)?;
        for (name, info) in outcome.store.iter() {
            if !info.check_integer_consistency(1e-6)? {
                log::warn!("Integer info of {} does not reproduce its range", name);
            }
        }
    }
    Ok(outcome)
}

/// [`analyze`] followed by report formatting.
pub fn range_analysis(
    graph: &Graph,
    evaluator: &dyn NodeEvaluator,
    config: &AnalysisConfig,
) -> Result<Report, AnalysisError> {
    let outcome = analyze(graph, evaluator, config)?;
    Ok(Report::build(
        &outcome,
        config.report_mode,
        &config.key_filter,
        config.strip_initializers,
    ))
}
