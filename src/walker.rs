//! Real-valued range propagation: one pass over the nodes in declared order.

use crate::AnalysisError;
use crate::config::InputRange;
use crate::evaluator::NodeEvaluator;
use crate::graph::Graph;
use crate::interval::Interval;
use crate::range_info::{RangeInfo, RangeStore};
use crate::rules::{AnyRangeRule, RangeRule, RuleContext};

/// Channels stuck at a single value, per tensor, in walk order.
pub type StuckChannels = Vec<(String, Vec<(usize, f64)>)>;

#[derive(Clone, Debug, Default)]
pub struct AnalysisOutcome {
    pub store: RangeStore,
    pub stuck_channels: StuckChannels,
    /// Nodes left without output ranges.
    pub skipped: Vec<String>,
    /// Nodes the scaled-integer pass could not handle.
    pub integer_skipped: Vec<String>,
}

pub struct RangeAnalysis<'a> {
    graph: &'a Graph,
    evaluator: &'a dyn NodeEvaluator,
    channel_axis: usize,
}

impl<'a> RangeAnalysis<'a> {
    pub fn new(graph: &'a Graph, evaluator: &'a dyn NodeEvaluator) -> Self {
        Self {
            graph,
            evaluator,
            channel_axis: 1,
        }
    }

    pub fn with_channel_axis(mut self, channel_axis: usize) -> Self {
        self.channel_axis = channel_axis;
        self
    }

    pub fn context(&self) -> RuleContext<'a> {
        RuleContext {
            graph: self.graph,
            evaluator: self.evaluator,
            channel_axis: self.channel_axis,
        }
    }

    /// Store holding the graph inputs and every initializer.
    pub fn seed(&self, input_range: &InputRange) -> Result<RangeStore, AnalysisError> {
        let mut store = RangeStore::new();
        for name in self.graph.inputs() {
            if self.graph.is_initializer(name) {
                continue;
            }
            let info = match input_range {
                InputRange::Prebuilt(info) => info.clone(),
                InputRange::Uniform { min, max } => RangeInfo::new(Interval::scalar(*min, *max)),
                InputRange::PerChannel { min, max } => RangeInfo::new(Interval::per_channel(min.clone(), max.clone())),
                InputRange::FromDataType => {
                    let dtype = self
                        .graph
                        .dtype(name)
                        .ok_or_else(|| AnalysisError::UnknownInputRange(name.clone()))?;
                    RangeInfo::new(Interval::scalar(dtype.min(), dtype.max()))
                }
            };
            store.insert(name, info)?;
        }
        for (name, value) in self.graph.initializers() {
            store.insert(name, RangeInfo::initializer(value.clone()))?;
        }
        Ok(store)
    }

    pub fn run(&self, input_range: &InputRange) -> Result<AnalysisOutcome, AnalysisError> {
        let mut outcome = AnalysisOutcome {
            store: self.seed(input_range)?,
            ..Default::default()
        };
        let ctx = self.context();

        for node in self.graph.nodes() {
            let dynamic = self.graph.dynamic_inputs(node);
            let inputs_ready = dynamic.iter().all(|name| outcome.store.contains(name));
            let rule = if inputs_ready { AnyRangeRule::from_node(node)? } else { None };
            let Some(rule) = rule else {
                log::warn!(
                    "Skipping {}: inputs ready? {} op supported? ({}) {}",
                    node.name,
                    inputs_ready,
                    node.op_type,
                    node.op_kind().has_range_rule()
                );
                outcome.skipped.push(node.name.clone());
                continue;
            };

            log::debug!("Computing ranges for {} ({})", node.name, node.op_type);
            let ranges = rule.compute(&ctx, node, &outcome.store)?;
            for (name, info) in node.outputs.iter().zip(ranges) {
                if name.is_empty() {
                    continue;
                }
                let info = if info.is_initializer {
                    info
                } else {
                    let stuck = info.range.stuck_channels()?;
                    if !stuck.is_empty() {
                        outcome.stuck_channels.push((name.clone(), stuck));
                    }
                    RangeInfo {
                        range: info.range.simplify(),
                        ..info
                    }
                };
                outcome.store.insert(name, info)?;
            }
        }

        log::info!(
            "Range analysis covered {} tensors, skipped {} of {} nodes",
            outcome.store.len(),
            outcome.skipped.len(),
            self.graph.nodes().len()
        );
        Ok(outcome)
    }
}
