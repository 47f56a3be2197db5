use super::{RangeRule, RuleContext, RuleError};
use crate::evaluator::{EvalError, evaluate_on_initializers};
use crate::graph::Node;
use crate::interval::{Bound, Interval, broadcast_zip};
use crate::range_info::{RangeInfo, RangeStore};
use ndarray::{Array1, ArrayD, Axis, IxDyn};

/// Build the all-`bound` prototype tensor of `shape`.
///
/// A bound is accepted as a scalar, as a full tensor of the input shape, or
/// as a vector laid along `channel_axis`.
fn fill_prototype(
    node: &Node,
    name: &str,
    bound: &Bound,
    shape: &[usize],
    channel_axis: usize,
) -> Result<ArrayD<f64>, RuleError> {
    let unrecognized = || {
        RuleError::UnrecognizedRange(node.name.clone(), name.to_string(), bound.shape().to_vec(), shape.to_vec())
    };
    if bound.ndim() == 0 {
        return Ok(ArrayD::from_elem(IxDyn(shape), bound[IxDyn(&[])]));
    }
    if bound.shape() == shape {
        return Ok(bound.clone());
    }
    if bound.ndim() == 1 && channel_axis < shape.len() && bound.len() == shape[channel_axis] {
        let mut laid_out = vec![1; shape.len()];
        laid_out[channel_axis] = bound.len();
        let laid_out = bound.to_shape(IxDyn(&laid_out))?;
        return Ok(laid_out.broadcast(IxDyn(shape)).ok_or_else(unrecognized)?.to_owned());
    }
    Err(unrecognized())
}

/// Channel-wise extrema of one evaluated output: every axis but the channel
/// axis is reduced. Outputs of rank 0 or 1 are taken as-is.
fn channel_extrema(node: &Node, out: &ArrayD<f64>, channel_axis: usize) -> Result<(Bound, Bound), RuleError> {
    if out.ndim() <= 1 {
        let flat: Array1<f64> = out.iter().copied().collect();
        return Ok((flat.clone().into_dyn(), flat.into_dyn()));
    }
    if channel_axis >= out.ndim() {
        return Err(RuleError::ChannelAxisOutOfRange(node.name.clone(), channel_axis, out.ndim()));
    }
    let (lo, hi): (Vec<f64>, Vec<f64>) = out
        .axis_iter(Axis(channel_axis))
        .map(|channel| {
            channel.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)))
        })
        .unzip();
    Ok((Array1::from(lo).into_dyn(), Array1::from(hi).into_dyn()))
}

/// Sampling rule for operators without a closed form.
///
/// Every dynamic input contributes an all-min and an all-max prototype; the
/// node is evaluated on each of the `2^k` combinations and the channel-wise
/// extrema of the outputs are merged. Exact for operators that are monotonic
/// in each input along the channel axis, an approximation otherwise.
#[derive(Clone, Debug, PartialEq)]
pub struct MonotonicRule;

impl RangeRule for MonotonicRule {
    fn compute(&self, ctx: &RuleContext, node: &Node, store: &RangeStore) -> Result<Vec<RangeInfo>, RuleError> {
        let graph = ctx.graph;
        let eval_err = |e: EvalError| RuleError::EvalError(node.name.clone(), e);

        let dynamic: Vec<(usize, &str)> = node
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, name)| graph.is_dynamic(name))
            .map(|(i, name)| (i, name.as_str()))
            .collect();

        if dynamic.is_empty() {
            let outputs = evaluate_on_initializers(ctx.evaluator, node, graph).map_err(eval_err)?;
            return Ok(outputs.into_iter().map(RangeInfo::constant).collect());
        }

        let combinations = u32::try_from(dynamic.len())
            .ok()
            .and_then(|k| 1usize.checked_shl(k))
            .ok_or_else(|| {
                RuleError::UnsupportedConfiguration(
                    node.name.clone(),
                    format!("too many dynamic inputs to sample ({})", dynamic.len()),
                )
            })?;

        let mut prototypes = Vec::with_capacity(dynamic.len());
        for &(_, name) in &dynamic {
            let info = store
                .get(name)
                .ok_or_else(|| RuleError::MissingRange(node.name.clone(), name.to_string()))?;
            let shape = match graph.shape(name) {
                Some(shape) => shape.to_vec(),
                None if info.range.min.ndim() > 1 => info.range.min.shape().to_vec(),
                None => return Err(RuleError::MissingShape(node.name.clone(), name.to_string())),
            };
            prototypes.push((
                fill_prototype(node, name, &info.range.min, &shape, ctx.channel_axis)?,
                fill_prototype(node, name, &info.range.max, &shape, ctx.channel_axis)?,
            ));
        }

        let mut running: Vec<Option<Interval>> = vec![None; node.outputs.len()];
        for mask in 0..combinations {
            let mut inputs: Vec<Option<&ArrayD<f64>>> = node
                .inputs
                .iter()
                .map(|name| graph.get_initializer(name))
                .collect();
            for (j, &(idx, _)) in dynamic.iter().enumerate() {
                let (lo, hi) = &prototypes[j];
                inputs[idx] = Some(if (mask >> j) & 1 == 1 { hi } else { lo });
            }

            let outputs = ctx.evaluator.evaluate(node, &inputs, graph).map_err(eval_err)?;
            if outputs.len() < node.outputs.len() {
                return Err(eval_err(EvalError::InvalidInput(
                    node.name.clone(),
                    format!("expected {} outputs, got {}", node.outputs.len(), outputs.len()),
                )));
            }
            for (slot, out) in running.iter_mut().zip(&outputs) {
                let (lo, hi) = channel_extrema(node, out, ctx.channel_axis)?;
                *slot = Some(match slot.take() {
                    None => Interval::new(lo, hi),
                    Some(prev) => Interval::new(
                        broadcast_zip(&prev.min, &lo, f64::min)?,
                        broadcast_zip(&prev.max, &hi, f64::max)?,
                    ),
                });
            }
        }

        Ok(running
            .into_iter()
            .flatten()
            .map(RangeInfo::new)
            .collect())
    }
}

/// Output range is the declared datatype's representable range, whatever the inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct DeclaredRangeRule;

impl RangeRule for DeclaredRangeRule {
    fn compute(&self, ctx: &RuleContext, node: &Node, _store: &RangeStore) -> Result<Vec<RangeInfo>, RuleError> {
        node.outputs
            .iter()
            .map(|name| {
                let dtype = ctx
                    .graph
                    .dtype(name)
                    .ok_or_else(|| RuleError::MissingDataType(node.name.clone(), name.clone()))?;
                Ok(RangeInfo::new(Interval::scalar(dtype.min(), dtype.max())))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{NodeEvaluator, ReferenceEvaluator};
    use crate::graph::Graph;

    fn graph(nodes: &str, initializers: &str, value_info: &str) -> Graph {
        Graph::from_json(&format!(
            r#"{{"nodes": [{}], "initializers": [{}], "value_info": [{}]}}"#,
            nodes, initializers, value_info
        ))
        .unwrap()
    }

    fn run(graph: &Graph, evaluator: &dyn NodeEvaluator, store: &RangeStore) -> Result<Vec<RangeInfo>, RuleError> {
        let ctx = RuleContext {
            graph,
            evaluator,
            channel_axis: 1,
        };
        MonotonicRule.compute(&ctx, &graph.nodes()[0], store)
    }

    fn store_with(entries: &[(&str, Interval)]) -> RangeStore {
        let mut store = RangeStore::new();
        for (name, range) in entries {
            store.insert(name, RangeInfo::new(range.clone())).unwrap();
        }
        store
    }

    #[test]
    fn test_per_channel_relu() {
        let g = graph(
            r#"{"op_type": "Relu", "inputs": ["x"], "outputs": ["y"]}"#,
            "",
            r#"{"name": "x", "shape": [1, 2, 3]}"#,
        );
        let s = store_with(&[("x", Interval::per_channel(vec![-1.0, 2.0], vec![1.0, 3.0]))]);
        let out = run(&g, &ReferenceEvaluator, &s).unwrap();
        assert_eq!(out[0].range, Interval::per_channel(vec![0.0, 2.0], vec![1.0, 3.0]));
        assert!(!out[0].is_initializer);
    }

    #[test]
    fn test_constant_mask_produces_stuck_channel() {
        let g = graph(
            r#"{"op_type": "Mul", "inputs": ["x", "m"], "outputs": ["y"]}"#,
            r#"{"name": "m", "shape": [1, 2], "data": [1, 0]}"#,
            r#"{"name": "x", "shape": [1, 2]}"#,
        );
        let s = store_with(&[("x", Interval::scalar(-1.0, 1.0))]);
        let out = run(&g, &ReferenceEvaluator, &s).unwrap();
        assert_eq!(out[0].range, Interval::per_channel(vec![-1.0, 0.0], vec![1.0, 0.0]));
        assert_eq!(out[0].range.stuck_channels().unwrap(), vec![(1, 0.0)]);
    }

    #[test]
    fn test_all_combinations_are_sampled() {
        let g = graph(
            r#"{"op_type": "Sub", "inputs": ["x", "z"], "outputs": ["y"]}"#,
            "",
            r#"{"name": "x", "shape": [2]}, {"name": "z", "shape": [2]}"#,
        );
        let s = store_with(&[("x", Interval::scalar(0.0, 1.0)), ("z", Interval::scalar(-2.0, 3.0))]);
        let out = run(&g, &ReferenceEvaluator, &s).unwrap();
        // rank-1 outputs are taken as-is
        assert_eq!(out[0].range, Interval::per_channel(vec![-3.0, -3.0], vec![3.0, 3.0]));
    }

    #[test]
    fn test_constant_only_node_is_evaluated_once() {
        let g = graph(
            r#"{"op_type": "Add", "inputs": ["a", "b"], "outputs": ["y"]}"#,
            r#"{"name": "a", "shape": [2], "data": [1, 2]}, {"name": "b", "shape": [2], "data": [3, 4]}"#,
            "",
        );
        let calls = std::cell::Cell::new(0);
        let counting = |node: &Node, inputs: &[Option<&ArrayD<f64>>], graph: &Graph| {
            calls.set(calls.get() + 1);
            ReferenceEvaluator.evaluate(node, inputs, graph)
        };
        let out = run(&g, &counting, &RangeStore::new()).unwrap();
        assert_eq!(calls.get(), 1);
        assert!(out[0].is_initializer);
        assert_eq!(out[0].range, Interval::point(ndarray::array![4.0, 6.0].into_dyn()));
    }

    #[test]
    fn test_non_monotonic_op_is_approximated_by_corners() {
        let g = graph(
            r#"{"op_type": "Relu", "inputs": ["x"], "outputs": ["y"]}"#,
            "",
            r#"{"name": "x", "shape": [1, 2]}"#,
        );
        let square = |_: &Node, inputs: &[Option<&ArrayD<f64>>], _: &Graph| -> Result<Vec<ArrayD<f64>>, EvalError> {
            let x = inputs[0].ok_or_else(|| EvalError::InvalidInput("square".to_string(), "no input".to_string()))?;
            Ok(vec![x.mapv(|v| v * v)])
        };
        let s = store_with(&[("x", Interval::scalar(-1.0, 1.0))]);
        let out = run(&g, &square, &s).unwrap();
        // x^2 over [-1, 1] is really [0, 1], but only the corners are sampled
        assert_eq!(out[0].range, Interval::per_channel(vec![1.0, 1.0], vec![1.0, 1.0]));
    }

    #[test]
    fn test_too_many_dynamic_inputs() {
        let inputs: Vec<String> = (0..64).map(|i| format!(r#""x{}""#, i)).collect();
        let g = graph(
            &format!(r#"{{"op_type": "Sum", "inputs": [{}], "outputs": ["y"]}}"#, inputs.join(", ")),
            "",
            "",
        );
        assert!(matches!(
            run(&g, &ReferenceEvaluator, &RangeStore::new()),
            Err(RuleError::UnsupportedConfiguration(..))
        ));
    }

    #[test]
    fn test_unrecognized_range_representation() {
        let g = graph(
            r#"{"op_type": "Relu", "inputs": ["x"], "outputs": ["y"]}"#,
            "",
            r#"{"name": "x", "shape": [1, 2]}"#,
        );
        let s = store_with(&[("x", Interval::per_channel(vec![0.0; 3], vec![1.0; 3]))]);
        assert!(matches!(run(&g, &ReferenceEvaluator, &s), Err(RuleError::UnrecognizedRange(..))));
    }

    #[test]
    fn test_missing_shape() {
        let g = graph(r#"{"op_type": "Relu", "inputs": ["x"], "outputs": ["y"]}"#, "", "");
        let s = store_with(&[("x", Interval::scalar(0.0, 1.0))]);
        assert!(matches!(run(&g, &ReferenceEvaluator, &s), Err(RuleError::MissingShape(..))));
    }

    #[test]
    fn test_declared_range() {
        let g = graph(
            r#"{"op_type": "Trunc", "inputs": ["x"], "outputs": ["y"]}, {"op_type": "Trunc", "inputs": ["x"], "outputs": ["z"]}"#,
            "",
            r#"{"name": "y", "dtype": "INT4"}"#,
        );
        let ctx = RuleContext {
            graph: &g,
            evaluator: &ReferenceEvaluator,
            channel_axis: 1,
        };
        let out = DeclaredRangeRule.compute(&ctx, &g.nodes()[0], &RangeStore::new()).unwrap();
        assert_eq!(out[0].range, Interval::scalar(-8.0, 7.0));
        assert!(matches!(
            DeclaredRangeRule.compute(&ctx, &g.nodes()[1], &RangeStore::new()),
            Err(RuleError::MissingDataType(..))
        ));
    }
}
