//! Upstream normalization: constant folding, shape inference and datatype
//! inference. Each step annotates what it can and logs what it cannot.

use crate::dtype::DataType;
use crate::evaluator::{EvalError, NodeEvaluator, evaluate_on_initializers};
use crate::graph::{Graph, Node};
use crate::interval::co_broadcast_shape;
use crate::rules::OpKind;
use ndarray::{ArrayD, IxDyn};
use std::collections::HashSet;

/// Normalized copy of `graph`; the input graph is left untouched.
pub fn normalize(graph: &Graph, evaluator: &dyn NodeEvaluator) -> Graph {
    let mut graph = graph.clone();
    fold_constants(&mut graph, evaluator);
    infer_shapes(&mut graph, evaluator);
    infer_datatypes(&mut graph);
    graph
}

/// Replace every node whose inputs are all initializers by initializers for
/// its outputs. Quantizers are kept so their weights stay visible.
pub fn fold_constants(graph: &mut Graph, evaluator: &dyn NodeEvaluator) {
    let nodes = graph.nodes().to_vec();
    let mut folded = HashSet::new();
    for (i, node) in nodes.iter().enumerate() {
        if matches!(node.op_kind(), OpKind::Quant | OpKind::BipolarQuant) {
            continue;
        }
        if !node.inputs.iter().filter(|x| !x.is_empty()).all(|x| graph.is_initializer(x)) {
            continue;
        }
        match evaluate_on_initializers(evaluator, node, graph) {
            Ok(values) if values.len() >= node.outputs.len() => {
                for (name, value) in node.outputs.iter().zip(values) {
                    if !name.is_empty() {
                        graph.set_initializer(name, value);
                    }
                }
                folded.insert(i);
            }
            Ok(values) => log::warn!(
                "Could not fold {}: expected {} outputs, got {}",
                node.name,
                node.outputs.len(),
                values.len()
            ),
            Err(err) => log::warn!("Could not fold {}: {}", node.name, err),
        }
    }
    log::info!("Folded {} constant nodes", folded.len());
    graph.retain_nodes(|i, _| !folded.contains(&i));
}

fn input_shape(graph: &Graph, node: &Node, idx: usize) -> Result<Vec<usize>, EvalError> {
    let name = node
        .input(idx)
        .ok_or_else(|| EvalError::MissingInput(node.name.clone(), idx))?;
    graph
        .shape(name)
        .map(<[usize]>::to_vec)
        .ok_or_else(|| EvalError::InvalidInput(node.name.clone(), format!("shape of \"{}\" is unknown", name)))
}

fn spatial_attr(node: &Node, name: &str, len: usize, default: usize) -> Vec<usize> {
    node.attr_ints(name)
        .map(|x| x.into_iter().map(|v| v.max(0) as usize).collect())
        .unwrap_or_else(|| vec![default; len])
}

fn conv_output_shape(graph: &Graph, node: &Node) -> Result<Vec<usize>, EvalError> {
    let x = input_shape(graph, node, 0)?;
    let w = input_shape(graph, node, 1)?;
    if x.len() < 3 || w.len() != x.len() {
        return Err(EvalError::InvalidInput(
            node.name.clone(),
            format!("Conv input {:?} and weight {:?}", x, w),
        ));
    }
    let spatial = x.len() - 2;
    let kernel = spatial_attr(node, "kernel_shape", 0, 0);
    let kernel = if kernel.is_empty() { w[2..].to_vec() } else { kernel };
    let strides = spatial_attr(node, "strides", spatial, 1);
    let dilations = spatial_attr(node, "dilations", spatial, 1);
    let pads = spatial_attr(node, "pads", 2 * spatial, 0);
    let auto_pad = node.attr_string("auto_pad").unwrap_or_else(|| "NOTSET".to_string());
    if kernel.len() != spatial || strides.len() != spatial || dilations.len() != spatial || pads.len() != 2 * spatial {
        return Err(EvalError::InvalidInput(node.name.clone(), "spatial attribute length mismatch".to_string()));
    }

    let mut out = vec![x[0], w[0]];
    for d in 0..spatial {
        let effective = (kernel[d].max(1) - 1) * dilations[d] + 1;
        let stride = strides[d].max(1);
        let dim = match auto_pad.as_str() {
            "SAME_UPPER" | "SAME_LOWER" => x[d + 2].div_ceil(stride),
            "VALID" => x[d + 2].checked_sub(effective).map(|v| v / stride + 1).unwrap_or(0),
            _ => (x[d + 2] + pads[d] + pads[d + spatial])
                .checked_sub(effective)
                .map(|v| v / stride + 1)
                .unwrap_or(0),
        };
        if dim == 0 {
            return Err(EvalError::InvalidInput(node.name.clone(), "empty Conv output".to_string()));
        }
        out.push(dim);
    }
    Ok(out)
}

fn conv_transpose_output_shape(graph: &Graph, node: &Node) -> Result<Vec<usize>, EvalError> {
    let x = input_shape(graph, node, 0)?;
    let w = input_shape(graph, node, 1)?;
    if x.len() < 3 || w.len() != x.len() {
        return Err(EvalError::InvalidInput(
            node.name.clone(),
            format!("ConvTranspose input {:?} and weight {:?}", x, w),
        ));
    }
    let spatial = x.len() - 2;
    let group = node.attr_int("group").unwrap_or(1).max(1) as usize;
    let mut out = vec![x[0], w[1] * group];
    if let Some(shape) = node.attr_ints("output_shape") {
        out.extend(shape.into_iter().map(|v| v.max(0) as usize));
        return Ok(out);
    }
    let kernel = spatial_attr(node, "kernel_shape", 0, 0);
    let kernel = if kernel.is_empty() { w[2..].to_vec() } else { kernel };
    let strides = spatial_attr(node, "strides", spatial, 1);
    let dilations = spatial_attr(node, "dilations", spatial, 1);
    let pads = spatial_attr(node, "pads", 2 * spatial, 0);
    let output_padding = spatial_attr(node, "output_padding", spatial, 0);
    if kernel.len() != spatial || strides.len() != spatial || pads.len() != 2 * spatial {
        return Err(EvalError::InvalidInput(node.name.clone(), "spatial attribute length mismatch".to_string()));
    }
    for d in 0..spatial {
        let effective = (kernel[d].max(1) - 1) * dilations.get(d).copied().unwrap_or(1) + 1;
        let full = strides[d] * x[d + 2].saturating_sub(1) + output_padding.get(d).copied().unwrap_or(0) + effective;
        let dim = full.saturating_sub(pads[d] + pads[d + spatial]);
        if dim == 0 {
            return Err(EvalError::InvalidInput(node.name.clone(), "empty ConvTranspose output".to_string()));
        }
        out.push(dim);
    }
    Ok(out)
}

fn matmul_output_shape(graph: &Graph, node: &Node) -> Result<Vec<usize>, EvalError> {
    let a = input_shape(graph, node, 0)?;
    let b = input_shape(graph, node, 1)?;
    let mismatch = || EvalError::InvalidInput(node.name.clone(), format!("cannot multiply {:?} by {:?}", a, b));
    if a.is_empty() || b.is_empty() {
        return Err(mismatch());
    }
    let a2 = if a.len() == 1 { vec![1, a[0]] } else { a.clone() };
    let b2 = if b.len() == 1 { vec![b[0], 1] } else { b.clone() };
    if a2[a2.len() - 1] != b2[b2.len() - 2] {
        return Err(mismatch());
    }
    let mut out = co_broadcast_shape(&a2[..a2.len() - 2], &b2[..b2.len() - 2]).ok_or_else(mismatch)?;
    if a.len() > 1 {
        out.push(a2[a2.len() - 2]);
    }
    if b.len() > 1 {
        out.push(b2[b2.len() - 1]);
    }
    Ok(out)
}

fn gemm_output_shape(graph: &Graph, node: &Node) -> Result<Vec<usize>, EvalError> {
    let a = input_shape(graph, node, 0)?;
    let b = input_shape(graph, node, 1)?;
    if a.len() != 2 || b.len() != 2 {
        return Err(EvalError::InvalidInput(node.name.clone(), format!("Gemm operands {:?} and {:?}", a, b)));
    }
    let m = if node.attr_bool("transA").unwrap_or(false) { a[1] } else { a[0] };
    let n = if node.attr_bool("transB").unwrap_or(false) { b[0] } else { b[1] };
    Ok(vec![m, n])
}

/// Output shapes found by running the node on zero-filled inputs.
fn evaluated_output_shapes(
    graph: &Graph,
    node: &Node,
    evaluator: &dyn NodeEvaluator,
) -> Result<Vec<Vec<usize>>, EvalError> {
    let values = node
        .inputs
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            if name.is_empty() {
                Ok(None)
            } else if let Some(value) = graph.get_initializer(name) {
                Ok(Some(value.clone()))
            } else {
                Ok(Some(ArrayD::zeros(IxDyn(&input_shape(graph, node, idx)?))))
            }
        })
        .collect::<Result<Vec<Option<ArrayD<f64>>>, EvalError>>()?;
    let inputs: Vec<Option<&ArrayD<f64>>> = values.iter().map(Option::as_ref).collect();
    Ok(evaluator
        .evaluate(node, &inputs, graph)?
        .iter()
        .map(|x| x.shape().to_vec())
        .collect())
}

/// Annotate missing output shapes, node by node in declared order.
pub fn infer_shapes(graph: &mut Graph, evaluator: &dyn NodeEvaluator) {
    let nodes = graph.nodes().to_vec();
    for node in &nodes {
        if node.outputs.iter().all(|name| name.is_empty() || graph.shape(name).is_some()) {
            continue;
        }
        let shapes = match node.op_kind() {
            OpKind::Conv => conv_output_shape(graph, node).map(|x| vec![x]),
            OpKind::ConvTranspose => conv_transpose_output_shape(graph, node).map(|x| vec![x]),
            OpKind::MatMul => matmul_output_shape(graph, node).map(|x| vec![x]),
            OpKind::Gemm => gemm_output_shape(graph, node).map(|x| vec![x]),
            _ => evaluated_output_shapes(graph, node, evaluator),
        };
        match shapes {
            Ok(shapes) => {
                for (name, shape) in node.outputs.iter().zip(shapes) {
                    if !name.is_empty() && graph.shape(name).is_none() {
                        graph.set_shape(name, shape);
                    }
                }
            }
            Err(err) => log::warn!("Could not infer output shapes of {}: {}", node.name, err),
        }
    }
}

fn single_initializer(graph: &Graph, node: &Node, idx: usize) -> Option<f64> {
    let value = graph.get_initializer(node.input(idx)?)?;
    if value.len() != 1 {
        return None;
    }
    value.iter().next().copied()
}

fn all_initializer_values(graph: &Graph, node: &Node, idx: usize, expected: f64) -> bool {
    node.input(idx)
        .and_then(|name| graph.get_initializer(name))
        .is_some_and(|value| value.iter().all(|&x| x == expected))
}

fn integer_type(bits: f64, signed: bool) -> Option<DataType> {
    if bits.fract() != 0.0 || bits < 1.0 {
        return None;
    }
    match (bits as u32, signed) {
        (1, true) => Some(DataType::Bipolar),
        (1, false) => Some(DataType::Binary),
        (bits, signed) => DataType::int(bits, signed).ok(),
    }
}

fn inferred_datatype(graph: &Graph, node: &Node) -> Option<DataType> {
    let signed = node.attr_bool("signed").unwrap_or(true);
    match node.op_kind() {
        OpKind::Quant => {
            let unit = all_initializer_values(graph, node, 1, 1.0) && all_initializer_values(graph, node, 2, 0.0);
            if !unit {
                return None;
            }
            integer_type(single_initializer(graph, node, 3)?, signed)
        }
        OpKind::BipolarQuant => all_initializer_values(graph, node, 1, 1.0).then_some(DataType::Bipolar),
        OpKind::Trunc => integer_type(single_initializer(graph, node, 4)?, signed),
        _ => None,
    }
}

/// Annotate quantizer and truncation outputs with their integer datatypes.
pub fn infer_datatypes(graph: &mut Graph) {
    let nodes = graph.nodes().to_vec();
    for node in &nodes {
        let Some(output) = node.outputs.first().filter(|x| !x.is_empty()) else {
            continue;
        };
        if graph.dtype(output).is_some() {
            continue;
        }
        match inferred_datatype(graph, node) {
            Some(dtype) => graph.set_dtype(output, dtype),
            None => log::debug!("No datatype inferred for {}", output),
        }
    }
}
