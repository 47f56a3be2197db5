//! Static dataflow graph consumed by the analysis.
//!
//! The graph is deserialized from a JSON description (see [`GraphDescription`])
//! and is read-only to the analysis passes. Only the normalization pre-pass
//! builds modified copies.

use crate::dtype::{DataType, DataTypeError};
use crate::rules::OpKind;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Failed to parse graph description: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Failed to read graph description: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Initializer \"{0}\" has {1} values but shape {2:?}")]
    InitializerShape(String, usize, Vec<usize>),
    #[error("Tensor \"{0}\" is produced more than once")]
    DuplicateProducer(String),
    #[error("Tensor \"{0}\" is declared more than once")]
    DuplicateDeclaration(String),
    #[error(transparent)]
    DataTypeError(#[from] DataTypeError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attribute {
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    String(String),
}

pub(crate) fn query_attribute_int(attributes: &BTreeMap<String, Attribute>, name: &str) -> Option<i64> {
    match attributes.get(name)? {
        Attribute::Int(x) => Some(*x),
        _ => None,
    }
}

pub(crate) fn query_attribute_float(attributes: &BTreeMap<String, Attribute>, name: &str) -> Option<f64> {
    match attributes.get(name)? {
        Attribute::Float(x) => Some(*x),
        Attribute::Int(x) => Some(*x as f64),
        _ => None,
    }
}

pub(crate) fn query_attribute_ints(attributes: &BTreeMap<String, Attribute>, name: &str) -> Option<Vec<i64>> {
    match attributes.get(name)? {
        Attribute::Ints(x) => Some(x.clone()),
        Attribute::Int(x) => Some(vec![*x]),
        _ => None,
    }
}

pub(crate) fn query_attribute_floats(attributes: &BTreeMap<String, Attribute>, name: &str) -> Option<Vec<f64>> {
    match attributes.get(name)? {
        Attribute::Floats(x) => Some(x.clone()),
        Attribute::Ints(x) => Some(x.iter().map(|&v| v as f64).collect()),
        Attribute::Float(x) => Some(vec![*x]),
        Attribute::Int(x) => Some(vec![*x as f64]),
        _ => None,
    }
}

pub(crate) fn query_attribute_string(attributes: &BTreeMap<String, Attribute>, name: &str) -> Option<String> {
    match attributes.get(name)? {
        Attribute::String(x) => Some(x.clone()),
        _ => None,
    }
}

pub(crate) fn query_attribute_bool(attributes: &BTreeMap<String, Attribute>, name: &str) -> Option<bool> {
    query_attribute_int(attributes, name).map(|x| x != 0)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

impl Node {
    pub fn op_kind(&self) -> OpKind {
        OpKind::parse(&self.op_type)
    }

    /// Name of input `idx`, if present and not an omitted optional input.
    pub fn input(&self, idx: usize) -> Option<&str> {
        self.inputs.get(idx).map(String::as_str).filter(|x| !x.is_empty())
    }

    pub fn attr_int(&self, name: &str) -> Option<i64> {
        query_attribute_int(&self.attributes, name)
    }

    pub fn attr_float(&self, name: &str) -> Option<f64> {
        query_attribute_float(&self.attributes, name)
    }

    pub fn attr_ints(&self, name: &str) -> Option<Vec<i64>> {
        query_attribute_ints(&self.attributes, name)
    }

    pub fn attr_floats(&self, name: &str) -> Option<Vec<f64>> {
        query_attribute_floats(&self.attributes, name)
    }

    pub fn attr_string(&self, name: &str) -> Option<String> {
        query_attribute_string(&self.attributes, name)
    }

    pub fn attr_bool(&self, name: &str) -> Option<bool> {
        query_attribute_bool(&self.attributes, name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub shape: Option<Vec<usize>>,
    pub dtype: Option<DataType>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueInfoDescription {
    pub name: String,
    #[serde(default)]
    pub shape: Option<Vec<usize>>,
    #[serde(default)]
    pub dtype: Option<DataType>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitializerDescription {
    pub name: String,
    #[serde(default)]
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
    #[serde(default)]
    pub dtype: Option<DataType>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    #[serde(default)]
    pub name: Option<String>,
    pub op_type: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

/// Serialized form of a [`Graph`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<ValueInfoDescription>,
    #[serde(default)]
    pub outputs: Vec<ValueInfoDescription>,
    #[serde(default)]
    pub value_info: Vec<ValueInfoDescription>,
    #[serde(default)]
    pub initializers: Vec<InitializerDescription>,
    #[serde(default)]
    pub nodes: Vec<NodeDescription>,
}

#[derive(Clone, Debug, Default)]
pub struct Graph {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    tensors: HashMap<String, TensorInfo>,
    initializers: HashMap<String, ArrayD<f64>>,
    initializer_order: Vec<String>,
    nodes: Vec<Node>,
}

impl Graph {
    pub fn from_json(text: &str) -> Result<Self, GraphError> {
        let description: GraphDescription = serde_json::from_str(text)?;
        Self::from_description(description)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, GraphError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_description(description: GraphDescription) -> Result<Self, GraphError> {
        let mut graph = Graph {
            name: description.name,
            ..Default::default()
        };

        let mut declared = HashSet::new();
        for vi in description
            .inputs
            .iter()
            .chain(description.outputs.iter())
            .chain(description.value_info.iter())
        {
            let entry = graph.tensors.entry(vi.name.clone()).or_default();
            if vi.shape.is_some() {
                entry.shape = vi.shape.clone();
            }
            if vi.dtype.is_some() {
                entry.dtype = vi.dtype;
            }
        }
        for vi in &description.value_info {
            if !declared.insert(vi.name.clone()) {
                return Err(GraphError::DuplicateDeclaration(vi.name.clone()));
            }
        }
        graph.inputs = description.inputs.into_iter().map(|x| x.name).collect();
        graph.outputs = description.outputs.into_iter().map(|x| x.name).collect();

        for init in description.initializers {
            let len = init.data.len();
            let value = ArrayD::from_shape_vec(IxDyn(&init.shape), init.data)
                .map_err(|_| GraphError::InitializerShape(init.name.clone(), len, init.shape.clone()))?;
            let entry = graph.tensors.entry(init.name.clone()).or_default();
            entry.shape = Some(init.shape);
            if init.dtype.is_some() {
                entry.dtype = init.dtype;
            }
            graph.set_initializer(&init.name, value);
        }

        let mut produced = HashSet::new();
        for (i, node) in description.nodes.into_iter().enumerate() {
            for output in node.outputs.iter().filter(|x| !x.is_empty()) {
                if !produced.insert(output.clone()) {
                    return Err(GraphError::DuplicateProducer(output.clone()));
                }
                graph.tensors.entry(output.clone()).or_default();
            }
            for input in node.inputs.iter().filter(|x| !x.is_empty()) {
                graph.tensors.entry(input.clone()).or_default();
            }
            graph.nodes.push(Node {
                name: node.name.unwrap_or_else(|| format!("{}_{}", node.op_type, i)),
                op_type: node.op_type,
                inputs: node.inputs,
                outputs: node.outputs,
                attributes: node.attributes,
            });
        }
        Ok(graph)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Nodes in declared (topological) order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn get_initializer(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.initializers.get(name)
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    /// Initializers in declaration order.
    pub fn initializers(&self) -> impl Iterator<Item = (&str, &ArrayD<f64>)> {
        self.initializer_order
            .iter()
            .filter_map(|name| self.initializers.get(name).map(|v| (name.as_str(), v)))
    }

    /// A tensor is dynamic when it is named and not a graph constant.
    pub fn is_dynamic(&self, name: &str) -> bool {
        !name.is_empty() && !self.is_initializer(name)
    }

    pub fn dynamic_inputs<'a>(&self, node: &'a Node) -> Vec<&'a str> {
        node.inputs
            .iter()
            .map(String::as_str)
            .filter(|x| self.is_dynamic(x))
            .collect()
    }

    pub fn tensor_info(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.get(name)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        if let Some(value) = self.initializers.get(name) {
            return Some(value.shape());
        }
        self.tensors.get(name)?.shape.as_deref()
    }

    pub fn dtype(&self, name: &str) -> Option<DataType> {
        self.tensors.get(name)?.dtype
    }

    pub(crate) fn set_initializer(&mut self, name: &str, value: ArrayD<f64>) {
        if !self.initializers.contains_key(name) {
            self.initializer_order.push(name.to_string());
        }
        self.tensors.entry(name.to_string()).or_default().shape = Some(value.shape().to_vec());
        self.initializers.insert(name.to_string(), value);
    }

    pub(crate) fn set_shape(&mut self, name: &str, shape: Vec<usize>) {
        self.tensors.entry(name.to_string()).or_default().shape = Some(shape);
    }

    pub(crate) fn set_dtype(&mut self, name: &str, dtype: DataType) {
        self.tensors.entry(name.to_string()).or_default().dtype = Some(dtype);
    }

    pub(crate) fn retain_nodes(&mut self, keep: impl Fn(usize, &Node) -> bool) {
        let nodes = std::mem::take(&mut self.nodes);
        self.nodes = nodes
            .into_iter()
            .enumerate()
            .filter(|(i, node)| keep(*i, node))
            .map(|(_, node)| node)
            .collect();
    }
}
