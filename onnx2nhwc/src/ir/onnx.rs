//! Source dialect: an already-parsed channel-first ONNX graph.
//!
//! Loading the protobuf container is somebody else's job; this is the shape
//! the translator consumes. It deserializes from JSON so the command-line
//! front end can feed it dumps produced by an external loader.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ir::graph::{ConstantValue, DType, TensorData};

/// Closed set of source operators the lowering table knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Conv,
    ConvTranspose,
    MaxPool,
    AveragePool,
    GlobalAveragePool,
    ReduceMean,
    BatchNormalization,
    Relu,
    LeakyRelu,
    PRelu,
    Sigmoid,
    Tanh,
    Softmax,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Abs,
    Sqrt,
    Clip,
    Equal,
    Concat,
    Reshape,
    Flatten,
    Squeeze,
    Unsqueeze,
    Transpose,
    Slice,
    Pad,
    Upsample,
    Resize,
    MatMul,
    Gemm,
    Dropout,
    Identity,
    Constant,
    Shape,
    Gather,
    Cast,
}

impl OpKind {
    pub fn from_op_type(op_type: &str) -> Option<OpKind> {
        let kind = match op_type {
            "Conv" => OpKind::Conv,
            "ConvTranspose" => OpKind::ConvTranspose,
            "MaxPool" => OpKind::MaxPool,
            "AveragePool" => OpKind::AveragePool,
            "GlobalAveragePool" => OpKind::GlobalAveragePool,
            "ReduceMean" => OpKind::ReduceMean,
            "BatchNormalization" => OpKind::BatchNormalization,
            "Relu" => OpKind::Relu,
            "LeakyRelu" => OpKind::LeakyRelu,
            "PRelu" => OpKind::PRelu,
            "Sigmoid" => OpKind::Sigmoid,
            "Tanh" => OpKind::Tanh,
            "Softmax" => OpKind::Softmax,
            "Add" => OpKind::Add,
            "Sub" => OpKind::Sub,
            "Mul" => OpKind::Mul,
            "Div" => OpKind::Div,
            "Neg" => OpKind::Neg,
            "Abs" => OpKind::Abs,
            "Sqrt" => OpKind::Sqrt,
            "Clip" => OpKind::Clip,
            "Equal" => OpKind::Equal,
            "Concat" => OpKind::Concat,
            "Reshape" => OpKind::Reshape,
            "Flatten" => OpKind::Flatten,
            "Squeeze" => OpKind::Squeeze,
            "Unsqueeze" => OpKind::Unsqueeze,
            "Transpose" => OpKind::Transpose,
            "Slice" => OpKind::Slice,
            "Pad" => OpKind::Pad,
            "Upsample" => OpKind::Upsample,
            "Resize" => OpKind::Resize,
            "MatMul" => OpKind::MatMul,
            "Gemm" => OpKind::Gemm,
            "Dropout" => OpKind::Dropout,
            "Identity" => OpKind::Identity,
            "Constant" => OpKind::Constant,
            "Shape" => OpKind::Shape,
            "Gather" => OpKind::Gather,
            "Cast" => OpKind::Cast,
            _ => return None,
        };
        Some(kind)
    }

    /// Operators that only reinterpret the shape of their first input.
    pub fn is_view(self) -> bool {
        matches!(
            self,
            OpKind::Reshape | OpKind::Flatten | OpKind::Squeeze | OpKind::Unsqueeze
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Attribute {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    String(String),
    Tensor(ConstantValue),
}

impl From<i64> for Attribute {
    fn from(v: i64) -> Self {
        Attribute::Int(v)
    }
}

impl From<f32> for Attribute {
    fn from(v: f32) -> Self {
        Attribute::Float(v)
    }
}

impl From<Vec<i64>> for Attribute {
    fn from(v: Vec<i64>) -> Self {
        Attribute::Ints(v)
    }
}

impl From<Vec<f32>> for Attribute {
    fn from(v: Vec<f32>) -> Self {
        Attribute::Floats(v)
    }
}

impl From<&str> for Attribute {
    fn from(v: &str) -> Self {
        Attribute::String(v.to_string())
    }
}

impl From<ConstantValue> for Attribute {
    fn from(v: ConstantValue) -> Self {
        Attribute::Tensor(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub name: String,
    pub op_type: String,
    /// Ordered input names; an empty string marks an omitted optional input.
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

impl Node {
    pub fn new(op_type: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        let name = outputs
            .first()
            .map(|o| format!("{op_type}_{o}"))
            .unwrap_or_else(|| op_type.to_string());
        Self {
            name,
            op_type: op_type.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn attr(mut self, key: &str, value: impl Into<Attribute>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&Attribute> {
        self.attributes.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    pub shape: Vec<usize>,
    #[serde(default)]
    pub dtype: DType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Initializer {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: TensorData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnnxGraph {
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub initializers: Vec<Initializer>,
    pub nodes: Vec<Node>,
    /// Shape metadata for intermediate and output values.
    #[serde(default)]
    pub value_info: Vec<ValueInfo>,
    #[serde(default)]
    pub opset_version: Option<i64>,
}

impl OnnxGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(&mut self, name: &str, shape: Vec<usize>) -> &mut Self {
        self.inputs.push(ValueInfo {
            name: name.to_string(),
            shape,
            dtype: DType::F32,
        });
        self
    }

    pub fn initializer(&mut self, name: &str, shape: Vec<usize>, data: TensorData) -> &mut Self {
        self.initializers.push(Initializer {
            name: name.to_string(),
            shape,
            data,
        });
        self
    }

    /// Append a node and record the shape of its first output.
    pub fn node(&mut self, node: Node, output_shape: Vec<usize>) -> &mut Self {
        if let Some(out) = node.outputs.first() {
            self.value_info.push(ValueInfo {
                name: out.clone(),
                shape: output_shape,
                dtype: DType::F32,
            });
        }
        self.nodes.push(node);
        self
    }

    pub fn output(&mut self, name: &str) -> &mut Self {
        self.outputs.push(name.to_string());
        self
    }

    pub fn initializer_value(&self, name: &str) -> Option<ConstantValue> {
        self.initializers
            .iter()
            .find(|i| i.name == name)
            .map(|i| ConstantValue::new(i.shape.clone(), i.data.clone()))
    }

    /// Constant value bound to `name`, either as an initializer or as the
    /// output of a `Constant` node.
    pub fn constant_value(&self, name: &str) -> Option<ConstantValue> {
        if let Some(value) = self.initializer_value(name) {
            return Some(value);
        }
        let node = self
            .nodes
            .iter()
            .find(|n| n.op_type == "Constant" && n.outputs.first().map(String::as_str) == Some(name))?;
        match node.attribute("value") {
            Some(Attribute::Tensor(value)) => Some(value.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_kinds_parse() {
        assert_eq!(OpKind::from_op_type("Conv"), Some(OpKind::Conv));
        assert_eq!(OpKind::from_op_type("Upsample"), Some(OpKind::Upsample));
        assert_eq!(OpKind::from_op_type("LSTM"), None);
        assert!(OpKind::Flatten.is_view());
        assert!(!OpKind::Conv.is_view());
    }

    #[test]
    fn builder_records_output_shapes() {
        let mut g = OnnxGraph::new();
        g.input("x", vec![1, 3, 8, 8])
            .node(Node::new("Relu", &["x"], &["y"]), vec![1, 3, 8, 8])
            .output("y");
        assert_eq!(g.value_info.len(), 1);
        assert_eq!(g.value_info[0].name, "y");
        assert_eq!(g.nodes[0].name, "Relu_y");
    }

    #[test]
    fn constant_lookup_sees_constant_nodes() {
        let mut g = OnnxGraph::new();
        g.initializer("w", vec![2], TensorData::F32(vec![1.0, 2.0]));
        g.node(
            Node::new("Constant", &[], &["k"])
                .attr("value", ConstantValue::vector_i64(vec![1, -1])),
            vec![2],
        );
        assert_eq!(g.constant_value("w").map(|c| c.len()), Some(2));
        assert_eq!(
            g.constant_value("k").map(|c| c.data),
            Some(TensorData::I64(vec![1, -1]))
        );
        assert!(g.constant_value("nope").is_none());
    }

    #[test]
    fn graph_json_round_trip() {
        let json = r#"{
            "inputs": [{"name": "x", "shape": [1, 3, 4, 4]}],
            "outputs": ["y"],
            "nodes": [{"op_type": "Relu", "inputs": ["x"], "outputs": ["y"]}],
            "value_info": [{"name": "y", "shape": [1, 3, 4, 4]}]
        }"#;
        let g: OnnxGraph = serde_json::from_str(json).unwrap();
        assert_eq!(g.inputs[0].dtype, DType::F32);
        assert_eq!(g.nodes[0].op_type, "Relu");
        assert!(g.initializers.is_empty());
    }
}
