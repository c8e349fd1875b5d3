pub mod graph;
pub mod onnx;
pub mod target;

pub use graph::{ConstantValue, DType, Graph, Tensor, TensorData, TensorId, TensorKind};
pub use onnx::{Attribute, Initializer, Node, OnnxGraph, OpKind, ValueInfo};
pub use target::{TargetGraph, TargetOp};
