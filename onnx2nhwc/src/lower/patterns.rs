//! Multi-node idioms recognized before lowering.
//!
//! Currently one: exporters express "pad with the per-channel mean" as
//!
//! ```text
//! t = Sub(x, c); p = Pad(t, value = 0); y = Add(p, c)
//! ```
//!
//! When the target pad accepts a per-channel fill this becomes a single
//! `Pad` of `x` filled with `c`. Otherwise the three nodes lower literally.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::TargetCapabilities;
use crate::error::Result;
use crate::format::Operand;
use crate::ir::graph::{ConstantValue, TensorData};
use crate::ir::onnx::{Attribute, Node, OnnxGraph, OpKind};
use crate::ir::target::PadFill;

use super::elementwise::per_channel_values;
use super::shape::{pad_mode, spatial_pads};
use super::{Lowerer, NodeCtx};

/// What the walker does at a node that takes part in an idiom.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Absorbed into a later node of the idiom; nothing is emitted.
    Skip,
    /// Lower this `Pad` with input 0 read from `source`, filled with `fill`.
    PadFill {
        source: String,
        fill: Arc<ConstantValue>,
    },
    /// Output 0 is the value already bound to `source`.
    Alias { source: String },
}

#[derive(Debug, Clone, Default)]
pub struct PatternPlan {
    actions: HashMap<usize, Action>,
}

impl PatternPlan {
    pub fn action(&self, node: usize) -> Option<&Action> {
        self.actions.get(&node)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

struct Uses<'g> {
    producer: HashMap<&'g str, usize>,
    consumers: HashMap<&'g str, Vec<usize>>,
    outputs: Vec<&'g str>,
}

impl<'g> Uses<'g> {
    fn new(graph: &'g OnnxGraph) -> Self {
        let mut producer = HashMap::new();
        let mut consumers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, node) in graph.nodes.iter().enumerate() {
            for out in &node.outputs {
                producer.insert(out.as_str(), i);
            }
            for input in node.inputs.iter().filter(|s| !s.is_empty()) {
                consumers.entry(input.as_str()).or_default().push(i);
            }
        }
        Self {
            producer,
            consumers,
            outputs: graph.outputs.iter().map(String::as_str).collect(),
        }
    }

    /// The single node reading `name`, if nothing else (graph outputs
    /// included) does.
    fn sole_consumer(&self, name: &str) -> Option<usize> {
        if self.outputs.contains(&name) {
            return None;
        }
        match self.consumers.get(name).map(Vec::as_slice) {
            Some([only]) => Some(*only),
            _ => None,
        }
    }
}

/// Scalar, or `(C, 1, 1)` / `(1, C, 1, 1)`.
fn is_per_channel(value: &ConstantValue) -> bool {
    if value.len() == 1 {
        return true;
    }
    if value.rank() < 3 || value.rank() > 4 {
        return false;
    }
    let mut padded = vec![1; 4 - value.rank()];
    padded.extend_from_slice(&value.shape);
    padded[0] == 1 && padded[2] == 1 && padded[3] == 1
}

/// Declared rank of a runtime tensor, from the graph inputs or value info.
fn declared_rank(graph: &OnnxGraph, name: &str) -> Option<usize> {
    graph
        .inputs
        .iter()
        .chain(graph.value_info.iter())
        .find(|v| v.name == name)
        .map(|v| v.shape.len())
}

fn zero_pad_value(graph: &OnnxGraph, pad: &Node, opset: i64) -> bool {
    if opset < 11 {
        return match pad.attribute("value") {
            None => true,
            Some(Attribute::Float(v)) => *v == 0.0,
            Some(_) => false,
        };
    }
    match pad.inputs.get(2).filter(|s| !s.is_empty()) {
        None => true,
        Some(name) => graph
            .constant_value(name)
            .and_then(|v| v.as_scalar_f32())
            .map_or(false, |v| v == 0.0),
    }
}

fn constant_mode(pad: &Node) -> bool {
    match pad.attribute("mode") {
        None => true,
        Some(Attribute::String(mode)) => mode == "constant",
        Some(_) => false,
    }
}

/// Find every pad-fill idiom the target can fuse.
pub fn plan(graph: &OnnxGraph, caps: &TargetCapabilities, opset: i64) -> PatternPlan {
    let mut actions = HashMap::new();
    if !caps.per_channel_pad_fill {
        return PatternPlan { actions };
    }
    let uses = Uses::new(graph);
    let kind = |i: usize| OpKind::from_op_type(&graph.nodes[i].op_type);

    for (pad_index, pad) in graph.nodes.iter().enumerate() {
        if kind(pad_index) != Some(OpKind::Pad) || !constant_mode(pad) {
            continue;
        }
        if !zero_pad_value(graph, pad, opset) {
            continue;
        }
        let Some(padded) = pad.inputs.first() else {
            continue;
        };
        let Some(&sub_index) = uses.producer.get(padded.as_str()) else {
            continue;
        };
        let sub = &graph.nodes[sub_index];
        if kind(sub_index) != Some(OpKind::Sub) || uses.sole_consumer(padded) != Some(pad_index) {
            continue;
        }
        let (Some(x), Some(c_name)) = (sub.inputs.first(), sub.inputs.get(1)) else {
            continue;
        };
        if graph.constant_value(x).is_some() || declared_rank(graph, x) != Some(4) {
            continue;
        }
        let Some(fill) = graph.constant_value(c_name).filter(is_per_channel) else {
            continue;
        };

        let Some(pad_out) = pad.outputs.first() else {
            continue;
        };
        let Some(add_index) = uses.sole_consumer(pad_out) else {
            continue;
        };
        let add = &graph.nodes[add_index];
        if kind(add_index) != Some(OpKind::Add) || add.inputs.len() != 2 {
            continue;
        }
        let other = if add.inputs[0] == *pad_out {
            &add.inputs[1]
        } else {
            &add.inputs[0]
        };
        if graph.constant_value(other).as_ref() != Some(&fill) {
            continue;
        }

        log::info!(
            "recognized pad-fill idiom '{}' -> '{}' -> '{}'",
            sub.name,
            pad.name,
            add.name
        );
        actions.insert(sub_index, Action::Skip);
        actions.insert(
            pad_index,
            Action::PadFill {
                source: x.clone(),
                fill: Arc::new(fill),
            },
        );
        actions.insert(
            add_index,
            Action::Alias {
                source: pad_out.clone(),
            },
        );
    }
    PatternPlan { actions }
}

/// Lower a `Pad` whose input 0 is already the un-shifted source.
pub fn lower_pad_fill(lw: &mut Lowerer, ctx: &NodeCtx, fill: &ConstantValue) -> Result<Vec<Operand>> {
    let x = ctx.input(0)?;
    if x.rank() != 4 {
        return Err(ctx.unsupported(format!("pad fill on rank {}", x.rank())));
    }
    let mode = pad_mode(ctx)?;
    let pads = spatial_pads(ctx)?;
    let channels = x.source_shape()[1];
    let name = ctx.output_name(0);

    let fill = match fill.as_scalar_f32() {
        Some(v) => PadFill::Constant(v),
        None => {
            let values = per_channel_values(fill, channels).ok_or_else(|| {
                ctx.unsupported(format!(
                    "fill of shape {:?} for {channels} channels",
                    fill.shape
                ))
            })?;
            let values = ConstantValue::new(vec![channels], TensorData::F32(values));
            PadFill::PerChannel(lw.constant(&format!("{name}/fill"), &values))
        }
    };
    let (input, shape) = lw.ensure_image(x)?;
    let (output, shape) = lw.pad_image(name, input, shape, pads, fill, mode);
    Ok(vec![Operand::Image { id: output, shape }])
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::TranslateConfig;
    use crate::ir::target::TargetOp;

    fn mean(c: usize) -> TensorData {
        TensorData::F32((0..c).map(|i| i as f32 + 0.5).collect())
    }

    fn idiom(add_constant: &str) -> OnnxGraph {
        let mut g = OnnxGraph::new();
        g.input("x", vec![1, 3, 4, 4])
            .initializer("c", vec![1, 3, 1, 1], mean(3))
            .initializer("c2", vec![1, 3, 1, 1], mean(3))
            .initializer("pads", vec![8], TensorData::I64(vec![0, 0, 1, 1, 0, 0, 1, 1]))
            .node(Node::new("Sub", &["x", "c"], &["t"]), vec![1, 3, 4, 4])
            .node(Node::new("Pad", &["t", "pads"], &["p"]), vec![1, 3, 6, 6])
            .node(Node::new("Add", &["p", add_constant], &["y"]), vec![1, 3, 6, 6])
            .output("y");
        g
    }

    #[test]
    fn plans_skip_fill_and_alias() {
        let g = idiom("c");
        let plan = plan(&g, &TargetCapabilities::default(), 11);
        assert_eq!(plan.action(0), Some(&Action::Skip));
        assert!(matches!(plan.action(1), Some(Action::PadFill { source, .. }) if source == "x"));
        assert_eq!(
            plan.action(2),
            Some(&Action::Alias {
                source: "p".to_string()
            })
        );
    }

    #[test]
    fn equal_valued_constants_match() {
        let g = idiom("c2");
        assert!(!plan(&g, &TargetCapabilities::default(), 11).is_empty());
    }

    #[test]
    fn no_plan_without_capability() {
        let g = idiom("c");
        let caps = TargetCapabilities {
            per_channel_pad_fill: false,
            ..TargetCapabilities::default()
        };
        assert!(plan(&g, &caps, 11).is_empty());
    }

    #[test]
    fn no_plan_when_shifted_value_escapes() {
        let mut g = idiom("c");
        g.output("t");
        assert!(plan(&g, &TargetCapabilities::default(), 11).is_empty());
    }

    #[test]
    fn no_plan_for_spatial_constant() {
        let mut g = idiom("c");
        g.initializers[0] = crate::ir::onnx::Initializer {
            name: "c".to_string(),
            shape: vec![1, 1, 4, 4],
            data: TensorData::F32(vec![0.0; 16]),
        };
        assert!(plan(&g, &TargetCapabilities::default(), 11).is_empty());
    }

    #[test]
    fn no_plan_for_rank3_source() {
        let mut g = OnnxGraph::new();
        g.input("x", vec![3, 4, 4])
            .initializer("c", vec![3, 1, 1], mean(3))
            .initializer("pads", vec![6], TensorData::I64(vec![0, 1, 1, 0, 1, 1]))
            .node(Node::new("Sub", &["x", "c"], &["t"]), vec![3, 4, 4])
            .node(Node::new("Pad", &["t", "pads"], &["p"]), vec![3, 6, 6])
            .node(Node::new("Add", &["p", "c"], &["y"]), vec![3, 6, 6])
            .output("y");
        assert!(plan(&g, &TargetCapabilities::default(), 11).is_empty());
    }

    #[test]
    fn no_plan_when_source_rank_unknown() {
        let mut g = idiom("c");
        g.inputs.clear();
        assert!(plan(&g, &TargetCapabilities::default(), 11).is_empty());
    }

    #[test]
    fn fused_pad_fills_per_channel() {
        let cfg = TranslateConfig::default();
        let mut lw = Lowerer::new(&cfg);
        let x = image_input(&mut lw, "x", &[1, 3, 4, 4]);
        let pads = Operand::constant(ConstantValue::vector_i64(vec![0, 0, 1, 1, 0, 0, 1, 1]));
        let node = Node::new("Pad", &["t", "pads"], &["p"]);
        let c = ctx(&node, vec![Some(x), Some(pads)], vec![], 11);
        let fill = ConstantValue::new(vec![1, 3, 1, 1], mean(3));
        let out = lower_pad_fill(&mut lw, &c, &fill).unwrap();
        assert_eq!(out[0].shape(), vec![1, 6, 6, 3]);
        let graph = lw.finish();
        assert_eq!(graph.ops.len(), 1);
        match &graph.ops[0] {
            TargetOp::Pad {
                fill: PadFill::PerChannel(id),
                ..
            } => {
                assert_eq!(graph.tensor(*id).shape, vec![3]);
            }
            other => panic!("Expected per-channel Pad, got {:?}", other),
        }
    }
}
