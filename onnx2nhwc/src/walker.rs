//! Graph Walker: one pass over the source nodes in order.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::{OutputLayout, TranslateConfig};
use crate::diagnostics::{Diagnostic, GapDetector};
use crate::error::{Error, Result};
use crate::format::{DataFormat, Operand};
use crate::ir::graph::{ConstantValue, TensorKind};
use crate::ir::onnx::{OnnxGraph, OpKind};
use crate::ir::target::TargetGraph;
use crate::lower::patterns::{self, Action};
use crate::lower::{lower_node, Lowerer, NodeCtx};
use crate::registry::{Producer, TensorRegistry};

/// Result of one translation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetModel {
    pub graph: TargetGraph,
    pub diagnostics: Vec<Diagnostic>,
}

/// Reject duplicate definitions and index where each name is produced.
fn index_producers(source: &OnnxGraph) -> Result<HashMap<&str, usize>> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut producers = HashMap::new();
    let defined = source
        .inputs
        .iter()
        .map(|v| v.name.as_str())
        .chain(source.initializers.iter().map(|i| i.name.as_str()));
    for name in defined {
        // Older exporters list initializers among the inputs too.
        seen.insert(name);
    }
    for (i, node) in source.nodes.iter().enumerate() {
        for out in node.outputs.iter().filter(|o| !o.is_empty()) {
            if !seen.insert(out.as_str()) {
                return Err(Error::MalformedGraph(format!(
                    "tensor '{out}' is produced more than once (again by node '{}')",
                    node.name
                )));
            }
            producers.insert(out.as_str(), i);
        }
    }
    Ok(producers)
}

fn consumed_names(source: &OnnxGraph) -> HashSet<&str> {
    source
        .nodes
        .iter()
        .flat_map(|n| n.inputs.iter())
        .chain(source.outputs.iter())
        .filter(|s| !s.is_empty())
        .map(String::as_str)
        .collect()
}

/// Translate a channel-first source graph into the channel-last target
/// dialect.
///
/// Fails without a partial result on the first fatal error. Optimization
/// gaps are returned alongside the graph.
pub fn translate(source: &OnnxGraph, config: &TranslateConfig) -> Result<TargetModel> {
    let producers = index_producers(source)?;
    let consumed = consumed_names(source);
    let shapes: HashMap<&str, &[usize]> = source
        .value_info
        .iter()
        .chain(source.inputs.iter())
        .map(|v| (v.name.as_str(), v.shape.as_slice()))
        .collect();

    let mut lw = Lowerer::new(config);
    let mut registry = TensorRegistry::new();
    let mut detector = GapDetector::new();

    for init in &source.initializers {
        let value = ConstantValue::new(init.shape.clone(), init.data.clone());
        registry.register(&init.name, Producer::Initializer, Operand::constant(value))?;
    }
    for input in &source.inputs {
        if registry.contains(&input.name) {
            continue;
        }
        let operand = lw.input(&input.name, &input.shape, input.dtype);
        registry.register(&input.name, Producer::GraphInput, operand)?;
    }

    let plan = patterns::plan(source, &config.capabilities, config.opset_version);

    for (index, node) in source.nodes.iter().enumerate() {
        let action = plan.action(index);
        match action {
            Some(Action::Skip) => continue,
            Some(Action::Alias { source: from }) => {
                let operand = registry.lookup(from)?.clone();
                if let Some(out) = node.outputs.first() {
                    registry.register(out, Producer::Node(index), operand)?;
                }
                continue;
            }
            Some(Action::PadFill { .. }) | None => {}
        }

        let kind = OpKind::from_op_type(&node.op_type).ok_or_else(|| Error::UnsupportedOperator {
            node: node.name.clone(),
            op: node.op_type.clone(),
            reason: "unknown operator".to_string(),
        })?;

        // A fused pad reads the un-shifted source in place of input 0.
        let substitute = match action {
            Some(Action::PadFill { source: from, .. }) => Some(from.as_str()),
            _ => None,
        };
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for (i, declared) in node.inputs.iter().enumerate() {
            let name = match substitute {
                Some(from) if i == 0 => from,
                _ => declared.as_str(),
            };
            if name.is_empty() {
                inputs.push(None);
                continue;
            }
            if !registry.contains(name) {
                return Err(Error::MalformedGraph(match producers.get(name) {
                    Some(&p) if p >= index => format!(
                        "node '{}' reads '{name}' before node '{}' produces it",
                        node.name, source.nodes[p].name
                    ),
                    _ => format!("node '{}' reads undefined tensor '{name}'", node.name),
                }));
            }
            inputs.push(Some(registry.lookup(name)?.clone()));
        }

        let ctx = NodeCtx {
            node,
            index,
            kind,
            inputs,
            output_shapes: node
                .outputs
                .iter()
                .map(|o| shapes.get(o.as_str()).map(|s| s.to_vec()))
                .collect(),
            output_used: node
                .outputs
                .iter()
                .map(|o| consumed.contains(o.as_str()))
                .collect(),
            opset: config.opset_version,
        };
        detector.observe(&ctx, &registry);

        let outputs = match action {
            Some(Action::PadFill { fill, .. }) => patterns::lower_pad_fill(&mut lw, &ctx, fill)?,
            _ => lower_node(&mut lw, &ctx)?,
        };
        for (i, name) in node.outputs.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            match outputs.get(i) {
                Some(operand) => {
                    registry.register(name, Producer::Node(index), operand.clone())?
                }
                None if ctx.output_is_used(i) => {
                    return Err(ctx.unsupported(format!("output {i} ('{name}') is not produced")))
                }
                None => {}
            }
        }
    }

    collect_outputs(source, config, &mut lw, &mut registry)?;

    let mut graph = lw.finish();
    let removed = graph.prune_unused();
    if removed > 0 {
        log::debug!("pruned {removed} unused target ops");
    }
    log::info!(
        "translated {} source nodes into {} target ops",
        source.nodes.len(),
        graph.ops.len()
    );
    Ok(TargetModel {
        graph,
        diagnostics: detector.finish(),
    })
}

/// Deliver every declared output in the configured layout.
fn collect_outputs(
    source: &OnnxGraph,
    config: &TranslateConfig,
    lw: &mut Lowerer,
    registry: &mut TensorRegistry,
) -> Result<()> {
    for name in &source.outputs {
        let operand = registry
            .lookup(name)
            .map_err(|_| Error::MalformedGraph(format!("graph output '{name}' is never produced")))?
            .clone();
        let delivered = match (config.output_layout, &operand) {
            (OutputLayout::Image, Operand::Generic { shape, .. }) if shape.len() == 4 => {
                lw.ensure_data_format(&operand, DataFormat::InterleavedImageBatch)?
            }
            (OutputLayout::Generic, Operand::Image { .. }) => {
                lw.ensure_data_format(&operand, DataFormat::GenericTensor)?
            }
            _ => operand.clone(),
        };
        if delivered != operand {
            registry.rebind(name, delivered.clone())?;
            // The delivered tensor carries the declared name.
            let before = lw.tensor_of(&operand, name);
            let after = lw.tensor_of(&delivered, name);
            if lw.graph.tensor(before).name == *name
                && lw.graph.tensor(after).kind == TensorKind::Intermediate
            {
                let generated = std::mem::replace(&mut lw.graph.tensor_mut(after).name, name.clone());
                lw.graph.tensor_mut(before).name = generated;
            }
        }
        log::debug!("output '{name}' delivered as {}", registry.format_of(name)?);

        let id = lw.tensor_of(&delivered, name);
        let tensor = lw.graph.tensor_mut(id);
        if tensor.kind == TensorKind::Intermediate {
            tensor.kind = TensorKind::Output;
        }
        lw.graph.outputs.push(id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::graph::TensorData;
    use crate::ir::onnx::Node;
    use crate::ir::target::{PadFill, TargetOp};

    fn conv_graph() -> OnnxGraph {
        let mut g = OnnxGraph::new();
        g.input("x", vec![1, 3, 8, 8])
            .initializer("w", vec![4, 3, 3, 3], TensorData::F32(vec![0.1; 108]))
            .node(
                Node::new("Conv", &["x", "w"], &["c"]).attr("pads", vec![1i64, 1, 1, 1]),
                vec![1, 4, 8, 8],
            )
            .node(Node::new("Relu", &["c"], &["y"]), vec![1, 4, 8, 8])
            .output("y");
        g
    }

    #[test]
    fn conv_relu_needs_no_conversion() {
        let model = translate(&conv_graph(), &TranslateConfig::default()).unwrap();
        let names: Vec<&str> = model.graph.ops.iter().map(|op| op.name()).collect();
        assert_eq!(names, vec!["conv2d", "activation"]);
        assert!(model.diagnostics.is_empty());
        let out = model.graph.tensor(model.graph.outputs[0]);
        assert_eq!(out.shape, vec![1, 8, 8, 4]);
        assert_eq!(out.kind, TensorKind::Output);
    }

    #[test]
    fn generic_output_layout_appends_one_transpose() {
        let cfg = TranslateConfig::default().with_output_layout(OutputLayout::Generic);
        let model = translate(&conv_graph(), &cfg).unwrap();
        assert_eq!(model.graph.count_ops("transpose"), 1);
        let out = model.graph.tensor(model.graph.outputs[0]);
        assert_eq!(out.shape, vec![1, 4, 8, 8]);
        assert_eq!(out.format, DataFormat::GenericTensor);
        assert_eq!(out.name, "y");
        assert!(model.graph.find_tensor("y").map(|t| t.id) == Some(out.id));
    }

    #[test]
    fn fused_pad_reads_unshifted_source() {
        let mut g = OnnxGraph::new();
        g.input("x", vec![1, 3, 4, 4])
            .initializer("c", vec![1, 3, 1, 1], TensorData::F32(vec![0.1, 0.2, 0.3]))
            .initializer("pads", vec![8], TensorData::I64(vec![0, 0, 1, 1, 0, 0, 1, 1]))
            .node(Node::new("Sub", &["x", "c"], &["t"]), vec![1, 3, 4, 4])
            .node(Node::new("Pad", &["t", "pads"], &["p"]), vec![1, 3, 6, 6])
            .node(Node::new("Add", &["p", "c"], &["y"]), vec![1, 3, 6, 6])
            .output("y");
        let model = translate(&g, &TranslateConfig::default()).unwrap();
        assert_eq!(model.graph.ops.len(), 1);
        match &model.graph.ops[0] {
            TargetOp::Pad { input, fill, .. } => {
                assert_eq!(*input, model.graph.inputs[0]);
                assert!(matches!(fill, PadFill::PerChannel(_)), "got {:?}", fill);
            }
            other => panic!("Expected Pad, got {:?}", other),
        }
        assert!(model.diagnostics.is_empty());
    }

    #[test]
    fn dangling_reference_is_malformed() {
        let mut g = OnnxGraph::new();
        g.input("x", vec![1, 4])
            .node(Node::new("Relu", &["nope"], &["y"]), vec![1, 4])
            .output("y");
        let err = translate(&g, &TranslateConfig::default()).unwrap_err();
        assert!(matches!(err, Error::MalformedGraph(_)), "got: {err}");
        assert!(err.to_string().contains("undefined tensor 'nope'"));
    }

    #[test]
    fn out_of_order_node_is_malformed() {
        let mut g = OnnxGraph::new();
        g.input("x", vec![1, 4])
            .node(Node::new("Relu", &["a"], &["y"]), vec![1, 4])
            .node(Node::new("Relu", &["x"], &["a"]), vec![1, 4])
            .output("y");
        let err = translate(&g, &TranslateConfig::default()).unwrap_err();
        assert!(err.to_string().contains("before node"), "got: {err}");
    }

    #[test]
    fn duplicate_producer_is_malformed() {
        let mut g = OnnxGraph::new();
        g.input("x", vec![1, 4])
            .node(Node::new("Relu", &["x"], &["y"]), vec![1, 4])
            .node(Node::new("Sigmoid", &["x"], &["y"]), vec![1, 4])
            .output("y");
        let err = translate(&g, &TranslateConfig::default()).unwrap_err();
        assert!(err.to_string().contains("more than once"), "got: {err}");
    }

    #[test]
    fn unknown_output_is_malformed() {
        let mut g = OnnxGraph::new();
        g.input("x", vec![1, 4])
            .node(Node::new("Relu", &["x"], &["y"]), vec![1, 4])
            .output("z");
        let err = translate(&g, &TranslateConfig::default()).unwrap_err();
        assert!(err.to_string().contains("never produced"), "got: {err}");
    }

    #[test]
    fn unknown_operator_is_unsupported() {
        let mut g = OnnxGraph::new();
        g.input("x", vec![1, 4])
            .node(Node::new("LSTM", &["x"], &["y"]), vec![1, 4])
            .output("y");
        let err = translate(&g, &TranslateConfig::default()).unwrap_err();
        assert!(
            matches!(err, Error::UnsupportedOperator { ref op, .. } if op == "LSTM"),
            "got: {err}"
        );
    }

    #[test]
    fn used_but_missing_output_is_unsupported() {
        let mut g = OnnxGraph::new();
        g.input("x", vec![1, 4])
            .node(Node::new("Dropout", &["x"], &["y", "mask"]), vec![1, 4])
            .output("y")
            .output("mask");
        let err = translate(&g, &TranslateConfig::default().with_opset(12)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperator { .. }), "got: {err}");
    }
}
