//! Optimization-Gap Detector.
//!
//! Watches nodes as the walker lowers them and reports subgraphs the
//! exporter should have simplified away. Never changes what is emitted.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ir::onnx::OpKind;
use crate::lower::{view_output_shape, NodeCtx};
use crate::registry::{Producer, TensorRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// The source graph was not fully simplified before translation.
    OptimizationMissing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Name of the node the detected subgraph starts at.
    pub node: String,
    pub op: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "optimization missing at {} '{}': {}",
            self.op, self.node, self.message
        )
    }
}

#[derive(Debug, Default)]
pub struct GapDetector {
    /// Source nodes evaluated at translation time.
    folded: HashSet<usize>,
    diagnostics: Vec<Diagnostic>,
}

impl GapDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look at a node just before it is lowered.
    pub fn observe(&mut self, ctx: &NodeCtx, registry: &TensorRegistry) {
        if ctx.kind == OpKind::Constant {
            return;
        }
        if ctx.is_constant_only() {
            self.folded.insert(ctx.index);
            // One report per foldable chain, at the node it starts from.
            let continues_chain = ctx
                .node
                .inputs
                .iter()
                .filter(|name| !name.is_empty())
                .any(|name| {
                    matches!(registry.producer_of(name), Ok(Producer::Node(i)) if self.folded.contains(&i))
                });
            if !continues_chain {
                self.report(
                    ctx,
                    format!(
                        "every input of this {} is a constant; fold it before export",
                        ctx.kind
                    ),
                );
            }
            return;
        }
        if ctx.kind.is_view() {
            let Ok(x) = ctx.input(0) else {
                return;
            };
            let source = x.source_shape();
            if view_output_shape(ctx).ok().as_ref() == Some(&source) {
                self.report(
                    ctx,
                    format!("{} leaves shape {source:?} unchanged", ctx.kind),
                );
            }
        }
    }

    fn report(&mut self, ctx: &NodeCtx, message: String) {
        let diagnostic = Diagnostic {
            kind: DiagnosticKind::OptimizationMissing,
            node: ctx.node.name.clone(),
            op: ctx.node.op_type.clone(),
            message,
        };
        log::warn!("{diagnostic}");
        self.diagnostics.push(diagnostic);
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn finish(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Operand;
    use crate::ir::graph::{ConstantValue, TensorData};
    use crate::ir::onnx::Node;

    fn ctx<'a>(node: &'a Node, index: usize, inputs: Vec<Option<Operand>>) -> NodeCtx<'a> {
        NodeCtx {
            node,
            index,
            kind: OpKind::from_op_type(&node.op_type).unwrap(),
            inputs,
            output_shapes: vec![],
            output_used: vec![true],
            opset: 13,
        }
    }

    fn ints(v: &[i64]) -> Option<Operand> {
        Some(Operand::constant(ConstantValue::vector_i64(v.to_vec())))
    }

    #[test]
    fn identical_reshape_is_reported_once() {
        let registry = TensorRegistry::new();
        let mut detector = GapDetector::new();
        let node = Node::new("Reshape", &["x", "s"], &["y"]);
        let x = Operand::Generic {
            id: 0,
            shape: vec![2, 8],
        };
        detector.observe(&ctx(&node, 0, vec![Some(x.clone()), ints(&[2, 8])]), &registry);
        assert_eq!(detector.diagnostics().len(), 1);
        assert_eq!(detector.diagnostics()[0].kind, DiagnosticKind::OptimizationMissing);
        assert!(detector.diagnostics()[0].message.contains("unchanged"));

        detector.observe(&ctx(&node, 1, vec![Some(x), ints(&[16])]), &registry);
        assert_eq!(detector.finish().len(), 1);
    }

    #[test]
    fn constant_chain_reported_at_its_start() {
        let mut registry = TensorRegistry::new();
        let mut detector = GapDetector::new();
        let shape = Operand::constant(ConstantValue::new(vec![2], TensorData::I64(vec![1, 3])));

        let gather = Node::new("Gather", &["s", "i"], &["n"]);
        detector.observe(&ctx(&gather, 0, vec![Some(shape.clone()), ints(&[0])]), &registry);
        registry
            .register("n", Producer::Node(0), shape.clone())
            .unwrap();

        let unsqueeze = Node::new("Unsqueeze", &["n", "axes"], &["m"]);
        detector.observe(&ctx(&unsqueeze, 1, vec![Some(shape), ints(&[0])]), &registry);

        let diagnostics = detector.finish();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].node, "Gather_n");
    }

    #[test]
    fn runtime_nodes_are_quiet() {
        let registry = TensorRegistry::new();
        let mut detector = GapDetector::new();
        let node = Node::new("Relu", &["x"], &["y"]);
        let x = Operand::Image {
            id: 0,
            shape: [1, 4, 4, 3],
        };
        detector.observe(&ctx(&node, 0, vec![Some(x)]), &registry);
        assert!(detector.finish().is_empty());
    }
}
