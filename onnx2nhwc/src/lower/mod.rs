//! Operator lowering table.
//!
//! One rule per [`OpKind`], dispatched by an exhaustive match. A rule reads
//! its tagged inputs from a [`NodeCtx`], appends target ops through the
//! [`Lowerer`], and returns one tagged operand per source output.

mod conv;
mod elementwise;
mod fold;
mod linalg;
pub(crate) mod patterns;
mod pool;
mod resize;
mod shape;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::TranslateConfig;
use crate::error::{Error, Result};
use crate::format::{
    compatible, to_channels_first_shape, to_channels_last_shape, DataFormat, Operand,
    TO_CHANNELS_FIRST, TO_CHANNELS_LAST,
};
use crate::ir::graph::{ConstantValue, DType, TensorId, TensorKind};
use crate::ir::onnx::{Attribute, Node, OpKind};
use crate::ir::target::{PadFill, PadMode, TargetGraph, TargetOp};

/// Per-edge spatial padding, `[[top, bottom], [left, right]]`.
pub type EdgePads = [[usize; 2]; 2];

pub fn is_symmetric(pads: &EdgePads) -> bool {
    pads[0][0] == pads[0][1] && pads[1][0] == pads[1][1]
}

/// A source node with its inputs already resolved to tagged operands.
pub struct NodeCtx<'a> {
    pub node: &'a Node,
    pub index: usize,
    pub kind: OpKind,
    /// `None` for omitted optional inputs.
    pub inputs: Vec<Option<Operand>>,
    /// Channel-first shape metadata for each output, when the source has it.
    pub output_shapes: Vec<Option<Vec<usize>>>,
    /// Whether anything downstream reads each output.
    pub output_used: Vec<bool>,
    pub opset: i64,
}

impl<'a> NodeCtx<'a> {
    pub fn input(&self, i: usize) -> Result<&Operand> {
        self.inputs.get(i).and_then(Option::as_ref).ok_or_else(|| {
            Error::MalformedGraph(format!(
                "node '{}' ({}) is missing input {i}",
                self.node.name, self.kind
            ))
        })
    }

    pub fn optional_input(&self, i: usize) -> Option<&Operand> {
        self.inputs.get(i).and_then(Option::as_ref)
    }

    /// Input `i`, which must be known at translation time.
    pub fn constant_input(&self, i: usize) -> Result<Arc<ConstantValue>> {
        match self.input(i)? {
            Operand::Constant(value) => Ok(Arc::clone(value)),
            Operand::Generic { .. } | Operand::Image { .. } => {
                Err(self.unsupported(format!("input {i} must be a constant")))
            }
        }
    }

    /// Optional constant input; absent and zero-element inputs both read as `None`.
    pub fn optional_constant(&self, i: usize) -> Result<Option<Arc<ConstantValue>>> {
        match self.optional_input(i) {
            None => Ok(None),
            Some(Operand::Constant(value)) if value.is_empty() => Ok(None),
            Some(Operand::Constant(value)) => Ok(Some(Arc::clone(value))),
            Some(_) => Err(self.unsupported(format!("input {i} must be a constant"))),
        }
    }

    pub fn present_inputs(&self) -> impl Iterator<Item = &Operand> {
        self.inputs.iter().flatten()
    }

    /// True when the node has inputs and every one of them is a constant.
    pub fn is_constant_only(&self) -> bool {
        self.present_inputs().next().is_some() && self.present_inputs().all(Operand::is_constant)
    }

    pub fn output_name(&self, i: usize) -> &str {
        self.node
            .outputs
            .get(i)
            .map(String::as_str)
            .unwrap_or(&self.node.name)
    }

    pub fn output_is_used(&self, i: usize) -> bool {
        self.output_used.get(i).copied().unwrap_or(false)
    }

    pub fn output_shape(&self, i: usize) -> Result<Vec<usize>> {
        self.output_shapes
            .get(i)
            .cloned()
            .flatten()
            .ok_or_else(|| {
                Error::MalformedGraph(format!(
                    "no shape metadata for output '{}' of node '{}'",
                    self.output_name(i),
                    self.node.name
                ))
            })
    }

    pub fn unsupported(&self, reason: impl Into<String>) -> Error {
        Error::UnsupportedOperator {
            node: self.node.name.clone(),
            op: self.node.op_type.clone(),
            reason: reason.into(),
        }
    }

    pub fn invalid_attr(&self, name: &str, reason: impl Into<String>) -> Error {
        Error::InvalidAttribute {
            node: self.node.name.clone(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.node.attribute(name).is_some()
    }

    pub fn int_attr(&self, name: &str, default: i64) -> Result<i64> {
        match self.node.attribute(name) {
            None => Ok(default),
            Some(Attribute::Int(v)) => Ok(*v),
            Some(other) => Err(self.invalid_attr(name, format!("expected int, got {other:?}"))),
        }
    }

    pub fn float_attr(&self, name: &str, default: f32) -> Result<f32> {
        match self.node.attribute(name) {
            None => Ok(default),
            Some(Attribute::Float(v)) => Ok(*v),
            Some(Attribute::Int(v)) => Ok(*v as f32),
            Some(other) => Err(self.invalid_attr(name, format!("expected float, got {other:?}"))),
        }
    }

    pub fn ints_attr(&self, name: &str) -> Result<Option<Vec<i64>>> {
        match self.node.attribute(name) {
            None => Ok(None),
            Some(Attribute::Ints(v)) => Ok(Some(v.clone())),
            Some(Attribute::Int(v)) => Ok(Some(vec![*v])),
            Some(other) => Err(self.invalid_attr(name, format!("expected ints, got {other:?}"))),
        }
    }

    pub fn floats_attr(&self, name: &str) -> Result<Option<Vec<f32>>> {
        match self.node.attribute(name) {
            None => Ok(None),
            Some(Attribute::Floats(v)) => Ok(Some(v.clone())),
            Some(Attribute::Ints(v)) => Ok(Some(v.iter().map(|&x| x as f32).collect())),
            Some(other) => Err(self.invalid_attr(name, format!("expected floats, got {other:?}"))),
        }
    }

    pub fn string_attr(&self, name: &str, default: &str) -> Result<String> {
        match self.node.attribute(name) {
            None => Ok(default.to_string()),
            Some(Attribute::String(v)) => Ok(v.clone()),
            Some(other) => Err(self.invalid_attr(name, format!("expected string, got {other:?}"))),
        }
    }

    /// Non-negative ints attribute with exactly `N` entries.
    pub fn usize_attr<const N: usize>(&self, name: &str, default: [usize; N]) -> Result<[usize; N]> {
        let Some(values) = self.ints_attr(name)? else {
            return Ok(default);
        };
        if values.len() != N || values.iter().any(|&v| v < 0) {
            return Err(self.invalid_attr(
                name,
                format!("expected {N} non-negative values, got {values:?}"),
            ));
        }
        let mut out = [0; N];
        for (o, v) in out.iter_mut().zip(values) {
            *o = v as usize;
        }
        Ok(out)
    }
}

/// Per-call lowering state: the target graph under construction plus the
/// layout-conversion bookkeeping.
pub struct Lowerer<'c> {
    pub config: &'c TranslateConfig,
    pub graph: TargetGraph,
    /// (source tensor, requested format) -> converted operand
    conversions: HashMap<(TensorId, DataFormat), Operand>,
    /// converted tensor -> the operand it was converted from
    origins: HashMap<TensorId, Operand>,
    /// base name -> next suffix to try
    names: HashMap<String, usize>,
    issued: HashSet<String>,
}

impl<'c> Lowerer<'c> {
    pub fn new(config: &'c TranslateConfig) -> Self {
        Self {
            config,
            graph: TargetGraph::new(),
            conversions: HashMap::new(),
            origins: HashMap::new(),
            names: HashMap::new(),
            issued: HashSet::new(),
        }
    }

    pub fn finish(self) -> TargetGraph {
        self.graph
    }

    fn unique_name(&mut self, base: &str) -> String {
        let mut name = base.to_string();
        if self.issued.contains(&name) {
            let next = self.names.entry(base.to_string()).or_insert(1);
            loop {
                name = format!("{base}_{next}");
                *next += 1;
                if !self.issued.contains(&name) {
                    break;
                }
            }
        }
        self.issued.insert(name.clone());
        name
    }

    /// Register a graph input.
    pub fn input(&mut self, name: &str, shape: &[usize], dtype: DType) -> Operand {
        let name = self.unique_name(name);
        match to_channels_last_shape(shape) {
            Some(nhwc) if self.config.image_inputs => {
                let id = self.graph.add_tensor(
                    name,
                    nhwc.to_vec(),
                    dtype,
                    DataFormat::InterleavedImageBatch,
                    TensorKind::Input,
                );
                self.graph.inputs.push(id);
                Operand::Image { id, shape: nhwc }
            }
            _ => {
                let id = self.graph.add_tensor(
                    name,
                    shape.to_vec(),
                    dtype,
                    DataFormat::GenericTensor,
                    TensorKind::Input,
                );
                self.graph.inputs.push(id);
                Operand::Generic {
                    id,
                    shape: shape.to_vec(),
                }
            }
        }
    }

    fn intermediate(&mut self, name: &str, shape: Vec<usize>, dtype: DType, format: DataFormat) -> TensorId {
        let name = self.unique_name(name);
        self.graph
            .add_tensor(name, shape, dtype, format, TensorKind::Intermediate)
    }

    pub fn image(&mut self, name: &str, shape: [usize; 4], dtype: DType) -> Operand {
        let id = self.image_tensor(name, shape, dtype);
        Operand::Image { id, shape }
    }

    pub fn image_tensor(&mut self, name: &str, shape: [usize; 4], dtype: DType) -> TensorId {
        self.intermediate(name, shape.to_vec(), dtype, DataFormat::InterleavedImageBatch)
    }

    pub fn generic(&mut self, name: &str, shape: Vec<usize>, dtype: DType) -> Operand {
        let id = self.intermediate(name, shape.clone(), dtype, DataFormat::GenericTensor);
        Operand::Generic { id, shape }
    }

    /// New value with the same tag and shape as `template`.
    pub fn like(&mut self, name: &str, template: &Operand, dtype: DType) -> (TensorId, Operand) {
        match template {
            Operand::Image { shape, .. } => {
                let id = self.image_tensor(name, *shape, dtype);
                (id, Operand::Image { id, shape: *shape })
            }
            other => {
                let shape = other.shape();
                let id = self.intermediate(name, shape.clone(), dtype, DataFormat::GenericTensor);
                (id, Operand::Generic { id, shape })
            }
        }
    }

    /// New value tagged `format`, `shape` given in that format's own axis order.
    pub fn value(
        &mut self,
        name: &str,
        format: DataFormat,
        shape: Vec<usize>,
        dtype: DType,
    ) -> Result<(TensorId, Operand)> {
        match format {
            DataFormat::InterleavedImageBatch => {
                let nhwc: [usize; 4] = shape.as_slice().try_into().map_err(|_| Error::LayoutConflict {
                    tensor: name.to_string(),
                    expected: DataFormat::InterleavedImageBatch,
                    found: DataFormat::GenericTensor,
                })?;
                let id = self.image_tensor(name, nhwc, dtype);
                Ok((id, Operand::Image { id, shape: nhwc }))
            }
            DataFormat::GenericTensor | DataFormat::Constant => {
                let id = self.intermediate(name, shape.clone(), dtype, DataFormat::GenericTensor);
                Ok((id, Operand::Generic { id, shape }))
            }
        }
    }

    /// Materialize a constant in the target graph.
    pub fn constant(&mut self, name: &str, value: &ConstantValue) -> TensorId {
        let name = self.unique_name(name);
        self.graph.add_tensor(
            name,
            value.shape.clone(),
            value.dtype(),
            DataFormat::Constant,
            TensorKind::Constant(value.data.clone()),
        )
    }

    /// Target tensor for an operand, materializing constants on demand.
    pub fn tensor_of(&mut self, operand: &Operand, name: &str) -> TensorId {
        match operand {
            Operand::Constant(value) => self.constant(name, value),
            Operand::Generic { id, .. } | Operand::Image { id, .. } => *id,
        }
    }

    pub fn name_of(&self, operand: &Operand) -> String {
        match operand {
            Operand::Constant(_) => "constant".to_string(),
            Operand::Generic { id, .. } | Operand::Image { id, .. } => {
                self.graph.tensor(*id).name.clone()
            }
        }
    }

    pub fn emit(&mut self, op: TargetOp) {
        log::trace!(
            "emit {} -> {}",
            op.name(),
            self.graph.tensor(op.output()).name
        );
        self.graph.ops.push(op);
    }

    /// Return `operand` unchanged if its tag is compatible with `target`,
    /// otherwise a channel-first/channel-last permutation of it.
    ///
    /// Constants always pass through. Repeated requests reuse the first
    /// conversion, and converting a converted tensor back yields its origin.
    pub fn ensure_data_format(&mut self, operand: &Operand, target: DataFormat) -> Result<Operand> {
        if compatible(operand.format(), target) {
            return Ok(operand.clone());
        }
        let id = match operand.tensor_id() {
            Some(id) => id,
            None => return Ok(operand.clone()),
        };
        if let Some(origin) = self.origins.get(&id) {
            if origin.format() == target {
                return Ok(origin.clone());
            }
        }
        if let Some(done) = self.conversions.get(&(id, target)) {
            return Ok(done.clone());
        }

        let base = self.graph.tensor(id).name.clone();
        let dtype = self.graph.tensor(id).dtype;
        let converted = match (operand, target) {
            (Operand::Generic { shape, .. }, DataFormat::InterleavedImageBatch) => {
                let nhwc = to_channels_last_shape(shape).ok_or_else(|| Error::LayoutConflict {
                    tensor: base.clone(),
                    expected: DataFormat::InterleavedImageBatch,
                    found: DataFormat::GenericTensor,
                })?;
                let output = self.image_tensor(&format!("{base}/nhwc"), nhwc, dtype);
                self.emit(TargetOp::Transpose {
                    input: id,
                    output,
                    perm: TO_CHANNELS_LAST.to_vec(),
                });
                Operand::Image {
                    id: output,
                    shape: nhwc,
                }
            }
            (Operand::Image { shape, .. }, DataFormat::GenericTensor) => {
                let nchw = to_channels_first_shape(*shape);
                let output =
                    self.intermediate(&format!("{base}/nchw"), nchw.clone(), dtype, DataFormat::GenericTensor);
                self.emit(TargetOp::Transpose {
                    input: id,
                    output,
                    perm: TO_CHANNELS_FIRST.to_vec(),
                });
                Operand::Generic {
                    id: output,
                    shape: nchw,
                }
            }
            (other, _) => {
                return Err(Error::LayoutConflict {
                    tensor: base,
                    expected: target,
                    found: other.format(),
                })
            }
        };
        log::info!("inserted layout conversion {base} -> {target}");
        if let Some(out_id) = converted.tensor_id() {
            self.origins.insert(out_id, operand.clone());
        }
        self.conversions.insert((id, target), converted.clone());
        Ok(converted)
    }

    /// Emit a spatial `Pad` on an image batch.
    pub fn pad_image(
        &mut self,
        name: &str,
        input: TensorId,
        shape: [usize; 4],
        pads: EdgePads,
        fill: PadFill,
        mode: PadMode,
    ) -> (TensorId, [usize; 4]) {
        let [n, h, w, c] = shape;
        let padded = [
            n,
            h + pads[0][0] + pads[0][1],
            w + pads[1][0] + pads[1][1],
            c,
        ];
        let dtype = self.graph.tensor(input).dtype;
        let output = self.image_tensor(name, padded, dtype);
        self.emit(TargetOp::Pad {
            input,
            output,
            pads,
            fill,
            mode,
        });
        (output, padded)
    }

    /// Convert to an image batch and unpack it; anything else is a rule bug.
    pub fn ensure_image(&mut self, operand: &Operand) -> Result<(TensorId, [usize; 4])> {
        match self.ensure_data_format(operand, DataFormat::InterleavedImageBatch)? {
            Operand::Image { id, shape } => Ok((id, shape)),
            other => Err(Error::LayoutConflict {
                tensor: self.name_of(&other),
                expected: DataFormat::InterleavedImageBatch,
                found: other.format(),
            }),
        }
    }

    /// Convert to a generic tensor and unpack it.
    pub fn ensure_generic(&mut self, operand: &Operand) -> Result<(TensorId, Vec<usize>)> {
        match self.ensure_data_format(operand, DataFormat::GenericTensor)? {
            Operand::Generic { id, shape } => Ok((id, shape)),
            other => Err(Error::LayoutConflict {
                tensor: self.name_of(&other),
                expected: DataFormat::GenericTensor,
                found: other.format(),
            }),
        }
    }
}

/// Channel-first output shape of a view node, computed from its input.
pub fn view_output_shape(ctx: &NodeCtx) -> Result<Vec<usize>> {
    shape::view_shape(ctx, &ctx.input(0)?.source_shape())
}

/// Lower one source node.
pub fn lower_node(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    if ctx.is_constant_only() && !matches!(ctx.kind, OpKind::Shape | OpKind::Constant) {
        if fold::can_fold(ctx.kind) {
            return fold::fold_node(ctx);
        }
        let baked = fold::materialize_data_input(lw, ctx)?;
        return lower_rule(lw, &baked);
    }
    lower_rule(lw, ctx)
}

fn lower_rule(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    log::debug!("lowering {} '{}'", ctx.kind, ctx.node.name);

    match ctx.kind {
        OpKind::Conv => conv::lower_conv(lw, ctx),
        OpKind::ConvTranspose => conv::lower_conv_transpose(lw, ctx),
        OpKind::MaxPool => pool::lower_max_pool(lw, ctx),
        OpKind::AveragePool => pool::lower_avg_pool(lw, ctx),
        OpKind::GlobalAveragePool => pool::lower_global_avg_pool(lw, ctx),
        OpKind::ReduceMean => pool::lower_reduce_mean(lw, ctx),
        OpKind::BatchNormalization => elementwise::lower_batch_norm(lw, ctx),
        OpKind::Relu | OpKind::LeakyRelu | OpKind::Sigmoid | OpKind::Tanh => {
            elementwise::lower_activation(lw, ctx)
        }
        OpKind::PRelu => elementwise::lower_prelu(lw, ctx),
        OpKind::Softmax => elementwise::lower_softmax(lw, ctx),
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::Equal => {
            elementwise::lower_binary(lw, ctx)
        }
        OpKind::Neg | OpKind::Abs | OpKind::Sqrt => elementwise::lower_unary(lw, ctx),
        OpKind::Clip => elementwise::lower_clip(lw, ctx),
        OpKind::Cast => elementwise::lower_cast(lw, ctx),
        OpKind::Dropout => elementwise::lower_dropout(lw, ctx),
        OpKind::Identity => elementwise::lower_identity(ctx),
        OpKind::Concat => shape::lower_concat(lw, ctx),
        OpKind::Reshape | OpKind::Flatten | OpKind::Squeeze | OpKind::Unsqueeze => {
            shape::lower_view(lw, ctx)
        }
        OpKind::Transpose => shape::lower_transpose(lw, ctx),
        OpKind::Slice => shape::lower_slice(lw, ctx),
        OpKind::Pad => shape::lower_pad(lw, ctx),
        OpKind::Shape => shape::lower_shape(ctx),
        OpKind::Gather => Err(ctx.unsupported("gather over runtime tensors")),
        OpKind::Constant => fold::constant_node(ctx),
        OpKind::Upsample | OpKind::Resize => resize::lower_resize(lw, ctx),
        OpKind::MatMul => linalg::lower_matmul(lw, ctx),
        OpKind::Gemm => linalg::lower_gemm(lw, ctx),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers for exercising single rules without a walker.

    use super::*;
    use crate::ir::onnx::Node;

    pub fn image_input(lw: &mut Lowerer, name: &str, nchw: &[usize]) -> Operand {
        lw.input(name, nchw, DType::F32)
    }

    pub fn ctx<'a>(
        node: &'a Node,
        inputs: Vec<Option<Operand>>,
        output_shapes: Vec<Vec<usize>>,
        opset: i64,
    ) -> NodeCtx<'a> {
        NodeCtx {
            node,
            index: 0,
            kind: OpKind::from_op_type(&node.op_type).expect("known op"),
            inputs,
            output_used: vec![true; node.outputs.len()],
            output_shapes: output_shapes.into_iter().map(Some).collect(),
            opset,
        }
    }
}
