//! Elementwise arithmetic, activations and normalization.
//!
//! None of these care about axis order except through broadcasting, so they
//! run in whatever layout their runtime operands already have. Constants are
//! re-laid out to match; they never force a runtime operand to convert.

use crate::error::Result;
use crate::format::{align_constant, channels_last_axis, normalize_axis, DataFormat, Operand};
use crate::ir::graph::{ConstantValue, DType};
use crate::ir::onnx::OpKind;
use crate::ir::target::{Activation, BinaryOp, TargetOp, UnaryOp};

use super::{Lowerer, NodeCtx};

/// Numpy broadcast of two shapes.
pub(super) fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |s: &[usize], i: usize| {
        let offset = rank - s.len();
        if i < offset {
            1
        } else {
            s[i - offset]
        }
    };
    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

/// Layout a set of operands should meet in: image batch when every runtime
/// operand is 4-D and at least one already is an image batch.
pub(super) fn meeting_format(operands: &[&Operand]) -> DataFormat {
    let runtime: Vec<&&Operand> = operands.iter().filter(|o| !o.is_constant()).collect();
    let any_image = runtime
        .iter()
        .any(|o| o.format() == DataFormat::InterleavedImageBatch);
    let all_fit = operands.iter().all(|o| o.rank() <= 4)
        && runtime.iter().all(|o| o.rank() == 4);
    if any_image && all_fit {
        DataFormat::InterleavedImageBatch
    } else {
        DataFormat::GenericTensor
    }
}

/// Operand in the meeting layout, with constants re-laid out for broadcasting.
pub(super) fn operand_in(lw: &mut Lowerer, operand: &Operand, format: DataFormat) -> Result<Operand> {
    match operand {
        Operand::Constant(value) => Ok(Operand::constant(align_constant(value, format))),
        runtime => lw.ensure_data_format(runtime, format),
    }
}

/// Materialize an operand, casting booleans to f32 when `numeric` is set.
fn tensor_for(lw: &mut Lowerer, operand: &Operand, name: &str, numeric: bool) -> usize {
    let id = lw.tensor_of(operand, name);
    if !numeric || lw.graph.tensor(id).dtype != DType::Bool {
        return id;
    }
    let (output, _) = lw.like(&format!("{name}/f32"), operand, DType::F32);
    lw.emit(TargetOp::Cast {
        input: id,
        output,
        dtype: DType::F32,
    });
    output
}

pub(super) fn lower_binary(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let op = match ctx.kind {
        OpKind::Add => BinaryOp::Add,
        OpKind::Sub => BinaryOp::Sub,
        OpKind::Mul => BinaryOp::Mul,
        OpKind::Div => BinaryOp::Div,
        OpKind::Equal => BinaryOp::Equal,
        other => return Err(ctx.unsupported(format!("{other} is not a binary op"))),
    };
    let a = ctx.input(0)?;
    let b = ctx.input(1)?;
    let format = meeting_format(&[a, b]);
    let a = operand_in(lw, a, format)?;
    let b = operand_in(lw, b, format)?;

    let shape = broadcast_shapes(&a.shape(), &b.shape()).ok_or_else(|| {
        ctx.unsupported(format!(
            "shapes {:?} and {:?} do not broadcast",
            a.source_shape(),
            b.source_shape()
        ))
    })?;

    let name = ctx.output_name(0);
    let numeric = op != BinaryOp::Equal;
    let lhs = tensor_for(lw, &a, &format!("{name}/lhs"), numeric);
    let rhs = tensor_for(lw, &b, &format!("{name}/rhs"), numeric);
    let dtype = match op {
        BinaryOp::Equal => DType::Bool,
        _ => lw.graph.tensor(lhs).dtype,
    };
    let (output, out) = lw.value(name, format, shape, dtype)?;
    lw.emit(TargetOp::Binary {
        op,
        lhs,
        rhs,
        output,
    });
    Ok(vec![out])
}

/// Input 0 plus a fresh output with the same tag, shape and dtype.
fn same_shape(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<(usize, usize, Operand)> {
    let x = ctx.input(0)?;
    let input = lw.tensor_of(x, &format!("{}/input", ctx.output_name(0)));
    let dtype = lw.graph.tensor(input).dtype;
    let (output, out) = lw.like(ctx.output_name(0), x, dtype);
    Ok((input, output, out))
}

fn emit_activation(lw: &mut Lowerer, ctx: &NodeCtx, activation: Activation) -> Result<Vec<Operand>> {
    let (input, output, out) = same_shape(lw, ctx)?;
    lw.emit(TargetOp::Activation {
        input,
        output,
        activation,
    });
    Ok(vec![out])
}

pub(super) fn lower_activation(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let activation = match ctx.kind {
        OpKind::Relu => Activation::Relu,
        OpKind::Sigmoid => Activation::Sigmoid,
        OpKind::Tanh => Activation::Tanh,
        OpKind::LeakyRelu => Activation::LeakyRelu {
            alpha: ctx.float_attr("alpha", 0.01)?,
        },
        other => return Err(ctx.unsupported(format!("{other} is not an activation"))),
    };
    emit_activation(lw, ctx, activation)
}

pub(super) fn lower_unary(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let op = match ctx.kind {
        OpKind::Neg => UnaryOp::Neg,
        OpKind::Abs => UnaryOp::Abs,
        OpKind::Sqrt => UnaryOp::Sqrt,
        other => return Err(ctx.unsupported(format!("{other} is not a unary op"))),
    };
    let (input, output, out) = same_shape(lw, ctx)?;
    lw.emit(TargetOp::Unary { op, input, output });
    Ok(vec![out])
}

pub(super) fn lower_clip(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    // Bounds are attributes before opset 11 and optional inputs from 11 on.
    let (min, max) = if ctx.opset < 11 {
        let min = ctx.has_attr("min").then(|| ctx.float_attr("min", f32::MIN)).transpose()?;
        let max = ctx.has_attr("max").then(|| ctx.float_attr("max", f32::MAX)).transpose()?;
        (min, max)
    } else {
        let bound = |i: usize| -> Result<Option<f32>> {
            match ctx.optional_constant(i)? {
                None => Ok(None),
                Some(v) => v
                    .as_scalar_f32()
                    .map(Some)
                    .ok_or_else(|| ctx.unsupported(format!("bound {i} is not a scalar"))),
            }
        };
        (bound(1)?, bound(2)?)
    };

    match (min, max) {
        (Some(lo), Some(hi)) if lo == 0.0 && hi == 6.0 && lw.config.capabilities.relu6 => {
            emit_activation(lw, ctx, Activation::Relu6)
        }
        (Some(lo), None) if lo == 0.0 => emit_activation(lw, ctx, Activation::Relu),
        (min, max) => {
            let (input, output, out) = same_shape(lw, ctx)?;
            lw.emit(TargetOp::Clamp {
                input,
                output,
                min,
                max,
            });
            Ok(vec![out])
        }
    }
}

/// Channel axis of `operand` in its own axis order.
fn channel_axis(operand: &Operand) -> usize {
    match operand.format() {
        DataFormat::InterleavedImageBatch => 3,
        DataFormat::GenericTensor | DataFormat::Constant => 1,
    }
}

pub(super) fn lower_prelu(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let x = ctx.input(0)?;
    let slope = ctx.constant_input(1)?;
    let source = x.source_shape();
    if slope.rank() > source.len() {
        return Err(ctx.unsupported(format!(
            "slope shape {:?} for input {:?}",
            slope.shape, source
        )));
    }
    // Slopes broadcast right-aligned against the input.
    let mut aligned = vec![1; source.len() - slope.rank()];
    aligned.extend_from_slice(&slope.shape);
    if aligned.iter().zip(&source).any(|(&s, &d)| s != 1 && s != d) {
        return Err(ctx.unsupported(format!(
            "slope shape {:?} for input {:?}",
            slope.shape, source
        )));
    }

    let per_channel = source.len() >= 2
        && aligned[1] > 1
        && aligned.iter().enumerate().all(|(axis, &d)| axis == 1 || d == 1);
    let (slope, channel_axis) = if slope.len() == 1 {
        (slope.reshape(vec![1]), None)
    } else if per_channel {
        (slope.reshape(vec![aligned[1]]), Some(channel_axis(x)))
    } else {
        (align_constant(&slope.reshape(aligned), x.format()), None)
    };

    let name = ctx.output_name(0);
    let slope = lw.constant(&format!("{name}/slope"), &slope);
    let (input, output, out) = same_shape(lw, ctx)?;
    lw.emit(TargetOp::PRelu {
        input,
        slope,
        output,
        channel_axis,
    });
    Ok(vec![out])
}

pub(super) fn lower_batch_norm(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    if ctx.int_attr("training_mode", 0)? != 0
        || (1..ctx.node.outputs.len()).any(|i| ctx.output_is_used(i))
    {
        return Err(ctx.unsupported("training-mode batch statistics"));
    }
    let x = ctx.input(0)?;
    let channels = x.source_shape().get(1).copied().unwrap_or(0);
    let name = ctx.output_name(0);
    let mut params = Vec::with_capacity(4);
    for (i, label) in ["scale", "offset", "mean", "variance"].into_iter().enumerate() {
        let value = ctx.constant_input(i + 1)?;
        if value.len() != channels {
            return Err(ctx.unsupported(format!(
                "{label} has {} values for {channels} channels",
                value.len()
            )));
        }
        let value = value.reshape(vec![channels]);
        params.push(lw.constant(&format!("{name}/{label}"), &value));
    }
    let epsilon = ctx.float_attr("epsilon", 1e-5)?;
    let (input, output, out) = same_shape(lw, ctx)?;
    lw.emit(TargetOp::BatchNorm {
        input,
        output,
        scale: params[0],
        offset: params[1],
        mean: params[2],
        variance: params[3],
        epsilon,
        axis: channel_axis(x),
    });
    Ok(vec![out])
}

pub(super) fn lower_softmax(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let x = ctx.input(0)?;
    let rank = x.rank();
    let default_axis = if ctx.opset < 13 { 1 } else { -1 };
    let raw = ctx.int_attr("axis", default_axis)?;
    let axis = normalize_axis(raw, rank)
        .ok_or_else(|| ctx.invalid_attr("axis", format!("{raw} out of range for rank {rank}")))?;
    // Before opset 13 the input is coerced to 2-D at `axis`.
    if ctx.opset < 13 && axis + 1 != rank {
        return Err(ctx.unsupported("softmax over several flattened axes"));
    }
    let axis = match x.format() {
        DataFormat::InterleavedImageBatch => channels_last_axis(axis),
        DataFormat::GenericTensor | DataFormat::Constant => axis,
    };
    let (input, output, out) = same_shape(lw, ctx)?;
    lw.emit(TargetOp::Softmax {
        input,
        output,
        axis,
    });
    Ok(vec![out])
}

pub(super) fn lower_cast(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let to = ctx.int_attr("to", 1)?;
    let dtype =
        DType::from_onnx(to).ok_or_else(|| ctx.unsupported(format!("cast to data type {to}")))?;
    let x = ctx.input(0)?;
    let input = lw.tensor_of(x, &format!("{}/input", ctx.output_name(0)));
    let (output, out) = lw.like(ctx.output_name(0), x, dtype);
    lw.emit(TargetOp::Cast {
        input,
        output,
        dtype,
    });
    Ok(vec![out])
}

pub(super) fn lower_dropout(_lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let training = match ctx.optional_constant(2)? {
        Some(flag) => flag.data.to_i64().iter().any(|&v| v != 0),
        // is_test was dropped in opset 7
        None => ctx.opset < 7 && ctx.int_attr("is_test", 0)? == 0,
    };
    if training || ctx.output_is_used(1) {
        return Err(ctx.unsupported("training-mode dropout"));
    }
    Ok(vec![ctx.input(0)?.clone()])
}

pub(super) fn lower_identity(ctx: &NodeCtx) -> Result<Vec<Operand>> {
    Ok(vec![ctx.input(0)?.clone()])
}

/// Fill values for each channel of an `(N, C, H, W)` operand, if `value`
/// broadcasts against it as a scalar or as `(1, C, 1, 1)`.
pub(super) fn per_channel_values(value: &ConstantValue, channels: usize) -> Option<Vec<f32>> {
    if let Some(v) = value.as_scalar_f32() {
        return Some(vec![v; channels]);
    }
    if value.rank() > 4 {
        return None;
    }
    let mut padded = vec![1; 4 - value.rank()];
    padded.extend_from_slice(&value.shape);
    (padded == [1, channels, 1, 1]).then(|| value.data.to_f32())
}
