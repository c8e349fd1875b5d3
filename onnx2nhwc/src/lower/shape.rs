//! Concatenation, views, slicing, padding and transposes.
//!
//! Shape arithmetic is done in the source's channel-first order and then
//! mapped onto whatever layout the runtime operand has.

use std::ops::Range;

use crate::error::Result;
use crate::format::{
    channels_last_axis, layout_preserving, normalize_axis, to_channels_last_shape, DataFormat,
    Operand, TO_CHANNELS_LAST,
};
use crate::ir::graph::ConstantValue;
use crate::ir::onnx::OpKind;
use crate::ir::target::{PadFill, PadMode, TargetOp};

use super::elementwise::{meeting_format, operand_in};
use super::{Lowerer, NodeCtx};

pub(super) fn lower_concat(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let operands: Vec<&Operand> = ctx.present_inputs().collect();
    let Some(first) = operands.first() else {
        return Err(ctx.unsupported("concatenation of nothing"));
    };
    let rank = first.rank();
    if !ctx.has_attr("axis") {
        return Err(ctx.invalid_attr("axis", "required"));
    }
    let raw = ctx.int_attr("axis", 0)?;
    let axis = normalize_axis(raw, rank)
        .ok_or_else(|| ctx.invalid_attr("axis", format!("{raw} out of range for rank {rank}")))?;

    let format = meeting_format(&operands);
    let axis = match format {
        DataFormat::InterleavedImageBatch => channels_last_axis(axis),
        DataFormat::GenericTensor | DataFormat::Constant => axis,
    };
    let name = ctx.output_name(0);
    let mut shape: Option<Vec<usize>> = None;
    let mut inputs = Vec::with_capacity(operands.len());
    for (i, operand) in operands.iter().enumerate() {
        let operand = operand_in(lw, operand, format)?;
        let part = operand.shape();
        match shape.as_mut() {
            None => shape = Some(part),
            Some(total) => {
                let agrees = total.len() == part.len()
                    && total
                        .iter()
                        .zip(&part)
                        .enumerate()
                        .all(|(a, (t, p))| a == axis || t == p);
                if !agrees {
                    return Err(ctx.unsupported(format!(
                        "input {i} shape {:?} does not fit {:?} along axis {axis}",
                        part, total
                    )));
                }
                total[axis] += part[axis];
            }
        }
        inputs.push(lw.tensor_of(&operand, &format!("{name}/input{i}")));
    }
    let shape = shape.unwrap_or_default();
    let dtype = lw.graph.tensor(inputs[0]).dtype;
    let (output, out) = lw.value(name, format, shape, dtype)?;
    lw.emit(TargetOp::Concat {
        inputs,
        output,
        axis,
    });
    Ok(vec![out])
}

/// Axes from input 1 (newer opsets) or the `axes` attribute.
fn axes_operand(ctx: &NodeCtx) -> Result<Option<Vec<i64>>> {
    match ctx.optional_constant(1)? {
        Some(axes) => Ok(Some(axes.data.to_i64())),
        None => ctx.ints_attr("axes"),
    }
}

fn resolve_reshape(ctx: &NodeCtx, input: &[usize], spec: &[i64]) -> Result<Vec<usize>> {
    let allow_zero = ctx.int_attr("allowzero", 0)? != 0;
    let mut out = Vec::with_capacity(spec.len());
    let mut inferred = None;
    for (i, &d) in spec.iter().enumerate() {
        match d {
            0 if !allow_zero => out.push(*input.get(i).ok_or_else(|| {
                ctx.invalid_attr("shape", format!("0 at position {i} has no input dimension to copy"))
            })?),
            -1 if inferred.is_none() => {
                inferred = Some(i);
                out.push(1);
            }
            d if d >= 0 => out.push(d as usize),
            d => return Err(ctx.invalid_attr("shape", format!("bad dimension {d}"))),
        }
    }
    let total: usize = input.iter().product();
    let known: usize = out.iter().product();
    if let Some(i) = inferred {
        if known == 0 || total % known != 0 {
            return Err(ctx.invalid_attr(
                "shape",
                format!("cannot infer {spec:?} from {input:?}"),
            ));
        }
        out[i] = total / known;
    } else if known != total {
        return Err(ctx.invalid_attr(
            "shape",
            format!("{spec:?} does not hold the {total} elements of {input:?}"),
        ));
    }
    Ok(out)
}

/// Channel-first output shape of a view op over `input`.
pub(super) fn view_shape(ctx: &NodeCtx, input: &[usize]) -> Result<Vec<usize>> {
    let rank = input.len();
    match ctx.kind {
        OpKind::Reshape => {
            let spec = match ctx.optional_constant(1)? {
                Some(shape) => shape.data.to_i64(),
                // `shape` was an attribute before opset 5
                None => ctx
                    .ints_attr("shape")?
                    .ok_or_else(|| ctx.invalid_attr("shape", "required"))?,
            };
            resolve_reshape(ctx, input, &spec)
        }
        OpKind::Flatten => {
            let raw = ctx.int_attr("axis", 1)?;
            let axis = if raw < 0 { raw + rank as i64 } else { raw };
            if !(0..=rank as i64).contains(&axis) {
                return Err(ctx.invalid_attr("axis", format!("{raw} out of range for rank {rank}")));
            }
            let (outer, inner) = input.split_at(axis as usize);
            Ok(vec![outer.iter().product(), inner.iter().product()])
        }
        OpKind::Squeeze => match axes_operand(ctx)? {
            None => Ok(input.iter().copied().filter(|&d| d != 1).collect()),
            Some(raw) => {
                let mut axes = Vec::with_capacity(raw.len());
                for a in raw {
                    let axis = normalize_axis(a, rank).ok_or_else(|| {
                        ctx.invalid_attr("axes", format!("{a} out of range for rank {rank}"))
                    })?;
                    if input[axis] != 1 {
                        return Err(ctx.invalid_attr(
                            "axes",
                            format!("axis {axis} has extent {}", input[axis]),
                        ));
                    }
                    axes.push(axis);
                }
                Ok(input
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !axes.contains(i))
                    .map(|(_, &d)| d)
                    .collect())
            }
        },
        OpKind::Unsqueeze => {
            let raw = axes_operand(ctx)?.ok_or_else(|| ctx.invalid_attr("axes", "required"))?;
            let out_rank = rank + raw.len();
            let mut axes = raw
                .iter()
                .map(|&a| {
                    normalize_axis(a, out_rank).ok_or_else(|| {
                        ctx.invalid_attr("axes", format!("{a} out of range for rank {out_rank}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            axes.sort_unstable();
            let mut out = input.to_vec();
            for axis in axes {
                out.insert(axis, 1);
            }
            Ok(out)
        }
        other => Err(ctx.unsupported(format!("{other} is not a view"))),
    }
}

pub(super) fn lower_view(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let x = ctx.input(0)?;
    let source = x.source_shape();
    let target = view_shape(ctx, &source)?;
    if target == source {
        return Ok(vec![x.clone()]);
    }

    // Image data can be reinterpreted in place only when the two layouts
    // agree on element order.
    let input = match x {
        Operand::Image { id, .. } if layout_preserving(&source) => *id,
        other => lw.ensure_generic(other)?.0,
    };
    let name = ctx.output_name(0);
    let dtype = lw.graph.tensor(input).dtype;
    let (output, out) = match to_channels_last_shape(&target) {
        Some(nhwc) if layout_preserving(&target) => {
            lw.value(name, DataFormat::InterleavedImageBatch, nhwc.to_vec(), dtype)?
        }
        _ => lw.value(name, DataFormat::GenericTensor, target, dtype)?,
    };
    let shape = out.shape();
    lw.emit(TargetOp::Reshape {
        input,
        output,
        shape,
    });
    Ok(vec![out])
}

pub(super) fn transpose_perm(ctx: &NodeCtx, rank: usize) -> Result<Vec<usize>> {
    let Some(raw) = ctx.ints_attr("perm")? else {
        return Ok((0..rank).rev().collect());
    };
    let perm = raw
        .iter()
        .map(|&p| normalize_axis(p, rank))
        .collect::<Option<Vec<_>>>()
        .filter(|p| {
            let mut seen = p.clone();
            seen.sort_unstable();
            seen == (0..rank).collect::<Vec<_>>()
        })
        .ok_or_else(|| ctx.invalid_attr("perm", format!("{raw:?} is not a permutation of rank {rank}")))?;
    Ok(perm)
}

pub(super) fn lower_transpose(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let x = ctx.input(0)?;
    let source = x.source_shape();
    let perm = transpose_perm(ctx, source.len())?;
    let out_shape: Vec<usize> = perm.iter().map(|&p| source[p]).collect();
    let name = ctx.output_name(0);

    // An image operand is permuted straight from its channel-last order.
    let (input, perm) = match x {
        Operand::Image { id, .. } => (*id, perm.iter().map(|&p| channels_last_axis(p)).collect()),
        other => (lw.ensure_generic(other)?.0, perm),
    };
    let dtype = lw.graph.tensor(input).dtype;
    let (output, out) = lw.value(name, DataFormat::GenericTensor, out_shape.clone(), dtype)?;
    if perm.iter().enumerate().all(|(i, &p)| i == p) {
        lw.emit(TargetOp::Reshape {
            input,
            output,
            shape: out_shape,
        });
    } else {
        lw.emit(TargetOp::Transpose {
            input,
            output,
            perm,
        });
    }
    Ok(vec![out])
}

/// Unit-step `start..end` per axis of `shape`, channel-first.
pub(super) fn slice_ranges(ctx: &NodeCtx, shape: &[usize]) -> Result<Vec<Range<usize>>> {
    let rank = shape.len();
    let (starts, ends, axes) = if ctx.opset < 10 {
        let starts = ctx.ints_attr("starts")?.ok_or_else(|| ctx.invalid_attr("starts", "required"))?;
        let ends = ctx.ints_attr("ends")?.ok_or_else(|| ctx.invalid_attr("ends", "required"))?;
        (starts, ends, ctx.ints_attr("axes")?)
    } else {
        let starts = ctx.constant_input(1)?.data.to_i64();
        let ends = ctx.constant_input(2)?.data.to_i64();
        let axes = ctx.optional_constant(3)?.map(|a| a.data.to_i64());
        if let Some(steps) = ctx.optional_constant(4)? {
            if steps.data.to_i64().iter().any(|&s| s != 1) {
                return Err(ctx.unsupported("strided slice"));
            }
        }
        (starts, ends, axes)
    };
    let axes = axes.unwrap_or_else(|| (0..starts.len() as i64).collect());
    if starts.len() != ends.len() || starts.len() != axes.len() {
        return Err(ctx.invalid_attr("starts", "starts, ends and axes differ in length"));
    }

    let mut ranges: Vec<Range<usize>> = shape.iter().map(|&d| 0..d).collect();
    for ((&s, &e), &a) in starts.iter().zip(&ends).zip(&axes) {
        let axis = normalize_axis(a, rank)
            .ok_or_else(|| ctx.invalid_attr("axes", format!("{a} out of range for rank {rank}")))?;
        let dim = shape[axis] as i64;
        let clamp = |v: i64| {
            let v = if v < 0 { v + dim } else { v };
            v.clamp(0, dim) as usize
        };
        let (start, end) = (clamp(s), clamp(e));
        if start >= end {
            return Err(ctx.unsupported(format!("empty slice {s}..{e} on axis {axis}")));
        }
        ranges[axis] = start..end;
    }
    Ok(ranges)
}

pub(super) fn lower_slice(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let x = ctx.input(0)?;
    let source = x.source_shape();
    let ranges = slice_ranges(ctx, &source)?;
    if ranges.iter().zip(&source).all(|(r, &d)| r.start == 0 && r.end == d) {
        return Ok(vec![x.clone()]);
    }
    let name = ctx.output_name(0);
    let (input, format, ranges) = match x {
        Operand::Image { id, .. } => {
            let nhwc: Vec<Range<usize>> =
                TO_CHANNELS_LAST.iter().map(|&a| ranges[a].clone()).collect();
            (*id, DataFormat::InterleavedImageBatch, nhwc)
        }
        other => (lw.ensure_generic(other)?.0, DataFormat::GenericTensor, ranges),
    };
    let dtype = lw.graph.tensor(input).dtype;
    let shape = ranges.iter().map(|r| r.len()).collect();
    let (output, out) = lw.value(name, format, shape, dtype)?;
    lw.emit(TargetOp::Slice {
        input,
        output,
        begin: ranges.iter().map(|r| r.start).collect(),
        end: ranges.iter().map(|r| r.end).collect(),
    });
    Ok(vec![out])
}

pub(super) fn pad_mode(ctx: &NodeCtx) -> Result<PadMode> {
    match ctx.string_attr("mode", "constant")?.as_str() {
        "constant" => Ok(PadMode::Constant),
        "reflect" => Ok(PadMode::Reflect),
        "edge" => Ok(PadMode::Edge),
        other => Err(ctx.unsupported(format!("pad mode '{other}'"))),
    }
}

/// Spatial `[[top, bottom], [left, right]]` from ONNX pads of a 4-D tensor.
pub(super) fn spatial_pads(ctx: &NodeCtx) -> Result<[[usize; 2]; 2]> {
    let pads = if ctx.opset < 11 {
        ctx.ints_attr("pads")?
            .or(ctx.ints_attr("paddings")?)
            .ok_or_else(|| ctx.invalid_attr("pads", "required"))?
    } else {
        ctx.constant_input(1)?.data.to_i64()
    };
    if pads.len() != 8 {
        return Err(ctx.unsupported(format!("pads {pads:?} for a non-4-D tensor")));
    }
    if pads.iter().any(|&p| p < 0) {
        return Err(ctx.unsupported("negative padding"));
    }
    if [0, 1, 4, 5].iter().any(|&i| pads[i] != 0) {
        return Err(ctx.unsupported("padding the batch or channel axis"));
    }
    let p = |i: usize| pads[i] as usize;
    Ok([[p(2), p(6)], [p(3), p(7)]])
}

pub(super) fn pad_value(ctx: &NodeCtx) -> Result<f32> {
    if ctx.opset < 11 {
        return ctx.float_attr("value", 0.0);
    }
    match ctx.optional_constant(2)? {
        None => Ok(0.0),
        Some(v) => v
            .as_scalar_f32()
            .ok_or_else(|| ctx.unsupported("non-scalar pad value")),
    }
}

pub(super) fn lower_pad(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let x = ctx.input(0)?;
    if x.rank() != 4 {
        return Err(ctx.unsupported(format!("only 4-D padding is supported, got rank {}", x.rank())));
    }
    let mode = pad_mode(ctx)?;
    let pads = spatial_pads(ctx)?;
    let value = pad_value(ctx)?;
    let (input, shape) = lw.ensure_image(x)?;
    let (output, shape) =
        lw.pad_image(ctx.output_name(0), input, shape, pads, PadFill::Constant(value), mode);
    Ok(vec![Operand::Image { id: output, shape }])
}

/// Shape of a runtime tensor is known statically.
pub(super) fn lower_shape(ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let dims: Vec<i64> = ctx
        .input(0)?
        .source_shape()
        .iter()
        .map(|&d| d as i64)
        .collect();
    let rank = dims.len() as i64;
    let clamp = |v: i64| (if v < 0 { v + rank } else { v }).clamp(0, rank) as usize;
    let start = clamp(ctx.int_attr("start", 0)?);
    let end = clamp(ctx.int_attr("end", rank)?);
    let dims = dims.get(start..end.max(start)).unwrap_or_default().to_vec();
    Ok(vec![Operand::constant(ConstantValue::vector_i64(dims))])
}
