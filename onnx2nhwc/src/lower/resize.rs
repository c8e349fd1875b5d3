//! Upsample and Resize.
//!
//! Exporters have encoded the target size three different ways over the
//! opset history. All of them are normalized into a [`ResizeSpec`] before
//! anything is emitted.

use crate::error::Result;
use crate::format::Operand;
use crate::ir::onnx::OpKind;
use crate::ir::target::{ResizeMethod, ResizeSpec, TargetOp};

use super::{Lowerer, NodeCtx};

/// Where the output size came from.
#[derive(Debug, Clone, PartialEq)]
enum Target {
    /// Per-axis factors over the channel-first shape.
    Scales(Vec<f32>),
    /// Absolute channel-first output shape.
    Sizes(Vec<usize>),
}

fn read_target(ctx: &NodeCtx) -> Result<Target> {
    let from_input = |i: usize| -> Result<Option<Target>> {
        Ok(ctx
            .optional_constant(i)?
            .map(|v| Target::Scales(v.data.to_f32())))
    };
    let target = match ctx.kind {
        OpKind::Upsample if ctx.opset < 9 => ctx.floats_attr("scales")?.map(Target::Scales),
        OpKind::Upsample => from_input(1)?,
        _ if ctx.opset < 11 => from_input(1)?,
        // X, roi, scales, sizes
        _ => match from_input(2)? {
            Some(scales) => Some(scales),
            None => ctx.optional_constant(3)?.map(|v| {
                Target::Sizes(v.data.to_i64().iter().map(|&d| d.max(0) as usize).collect())
            }),
        },
    };
    target.ok_or_else(|| ctx.unsupported("neither scales nor sizes is given"))
}

fn method(ctx: &NodeCtx) -> Result<ResizeMethod> {
    match ctx.string_attr("mode", "nearest")?.as_str() {
        "nearest" => Ok(ResizeMethod::Nearest),
        "linear" | "bilinear" => Ok(ResizeMethod::Bilinear),
        other => Err(ctx.unsupported(format!("resize mode '{other}'"))),
    }
}

/// `(align_corners, half_pixel_centers)` for the node's coordinate mapping.
fn coordinates(ctx: &NodeCtx) -> Result<(bool, bool)> {
    // Before opset 11 only the asymmetric mapping existed.
    if ctx.kind == OpKind::Upsample || ctx.opset < 11 {
        return Ok((false, false));
    }
    match ctx
        .string_attr("coordinate_transformation_mode", "half_pixel")?
        .as_str()
    {
        "asymmetric" => Ok((false, false)),
        "align_corners" => Ok((true, false)),
        "half_pixel" | "pytorch_half_pixel" => Ok((false, true)),
        other => Err(ctx.unsupported(format!("coordinate transformation '{other}'"))),
    }
}

/// Normalized spec for an input of channel-first shape `source`.
fn resize_spec(ctx: &NodeCtx, source: &[usize]) -> Result<ResizeSpec> {
    let method = method(ctx)?;
    let (align_corners, half_pixel_centers) = coordinates(ctx)?;
    let out: Vec<usize> = match read_target(ctx)? {
        Target::Scales(scales) => {
            if scales.len() != source.len() {
                return Err(ctx.invalid_attr(
                    "scales",
                    format!("{} factors for rank {}", scales.len(), source.len()),
                ));
            }
            if scales.iter().any(|&s| s <= 0.0) {
                return Err(ctx.invalid_attr("scales", format!("non-positive factor in {scales:?}")));
            }
            source
                .iter()
                .zip(&scales)
                .map(|(&d, &s)| (d as f32 * s).floor() as usize)
                .collect()
        }
        Target::Sizes(sizes) => {
            if sizes.len() != source.len() {
                return Err(ctx.invalid_attr(
                    "sizes",
                    format!("{} sizes for rank {}", sizes.len(), source.len()),
                ));
            }
            sizes
        }
    };
    if out[0] != source[0] || out[1] != source[1] {
        return Err(ctx.unsupported("resizing the batch or channel axis"));
    }
    if out[2] == 0 || out[3] == 0 {
        return Err(ctx.unsupported(format!("empty output size {out:?}")));
    }
    Ok(ResizeSpec {
        method,
        size: [out[2], out[3]],
        align_corners,
        half_pixel_centers,
    })
}

pub(super) fn lower_resize(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let x = ctx.input(0)?;
    if x.rank() != 4 {
        return Err(ctx.unsupported(format!("only 4-D resize is supported, got rank {}", x.rank())));
    }
    let spec = resize_spec(ctx, &x.source_shape())?;
    let (input, [n, _, _, c]) = lw.ensure_image(x)?;
    let dtype = lw.graph.tensor(input).dtype;
    let shape = [n, spec.size[0], spec.size[1], c];
    let output = lw.image_tensor(ctx.output_name(0), shape, dtype);
    lw.emit(TargetOp::Resize {
        input,
        output,
        spec,
    });
    Ok(vec![Operand::Image { id: output, shape }])
}
