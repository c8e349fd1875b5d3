//! Convolution and transposed convolution.

use std::ops::Range;

use crate::error::Result;
use crate::format::Operand;
use crate::ir::graph::ConstantValue;
use crate::ir::target::{BinaryOp, Conv2dParams, PadFill, PadMode, TargetOp};

use super::{is_symmetric, EdgePads, Lowerer, NodeCtx};

/// SAME padding for one axis, split across its two edges. `upper` puts the
/// odd element at the end.
pub(super) fn same_padding(input: usize, kernel: usize, stride: usize, upper: bool) -> [usize; 2] {
    // Output size for SAME: ceil(input / stride)
    let out = input.div_ceil(stride);
    let total = (out.saturating_sub(1) * stride + kernel).saturating_sub(input);
    let small = total / 2;
    if upper {
        [small, total - small]
    } else {
        [total - small, small]
    }
}

/// Strides or dilations: two entries, each at least 1.
pub(super) fn positive_pair(ctx: &NodeCtx, name: &str) -> Result<[usize; 2]> {
    let pair = ctx.usize_attr(name, [1, 1])?;
    if pair.contains(&0) {
        return Err(ctx.invalid_attr(name, "must be positive"));
    }
    Ok(pair)
}

/// Resolve `auto_pad` / `pads` into explicit per-edge padding.
pub(super) fn resolve_pads(
    ctx: &NodeCtx,
    input: [usize; 2],
    effective_kernel: [usize; 2],
    stride: [usize; 2],
) -> Result<EdgePads> {
    let auto_pad = ctx.string_attr("auto_pad", "NOTSET")?;
    match auto_pad.as_str() {
        "NOTSET" => {
            // ONNX order: [top, left, bottom, right]
            let p = ctx.usize_attr("pads", [0; 4])?;
            Ok([[p[0], p[2]], [p[1], p[3]]])
        }
        "VALID" => Ok([[0, 0], [0, 0]]),
        "SAME_UPPER" | "SAME_LOWER" => {
            let upper = auto_pad == "SAME_UPPER";
            Ok([0, 1].map(|a| same_padding(input[a], effective_kernel[a], stride[a], upper)))
        }
        other => Err(ctx.invalid_attr("auto_pad", format!("unknown mode '{other}'"))),
    }
}

pub(super) fn effective_kernel(kernel: [usize; 2], dilation: [usize; 2]) -> [usize; 2] {
    [0, 1].map(|a| (kernel[a] - 1) * dilation[a] + 1)
}

/// Symmetric padding stays an attribute; anything else becomes one explicit
/// `Pad` followed by a padding-free window op.
pub(super) fn pad_if_asymmetric(
    lw: &mut Lowerer,
    name: &str,
    input: usize,
    shape: [usize; 4],
    pads: EdgePads,
    fill: PadFill,
) -> (usize, [usize; 4], [usize; 2]) {
    if is_symmetric(&pads) {
        return (input, shape, [pads[0][0], pads[1][0]]);
    }
    log::debug!("{name}: asymmetric padding {pads:?} lowered as explicit pad");
    let (padded, padded_shape) = lw.pad_image(
        &format!("{name}/pad"),
        input,
        shape,
        pads,
        fill,
        PadMode::Constant,
    );
    (padded, padded_shape, [0, 0])
}

/// Output extent of a sliding window over `len` (padding already included).
pub(super) fn window_extent(
    ctx: &NodeCtx,
    len: usize,
    effective_kernel: usize,
    stride: usize,
    ceil: bool,
) -> Result<usize> {
    if effective_kernel > len {
        return Err(ctx.invalid_attr(
            "kernel_shape",
            format!("window of {effective_kernel} does not fit an axis of {len}"),
        ));
    }
    let span = len - effective_kernel;
    let steps = if ceil {
        span.div_ceil(stride)
    } else {
        span / stride
    };
    Ok(steps + 1)
}

fn slice_channels(
    lw: &mut Lowerer,
    name: &str,
    input: usize,
    shape: [usize; 4],
    channels: Range<usize>,
) -> usize {
    let [n, h, w, _] = shape;
    let dtype = lw.graph.tensor(input).dtype;
    let output = lw.image_tensor(name, [n, h, w, channels.len()], dtype);
    lw.emit(TargetOp::Slice {
        input,
        output,
        begin: vec![0, 0, 0, channels.start],
        end: vec![n, h, w, channels.end],
    });
    output
}

fn concat_channels(lw: &mut Lowerer, name: &str, inputs: Vec<usize>, shape: [usize; 4]) -> usize {
    let dtype = lw.graph.tensor(inputs[0]).dtype;
    let output = lw.image_tensor(name, shape, dtype);
    lw.emit(TargetOp::Concat {
        inputs,
        output,
        axis: 3,
    });
    output
}

/// Emit a `Conv2d` from channel-first `(O, I/g, kH, kW)` weights.
fn emit_conv(
    lw: &mut Lowerer,
    name: &str,
    input: usize,
    weights: &ConstantValue,
    bias: Option<&ConstantValue>,
    params: Conv2dParams,
    out_shape: [usize; 4],
) -> usize {
    let weights = lw.constant(&format!("{name}/weights"), &weights.permute(&[2, 3, 1, 0]));
    let bias = bias.map(|b| lw.constant(&format!("{name}/bias"), b));
    let dtype = lw.graph.tensor(input).dtype;
    let output = lw.image_tensor(name, out_shape, dtype);
    lw.emit(TargetOp::Conv2d {
        input,
        weights,
        bias,
        output,
        params,
    });
    output
}

/// Emit a padding-free `Conv2dTranspose` from `(I, O/g, kH, kW)` weights.
fn emit_conv_transpose(
    lw: &mut Lowerer,
    name: &str,
    input: usize,
    weights: &ConstantValue,
    bias: Option<&ConstantValue>,
    params: Conv2dParams,
    out_shape: [usize; 4],
) -> usize {
    let weights = lw.constant(&format!("{name}/weights"), &weights.permute(&[2, 3, 1, 0]));
    let bias = bias.map(|b| lw.constant(&format!("{name}/bias"), b));
    let dtype = lw.graph.tensor(input).dtype;
    let output = lw.image_tensor(name, out_shape, dtype);
    lw.emit(TargetOp::Conv2dTranspose {
        input,
        weights,
        bias,
        output,
        params,
    });
    output
}

fn check_bias(ctx: &NodeCtx, bias: Option<&ConstantValue>, channels: usize) -> Result<()> {
    match bias {
        Some(b) if b.len() != channels => Err(ctx.unsupported(format!(
            "bias has {} values for {channels} output channels",
            b.len()
        ))),
        _ => Ok(()),
    }
}

pub(super) fn lower_conv(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let x = ctx.input(0)?;
    if x.rank() != 4 {
        return Err(ctx.unsupported(format!(
            "only 2-D convolution is supported, input has rank {}",
            x.rank()
        )));
    }
    let weights = ctx.constant_input(1)?;
    let bias = ctx.optional_constant(2)?;
    let [c_out, c_per_group, kh, kw] = *weights.shape.as_slice() else {
        return Err(ctx.unsupported(format!("expected 4-D weights, got {:?}", weights.shape)));
    };
    if kh == 0 || kw == 0 {
        return Err(ctx.invalid_attr("kernel_shape", "empty kernel"));
    }
    check_bias(ctx, bias.as_deref(), c_out)?;

    let (input, [n, h, w, c_in]) = lw.ensure_image(x)?;
    let groups = ctx.int_attr("group", 1)?;
    if groups < 1 {
        return Err(ctx.invalid_attr("group", format!("must be positive, got {groups}")));
    }
    let groups = groups as usize;
    if c_per_group * groups != c_in || c_out % groups != 0 {
        return Err(ctx.invalid_attr(
            "group",
            format!("{groups} groups do not divide {c_in} -> {c_out} channels"),
        ));
    }
    if let Some(kernel_shape) = ctx.ints_attr("kernel_shape")? {
        if kernel_shape != [kh as i64, kw as i64] {
            return Err(ctx.invalid_attr(
                "kernel_shape",
                format!("{kernel_shape:?} disagrees with weights {:?}", weights.shape),
            ));
        }
    }
    let stride = positive_pair(ctx, "strides")?;
    let dilation = positive_pair(ctx, "dilations")?;
    let effective = effective_kernel([kh, kw], dilation);
    let pads = resolve_pads(ctx, [h, w], effective, stride)?;

    let name = ctx.output_name(0);
    let (input, shape, padding) =
        pad_if_asymmetric(lw, name, input, [n, h, w, c_in], pads, PadFill::Constant(0.0));
    let out_h = window_extent(ctx, shape[1] + 2 * padding[0], effective[0], stride[0], false)?;
    let out_w = window_extent(ctx, shape[2] + 2 * padding[1], effective[1], stride[1], false)?;
    let out_shape = [n, out_h, out_w, c_out];
    let mut params = Conv2dParams {
        kernel: [kh, kw],
        stride,
        dilation,
        padding,
        groups: 1,
    };

    let output = if groups == 1 {
        emit_conv(lw, name, input, &weights, bias.as_deref(), params, out_shape)
    } else if groups == c_in && c_per_group == 1 {
        let multiplier = c_out / c_in;
        // (C * mult, 1, kH, kW) -> (kH, kW, C, mult)
        let dw = weights
            .reshape(vec![c_in, multiplier, kh, kw])
            .permute(&[2, 3, 0, 1]);
        let dw = lw.constant(&format!("{name}/weights"), &dw);
        let bias = bias.map(|b| lw.constant(&format!("{name}/bias"), &b));
        let dtype = lw.graph.tensor(input).dtype;
        let output = lw.image_tensor(name, out_shape, dtype);
        params.groups = groups;
        lw.emit(TargetOp::DepthwiseConv2d {
            input,
            weights: dw,
            bias,
            output,
            params,
            depth_multiplier: multiplier,
        });
        output
    } else if lw.config.capabilities.grouped_conv {
        params.groups = groups;
        emit_conv(lw, name, input, &weights, bias.as_deref(), params, out_shape)
    } else {
        log::info!("{name}: splitting {groups}-group convolution");
        let out_per_group = c_out / groups;
        let mut parts = Vec::with_capacity(groups);
        for g in 0..groups {
            let part_in = slice_channels(
                lw,
                &format!("{name}/group{g}/input"),
                input,
                shape,
                g * c_per_group..(g + 1) * c_per_group,
            );
            let out_range = g * out_per_group..(g + 1) * out_per_group;
            let part_weights = weights.slice_axis(0, out_range.start, out_range.end);
            let part_bias = bias
                .as_deref()
                .map(|b| b.slice_axis(0, out_range.start, out_range.end));
            parts.push(emit_conv(
                lw,
                &format!("{name}/group{g}"),
                part_in,
                &part_weights,
                part_bias.as_ref(),
                params.clone(),
                [n, out_h, out_w, out_per_group],
            ));
        }
        concat_channels(lw, name, parts, out_shape)
    };

    Ok(vec![Operand::Image {
        id: output,
        shape: out_shape,
    }])
}

pub(super) fn lower_conv_transpose(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let x = ctx.input(0)?;
    if x.rank() != 4 {
        return Err(ctx.unsupported(format!(
            "only 2-D transposed convolution is supported, input has rank {}",
            x.rank()
        )));
    }
    let weights = ctx.constant_input(1)?;
    let bias = ctx.optional_constant(2)?;
    let [w_in, out_per_group, kh, kw] = *weights.shape.as_slice() else {
        return Err(ctx.unsupported(format!("expected 4-D weights, got {:?}", weights.shape)));
    };
    if kh == 0 || kw == 0 {
        return Err(ctx.invalid_attr("kernel_shape", "empty kernel"));
    }
    let (input, [n, h, w, c_in]) = lw.ensure_image(x)?;
    if w_in != c_in {
        return Err(ctx.unsupported(format!(
            "weights expect {w_in} input channels, input has {c_in}"
        )));
    }
    let groups = ctx.int_attr("group", 1)?;
    if groups < 1 || c_in % groups as usize != 0 {
        return Err(ctx.invalid_attr(
            "group",
            format!("{groups} groups do not divide {c_in} input channels"),
        ));
    }
    let groups = groups as usize;
    let c_out = out_per_group * groups;
    check_bias(ctx, bias.as_deref(), c_out)?;

    if ctx.has_attr("output_shape") {
        return Err(ctx.unsupported("explicit output_shape"));
    }
    let pads = match ctx.string_attr("auto_pad", "NOTSET")?.as_str() {
        "NOTSET" => {
            let p = ctx.usize_attr("pads", [0; 4])?;
            [[p[0], p[2]], [p[1], p[3]]]
        }
        "VALID" => [[0, 0], [0, 0]],
        other => return Err(ctx.unsupported(format!("auto_pad '{other}'"))),
    };
    let stride = positive_pair(ctx, "strides")?;
    let dilation = positive_pair(ctx, "dilations")?;
    let output_padding = ctx.usize_attr("output_padding", [0, 0])?;
    let effective = effective_kernel([kh, kw], dilation);
    let full = [
        (h.max(1) - 1) * stride[0] + effective[0],
        (w.max(1) - 1) * stride[1] + effective[1],
    ];

    // Begin pads are cropped away. End pads cancel against output padding;
    // whatever output padding is left over is appended with zeros.
    let mut crop = [[0; 2]; 2];
    let mut extra = [0; 2];
    for a in 0..2 {
        let [begin, end] = pads[a];
        if begin + end > full[a] + output_padding[a] {
            return Err(ctx.invalid_attr(
                "pads",
                format!("padding {:?} exceeds output extent {}", pads[a], full[a]),
            ));
        }
        crop[a] = [begin, end.saturating_sub(output_padding[a])];
        extra[a] = output_padding[a].saturating_sub(end);
    }
    let has_crop = crop.iter().flatten().any(|&c| c > 0);
    let has_pad = extra.iter().any(|&e| e > 0);
    let late_bias = if has_pad { bias.clone() } else { None };
    let core_bias = if has_pad { None } else { bias };

    let name = ctx.output_name(0);
    let core_name = if has_crop || has_pad {
        format!("{name}/full")
    } else {
        name.to_string()
    };
    let core_shape = [n, full[0], full[1], c_out];
    let mut params = Conv2dParams {
        kernel: [kh, kw],
        stride,
        dilation,
        padding: [0, 0],
        groups: 1,
    };

    let mut output = if groups == 1 || lw.config.capabilities.grouped_conv {
        params.groups = groups;
        emit_conv_transpose(
            lw,
            &core_name,
            input,
            &weights,
            core_bias.as_deref(),
            params,
            core_shape,
        )
    } else {
        log::info!("{name}: splitting {groups}-group transposed convolution");
        let in_per_group = c_in / groups;
        let mut parts = Vec::with_capacity(groups);
        for g in 0..groups {
            let in_range = g * in_per_group..(g + 1) * in_per_group;
            let part_in = slice_channels(
                lw,
                &format!("{name}/group{g}/input"),
                input,
                [n, h, w, c_in],
                in_range.clone(),
            );
            let part_weights = weights.slice_axis(0, in_range.start, in_range.end);
            let part_bias = core_bias
                .as_deref()
                .map(|b| b.slice_axis(0, g * out_per_group, (g + 1) * out_per_group));
            parts.push(emit_conv_transpose(
                lw,
                &format!("{name}/group{g}"),
                part_in,
                &part_weights,
                part_bias.as_ref(),
                params.clone(),
                [n, full[0], full[1], out_per_group],
            ));
        }
        concat_channels(lw, &core_name, parts, core_shape)
    };
    let mut shape = core_shape;
    let dtype = lw.graph.tensor(output).dtype;

    if has_crop {
        let crop_name = if has_pad {
            format!("{name}/crop")
        } else {
            name.to_string()
        };
        shape = [
            n,
            shape[1] - crop[0][0] - crop[0][1],
            shape[2] - crop[1][0] - crop[1][1],
            c_out,
        ];
        let cropped = lw.image_tensor(&crop_name, shape, dtype);
        lw.emit(TargetOp::Crop {
            input: output,
            output: cropped,
            crop,
        });
        output = cropped;
    }

    if has_pad {
        let pad_name = if late_bias.is_some() {
            format!("{name}/pad")
        } else {
            name.to_string()
        };
        let (padded, padded_shape) = lw.pad_image(
            &pad_name,
            output,
            shape,
            [[0, extra[0]], [0, extra[1]]],
            PadFill::Constant(0.0),
            PadMode::Constant,
        );
        output = padded;
        shape = padded_shape;

        if let Some(bias) = late_bias {
            let rhs = lw.constant(&format!("{name}/bias"), &bias.reshape(vec![1, 1, 1, c_out]));
            let biased = lw.image_tensor(name, shape, dtype);
            lw.emit(TargetOp::Binary {
                op: BinaryOp::Add,
                lhs: output,
                rhs,
                output: biased,
            });
            output = biased;
        }
    }

    Ok(vec![Operand::Image { id: output, shape }])
}
