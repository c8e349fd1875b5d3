//! Pooling and mean reductions.

use crate::error::Result;
use crate::format::{channels_last_axis, normalize_axis, DataFormat, Operand};
use crate::ir::target::{PadFill, PadMode, Pool2dParams, TargetOp};

use super::conv::{pad_if_asymmetric, positive_pair, resolve_pads, window_extent};
use super::{is_symmetric, EdgePads, Lowerer, NodeCtx};

/// Shared attribute reading for MaxPool and AveragePool.
struct Window {
    kernel: [usize; 2],
    stride: [usize; 2],
    pads: EdgePads,
    ceil_mode: bool,
}

impl Window {
    fn read(ctx: &NodeCtx, input_hw: [usize; 2]) -> Result<Self> {
        if !ctx.has_attr("kernel_shape") {
            return Err(ctx.invalid_attr("kernel_shape", "required"));
        }
        let kernel = ctx.usize_attr("kernel_shape", [1, 1])?;
        if kernel.contains(&0) {
            return Err(ctx.invalid_attr("kernel_shape", "must be positive"));
        }
        let stride = positive_pair(ctx, "strides")?;
        if positive_pair(ctx, "dilations")? != [1, 1] {
            return Err(ctx.unsupported("dilated pooling"));
        }
        let pads = resolve_pads(ctx, input_hw, kernel, stride)?;
        let ceil_mode = ctx.int_attr("ceil_mode", 0)? != 0;
        Ok(Self {
            kernel,
            stride,
            pads,
            ceil_mode,
        })
    }

    /// Output extent per axis. With `ceil_mode`, the end pad is grown to
    /// cover the overhanging window so the padded input yields the same
    /// extent with floor rounding.
    fn resolve(&mut self, ctx: &NodeCtx, input_hw: [usize; 2]) -> Result<[usize; 2]> {
        let mut out = [0; 2];
        for a in 0..2 {
            let [begin, end] = self.pads[a];
            let padded = input_hw[a] + begin + end;
            let mut extent = window_extent(ctx, padded, self.kernel[a], self.stride[a], self.ceil_mode)?;
            if self.ceil_mode {
                // The last window must start inside the input or its begin pad.
                if (extent - 1) * self.stride[a] >= input_hw[a] + begin {
                    extent -= 1;
                }
                let needed = (extent - 1) * self.stride[a] + self.kernel[a];
                self.pads[a][1] += needed.saturating_sub(padded);
            }
            out[a] = extent;
        }
        Ok(out)
    }

    fn is_uniform(&self) -> bool {
        self.kernel[0] == self.kernel[1]
            && self.stride[0] == self.stride[1]
            && is_symmetric(&self.pads)
            && self.pads[0][0] == self.pads[1][0]
    }

    fn has_padding(&self) -> bool {
        self.pads.iter().flatten().any(|&p| p > 0)
    }
}

fn single_output(ctx: &NodeCtx) -> Result<()> {
    if ctx.node.outputs.iter().skip(1).any(|o| !o.is_empty()) {
        return Err(ctx.unsupported("only the pooled output may be consumed"));
    }
    Ok(())
}

pub(super) fn lower_max_pool(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    single_output(ctx)?;
    let x = ctx.input(0)?;
    if x.rank() != 4 {
        return Err(ctx.unsupported(format!("only 2-D pooling is supported, input has rank {}", x.rank())));
    }
    if ctx.int_attr("storage_order", 0)? != 0 {
        return Err(ctx.unsupported("column-major storage_order"));
    }
    let (input, [n, h, w, c]) = lw.ensure_image(x)?;
    let mut window = Window::read(ctx, [h, w])?;
    let [out_h, out_w] = window.resolve(ctx, [h, w])?;

    let name = ctx.output_name(0);
    let (input, _, padding) =
        pad_if_asymmetric(lw, name, input, [n, h, w, c], window.pads, PadFill::Lowest);
    let out_shape = [n, out_h, out_w, c];
    let dtype = lw.graph.tensor(input).dtype;
    let output = lw.image_tensor(name, out_shape, dtype);
    lw.emit(TargetOp::MaxPool2d {
        input,
        output,
        params: Pool2dParams {
            kernel: window.kernel,
            stride: window.stride,
            padding,
        },
    });
    Ok(vec![Operand::Image {
        id: output,
        shape: out_shape,
    }])
}

pub(super) fn lower_avg_pool(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let x = ctx.input(0)?;
    if x.rank() != 4 {
        return Err(ctx.unsupported(format!("only 2-D pooling is supported, input has rank {}", x.rank())));
    }
    let (input, [n, h, w, c]) = lw.ensure_image(x)?;
    let mut window = Window::read(ctx, [h, w])?;
    let count_include_pad = ctx.int_attr("count_include_pad", 0)? != 0;
    let declared_pads = window.pads;
    let [out_h, out_w] = window.resolve(ctx, [h, w])?;

    let name = ctx.output_name(0);
    let (input, padding, include) = if !window.has_padding() {
        (input, [0, 0], false)
    } else if count_include_pad {
        if window.is_uniform() {
            (input, [window.pads[0][0], window.pads[1][0]], true)
        } else {
            let (padded, _) = lw.pad_image(
                &format!("{name}/pad"),
                input,
                [n, h, w, c],
                window.pads,
                PadFill::Constant(0.0),
                PadMode::Constant,
            );
            (padded, [0, 0], false)
        }
    } else if is_symmetric(&window.pads) {
        (input, [window.pads[0][0], window.pads[1][0]], false)
    } else if window.pads != declared_pads {
        return Err(ctx.unsupported("ceil_mode overhang without count_include_pad"));
    } else {
        return Err(ctx.unsupported("asymmetric padding without count_include_pad"));
    };

    let out_shape = [n, out_h, out_w, c];
    let dtype = lw.graph.tensor(input).dtype;
    let output = lw.image_tensor(name, out_shape, dtype);
    lw.emit(TargetOp::AvgPool2d {
        input,
        output,
        params: Pool2dParams {
            kernel: window.kernel,
            stride: window.stride,
            padding,
        },
        count_include_pad: include,
    });
    Ok(vec![Operand::Image {
        id: output,
        shape: out_shape,
    }])
}

fn global_avg_pool(
    lw: &mut Lowerer,
    name: &str,
    input: usize,
    shape: [usize; 4],
    keep_dims: bool,
) -> Result<Operand> {
    let [n, _, _, c] = shape;
    let dtype = lw.graph.tensor(input).dtype;
    let (format, out_shape) = if keep_dims {
        (DataFormat::InterleavedImageBatch, vec![n, 1, 1, c])
    } else {
        (DataFormat::GenericTensor, vec![n, c])
    };
    let (output, out) = lw.value(name, format, out_shape, dtype)?;
    lw.emit(TargetOp::GlobalAvgPool2d {
        input,
        output,
        keep_dims,
    });
    Ok(out)
}

pub(super) fn lower_global_avg_pool(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let x = ctx.input(0)?;
    if x.rank() != 4 {
        return Err(ctx.unsupported(format!("expected a 4-D input, got rank {}", x.rank())));
    }
    let (input, shape) = lw.ensure_image(x)?;
    Ok(vec![global_avg_pool(lw, ctx.output_name(0), input, shape, true)?])
}

fn reduced_shape(shape: &[usize], axes: &[usize], keep_dims: bool) -> Vec<usize> {
    shape
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| match (axes.contains(&i), keep_dims) {
            (false, _) => Some(d),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect()
}

pub(super) fn lower_reduce_mean(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let x = ctx.input(0)?;
    let rank = x.rank();
    let keep_dims = ctx.int_attr("keepdims", 1)? != 0;
    // Axes moved from an attribute to an optional input in opset 18.
    let raw_axes = match ctx.optional_constant(1)? {
        Some(axes) => Some(axes.data.to_i64()),
        None => ctx.ints_attr("axes")?,
    };
    let mut axes = match raw_axes {
        Some(raw) => raw
            .iter()
            .map(|&a| {
                normalize_axis(a, rank)
                    .ok_or_else(|| ctx.invalid_attr("axes", format!("axis {a} out of range for rank {rank}")))
            })
            .collect::<Result<Vec<_>>>()?,
        None => (0..rank).collect(),
    };
    axes.sort_unstable();
    axes.dedup();

    let name = ctx.output_name(0);
    if let Operand::Image { .. } = x {
        if axes == [2, 3] {
            let (input, shape) = lw.ensure_image(x)?;
            return Ok(vec![global_avg_pool(lw, name, input, shape, keep_dims)?]);
        }
        if keep_dims {
            let (input, shape) = lw.ensure_image(x)?;
            let mut target_axes: Vec<usize> = axes.iter().map(|&a| channels_last_axis(a)).collect();
            target_axes.sort_unstable();
            let out_shape = reduced_shape(&shape, &target_axes, true);
            let dtype = lw.graph.tensor(input).dtype;
            let out_shape = [out_shape[0], out_shape[1], out_shape[2], out_shape[3]];
            let output = lw.image_tensor(name, out_shape, dtype);
            lw.emit(TargetOp::ReduceMean {
                input,
                output,
                axes: target_axes,
                keep_dims,
            });
            return Ok(vec![Operand::Image {
                id: output,
                shape: out_shape,
            }]);
        }
    }

    let (input, shape) = lw.ensure_generic(x)?;
    let dtype = lw.graph.tensor(input).dtype;
    let (output, out) = lw.value(
        name,
        DataFormat::GenericTensor,
        reduced_shape(&shape, &axes, keep_dims),
        dtype,
    )?;
    lw.emit(TargetOp::ReduceMean {
        input,
        output,
        axes,
        keep_dims,
    });
    Ok(vec![out])
}
