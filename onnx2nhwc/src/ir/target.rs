//! Target dialect: channel-last layer primitives.
//!
//! Spatial ops read and write `(N, H, W, C)` tensors. Padding attributes
//! are symmetric per axis; anything else is expressed with an explicit
//! [`TargetOp::Pad`].

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::ir::graph::{DType, Graph, TensorId, TensorKind};

pub type TargetGraph = Graph<TargetOp>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TargetOp {
    /// Axis permutation; the only layout-conversion primitive.
    Transpose {
        input: TensorId,
        output: TensorId,
        perm: Vec<usize>,
    },

    /// Weights `[kH, kW, C_in / groups, C_out]`.
    Conv2d {
        input: TensorId,
        weights: TensorId,
        bias: Option<TensorId>,
        output: TensorId,
        params: Conv2dParams,
    },

    /// Weights `[kH, kW, C_in, multiplier]`.
    DepthwiseConv2d {
        input: TensorId,
        weights: TensorId,
        bias: Option<TensorId>,
        output: TensorId,
        params: Conv2dParams,
        depth_multiplier: usize,
    },

    /// Padding-free transposed convolution, weights `[kH, kW, C_out, C_in]`.
    Conv2dTranspose {
        input: TensorId,
        weights: TensorId,
        bias: Option<TensorId>,
        output: TensorId,
        params: Conv2dParams,
    },

    /// Spatial padding, `pads[axis] = [before, after]` for H and W.
    Pad {
        input: TensorId,
        output: TensorId,
        pads: [[usize; 2]; 2],
        fill: PadFill,
        mode: PadMode,
    },

    /// Remove rows/columns from the spatial edges.
    Crop {
        input: TensorId,
        output: TensorId,
        crop: [[usize; 2]; 2],
    },

    /// Unit-step slice over every axis, `begin..end`.
    Slice {
        input: TensorId,
        output: TensorId,
        begin: Vec<usize>,
        end: Vec<usize>,
    },

    MaxPool2d {
        input: TensorId,
        output: TensorId,
        params: Pool2dParams,
    },

    AvgPool2d {
        input: TensorId,
        output: TensorId,
        params: Pool2dParams,
        count_include_pad: bool,
    },

    GlobalAvgPool2d {
        input: TensorId,
        output: TensorId,
        keep_dims: bool,
    },

    ReduceMean {
        input: TensorId,
        output: TensorId,
        axes: Vec<usize>,
        keep_dims: bool,
    },

    /// Inference-mode batch normalization over `axis`.
    BatchNorm {
        input: TensorId,
        output: TensorId,
        scale: TensorId,
        offset: TensorId,
        mean: TensorId,
        variance: TensorId,
        epsilon: f32,
        axis: usize,
    },

    Activation {
        input: TensorId,
        output: TensorId,
        activation: Activation,
    },

    /// Parametric ReLU. With `channel_axis` the slope is one value per
    /// channel; without it the slope broadcasts against the input.
    PRelu {
        input: TensorId,
        slope: TensorId,
        output: TensorId,
        channel_axis: Option<usize>,
    },

    Softmax {
        input: TensorId,
        output: TensorId,
        axis: usize,
    },

    Unary {
        op: UnaryOp,
        input: TensorId,
        output: TensorId,
    },

    /// Numpy-broadcasting binary op.
    Binary {
        op: BinaryOp,
        lhs: TensorId,
        rhs: TensorId,
        output: TensorId,
    },

    /// `min(max(x, min), max)`; a missing bound is unbounded.
    Clamp {
        input: TensorId,
        output: TensorId,
        min: Option<f32>,
        max: Option<f32>,
    },

    Cast {
        input: TensorId,
        output: TensorId,
        dtype: DType,
    },

    Concat {
        inputs: Vec<TensorId>,
        output: TensorId,
        axis: usize,
    },

    /// Row-major reshape to the full output shape (batch included).
    Reshape {
        input: TensorId,
        output: TensorId,
        shape: Vec<usize>,
    },

    /// Affine layer, weights `[in, out]`.
    Dense {
        input: TensorId,
        weights: TensorId,
        bias: Option<TensorId>,
        output: TensorId,
    },

    /// Batched matrix multiply with numpy batch broadcasting.
    MatMul {
        lhs: TensorId,
        rhs: TensorId,
        output: TensorId,
    },

    Resize {
        input: TensorId,
        output: TensorId,
        spec: ResizeSpec,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2dParams {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    /// Symmetric zero padding per spatial axis.
    pub padding: [usize; 2],
    pub groups: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool2dParams {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PadFill {
    Constant(f32),
    /// One fill value per channel, read from a `[C]` constant.
    PerChannel(TensorId),
    /// Lowest representable value, so padding never wins a max.
    Lowest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PadMode {
    Constant,
    Reflect,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    Relu6,
    Sigmoid,
    Tanh,
    LeakyRelu { alpha: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Equal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeMethod {
    Nearest,
    Bilinear,
}

/// Normalized resize request, whichever attribute convention produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeSpec {
    pub method: ResizeMethod,
    /// Output `[H, W]`.
    pub size: [usize; 2],
    pub align_corners: bool,
    pub half_pixel_centers: bool,
}

impl TargetOp {
    pub fn name(&self) -> &'static str {
        match self {
            TargetOp::Transpose { .. } => "transpose",
            TargetOp::Conv2d { .. } => "conv2d",
            TargetOp::DepthwiseConv2d { .. } => "depthwise_conv2d",
            TargetOp::Conv2dTranspose { .. } => "conv2d_transpose",
            TargetOp::Pad { .. } => "pad",
            TargetOp::Crop { .. } => "crop",
            TargetOp::Slice { .. } => "slice",
            TargetOp::MaxPool2d { .. } => "max_pool2d",
            TargetOp::AvgPool2d { .. } => "avg_pool2d",
            TargetOp::GlobalAvgPool2d { .. } => "global_avg_pool2d",
            TargetOp::ReduceMean { .. } => "reduce_mean",
            TargetOp::BatchNorm { .. } => "batch_norm",
            TargetOp::Activation { .. } => "activation",
            TargetOp::PRelu { .. } => "prelu",
            TargetOp::Softmax { .. } => "softmax",
            TargetOp::Unary { .. } => "unary",
            TargetOp::Binary { .. } => "binary",
            TargetOp::Clamp { .. } => "clamp",
            TargetOp::Cast { .. } => "cast",
            TargetOp::Concat { .. } => "concat",
            TargetOp::Reshape { .. } => "reshape",
            TargetOp::Dense { .. } => "dense",
            TargetOp::MatMul { .. } => "matmul",
            TargetOp::Resize { .. } => "resize",
        }
    }

    pub fn inputs(&self) -> Vec<TensorId> {
        match self {
            TargetOp::Conv2d {
                input,
                weights,
                bias,
                ..
            }
            | TargetOp::DepthwiseConv2d {
                input,
                weights,
                bias,
                ..
            }
            | TargetOp::Conv2dTranspose {
                input,
                weights,
                bias,
                ..
            }
            | TargetOp::Dense {
                input,
                weights,
                bias,
                ..
            } => {
                let mut v = vec![*input, *weights];
                // bias is optional
                if let Some(b) = bias {
                    v.push(*b);
                }
                v
            }
            TargetOp::Pad { input, fill, .. } => match fill {
                PadFill::PerChannel(values) => vec![*input, *values],
                PadFill::Constant(_) | PadFill::Lowest => vec![*input],
            },
            TargetOp::BatchNorm {
                input,
                scale,
                offset,
                mean,
                variance,
                ..
            } => vec![*input, *scale, *offset, *mean, *variance],
            TargetOp::PRelu { input, slope, .. } => vec![*input, *slope],
            TargetOp::Binary { lhs, rhs, .. } | TargetOp::MatMul { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            TargetOp::Concat { inputs, .. } => inputs.clone(),
            TargetOp::Transpose { input, .. }
            | TargetOp::Crop { input, .. }
            | TargetOp::Slice { input, .. }
            | TargetOp::MaxPool2d { input, .. }
            | TargetOp::AvgPool2d { input, .. }
            | TargetOp::GlobalAvgPool2d { input, .. }
            | TargetOp::ReduceMean { input, .. }
            | TargetOp::Activation { input, .. }
            | TargetOp::Softmax { input, .. }
            | TargetOp::Unary { input, .. }
            | TargetOp::Clamp { input, .. }
            | TargetOp::Cast { input, .. }
            | TargetOp::Reshape { input, .. }
            | TargetOp::Resize { input, .. } => vec![*input],
        }
    }

    pub fn output(&self) -> TensorId {
        match self {
            TargetOp::Transpose { output, .. }
            | TargetOp::Conv2d { output, .. }
            | TargetOp::DepthwiseConv2d { output, .. }
            | TargetOp::Conv2dTranspose { output, .. }
            | TargetOp::Pad { output, .. }
            | TargetOp::Crop { output, .. }
            | TargetOp::Slice { output, .. }
            | TargetOp::MaxPool2d { output, .. }
            | TargetOp::AvgPool2d { output, .. }
            | TargetOp::GlobalAvgPool2d { output, .. }
            | TargetOp::ReduceMean { output, .. }
            | TargetOp::BatchNorm { output, .. }
            | TargetOp::Activation { output, .. }
            | TargetOp::PRelu { output, .. }
            | TargetOp::Softmax { output, .. }
            | TargetOp::Unary { output, .. }
            | TargetOp::Binary { output, .. }
            | TargetOp::Clamp { output, .. }
            | TargetOp::Cast { output, .. }
            | TargetOp::Concat { output, .. }
            | TargetOp::Reshape { output, .. }
            | TargetOp::Dense { output, .. }
            | TargetOp::MatMul { output, .. }
            | TargetOp::Resize { output, .. } => *output,
        }
    }

    /// Every tensor reference in the op, inputs first.
    fn tensors_mut(&mut self) -> Vec<&mut TensorId> {
        match self {
            TargetOp::Conv2d {
                input,
                weights,
                bias,
                output,
                ..
            }
            | TargetOp::DepthwiseConv2d {
                input,
                weights,
                bias,
                output,
                ..
            }
            | TargetOp::Conv2dTranspose {
                input,
                weights,
                bias,
                output,
                ..
            }
            | TargetOp::Dense {
                input,
                weights,
                bias,
                output,
            } => {
                let mut v = vec![input, weights];
                if let Some(b) = bias {
                    v.push(b);
                }
                v.push(output);
                v
            }
            TargetOp::Pad {
                input,
                output,
                fill,
                ..
            } => match fill {
                PadFill::PerChannel(values) => vec![input, values, output],
                PadFill::Constant(_) | PadFill::Lowest => vec![input, output],
            },
            TargetOp::BatchNorm {
                input,
                output,
                scale,
                offset,
                mean,
                variance,
                ..
            } => vec![input, scale, offset, mean, variance, output],
            TargetOp::PRelu {
                input,
                slope,
                output,
                ..
            } => vec![input, slope, output],
            TargetOp::Binary {
                lhs, rhs, output, ..
            }
            | TargetOp::MatMul { lhs, rhs, output } => vec![lhs, rhs, output],
            TargetOp::Concat { inputs, output, .. } => {
                let mut v: Vec<&mut TensorId> = inputs.iter_mut().collect();
                v.push(output);
                v
            }
            TargetOp::Transpose { input, output, .. }
            | TargetOp::Crop { input, output, .. }
            | TargetOp::Slice { input, output, .. }
            | TargetOp::MaxPool2d { input, output, .. }
            | TargetOp::AvgPool2d { input, output, .. }
            | TargetOp::GlobalAvgPool2d { input, output, .. }
            | TargetOp::ReduceMean { input, output, .. }
            | TargetOp::Activation { input, output, .. }
            | TargetOp::Softmax { input, output, .. }
            | TargetOp::Unary { input, output, .. }
            | TargetOp::Clamp { input, output, .. }
            | TargetOp::Cast { input, output, .. }
            | TargetOp::Reshape { input, output, .. }
            | TargetOp::Resize { input, output, .. } => vec![input, output],
        }
    }
}

impl Graph<TargetOp> {
    /// Drop ops whose results never reach a graph output, then compact the
    /// tensor table so ids stay dense.
    pub fn prune_unused(&mut self) -> usize {
        let mut live: HashSet<TensorId> = self.outputs.iter().copied().collect();
        let mut keep = vec![false; self.ops.len()];
        for (i, op) in self.ops.iter().enumerate().rev() {
            if live.contains(&op.output()) {
                keep[i] = true;
                live.extend(op.inputs());
            }
        }
        let before = self.ops.len();
        let mut flags = keep.into_iter();
        self.ops.retain(|_| flags.next().unwrap_or(false));
        let removed = before - self.ops.len();

        live.extend(self.inputs.iter().copied());
        let mut remap: HashMap<TensorId, TensorId> = HashMap::new();
        let mut tensors = Vec::with_capacity(live.len());
        for mut tensor in std::mem::take(&mut self.tensors) {
            if live.contains(&tensor.id) {
                let new_id = tensors.len();
                remap.insert(tensor.id, new_id);
                tensor.id = new_id;
                tensors.push(tensor);
            }
        }
        self.tensors = tensors;
        for op in &mut self.ops {
            for id in op.tensors_mut() {
                *id = remap[&*id];
            }
        }
        for id in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            *id = remap[&*id];
        }
        removed
    }

    /// One line per op: `name  [shape] <- inputs`.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for op in &self.ops {
            let output = self.tensor(op.output());
            let inputs: Vec<&str> = op
                .inputs()
                .into_iter()
                .filter(|&id| !matches!(self.tensor(id).kind, TensorKind::Constant(_)))
                .map(|id| self.tensor(id).name.as_str())
                .collect();
            let _ = writeln!(
                out,
                "{:<18} {:<24} {:?} <- {}",
                op.name(),
                output.name,
                output.shape,
                inputs.join(", ")
            );
        }
        out
    }

    pub fn count_ops(&self, name: &str) -> usize {
        self.ops.iter().filter(|op| op.name() == name).count()
    }
}
