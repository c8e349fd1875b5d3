//! Runs translated graphs through a naive channel-last interpreter and
//! compares against a naive channel-first reference.

use std::collections::HashMap;

use onnx2nhwc::ir::graph::{strides, ConstantValue, MultiIndex, TensorData, TensorId, TensorKind};
use onnx2nhwc::ir::target::{Activation, BinaryOp, PadFill, TargetGraph, TargetOp};
use onnx2nhwc::ir::{Node, OnnxGraph};
use onnx2nhwc::{translate, OutputLayout, TargetCapabilities, TranslateConfig};

fn values(len: usize, seed: usize) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 37 + seed * 11) % 17) as f32 / 8.0 - 1.0)
        .collect()
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < 1e-4, "element {i}: got {a}, expected {e}");
    }
}

struct ConvCase {
    input: [usize; 4],
    weights: [usize; 4],
    groups: usize,
    stride: [usize; 2],
    dilation: [usize; 2],
    /// ONNX order `[top, left, bottom, right]`.
    pads: [usize; 4],
    bias: bool,
}

impl ConvCase {
    fn output_shape(&self) -> [usize; 4] {
        let [n, _, h, w] = self.input;
        let [co, _, kh, kw] = self.weights;
        let eh = self.dilation[0] * (kh - 1) + 1;
        let ew = self.dilation[1] * (kw - 1) + 1;
        [
            n,
            co,
            (h + self.pads[0] + self.pads[2] - eh) / self.stride[0] + 1,
            (w + self.pads[1] + self.pads[3] - ew) / self.stride[1] + 1,
        ]
    }
}

/// Grouped NCHW convolution with per-edge zero padding.
fn reference_conv(case: &ConvCase, x: &[f32], w: &[f32], b: Option<&[f32]>) -> Vec<f32> {
    let [n, ci, h, wd] = case.input;
    let [co, cpg, kh, kw] = case.weights;
    let [_, _, oh, ow] = case.output_shape();
    let opg = co / case.groups;
    let mut out = vec![0.0; n * co * oh * ow];
    for b_ in 0..n {
        for oc in 0..co {
            let g = oc / opg;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut sum = b.map_or(0.0, |b| b[oc]);
                    for icg in 0..cpg {
                        let ic = g * cpg + icg;
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * case.stride[0] + ky * case.dilation[0]) as isize
                                    - case.pads[0] as isize;
                                let ix = (ox * case.stride[1] + kx * case.dilation[1]) as isize
                                    - case.pads[1] as isize;
                                if iy < 0 || ix < 0 || iy >= h as isize || ix >= wd as isize {
                                    continue;
                                }
                                let (iy, ix) = (iy as usize, ix as usize);
                                sum += x[((b_ * ci + ic) * h + iy) * wd + ix]
                                    * w[((oc * cpg + icg) * kh + ky) * kw + kx];
                            }
                        }
                    }
                    out[((b_ * co + oc) * oh + oy) * ow + ox] = sum;
                }
            }
        }
    }
    out
}

/// Channel-last interpreter for the primitives the convolution rules emit.
struct Interpreter<'g> {
    graph: &'g TargetGraph,
    values: HashMap<TensorId, Vec<f32>>,
}

impl<'g> Interpreter<'g> {
    fn new(graph: &'g TargetGraph) -> Self {
        Self {
            graph,
            values: HashMap::new(),
        }
    }

    fn get(&self, id: TensorId) -> Vec<f32> {
        match &self.graph.tensor(id).kind {
            TensorKind::Constant(data) => data.to_f32(),
            _ => self.values[&id].clone(),
        }
    }

    fn shape(&self, id: TensorId) -> Vec<usize> {
        self.graph.tensor(id).shape.clone()
    }

    fn shape4(&self, id: TensorId) -> [usize; 4] {
        self.shape(id).try_into().expect("4-D tensor")
    }

    fn run(mut self, inputs: &[Vec<f32>]) -> Vec<Vec<f32>> {
        for (id, data) in self.graph.inputs.iter().zip(inputs) {
            self.values.insert(*id, data.clone());
        }
        for op in &self.graph.ops {
            let result = self.eval(op);
            self.values.insert(op.output(), result);
        }
        self.graph.outputs.iter().map(|&id| self.get(id)).collect()
    }

    fn eval(&self, op: &TargetOp) -> Vec<f32> {
        match op {
            TargetOp::Transpose { input, perm, .. } => {
                let value = ConstantValue::new(self.shape(*input), TensorData::F32(self.get(*input)));
                value.permute(perm).data.to_f32()
            }
            TargetOp::Conv2d {
                input,
                weights,
                bias,
                output,
                params,
            } => {
                let [n, h, w, ci] = self.shape4(*input);
                let [kh, kw, cpg, co] = self.shape4(*weights);
                let [_, oh, ow, _] = self.shape4(*output);
                let (x, k) = (self.get(*input), self.get(*weights));
                let b = bias.map(|b| self.get(b));
                let opg = co / params.groups;
                let mut out = vec![0.0; n * oh * ow * co];
                for b_ in 0..n {
                    for oy in 0..oh {
                        for ox in 0..ow {
                            for oc in 0..co {
                                let g = oc / opg;
                                let mut sum = b.as_ref().map_or(0.0, |b| b[oc]);
                                for ky in 0..kh {
                                    for kx in 0..kw {
                                        let iy = (oy * params.stride[0] + ky * params.dilation[0])
                                            as isize
                                            - params.padding[0] as isize;
                                        let ix = (ox * params.stride[1] + kx * params.dilation[1])
                                            as isize
                                            - params.padding[1] as isize;
                                        if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                            continue;
                                        }
                                        let (iy, ix) = (iy as usize, ix as usize);
                                        for icg in 0..cpg {
                                            let ic = g * cpg + icg;
                                            sum += x[((b_ * h + iy) * w + ix) * ci + ic]
                                                * k[((ky * kw + kx) * cpg + icg) * co + oc];
                                        }
                                    }
                                }
                                out[((b_ * oh + oy) * ow + ox) * co + oc] = sum;
                            }
                        }
                    }
                }
                out
            }
            TargetOp::DepthwiseConv2d {
                input,
                weights,
                bias,
                output,
                params,
                depth_multiplier,
            } => {
                let [n, h, w, c] = self.shape4(*input);
                let [kh, kw, _, m] = self.shape4(*weights);
                assert_eq!(m, *depth_multiplier);
                let [_, oh, ow, co] = self.shape4(*output);
                let (x, k) = (self.get(*input), self.get(*weights));
                let b = bias.map(|b| self.get(b));
                let mut out = vec![0.0; n * oh * ow * co];
                for b_ in 0..n {
                    for oy in 0..oh {
                        for ox in 0..ow {
                            for ic in 0..c {
                                for mi in 0..m {
                                    let oc = ic * m + mi;
                                    let mut sum = b.as_ref().map_or(0.0, |b| b[oc]);
                                    for ky in 0..kh {
                                        for kx in 0..kw {
                                            let iy = (oy * params.stride[0]
                                                + ky * params.dilation[0])
                                                as isize
                                                - params.padding[0] as isize;
                                            let ix = (ox * params.stride[1]
                                                + kx * params.dilation[1])
                                                as isize
                                                - params.padding[1] as isize;
                                            if iy < 0
                                                || ix < 0
                                                || iy >= h as isize
                                                || ix >= w as isize
                                            {
                                                continue;
                                            }
                                            let (iy, ix) = (iy as usize, ix as usize);
                                            sum += x[((b_ * h + iy) * w + ix) * c + ic]
                                                * k[((ky * kw + kx) * c + ic) * m + mi];
                                        }
                                    }
                                    out[((b_ * oh + oy) * ow + ox) * co + oc] = sum;
                                }
                            }
                        }
                    }
                }
                out
            }
            TargetOp::Conv2dTranspose {
                input,
                weights,
                bias,
                output,
                params,
            } => {
                let [n, h, w, ci] = self.shape4(*input);
                let [kh, kw, opg, _] = self.shape4(*weights);
                let [_, oh, ow, co] = self.shape4(*output);
                let ipg = ci / params.groups;
                let (x, k) = (self.get(*input), self.get(*weights));
                let mut out = vec![0.0; n * oh * ow * co];
                for b_ in 0..n {
                    for iy in 0..h {
                        for ix in 0..w {
                            for ic in 0..ci {
                                let g = ic / ipg;
                                let v = x[((b_ * h + iy) * w + ix) * ci + ic];
                                for ky in 0..kh {
                                    for kx in 0..kw {
                                        let oy = iy * params.stride[0] + ky * params.dilation[0];
                                        let ox = ix * params.stride[1] + kx * params.dilation[1];
                                        for o in 0..opg {
                                            let oc = g * opg + o;
                                            out[((b_ * oh + oy) * ow + ox) * co + oc] +=
                                                v * k[((ky * kw + kx) * opg + o) * ci + ic];
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                if let Some(b) = bias.map(|b| self.get(b)) {
                    for (i, v) in out.iter_mut().enumerate() {
                        *v += b[i % co];
                    }
                }
                out
            }
            TargetOp::Pad {
                input,
                output,
                pads,
                fill,
                ..
            } => {
                let [_, h, w, c] = self.shape4(*input);
                let [n, oh, ow, _] = self.shape4(*output);
                let x = self.get(*input);
                let fills: Vec<f32> = match fill {
                    PadFill::Constant(v) => vec![*v; c],
                    PadFill::PerChannel(id) => self.get(*id),
                    PadFill::Lowest => vec![f32::MIN; c],
                };
                let mut out = vec![0.0; n * oh * ow * c];
                for b_ in 0..n {
                    for oy in 0..oh {
                        for ox in 0..ow {
                            for ch in 0..c {
                                let iy = oy as isize - pads[0][0] as isize;
                                let ix = ox as isize - pads[1][0] as isize;
                                let inside =
                                    iy >= 0 && ix >= 0 && (iy as usize) < h && (ix as usize) < w;
                                out[((b_ * oh + oy) * ow + ox) * c + ch] = if inside {
                                    x[((b_ * h + iy as usize) * w + ix as usize) * c + ch]
                                } else {
                                    fills[ch]
                                };
                            }
                        }
                    }
                }
                out
            }
            TargetOp::Crop {
                input, output, crop, ..
            } => {
                let [_, h, w, c] = self.shape4(*input);
                let [n, oh, ow, _] = self.shape4(*output);
                let x = self.get(*input);
                let mut out = Vec::with_capacity(n * oh * ow * c);
                for b_ in 0..n {
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let (iy, ix) = (oy + crop[0][0], ox + crop[1][0]);
                            let base = ((b_ * h + iy) * w + ix) * c;
                            out.extend_from_slice(&x[base..base + c]);
                        }
                    }
                }
                out
            }
            TargetOp::Slice {
                input, begin, end, ..
            } => {
                let shape = self.shape(*input);
                let st = strides(&shape);
                let x = self.get(*input);
                let extent: Vec<usize> = begin.iter().zip(end).map(|(b, e)| e - b).collect();
                MultiIndex::new(&extent)
                    .map(|idx| {
                        let offset: usize = idx
                            .iter()
                            .zip(begin)
                            .zip(&st)
                            .map(|((i, b), s)| (i + b) * s)
                            .sum();
                        x[offset]
                    })
                    .collect()
            }
            TargetOp::Concat { inputs, axis, .. } => {
                let shapes: Vec<Vec<usize>> = inputs.iter().map(|&i| self.shape(i)).collect();
                let outer: usize = shapes[0][..*axis].iter().product();
                let data: Vec<Vec<f32>> = inputs.iter().map(|&i| self.get(i)).collect();
                let mut out = Vec::new();
                for o in 0..outer {
                    for (shape, d) in shapes.iter().zip(&data) {
                        let block: usize = shape[*axis..].iter().product();
                        out.extend_from_slice(&d[o * block..(o + 1) * block]);
                    }
                }
                out
            }
            TargetOp::Binary {
                op: BinaryOp::Add,
                lhs,
                rhs,
                output,
            } => {
                let out_shape = self.shape(*output);
                let (a, b) = (self.get(*lhs), self.get(*rhs));
                let (sa, sb) = (self.shape(*lhs), self.shape(*rhs));
                let offset = |idx: &[usize], shape: &[usize]| {
                    let lead = idx.len() - shape.len();
                    let st = strides(shape);
                    shape
                        .iter()
                        .enumerate()
                        .map(|(k, &d)| if d == 1 { 0 } else { idx[lead + k] * st[k] })
                        .sum::<usize>()
                };
                MultiIndex::new(&out_shape)
                    .map(|idx| a[offset(&idx, &sa)] + b[offset(&idx, &sb)])
                    .collect()
            }
            TargetOp::Activation {
                input,
                activation: Activation::Relu,
                ..
            } => self.get(*input).into_iter().map(|v| v.max(0.0)).collect(),
            other => panic!("interpreter does not handle {}", other.name()),
        }
    }
}

fn conv_graph(case: &ConvCase, w: &[f32], b: Option<&[f32]>) -> OnnxGraph {
    let mut g = OnnxGraph::new();
    let mut inputs = vec!["x", "w"];
    g.input("x", case.input.to_vec())
        .initializer("w", case.weights.to_vec(), TensorData::F32(w.to_vec()));
    if let Some(b) = b {
        g.initializer("b", vec![b.len()], TensorData::F32(b.to_vec()));
        inputs.push("b");
    }
    let p = case.pads;
    let node = Node::new("Conv", &inputs, &["y"])
        .attr("group", case.groups as i64)
        .attr("strides", vec![case.stride[0] as i64, case.stride[1] as i64])
        .attr("dilations", vec![case.dilation[0] as i64, case.dilation[1] as i64])
        .attr("pads", p.iter().map(|&v| v as i64).collect::<Vec<_>>());
    g.node(node, case.output_shape().to_vec()).output("y");
    g
}

fn check_conv(case: ConvCase, capabilities: TargetCapabilities) -> TargetGraph {
    let x = values(case.input.iter().product(), 1);
    let w = values(case.weights.iter().product(), 2);
    let b = case.bias.then(|| values(case.weights[0], 3));
    let expected = reference_conv(&case, &x, &w, b.as_deref());

    let source = conv_graph(&case, &w, b.as_deref());
    // Feed and read channel-first so both sides compare the same layout.
    let config = TranslateConfig {
        image_inputs: false,
        ..TranslateConfig::default()
    }
    .with_output_layout(OutputLayout::Generic)
    .with_capabilities(capabilities);
    let model = translate(&source, &config).unwrap();
    let actual = Interpreter::new(&model.graph).run(&[x]);
    assert_close(&actual[0], &expected);
    model.graph
}

#[test]
fn plain_conv_with_asymmetric_pads() {
    let graph = check_conv(
        ConvCase {
            input: [1, 3, 7, 6],
            weights: [4, 3, 3, 3],
            groups: 1,
            stride: [2, 2],
            dilation: [1, 1],
            pads: [0, 1, 1, 0],
            bias: true,
        },
        TargetCapabilities::default(),
    );
    assert_eq!(graph.count_ops("pad"), 1);
    assert_eq!(graph.count_ops("conv2d"), 1);
}

#[test]
fn dilated_conv_symmetric() {
    check_conv(
        ConvCase {
            input: [2, 2, 8, 8],
            weights: [3, 2, 3, 3],
            groups: 1,
            stride: [1, 1],
            dilation: [2, 2],
            pads: [2, 2, 2, 2],
            bias: false,
        },
        TargetCapabilities::default(),
    );
}

#[test]
fn fully_grouped_conv_is_depthwise() {
    let graph = check_conv(
        ConvCase {
            input: [1, 3, 6, 6],
            weights: [6, 1, 3, 3],
            groups: 3,
            stride: [1, 1],
            dilation: [1, 1],
            pads: [1, 1, 1, 1],
            bias: true,
        },
        TargetCapabilities::default(),
    );
    assert_eq!(graph.count_ops("depthwise_conv2d"), 1);
}

#[test]
fn grouped_conv_split_per_group() {
    let graph = check_conv(
        ConvCase {
            input: [1, 4, 5, 5],
            weights: [6, 2, 3, 3],
            groups: 2,
            stride: [1, 1],
            dilation: [1, 1],
            pads: [1, 1, 1, 1],
            bias: true,
        },
        TargetCapabilities::default(),
    );
    assert_eq!(graph.count_ops("conv2d"), 2);
    assert_eq!(graph.count_ops("slice"), 2);
    assert_eq!(graph.count_ops("concat"), 1);
}

#[test]
fn grouped_conv_native() {
    let graph = check_conv(
        ConvCase {
            input: [1, 4, 5, 5],
            weights: [6, 2, 3, 3],
            groups: 2,
            stride: [2, 1],
            dilation: [1, 1],
            pads: [1, 0, 1, 0],
            bias: false,
        },
        TargetCapabilities {
            grouped_conv: true,
            ..TargetCapabilities::default()
        },
    );
    assert_eq!(graph.count_ops("conv2d"), 1);
    assert_eq!(graph.count_ops("slice"), 0);
}

/// NCHW transposed convolution, weights `(C_in, C_out / g, kH, kW)`.
fn reference_conv_transpose(
    input: [usize; 4],
    weights: [usize; 4],
    groups: usize,
    stride: usize,
    pads: [usize; 2],
    output_padding: usize,
    x: &[f32],
    w: &[f32],
    b: &[f32],
) -> (Vec<f32>, [usize; 4]) {
    let [n, ci, h, wd] = input;
    let [_, opg, kh, kw] = weights;
    let co = opg * groups;
    let ipg = ci / groups;
    let oh = stride * (h - 1) + output_padding + kh - pads[0] - pads[1];
    let ow = stride * (wd - 1) + output_padding + kw - pads[0] - pads[1];
    let mut out = vec![0.0; n * co * oh * ow];
    for b_ in 0..n {
        for oc in 0..co {
            for i in 0..oh * ow {
                out[(b_ * co + oc) * oh * ow + i] = b[oc];
            }
        }
        for ic in 0..ci {
            let g = ic / ipg;
            for iy in 0..h {
                for ix in 0..wd {
                    let v = x[((b_ * ci + ic) * h + iy) * wd + ix];
                    for o in 0..opg {
                        let oc = g * opg + o;
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let oy = (iy * stride + ky) as isize - pads[0] as isize;
                                let ox = (ix * stride + kx) as isize - pads[0] as isize;
                                if oy < 0 || ox < 0 || oy >= oh as isize || ox >= ow as isize {
                                    continue;
                                }
                                out[((b_ * co + oc) * oh + oy as usize) * ow + ox as usize] +=
                                    v * w[((ic * opg + o) * kh + ky) * kw + kx];
                            }
                        }
                    }
                }
            }
        }
    }
    (out, [n, co, oh, ow])
}

fn check_conv_transpose(groups: usize, pads: [usize; 2], output_padding: usize) {
    let input = [1, 4, 3, 3];
    let weights = [4, 2 / groups, 3, 3];
    let co = weights[1] * groups;
    let x = values(input.iter().product(), 4);
    let w = values(weights.iter().product(), 5);
    let b = values(co, 6);
    let (expected, out_shape) =
        reference_conv_transpose(input, weights, groups, 2, pads, output_padding, &x, &w, &b);

    let mut source = OnnxGraph::new();
    source
        .input("x", input.to_vec())
        .initializer("w", weights.to_vec(), TensorData::F32(w))
        .initializer("b", vec![co], TensorData::F32(b))
        .node(
            Node::new("ConvTranspose", &["x", "w", "b"], &["y"])
                .attr("group", groups as i64)
                .attr("strides", vec![2i64, 2])
                .attr(
                    "pads",
                    vec![pads[0] as i64, pads[0] as i64, pads[1] as i64, pads[1] as i64],
                )
                .attr("output_padding", vec![output_padding as i64; 2]),
            out_shape.to_vec(),
        )
        .output("y");
    let config = TranslateConfig {
        image_inputs: false,
        ..TranslateConfig::default()
    }
    .with_output_layout(OutputLayout::Generic);
    let model = translate(&source, &config).unwrap();
    assert_eq!(model.graph.tensor(model.graph.outputs[0]).shape, out_shape.to_vec());
    let actual = Interpreter::new(&model.graph).run(&[x]);
    assert_close(&actual[0], &expected);
}

#[test]
fn conv_transpose_with_crop() {
    check_conv_transpose(1, [1, 1], 0);
}

#[test]
fn conv_transpose_output_padding_beyond_end_pad() {
    check_conv_transpose(1, [0, 0], 1);
}

#[test]
fn conv_transpose_output_padding_absorbed() {
    check_conv_transpose(1, [1, 1], 1);
}

#[test]
fn grouped_conv_transpose() {
    check_conv_transpose(2, [1, 1], 0);
}

#[test]
fn pad_fill_idiom_matches_literal_lowering() {
    let mean = vec![0.5, -1.0, 2.0];
    let build = || {
        let mut g = OnnxGraph::new();
        g.input("x", vec![1, 3, 4, 4])
            .initializer("c", vec![1, 3, 1, 1], TensorData::F32(mean.clone()))
            .initializer("pads", vec![8], TensorData::I64(vec![0, 0, 1, 2, 0, 0, 2, 1]))
            .node(Node::new("Sub", &["x", "c"], &["t"]), vec![1, 3, 4, 4])
            .node(Node::new("Pad", &["t", "pads"], &["p"]), vec![1, 3, 7, 7])
            .node(Node::new("Add", &["p", "c"], &["y"]), vec![1, 3, 7, 7])
            .output("y");
        g
    };
    let x = values(48, 7);
    let fused_cfg = TranslateConfig::default();
    let literal_cfg = TranslateConfig::default().with_capabilities(TargetCapabilities {
        per_channel_pad_fill: false,
        ..TargetCapabilities::default()
    });

    let fused = translate(&build(), &fused_cfg).unwrap();
    assert_eq!(fused.graph.ops.len(), 1);

    let literal = translate(&build(), &literal_cfg).unwrap();
    assert_eq!(literal.graph.count_ops("pad"), 1);
    assert_eq!(literal.graph.count_ops("binary"), 2);

    let out = Interpreter::new(&fused.graph).run(&[to_nhwc([1, 3, 4, 4], x.clone())]);
    let [pt, pl, pb, pr] = [1, 2, 2, 1];
    let (oh, ow) = (4 + pt + pb, 4 + pl + pr);
    for y in 0..oh {
        for xx in 0..ow {
            for c in 0..3 {
                let got = out[0][(y * ow + xx) * 3 + c];
                let inside = y >= pt && y < pt + 4 && xx >= pl && xx < pl + 4;
                let expected = if inside {
                    x[(c * 4 + (y - pt)) * 4 + (xx - pl)]
                } else {
                    mean[c]
                };
                assert!((got - expected).abs() < 1e-6, "({y},{xx},{c}): {got} vs {expected}");
            }
        }
    }
}

fn to_nhwc(shape: [usize; 4], data: Vec<f32>) -> Vec<f32> {
    ConstantValue::new(shape.to_vec(), TensorData::F32(data))
        .permute(&[0, 2, 3, 1])
        .data
        .to_f32()
}

#[test]
fn conv7x7_relu_on_channel_last_input() {
    let case = ConvCase {
        input: [1, 3, 224, 224],
        weights: [16, 3, 7, 7],
        groups: 1,
        stride: [1, 1],
        dilation: [1, 1],
        pads: [3, 3, 3, 3],
        bias: true,
    };
    let x = values(case.input.iter().product(), 8);
    let w = values(case.weights.iter().product(), 9);
    let b = values(16, 10);
    let expected: Vec<f32> = reference_conv(&case, &x, &w, Some(&b))
        .into_iter()
        .map(|v| v.max(0.0))
        .collect();

    let mut source = conv_graph(&case, &w, Some(&b));
    source.outputs.clear();
    source
        .node(Node::new("Relu", &["y"], &["z"]), case.output_shape().to_vec())
        .output("z");
    let model = translate(&source, &TranslateConfig::default()).unwrap();
    assert_eq!(model.graph.count_ops("transpose"), 0);
    assert_eq!(model.graph.count_ops("pad"), 0);

    let actual = Interpreter::new(&model.graph).run(&[to_nhwc(case.input, x)]);
    assert_close(&actual[0], &to_nhwc(case.output_shape(), expected));
}
