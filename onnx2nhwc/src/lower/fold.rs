//! Translation-time evaluation of nodes whose inputs are all constants.
//!
//! Only the shape plumbing and light arithmetic exporters commonly leave
//! behind are evaluated. Anything heavier is lowered by its usual rule with
//! the data input baked into the target graph as a constant tensor.

use crate::error::Result;
use crate::format::{normalize_axis, Operand};
use crate::ir::graph::{strides, ConstantValue, DType, MultiIndex, TensorData};
use crate::ir::onnx::{Attribute, OpKind};

use super::elementwise::broadcast_shapes;
use super::shape::{slice_ranges, transpose_perm, view_shape};
use super::{Lowerer, NodeCtx};

/// Kinds [`fold_node`] can evaluate.
pub(super) fn can_fold(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Identity
            | OpKind::Dropout
            | OpKind::Cast
            | OpKind::Reshape
            | OpKind::Flatten
            | OpKind::Squeeze
            | OpKind::Unsqueeze
            | OpKind::Transpose
            | OpKind::Slice
            | OpKind::Concat
            | OpKind::Gather
            | OpKind::Add
            | OpKind::Sub
            | OpKind::Mul
            | OpKind::Div
            | OpKind::Neg
            | OpKind::Abs
            | OpKind::Sqrt
            | OpKind::Relu
    )
}

/// Copy of `ctx` whose input 0 is a constant tensor in the target graph,
/// so the node lowers like any runtime node.
pub(super) fn materialize_data_input<'a>(lw: &mut Lowerer, ctx: &NodeCtx<'a>) -> Result<NodeCtx<'a>> {
    let value = ctx.constant_input(0)?;
    log::debug!(
        "cannot fold {} '{}', emitting it over a baked constant",
        ctx.kind,
        ctx.node.name
    );
    let id = lw.constant(&ctx.node.inputs[0], &value);
    let mut inputs = ctx.inputs.clone();
    inputs[0] = Some(Operand::Generic {
        id,
        shape: value.shape.clone(),
    });
    Ok(NodeCtx {
        node: ctx.node,
        index: ctx.index,
        kind: ctx.kind,
        inputs,
        output_shapes: ctx.output_shapes.clone(),
        output_used: ctx.output_used.clone(),
        opset: ctx.opset,
    })
}

pub(super) fn fold_node(ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let value = ctx.constant_input(0)?;
    log::debug!("folding {} '{}'", ctx.kind, ctx.node.name);

    let folded = match ctx.kind {
        OpKind::Identity | OpKind::Dropout => ConstantValue::clone(&value),
        OpKind::Cast => {
            let to = ctx.int_attr("to", 1)?;
            DType::from_onnx(to)
                .and_then(|dtype| value.data.cast(dtype))
                .map(|data| ConstantValue::new(value.shape.clone(), data))
                .ok_or_else(|| ctx.unsupported(format!("folding a cast to type {to}")))?
        }
        OpKind::Reshape | OpKind::Flatten | OpKind::Squeeze | OpKind::Unsqueeze => {
            value.reshape(view_shape(ctx, &value.shape)?)
        }
        OpKind::Transpose => value.permute(&transpose_perm(ctx, value.rank())?),
        OpKind::Slice => {
            let ranges = slice_ranges(ctx, &value.shape)?;
            ranges
                .iter()
                .enumerate()
                .fold(ConstantValue::clone(&value), |acc, (axis, r)| {
                    acc.slice_axis(axis, r.start, r.end)
                })
        }
        OpKind::Concat => concat(ctx)?,
        OpKind::Gather => gather(ctx, &value)?,
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => binary(ctx, &value)?,
        OpKind::Neg | OpKind::Abs | OpKind::Sqrt | OpKind::Relu => unary(ctx.kind, &value),
        other => return Err(ctx.unsupported(format!("folding {other} over constant inputs"))),
    };
    Ok(vec![Operand::constant(folded)])
}

/// Value of a `Constant` node, from whichever attribute carries it.
pub(super) fn constant_node(ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let value = match ctx.node.attributes.iter().next() {
        Some((_, Attribute::Tensor(value))) => value.clone(),
        Some((name, attr)) => match (name.as_str(), attr) {
            ("value_float", Attribute::Float(v)) => ConstantValue::scalar_f32(*v),
            ("value_floats", Attribute::Floats(v)) => ConstantValue::vector_f32(v.clone()),
            ("value_int", Attribute::Int(v)) => ConstantValue::new(vec![], TensorData::I64(vec![*v])),
            ("value_ints", Attribute::Ints(v)) => ConstantValue::vector_i64(v.clone()),
            (name, attr) => {
                return Err(ctx.invalid_attr(name, format!("cannot read a constant from {attr:?}")))
            }
        },
        None => return Err(ctx.invalid_attr("value", "required")),
    };
    Ok(vec![Operand::constant(value)])
}

fn concat(ctx: &NodeCtx) -> Result<ConstantValue> {
    let parts = (0..ctx.inputs.len())
        .filter(|&i| ctx.optional_input(i).is_some())
        .map(|i| ctx.constant_input(i))
        .collect::<Result<Vec<_>>>()?;
    let rank = parts[0].rank();
    let raw = ctx.int_attr("axis", 0)?;
    let axis = normalize_axis(raw, rank)
        .ok_or_else(|| ctx.invalid_attr("axis", format!("{raw} out of range for rank {rank}")))?;

    let mut shape = parts[0].shape.clone();
    for part in &parts[1..] {
        let fits = part.rank() == rank
            && (0..rank).all(|a| a == axis || part.shape[a] == shape[a]);
        if !fits {
            return Err(ctx.unsupported(format!(
                "cannot concatenate {:?} onto {:?} along axis {axis}",
                part.shape, shape
            )));
        }
        shape[axis] += part.shape[axis];
    }

    // Interleave the per-input blocks below `axis`.
    let outer: usize = shape[..axis].iter().product();
    let block = |p: &ConstantValue| p.shape[axis..].iter().product::<usize>();
    let all_int = parts.iter().all(|p| p.dtype() == DType::I64);
    let data = if all_int {
        let sources: Vec<Vec<i64>> = parts.iter().map(|p| p.data.to_i64()).collect();
        let mut out = Vec::with_capacity(shape.iter().product());
        for o in 0..outer {
            for (p, src) in parts.iter().zip(&sources) {
                let b = block(p);
                out.extend_from_slice(&src[o * b..(o + 1) * b]);
            }
        }
        TensorData::I64(out)
    } else {
        let sources: Vec<Vec<f32>> = parts.iter().map(|p| p.data.to_f32()).collect();
        let mut out = Vec::with_capacity(shape.iter().product());
        for o in 0..outer {
            for (p, src) in parts.iter().zip(&sources) {
                let b = block(p);
                out.extend_from_slice(&src[o * b..(o + 1) * b]);
            }
        }
        TensorData::F32(out)
    };
    Ok(ConstantValue::new(shape, data))
}

fn gather(ctx: &NodeCtx, data: &ConstantValue) -> Result<ConstantValue> {
    let indices = ctx.constant_input(1)?;
    let rank = data.rank();
    let raw = ctx.int_attr("axis", 0)?;
    let axis = normalize_axis(raw, rank)
        .ok_or_else(|| ctx.invalid_attr("axis", format!("{raw} out of range for rank {rank}")))?;
    let dim = data.shape[axis] as i64;
    let picks = indices
        .data
        .to_i64()
        .iter()
        .map(|&i| {
            let j = if i < 0 { i + dim } else { i };
            (0..dim)
                .contains(&j)
                .then_some(j as usize)
                .ok_or_else(|| ctx.unsupported(format!("index {i} out of range for extent {dim}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut shape = data.shape[..axis].to_vec();
    shape.extend_from_slice(&indices.shape);
    shape.extend_from_slice(&data.shape[axis + 1..]);

    let in_strides = strides(&data.shape);
    let index_strides = strides(&indices.shape);
    let q = indices.rank();
    let flat: Vec<usize> = MultiIndex::new(&shape)
        .map(|idx| {
            let mut offset = 0;
            for (a, stride) in in_strides.iter().enumerate() {
                let i = match a.cmp(&axis) {
                    std::cmp::Ordering::Less => idx[a],
                    std::cmp::Ordering::Equal => {
                        let pos = index_strides
                            .iter()
                            .zip(&idx[axis..axis + q])
                            .map(|(s, i)| s * i)
                            .sum::<usize>();
                        picks[pos]
                    }
                    std::cmp::Ordering::Greater => idx[a + q - 1],
                };
                offset += i * stride;
            }
            offset
        })
        .collect();
    Ok(ConstantValue::new(shape, data.data.gather(&flat)))
}

/// Flat source offset of an output index under numpy broadcasting.
fn broadcast_offset(idx: &[usize], shape: &[usize], strides: &[usize]) -> usize {
    let lead = idx.len() - shape.len();
    shape
        .iter()
        .zip(strides)
        .enumerate()
        .map(|(a, (&d, &s))| if d == 1 { 0 } else { idx[lead + a] * s })
        .sum()
}

fn binary(ctx: &NodeCtx, lhs: &ConstantValue) -> Result<ConstantValue> {
    let rhs = ctx.constant_input(1)?;
    let shape = broadcast_shapes(&lhs.shape, &rhs.shape).ok_or_else(|| {
        ctx.unsupported(format!("cannot broadcast {:?} with {:?}", lhs.shape, rhs.shape))
    })?;
    let (ls, rs) = (strides(&lhs.shape), strides(&rhs.shape));
    let pairs: Vec<(usize, usize)> = MultiIndex::new(&shape)
        .map(|idx| {
            (
                broadcast_offset(&idx, &lhs.shape, &ls),
                broadcast_offset(&idx, &rhs.shape, &rs),
            )
        })
        .collect();

    let data = match (&lhs.data, &rhs.data) {
        (TensorData::I64(a), TensorData::I64(b)) => {
            let f: fn(i64, i64) -> i64 = match ctx.kind {
                OpKind::Add => i64::wrapping_add,
                OpKind::Sub => i64::wrapping_sub,
                OpKind::Mul => i64::wrapping_mul,
                _ => {
                    if b.contains(&0) {
                        return Err(ctx.unsupported("integer division by zero"));
                    }
                    i64::wrapping_div
                }
            };
            TensorData::I64(pairs.iter().map(|&(i, j)| f(a[i], b[j])).collect())
        }
        _ => {
            let (a, b) = (lhs.data.to_f32(), rhs.data.to_f32());
            let f: fn(f32, f32) -> f32 = match ctx.kind {
                OpKind::Add => |x, y| x + y,
                OpKind::Sub => |x, y| x - y,
                OpKind::Mul => |x, y| x * y,
                _ => |x, y| x / y,
            };
            TensorData::F32(pairs.iter().map(|&(i, j)| f(a[i], b[j])).collect())
        }
    };
    Ok(ConstantValue::new(shape, data))
}

fn unary(kind: OpKind, value: &ConstantValue) -> ConstantValue {
    let data = match (&value.data, kind) {
        (TensorData::I64(v), OpKind::Neg) => TensorData::I64(v.iter().map(|x| -x).collect()),
        (TensorData::I64(v), OpKind::Abs) => TensorData::I64(v.iter().map(|x| x.abs()).collect()),
        (TensorData::I64(v), OpKind::Relu) => TensorData::I64(v.iter().map(|&x| x.max(0)).collect()),
        (data, _) => {
            let f: fn(f32) -> f32 = match kind {
                OpKind::Neg => |x| -x,
                OpKind::Abs => f32::abs,
                OpKind::Relu => |x| x.max(0.0),
                _ => f32::sqrt,
            };
            TensorData::F32(data.to_f32().into_iter().map(f).collect())
        }
    };
    ConstantValue::new(value.shape.clone(), data)
}
