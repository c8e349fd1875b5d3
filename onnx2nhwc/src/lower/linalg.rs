//! Matrix products. Both run on generic tensors in source axis order.

use crate::error::Result;
use crate::format::Operand;
use crate::ir::graph::{ConstantValue, TensorData};
use crate::ir::target::TargetOp;

use super::elementwise::broadcast_shapes;
use super::{Lowerer, NodeCtx};

fn matmul_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    if a.len() < 2 || b.len() < 2 {
        return None;
    }
    let (a_batch, a_mat) = a.split_at(a.len() - 2);
    let (b_batch, b_mat) = b.split_at(b.len() - 2);
    if a_mat[1] != b_mat[0] {
        return None;
    }
    let mut out = broadcast_shapes(a_batch, b_batch)?;
    out.extend([a_mat[0], b_mat[1]]);
    Some(out)
}

fn generic_tensor(lw: &mut Lowerer, operand: &Operand, name: &str) -> Result<usize> {
    match operand {
        Operand::Constant(value) => Ok(lw.constant(name, value)),
        other => Ok(lw.ensure_generic(other)?.0),
    }
}

pub(super) fn lower_matmul(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    let a = ctx.input(0)?;
    let b = ctx.input(1)?;
    let shape = matmul_shape(&a.source_shape(), &b.source_shape()).ok_or_else(|| {
        ctx.unsupported(format!(
            "cannot multiply {:?} by {:?}",
            a.source_shape(),
            b.source_shape()
        ))
    })?;
    let name = ctx.output_name(0);
    let lhs = generic_tensor(lw, a, &format!("{name}/lhs"))?;
    let rhs = generic_tensor(lw, b, &format!("{name}/rhs"))?;
    let dtype = lw.graph.tensor(lhs).dtype;
    let out = lw.generic(name, shape, dtype);
    let output = lw.tensor_of(&out, name);
    lw.emit(TargetOp::MatMul { lhs, rhs, output });
    Ok(vec![out])
}

/// `Y = A * B + C` with constant `B` and `C`.
pub(super) fn lower_gemm(lw: &mut Lowerer, ctx: &NodeCtx) -> Result<Vec<Operand>> {
    if ctx.int_attr("transA", 0)? != 0 {
        return Err(ctx.unsupported("transposed input (transA=1)"));
    }
    let alpha = ctx.float_attr("alpha", 1.0)?;
    let beta = ctx.float_attr("beta", 1.0)?;
    if alpha != 1.0 {
        return Err(ctx.unsupported(format!("alpha={alpha}")));
    }

    let a = ctx.input(0)?;
    let weights = ctx.constant_input(1)?;
    if weights.rank() != 2 {
        return Err(ctx.unsupported(format!("weights of rank {}", weights.rank())));
    }
    let weights = if ctx.int_attr("transB", 0)? != 0 {
        weights.permute(&[1, 0])
    } else {
        ConstantValue::clone(&weights)
    };
    let [k, n] = [weights.shape[0], weights.shape[1]];

    let a_shape = a.source_shape();
    if a_shape.len() != 2 || a_shape[1] != k {
        return Err(ctx.unsupported(format!(
            "input {a_shape:?} does not match weights [{k}, {n}]"
        )));
    }

    let bias = match ctx.optional_constant(2)? {
        None => None,
        Some(_) if beta == 0.0 => None,
        Some(_) if beta != 1.0 => return Err(ctx.unsupported(format!("beta={beta}"))),
        Some(c) => {
            let values = c.data.to_f32();
            let values = match values.len() {
                1 => vec![values[0]; n],
                len if len == n => values,
                len => {
                    return Err(ctx.unsupported(format!(
                        "bias of {len} elements for {n} outputs"
                    )))
                }
            };
            Some(ConstantValue::new(vec![n], TensorData::F32(values)))
        }
    };

    let name = ctx.output_name(0);
    let (input, _) = lw.ensure_generic(a)?;
    let weights = lw.constant(&format!("{name}/weights"), &weights);
    let bias = bias.map(|b| lw.constant(&format!("{name}/bias"), &b));
    let dtype = lw.graph.tensor(input).dtype;
    let out = lw.generic(name, vec![a_shape[0], n], dtype);
    let output = lw.tensor_of(&out, name);
    lw.emit(TargetOp::Dense {
        input,
        weights,
        bias,
        output,
    });
    Ok(vec![out])
}
