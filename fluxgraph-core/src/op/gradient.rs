use crate::{bail_not_implemented, Graph, OpId, Result, Tensor};

use super::{BinaryOpType, CommTarget, OpKind, UnaryOpType};

impl OpKind {
    /// Build the operators computing input gradients of `op` from its output
    /// gradients. Entry `i` of the result is `None` when input `i` receives
    /// no gradient.
    pub(crate) fn gradient(
        &self,
        graph: &mut Graph,
        op: OpId,
        grad_outputs: &[Option<Tensor>],
        needs: &[bool],
    ) -> Result<Vec<Option<Tensor>>> {
        let def = graph.op_def(op)?;
        let gid = graph.id();
        let handle = |id| Tensor { graph_id: gid, id };
        let x: Vec<Tensor> = def.inputs.iter().copied().map(handle).collect();
        let y: Vec<Tensor> = def.outputs.iter().copied().map(handle).collect();

        if self.inplace_input().is_some() {
            bail_not_implemented!("gradient through in-place op {}", def.meta.name);
        }
        let Some(g) = grad_outputs.first().copied().flatten() else {
            return Ok(vec![None; x.len()]);
        };
        let need = |i: usize| needs.get(i).copied().unwrap_or(false);

        let grads = match self {
            Self::Placeholder { .. }
            | Self::Variable { .. }
            | Self::Group
            | Self::OnesLike
            | Self::ZerosLike => vec![None; x.len()],
            Self::Unary { op, .. } => {
                let gx = match op {
                    UnaryOpType::Neg => graph.neg(g)?,
                    UnaryOpType::Exp => graph.mul(g, y[0])?,
                    UnaryOpType::Log => graph.div(g, x[0])?,
                    UnaryOpType::Sqrt => {
                        let two_y = graph.mul_scalar(y[0], 2.)?;
                        graph.div(g, two_y)?
                    }
                    UnaryOpType::Relu => graph.relu_gradient(g, x[0])?,
                    UnaryOpType::Square => {
                        let two_x = graph.mul_scalar(x[0], 2.)?;
                        graph.mul(g, two_x)?
                    }
                };
                vec![Some(gx)]
            }
            Self::Binary { op, .. } => {
                let (a, b) = (x[0], x[1]);
                let ga = if need(0) {
                    Some(match op {
                        BinaryOpType::Add | BinaryOpType::Sub => g,
                        BinaryOpType::Mul => graph.mul(g, b)?,
                        BinaryOpType::Div => graph.div(g, b)?,
                    })
                } else {
                    None
                };
                let gb = if need(1) {
                    Some(match op {
                        BinaryOpType::Add => g,
                        BinaryOpType::Sub => graph.neg(g)?,
                        BinaryOpType::Mul => graph.mul(g, a)?,
                        BinaryOpType::Div => {
                            // -g * (a / b) / b
                            let t = graph.mul(g, y[0])?;
                            let t = graph.div(t, b)?;
                            graph.neg(t)?
                        }
                    })
                } else {
                    None
                };
                vec![ga, gb]
            }
            Self::Scalar { op, value, .. } => {
                let gx = match op {
                    BinaryOpType::Add | BinaryOpType::Sub => g,
                    BinaryOpType::Mul => graph.mul_scalar(g, *value)?,
                    BinaryOpType::Div => graph.scalar(BinaryOpType::Div, g, *value)?,
                };
                vec![Some(gx)]
            }
            Self::MatMul { trans_a, trans_b } => {
                let (a, b) = (x[0], x[1]);
                let (ga, gb) = match (trans_a, trans_b) {
                    (false, false) => ((g, b, false, true), (a, g, true, false)),
                    (true, false) => ((b, g, false, true), (a, g, false, false)),
                    (false, true) => ((g, b, false, false), (g, a, true, false)),
                    (true, true) => ((b, g, true, true), (g, a, true, true)),
                };
                let ga = if need(0) {
                    Some(graph.matmul(ga.0, ga.1, ga.2, ga.3)?)
                } else {
                    None
                };
                let gb = if need(1) {
                    Some(graph.matmul(gb.0, gb.1, gb.2, gb.3)?)
                } else {
                    None
                };
                vec![ga, gb]
            }
            Self::ReduceSum => vec![Some(graph.broadcast_like(g, x[0])?)],
            Self::BroadcastLike => {
                let gs = if need(0) {
                    Some(graph.reduce_sum(g)?)
                } else {
                    None
                };
                vec![gs, None]
            }
            Self::Sum => (0..x.len()).map(|i| need(i).then_some(g)).collect(),
            Self::Slice { begin, size } => {
                let input_shape = graph.tensor_def(x[0].id)?.shape().to_vec();
                vec![Some(graph.slice_gradient(
                    g,
                    begin.clone(),
                    size.clone(),
                    input_shape,
                )?)]
            }
            Self::Split {
                axis,
                index,
                num_chunks,
            } => {
                let input_shape = graph.tensor_def(x[0].id)?.shape().to_vec();
                let step = input_shape[*axis] / num_chunks;
                let mut begin = vec![0; input_shape.len()];
                let mut size = input_shape.clone();
                begin[*axis] = index * step;
                size[*axis] = step;
                vec![Some(graph.slice_gradient(g, begin, size, input_shape)?)]
            }
            Self::SliceGradient { begin, size, .. } => {
                vec![Some(graph.slice(g, begin.clone(), size.clone())?)]
            }
            Self::Assemble { offsets, .. } => {
                let mut grads = Vec::with_capacity(x.len());
                for (i, (t, offset)) in x.iter().zip(offsets).enumerate() {
                    if !need(i) {
                        grads.push(None);
                        continue;
                    }
                    let size = graph.tensor_def(t.id)?.shape().to_vec();
                    grads.push(Some(graph.slice(g, offset.clone(), size)?));
                }
                grads
            }
            Self::ReluGradient => {
                let gg = if need(0) {
                    Some(graph.relu_gradient(g, x[1])?)
                } else {
                    None
                };
                vec![gg, None]
            }
            Self::Comm { .. } => vec![Some(graph.comm(g, CommTarget::LikeTensor(x[0].id))?)],
            Self::BatchedISendIRecv { .. } | Self::SgdUpdate { .. } => {
                bail_not_implemented!("gradient of {}", self.type_name())
            }
            Self::Custom(custom) => custom.gradient(graph, op, grad_outputs, needs)?,
        };
        Ok(grads)
    }
}
