use crate::{bail_runtime, bail_value, cpu_storage, DType, Device, NDArray, Result};

use super::OpKind;

/// Per-call context handed to kernels.
#[derive(Debug, Clone, Copy)]
pub struct ComputeCtx {
    /// Device the outputs are produced on.
    pub device: Device,
    /// Parallelism available to the kernel.
    pub threads: usize,
}

impl ComputeCtx {
    pub fn new(device: Device, threads: usize) -> Self {
        Self {
            device,
            threads: threads.max(1),
        }
    }

    pub fn host(threads: usize) -> Self {
        Self::new(Device::host(), threads)
    }
}

/// Translate a global `begin`/`size` box onto a local shard. A dimension the
/// shard holds only part of must be taken whole by the box; it then covers
/// the entire local extent.
fn local_box(local: &[usize], begin: &[usize], size: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let mut b = begin.to_vec();
    let mut s = size.to_vec();
    for d in 0..local.len() {
        if local[d] < size[d] {
            b[d] = 0;
            s[d] = local[d];
        }
    }
    (b, s)
}

impl OpKind {
    /// Run the reference CPU kernel of this kind on local input arrays.
    pub fn compute(&self, inputs: &[&NDArray], ctx: &ComputeCtx) -> Result<Vec<NDArray>> {
        let out = match self {
            Self::Placeholder { .. } | Self::Variable { .. } => {
                bail_runtime!(
                    "{} has no kernel, its data is supplied by the graph",
                    self.type_name()
                )
            }
            Self::Group => vec![NDArray::zeros(&[], DType::Bool, ctx.device)],
            Self::Unary { op, .. } => {
                let x = inputs[0];
                let data = cpu_storage::map_unary(x.data(), op.to_closure());
                vec![NDArray::from_parts(data, x.shape().to_vec(), x)]
            }
            Self::Binary { op, .. } => {
                let (a, b) = (inputs[0], inputs[1]);
                if a.shape() != b.shape() {
                    bail_value!(
                        "{} got local shapes {:?} and {:?}",
                        op.as_str(),
                        a.shape(),
                        b.shape()
                    );
                }
                let data = cpu_storage::zip_binary(a.data(), b.data(), op.as_closure());
                vec![NDArray::from_parts(data, a.shape().to_vec(), a)]
            }
            Self::Scalar { op, value, .. } => {
                let x = inputs[0];
                let f = op.as_closure();
                let value = *value;
                let data = cpu_storage::map_unary(x.data(), move |v| f(v, value));
                vec![NDArray::from_parts(data, x.shape().to_vec(), x)]
            }
            Self::MatMul { trans_a, trans_b } => {
                let (a, b) = (inputs[0], inputs[1]);
                let (sa, sb) = (a.shape(), b.shape());
                if sa.len() != 2 || sb.len() != 2 {
                    bail_value!("MatMul needs rank-2 operands, got {sa:?} and {sb:?}");
                }
                let (m, k) = if *trans_a { (sa[1], sa[0]) } else { (sa[0], sa[1]) };
                let (kb, n) = if *trans_b { (sb[1], sb[0]) } else { (sb[0], sb[1]) };
                if k != kb {
                    bail_value!("MatMul local contraction mismatch: {sa:?} x {sb:?}");
                }
                let data =
                    cpu_storage::matmul(a.data(), b.data(), m, k, n, *trans_a, *trans_b, ctx.threads)?;
                vec![NDArray::from_parts(data, vec![m, n], a)]
            }
            Self::ReduceSum => {
                let x = inputs[0];
                vec![NDArray::from_parts(
                    vec![cpu_storage::sum_all(x.data())],
                    vec![],
                    x,
                )]
            }
            Self::BroadcastLike => {
                let (g, like) = (inputs[0], inputs[1]);
                vec![NDArray::full(like.shape(), g.item()?, g.dtype(), ctx.device)]
            }
            Self::OnesLike => {
                let x = inputs[0];
                vec![NDArray::ones(x.shape(), x.dtype(), ctx.device)]
            }
            Self::ZerosLike => {
                let x = inputs[0];
                vec![NDArray::zeros(x.shape(), x.dtype(), ctx.device)]
            }
            Self::Sum => {
                let first = inputs[0];
                if inputs.iter().any(|x| x.shape() != first.shape()) {
                    bail_value!("Sum got differently shaped local inputs");
                }
                let srcs: Vec<&[f32]> = inputs.iter().map(|x| x.data()).collect();
                vec![NDArray::from_parts(
                    cpu_storage::sum_n(&srcs),
                    first.shape().to_vec(),
                    first,
                )]
            }
            Self::Slice { begin, size } => {
                let x = inputs[0];
                let (b, s) = local_box(x.shape(), begin, size);
                vec![x.slice(&b, &s)?]
            }
            Self::Split {
                axis,
                index,
                num_chunks,
            } => {
                let x = inputs[0];
                let step = x.shape()[*axis] / num_chunks;
                let mut begin = vec![0; x.shape().len()];
                let mut size = x.shape().to_vec();
                begin[*axis] = index * step;
                size[*axis] = step;
                vec![x.slice(&begin, &size)?]
            }
            Self::SliceGradient {
                begin,
                size,
                input_shape,
            } => {
                let g = inputs[0];
                let mut shape = input_shape.clone();
                let mut offset = begin.clone();
                for d in 0..shape.len() {
                    if g.shape()[d] < size[d] {
                        shape[d] = g.shape()[d];
                        offset[d] = 0;
                    }
                }
                let mut out = NDArray::zeros(&shape, g.dtype(), ctx.device);
                out.add_at(&offset, g)?;
                vec![out]
            }
            Self::Assemble { shape, offsets } => {
                let mut out = NDArray::zeros(shape, inputs[0].dtype(), ctx.device);
                for (piece, offset) in inputs.iter().zip(offsets) {
                    out.add_at(offset, piece)?;
                }
                vec![out]
            }
            Self::ReluGradient => {
                let (g, x) = (inputs[0], inputs[1]);
                let data =
                    cpu_storage::zip_binary(g.data(), x.data(), |g, x| if x > 0. { g } else { 0. });
                vec![NDArray::from_parts(data, g.shape().to_vec(), g)]
            }
            Self::Comm { .. } => vec![inputs[0].to_device(ctx.device)],
            Self::BatchedISendIRecv { dst_devices } => inputs
                .iter()
                .zip(dst_devices)
                .map(|(x, d)| x.to_device(*d))
                .collect(),
            Self::SgdUpdate { lr, momentum } => {
                let (p, g) = (inputs[0], inputs[1]);
                let lr = *lr;
                match inputs.get(2) {
                    None => {
                        let data = cpu_storage::zip_binary(p.data(), g.data(), move |p, g| p - lr * g);
                        vec![NDArray::from_parts(data, p.shape().to_vec(), p)]
                    }
                    Some(v) => {
                        let momentum = *momentum;
                        let v_new =
                            cpu_storage::zip_binary(v.data(), g.data(), move |v, g| momentum * v + g);
                        let p_new =
                            cpu_storage::zip_binary(p.data(), &v_new, move |p, v| p - lr * v);
                        vec![
                            NDArray::from_parts(p_new, p.shape().to_vec(), p),
                            NDArray::from_parts(v_new, v.shape().to_vec(), v),
                        ]
                    }
                }
            }
            Self::Custom(op) => op.compute(inputs, ctx)?,
        };
        Ok(out)
    }
}
