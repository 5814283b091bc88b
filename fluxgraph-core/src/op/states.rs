//! Distributed-states deduction: how each operator kind partitions its
//! outputs given the partitioning of its inputs.

use std::collections::HashMap;

use crate::{
    bail_runtime, bail_value, dist_states::{DUPLICATE, PARTIAL}, DistributedStates, Result,
    TensorMeta,
};

use super::{BinaryOpType, OpKind};

/// Require identically partitioned inputs and forward that layout.
pub(crate) fn same_states(
    type_name: &str,
    inputs: &[&DistributedStates],
    num_outputs: usize,
) -> Result<Vec<DistributedStates>> {
    let Some(first) = inputs.first() else {
        bail_value!("{type_name} has no inputs to deduce states from");
    };
    if let Some(other) = inputs.iter().find(|ds| !ds.same_layout(first)) {
        bail_value!(
            "{type_name} needs identically partitioned inputs, got {first:?} and {other:?}; insert a comm op"
        );
    }
    Ok(vec![(*first).clone(); num_outputs])
}

fn reject_partial(type_name: &str, inputs: &[&DistributedStates]) -> Result<()> {
    if inputs.iter().any(|ds| ds.has_partial()) {
        bail_value!("{type_name} is not linear and cannot consume partial inputs; reduce them first");
    }
    Ok(())
}

/// Sliced dimensions must not be split across devices.
fn check_unsplit(
    type_name: &str,
    ds: &DistributedStates,
    full: &[usize],
    size: &[usize],
) -> Result<()> {
    for d in ds.split_dims() {
        if d < size.len() && size[d] != full[d] {
            bail_value!("{type_name} cuts dimension {d}, which is split as {ds:?}");
        }
    }
    Ok(())
}

fn deduce_matmul(
    a: &DistributedStates,
    b: &DistributedStates,
    trans_a: bool,
    trans_b: bool,
) -> Result<DistributedStates> {
    // Axis roles in storage order: (m, k) for A and (k, n) for B.
    let (a_m, a_k) = if trans_a { (1, 0) } else { (0, 1) };
    let (b_k, b_n) = if trans_b { (1, 0) } else { (0, 1) };

    let a_dup = if b.get_dim(b_n) > 1 { 1 } else { DUPLICATE };
    let b_dup = if a.get_dim(a_m) > 1 { 0 } else { DUPLICATE };
    let a_map = HashMap::from([(a_m, 0), (a_k, PARTIAL), (DUPLICATE, a_dup)]);
    let b_map = HashMap::from([(b_k, PARTIAL), (b_n, 1), (DUPLICATE, b_dup)]);

    let a_out = a.remap(&a_map)?;
    let b_out = b.remap(&b_map)?;
    if !a_out.same_layout(&b_out) {
        bail_value!(
            "MatMul operands partitioned as {a:?} and {b:?} do not line up; insert a comm op"
        );
    }
    Ok(a_out)
}

impl OpKind {
    /// Output partitioning from input partitioning.
    ///
    /// Source kinds and the communication kinds take their layout from the
    /// graph instead and are rejected here.
    pub(crate) fn deduce_states(
        &self,
        inputs: &[&DistributedStates],
        metas: &[&TensorMeta],
        num_outputs: usize,
    ) -> Result<Vec<DistributedStates>> {
        let name = self.type_name();
        let out = match self {
            Self::Placeholder { .. }
            | Self::Variable { .. }
            | Self::Comm { .. }
            | Self::BatchedISendIRecv { .. }
            | Self::Assemble { .. } => {
                bail_runtime!("{name} does not deduce states from its inputs")
            }
            Self::Group => {
                let n = inputs.first().map(|ds| ds.device_num()).unwrap_or(1);
                vec![DistributedStates::duplicate(n)]
            }
            Self::Unary { op, .. } => {
                if !op.is_linear() {
                    reject_partial(&name, inputs)?;
                }
                same_states(&name, inputs, num_outputs)?
            }
            Self::Binary { op, .. } => {
                if matches!(op, BinaryOpType::Mul | BinaryOpType::Div) {
                    reject_partial(&name, inputs)?;
                }
                same_states(&name, inputs, num_outputs)?
            }
            Self::Scalar { op, .. } => {
                if matches!(op, BinaryOpType::Add | BinaryOpType::Sub) {
                    reject_partial(&name, inputs)?;
                }
                same_states(&name, inputs, num_outputs)?
            }
            Self::ReluGradient => {
                reject_partial(&name, inputs)?;
                same_states(&name, inputs, num_outputs)?
            }
            Self::Sum | Self::SgdUpdate { .. } => same_states(&name, inputs, num_outputs)?,
            Self::MatMul { trans_a, trans_b } => {
                vec![deduce_matmul(inputs[0], inputs[1], *trans_a, *trans_b)?]
            }
            Self::ReduceSum => {
                let x = inputs[0];
                let map = x
                    .split_dims()
                    .into_iter()
                    .map(|d| (d as i32, PARTIAL))
                    .collect::<HashMap<_, _>>();
                vec![x.remap(&map)?]
            }
            Self::OnesLike | Self::ZerosLike => vec![inputs[0].reduce_partial()?],
            Self::BroadcastLike => {
                let (g, like) = (inputs[0], inputs[1]);
                if g.has_partial() {
                    bail_value!("BroadcastLike cannot broadcast a partial scalar; reduce it first");
                }
                if g.device_num() != like.device_num() {
                    bail_value!(
                        "BroadcastLike operands span {} and {} devices",
                        g.device_num(),
                        like.device_num()
                    );
                }
                vec![like.reduce_partial()?]
            }
            Self::Slice { size, .. } => {
                check_unsplit(&name, inputs[0], &metas[0].shape, size)?;
                vec![inputs[0].clone()]
            }
            Self::Split { axis, .. } => {
                if inputs[0].is_split(*axis) {
                    bail_value!("Split along {axis}, which is split as {:?}", inputs[0]);
                }
                vec![inputs[0].clone()]
            }
            Self::SliceGradient {
                size, input_shape, ..
            } => {
                check_unsplit(&name, inputs[0], input_shape, size)?;
                vec![inputs[0].clone()]
            }
            Self::Custom(op) => op.deduce_states(inputs, num_outputs)?,
        };
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mm(a: &DistributedStates, b: &DistributedStates) -> Result<DistributedStates> {
        deduce_matmul(a, b, false, false)
    }

    #[test]
    fn matmul_parallel_styles() {
        let n = 2;
        // data parallel: rows of A split, B replicated
        assert_eq!(
            mm(&DistributedStates::split(n, 0), &DistributedStates::duplicate(n)).unwrap(),
            DistributedStates::split(n, 0)
        );
        // column parallel
        assert_eq!(
            mm(&DistributedStates::duplicate(n), &DistributedStates::split(n, 1)).unwrap(),
            DistributedStates::split(n, 1)
        );
        // row parallel yields partial sums
        assert_eq!(
            mm(&DistributedStates::split(n, 1), &DistributedStates::split(n, 0)).unwrap(),
            DistributedStates::partial(n)
        );
        assert!(mm(&DistributedStates::split(n, 0), &DistributedStates::split(n, 0)).is_err());
    }

    #[test]
    fn transposed_operands_swap_axis_roles() {
        // A^T with A stored [k, m] split along k, B split along k.
        let out = deduce_matmul(
            &DistributedStates::split(2, 0),
            &DistributedStates::split(2, 0),
            true,
            false,
        )
        .unwrap();
        assert_eq!(out, DistributedStates::partial(2));
    }

    #[test]
    fn reduce_sum_turns_splits_into_partials() {
        let x = DistributedStates::new(4, [(0, 2), (DUPLICATE, 2)], vec![DUPLICATE, 0], false)
            .unwrap();
        let m = TensorMeta::default();
        let out = OpKind::ReduceSum
            .deduce_states(&[&x], &[&m], 1)
            .unwrap();
        assert_eq!(out[0].states()[&PARTIAL], 2);
        assert_eq!(out[0].order(), &[DUPLICATE, PARTIAL]);
    }
}
