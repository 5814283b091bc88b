//! Convenience constructors over [`Graph::make_op`].

use crate::{
    cpu_storage::Initializer,
    op::{BinaryOpType, CommTarget, OpKind, OpMeta, UnaryOpType},
    DType, Result, Tensor,
};

use super::Graph;

impl Graph {
    fn single_output(&mut self, kind: OpKind, inputs: Vec<Tensor>, meta: OpMeta) -> Result<Tensor> {
        let op = self.make_op(kind, inputs, meta)?;
        self.output(op, 0)
    }

    pub fn placeholder(&mut self, shape: &[usize], dtype: DType, name: &str) -> Result<Tensor> {
        self.single_output(
            OpKind::Placeholder {
                shape: shape.to_vec(),
                dtype,
            },
            vec![],
            OpMeta::new().name(name),
        )
    }

    pub fn placeholder_with(&mut self, shape: &[usize], dtype: DType, meta: OpMeta) -> Result<Tensor> {
        self.single_output(
            OpKind::Placeholder {
                shape: shape.to_vec(),
                dtype,
            },
            vec![],
            meta,
        )
    }

    pub fn variable(
        &mut self,
        shape: &[usize],
        dtype: DType,
        init: Initializer,
        trainable: bool,
        name: &str,
    ) -> Result<Tensor> {
        self.variable_with(shape, dtype, init, trainable, OpMeta::new().name(name))
    }

    /// A variable with a full [`OpMeta`], e.g. to give it per-strategy
    /// placement and partitioning.
    pub fn variable_with(
        &mut self,
        shape: &[usize],
        dtype: DType,
        init: Initializer,
        trainable: bool,
        meta: OpMeta,
    ) -> Result<Tensor> {
        self.single_output(
            OpKind::Variable {
                shape: shape.to_vec(),
                dtype,
                init,
                trainable,
            },
            vec![],
            meta,
        )
    }

    pub fn unary(&mut self, op: UnaryOpType, x: Tensor) -> Result<Tensor> {
        self.single_output(OpKind::Unary { op, inplace: false }, vec![x], OpMeta::new())
    }

    pub fn unary_inplace(&mut self, op: UnaryOpType, x: Tensor) -> Result<Tensor> {
        self.single_output(OpKind::Unary { op, inplace: true }, vec![x], OpMeta::new())
    }

    pub fn neg(&mut self, x: Tensor) -> Result<Tensor> {
        self.unary(UnaryOpType::Neg, x)
    }

    pub fn exp(&mut self, x: Tensor) -> Result<Tensor> {
        self.unary(UnaryOpType::Exp, x)
    }

    pub fn log(&mut self, x: Tensor) -> Result<Tensor> {
        self.unary(UnaryOpType::Log, x)
    }

    pub fn sqrt(&mut self, x: Tensor) -> Result<Tensor> {
        self.unary(UnaryOpType::Sqrt, x)
    }

    pub fn relu(&mut self, x: Tensor) -> Result<Tensor> {
        self.unary(UnaryOpType::Relu, x)
    }

    pub fn square(&mut self, x: Tensor) -> Result<Tensor> {
        self.unary(UnaryOpType::Square, x)
    }

    pub fn binary(&mut self, op: BinaryOpType, a: Tensor, b: Tensor) -> Result<Tensor> {
        self.single_output(OpKind::Binary { op, inplace: false }, vec![a, b], OpMeta::new())
    }

    pub fn binary_inplace(&mut self, op: BinaryOpType, a: Tensor, b: Tensor) -> Result<Tensor> {
        self.single_output(OpKind::Binary { op, inplace: true }, vec![a, b], OpMeta::new())
    }

    pub fn add(&mut self, a: Tensor, b: Tensor) -> Result<Tensor> {
        self.binary(BinaryOpType::Add, a, b)
    }

    pub fn sub(&mut self, a: Tensor, b: Tensor) -> Result<Tensor> {
        self.binary(BinaryOpType::Sub, a, b)
    }

    pub fn mul(&mut self, a: Tensor, b: Tensor) -> Result<Tensor> {
        self.binary(BinaryOpType::Mul, a, b)
    }

    pub fn div(&mut self, a: Tensor, b: Tensor) -> Result<Tensor> {
        self.binary(BinaryOpType::Div, a, b)
    }

    pub fn scalar(&mut self, op: BinaryOpType, x: Tensor, value: f32) -> Result<Tensor> {
        self.single_output(
            OpKind::Scalar {
                op,
                value,
                inplace: false,
            },
            vec![x],
            OpMeta::new(),
        )
    }

    pub fn add_scalar(&mut self, x: Tensor, value: f32) -> Result<Tensor> {
        self.scalar(BinaryOpType::Add, x, value)
    }

    pub fn mul_scalar(&mut self, x: Tensor, value: f32) -> Result<Tensor> {
        self.scalar(BinaryOpType::Mul, x, value)
    }

    pub fn matmul(&mut self, a: Tensor, b: Tensor, trans_a: bool, trans_b: bool) -> Result<Tensor> {
        self.single_output(OpKind::MatMul { trans_a, trans_b }, vec![a, b], OpMeta::new())
    }

    pub fn reduce_sum(&mut self, x: Tensor) -> Result<Tensor> {
        self.single_output(OpKind::ReduceSum, vec![x], OpMeta::new())
    }

    pub fn broadcast_like(&mut self, scalar: Tensor, like: Tensor) -> Result<Tensor> {
        self.single_output(OpKind::BroadcastLike, vec![scalar, like], OpMeta::new())
    }

    pub fn ones_like(&mut self, x: Tensor) -> Result<Tensor> {
        self.single_output(OpKind::OnesLike, vec![x], OpMeta::new())
    }

    pub fn zeros_like(&mut self, x: Tensor) -> Result<Tensor> {
        self.single_output(OpKind::ZerosLike, vec![x], OpMeta::new())
    }

    pub fn sum(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        self.single_output(OpKind::Sum, xs.to_vec(), OpMeta::new())
    }

    pub fn slice(&mut self, x: Tensor, begin: Vec<usize>, size: Vec<usize>) -> Result<Tensor> {
        self.single_output(OpKind::Slice { begin, size }, vec![x], OpMeta::new())
    }

    pub fn split(&mut self, x: Tensor, axis: usize, index: usize, num_chunks: usize) -> Result<Tensor> {
        self.single_output(
            OpKind::Split {
                axis,
                index,
                num_chunks,
            },
            vec![x],
            OpMeta::new(),
        )
    }

    pub fn slice_gradient(
        &mut self,
        g: Tensor,
        begin: Vec<usize>,
        size: Vec<usize>,
        input_shape: Vec<usize>,
    ) -> Result<Tensor> {
        self.single_output(
            OpKind::SliceGradient {
                begin,
                size,
                input_shape,
            },
            vec![g],
            OpMeta::new(),
        )
    }

    pub fn relu_gradient(&mut self, g: Tensor, x: Tensor) -> Result<Tensor> {
        self.single_output(OpKind::ReluGradient, vec![g, x], OpMeta::new())
    }

    /// Reshard `x` onto another partitioning.
    pub fn comm(&mut self, x: Tensor, dst: CommTarget) -> Result<Tensor> {
        self.single_output(OpKind::Comm { dst }, vec![x], OpMeta::new())
    }

    /// In-place SGD step on `param`; with a `velocity` buffer, momentum SGD
    /// that also updates the buffer. Returns the updated parameter.
    pub fn sgd_update(
        &mut self,
        param: Tensor,
        grad: Tensor,
        velocity: Option<Tensor>,
        lr: f32,
        momentum: f32,
    ) -> Result<Tensor> {
        let mut inputs = vec![param, grad];
        inputs.extend(velocity);
        self.single_output(OpKind::SgdUpdate { lr, momentum }, inputs, OpMeta::new())
    }
}
