use std::sync::Arc;

use crate::{
    bail_type, bail_value, cpu_storage::Initializer, DType, Device, DistributedStatesHierarchy,
    Result, TensorId, TensorMeta,
};

use super::CustomOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOpType {
    Neg,
    Exp,
    Log,
    Sqrt,
    Relu,
    Square,
}

impl UnaryOpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Neg => "Neg",
            Self::Exp => "Exp",
            Self::Log => "Log",
            Self::Sqrt => "Sqrt",
            Self::Relu => "Relu",
            Self::Square => "Square",
        }
    }

    pub fn to_closure(&self) -> fn(f32) -> f32 {
        match self {
            Self::Neg => |x| -x,
            Self::Exp => f32::exp,
            Self::Log => f32::ln,
            Self::Sqrt => f32::sqrt,
            Self::Relu => |x| x.max(0.),
            Self::Square => |x| x * x,
        }
    }

    /// Whether the op commutes with summation, so partial inputs stay partial.
    pub(crate) fn is_linear(&self) -> bool {
        matches!(self, Self::Neg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOpType {
    Add,
    Div,
    Sub,
    Mul,
}

impl BinaryOpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "Add",
            Self::Div => "Div",
            Self::Sub => "Sub",
            Self::Mul => "Mul",
        }
    }

    pub fn as_closure(&self) -> fn(f32, f32) -> f32 {
        match self {
            Self::Add => |x, y| x + y,
            Self::Div => |x, y| x / y,
            Self::Sub => |x, y| x - y,
            Self::Mul => |x, y| x * y,
        }
    }
}

/// Target layout of a [`OpKind::Comm`].
#[derive(Debug, Clone)]
pub enum CommTarget {
    /// Explicit partitioning per strategy.
    States(DistributedStatesHierarchy),
    /// Whatever layout the given tensor of the same graph ends up with.
    LikeTensor(TensorId),
}

/// The operator interface: one variant per operator kind.
#[derive(Debug, Clone)]
pub enum OpKind {
    Placeholder {
        shape: Vec<usize>,
        dtype: DType,
    },
    Variable {
        shape: Vec<usize>,
        dtype: DType,
        init: Initializer,
        trainable: bool,
    },
    /// Folds several control dependencies into one linker.
    Group,
    Unary {
        op: UnaryOpType,
        inplace: bool,
    },
    Binary {
        op: BinaryOpType,
        inplace: bool,
    },
    /// `x ∘ value`.
    Scalar {
        op: BinaryOpType,
        value: f32,
        inplace: bool,
    },
    MatMul {
        trans_a: bool,
        trans_b: bool,
    },
    /// Sum of every element, producing a scalar.
    ReduceSum,
    /// Inputs `(scalar, like)`: the scalar filled into the shape of `like`.
    BroadcastLike,
    OnesLike,
    ZerosLike,
    /// Elementwise sum of any number of equally shaped inputs.
    Sum,
    Slice {
        begin: Vec<usize>,
        size: Vec<usize>,
    },
    /// Chunk `index` of `num_chunks` equal chunks along `axis`.
    Split {
        axis: usize,
        index: usize,
        num_chunks: usize,
    },
    /// Scatters a slice gradient back into zeros of the sliced input's shape.
    SliceGradient {
        begin: Vec<usize>,
        size: Vec<usize>,
        input_shape: Vec<usize>,
    },
    /// Accumulates each input into zeros of `shape` at the matching offset.
    Assemble {
        shape: Vec<usize>,
        offsets: Vec<Vec<usize>>,
    },
    /// Inputs `(grad, x)`.
    ReluGradient,
    Comm {
        dst: CommTarget,
    },
    /// Moves input `i` to `dst_devices[i]`, all messages posted as one batch.
    BatchedISendIRecv {
        dst_devices: Vec<Device>,
    },
    /// Inputs `(param, grad)` or `(param, grad, velocity)`; updates in place.
    SgdUpdate {
        lr: f32,
        momentum: f32,
    },
    Custom(Arc<dyn CustomOp>),
}

impl OpKind {
    pub fn type_name(&self) -> String {
        let inplace = |base: &str, inplace: bool| {
            if inplace {
                format!("{base}Inplace")
            } else {
                base.to_string()
            }
        };
        match self {
            Self::Placeholder { .. } => "Placeholder".into(),
            Self::Variable { .. } => "Variable".into(),
            Self::Group => "Group".into(),
            Self::Unary { op, inplace: i } => inplace(op.as_str(), *i),
            Self::Binary { op, inplace: i } => inplace(op.as_str(), *i),
            Self::Scalar { op, inplace: i, .. } => inplace(&format!("{}Const", op.as_str()), *i),
            Self::MatMul { .. } => "MatMul".into(),
            Self::ReduceSum => "ReduceSum".into(),
            Self::BroadcastLike => "BroadcastLike".into(),
            Self::OnesLike => "OnesLike".into(),
            Self::ZerosLike => "ZerosLike".into(),
            Self::Sum => "Sum".into(),
            Self::Slice { .. } => "Slice".into(),
            Self::Split { .. } => "Split".into(),
            Self::SliceGradient { .. } => "SliceGradient".into(),
            Self::Assemble { .. } => "Assemble".into(),
            Self::ReluGradient => "ReluGradient".into(),
            Self::Comm { .. } => "Comm".into(),
            Self::BatchedISendIRecv { .. } => "BatchedISendIRecv".into(),
            Self::SgdUpdate { .. } => "SGDUpdate".into(),
            Self::Custom(op) => op.type_name().to_string(),
        }
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, Self::Variable { .. })
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder { .. })
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group)
    }

    pub fn is_slice(&self) -> bool {
        matches!(self, Self::Slice { .. } | Self::Split { .. })
    }

    pub fn is_batched_isend_irecv(&self) -> bool {
        matches!(self, Self::BatchedISendIRecv { .. })
    }

    pub fn is_comm(&self) -> bool {
        matches!(self, Self::Comm { .. })
    }

    pub fn is_optimizer_update(&self) -> bool {
        matches!(self, Self::SgdUpdate { .. })
    }

    /// The input whose storage the first output overwrites, if any.
    pub fn inplace_input(&self) -> Option<usize> {
        match self {
            Self::Unary { inplace: true, .. }
            | Self::Binary { inplace: true, .. }
            | Self::Scalar { inplace: true, .. }
            | Self::SgdUpdate { .. } => Some(0),
            _ => None,
        }
    }

    /// Every `(output, input)` pair where the output overwrites the input.
    pub fn mutated_inputs(&self, num_inputs: usize) -> Vec<(usize, usize)> {
        match self {
            Self::SgdUpdate { .. } if num_inputs == 3 => vec![(0, 0), (1, 2)],
            _ => self.inplace_input().map(|i| (0, i)).into_iter().collect(),
        }
    }

    pub fn infer_meta(&self, inputs: &[&TensorMeta]) -> Result<Vec<TensorMeta>> {
        let name = self.type_name();
        let arity = |n: usize| -> Result<()> {
            if inputs.len() != n {
                bail_value!("{name} takes {n} inputs, got {}", inputs.len());
            }
            Ok(())
        };
        let same_dtype = |a: &TensorMeta, b: &TensorMeta| -> Result<()> {
            if a.dtype != b.dtype {
                bail_type!("{name} got mismatched dtypes {} and {}", a.dtype, b.dtype);
            }
            Ok(())
        };
        let same_shape = |a: &TensorMeta, b: &TensorMeta| -> Result<()> {
            if a.shape != b.shape {
                bail_value!("{name} got mismatched shapes {:?} and {:?}", a.shape, b.shape);
            }
            Ok(())
        };
        let like = |m: &TensorMeta, shape: &[usize]| TensorMeta {
            shape: shape.to_vec(),
            dtype: m.dtype,
            device: m.device,
            symbolic_shape: None,
        };

        let metas = match self {
            Self::Placeholder { shape, dtype } | Self::Variable { shape, dtype, .. } => {
                arity(0)?;
                vec![TensorMeta::new(shape, *dtype)]
            }
            Self::Group => vec![TensorMeta::new(&[], DType::Bool)],
            Self::Unary { .. }
            | Self::Scalar { .. }
            | Self::OnesLike
            | Self::ZerosLike
            | Self::Comm { .. } => {
                arity(1)?;
                vec![like(inputs[0], &inputs[0].shape)]
            }
            Self::Binary { .. } | Self::ReluGradient => {
                arity(2)?;
                same_dtype(inputs[0], inputs[1])?;
                same_shape(inputs[0], inputs[1])?;
                vec![like(inputs[0], &inputs[0].shape)]
            }
            Self::MatMul { trans_a, trans_b } => {
                arity(2)?;
                same_dtype(inputs[0], inputs[1])?;
                let (a, b) = (&inputs[0].shape, &inputs[1].shape);
                if a.len() != 2 || b.len() != 2 {
                    bail_value!("MatMul needs rank-2 operands, got {a:?} and {b:?}");
                }
                let (m, k) = if *trans_a { (a[1], a[0]) } else { (a[0], a[1]) };
                let (kb, n) = if *trans_b { (b[1], b[0]) } else { (b[0], b[1]) };
                if k != kb {
                    bail_value!("MatMul contraction mismatch: {a:?} x {b:?}");
                }
                vec![like(inputs[0], &[m, n])]
            }
            Self::ReduceSum => {
                arity(1)?;
                vec![like(inputs[0], &[])]
            }
            Self::BroadcastLike => {
                arity(2)?;
                same_dtype(inputs[0], inputs[1])?;
                if !inputs[0].shape.is_empty() {
                    bail_value!("BroadcastLike broadcasts scalars, got {:?}", inputs[0].shape);
                }
                vec![like(inputs[0], &inputs[1].shape)]
            }
            Self::Sum => {
                let Some(first) = inputs.first() else {
                    bail_value!("Sum needs at least one input");
                };
                for m in &inputs[1..] {
                    same_dtype(first, m)?;
                    same_shape(first, m)?;
                }
                vec![like(first, &first.shape)]
            }
            Self::Slice { begin, size } => {
                arity(1)?;
                let shape = &inputs[0].shape;
                if begin.len() != shape.len() || size.len() != shape.len() {
                    bail_value!(
                        "Slice rank mismatch: input {shape:?}, begin {begin:?}, size {size:?}"
                    );
                }
                if (0..shape.len()).any(|d| begin[d] + size[d] > shape[d]) {
                    bail_value!("Slice {begin:?} + {size:?} exceeds input shape {shape:?}");
                }
                vec![like(inputs[0], size)]
            }
            Self::Split {
                axis,
                index,
                num_chunks,
            } => {
                arity(1)?;
                let shape = &inputs[0].shape;
                if *axis >= shape.len() || *num_chunks == 0 || *index >= *num_chunks {
                    bail_value!(
                        "Split of {shape:?} along {axis} into chunk {index} of {num_chunks} is invalid"
                    );
                }
                if shape[*axis] % num_chunks != 0 {
                    bail_value!(
                        "Split: dimension {} not divisible by {num_chunks}",
                        shape[*axis]
                    );
                }
                let mut out = shape.clone();
                out[*axis] /= num_chunks;
                vec![like(inputs[0], &out)]
            }
            Self::SliceGradient {
                begin,
                size,
                input_shape,
            } => {
                arity(1)?;
                if inputs[0].shape != *size {
                    bail_value!(
                        "SliceGradient expects gradient of shape {size:?}, got {:?}",
                        inputs[0].shape
                    );
                }
                if begin.len() != input_shape.len()
                    || (0..begin.len()).any(|d| begin[d] + size[d] > input_shape[d])
                {
                    bail_value!("SliceGradient box {begin:?} + {size:?} outside {input_shape:?}");
                }
                vec![like(inputs[0], input_shape)]
            }
            Self::Assemble { shape, offsets } => {
                if offsets.len() != inputs.len() || inputs.is_empty() {
                    bail_value!(
                        "Assemble got {} inputs and {} offsets",
                        inputs.len(),
                        offsets.len()
                    );
                }
                for (m, off) in inputs.iter().zip(offsets) {
                    same_dtype(inputs[0], m)?;
                    if off.len() != shape.len()
                        || m.shape.len() != shape.len()
                        || (0..shape.len()).any(|d| off[d] + m.shape[d] > shape[d])
                    {
                        bail_value!(
                            "Assemble piece {:?} at {off:?} does not fit into {shape:?}",
                            m.shape
                        );
                    }
                }
                vec![like(inputs[0], shape)]
            }
            Self::BatchedISendIRecv { dst_devices } => {
                if dst_devices.len() != inputs.len() {
                    bail_value!(
                        "BatchedISendIRecv got {} inputs for {} destinations",
                        inputs.len(),
                        dst_devices.len()
                    );
                }
                inputs
                    .iter()
                    .zip(dst_devices)
                    .map(|(m, d)| like(m, &m.shape).with_device(*d))
                    .collect()
            }
            Self::SgdUpdate { .. } => {
                if inputs.len() != 2 && inputs.len() != 3 {
                    bail_value!("SGDUpdate takes 2 or 3 inputs, got {}", inputs.len());
                }
                for m in &inputs[1..] {
                    same_dtype(inputs[0], m)?;
                    same_shape(inputs[0], m)?;
                }
                inputs
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != 1)
                    .map(|(_, m)| like(m, &m.shape))
                    .collect()
            }
            Self::Custom(op) => op.infer_meta(inputs)?,
        };
        Ok(metas)
    }
}
