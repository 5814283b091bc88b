use std::fmt;

use crate::{
    bail_not_implemented, graph::GraphId, DeviceGroup, DeviceGroupHierarchy, DistributedStates,
    DistributedStatesHierarchy, Graph, NDArray, Result, Tensor, TensorId, TensorMeta,
};

mod compute;
mod gradient;
mod kind;
pub(crate) mod states;

pub use compute::ComputeCtx;
pub use kind::{BinaryOpType, CommTarget, OpKind, UnaryOpType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub(crate) u64);

impl OpId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// A cheap, copyable reference to an operator of a particular graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Operator {
    pub graph_id: GraphId,
    pub id: OpId,
}

/// Everything about an operator that is not its kind or its edges.
#[derive(Clone, Debug, Default)]
pub struct OpMeta {
    pub name: String,
    /// Placement per strategy.
    pub device_group_hierarchy: DeviceGroupHierarchy,
    /// Partitioning of the outputs of source operators, per strategy.
    pub ds_hierarchy: DistributedStatesHierarchy,
    pub is_recompute: bool,
    pub is_offload: bool,
    pub stream_index: Option<usize>,
    /// Control dependencies folded into the operator's in-dependency linkers.
    pub extra_deps: Vec<Tensor>,
}

impl OpMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn device_groups(mut self, hierarchy: DeviceGroupHierarchy) -> Self {
        self.device_group_hierarchy = hierarchy;
        self
    }

    pub fn states(mut self, hierarchy: DistributedStatesHierarchy) -> Self {
        self.ds_hierarchy = hierarchy;
        self
    }

    pub fn recompute(mut self, on: bool) -> Self {
        self.is_recompute = on;
        self
    }

    pub fn offload(mut self, on: bool) -> Self {
        self.is_offload = on;
        self
    }

    pub fn stream(mut self, index: usize) -> Self {
        self.stream_index = Some(index);
        self
    }

    pub fn extra_deps(mut self, deps: Vec<Tensor>) -> Self {
        self.extra_deps = deps;
        self
    }
}

/// Arena entry of an operator.
#[derive(Clone, Debug)]
pub struct OperatorDef {
    pub(crate) id: OpId,
    pub(crate) graph_id: GraphId,
    pub(crate) kind: OpKind,
    pub(crate) inputs: Vec<TensorId>,
    pub(crate) outputs: Vec<TensorId>,
    pub(crate) extra_in_deps: Vec<TensorId>,
    pub(crate) meta: OpMeta,
    pub(crate) placement: Option<DeviceGroup>,
}

impl OperatorDef {
    pub fn handle(&self) -> Operator {
        Operator {
            graph_id: self.graph_id,
            id: self.id,
        }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn type_name(&self) -> String {
        self.kind.type_name()
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn extra_in_deps(&self) -> &[TensorId] {
        &self.extra_in_deps
    }

    pub fn meta(&self) -> &OpMeta {
        &self.meta
    }

    /// Device group the operator executes on (executable graphs only).
    pub fn placement(&self) -> Option<&DeviceGroup> {
        self.placement.as_ref()
    }

    /// Inputs followed by in-dependency linkers.
    pub(crate) fn all_inputs(&self) -> impl Iterator<Item = &TensorId> {
        self.inputs.iter().chain(self.extra_in_deps.iter())
    }
}

/// User-defined operator kinds, wrapped by [`OpKind::Custom`].
pub trait CustomOp: fmt::Debug {
    /// Used for op type counts, naming and DOT labels.
    fn type_name(&self) -> &str;

    fn infer_meta(&self, inputs: &[&TensorMeta]) -> Result<Vec<TensorMeta>>;

    fn compute(&self, inputs: &[&NDArray], ctx: &ComputeCtx) -> Result<Vec<NDArray>>;

    /// Build the gradient operators of `op` into `graph`. `needs[i]` tells
    /// whether a gradient for input `i` is wanted.
    fn gradient(
        &self,
        graph: &mut Graph,
        op: OpId,
        grad_outputs: &[Option<Tensor>],
        needs: &[bool],
    ) -> Result<Vec<Option<Tensor>>> {
        let _ = (graph, op, grad_outputs, needs);
        bail_not_implemented!("gradient of custom op {}", self.type_name())
    }

    /// Output partitioning given input partitioning. The default demands
    /// identically partitioned inputs and forwards that layout.
    fn deduce_states(
        &self,
        inputs: &[&DistributedStates],
        num_outputs: usize,
    ) -> Result<Vec<DistributedStates>> {
        states::same_states(self.type_name(), inputs, num_outputs)
    }
}
