use std::{collections::BTreeSet, fmt};

use crate::{
    graph::GraphId, op::OpId, shape::SymbolicShape, DType, Device, DeviceGroup,
    DistributedStates, DistributedStatesHierarchy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl TensorId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A cheap, copyable reference to a tensor of a particular graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tensor {
    pub graph_id: GraphId,
    pub id: TensorId,
}

#[derive(Clone, Debug, Default)]
pub struct TensorMeta {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub device: Option<Device>,
    pub symbolic_shape: Option<SymbolicShape>,
}

impl TensorMeta {
    pub fn new(shape: &[usize], dtype: DType) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
            device: None,
            symbolic_shape: None,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

/// Where an executable tensor lives: its device group and how it is split.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Layout {
    pub group: DeviceGroup,
    pub ds: DistributedStates,
}

impl Layout {
    pub fn new(group: DeviceGroup, ds: DistributedStates) -> Self {
        Self { group, ds }
    }

    /// A whole tensor on a single device.
    pub fn single(device: Device) -> Self {
        Self {
            group: DeviceGroup::single(device),
            ds: DistributedStates::trivial(),
        }
    }

    pub fn replicated(group: DeviceGroup) -> Self {
        let n = group.num_devices();
        Self {
            group,
            ds: DistributedStates::duplicate(n),
        }
    }
}

/// Arena entry of a tensor. Links are ids into the owning graph.
#[derive(Clone, Debug)]
pub struct TensorDef {
    pub(crate) id: TensorId,
    pub(crate) name: String,
    pub(crate) graph_id: GraphId,
    pub(crate) producer: Option<OpId>,
    pub(crate) output_index: usize,
    pub(crate) consumers: BTreeSet<OpId>,
    pub(crate) meta: TensorMeta,
    pub(crate) ds_hierarchy: DistributedStatesHierarchy,
    pub(crate) layout: Option<Layout>,
    pub(crate) is_grad: bool,
    pub(crate) requires_grad: bool,
}

impl TensorDef {
    pub fn handle(&self) -> Tensor {
        Tensor {
            graph_id: self.graph_id,
            id: self.id,
        }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` for a detached tensor waiting to be adopted by `replace_output`.
    pub fn producer(&self) -> Option<OpId> {
        self.producer
    }

    pub fn output_index(&self) -> usize {
        self.output_index
    }

    pub fn consumers(&self) -> &BTreeSet<OpId> {
        &self.consumers
    }

    pub fn num_consumers(&self) -> usize {
        self.consumers.len()
    }

    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    pub fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }

    pub fn symbolic_shape(&self) -> Option<&SymbolicShape> {
        self.meta.symbolic_shape.as_ref()
    }

    pub fn ds_hierarchy(&self) -> &DistributedStatesHierarchy {
        &self.ds_hierarchy
    }

    /// Placement and partitioning, set on executable graphs only.
    pub fn layout(&self) -> Option<&Layout> {
        self.layout.as_ref()
    }

    pub fn is_grad(&self) -> bool {
        self.is_grad
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }
}
