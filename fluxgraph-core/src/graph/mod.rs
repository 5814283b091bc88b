use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use tracing::trace;

use crate::{
    bail_runtime, bail_value, ensure,
    op::{CommTarget, OpId, OpKind, OpMeta, Operator, OperatorDef},
    shape::SymbolicShape,
    EngineConfig, NDArray, Result, Tensor, TensorDef, TensorId, TensorMeta,
};

mod autodiff;
mod builder;
mod define_and_run;
mod dot;
mod eager;
mod executable;
pub mod registry;
pub mod subgraph;
mod topo;
mod variables;

pub use define_and_run::{ExecGraphPlan, StrategyKey};
pub use executable::{RunLevel, RunOptions};
pub use registry::GraphRegistry;
pub use subgraph::{OpClassTimes, SubGraph, SubGraphOpType, SubGraphType};

pub(crate) use define_and_run::{instantiate, stateful_tensors, DefineAndRunState};
pub(crate) use executable::{execute_op, ExecutableState, ShapePlan, TensorValues};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(pub(crate) u64);

impl GraphId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphType {
    /// Every op computes as soon as it is made.
    Eager,
    /// Ops are traced and computed on `run`.
    DefineByRun,
    /// Ops are staged and instantiated into executable graphs on `run`.
    DefineAndRun,
    /// A plan-bound graph over a device mesh.
    Executable,
}

impl fmt::Display for GraphType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eager => "eager",
            Self::DefineByRun => "define_by_run",
            Self::DefineAndRun => "define_and_run",
            Self::Executable => "executable",
        };
        f.write_str(s)
    }
}

pub(crate) enum GraphState {
    Eager,
    DefineByRun,
    DefineAndRun(Box<DefineAndRunState>),
    Executable(Box<ExecutableState>),
}

impl GraphState {
    pub(crate) fn new(graph_type: GraphType) -> Self {
        match graph_type {
            GraphType::Eager => Self::Eager,
            GraphType::DefineByRun => Self::DefineByRun,
            GraphType::DefineAndRun => Self::DefineAndRun(Box::default()),
            GraphType::Executable => Self::Executable(Box::default()),
        }
    }
}

/// A computation graph. Operators and tensors live in per-graph arenas keyed by
/// id; every link between them is an id into those arenas.
pub struct Graph {
    id: GraphId,
    name: String,
    pub(crate) config: EngineConfig,
    pub(crate) ops: HashMap<OpId, OperatorDef>,
    pub(crate) tensors: HashMap<TensorId, TensorDef>,
    next_op_id: u64,
    next_tensor_id: u64,
    op_type_cnts: HashMap<String, usize>,
    source_ops: BTreeSet<OpId>,
    sink_ops: BTreeSet<OpId>,
    parameter_ops: BTreeSet<OpId>,
    optimizer_variable_ops: BTreeSet<OpId>,
    out_degrees: HashMap<OpId, usize>,
    /// Cached output values of local graphs.
    pub(crate) preserved: HashMap<TensorId, NDArray>,
    /// Live variable values of local graphs.
    pub(crate) local_vars: HashMap<TensorId, NDArray>,
    pub(crate) subgraphs: subgraph::SubGraphTree,
    grad_depth: usize,
    pub(crate) state: GraphState,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.graph_type())
            .field("num_ops", &self.ops.len())
            .field("num_tensors", &self.tensors.len())
            .finish()
    }
}

impl Graph {
    pub(crate) fn new(id: GraphId, name: String, state: GraphState, config: EngineConfig) -> Self {
        let cap = config.graph_capacity;
        Self {
            id,
            name,
            config,
            ops: HashMap::with_capacity(cap),
            tensors: HashMap::with_capacity(cap),
            next_op_id: 0,
            next_tensor_id: 0,
            op_type_cnts: HashMap::new(),
            source_ops: BTreeSet::new(),
            sink_ops: BTreeSet::new(),
            parameter_ops: BTreeSet::new(),
            optimizer_variable_ops: BTreeSet::new(),
            out_degrees: HashMap::new(),
            preserved: HashMap::new(),
            local_vars: HashMap::new(),
            subgraphs: subgraph::SubGraphTree::default(),
            grad_depth: 0,
            state,
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graph_type(&self) -> GraphType {
        match self.state {
            GraphState::Eager => GraphType::Eager,
            GraphState::DefineByRun => GraphType::DefineByRun,
            GraphState::DefineAndRun(_) => GraphType::DefineAndRun,
            GraphState::Executable(_) => GraphType::Executable,
        }
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    /// Number of ops of the given type name made in this graph so far.
    pub fn op_type_count(&self, type_name: &str) -> usize {
        self.op_type_cnts.get(type_name).copied().unwrap_or(0)
    }

    pub(crate) fn op_def(&self, id: OpId) -> Result<&OperatorDef> {
        match self.ops.get(&id) {
            Some(op) => Ok(op),
            None => bail_value!("op {id} does not exist in graph {}", self.name),
        }
    }

    pub(crate) fn op_def_mut(&mut self, id: OpId) -> Result<&mut OperatorDef> {
        match self.ops.get_mut(&id) {
            Some(op) => Ok(op),
            None => bail_value!("op {id} does not exist in graph {}", self.name),
        }
    }

    pub(crate) fn tensor_def(&self, id: TensorId) -> Result<&TensorDef> {
        match self.tensors.get(&id) {
            Some(t) => Ok(t),
            None => bail_value!("tensor {id} does not exist in graph {}", self.name),
        }
    }

    pub(crate) fn tensor_def_mut(&mut self, id: TensorId) -> Result<&mut TensorDef> {
        match self.tensors.get_mut(&id) {
            Some(t) => Ok(t),
            None => bail_value!("tensor {id} does not exist in graph {}", self.name),
        }
    }

    /// Reject handles of other graphs.
    pub(crate) fn check_op(&self, op: Operator) -> Result<OpId> {
        if op.graph_id != self.id {
            bail_runtime!(
                "op {} belongs to graph {}, not to graph {} ({})",
                op.id,
                op.graph_id,
                self.id,
                self.name
            );
        }
        self.op_def(op.id)?;
        Ok(op.id)
    }

    pub(crate) fn check_tensor(&self, t: Tensor) -> Result<TensorId> {
        if t.graph_id != self.id {
            bail_runtime!(
                "tensor {} belongs to graph {}, not to graph {} ({})",
                t.id,
                t.graph_id,
                self.id,
                self.name
            );
        }
        self.tensor_def(t.id)?;
        Ok(t.id)
    }

    pub fn op(&self, op: Operator) -> Result<&OperatorDef> {
        let id = self.check_op(op)?;
        self.op_def(id)
    }

    pub fn tensor(&self, t: Tensor) -> Result<&TensorDef> {
        let id = self.check_tensor(t)?;
        self.tensor_def(id)
    }

    pub(crate) fn op_handle(&self, id: OpId) -> Operator {
        Operator {
            graph_id: self.id,
            id,
        }
    }

    pub(crate) fn tensor_handle(&self, id: TensorId) -> Tensor {
        Tensor {
            graph_id: self.id,
            id,
        }
    }

    /// Every op, ordered by id.
    pub fn ops(&self) -> Vec<Operator> {
        let mut ids: Vec<OpId> = self.ops.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(|id| self.op_handle(id)).collect()
    }

    pub fn output(&self, op: Operator, index: usize) -> Result<Tensor> {
        let def = self.op(op)?;
        match def.outputs.get(index) {
            Some(t) => Ok(self.tensor_handle(*t)),
            None => bail_value!(
                "op {} has {} outputs, asked for output {index}",
                def.meta.name,
                def.outputs.len()
            ),
        }
    }

    pub fn outputs(&self, op: Operator) -> Result<Vec<Tensor>> {
        let def = self.op(op)?;
        Ok(def.outputs.iter().map(|t| self.tensor_handle(*t)).collect())
    }

    pub fn inputs(&self, op: Operator) -> Result<Vec<Tensor>> {
        let def = self.op(op)?;
        Ok(def.inputs.iter().map(|t| self.tensor_handle(*t)).collect())
    }

    pub fn producer(&self, t: Tensor) -> Result<Option<Operator>> {
        Ok(self.tensor(t)?.producer.map(|id| self.op_handle(id)))
    }

    pub fn consumers(&self, t: Tensor) -> Result<Vec<Operator>> {
        Ok(self
            .tensor(t)?
            .consumers
            .iter()
            .map(|id| self.op_handle(*id))
            .collect())
    }

    pub fn source_ops(&self) -> Vec<Operator> {
        self.source_ops.iter().map(|id| self.op_handle(*id)).collect()
    }

    pub fn sink_ops(&self) -> Vec<Operator> {
        self.sink_ops.iter().map(|id| self.op_handle(*id)).collect()
    }

    pub(crate) fn sink_op_ids(&self) -> Vec<OpId> {
        self.sink_ops.iter().copied().collect()
    }

    pub fn is_source(&self, op: Operator) -> Result<bool> {
        Ok(self.source_ops.contains(&self.check_op(op)?))
    }

    pub fn is_sink(&self, op: Operator) -> Result<bool> {
        Ok(self.sink_ops.contains(&self.check_op(op)?))
    }

    /// Number of distinct producer ops across inputs and in-dependency linkers.
    pub fn in_degree(&self, op: Operator) -> Result<usize> {
        let def = self.op(op)?;
        Ok(self.producers_of(def).len())
    }

    /// Number of (consumer, tensor) edges leaving the op.
    pub fn out_degree(&self, op: Operator) -> Result<usize> {
        let id = self.check_op(op)?;
        Ok(self.out_degrees.get(&id).copied().unwrap_or(0))
    }

    pub(crate) fn producers_of(&self, def: &OperatorDef) -> BTreeSet<OpId> {
        def.all_inputs()
            .filter_map(|t| self.tensors.get(t).and_then(|t| t.producer))
            .collect()
    }

    /// Cached value of a tensor of a local graph.
    pub fn preserved_data(&self, t: Tensor) -> Result<Option<&NDArray>> {
        let id = self.check_tensor(t)?;
        Ok(self.preserved.get(&id))
    }

    pub(crate) fn is_grad_ctx(&self) -> bool {
        self.grad_depth > 0
    }

    /// Ops made until the matching [`Graph::pop_grad_ctx`] produce gradient
    /// tensors.
    pub fn push_grad_ctx(&mut self) {
        self.grad_depth += 1;
    }

    pub fn pop_grad_ctx(&mut self) -> Result<()> {
        ensure!(self.grad_depth > 0, "grad context stack of {} is empty", self.name);
        self.grad_depth -= 1;
        Ok(())
    }

    fn next_op_id(&mut self) -> OpId {
        let id = OpId(self.next_op_id);
        self.next_op_id += 1;
        id
    }

    fn next_tensor_id(&mut self) -> TensorId {
        let id = TensorId(self.next_tensor_id);
        self.next_tensor_id += 1;
        id
    }

    pub(crate) fn peek_next_op_id(&self) -> u64 {
        self.next_op_id
    }

    /// Record `op` as a consumer of `t`, keeping out-degrees and sinks in step.
    fn link_consumer(&mut self, t: TensorId, op: OpId) {
        let Some(def) = self.tensors.get_mut(&t) else {
            return;
        };
        if !def.consumers.insert(op) {
            return;
        }
        if let Some(p) = def.producer {
            *self.out_degrees.entry(p).or_default() += 1;
            self.sink_ops.remove(&p);
        }
    }

    /// Drop `op` from the consumers of `t` unless it still references `t`.
    fn unlink_consumer(&mut self, t: TensorId, op: OpId) {
        let still_used = self
            .ops
            .get(&op)
            .map(|d| d.all_inputs().any(|x| *x == t))
            .unwrap_or(false);
        if still_used {
            return;
        }
        let Some(def) = self.tensors.get_mut(&t) else {
            return;
        };
        if !def.consumers.remove(&op) {
            return;
        }
        if let Some(p) = def.producer {
            if let Some(d) = self.out_degrees.get_mut(&p) {
                *d = d.saturating_sub(1);
                if *d == 0 {
                    self.sink_ops.insert(p);
                }
            }
        }
    }

    /// Make an operator and register it with every index of the graph.
    pub fn make_op(&mut self, kind: OpKind, inputs: Vec<Tensor>, meta: OpMeta) -> Result<Operator> {
        let input_ids = inputs
            .iter()
            .map(|t| self.check_tensor(*t))
            .collect::<Result<Vec<_>>>()?;
        for dep in &meta.extra_deps {
            self.check_tensor(*dep)?;
        }
        for t in &input_ids {
            if self.tensors[t].producer.is_none() {
                bail_value!("tensor {t} is detached and cannot be consumed");
            }
        }
        if let OpKind::Comm {
            dst: CommTarget::LikeTensor(t),
        } = &kind
        {
            self.tensor_def(*t)?;
        }

        let mut out_metas = {
            let metas: Vec<&TensorMeta> = input_ids.iter().map(|t| &self.tensors[t].meta).collect();
            kind.infer_meta(&metas)?
        };
        if let Some(first) = input_ids.first() {
            let in_meta = &self.tensors[first].meta;
            if let Some(sym) = &in_meta.symbolic_shape {
                for m in out_metas.iter_mut().filter(|m| m.shape == in_meta.shape) {
                    m.symbolic_shape = Some(sym.clone());
                }
            }
        }

        let id = self.next_op_id();
        let type_name = kind.type_name();
        let cnt = self.op_type_cnts.entry(type_name.clone()).or_default();
        let name = if meta.name.is_empty() {
            format!("{type_name}_{cnt}")
        } else {
            meta.name.clone()
        };
        *cnt += 1;

        let requires_grad = match &kind {
            OpKind::Variable { trainable, .. } => *trainable,
            _ => input_ids.iter().any(|t| self.tensors[t].requires_grad),
        };
        let is_grad = self.is_grad_ctx();
        let mut outputs = Vec::with_capacity(out_metas.len());
        for (i, m) in out_metas.into_iter().enumerate() {
            let tid = self.next_tensor_id();
            self.tensors.insert(
                tid,
                TensorDef {
                    id: tid,
                    name: format!("{name}:{i}"),
                    graph_id: self.id,
                    producer: Some(id),
                    output_index: i,
                    consumers: BTreeSet::new(),
                    meta: m,
                    ds_hierarchy: meta.ds_hierarchy.clone(),
                    layout: None,
                    is_grad,
                    requires_grad,
                },
            );
            outputs.push(tid);
        }

        let extra_deps = meta.extra_deps.clone();
        let is_trainable_var = matches!(kind, OpKind::Variable { trainable: true, .. });
        let is_update = kind.is_optimizer_update();
        let has_device_groups = !meta.device_group_hierarchy.is_empty();
        self.ops.insert(
            id,
            OperatorDef {
                id,
                graph_id: self.id,
                kind,
                inputs: input_ids.clone(),
                outputs,
                extra_in_deps: Vec::new(),
                meta: OpMeta { name, ..meta },
                placement: None,
            },
        );
        self.out_degrees.insert(id, 0);
        self.sink_ops.insert(id);
        for t in &input_ids {
            self.link_consumer(*t, id);
        }
        if input_ids.is_empty() {
            self.source_ops.insert(id);
        }
        let handle = self.op_handle(id);
        self.add_in_deps(handle, &extra_deps)?;
        if is_trainable_var {
            self.parameter_ops.insert(id);
        }

        if let Some(sg) = self.subgraphs.current().map(str::to_string) {
            let op_type = if is_update {
                SubGraphOpType::Update
            } else if self.is_grad_ctx() {
                SubGraphOpType::Backward
            } else {
                self.subgraphs.current_op_type()
            };
            self.subgraphs.add(id, &sg, op_type)?;
        }

        trace!(graph = %self.name, op = %self.ops[&id].meta.name, id = %id, "make op");
        if matches!(self.state, GraphState::Eager) {
            self.eager_compute(id)?;
        } else if let GraphState::DefineAndRun(dar) = &mut self.state {
            if has_device_groups {
                dar.ops_with_device_groups.push(id);
            }
        }
        Ok(handle)
    }

    /// Attach control dependencies to `op`. A single dependency is linked
    /// directly; several are first folded into one `Group` op.
    pub fn add_in_deps(&mut self, op: Operator, deps: &[Tensor]) -> Result<()> {
        let id = self.check_op(op)?;
        if deps.is_empty() {
            return Ok(());
        }
        for d in deps {
            self.check_tensor(*d)?;
        }
        let linker = if let [single] = deps {
            single.id
        } else {
            let name = format!("{}_in_deps", self.ops[&id].meta.name);
            let group = self.make_op(OpKind::Group, deps.to_vec(), OpMeta::new().name(name))?;
            self.ops[&group.id].outputs[0]
        };
        self.op_def_mut(id)?.extra_in_deps.push(linker);
        self.link_consumer(linker, id);
        self.source_ops.remove(&id);
        Ok(())
    }

    fn check_replacement(&self, old: TensorId, new: TensorId, ignore_shape: bool) -> Result<()> {
        let (o, n) = (self.tensor_def(old)?, self.tensor_def(new)?);
        if n.producer.is_none() {
            bail_value!("replacement tensor {} is detached", n.name);
        }
        if !ignore_shape && o.meta.shape != n.meta.shape {
            bail_value!(
                "cannot replace {} of shape {:?} with {} of shape {:?}",
                o.name,
                o.meta.shape,
                n.name,
                n.meta.shape
            );
        }
        Ok(())
    }

    fn copy_symbolic_shape(&mut self, from: TensorId, to: TensorId) {
        let sym: Option<SymbolicShape> = self.tensors.get(&from).and_then(|t| t.meta.symbolic_shape.clone());
        if let (Some(sym), Some(t)) = (sym, self.tensors.get_mut(&to)) {
            t.meta.symbolic_shape = Some(sym);
        }
    }

    pub fn replace_input(
        &mut self,
        op: Operator,
        index: usize,
        new: Tensor,
        ignore_shape: bool,
    ) -> Result<()> {
        let id = self.check_op(op)?;
        let new = self.check_tensor(new)?;
        let def = self.op_def(id)?;
        let Some(&old) = def.inputs.get(index) else {
            bail_value!(
                "op {} has {} inputs, cannot replace input {index}",
                def.meta.name,
                def.inputs.len()
            );
        };
        self.check_replacement(old, new, ignore_shape)?;
        self.copy_symbolic_shape(old, new);
        self.op_def_mut(id)?.inputs[index] = new;
        self.unlink_consumer(old, id);
        self.link_consumer(new, id);
        Ok(())
    }

    pub fn replace_in_dep_linker(
        &mut self,
        op: Operator,
        index: usize,
        new: Tensor,
        ignore_shape: bool,
    ) -> Result<()> {
        let id = self.check_op(op)?;
        let new = self.check_tensor(new)?;
        let def = self.op_def(id)?;
        let Some(&old) = def.extra_in_deps.get(index) else {
            bail_value!(
                "op {} has {} in-dependency linkers, cannot replace linker {index}",
                def.meta.name,
                def.extra_in_deps.len()
            );
        };
        self.check_replacement(old, new, ignore_shape)?;
        self.copy_symbolic_shape(old, new);
        self.op_def_mut(id)?.extra_in_deps[index] = new;
        self.unlink_consumer(old, id);
        self.link_consumer(new, id);
        Ok(())
    }

    /// A tensor with no producer, to be adopted by [`Graph::replace_output`].
    pub fn make_detached_tensor(&mut self, name: &str, meta: TensorMeta) -> Tensor {
        let tid = self.next_tensor_id();
        self.tensors.insert(
            tid,
            TensorDef {
                id: tid,
                name: name.to_string(),
                graph_id: self.id,
                producer: None,
                output_index: 0,
                consumers: BTreeSet::new(),
                meta,
                ds_hierarchy: Default::default(),
                layout: None,
                is_grad: self.is_grad_ctx(),
                requires_grad: false,
            },
        );
        self.tensor_handle(tid)
    }

    /// Swap output `index` of `op` for the detached tensor `new`. The old
    /// output must have no consumers.
    pub fn replace_output(&mut self, op: Operator, index: usize, new: Tensor) -> Result<()> {
        let id = self.check_op(op)?;
        let new = self.check_tensor(new)?;
        let def = self.op_def(id)?;
        let Some(&old) = def.outputs.get(index) else {
            bail_value!(
                "op {} has {} outputs, cannot replace output {index}",
                def.meta.name,
                def.outputs.len()
            );
        };
        let (o, n) = (self.tensor_def(old)?, self.tensor_def(new)?);
        ensure!(
            o.consumers.is_empty(),
            "output {} still has {} consumers",
            o.name,
            o.consumers.len()
        );
        if n.producer.is_some() {
            bail_value!("replacement output {} already has a producer", n.name);
        }
        if o.meta.shape != n.meta.shape {
            bail_value!(
                "cannot replace output {} of shape {:?} with {} of shape {:?}",
                o.name,
                o.meta.shape,
                n.name,
                n.meta.shape
            );
        }
        self.copy_symbolic_shape(old, new);
        let t = self.tensor_def_mut(new)?;
        t.producer = Some(id);
        t.output_index = index;
        self.op_def_mut(id)?.outputs[index] = new;
        self.tensors.remove(&old);
        self.preserved.remove(&old);
        self.local_vars.remove(&old);
        Ok(())
    }

    /// Remove an op whose outputs nobody consumes.
    pub fn remove_op(&mut self, op: Operator) -> Result<()> {
        let id = self.check_op(op)?;
        let def = self.op_def(id)?;
        for t in &def.outputs {
            let t = &self.tensors[t];
            ensure!(
                t.consumers.is_empty(),
                "cannot remove {}: output {} still has consumers",
                def.meta.name,
                t.name
            );
        }
        let Some(def) = self.ops.remove(&id) else {
            bail_value!("op {id} does not exist");
        };
        let edges: BTreeSet<TensorId> = def.all_inputs().copied().collect();
        for t in edges {
            self.unlink_consumer(t, id);
        }
        for t in &def.outputs {
            self.tensors.remove(t);
            self.preserved.remove(t);
            self.local_vars.remove(t);
        }
        self.source_ops.remove(&id);
        self.sink_ops.remove(&id);
        self.parameter_ops.remove(&id);
        self.optimizer_variable_ops.remove(&id);
        self.out_degrees.remove(&id);
        self.subgraphs.remove(id);
        if let GraphState::DefineAndRun(dar) = &mut self.state {
            dar.forget_op(id, &def.outputs);
        }
        trace!(graph = %self.name, op = %def.meta.name, "remove op");
        Ok(())
    }

    fn check_variable(&self, op: Operator) -> Result<OpId> {
        let id = self.check_op(op)?;
        let def = self.op_def(id)?;
        if !def.kind.is_variable() {
            bail_value!("op {} of type {} is not a variable", def.meta.name, def.type_name());
        }
        Ok(id)
    }

    pub fn mark_as_parameter(&mut self, op: Operator) -> Result<()> {
        let id = self.check_variable(op)?;
        self.parameter_ops.insert(id);
        Ok(())
    }

    pub fn mark_as_optimizer_variable(&mut self, op: Operator) -> Result<()> {
        let id = self.check_variable(op)?;
        self.optimizer_variable_ops.insert(id);
        Ok(())
    }

    pub fn params(&self) -> Vec<Operator> {
        self.parameter_ops.iter().map(|id| self.op_handle(*id)).collect()
    }

    pub fn param_ids(&self) -> Vec<OpId> {
        self.parameter_ops.iter().copied().collect()
    }

    pub fn optimizer_variables(&self) -> Vec<Operator> {
        self.optimizer_variable_ops
            .iter()
            .map(|id| self.op_handle(*id))
            .collect()
    }

    pub fn params_and_opt_vars(&self) -> Vec<Operator> {
        self.parameter_ops
            .union(&self.optimizer_variable_ops)
            .map(|id| self.op_handle(*id))
            .collect()
    }

    pub(crate) fn is_parameter(&self, id: OpId) -> bool {
        self.parameter_ops.contains(&id)
    }

    pub(crate) fn is_optimizer_variable(&self, id: OpId) -> bool {
        self.optimizer_variable_ops.contains(&id)
    }

    pub fn set_symbolic_shape(&mut self, t: Tensor, sym: SymbolicShape) -> Result<()> {
        let id = self.check_tensor(t)?;
        let def = self.tensor_def_mut(id)?;
        if sym.rank() != def.meta.rank() {
            bail_value!(
                "symbolic shape of rank {} for tensor {} of shape {:?}",
                sym.rank(),
                def.name,
                def.meta.shape
            );
        }
        def.meta.symbolic_shape = Some(sym);
        Ok(())
    }

    /// Every tensor is an output of its producer and an input or linker of
    /// each of its consumers.
    pub fn check_consistency(&self) -> Result<()> {
        for (tid, t) in &self.tensors {
            if let Some(p) = t.producer {
                let op = self.op_def(p)?;
                ensure!(
                    op.outputs.get(t.output_index) == Some(tid),
                    "tensor {} is not output {} of its producer {}",
                    t.name,
                    t.output_index,
                    op.meta.name
                );
            }
            for c in &t.consumers {
                let op = self.op_def(*c)?;
                ensure!(
                    op.all_inputs().any(|x| x == tid),
                    "consumer {} does not reference tensor {}",
                    op.meta.name,
                    t.name
                );
            }
        }
        for (id, op) in &self.ops {
            for t in op.all_inputs() {
                ensure!(
                    self.tensor_def(*t)?.consumers.contains(id),
                    "op {} is missing from the consumers of {t}",
                    op.meta.name
                );
            }
            let degree: usize = op
                .outputs
                .iter()
                .map(|t| self.tensors[t].consumers.len())
                .sum();
            ensure!(self.out_degrees.get(id) == Some(&degree));
            ensure!(self.sink_ops.contains(id) == (degree == 0));
            ensure!(self.source_ops.contains(id) == (op.all_inputs().next().is_none()));
        }
        Ok(())
    }
}
