//! Staged graphs and their instantiation into executable graphs.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::{
    bail_not_implemented, bail_runtime, bail_value,
    cpu_storage::Initializer,
    op::{CommTarget, OpId, OpKind, OpMeta, OperatorDef},
    switch::{SwitchExecGraph, SwitchKey},
    Device, DeviceGroup, DistributedStates, DistributedStatesHierarchy, Layout, Result, TensorId,
    TensorMeta,
};

use super::{Graph, GraphId, GraphState};

/// The pair of strategy ids an executable graph is instantiated for.
/// Optimizer updates and optimizer state use `optimize`, everything else
/// `compute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StrategyKey {
    pub compute: usize,
    pub optimize: usize,
}

impl StrategyKey {
    pub fn new(compute: usize, optimize: usize) -> Self {
        Self { compute, optimize }
    }
}

/// Binds one executable graph to the strategy pair it was instantiated for.
#[derive(Debug, Clone)]
pub struct ExecGraphPlan {
    pub(crate) exec_graph: GraphId,
    pub(crate) strategy: StrategyKey,
    pub(crate) op_mapping: HashMap<OpId, OpId>,
    pub(crate) tensor_mapping: HashMap<TensorId, TensorId>,
    pub(crate) reverse_tensor_mapping: HashMap<TensorId, TensorId>,
    /// Logical topological order at instantiation time.
    pub(crate) topo: Vec<OpId>,
    /// Stage groups of each pipeline under the compute strategy.
    pub(crate) pipelines: Vec<Vec<DeviceGroup>>,
    /// Op id watermark of the staged graph when this plan was built.
    pub(crate) version: u64,
}

impl ExecGraphPlan {
    pub fn exec_graph(&self) -> GraphId {
        self.exec_graph
    }

    pub fn strategy(&self) -> StrategyKey {
        self.strategy
    }

    pub fn map_op(&self, op: OpId) -> Option<OpId> {
        self.op_mapping.get(&op).copied()
    }

    pub fn map_tensor(&self, t: TensorId) -> Option<TensorId> {
        self.tensor_mapping.get(&t).copied()
    }

    pub fn unmap_tensor(&self, t: TensorId) -> Option<TensorId> {
        self.reverse_tensor_mapping.get(&t).copied()
    }

    pub fn topo(&self) -> &[OpId] {
        &self.topo
    }

    pub fn pipelines(&self) -> &[Vec<DeviceGroup>] {
        &self.pipelines
    }
}

#[derive(Default)]
pub(crate) struct DefineAndRunState {
    pub(crate) plans: Vec<ExecGraphPlan>,
    pub(crate) active: Option<usize>,
    /// Data registered for variables, used by every later instantiation.
    pub(crate) initializers: HashMap<TensorId, Initializer>,
    pub(crate) ops_with_device_groups: Vec<OpId>,
    pub(crate) default_group: Option<DeviceGroup>,
    pub(crate) param_switchers: HashMap<SwitchKey, SwitchExecGraph>,
    pub(crate) grad_switchers: HashMap<SwitchKey, SwitchExecGraph>,
}

impl DefineAndRunState {
    pub(crate) fn active_plan(&self) -> Option<&ExecGraphPlan> {
        self.active.and_then(|i| self.plans.get(i))
    }

    pub(crate) fn default_group(&self) -> DeviceGroup {
        self.default_group
            .clone()
            .unwrap_or_else(|| DeviceGroup::single(Device::host()))
    }

    /// Drop a removed op from the mappings of the active plan.
    pub(crate) fn forget_op(&mut self, op: OpId, outputs: &[TensorId]) {
        let Some(plan) = self.active.and_then(|i| self.plans.get_mut(i)) else {
            return;
        };
        plan.op_mapping.remove(&op);
        for t in outputs {
            if let Some(e) = plan.tensor_mapping.remove(t) {
                plan.reverse_tensor_mapping.remove(&e);
            }
        }
    }
}

impl Graph {
    pub(crate) fn dar_state(&self) -> Result<&DefineAndRunState> {
        match &self.state {
            GraphState::DefineAndRun(st) => Ok(st),
            _ => bail_runtime!(
                "graph {} of type {} is not define-and-run",
                self.name(),
                self.graph_type()
            ),
        }
    }

    pub(crate) fn dar_state_mut(&mut self) -> Result<&mut DefineAndRunState> {
        match &mut self.state {
            GraphState::DefineAndRun(st) => Ok(st),
            _ => bail_runtime!("graph is not define-and-run"),
        }
    }

    /// Placement for ops without a device-group hierarchy and no placed input.
    pub fn set_default_device_group(&mut self, group: DeviceGroup) -> Result<()> {
        self.dar_state_mut()?.default_group = Some(group);
        Ok(())
    }

    pub fn exec_plans(&self) -> Result<&[ExecGraphPlan]> {
        Ok(&self.dar_state()?.plans)
    }

    pub fn active_exec_plan(&self) -> Result<Option<&ExecGraphPlan>> {
        Ok(self.dar_state()?.active_plan())
    }

    pub fn ops_with_device_groups(&self) -> Result<&[OpId]> {
        Ok(&self.dar_state()?.ops_with_device_groups)
    }

    pub fn num_switchers(&self) -> Result<(usize, usize)> {
        let st = self.dar_state()?;
        Ok((st.param_switchers.len(), st.grad_switchers.len()))
    }
}

fn same_layout(a: &Layout, b: &Layout) -> bool {
    a.group == b.group && a.ds.same_layout(&b.ds)
}

/// Strategy id an op of the staged graph is placed under.
fn strategy_of(dar: &Graph, def: &OperatorDef, key: StrategyKey) -> usize {
    if def.kind.is_optimizer_update() || dar.is_optimizer_variable(def.id) {
        key.optimize
    } else {
        key.compute
    }
}

fn explicit_group(def: &OperatorDef, strategy: usize) -> Result<Option<DeviceGroup>> {
    let h = &def.meta.device_group_hierarchy;
    if h.is_empty() {
        return Ok(None);
    }
    match h.get(strategy) {
        Some(u) => Ok(Some(u.merged())),
        None => bail_value!(
            "op {} has device groups for {} strategies, strategy {strategy} requested",
            def.meta.name,
            h.len()
        ),
    }
}

fn states_for(h: &DistributedStatesHierarchy, strategy: usize, name: &str) -> Result<Option<DistributedStates>> {
    if h.is_empty() {
        return Ok(None);
    }
    match h.get(strategy) {
        Some(u) => Ok(Some(u.merged()?)),
        None => bail_value!(
            "{name} has distributed states for {} strategies, strategy {strategy} requested",
            h.len()
        ),
    }
}

/// Layout of a placeholder or variable of the staged graph under `strategy`.
pub(crate) fn source_layout(
    def: &OperatorDef,
    strategy: usize,
    default_group: &DeviceGroup,
) -> Result<Layout> {
    let group = explicit_group(def, strategy)?.unwrap_or_else(|| default_group.clone());
    let ds = states_for(&def.meta.ds_hierarchy, strategy, &def.meta.name)?
        .unwrap_or_else(|| DistributedStates::duplicate(group.num_devices()));
    if ds.device_num() != group.num_devices() {
        bail_value!(
            "{} is partitioned over {} devices but placed on {} ({} devices)",
            def.meta.name,
            ds.device_num(),
            group,
            group.num_devices()
        );
    }
    Ok(Layout::new(group, ds))
}

/// Layout a tensor takes when it moves onto `group`: the same partitioning if
/// the device counts agree, replicas otherwise.
fn moved_layout(from: &Layout, group: &DeviceGroup) -> Layout {
    if from.group.num_devices() == group.num_devices() {
        Layout::new(group.clone(), from.ds.clone())
    } else {
        Layout::replicated(group.clone())
    }
}

struct Instantiation<'a> {
    dar: &'a Graph,
    exec: &'a mut Graph,
    key: StrategyKey,
    default_group: DeviceGroup,
    op_map: HashMap<OpId, OpId>,
    t_map: HashMap<TensorId, TensorId>,
    /// Optimizer variable op -> parameter op it belongs to.
    opt_var_param: HashMap<OpId, OpId>,
}

impl Instantiation<'_> {
    fn mapped(&self, t: TensorId) -> Result<TensorId> {
        match self.t_map.get(&t) {
            Some(e) => Ok(*e),
            None => bail_runtime!("tensor {t} is used before it was instantiated"),
        }
    }

    fn exec_layout(&self, t: TensorId) -> Result<Layout> {
        Ok(self.exec.layout_of(t)?.clone())
    }

    /// Make an exec op, place it and lay out its outputs.
    fn emit(
        &mut self,
        kind: OpKind,
        inputs: Vec<TensorId>,
        meta: OpMeta,
        placement: DeviceGroup,
        layouts: Vec<Layout>,
    ) -> Result<OpId> {
        let handles = inputs.iter().map(|t| self.exec.tensor_handle(*t)).collect();
        let op = self.exec.make_op(kind, handles, meta)?;
        let def = self.exec.op_def_mut(op.id)?;
        def.placement = Some(placement);
        let outputs = def.outputs.clone();
        if outputs.len() != layouts.len() {
            bail_runtime!("{} outputs but {} layouts", outputs.len(), layouts.len());
        }
        for (t, layout) in outputs.iter().zip(layouts) {
            self.exec.tensor_def_mut(*t)?.layout = Some(layout);
        }
        Ok(op.id)
    }

    /// Reshard exec tensor `t` onto `dst` unless it is already there.
    fn reshard(&mut self, t: TensorId, dst: &Layout, name: String) -> Result<TensorId> {
        let src = self.exec_layout(t)?;
        if same_layout(&src, dst) {
            return Ok(t);
        }
        debug!(tensor = %t, from = %src.group, to = %dst.group, "insert comm");
        let kind = OpKind::Comm {
            dst: CommTarget::States(DistributedStatesHierarchy::uniform(dst.ds.clone(), 1)),
        };
        let op = self.emit(
            kind,
            vec![t],
            OpMeta::new().name(name),
            dst.group.clone(),
            vec![dst.clone()],
        )?;
        Ok(self.exec.op_def(op)?.outputs[0])
    }

    fn param_layout_of_opt_var(&self, id: OpId) -> Result<Option<Layout>> {
        let Some(param) = self.opt_var_param.get(&id) else {
            return Ok(None);
        };
        let pdef = self.dar.op_def(*param)?;
        let s = strategy_of(self.dar, pdef, self.key);
        Ok(Some(source_layout(pdef, s, &self.default_group)?))
    }

    fn instantiate_op(&mut self, id: OpId) -> Result<()> {
        let dar = self.dar;
        let def = dar.op_def(id)?;
        let s = strategy_of(dar, def, self.key);
        let name = def.meta.name.clone();
        let meta = OpMeta {
            extra_deps: Vec::new(),
            ..def.meta.clone()
        };
        let inputs = def
            .inputs
            .iter()
            .map(|t| self.mapped(*t))
            .collect::<Result<Vec<_>>>()?;

        let exec_op = match &def.kind {
            OpKind::Placeholder { .. } | OpKind::Variable { .. } => {
                let mut layout = source_layout(def, s, &self.default_group)?;
                if let Some(p) = self.param_layout_of_opt_var(id)? {
                    let explicit = states_for(&def.meta.ds_hierarchy, s, &name)?;
                    if let Some(ds) = explicit {
                        if !ds.same_layout(&p.ds) {
                            bail_value!(
                                "optimizer variable {name} is partitioned as {ds:?} but its parameter as {:?}",
                                p.ds
                            );
                        }
                    }
                    layout = p;
                }
                let mut kind = def.kind.clone();
                if let OpKind::Variable { init, .. } = &mut kind {
                    if let Some(registered) = self.dar_initializer(def.outputs[0])? {
                        *init = registered;
                    }
                }
                Some(self.emit(kind, vec![], meta, layout.group.clone(), vec![layout])?)
            }
            OpKind::Comm { dst } => {
                let x = inputs[0];
                let src = self.exec_layout(x)?;
                let target = match dst {
                    CommTarget::States(h) => {
                        let group = explicit_group(def, s)?.unwrap_or_else(|| src.group.clone());
                        let Some(ds) = states_for(h, s, &name)? else {
                            bail_value!("comm op {name} has no target states");
                        };
                        if ds.device_num() != group.num_devices() {
                            bail_value!(
                                "comm op {name} targets {} devices on group {group}",
                                ds.device_num()
                            );
                        }
                        Layout::new(group, ds)
                    }
                    CommTarget::LikeTensor(t) => {
                        let like = self.mapped(*t)?;
                        self.exec_layout(like)?
                    }
                };
                if same_layout(&src, &target) {
                    debug!(op = %name, "comm op is an identity, elided");
                    self.t_map.insert(def.outputs[0], x);
                    None
                } else {
                    let kind = OpKind::Comm {
                        dst: CommTarget::States(DistributedStatesHierarchy::uniform(target.ds.clone(), 1)),
                    };
                    Some(self.emit(kind, inputs, meta, target.group.clone(), vec![target])?)
                }
            }
            OpKind::Group => {
                let group = match inputs.first() {
                    Some(t) => self.exec_layout(*t)?.group,
                    None => self.default_group.clone(),
                };
                let layout = Layout::replicated(group.clone());
                Some(self.emit(OpKind::Group, inputs, meta, group, vec![layout])?)
            }
            OpKind::BatchedISendIRecv { .. } | OpKind::Assemble { .. } => {
                bail_not_implemented!("instantiating {} from a staged graph", def.type_name())
            }
            OpKind::SgdUpdate { .. } => {
                let param = self.exec_layout(inputs[0])?;
                let mut args = vec![inputs[0]];
                for (i, t) in inputs.iter().enumerate().skip(1) {
                    args.push(self.reshard(*t, &param, format!("{name}_comm_{i}"))?);
                }
                let layouts = vec![param.clone(); def.outputs.len()];
                Some(self.emit(def.kind.clone(), args, meta, param.group.clone(), layouts)?)
            }
            kind => {
                let group = match explicit_group(def, s)? {
                    Some(g) => g,
                    None => match inputs.first() {
                        Some(t) => self.exec_layout(*t)?.group,
                        None => self.default_group.clone(),
                    },
                };
                let mut args = Vec::with_capacity(inputs.len());
                for (i, t) in inputs.iter().enumerate() {
                    let src = self.exec_layout(*t)?;
                    if src.group == group {
                        args.push(*t);
                    } else {
                        let dst = moved_layout(&src, &group);
                        args.push(self.reshard(*t, &dst, format!("{name}_comm_{i}"))?);
                    }
                }
                let ds_in = args
                    .iter()
                    .map(|t| Ok(self.exec.layout_of(*t)?.ds.clone()))
                    .collect::<Result<Vec<_>>>()?;
                let metas: Vec<TensorMeta> = args
                    .iter()
                    .map(|t| Ok(self.exec.tensor_def(*t)?.meta.clone()))
                    .collect::<Result<Vec<_>>>()?;
                let ds_refs: Vec<&DistributedStates> = ds_in.iter().collect();
                let meta_refs: Vec<&TensorMeta> = metas.iter().collect();
                let ds_out = kind.deduce_states(&ds_refs, &meta_refs, def.outputs.len())?;
                let mut layouts = Vec::with_capacity(ds_out.len());
                for ds in ds_out {
                    if ds.device_num() != group.num_devices() {
                        bail_value!(
                            "{name} deduced states over {} devices but is placed on {group}",
                            ds.device_num()
                        );
                    }
                    layouts.push(Layout::new(group.clone(), ds));
                }
                Some(self.emit(kind.clone(), args, meta, group, layouts)?)
            }
        };

        let Some(exec_op) = exec_op else {
            return Ok(());
        };
        self.op_map.insert(id, exec_op);
        let exec_outputs = self.exec.op_def(exec_op)?.outputs.clone();
        for (t, e) in def.outputs.iter().zip(&exec_outputs) {
            self.t_map.insert(*t, *e);
            let src = dar.tensor_def(*t)?;
            let (is_grad, requires_grad, sym) = (src.is_grad, src.requires_grad, src.meta.symbolic_shape.clone());
            let dst = self.exec.tensor_def_mut(*e)?;
            dst.is_grad = is_grad;
            dst.requires_grad = requires_grad;
            dst.ds_hierarchy = src.ds_hierarchy.clone();
            if sym.is_some() {
                dst.meta.symbolic_shape = sym;
            }
        }
        let handle = self.exec.op_handle(exec_op);
        for linker in &def.extra_in_deps {
            let l = self.mapped(*linker)?;
            let l = self.exec.tensor_handle(l);
            self.exec.add_in_deps(handle, &[l])?;
        }
        if dar.is_parameter(id) {
            self.exec.mark_as_parameter(handle)?;
        }
        if dar.is_optimizer_variable(id) {
            self.exec.mark_as_optimizer_variable(handle)?;
        }
        if let Some((sg, op_type)) = dar.subgraphs.entry_of(id) {
            self.exec.subgraphs.add(exec_op, sg, op_type)?;
        }
        Ok(())
    }

    fn dar_initializer(&self, t: TensorId) -> Result<Option<Initializer>> {
        Ok(self.dar.dar_state()?.initializers.get(&t).cloned())
    }
}

/// Clone the staged graph `dar` into the empty executable graph `exec`,
/// placing every op under the strategy pair `key`.
#[tracing::instrument(skip_all, fields(graph = %dar.name(), compute = key.compute, optimize = key.optimize))]
pub(crate) fn instantiate(dar: &Graph, exec: &mut Graph, key: StrategyKey) -> Result<ExecGraphPlan> {
    let st = dar.dar_state()?;
    exec.exec_state()?;
    let topo = dar.topo_sort_ids(&dar.sink_op_ids(), &|_| false)?;

    let mut opt_var_param = HashMap::new();
    for id in &topo {
        let def = dar.op_def(*id)?;
        if !def.kind.is_optimizer_update() {
            continue;
        }
        let producer = |i: usize| def.inputs.get(i).and_then(|t| dar.tensors.get(t)).and_then(|t| t.producer);
        if let (Some(p), Some(v)) = (producer(0), producer(2)) {
            if dar.op_def(v)?.kind.is_variable() {
                opt_var_param.insert(v, p);
            }
        }
    }

    for sg in dar.subgraphs.iter() {
        exec.make_subgraph_global(sg.global_name(), sg.subgraph_type(), sg.module_type())?;
    }

    let mut inst = Instantiation {
        dar,
        exec,
        key,
        default_group: st.default_group(),
        op_map: HashMap::new(),
        t_map: HashMap::new(),
        opt_var_param,
    };
    for id in &topo {
        inst.instantiate_op(*id)?;
    }

    let mut pipelines: Vec<Vec<DeviceGroup>> = Vec::new();
    for id in &topo {
        let Some(u) = dar.op_def(*id)?.meta.device_group_hierarchy.get(key.compute) else {
            continue;
        };
        for (k, g) in u.groups().iter().enumerate() {
            if pipelines.len() <= k {
                pipelines.resize_with(k + 1, Vec::new);
            }
            if !pipelines[k].contains(g) {
                pipelines[k].push(g.clone());
            }
        }
    }

    let Instantiation { op_map, t_map, .. } = inst;
    exec.exec_state_mut()?.strategy = key;
    exec.exec_topo()?;
    let reverse: HashMap<TensorId, TensorId> = t_map
        .iter()
        .map(|(l, e)| (*e, *l))
        .collect::<HashMap<_, _>>();
    let elided = t_map.len() - reverse.len();
    info!(
        exec = %exec.name(),
        num_ops = exec.num_ops(),
        elided,
        "instantiated executable graph"
    );
    Ok(ExecGraphPlan {
        exec_graph: exec.id(),
        strategy: key,
        op_mapping: op_map,
        tensor_mapping: t_map,
        reverse_tensor_mapping: reverse,
        topo,
        pipelines,
        version: dar.peek_next_op_id(),
    })
}

/// Tensors of the staged graph whose data must survive a strategy switch.
pub(crate) fn stateful_tensors(dar: &Graph) -> Result<Vec<TensorId>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for op in dar.params_and_opt_vars() {
        for t in &dar.op_def(op.id)?.outputs {
            if seen.insert(*t) {
                out.push(*t);
            }
        }
    }
    Ok(out)
}
