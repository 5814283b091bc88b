//! Plan-bound execution over a device mesh: SPMD op execution, micro-batch
//! scheduling and gradient accumulation.

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use tracing::{debug, info};

use crate::{
    bail_runtime, bail_value,
    comm::{CommBackend, Transfer},
    cpu_storage,
    op::{ComputeCtx, OpId, OpKind},
    switch::plan,
    DType, Layout, NDArray, Result, ShardedArray, Tensor, TensorId, TensorMeta,
};

use super::{define_and_run::StrategyKey, Graph, GraphState};

/// How far a run goes. Each level includes everything below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunLevel {
    /// Only compute and cache the topological order.
    Topo,
    /// Also allocate every variable.
    Alloc,
    /// Run the fetched ops, no gradient bookkeeping.
    ComputeOnly,
    /// Also accumulate the gradients the update ops consume.
    Grad,
    /// Also apply the update ops once with the accumulated gradients.
    Update,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub fetches: Vec<Tensor>,
    pub feed: Vec<(Tensor, NDArray)>,
    /// Splits each micro-batch into a forward and a backward phase.
    pub loss: Option<Tensor>,
    pub num_micro_batches: usize,
    pub compute_strategy_id: usize,
    pub optimize_strategy_id: usize,
    pub run_level: RunLevel,
    /// Factor applied to accumulated gradients before the update.
    pub grad_scale: f32,
}

impl RunOptions {
    pub fn new(fetches: Vec<Tensor>) -> Self {
        Self {
            fetches,
            feed: Vec::new(),
            loss: None,
            num_micro_batches: 1,
            compute_strategy_id: 0,
            optimize_strategy_id: 0,
            run_level: RunLevel::Update,
            grad_scale: 1.,
        }
    }

    pub fn feed(mut self, t: Tensor, value: NDArray) -> Self {
        self.feed.push((t, value));
        self
    }

    pub fn loss(mut self, loss: Tensor) -> Self {
        self.loss = Some(loss);
        self
    }

    pub fn micro_batches(mut self, n: usize) -> Self {
        self.num_micro_batches = n;
        self
    }

    pub fn strategy(mut self, compute: usize, optimize: usize) -> Self {
        self.compute_strategy_id = compute;
        self.optimize_strategy_id = optimize;
        self
    }

    pub fn run_level(mut self, level: RunLevel) -> Self {
        self.run_level = level;
        self
    }

    pub fn grad_scale(mut self, scale: f32) -> Self {
        self.grad_scale = scale;
        self
    }

    pub(crate) fn strategy_key(&self) -> StrategyKey {
        StrategyKey {
            compute: self.compute_strategy_id,
            optimize: self.optimize_strategy_id,
        }
    }
}

/// Global shape of every tensor for one combination of feed shapes.
pub(crate) type ShapePlan = HashMap<TensorId, Vec<usize>>;

/// Live shards of the tensors of one micro-batch.
pub(crate) type TensorValues = HashMap<TensorId, ShardedArray>;

type ShapePlanKey = Vec<(TensorId, Vec<usize>)>;

#[derive(Default)]
pub(crate) struct ExecutableState {
    pub(crate) strategy: StrategyKey,
    pub(crate) variables: HashMap<TensorId, ShardedArray>,
    /// Keyed by the gradient input of each update op.
    pub(crate) accumulated_grads: HashMap<TensorId, ShardedArray>,
    pub(crate) topo: Option<Vec<OpId>>,
    pub(crate) shape_plans: HashMap<ShapePlanKey, ShapePlan>,
    pub(crate) op_times: HashMap<OpId, Duration>,
}

impl Graph {
    pub(crate) fn exec_state(&self) -> Result<&ExecutableState> {
        match &self.state {
            GraphState::Executable(st) => Ok(st),
            _ => bail_runtime!("graph {} of type {} is not executable", self.name(), self.graph_type()),
        }
    }

    pub(crate) fn exec_state_mut(&mut self) -> Result<&mut ExecutableState> {
        match &mut self.state {
            GraphState::Executable(st) => Ok(st),
            _ => bail_runtime!("graph is not executable"),
        }
    }

    pub(crate) fn layout_of(&self, t: TensorId) -> Result<&Layout> {
        let def = self.tensor_def(t)?;
        match &def.layout {
            Some(l) => Ok(l),
            None => bail_runtime!("tensor {} has no layout", def.name),
        }
    }

    /// Strategy pair this executable graph was instantiated for.
    pub fn exec_strategy(&self) -> Result<StrategyKey> {
        Ok(self.exec_state()?.strategy)
    }

    /// Accumulated wall time per op over every run so far.
    pub fn op_times(&self) -> Result<&HashMap<OpId, Duration>> {
        Ok(&self.exec_state()?.op_times)
    }

    pub fn has_pending_grads(&self) -> Result<bool> {
        Ok(!self.exec_state()?.accumulated_grads.is_empty())
    }

    pub fn num_shape_plans(&self) -> Result<usize> {
        Ok(self.exec_state()?.shape_plans.len())
    }

    /// The cached global topological order, computing it on first use.
    pub(crate) fn exec_topo(&mut self) -> Result<Vec<OpId>> {
        if let Some(topo) = &self.exec_state()?.topo {
            return Ok(topo.clone());
        }
        let sinks = self.sink_op_ids();
        let topo = self.topo_sort_ids(&sinks, &|_| false)?;
        self.exec_state_mut()?.topo = Some(topo.clone());
        Ok(topo)
    }

    /// Global shapes of every op output in `topo` given the shapes fed to
    /// placeholders. Symbolic placeholder shapes are bound on the way.
    pub(crate) fn deduce_shape_plan(
        &self,
        topo: &[OpId],
        feed_shapes: &HashMap<TensorId, Vec<usize>>,
    ) -> Result<ShapePlan> {
        let mut plan = ShapePlan::new();
        for id in topo {
            let def = self.op_def(*id)?;
            match &def.kind {
                OpKind::Placeholder { .. } => {
                    let t = def.outputs[0];
                    let tdef = self.tensor_def(t)?;
                    let shape = feed_shapes.get(&t).cloned().unwrap_or_else(|| tdef.shape().to_vec());
                    if let Some(sym) = tdef.symbolic_shape() {
                        sym.bind(&shape)?;
                    }
                    plan.insert(t, shape);
                }
                OpKind::Variable { shape, .. } => {
                    plan.insert(def.outputs[0], shape.clone());
                }
                kind => {
                    let metas = def
                        .inputs
                        .iter()
                        .map(|t| {
                            let m = &self.tensor_def(*t)?.meta;
                            Ok(TensorMeta {
                                shape: plan.get(t).cloned().unwrap_or_else(|| m.shape.clone()),
                                ..m.clone()
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let refs: Vec<&TensorMeta> = metas.iter().collect();
                    for (t, m) in def.outputs.iter().zip(kind.infer_meta(&refs)?) {
                        plan.insert(*t, m.shape);
                    }
                }
            }
        }
        Ok(plan)
    }

    /// Materialize every variable that has no data yet onto its layout.
    pub(crate) fn alloc_exec_variables(&mut self) -> Result<()> {
        let mut fresh = Vec::new();
        {
            let st = self.exec_state()?;
            for def in self.ops.values() {
                let OpKind::Variable {
                    shape, dtype, init, ..
                } = &def.kind
                else {
                    continue;
                };
                let t = def.outputs[0];
                if st.variables.contains_key(&t) {
                    continue;
                }
                let value = NDArray::new(init.materialize(shape)?, shape, *dtype, crate::Device::host())?;
                fresh.push((t, plan::scatter(&value, self.layout_of(t)?)?));
            }
        }
        if !fresh.is_empty() {
            debug!(graph = %self.name(), count = fresh.len(), "allocated variables");
        }
        self.exec_state_mut()?.variables.extend(fresh);
        Ok(())
    }
}

fn shards_of<'a>(values: &'a TensorValues, t: TensorId, name: &str) -> Result<&'a ShardedArray> {
    match values.get(&t) {
        Some(s) => Ok(s),
        None => bail_runtime!("input {t} of {name} has not been computed"),
    }
}

fn placement_of(graph: &Graph, id: OpId) -> Result<crate::DeviceGroup> {
    let def = graph.op_def(id)?;
    match &def.placement {
        Some(g) => Ok(g.clone()),
        None => bail_runtime!("op {} has no placement", def.meta.name),
    }
}

/// Execute one op of an executable graph, reading its inputs from and
/// writing its outputs to `values`.
pub(crate) fn execute_op(
    graph: &Graph,
    id: OpId,
    values: &mut TensorValues,
    shapes: &ShapePlan,
    comm: &dyn CommBackend,
) -> Result<()> {
    let def = graph.op_def(id)?;
    let name = def.meta.name.as_str();
    let shape_of = |t: TensorId| -> Result<Vec<usize>> {
        match shapes.get(&t) {
            Some(s) => Ok(s.clone()),
            None => Ok(graph.tensor_def(t)?.shape().to_vec()),
        }
    };
    match &def.kind {
        OpKind::Placeholder { .. } => {
            if !values.contains_key(&def.outputs[0]) {
                bail_value!("placeholder {name} is not fed");
            }
        }
        OpKind::Variable { .. } => {
            if !values.contains_key(&def.outputs[0]) {
                bail_runtime!("variable {name} has no data");
            }
        }
        OpKind::Group => {
            let out: ShardedArray = placement_of(graph, id)?
                .devices()
                .iter()
                .map(|d| (*d, NDArray::zeros(&[], DType::Bool, *d)))
                .collect();
            values.insert(def.outputs[0], out);
        }
        OpKind::Comm { .. } => {
            let (x, y) = (def.inputs[0], def.outputs[0]);
            let moved = plan::redistribute(
                &shape_of(y)?,
                shards_of(values, x, name)?,
                graph.layout_of(x)?,
                graph.layout_of(y)?,
                comm,
            )?;
            values.insert(y, moved);
        }
        OpKind::BatchedISendIRecv { dst_devices } => {
            let mut transfers = Vec::with_capacity(def.inputs.len());
            for (t, dst) in def.inputs.iter().zip(dst_devices) {
                let shards = shards_of(values, *t, name)?;
                let Some((src, data)) = shards.iter().next() else {
                    bail_runtime!("input {t} of {name} holds no shard");
                };
                if shards.len() != 1 {
                    bail_value!("{name} sends single-device tensors, {t} has {} shards", shards.len());
                }
                transfers.push(Transfer {
                    src: *src,
                    dst: *dst,
                    data: data.clone(),
                });
            }
            let received = comm.batched_isend_irecv(transfers)?;
            for ((t, dst), arr) in def.outputs.iter().zip(dst_devices).zip(received) {
                values.insert(*t, ShardedArray::from([(*dst, arr)]));
            }
        }
        OpKind::Assemble { offsets, .. } => {
            let y = def.outputs[0];
            let layout = graph.layout_of(y)?;
            let shape = shape_of(y)?;
            let dtype = graph.tensor_def(y)?.dtype();
            let mut out = ShardedArray::new();
            for (j, dev) in layout.group.devices().iter().enumerate() {
                let local = layout.ds.local_region(&shape, j)?.size;
                let mut arr = NDArray::zeros(&local, dtype, *dev);
                for (t, offset) in def.inputs.iter().zip(offsets) {
                    if let Some(piece) = shards_of(values, *t, name)?.get(dev) {
                        arr.add_at(offset, piece)?;
                    }
                }
                out.insert(*dev, arr);
            }
            values.insert(y, out);
        }
        kind => {
            let group = placement_of(graph, id)?;
            let threads = graph.config.kernel_threads;
            let mut outs: Vec<ShardedArray> = vec![ShardedArray::new(); def.outputs.len()];
            for dev in group.devices() {
                let mut inputs = Vec::with_capacity(def.inputs.len());
                for t in &def.inputs {
                    match shards_of(values, *t, name)?.get(dev) {
                        Some(a) => inputs.push(a),
                        None => bail_runtime!("input {t} of {name} has no shard on {dev}"),
                    }
                }
                let results = kind.compute(&inputs, &ComputeCtx::new(*dev, threads))?;
                for (k, arr) in results.into_iter().enumerate() {
                    outs[k].insert(*dev, arr);
                }
            }
            for (t, shards) in def.outputs.iter().zip(&outs) {
                let layout = graph.layout_of(*t)?;
                let expected = layout.ds.local_shape(&shape_of(*t)?)?;
                for (dev, arr) in shards {
                    crate::ensure!(
                        arr.shape() == expected.as_slice(),
                        "{name} produced local shape {:?} on {dev}, layout {:?} expects {expected:?}",
                        arr.shape(),
                        layout.ds
                    );
                }
            }
            for (t, shards) in def.outputs.iter().zip(outs) {
                values.insert(*t, shards);
            }
        }
    }
    Ok(())
}

fn accumulate(acc: &mut HashMap<TensorId, ShardedArray>, t: TensorId, shards: &ShardedArray) -> Result<()> {
    let Some(sum) = acc.get_mut(&t) else {
        acc.insert(t, shards.clone());
        return Ok(());
    };
    for (dev, arr) in shards {
        match sum.get_mut(dev) {
            Some(s) => s.add_at(&vec![0; arr.shape().len()], arr)?,
            None => {
                sum.insert(*dev, arr.clone());
            }
        }
    }
    Ok(())
}

fn scaled(shards: &ShardedArray, scale: f32) -> ShardedArray {
    if scale == 1. {
        return shards.clone();
    }
    shards
        .iter()
        .map(|(d, a)| {
            let data = cpu_storage::map_unary(a.data(), move |x| x * scale);
            (*d, NDArray::from_parts(data, a.shape().to_vec(), a))
        })
        .collect()
}

impl Graph {
    fn run_ops(
        &mut self,
        order: &[OpId],
        values: &mut TensorValues,
        shapes: &ShapePlan,
        comm: &dyn CommBackend,
    ) -> Result<()> {
        let mut times = Vec::with_capacity(order.len());
        for id in order {
            let start = Instant::now();
            execute_op(self, *id, values, shapes, comm)?;
            times.push((*id, start.elapsed()));
        }
        let st = self.exec_state_mut()?;
        for (id, d) in times {
            *st.op_times.entry(id).or_default() += d;
        }
        Ok(())
    }

    fn shape_plan_for(&mut self, topo: &[OpId], feed_shapes: HashMap<TensorId, Vec<usize>>) -> Result<ShapePlan> {
        let mut key: ShapePlanKey = feed_shapes.iter().map(|(t, s)| (*t, s.clone())).collect();
        key.sort();
        if let Some(plan) = self.exec_state()?.shape_plans.get(&key) {
            return Ok(plan.clone());
        }
        let plan = self.deduce_shape_plan(topo, &feed_shapes)?;
        debug!(graph = %self.name(), "new shape plan");
        self.exec_state_mut()?.shape_plans.insert(key, plan.clone());
        Ok(plan)
    }

    /// Run an executable graph. Fetches are returned as global host arrays;
    /// per-micro-batch fetches are concatenated along the leading axis.
    #[tracing::instrument(skip_all, fields(graph = %self.name(), level = ?opts.run_level))]
    pub(crate) fn run_executable(
        &mut self,
        opts: &RunOptions,
        comm: &dyn CommBackend,
    ) -> Result<Vec<NDArray>> {
        self.exec_state()?;
        let n = opts.num_micro_batches;
        if n == 0 || n > self.config.max_micro_batches {
            bail_value!(
                "num_micro_batches must be in 1..={}, got {n}",
                self.config.max_micro_batches
            );
        }
        let topo = self.exec_topo()?;
        if opts.run_level == RunLevel::Topo {
            return Ok(Vec::new());
        }
        self.alloc_exec_variables()?;
        if opts.run_level == RunLevel::Alloc {
            return Ok(Vec::new());
        }

        let fetch_ids = opts
            .fetches
            .iter()
            .map(|t| self.check_tensor(*t))
            .collect::<Result<Vec<_>>>()?;
        let update_ops: Vec<OpId> = topo
            .iter()
            .copied()
            .filter(|id| self.ops[id].kind.is_optimizer_update())
            .collect();
        let update_outputs: HashSet<TensorId> = update_ops
            .iter()
            .flat_map(|id| self.ops[id].outputs.iter().copied())
            .collect();
        if opts.run_level < RunLevel::Update {
            if let Some(t) = fetch_ids.iter().find(|t| update_outputs.contains(t)) {
                bail_value!(
                    "fetching update output {} needs run level Update, got {:?}",
                    self.tensor_def(*t)?.name,
                    opts.run_level
                );
            }
        }
        let grad_inputs: Vec<TensorId> = update_ops
            .iter()
            .filter_map(|id| self.ops[id].inputs.get(1).copied())
            .collect();

        let mut targets: Vec<TensorId> = fetch_ids.clone();
        if opts.run_level >= RunLevel::Grad {
            targets.extend(&grad_inputs);
        }
        if let Some(loss) = opts.loss {
            targets.push(self.check_tensor(loss)?);
        }
        let needed = self.ancestors(&targets)?;
        let order: Vec<OpId> = topo
            .iter()
            .copied()
            .filter(|id| needed.contains(id) && !self.ops[id].kind.is_optimizer_update())
            .collect();
        let (fwd, bwd) = match opts.loss {
            Some(loss) => self.split_by_loss_ids(&order, &[loss.id])?,
            None => (order.clone(), Vec::new()),
        };

        // Feeds, cut into micro-batches.
        let mut feeds: Vec<(TensorId, Vec<NDArray>)> = Vec::with_capacity(opts.feed.len());
        for (t, v) in &opts.feed {
            let id = self.check_tensor(*t)?;
            if !self.tensor_def(id)?.producer.map(|p| self.ops[&p].kind.is_placeholder()).unwrap_or(false) {
                bail_value!("can only feed placeholders, {} is not one", self.tensor_def(id)?.name);
            }
            let chunks = if n == 1 { vec![v.clone()] } else { v.chunk(n)? };
            feeds.push((id, chunks));
        }

        let variables = self.exec_state()?.variables.clone();
        let mut micro: Vec<TensorValues> = Vec::with_capacity(n);
        let mut plans: Vec<ShapePlan> = Vec::with_capacity(n);
        for i in 0..n {
            let feed_shapes = feeds
                .iter()
                .map(|(t, chunks)| (*t, chunks[i].shape().to_vec()))
                .collect();
            let shapes = self.shape_plan_for(&topo, feed_shapes)?;
            let mut values = TensorValues::new();
            for (t, chunks) in &feeds {
                values.insert(*t, plan::scatter(&chunks[i], self.layout_of(*t)?)?);
            }
            for (t, shards) in &variables {
                values.insert(*t, shards.clone());
            }
            micro.push(values);
            plans.push(shapes);
        }

        // GPipe: every forward, then every backward.
        for (i, values) in micro.iter_mut().enumerate() {
            debug!(micro_batch = i, num_ops = fwd.len(), "forward");
            self.run_ops(&fwd, values, &plans[i], comm)?;
        }
        if !bwd.is_empty() {
            for (i, values) in micro.iter_mut().enumerate() {
                debug!(micro_batch = i, num_ops = bwd.len(), "backward");
                self.run_ops(&bwd, values, &plans[i], comm)?;
            }
        }

        if opts.run_level >= RunLevel::Grad {
            let st = self.exec_state_mut()?;
            for values in &micro {
                for t in &grad_inputs {
                    if let Some(g) = values.get(t) {
                        accumulate(&mut st.accumulated_grads, *t, g)?;
                    }
                }
            }
        }

        let mut update_values = TensorValues::new();
        if opts.run_level == RunLevel::Update && !update_ops.is_empty() {
            update_values = self.apply_updates(&update_ops, opts.grad_scale, comm)?;
        }

        let mut out = Vec::with_capacity(fetch_ids.len());
        for t in &fetch_ids {
            let layout = self.layout_of(*t)?;
            let value = if let Some(shards) = self.exec_state()?.variables.get(t) {
                plan::gather(self.tensor_def(*t)?.shape(), shards, layout)?
            } else if let Some(shards) = update_values.get(t) {
                plan::gather(self.tensor_def(*t)?.shape(), shards, layout)?
            } else {
                let mut parts = Vec::with_capacity(n);
                for (values, shapes) in micro.iter().zip(&plans) {
                    let shape = shapes
                        .get(t)
                        .cloned()
                        .unwrap_or_else(|| self.tensors[t].meta.shape.clone());
                    parts.push(plan::gather(&shape, shards_of(values, *t, "fetch")?, layout)?);
                }
                if parts.len() == 1 {
                    parts.remove(0)
                } else {
                    NDArray::concat(&parts)?
                }
            };
            out.push(value);
        }
        Ok(out)
    }

    /// Run every update op once on the accumulated gradients and write the
    /// results back into the variables they overwrite.
    fn apply_updates(
        &mut self,
        update_ops: &[OpId],
        grad_scale: f32,
        comm: &dyn CommBackend,
    ) -> Result<TensorValues> {
        let st = self.exec_state()?;
        let mut values: TensorValues = st.variables.clone();
        for id in update_ops {
            let def = &self.ops[id];
            let Some(g) = def.inputs.get(1) else {
                bail_runtime!("update op {} has no gradient input", def.meta.name);
            };
            match st.accumulated_grads.get(g) {
                Some(acc) => {
                    values.insert(*g, scaled(acc, grad_scale));
                }
                None => bail_runtime!(
                    "no gradient accumulated for {}; run at level Grad or above first",
                    def.meta.name
                ),
            }
        }
        let shapes = ShapePlan::new();
        self.run_ops(update_ops, &mut values, &shapes, comm)?;

        let mut write_back = Vec::new();
        for id in update_ops {
            let def = &self.ops[id];
            for (out, input) in def.kind.mutated_inputs(def.inputs.len()) {
                write_back.push((def.inputs[input], def.outputs[out]));
            }
        }
        let st = self.exec_state_mut()?;
        for (var, out) in write_back {
            if st.variables.contains_key(&var) {
                if let Some(v) = values.get(&out) {
                    st.variables.insert(var, v.clone());
                }
            }
        }
        st.accumulated_grads.clear();
        info!(num_updates = update_ops.len(), "applied updates");
        Ok(values)
    }
}
