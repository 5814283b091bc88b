//! Owner of every graph of a process: ids, names, default graphs, the graph
//! context stack and cross-graph work such as instantiation and strategy
//! switching.

use std::{collections::HashMap, rc::Rc};

use tracing::{debug, info};

use crate::{
    bail_runtime, bail_value,
    cpu_storage::Initializer,
    ensure,
    op::{OpKind, OpMeta, Operator},
    switch::switch_exec_graphs,
    CommBackend, EngineConfig, Error, LocalComm, NDArray, Result, Tensor,
};

use super::{instantiate, ExecGraphPlan, Graph, GraphId, GraphState, GraphType, RunOptions, StrategyKey};

pub struct GraphRegistry {
    /// Indexed by graph id. Deleted graphs and ids reserved for switch graphs
    /// are `None`.
    graphs: Vec<Option<Graph>>,
    names: HashMap<String, GraphId>,
    config: EngineConfig,
    comm: Rc<dyn CommBackend>,
    default_eager: Option<GraphId>,
    default_define_by_run: Option<GraphId>,
    ctx: Vec<GraphId>,
}

impl Default for GraphRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_comm(config, Rc::new(LocalComm::new()))
    }

    pub fn with_comm(config: EngineConfig, comm: Rc<dyn CommBackend>) -> Self {
        Self {
            graphs: Vec::new(),
            names: HashMap::new(),
            config,
            comm,
            default_eager: None,
            default_define_by_run: None,
            ctx: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn comm(&self) -> &dyn CommBackend {
        &*self.comm
    }

    /// Claim a graph id without creating a graph under it.
    pub(crate) fn reserve_graph_id(&mut self) -> GraphId {
        self.graphs.push(None);
        GraphId(self.graphs.len() as u64 - 1)
    }

    fn insert(&mut self, graph_type: GraphType, name: String) -> Result<GraphId> {
        if self.names.contains_key(&name) {
            bail_value!("a graph named {name} already exists");
        }
        let id = self.reserve_graph_id();
        let graph = Graph::new(id, name.clone(), GraphState::new(graph_type), self.config.clone());
        self.graphs[id.0 as usize] = Some(graph);
        self.names.insert(name, id);
        debug!(graph = %id, %graph_type, "made graph");
        Ok(id)
    }

    /// Create a graph. An empty `name` is replaced by `{type}_{id}`, with a
    /// numeric suffix if a user already took that name.
    /// Executable graphs only come out of [`GraphRegistry::instantiate`].
    pub fn make_graph(&mut self, graph_type: GraphType, name: &str) -> Result<GraphId> {
        if graph_type == GraphType::Executable {
            bail_runtime!("executable graphs are made by instantiating a define-and-run graph");
        }
        let name = if name.is_empty() {
            let base = format!("{graph_type}_{}", self.graphs.len());
            let mut name = base.clone();
            let mut k = 1;
            while self.names.contains_key(&name) {
                name = format!("{base}_{k}");
                k += 1;
            }
            name
        } else {
            name.to_string()
        };
        self.insert(graph_type, name)
    }

    pub fn get(&self, id: GraphId) -> Result<&Graph> {
        match self.graphs.get(id.0 as usize) {
            Some(Some(g)) => Ok(g),
            _ => bail_value!("graph {id} does not exist"),
        }
    }

    pub fn get_mut(&mut self, id: GraphId) -> Result<&mut Graph> {
        match self.graphs.get_mut(id.0 as usize) {
            Some(Some(g)) => Ok(g),
            _ => bail_value!("graph {id} does not exist"),
        }
    }

    pub fn get_by_name(&self, name: &str) -> Result<&Graph> {
        match self.names.get(name) {
            Some(id) => self.get(*id),
            None => bail_value!("no graph named {name}"),
        }
    }

    pub fn num_graphs(&self) -> usize {
        self.graphs.iter().flatten().count()
    }

    fn take(&mut self, id: GraphId) -> Result<Graph> {
        match self.graphs.get_mut(id.0 as usize).and_then(Option::take) {
            Some(g) => Ok(g),
            None => bail_value!("graph {id} does not exist"),
        }
    }

    fn restore(&mut self, graph: Graph) {
        let slot = graph.id().0 as usize;
        self.graphs[slot] = Some(graph);
    }

    /// Delete a graph. Deleting a define-and-run graph also deletes the
    /// executable graphs instantiated from it.
    pub fn delete_graph(&mut self, id: GraphId) -> Result<()> {
        let graph = self.take(id)?;
        self.names.remove(graph.name());
        self.ctx.retain(|g| *g != id);
        if self.default_eager == Some(id) {
            self.default_eager = None;
        }
        if self.default_define_by_run == Some(id) {
            self.default_define_by_run = None;
        }
        if let GraphState::DefineAndRun(st) = &graph.state {
            for plan in &st.plans {
                self.delete_graph(plan.exec_graph)?;
            }
        }
        debug!(graph = %id, name = %graph.name(), "deleted graph");
        Ok(())
    }

    pub fn default_eager_graph(&mut self) -> Result<GraphId> {
        if let Some(id) = self.default_eager {
            return Ok(id);
        }
        let id = self.insert(GraphType::Eager, "default_eager".into())?;
        self.default_eager = Some(id);
        Ok(id)
    }

    pub fn default_define_by_run_graph(&mut self) -> Result<GraphId> {
        if let Some(id) = self.default_define_by_run {
            return Ok(id);
        }
        let id = self.insert(GraphType::DefineByRun, "default_define_by_run".into())?;
        self.default_define_by_run = Some(id);
        Ok(id)
    }

    pub fn push_graph_ctx(&mut self, id: GraphId) -> Result<()> {
        self.get(id)?;
        self.ctx.push(id);
        Ok(())
    }

    pub fn pop_graph_ctx(&mut self) -> Result<GraphId> {
        match self.ctx.pop() {
            Some(id) => Ok(id),
            None => Err(Error::Assertion("graph context stack is empty".into()).bt()),
        }
    }

    /// Top of the context stack, or the default eager graph.
    pub fn current_graph(&mut self) -> Result<GraphId> {
        match self.ctx.last() {
            Some(id) => Ok(*id),
            None => self.default_eager_graph(),
        }
    }

    /// Make an op in the graph of its inputs, or in the current graph when it
    /// has none.
    pub fn make_op(&mut self, kind: OpKind, inputs: Vec<Tensor>, meta: OpMeta) -> Result<Operator> {
        let id = match inputs.first() {
            Some(t) => t.graph_id,
            None => self.current_graph()?,
        };
        self.get_mut(id)?.make_op(kind, inputs, meta)
    }

    pub fn run(&mut self, id: GraphId, fetches: &[Tensor], feed: &[(Tensor, NDArray)]) -> Result<Vec<NDArray>> {
        let mut opts = RunOptions::new(fetches.to_vec());
        opts.feed = feed.to_vec();
        self.run_with_options(id, opts)
    }

    pub fn run_with_options(&mut self, id: GraphId, opts: RunOptions) -> Result<Vec<NDArray>> {
        match self.get(id)?.graph_type() {
            GraphType::Eager | GraphType::DefineByRun => {
                self.get_mut(id)?.run_local(&opts.fetches, &opts.feed)
            }
            GraphType::Executable => {
                let comm = Rc::clone(&self.comm);
                self.get_mut(id)?.run_executable(&opts, &*comm)
            }
            GraphType::DefineAndRun => self.run_define_and_run(id, opts),
        }
    }

    fn run_define_and_run(&mut self, dar_id: GraphId, opts: RunOptions) -> Result<Vec<NDArray>> {
        let key = opts.strategy_key();
        let idx = self.plan_for(dar_id, key)?;
        self.activate(dar_id, idx)?;
        self.drop_stale_plans(dar_id)?;

        let dar = self.get(dar_id)?;
        let Some(plan) = dar.active_exec_plan()? else {
            bail_runtime!("{} has no active executable graph", dar.name());
        };
        let exec = self.get(plan.exec_graph)?;
        let map = |t: Tensor| map_to_exec(dar, plan, exec, t);
        let fetches = opts.fetches.iter().map(|t| map(*t)).collect::<Result<Vec<_>>>()?;
        let feed = opts
            .feed
            .iter()
            .map(|(t, v)| Ok((map(*t)?, v.clone())))
            .collect::<Result<Vec<_>>>()?;
        let loss = opts.loss.map(map).transpose()?;
        let exec_opts = RunOptions {
            fetches,
            feed,
            loss,
            ..opts
        };
        let exec_id = plan.exec_graph;
        self.run_with_options(exec_id, exec_opts)
    }

    /// Index of an up-to-date plan for `key`, instantiating one if needed.
    fn plan_for(&mut self, dar_id: GraphId, key: StrategyKey) -> Result<usize> {
        let dar = self.get(dar_id)?;
        let version = dar.peek_next_op_id();
        let found = dar
            .exec_plans()?
            .iter()
            .position(|p| p.strategy == key && p.version == version);
        match found {
            Some(idx) => Ok(idx),
            None => self.instantiate_plan(dar_id, key),
        }
    }

    fn instantiate_plan(&mut self, dar_id: GraphId, key: StrategyKey) -> Result<usize> {
        let (name, version) = {
            let dar = self.get(dar_id)?;
            (dar.name().to_string(), dar.peek_next_op_id())
        };
        let exec_name = format!("{name}_exec_{}_{}_v{version}", key.compute, key.optimize);
        let exec_id = self.insert(GraphType::Executable, exec_name)?;
        let mut exec = self.take(exec_id)?;
        let res = instantiate(self.get(dar_id)?, &mut exec, key);
        self.restore(exec);
        let plan = match res {
            Ok(plan) => plan,
            Err(e) => {
                self.delete_graph(exec_id)?;
                return Err(e);
            }
        };
        let st = self.get_mut(dar_id)?.dar_state_mut()?;
        st.plans.push(plan);
        Ok(st.plans.len() - 1)
    }

    /// Instantiate `dar` under the strategy pair `(compute, optimize)` and
    /// return the executable graph. The first plan of a graph becomes active.
    pub fn instantiate(&mut self, dar_id: GraphId, compute: usize, optimize: usize) -> Result<GraphId> {
        let idx = self.plan_for(dar_id, StrategyKey::new(compute, optimize))?;
        let st = self.get_mut(dar_id)?.dar_state_mut()?;
        if st.active.is_none() {
            st.active = Some(idx);
        }
        Ok(st.plans[idx].exec_graph)
    }

    /// Make plan `idx` of `dar` the active one, moving the training state
    /// over from the previously active plan.
    pub fn set_exec_plan(&mut self, dar_id: GraphId, idx: usize) -> Result<()> {
        let n = self.get(dar_id)?.exec_plans()?.len();
        ensure!(idx < n, "plan index {idx} out of range, {n} plans");
        self.activate(dar_id, idx)
    }

    fn activate(&mut self, dar_id: GraphId, idx: usize) -> Result<()> {
        let prev = match self.get(dar_id)?.dar_state()?.active {
            Some(prev) if prev == idx => return Ok(()),
            Some(prev) => prev,
            None => {
                self.get_mut(dar_id)?.dar_state_mut()?.active = Some(idx);
                return Ok(());
            }
        };
        let st = self.get(dar_id)?.dar_state()?;
        let before = st.plans[prev].clone();
        let after = st.plans[idx].clone();
        info!(
            graph = %dar_id,
            before = ?before.strategy,
            after = ?after.strategy,
            "switching executable graph"
        );

        let mut dar = self.take(dar_id)?;
        let mut src = match self.take(before.exec_graph) {
            Ok(g) => g,
            Err(e) => {
                self.restore(dar);
                return Err(e);
            }
        };
        let mut dst = match self.take(after.exec_graph) {
            Ok(g) => g,
            Err(e) => {
                self.restore(dar);
                self.restore(src);
                return Err(e);
            }
        };
        let res = {
            let graphs = &mut self.graphs;
            let mut reserve = || {
                graphs.push(None);
                GraphId(graphs.len() as u64 - 1)
            };
            switch_exec_graphs(&mut dar, &before, &after, &mut src, &mut dst, &*self.comm, &mut reserve)
        };
        if res.is_ok() {
            if let GraphState::DefineAndRun(st) = &mut dar.state {
                st.active = Some(idx);
            }
        }
        self.restore(dst);
        self.restore(src);
        self.restore(dar);
        res
    }

    /// Drop plans built for an older version of the staged graph, with their
    /// executable graphs.
    fn drop_stale_plans(&mut self, dar_id: GraphId) -> Result<()> {
        let dar = self.get_mut(dar_id)?;
        let version = dar.peek_next_op_id();
        let st = dar.dar_state_mut()?;
        let active = st.active.map(|i| st.plans[i].exec_graph);
        let mut stale = Vec::new();
        st.plans.retain(|p| {
            let keep = p.version == version || Some(p.exec_graph) == active;
            if !keep {
                stale.push(p.exec_graph);
            }
            keep
        });
        st.active = active.and_then(|g| st.plans.iter().position(|p| p.exec_graph == g));
        for id in stale {
            debug!(graph = %id, "dropping stale executable graph");
            self.delete_graph(id)?;
        }
        Ok(())
    }

    fn active_exec(&self, dar: &Graph) -> Result<(GraphId, ExecGraphPlan)> {
        match dar.active_exec_plan()? {
            Some(plan) => Ok((plan.exec_graph, plan.clone())),
            None => bail_runtime!("{} has not been instantiated", dar.name()),
        }
    }

    pub fn alloc_variable_data(&mut self, t: Tensor) -> Result<()> {
        let graph = self.get(t.graph_id)?;
        if graph.graph_type() != GraphType::DefineAndRun {
            return self.get_mut(t.graph_id)?.alloc_variable_data(t);
        }
        let (exec_id, plan) = self.active_exec(graph)?;
        let et = map_to_exec(graph, &plan, self.get(exec_id)?, t)?;
        self.get_mut(exec_id)?.alloc_variable_data(et)
    }

    /// Set the data of a variable. On a define-and-run graph the value also
    /// initializes every later instantiation.
    pub fn register_variable_data(&mut self, t: Tensor, value: NDArray) -> Result<()> {
        self.get_mut(t.graph_id)?.register_variable_data(t, value.clone())?;
        let graph = self.get(t.graph_id)?;
        if graph.graph_type() != GraphType::DefineAndRun {
            return Ok(());
        }
        let Some(plan) = graph.active_exec_plan()?.cloned() else {
            return Ok(());
        };
        let et = map_to_exec(graph, &plan, self.get(plan.exec_graph)?, t)?;
        self.get_mut(plan.exec_graph)?.register_variable_data(et, value)
    }

    pub fn reset_variable_data(&mut self, t: Tensor, init: Initializer) -> Result<()> {
        self.get_mut(t.graph_id)?.reset_variable_data(t, init.clone())?;
        let graph = self.get(t.graph_id)?;
        if graph.graph_type() != GraphType::DefineAndRun {
            return Ok(());
        }
        let Some(plan) = graph.active_exec_plan()?.cloned() else {
            return Ok(());
        };
        let et = map_to_exec(graph, &plan, self.get(plan.exec_graph)?, t)?;
        self.get_mut(plan.exec_graph)?.reset_variable_data(et, init)
    }

    pub fn get_variable_data(&self, t: Tensor) -> Result<NDArray> {
        self.get(t.graph_id)?.get_variable_data(t)
    }

    pub fn get_detached_variable_data(&self, t: Tensor) -> Result<NDArray> {
        let graph = self.get(t.graph_id)?;
        if graph.graph_type() != GraphType::DefineAndRun {
            return graph.get_detached_variable_data(t);
        }
        let (exec_id, plan) = self.active_exec(graph)?;
        let exec = self.get(exec_id)?;
        exec.get_detached_variable_data(map_to_exec(graph, &plan, exec, t)?)
    }
}

fn map_to_exec(dar: &Graph, plan: &ExecGraphPlan, exec: &Graph, t: Tensor) -> Result<Tensor> {
    let id = dar.check_tensor(t)?;
    match plan.map_tensor(id) {
        Some(e) => Ok(exec.tensor_handle(e)),
        None => bail_value!(
            "{} has no counterpart in executable graph {}",
            dar.tensor_def(id)?.name(),
            exec.name()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let mut reg = GraphRegistry::new();
        let a = reg.make_graph(GraphType::DefineByRun, "a").unwrap();
        assert!(reg.make_graph(GraphType::Eager, "a").is_err());
        assert_eq!(reg.get_by_name("a").unwrap().id(), a);
        reg.delete_graph(a).unwrap();
        assert!(reg.get(a).is_err());
        let b = reg.make_graph(GraphType::Eager, "a").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn context_stack_defaults_to_eager() {
        let mut reg = GraphRegistry::new();
        let eager = reg.current_graph().unwrap();
        assert_eq!(reg.get(eager).unwrap().graph_type(), GraphType::Eager);
        let g = reg.make_graph(GraphType::DefineByRun, "").unwrap();
        reg.push_graph_ctx(g).unwrap();
        assert_eq!(reg.current_graph().unwrap(), g);
        assert_eq!(reg.pop_graph_ctx().unwrap(), g);
        assert!(reg.pop_graph_ctx().is_err());
    }
}
