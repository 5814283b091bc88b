//! Host execution of Eager and DefineByRun graphs.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::{
    bail_value,
    op::{ComputeCtx, OpId},
    NDArray, Result, Tensor, TensorId,
};

use super::{Graph, GraphState};

impl Graph {
    fn cached_value(&self, t: &TensorId) -> Option<&NDArray> {
        self.local_vars.get(t).or_else(|| self.preserved.get(t))
    }

    pub(crate) fn host_ctx(&self) -> ComputeCtx {
        ComputeCtx::host(self.config.kernel_threads)
    }

    /// Compute `op` right away if every input already has a value. Variables
    /// receive their initial data.
    pub(crate) fn eager_compute(&mut self, id: OpId) -> Result<()> {
        let def = self.op_def(id)?;
        if def.kind.is_placeholder() {
            return Ok(());
        }
        if def.kind.is_variable() {
            let t = def.outputs[0];
            return self.alloc_local_variable(t);
        }
        let Some(inputs) = def
            .inputs
            .iter()
            .map(|t| self.cached_value(t))
            .collect::<Option<Vec<_>>>()
        else {
            trace!(op = %def.meta.name, "inputs not ready, deferring");
            return Ok(());
        };
        let outputs = def.kind.compute(&inputs, &self.host_ctx())?;
        self.store_outputs(id, outputs, true)
    }

    /// Record `outputs` of `op`, writing in-place results back into the
    /// variables they overwrite.
    fn store_outputs(&mut self, id: OpId, outputs: Vec<NDArray>, preserve_all: bool) -> Result<()> {
        let def = self.op_def(id)?;
        let out_ids = def.outputs.clone();
        let mutated = def.kind.mutated_inputs(def.inputs.len());
        let inputs = def.inputs.clone();
        for (out, input) in mutated {
            let target = inputs[input];
            if self.local_vars.contains_key(&target) {
                self.local_vars.insert(target, outputs[out].clone());
            }
        }
        if preserve_all {
            for (t, v) in out_ids.into_iter().zip(outputs) {
                self.preserved.insert(t, v);
            }
        }
        Ok(())
    }

    /// Drop preserved values that a new feed, or an in-place write of a
    /// define-by-run op, may have made stale.
    fn invalidate_preserved(&mut self, fed: &HashMap<TensorId, NDArray>) -> Result<()> {
        let mut queue: VecDeque<TensorId> = fed.keys().copied().collect();
        if matches!(self.state, GraphState::DefineByRun) {
            for def in self.ops.values() {
                let mutated = def.kind.mutated_inputs(def.inputs.len());
                if mutated.is_empty() {
                    continue;
                }
                queue.extend(mutated.iter().map(|(_, i)| def.inputs[*i]));
                queue.extend(def.outputs.iter().copied());
            }
        }
        let mut seen: HashSet<TensorId> = HashSet::new();
        while let Some(t) = queue.pop_front() {
            if !seen.insert(t) {
                continue;
            }
            self.preserved.remove(&t);
            for c in &self.tensor_def(t)?.consumers {
                queue.extend(self.op_def(*c)?.outputs.iter().copied());
            }
        }
        trace!(graph = %self.name(), num_invalidated = seen.len(), "invalidated preserved values");
        Ok(())
    }

    /// Run a local graph up to `fetches`. Placeholders on the way must be
    /// fed. Ops whose outputs are all cached are not re-run, unless they
    /// descend from a fed tensor or, in a define-by-run graph, from a tensor
    /// some op overwrites in place.
    pub(crate) fn run_local(
        &mut self,
        fetches: &[Tensor],
        feed: &[(Tensor, NDArray)],
    ) -> Result<Vec<NDArray>> {
        let fetch_ids = fetches
            .iter()
            .map(|t| self.check_tensor(*t))
            .collect::<Result<Vec<_>>>()?;
        let mut feed_map: HashMap<TensorId, NDArray> = HashMap::new();
        for (t, v) in feed {
            let id = self.check_tensor(*t)?;
            let def = self.tensor_def(id)?;
            if v.shape() != def.shape() {
                bail_value!(
                    "feed for {} has shape {:?}, expected {:?}",
                    def.name,
                    v.shape(),
                    def.shape()
                );
            }
            feed_map.insert(id, v.clone());
        }
        let preserve_all = matches!(self.state, GraphState::Eager);
        self.invalidate_preserved(&feed_map)?;

        let mut frontier = Vec::new();
        for t in &fetch_ids {
            if let Some(p) = self.tensor_def(*t)?.producer {
                if !frontier.contains(&p) {
                    frontier.push(p);
                }
            }
        }
        let topo = {
            let known = |t: &TensorId| feed_map.contains_key(t) || self.cached_value(t).is_some();
            self.topo_sort_ids(&frontier, &|def| def.outputs.iter().all(known))?
        };
        debug!(graph = %self.name(), num_ops = topo.len(), "run local graph");

        let ctx = self.host_ctx();
        let mut values: HashMap<TensorId, NDArray> = HashMap::new();
        for id in topo {
            let def = self.op_def(id)?;
            let ready = |t: &TensorId| {
                feed_map.contains_key(t) || values.contains_key(t) || self.cached_value(t).is_some()
            };
            if def.outputs.iter().all(ready) {
                continue;
            }
            if def.kind.is_placeholder() {
                bail_value!("placeholder {} is not fed", def.meta.name);
            }
            if def.kind.is_variable() {
                let t = def.outputs[0];
                self.alloc_local_variable(t)?;
                continue;
            }
            let mut inputs = Vec::with_capacity(def.inputs.len());
            for t in &def.inputs {
                let v = feed_map
                    .get(t)
                    .or_else(|| values.get(t))
                    .or_else(|| self.cached_value(t));
                match v {
                    Some(v) => inputs.push(v),
                    None => bail_value!("input {t} of {} has no value", def.meta.name),
                }
            }
            let outputs = def.kind.compute(&inputs, &ctx)?;
            for (t, v) in def.outputs.iter().zip(&outputs) {
                values.insert(*t, v.clone());
            }
            self.store_outputs(id, outputs, preserve_all)?;
        }

        let mut out = Vec::with_capacity(fetch_ids.len());
        for t in &fetch_ids {
            let v = feed_map
                .get(t)
                .or_else(|| values.get(t))
                .or_else(|| self.cached_value(t));
            match v {
                Some(v) => out.push(v.clone()),
                None => bail_value!("fetch {t} has no value"),
            }
        }
        for (t, v) in fetch_ids.iter().zip(&out) {
            if !self.local_vars.contains_key(t) {
                self.preserved.insert(*t, v.clone());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu_storage::Initializer, graph::GraphId, DType, EngineConfig,
    };

    #[test]
    fn eager_ops_compute_on_creation() {
        let mut g = Graph::new(
            GraphId(0),
            "eager".into(),
            GraphState::Eager,
            EngineConfig::default(),
        );
        let x = g
            .variable(&[3], DType::F32, Initializer::Constant(2.), true, "x")
            .unwrap();
        let y = g.square(x).unwrap();
        assert_eq!(g.preserved_data(y).unwrap().unwrap().to_vec(), vec![4.; 3]);
    }

    #[test]
    fn define_by_run_needs_feeds() {
        let mut g = Graph::new(
            GraphId(0),
            "dbr".into(),
            GraphState::DefineByRun,
            EngineConfig::default(),
        );
        let x = g.placeholder(&[2], DType::F32, "x").unwrap();
        let y = g.add_scalar(x, 1.).unwrap();
        assert!(g.run_local(&[y], &[]).is_err());
        let feed = NDArray::from_vec(vec![1., 2.], &[2]).unwrap();
        let out = g.run_local(&[y], &[(x, feed)]).unwrap();
        assert_eq!(out[0].to_vec(), vec![2., 3.]);
        assert!(g.preserved_data(y).unwrap().is_some());

        let feed = NDArray::from_vec(vec![10., 20.], &[2]).unwrap();
        let out = g.run_local(&[y], &[(x, feed)]).unwrap();
        assert_eq!(out[0].to_vec(), vec![11., 21.]);
    }
}
