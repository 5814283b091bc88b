use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::{op::OpId, Result, Tensor, TensorId};

use super::{Graph, GraphState, SubGraphOpType};

impl Graph {
    /// Build the ops computing `d(sum ys)/d xs`, seeding each `ys[i]` with
    /// `grad_ys[i]` (ones when absent). Entry `i` of the result is `None` when
    /// `xs[i]` does not influence any of `ys`.
    ///
    /// Every op made here produces gradient tensors and is classified as a
    /// backward op of the current subgraph.
    pub fn gradients(
        &mut self,
        ys: &[Tensor],
        xs: &[Tensor],
        grad_ys: &[Option<Tensor>],
    ) -> Result<Vec<Option<Tensor>>> {
        self.push_grad_ctx();
        self.push_subgraph_op_type_ctx(SubGraphOpType::Backward);
        let res = self.build_gradients(ys, xs, grad_ys);
        self.pop_subgraph_op_type_ctx()?;
        self.pop_grad_ctx()?;
        res
    }

    fn build_gradients(
        &mut self,
        ys: &[Tensor],
        xs: &[Tensor],
        grad_ys: &[Option<Tensor>],
    ) -> Result<Vec<Option<Tensor>>> {
        let y_ids = ys
            .iter()
            .map(|t| self.check_tensor(*t))
            .collect::<Result<Vec<_>>>()?;
        let x_ids = xs
            .iter()
            .map(|t| self.check_tensor(*t))
            .collect::<Result<Vec<_>>>()?;
        for g in grad_ys.iter().flatten() {
            self.check_tensor(*g)?;
        }

        let influenced = self.influenced_by(&x_ids)?;
        let mut frontier = Vec::new();
        for y in &y_ids {
            if let Some(p) = self.tensor_def(*y)?.producer {
                if !frontier.contains(&p) {
                    frontier.push(p);
                }
            }
        }
        let topo = self.topo_sort_ids(&frontier, &|_| false)?;

        let mut grads: HashMap<TensorId, Vec<Tensor>> = HashMap::new();
        for (i, y) in ys.iter().enumerate() {
            let seed = match grad_ys.get(i).copied().flatten() {
                Some(g) => g,
                None => self.ones_like(*y)?,
            };
            grads.entry(y.id).or_default().push(seed);
        }

        for id in topo.into_iter().rev() {
            let def = self.op_def(id)?;
            if !def.inputs.iter().any(|t| influenced.contains(t)) {
                continue;
            }
            let outputs = def.outputs.clone();
            let inputs = def.inputs.clone();
            let kind = def.kind.clone();
            let hierarchy = def.meta.device_group_hierarchy.clone();

            let mut grad_outputs = Vec::with_capacity(outputs.len());
            for t in &outputs {
                grad_outputs.push(self.reduce_grads(&mut grads, *t)?);
            }
            if grad_outputs.iter().all(Option::is_none) {
                continue;
            }
            let needs: Vec<bool> = inputs.iter().map(|t| influenced.contains(t)).collect();

            let first_new = self.peek_next_op_id();
            let grad_inputs = kind.gradient(self, id, &grad_outputs, &needs)?;
            if !hierarchy.is_empty() {
                self.inherit_device_groups(first_new, &hierarchy);
            }
            debug!(op = %self.op_def(id)?.meta.name, "built gradient");
            for (t, g) in inputs.iter().zip(grad_inputs) {
                if let Some(g) = g {
                    if influenced.contains(t) {
                        grads.entry(*t).or_default().push(g);
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(x_ids.len());
        for x in &x_ids {
            out.push(self.reduce_grads(&mut grads, *x)?);
        }
        Ok(out)
    }

    /// Collapse the partial gradients of `t` into one tensor.
    fn reduce_grads(
        &mut self,
        grads: &mut HashMap<TensorId, Vec<Tensor>>,
        t: TensorId,
    ) -> Result<Option<Tensor>> {
        let Some(parts) = grads.get(&t) else {
            return Ok(None);
        };
        let reduced = match parts.as_slice() {
            [] => return Ok(None),
            [single] => *single,
            many => {
                let many = many.to_vec();
                self.sum(&many)?
            }
        };
        grads.insert(t, vec![reduced]);
        Ok(Some(reduced))
    }

    /// Tensors depending on any of `xs`, `xs` included.
    fn influenced_by(&self, xs: &[TensorId]) -> Result<HashSet<TensorId>> {
        let mut seen: HashSet<TensorId> = xs.iter().copied().collect();
        let mut queue: VecDeque<TensorId> = xs.iter().copied().collect();
        while let Some(t) = queue.pop_front() {
            for c in &self.tensor_def(t)?.consumers {
                let def = self.op_def(*c)?;
                if !def.inputs.contains(&t) {
                    continue;
                }
                for o in &def.outputs {
                    if seen.insert(*o) {
                        queue.push_back(*o);
                    }
                }
            }
        }
        Ok(seen)
    }

    /// Gradient ops inherit the placement of the op they differentiate
    /// unless they were given one.
    fn inherit_device_groups(&mut self, first_new: u64, hierarchy: &crate::DeviceGroupHierarchy) {
        for raw in first_new..self.peek_next_op_id() {
            if let Some(def) = self.ops.get_mut(&OpId(raw)) {
                if def.meta.device_group_hierarchy.is_empty() {
                    def.meta.device_group_hierarchy = hierarchy.clone();
                    if let GraphState::DefineAndRun(dar) = &mut self.state {
                        dar.ops_with_device_groups.push(OpId(raw));
                    }
                }
            }
        }
    }
}
