//! Topological ordering with in-place awareness.

use std::{
    cmp::Reverse,
    collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque},
};

use tracing::debug;

use crate::{
    ensure,
    op::{OpId, OperatorDef},
    Operator, Result, Tensor, TensorId,
};

use super::Graph;

impl Graph {
    /// Order every op the `frontier` depends on so that producers precede
    /// consumers. Ops matching `stop_at` are emitted but their producers are
    /// not traversed.
    ///
    /// Readers of a tensor run before any in-place writer of the same tensor.
    /// A `BatchedISendIRecv` is moved right behind the slice feeding it.
    pub fn topo_sort(
        &self,
        frontier: &[Operator],
        stop_at: impl Fn(&OperatorDef) -> bool,
    ) -> Result<Vec<Operator>> {
        let ids = frontier
            .iter()
            .map(|op| self.check_op(*op))
            .collect::<Result<Vec<_>>>()?;
        Ok(self
            .topo_sort_ids(&ids, &stop_at)?
            .into_iter()
            .map(|id| self.op_handle(id))
            .collect())
    }

    pub fn topo_sort_tensors(
        &self,
        tensors: &[Tensor],
        stop_at: impl Fn(&OperatorDef) -> bool,
    ) -> Result<Vec<Operator>> {
        let mut frontier = Vec::with_capacity(tensors.len());
        for t in tensors {
            if let Some(p) = self.tensor(*t)?.producer {
                if !frontier.contains(&p) {
                    frontier.push(p);
                }
            }
        }
        Ok(self
            .topo_sort_ids(&frontier, &stop_at)?
            .into_iter()
            .map(|id| self.op_handle(id))
            .collect())
    }

    pub(crate) fn topo_sort_ids(
        &self,
        frontier: &[OpId],
        stop_at: &dyn Fn(&OperatorDef) -> bool,
    ) -> Result<Vec<OpId>> {
        // Depth is the longest distance from the frontier.
        let mut depth: HashMap<OpId, usize> = HashMap::new();
        let mut in_degree: HashMap<OpId, usize> = HashMap::new();
        let mut visited: Vec<OpId> = Vec::new();
        let mut queue: VecDeque<OpId> = VecDeque::new();
        for id in frontier {
            self.op_def(*id)?;
            if !depth.contains_key(id) {
                depth.insert(*id, 0);
                visited.push(*id);
                queue.push_back(*id);
            }
        }
        while let Some(id) = queue.pop_front() {
            let def = self.op_def(id)?;
            if stop_at(def) {
                debug!(op = %def.meta.name, "topo sort stops at op");
                in_degree.insert(id, 0);
                continue;
            }
            let producers = self.producers_of(def);
            in_degree.insert(id, producers.len());
            let d = depth[&id] + 1;
            for p in producers {
                match depth.get_mut(&p) {
                    Some(pd) => {
                        // bounded so that a cycle terminates and fails below
                        if *pd < d && d <= self.ops.len() {
                            *pd = d;
                            queue.push_back(p);
                        }
                    }
                    None => {
                        depth.insert(p, d);
                        visited.push(p);
                        queue.push_back(p);
                    }
                }
            }
        }
        let traversed: HashSet<OpId> = visited.iter().copied().collect();

        let mut seq = 0usize;
        let mut heap: BinaryHeap<(usize, Reverse<usize>, OpId)> = BinaryHeap::new();
        for id in &visited {
            if in_degree[id] == 0 {
                heap.push((depth[id], Reverse(seq), *id));
                seq += 1;
            }
        }

        let mut synthetic: HashMap<OpId, BTreeSet<OpId>> = HashMap::new();
        let mut emitted: HashSet<OpId> = HashSet::new();
        let mut ret = Vec::with_capacity(visited.len());
        while let Some((_, _, id)) = heap.pop() {
            emitted.insert(id);
            ret.push(id);
            let def = self.op_def(id)?;
            let mut release: Vec<OpId> = Vec::new();

            for t in &def.outputs {
                let tdef = self.tensor_def(*t)?;
                let consumers: Vec<OpId> = tdef
                    .consumers
                    .iter()
                    .copied()
                    .filter(|c| traversed.contains(c) && in_degree.get(c).copied().unwrap_or(0) > 0)
                    .collect();
                let (writers, readers): (Vec<OpId>, Vec<OpId>) = consumers
                    .iter()
                    .copied()
                    .partition(|c| self.mutates(*c, *t));
                if !writers.is_empty() && !readers.is_empty() {
                    for r in &readers {
                        if emitted.contains(r) {
                            continue;
                        }
                        let succ = synthetic.entry(*r).or_default();
                        for w in &writers {
                            if w != r && succ.insert(*w) {
                                if let Some(d) = in_degree.get_mut(w) {
                                    *d += 1;
                                }
                            }
                        }
                    }
                }
                for c in consumers {
                    if !release.contains(&c) {
                        release.push(c);
                    }
                }
            }
            if let Some(succ) = synthetic.remove(&id) {
                release.extend(succ);
            }
            for c in release {
                let Some(d) = in_degree.get_mut(&c) else {
                    continue;
                };
                if *d > 0 {
                    *d -= 1;
                    if *d == 0 {
                        heap.push((depth[&c], Reverse(seq), c));
                        seq += 1;
                    }
                }
            }
        }
        ensure!(
            ret.len() == visited.len(),
            "graph {} has a cycle: sorted {} of {} ops",
            self.name(),
            ret.len(),
            visited.len()
        );

        self.move_sends_behind_slices(&mut ret)?;
        Ok(ret)
    }

    /// Whether `op` overwrites tensor `t` in place.
    fn mutates(&self, op: OpId, t: TensorId) -> bool {
        let Some(def) = self.ops.get(&op) else {
            return false;
        };
        def.kind
            .mutated_inputs(def.inputs.len())
            .iter()
            .any(|(_, i)| def.inputs.get(*i) == Some(&t))
    }

    /// Pull every `BatchedISendIRecv` forward to sit right behind the nearest
    /// slice that feeds it, so sends are posted as early as possible.
    fn move_sends_behind_slices(&self, ret: &mut [OpId]) -> Result<()> {
        for i in 0..ret.len() {
            let def = self.op_def(ret[i])?;
            if !def.kind.is_batched_isend_irecv() || def.inputs.is_empty() {
                continue;
            }
            let producers = self.producers_of(def);
            let mut slice_pos = None;
            for j in (0..i).rev() {
                if producers.contains(&ret[j]) && self.op_def(ret[j])?.kind.is_slice() {
                    slice_pos = Some(j);
                    break;
                }
            }
            let Some(j) = slice_pos else {
                continue;
            };
            if let Some(k) = (j + 1..i).find(|k| producers.contains(&ret[*k])) {
                debug!(
                    op = %def.meta.name,
                    blocker = %self.op_def(ret[k])?.meta.name,
                    "send cannot move behind its slice"
                );
                continue;
            }
            ret[j + 1..=i].rotate_right(1);
        }
        Ok(())
    }

    /// Split a topological order into forward and backward parts at the
    /// first op whose outputs are all gradient tensors. An op without outputs
    /// never starts the backward part; it stays on whichever side the ops
    /// around it fall.
    pub fn disentangle_forward_and_backward_ops(
        &self,
        topo: &[Operator],
    ) -> Result<(Vec<Operator>, Vec<Operator>)> {
        let mut split = topo.len();
        for (i, op) in topo.iter().enumerate() {
            let def = self.op(*op)?;
            if def.outputs.is_empty() {
                continue;
            }
            if def.outputs.iter().all(|t| self.tensors[t].is_grad) {
                split = i;
                break;
            }
        }
        Ok((topo[..split].to_vec(), topo[split..].to_vec()))
    }

    /// Split a topological order into ops the `losses` depend on (plus
    /// offloaded ops) and the rest.
    pub fn disentangle_forward_and_backward_ops_by_loss(
        &self,
        topo: &[Operator],
        losses: &[Tensor],
    ) -> Result<(Vec<Operator>, Vec<Operator>)> {
        let ids = topo
            .iter()
            .map(|op| self.check_op(*op))
            .collect::<Result<Vec<_>>>()?;
        let loss_ids = losses
            .iter()
            .map(|t| self.check_tensor(*t))
            .collect::<Result<Vec<_>>>()?;
        let (fwd, bwd) = self.split_by_loss_ids(&ids, &loss_ids)?;
        Ok((
            fwd.into_iter().map(|id| self.op_handle(id)).collect(),
            bwd.into_iter().map(|id| self.op_handle(id)).collect(),
        ))
    }

    pub(crate) fn split_by_loss_ids(
        &self,
        topo: &[OpId],
        losses: &[TensorId],
    ) -> Result<(Vec<OpId>, Vec<OpId>)> {
        let ancestors = self.ancestors(losses)?;
        let (fwd, bwd) = topo.iter().copied().partition(|id| {
            ancestors.contains(id)
                || self
                    .ops
                    .get(id)
                    .map(|d| d.meta.is_offload)
                    .unwrap_or(false)
        });
        Ok((fwd, bwd))
    }

    /// Every op reachable backwards from `tensors`, including their producers.
    pub(crate) fn ancestors(&self, tensors: &[TensorId]) -> Result<HashSet<OpId>> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        for t in tensors {
            if let Some(p) = self.tensor_def(*t)?.producer {
                if seen.insert(p) {
                    queue.push_back(p);
                }
            }
        }
        while let Some(id) = queue.pop_front() {
            for p in self.producers_of(self.op_def(id)?) {
                if seen.insert(p) {
                    queue.push_back(p);
                }
            }
        }
        Ok(seen)
    }
}
