//! Named, hierarchical groups of operators. A subgraph's global name joins the
//! names of its ancestors with `.`.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Duration,
};

use crate::{bail_value, ensure, op::OpId, Operator, Result};

use super::Graph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubGraphType {
    Module,
    Pipeline,
    Optimizer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubGraphOpType {
    Forward,
    Backward,
    Update,
}

#[derive(Debug, Clone)]
pub struct SubGraph {
    global_name: String,
    name: String,
    subgraph_type: SubGraphType,
    module_type: String,
    parent: Option<String>,
    children: BTreeSet<String>,
    fwd_ops: BTreeSet<OpId>,
    bwd_ops: BTreeSet<OpId>,
    update_ops: BTreeSet<OpId>,
}

impl SubGraph {
    pub fn global_name(&self) -> &str {
        &self.global_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subgraph_type(&self) -> SubGraphType {
        self.subgraph_type
    }

    pub fn module_type(&self) -> &str {
        &self.module_type
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(String::as_str)
    }

    pub fn ops(&self, op_type: SubGraphOpType) -> &BTreeSet<OpId> {
        match op_type {
            SubGraphOpType::Forward => &self.fwd_ops,
            SubGraphOpType::Backward => &self.bwd_ops,
            SubGraphOpType::Update => &self.update_ops,
        }
    }

    fn ops_mut(&mut self, op_type: SubGraphOpType) -> &mut BTreeSet<OpId> {
        match op_type {
            SubGraphOpType::Forward => &mut self.fwd_ops,
            SubGraphOpType::Backward => &mut self.bwd_ops,
            SubGraphOpType::Update => &mut self.update_ops,
        }
    }

    pub fn num_ops(&self) -> usize {
        self.fwd_ops.len() + self.bwd_ops.len() + self.update_ops.len()
    }
}

/// Accumulated execution time of a subgraph per op class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpClassTimes {
    pub forward: Duration,
    pub backward: Duration,
    pub update: Duration,
}

impl OpClassTimes {
    fn add(&mut self, op_type: SubGraphOpType, d: Duration) {
        match op_type {
            SubGraphOpType::Forward => self.forward += d,
            SubGraphOpType::Backward => self.backward += d,
            SubGraphOpType::Update => self.update += d,
        }
    }

    pub fn total(&self) -> Duration {
        self.forward + self.backward + self.update
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SubGraphTree {
    subgraphs: BTreeMap<String, SubGraph>,
    op_index: HashMap<OpId, (String, SubGraphOpType)>,
    ctx: Vec<String>,
    op_type_ctx: Vec<SubGraphOpType>,
}

impl SubGraphTree {
    pub(crate) fn current(&self) -> Option<&str> {
        self.ctx.last().map(String::as_str)
    }

    pub(crate) fn current_op_type(&self) -> SubGraphOpType {
        self.op_type_ctx
            .last()
            .copied()
            .unwrap_or(SubGraphOpType::Forward)
    }

    pub(crate) fn get(&self, global_name: &str) -> Option<&SubGraph> {
        self.subgraphs.get(global_name)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SubGraph> {
        self.subgraphs.values()
    }

    pub(crate) fn entry_of(&self, op: OpId) -> Option<(&str, SubGraphOpType)> {
        self.op_index.get(&op).map(|(n, t)| (n.as_str(), *t))
    }

    fn create(
        &mut self,
        global_name: String,
        subgraph_type: SubGraphType,
        module_type: &str,
    ) -> Result<&SubGraph> {
        if let Some(existing) = self.subgraphs.get(&global_name) {
            if existing.subgraph_type != subgraph_type {
                bail_value!(
                    "subgraph {global_name} already exists as {:?}, not {subgraph_type:?}",
                    existing.subgraph_type
                );
            }
            return Ok(&self.subgraphs[&global_name]);
        }
        let (parent, name) = match global_name.rsplit_once('.') {
            Some((p, n)) => (Some(p.to_string()), n.to_string()),
            None => (None, global_name.clone()),
        };
        if name.is_empty() {
            bail_value!("subgraph name {global_name:?} has an empty component");
        }
        if let Some(p) = &parent {
            match self.subgraphs.get_mut(p) {
                Some(parent) => {
                    parent.children.insert(global_name.clone());
                }
                None => bail_value!("parent subgraph {p} of {global_name} does not exist"),
            }
        }
        self.subgraphs.insert(
            global_name.clone(),
            SubGraph {
                global_name: global_name.clone(),
                name,
                subgraph_type,
                module_type: module_type.to_string(),
                parent,
                children: BTreeSet::new(),
                fwd_ops: BTreeSet::new(),
                bwd_ops: BTreeSet::new(),
                update_ops: BTreeSet::new(),
            },
        );
        Ok(&self.subgraphs[&global_name])
    }

    pub(crate) fn add(&mut self, op: OpId, global_name: &str, op_type: SubGraphOpType) -> Result<()> {
        if let Some((owner, _)) = self.op_index.get(&op) {
            ensure!(
                owner == global_name,
                "op {op} already belongs to subgraph {owner}"
            );
        }
        let Some(sg) = self.subgraphs.get_mut(global_name) else {
            bail_value!("subgraph {global_name} does not exist");
        };
        if let Some((_, old)) = self.op_index.get(&op) {
            sg.ops_mut(*old).remove(&op);
        }
        sg.ops_mut(op_type).insert(op);
        self.op_index.insert(op, (global_name.to_string(), op_type));
        Ok(())
    }

    pub(crate) fn remove(&mut self, op: OpId) {
        if let Some((name, op_type)) = self.op_index.remove(&op) {
            if let Some(sg) = self.subgraphs.get_mut(&name) {
                sg.ops_mut(op_type).remove(&op);
            }
        }
    }

    /// Names of `root` and every subgraph below it.
    fn descendants(&self, root: &str) -> Vec<String> {
        let mut out = vec![root.to_string()];
        let mut i = 0;
        while i < out.len() {
            if let Some(sg) = self.subgraphs.get(&out[i]) {
                out.extend(sg.children.iter().cloned());
            }
            i += 1;
        }
        out
    }
}

impl Graph {
    /// Create a subgraph under the current subgraph context, or return the
    /// existing one of the same type.
    pub fn make_subgraph(
        &mut self,
        name: &str,
        subgraph_type: SubGraphType,
        module_type: &str,
    ) -> Result<&SubGraph> {
        let global_name = match self.subgraphs.current() {
            Some(cur) => format!("{cur}.{name}"),
            None => name.to_string(),
        };
        self.subgraphs.create(global_name, subgraph_type, module_type)
    }

    /// Like [`Graph::make_subgraph`] with `global_name` taken as absolute.
    pub fn make_subgraph_global(
        &mut self,
        global_name: &str,
        subgraph_type: SubGraphType,
        module_type: &str,
    ) -> Result<&SubGraph> {
        self.subgraphs
            .create(global_name.to_string(), subgraph_type, module_type)
    }

    pub fn get_subgraph(&self, global_name: &str) -> Result<&SubGraph> {
        match self.subgraphs.get(global_name) {
            Some(sg) => Ok(sg),
            None => bail_value!("subgraph {global_name} does not exist in graph {}", self.name()),
        }
    }

    pub fn subgraphs(&self) -> impl Iterator<Item = &SubGraph> {
        self.subgraphs.iter()
    }

    pub fn add_op_to_subgraph(
        &mut self,
        op: Operator,
        global_name: &str,
        op_type: SubGraphOpType,
    ) -> Result<()> {
        let id = self.check_op(op)?;
        self.subgraphs.add(id, global_name, op_type)
    }

    pub fn delete_op_from_subgraph(&mut self, op: Operator) -> Result<()> {
        let id = self.check_op(op)?;
        self.subgraphs.remove(id);
        Ok(())
    }

    pub fn subgraph_of(&self, op: Operator) -> Result<Option<&SubGraph>> {
        let id = self.check_op(op)?;
        Ok(self
            .subgraphs
            .entry_of(id)
            .and_then(|(name, _)| self.subgraphs.get(name)))
    }

    pub fn subgraph_op_type(&self, op: Operator) -> Result<Option<SubGraphOpType>> {
        let id = self.check_op(op)?;
        Ok(self.subgraphs.entry_of(id).map(|(_, t)| t))
    }

    pub fn push_subgraph_ctx(&mut self, global_name: &str) -> Result<()> {
        self.get_subgraph(global_name)?;
        self.subgraphs.ctx.push(global_name.to_string());
        Ok(())
    }

    pub fn pop_subgraph_ctx(&mut self) -> Result<()> {
        ensure!(self.subgraphs.ctx.pop().is_some(), "subgraph context stack is empty");
        Ok(())
    }

    pub fn push_subgraph_op_type_ctx(&mut self, op_type: SubGraphOpType) {
        self.subgraphs.op_type_ctx.push(op_type);
    }

    pub fn pop_subgraph_op_type_ctx(&mut self) -> Result<()> {
        ensure!(
            self.subgraphs.op_type_ctx.pop().is_some(),
            "subgraph op type context stack is empty"
        );
        Ok(())
    }

    pub fn cur_subgraph_global_name(&self) -> Option<&str> {
        self.subgraphs.current()
    }

    /// Move every op of class `from` in the subgraph (and, if `recursive`,
    /// its descendants) to class `to`. Returns the number of ops moved.
    pub fn reclassify_subgraph_ops(
        &mut self,
        global_name: &str,
        from: SubGraphOpType,
        to: SubGraphOpType,
        recursive: bool,
    ) -> Result<usize> {
        self.get_subgraph(global_name)?;
        let names = if recursive {
            self.subgraphs.descendants(global_name)
        } else {
            vec![global_name.to_string()]
        };
        let mut moved = 0;
        for name in names {
            let ops: Vec<OpId> = self.subgraphs.subgraphs[&name]
                .ops(from)
                .iter()
                .copied()
                .collect();
            for op in ops {
                self.subgraphs.add(op, &name, to)?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Flag every forward op of the subgraph tree rooted at `global_name` for
    /// offloading.
    pub fn offload_subgraph(&mut self, global_name: &str) -> Result<usize> {
        self.get_subgraph(global_name)?;
        let mut ops = Vec::new();
        for name in self.subgraphs.descendants(global_name) {
            ops.extend(
                self.subgraphs.subgraphs[&name]
                    .ops(SubGraphOpType::Forward)
                    .iter()
                    .copied(),
            );
        }
        for op in &ops {
            self.op_def_mut(*op)?.meta.is_offload = true;
        }
        Ok(ops.len())
    }

    /// Per-subgraph execution time per op class, each subgraph including its
    /// descendants.
    pub fn subgraph_profiling(
        &self,
        op_times: &HashMap<OpId, Duration>,
    ) -> BTreeMap<String, OpClassTimes> {
        let mut own: BTreeMap<String, OpClassTimes> = self
            .subgraphs
            .iter()
            .map(|sg| (sg.global_name.clone(), OpClassTimes::default()))
            .collect();
        for (op, d) in op_times {
            if let Some((name, op_type)) = self.subgraphs.entry_of(*op) {
                if let Some(t) = own.get_mut(name) {
                    t.add(op_type, *d);
                }
            }
        }
        // Children sort after their parents; fold bottom-up.
        let names: Vec<String> = own.keys().cloned().collect();
        for name in names.iter().rev() {
            let Some(parent) = self.subgraphs.get(name).and_then(|sg| sg.parent.clone()) else {
                continue;
            };
            let child = own[name];
            if let Some(p) = own.get_mut(&parent) {
                p.forward += child.forward;
                p.backward += child.backward;
                p.update += child.update;
            }
        }
        own
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_links_and_type_conflicts() {
        let mut t = SubGraphTree::default();
        t.create("model".into(), SubGraphType::Module, "Net").unwrap();
        t.create("model.fc".into(), SubGraphType::Module, "Linear").unwrap();
        assert!(t.create("model.fc".into(), SubGraphType::Pipeline, "").is_err());
        assert!(t.create("missing.fc".into(), SubGraphType::Module, "").is_err());
        assert_eq!(t.get("model.fc").unwrap().parent(), Some("model"));
        assert_eq!(t.descendants("model"), vec!["model", "model.fc"]);

        t.add(OpId(0), "model.fc", SubGraphOpType::Forward).unwrap();
        assert!(t.add(OpId(0), "model", SubGraphOpType::Forward).is_err());
        t.add(OpId(0), "model.fc", SubGraphOpType::Backward).unwrap();
        let fc = t.get("model.fc").unwrap();
        assert!(fc.ops(SubGraphOpType::Forward).is_empty());
        assert_eq!(fc.num_ops(), 1);
    }
}
