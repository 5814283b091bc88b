use std::{collections::HashMap, fs, path::Path, process::Command};

use petgraph::{
    dot::{Config, Dot},
    graph::NodeIndex,
    Graph as PetGraph,
};

use crate::{bail, Result};

use super::Graph;

impl Graph {
    /// Ops as nodes labelled `name: type`, one edge per data or control
    /// dependency. Nodes follow op id order.
    pub fn to_petgraph(&self) -> PetGraph<String, ()> {
        let mut g = PetGraph::<String, ()>::new();
        let mut ids: Vec<_> = self.ops.keys().copied().collect();
        ids.sort();

        let mut nodes: HashMap<_, NodeIndex> = HashMap::with_capacity(ids.len());
        for id in &ids {
            let def = &self.ops[id];
            let node = g.add_node(format!("{}: {}", def.meta.name, def.kind.type_name()));
            nodes.insert(*id, node);
        }
        for id in &ids {
            let dst = nodes[id];
            for t in self.ops[id].all_inputs() {
                let Some(src) = self.tensors.get(t).and_then(|t| t.producer) else {
                    continue;
                };
                if let Some(src) = nodes.get(&src) {
                    g.add_edge(*src, dst, ());
                }
            }
        }
        g
    }

    /// Produce a DOT format string of this graph.
    pub fn to_dot(&self) -> String {
        let g = self.to_petgraph();
        format!("{:?}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
    }

    /// Render the graph to a PNG at `filename`. The DOT source is kept next
    /// to the other dumps of this process as `{graph name}.dot`.
    ///
    /// Install graphvis:
    /// - brew install graphviz
    /// - apt install graphviz
    pub fn visualize<P: AsRef<Path>>(&self, filename: P) -> Result<()> {
        let dir = &self.config.dump_dir;
        fs::create_dir_all(dir)?;
        let dot_path = dir.join(format!("{}.dot", self.name()));
        let png_path = filename.as_ref().to_path_buf();

        fs::write(&dot_path, self.to_dot())?;
        let status = Command::new("dot")
            .args([
                "-Tpng",
                &dot_path.display().to_string(),
                "-o",
                &png_path.display().to_string(),
            ])
            .status()?;
        if !status.success() {
            bail!("graphviz failed on {}", dot_path.display());
        }

        Ok(())
    }
}
