//! Live strategy switching: moves parameters, optimizer state and pending
//! gradients from one executable graph to another laid out differently.

use std::{collections::HashMap, time::Instant};

use tracing::{debug, info};

use crate::{
    bail_runtime, bail_type, ensure,
    graph::{
        execute_op, stateful_tensors, ExecGraphPlan, Graph, GraphId, GraphState, GraphType, ShapePlan,
        StrategyKey, TensorValues,
    },
    op::{OpId, OpKind, OpMeta},
    CommBackend, DType, Device, DeviceGroup, EngineConfig, Layout, Result, ShardedArray, TensorId,
};

pub mod plan;

pub use plan::{plan_redistribution, Piece};

/// Identifies a switcher: tensors of one dtype moving between two strategy
/// pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwitchKey {
    pub before: StrategyKey,
    pub after: StrategyKey,
    pub dtype: DType,
}

/// One tensor moved by a switcher.
#[derive(Debug, Clone)]
pub(crate) struct SwitchItem {
    /// Identity of the tensor in the staged graph.
    pub(crate) logical: TensorId,
    pub(crate) name: String,
    pub(crate) shape: Vec<usize>,
    pub(crate) src: Layout,
    pub(crate) dst: Layout,
}

enum Route {
    Local(TensorId),
    /// Index into the send batch.
    Remote(usize),
}

struct SwitchPair {
    logical: TensorId,
    input: TensorId,
    output: TensorId,
}

/// A compiled redistribution: an executable graph of
/// `Placeholder -> Slice -> BatchedISendIRecv -> Assemble` ops.
pub struct SwitchExecGraph {
    key: SwitchKey,
    graph: Graph,
    topo: Vec<OpId>,
    pairs: Vec<SwitchPair>,
}

fn device_union(pieces: &[Piece]) -> Result<DeviceGroup> {
    let mut devices: Vec<Device> = Vec::new();
    for p in pieces {
        for d in [p.src, p.dst] {
            if !devices.contains(&d) {
                devices.push(d);
            }
        }
    }
    DeviceGroup::new(devices)
}

impl SwitchExecGraph {
    pub(crate) fn build(
        id: GraphId,
        config: &EngineConfig,
        key: SwitchKey,
        items: &[SwitchItem],
    ) -> Result<Self> {
        let name = format!(
            "switch_{}_{}_to_{}_{}_{}",
            key.before.compute, key.before.optimize, key.after.compute, key.after.optimize, key.dtype
        );
        let mut graph = Graph::new(id, name, GraphState::new(GraphType::Executable), config.clone());

        let place = |graph: &mut Graph, op: OpId, group: DeviceGroup, layout: Layout| -> Result<TensorId> {
            let def = graph.op_def_mut(op)?;
            def.placement = Some(group);
            let t = def.outputs[0];
            graph.tensor_def_mut(t)?.layout = Some(layout);
            Ok(t)
        };

        // Per item: placeholder, pieces, and for each piece where its data
        // ends up (a local slice output, or an index into the send batch).
        let mut inputs = Vec::with_capacity(items.len());
        let mut routed: Vec<Vec<(Piece, Route)>> = Vec::with_capacity(items.len());
        let mut sends: Vec<(TensorId, Device)> = Vec::new();
        let mut remote: Vec<Piece> = Vec::new();
        for item in items {
            let op = graph.make_op(
                OpKind::Placeholder {
                    shape: item.shape.clone(),
                    dtype: key.dtype,
                },
                vec![],
                OpMeta::new().name(format!("{}_src", item.name)),
            )?;
            let p = place(&mut graph, op.id, item.src.group.clone(), item.src.clone())?;
            inputs.push(p);

            let mut routes = Vec::new();
            for (k, piece) in plan::plan_redistribution(&item.shape, &item.src, &item.dst)?
                .into_iter()
                .enumerate()
            {
                let slice = graph.make_op(
                    OpKind::Slice {
                        begin: piece.src_offset.clone(),
                        size: piece.size.clone(),
                    },
                    vec![graph.tensor_handle(p)],
                    OpMeta::new().name(format!("{}_slice_{k}", item.name)),
                )?;
                let s = place(
                    &mut graph,
                    slice.id,
                    DeviceGroup::single(piece.src),
                    Layout::single(piece.src),
                )?;
                if piece.is_local() {
                    routes.push((piece, Route::Local(s)));
                } else {
                    routes.push((piece.clone(), Route::Remote(sends.len())));
                    sends.push((s, piece.dst));
                    remote.push(piece);
                }
            }
            if routes.is_empty() {
                bail_runtime!("switching {} moves no data", item.name);
            }
            routed.push(routes);
        }

        let mut received = Vec::new();
        if !sends.is_empty() {
            let op = graph.make_op(
                OpKind::BatchedISendIRecv {
                    dst_devices: sends.iter().map(|(_, d)| *d).collect(),
                },
                sends.iter().map(|(t, _)| graph.tensor_handle(*t)).collect(),
                OpMeta::new().name("batched_isend_irecv"),
            )?;
            let def = graph.op_def_mut(op.id)?;
            def.placement = Some(device_union(&remote)?);
            received = def.outputs.clone();
            for (t, (_, dst)) in received.iter().zip(&sends) {
                graph.tensor_def_mut(*t)?.layout = Some(Layout::single(*dst));
            }
        }

        let mut pairs = Vec::with_capacity(items.len());
        for ((item, routes), input) in items.iter().zip(routed).zip(inputs) {
            let mut pieces = Vec::with_capacity(routes.len());
            let mut offsets = Vec::with_capacity(routes.len());
            for (piece, route) in routes {
                let t = match route {
                    Route::Local(t) => t,
                    Route::Remote(i) => received[i],
                };
                pieces.push(graph.tensor_handle(t));
                offsets.push(piece.dst_offset);
            }
            let op = graph.make_op(
                OpKind::Assemble {
                    shape: item.shape.clone(),
                    offsets,
                },
                pieces,
                OpMeta::new().name(format!("{}_assemble", item.name)),
            )?;
            let output = place(&mut graph, op.id, item.dst.group.clone(), item.dst.clone())?;
            pairs.push(SwitchPair {
                logical: item.logical,
                input,
                output,
            });
        }

        let sinks = graph.sink_op_ids();
        let topo = graph.topo_sort_ids(&sinks, &|_| false)?;
        debug!(
            graph = %graph.name(),
            num_ops = topo.len(),
            num_sends = sends.len(),
            "built switch graph"
        );
        Ok(Self {
            key,
            graph,
            topo,
            pairs,
        })
    }

    pub fn key(&self) -> SwitchKey {
        self.key
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub(crate) fn topo(&self) -> &[OpId] {
        &self.topo
    }

    fn moves(&self, logical: &[TensorId]) -> bool {
        self.pairs.len() == logical.len() && self.pairs.iter().zip(logical).all(|(p, l)| p.logical == *l)
    }

    /// Redistribute `inputs` (keyed by logical tensor) and return the
    /// destination shards under the same keys.
    pub(crate) fn run(
        &self,
        inputs: &HashMap<TensorId, ShardedArray>,
        comm: &dyn CommBackend,
    ) -> Result<HashMap<TensorId, ShardedArray>> {
        let mut values = TensorValues::new();
        for p in &self.pairs {
            match inputs.get(&p.logical) {
                Some(shards) => {
                    values.insert(p.input, shards.clone());
                }
                None => bail_runtime!("no source data for tensor {}", p.logical),
            }
        }
        let shapes = ShapePlan::new();
        for op in &self.topo {
            execute_op(&self.graph, *op, &mut values, &shapes, comm)?;
        }
        let mut out = HashMap::with_capacity(self.pairs.len());
        for p in &self.pairs {
            match values.remove(&p.output) {
                Some(shards) => {
                    out.insert(p.logical, shards);
                }
                None => bail_runtime!("switch graph did not produce tensor {}", p.logical),
            }
        }
        Ok(out)
    }
}

/// Exec tensor holding the layout and data of a logical tensor.
struct Endpoint {
    logical: TensorId,
    name: String,
    src: TensorId,
    dst: TensorId,
}

fn check_shape_law(src: &Graph, dst: &Graph, ends: &[Endpoint]) -> Result<()> {
    for e in ends {
        let (a, b) = (src.tensor_def(e.src)?, dst.tensor_def(e.dst)?);
        ensure!(
            a.shape() == b.shape(),
            "{} has shape {:?} before the switch and {:?} after",
            e.name,
            a.shape(),
            b.shape()
        );
        if a.dtype() != b.dtype() {
            bail_type!(
                "{} has dtype {} before the switch and {} after",
                e.name,
                a.dtype(),
                b.dtype()
            );
        }
    }
    Ok(())
}

fn bucket_by_dtype(src: &Graph, dst: &Graph, ends: &[Endpoint]) -> Result<Vec<(DType, Vec<SwitchItem>)>> {
    let mut buckets: Vec<(DType, Vec<SwitchItem>)> = Vec::new();
    for e in ends {
        let def = src.tensor_def(e.src)?;
        let item = SwitchItem {
            logical: e.logical,
            name: e.name.clone(),
            shape: def.shape().to_vec(),
            src: src.layout_of(e.src)?.clone(),
            dst: dst.layout_of(e.dst)?.clone(),
        };
        match buckets.iter_mut().find(|(d, _)| *d == def.dtype()) {
            Some((_, items)) => items.push(item),
            None => buckets.push((def.dtype(), vec![item])),
        }
    }
    buckets.sort_by_key(|(d, _)| *d);
    Ok(buckets)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pool {
    Params,
    Grads,
}

fn switcher<'a>(
    dar: &'a mut Graph,
    pool: Pool,
    key: SwitchKey,
    items: &[SwitchItem],
    new_graph_id: &mut dyn FnMut() -> GraphId,
) -> Result<&'a SwitchExecGraph> {
    let config = dar.config().clone();
    let st = dar.dar_state_mut()?;
    let switchers = match pool {
        Pool::Params => &mut st.param_switchers,
        Pool::Grads => &mut st.grad_switchers,
    };
    let logical: Vec<TensorId> = items.iter().map(|i| i.logical).collect();
    let fresh = switchers.get(&key).map(|s| s.moves(&logical)).unwrap_or(false);
    if fresh {
        info!(?key, "switcher pool hit");
    } else {
        let built = SwitchExecGraph::build(new_graph_id(), &config, key, items)?;
        switchers.insert(key, built);
    }
    match switchers.get(&key) {
        Some(s) => Ok(s),
        None => bail_runtime!("switcher {key:?} vanished from its pool"),
    }
}

/// Move every parameter and optimizer variable (and pending accumulated
/// gradients) from executable graph `src` of plan `before` to executable
/// graph `dst` of plan `after`. Afterwards `dst` owns the data and `src` has
/// released it.
#[tracing::instrument(
    skip_all,
    fields(before = ?before.strategy(), after = ?after.strategy())
)]
pub(crate) fn switch_exec_graphs(
    dar: &mut Graph,
    before: &ExecGraphPlan,
    after: &ExecGraphPlan,
    src: &mut Graph,
    dst: &mut Graph,
    comm: &dyn CommBackend,
    new_graph_id: &mut dyn FnMut() -> GraphId,
) -> Result<()> {
    let start = Instant::now();
    src.alloc_exec_variables()?;

    let mut params = Vec::new();
    for t in stateful_tensors(dar)? {
        let (Some(s), Some(d)) = (before.map_tensor(t), after.map_tensor(t)) else {
            continue;
        };
        params.push(Endpoint {
            logical: t,
            name: dar.tensor_def(t)?.name().to_string(),
            src: s,
            dst: d,
        });
    }
    check_shape_law(src, dst, &params)?;

    let mut grads = Vec::new();
    for (u, _) in before.op_mapping.iter() {
        let def = dar.op_def(*u)?;
        if !def.kind.is_optimizer_update() {
            continue;
        }
        let (Some(su), Some(du)) = (before.map_op(*u), after.map_op(*u)) else {
            continue;
        };
        let (Some(lg), Some(sg), Some(dg)) = (
            def.inputs.get(1),
            src.op_def(su)?.inputs.get(1),
            dst.op_def(du)?.inputs.get(1),
        ) else {
            continue;
        };
        grads.push(Endpoint {
            logical: *lg,
            name: dar.tensor_def(*lg)?.name().to_string(),
            src: *sg,
            dst: *dg,
        });
    }
    grads.sort_by_key(|e| e.logical);
    check_shape_law(src, dst, &grads)?;

    let mut moved = 0;
    for (dtype, items) in bucket_by_dtype(src, dst, &params)? {
        let key = SwitchKey {
            before: before.strategy(),
            after: after.strategy(),
            dtype,
        };
        let sw = switcher(dar, Pool::Params, key, &items, new_graph_id)?;
        let src_vars = &src.exec_state()?.variables;
        let mut inputs = HashMap::with_capacity(items.len());
        for e in params.iter().filter(|e| items.iter().any(|i| i.logical == e.logical)) {
            match src_vars.get(&e.src) {
                Some(v) => {
                    inputs.insert(e.logical, v.clone());
                }
                None => bail_runtime!("{} has no data in {}", e.name, src.name()),
            }
        }
        let outputs = sw.run(&inputs, comm)?;
        moved += outputs.len();
        let dst_state = dst.exec_state_mut()?;
        for e in params.iter() {
            if let Some(v) = outputs.get(&e.logical) {
                dst_state.variables.insert(e.dst, v.clone());
            }
        }
    }
    let src_state = src.exec_state_mut()?;
    for e in &params {
        src_state.variables.remove(&e.src);
    }

    let pending = !src.exec_state()?.accumulated_grads.is_empty();
    if pending || dar.config().need_grad_switch_topo {
        for (dtype, items) in bucket_by_dtype(src, dst, &grads)? {
            let key = SwitchKey {
                before: before.strategy(),
                after: after.strategy(),
                dtype,
            };
            let sw = switcher(dar, Pool::Grads, key, &items, new_graph_id)?;
            if !pending {
                continue;
            }
            let acc = &src.exec_state()?.accumulated_grads;
            let mut inputs = HashMap::new();
            for e in grads.iter().filter(|e| items.iter().any(|i| i.logical == e.logical)) {
                if let Some(g) = acc.get(&e.src) {
                    inputs.insert(e.logical, g.clone());
                }
            }
            if inputs.len() != items.len() {
                bail_runtime!(
                    "{} of {} gradients are pending, cannot switch a partial set",
                    inputs.len(),
                    items.len()
                );
            }
            let outputs = sw.run(&inputs, comm)?;
            let dst_state = dst.exec_state_mut()?;
            for e in &grads {
                if let Some(v) = outputs.get(&e.logical) {
                    dst_state.accumulated_grads.insert(e.dst, v.clone());
                }
            }
        }
        src.exec_state_mut()?.accumulated_grads.clear();
    }

    info!(
        moved,
        pending_grads = pending,
        elapsed_us = start.elapsed().as_micros() as u64,
        "switched strategy"
    );
    Ok(())
}
