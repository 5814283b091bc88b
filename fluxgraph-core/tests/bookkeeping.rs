use std::{collections::HashMap, time::Duration};

use fluxgraph_core::{
    DType, ErrorKind, Graph, GraphRegistry, GraphType, Initializer, IntSymbol, OpKind, OpMeta,
    SubGraphOpType, SubGraphType, SymbolicShape, TensorMeta,
};

fn dbr(reg: &mut GraphRegistry) -> &mut Graph {
    let id = reg.make_graph(GraphType::DefineByRun, "bookkeeping").unwrap();
    reg.get_mut(id).unwrap()
}

#[test]
fn producers_and_consumers_agree() {
    let mut reg = GraphRegistry::new();
    let g = dbr(&mut reg);
    let x = g.placeholder(&[3], DType::F32, "x").unwrap();
    let a = g.exp(x).unwrap();
    let b = g.neg(x).unwrap();
    let c = g.mul(a, b).unwrap();

    for op in g.ops() {
        for t in g.outputs(op).unwrap() {
            assert_eq!(g.producer(t).unwrap(), Some(op));
            for consumer in g.consumers(t).unwrap() {
                assert!(g.inputs(consumer).unwrap().contains(&t));
            }
        }
    }
    let px = g.producer(x).unwrap().unwrap();
    assert_eq!(g.out_degree(px).unwrap(), 2);
    assert!(g.is_source(px).unwrap());
    let pc = g.producer(c).unwrap().unwrap();
    assert_eq!(g.in_degree(pc).unwrap(), 2);
    assert_eq!(g.sink_ops(), vec![pc]);
    g.check_consistency().unwrap();
}

#[test]
fn op_names_count_per_type() {
    let mut reg = GraphRegistry::new();
    let g = dbr(&mut reg);
    let x = g.placeholder(&[3], DType::F32, "x").unwrap();
    let a = g.relu(x).unwrap();
    let b = g.relu(a).unwrap();
    assert_eq!(g.op_type_count("Relu"), 2);
    let pa = g.producer(a).unwrap().unwrap();
    let pb = g.producer(b).unwrap().unwrap();
    assert_ne!(g.op(pa).unwrap().name(), g.op(pb).unwrap().name());
}

#[test]
fn replace_input_checks_shapes() {
    let mut reg = GraphRegistry::new();
    let g = dbr(&mut reg);
    let x = g.placeholder(&[3], DType::F32, "x").unwrap();
    let y = g.placeholder(&[3], DType::F32, "y").unwrap();
    let z = g.placeholder(&[4], DType::F32, "z").unwrap();
    let r = g.relu(x).unwrap();
    let op = g.producer(r).unwrap().unwrap();

    let err = g.replace_input(op, 0, z, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Value);

    g.replace_input(op, 0, y, false).unwrap();
    assert_eq!(g.inputs(op).unwrap(), vec![y]);
    assert!(g.consumers(x).unwrap().is_empty());
    assert_eq!(g.consumers(y).unwrap(), vec![op]);
    g.check_consistency().unwrap();

    g.replace_input(op, 0, z, true).unwrap();
    g.check_consistency().unwrap();
}

#[test]
fn replace_output_needs_an_unconsumed_output_and_a_detached_tensor() {
    let mut reg = GraphRegistry::new();
    let g = dbr(&mut reg);
    let x = g.placeholder(&[3], DType::F32, "x").unwrap();
    let a = g.relu(x).unwrap();
    let _b = g.neg(a).unwrap();
    let pa = g.producer(a).unwrap().unwrap();
    let px = g.producer(x).unwrap().unwrap();

    let fresh = g.make_detached_tensor("fresh", TensorMeta::new(&[3], DType::F32));
    let err = g.replace_output(pa, 0, fresh).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Assertion);

    let c = g.exp(x).unwrap();
    let pc = g.producer(c).unwrap().unwrap();
    let err = g.replace_output(pc, 0, a).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Value);

    g.replace_output(pc, 0, fresh).unwrap();
    assert_eq!(g.output(pc, 0).unwrap(), fresh);
    assert_eq!(g.producer(fresh).unwrap(), Some(pc));
    assert!(g.tensor(c).is_err());
    assert_eq!(g.consumers(x).unwrap().len(), 2);
    assert!(g.out_degree(px).unwrap() >= 2);
    g.check_consistency().unwrap();
}

#[test]
fn detached_tensors_cannot_be_consumed() {
    let mut reg = GraphRegistry::new();
    let g = dbr(&mut reg);
    let fresh = g.make_detached_tensor("fresh", TensorMeta::new(&[3], DType::F32));
    assert!(g.relu(fresh).is_err());
}

#[test]
fn remove_op_unlinks_inputs() {
    let mut reg = GraphRegistry::new();
    let g = dbr(&mut reg);
    let x = g.placeholder(&[3], DType::F32, "x").unwrap();
    let a = g.relu(x).unwrap();
    let b = g.neg(a).unwrap();
    let pa = g.producer(a).unwrap().unwrap();
    let pb = g.producer(b).unwrap().unwrap();

    assert!(g.remove_op(pa).is_err());
    g.remove_op(pb).unwrap();
    assert!(g.consumers(a).unwrap().is_empty());
    assert!(g.is_sink(pa).unwrap());
    assert_eq!(g.num_ops(), 2);
    g.check_consistency().unwrap();
}

#[test]
fn control_dependencies_fold_into_a_group() {
    let mut reg = GraphRegistry::new();
    let g = dbr(&mut reg);
    let x = g.placeholder(&[3], DType::F32, "x").unwrap();
    let a = g.relu(x).unwrap();
    let b = g.exp(x).unwrap();
    let c = g.neg(x).unwrap();
    let pc = g.producer(c).unwrap().unwrap();

    g.add_in_deps(pc, &[a, b]).unwrap();
    assert_eq!(g.op_type_count("Group"), 1);
    assert_eq!(g.op(pc).unwrap().extra_in_deps().len(), 1);
    let group = g
        .ops()
        .into_iter()
        .find(|op| g.op(*op).unwrap().type_name() == "Group")
        .unwrap();
    assert_eq!(g.op(group).unwrap().name(), format!("{}_in_deps", g.op(pc).unwrap().name()));
    // x and the group
    assert_eq!(g.in_degree(pc).unwrap(), 2);
    assert_eq!(g.out_degree(group).unwrap(), 1);

    let order = g.topo_sort_tensors(&[c], |_| false).unwrap();
    let pos = |op| order.iter().position(|o| *o == op).unwrap();
    assert!(pos(group) < pos(pc));
    assert!(pos(g.producer(a).unwrap().unwrap()) < pos(group));
    g.check_consistency().unwrap();
}

#[test]
fn only_variables_become_parameters() {
    let mut reg = GraphRegistry::new();
    let g = dbr(&mut reg);
    let x = g.placeholder(&[3], DType::F32, "x").unwrap();
    let w = g.variable(&[3], DType::F32, Initializer::Zeros, true, "w").unwrap();
    let v = g
        .variable(&[3], DType::F32, Initializer::Zeros, false, "velocity")
        .unwrap();
    let pw = g.producer(w).unwrap().unwrap();
    let pv = g.producer(v).unwrap().unwrap();
    let px = g.producer(x).unwrap().unwrap();

    assert_eq!(g.params(), vec![pw]);
    assert_eq!(g.mark_as_parameter(px).unwrap_err().kind(), ErrorKind::Value);
    g.mark_as_optimizer_variable(pv).unwrap();
    assert_eq!(g.optimizer_variables(), vec![pv]);
    assert_eq!(g.params_and_opt_vars(), vec![pw, pv]);
}

#[test]
fn foreign_tensors_are_rejected() {
    let mut reg = GraphRegistry::new();
    let a = reg.make_graph(GraphType::DefineByRun, "a").unwrap();
    let b = reg.make_graph(GraphType::DefineByRun, "b").unwrap();
    let x = reg
        .get_mut(a)
        .unwrap()
        .placeholder(&[2], DType::F32, "x")
        .unwrap();
    let err = reg.get_mut(b).unwrap().relu(x).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);

    let err = reg
        .get_mut(b)
        .unwrap()
        .make_op(OpKind::ReduceSum, vec![x], OpMeta::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);
}

#[test]
fn subgraphs_classify_ops() {
    let mut reg = GraphRegistry::new();
    let g = dbr(&mut reg);
    g.make_subgraph("model", SubGraphType::Module, "Net").unwrap();
    g.push_subgraph_ctx("model").unwrap();
    g.make_subgraph("fc", SubGraphType::Module, "Linear").unwrap();
    g.push_subgraph_ctx("model.fc").unwrap();
    assert_eq!(g.cur_subgraph_global_name(), Some("model.fc"));

    let x = g
        .variable(&[3], DType::F32, Initializer::Ones, true, "x")
        .unwrap();
    let y = g.square(x).unwrap();
    let loss = g.reduce_sum(y).unwrap();
    let dx = g.gradients(&[loss], &[x], &[]).unwrap()[0].unwrap();
    let step = g.sgd_update(x, dx, None, 0.1, 0.).unwrap();
    g.pop_subgraph_ctx().unwrap();
    g.pop_subgraph_ctx().unwrap();

    let py = g.producer(y).unwrap().unwrap();
    let pdx = g.producer(dx).unwrap().unwrap();
    let pstep = g.producer(step).unwrap().unwrap();
    assert_eq!(g.subgraph_of(py).unwrap().unwrap().global_name(), "model.fc");
    assert_eq!(g.subgraph_op_type(py).unwrap(), Some(SubGraphOpType::Forward));
    assert_eq!(g.subgraph_op_type(pdx).unwrap(), Some(SubGraphOpType::Backward));
    assert_eq!(g.subgraph_op_type(pstep).unwrap(), Some(SubGraphOpType::Update));

    let fc = g.get_subgraph("model.fc").unwrap();
    assert_eq!(fc.parent(), Some("model"));
    assert!(fc.ops(SubGraphOpType::Forward).contains(&py.id));

    let mut times = HashMap::new();
    times.insert(py.id, Duration::from_millis(3));
    times.insert(pdx.id, Duration::from_millis(5));
    let prof = g.subgraph_profiling(&times);
    assert_eq!(prof["model.fc"].forward, Duration::from_millis(3));
    assert_eq!(prof["model"].backward, Duration::from_millis(5));
    assert_eq!(prof["model"].total(), Duration::from_millis(8));

    let forward = g.get_subgraph("model.fc").unwrap().ops(SubGraphOpType::Forward).len();
    assert_eq!(g.offload_subgraph("model").unwrap(), forward);
    assert!(g.op(py).unwrap().meta().is_offload);

    let moved = g
        .reclassify_subgraph_ops("model", SubGraphOpType::Backward, SubGraphOpType::Forward, true)
        .unwrap();
    assert!(moved > 0);
    assert_eq!(g.subgraph_op_type(pdx).unwrap(), Some(SubGraphOpType::Forward));
}

#[test]
fn cycles_fail_the_sort() {
    let mut reg = GraphRegistry::new();
    let g = dbr(&mut reg);
    let x = g.placeholder(&[2], DType::F32, "x").unwrap();
    let a = g.exp(x).unwrap();
    let b = g.neg(a).unwrap();
    let pa = g.producer(a).unwrap().unwrap();
    // a = exp(b), b = neg(a)
    g.replace_input(pa, 0, b, false).unwrap();

    let err = g.topo_sort_tensors(&[b], |_| false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Assertion);
}

#[test]
fn replacements_carry_symbolic_shapes() {
    let mut reg = GraphRegistry::new();
    let g = dbr(&mut reg);
    let x = g.placeholder(&[4, 3], DType::F32, "x").unwrap();
    let other = g.placeholder(&[4, 3], DType::F32, "other").unwrap();
    let batch = IntSymbol::new("batch", 4);
    let sym = SymbolicShape::new(vec![batch.clone(), IntSymbol::new("hidden", 3)]);
    g.set_symbolic_shape(x, sym).unwrap();
    let y = g.relu(x).unwrap();
    let op = g.producer(y).unwrap().unwrap();

    g.replace_input(op, 0, other, false).unwrap();
    let carried = g.tensor(other).unwrap().symbolic_shape().unwrap().clone();
    assert_eq!(carried.concrete(), vec![4, 3]);
    assert!(carried.symbols()[0].same_binding(&batch));

    let rows = IntSymbol::new("rows", 4);
    let out_sym = SymbolicShape::new(vec![rows.clone(), IntSymbol::new("cols", 3)]);
    g.set_symbolic_shape(y, out_sym).unwrap();
    let fresh = g.make_detached_tensor("fresh", TensorMeta::new(&[4, 3], DType::F32));
    g.replace_output(op, 0, fresh).unwrap();
    let adopted = g.tensor(fresh).unwrap().symbolic_shape().unwrap();
    assert_eq!(adopted.symbols()[0].name(), "rows");
    assert!(adopted.symbols()[0].same_binding(&rows));
    assert_eq!(g.producer(fresh).unwrap(), Some(op));
}
