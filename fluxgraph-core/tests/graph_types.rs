use fluxgraph_core::{
    DType, ErrorKind, GraphRegistry, GraphType, Initializer, NDArray, OpKind, OpMeta, RunLevel,
    RunOptions, StrategyKey, Tensor,
};

fn x_data() -> NDArray {
    NDArray::from_vec(vec![1., 2., 3., 4., 5., 6.], &[2, 3]).unwrap()
}

#[test]
fn eager_ops_compute_when_made() {
    let mut reg = GraphRegistry::new();
    let g = reg.default_eager_graph().unwrap();
    let graph = reg.get_mut(g).unwrap();
    let x = graph
        .variable(&[3], DType::F32, Initializer::Constant(2.), false, "x")
        .unwrap();
    let y = graph.square(x).unwrap();
    let z = graph.add_scalar(y, 1.).unwrap();

    assert_eq!(graph.preserved_data(z).unwrap().unwrap().to_vec(), vec![5.; 3]);
    let out = reg.run(g, &[z], &[]).unwrap();
    assert_eq!(out[0].to_vec(), vec![5.; 3]);
}

#[test]
fn eager_ops_wait_for_fed_placeholders() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::Eager, "").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let x = graph.placeholder(&[2, 3], DType::F32, "x").unwrap();
    let y = graph.neg(x).unwrap();
    assert!(graph.preserved_data(y).unwrap().is_none());

    let out = reg.run(g, &[y], &[(x, x_data())]).unwrap();
    assert_eq!(out[0].to_vec(), vec![-1., -2., -3., -4., -5., -6.]);
}

#[test]
fn define_by_run_needs_feeds() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::DefineByRun, "dbr").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let x = graph.placeholder(&[2, 3], DType::F32, "x").unwrap();
    let y = graph.relu(x).unwrap();
    let s = graph.reduce_sum(y).unwrap();
    assert!(graph.preserved_data(s).unwrap().is_none());

    let err = reg.run(g, &[s], &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Value);

    let bad = NDArray::from_vec(vec![1., 2.], &[2]).unwrap();
    let err = reg.run(g, &[s], &[(x, bad)]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Value);

    let out = reg.run(g, &[s], &[(x, x_data())]).unwrap();
    assert_eq!(out[0].item().unwrap(), 21.);
}

#[test]
fn registry_names_and_contexts() {
    let mut reg = GraphRegistry::new();
    let a = reg.make_graph(GraphType::DefineByRun, "a").unwrap();
    assert_eq!(
        reg.make_graph(GraphType::Eager, "a").unwrap_err().kind(),
        ErrorKind::Value
    );
    assert_eq!(
        reg.make_graph(GraphType::Executable, "exec").unwrap_err().kind(),
        ErrorKind::Runtime
    );
    let anon = reg.make_graph(GraphType::Eager, "").unwrap();
    assert!(reg.get(anon).unwrap().name().starts_with("eager_"));
    assert_eq!(reg.get_by_name("a").unwrap().id(), a);

    assert_eq!(
        reg.pop_graph_ctx().unwrap_err().kind(),
        ErrorKind::Assertion
    );
    let eager = reg.current_graph().unwrap();
    assert_eq!(eager, reg.default_eager_graph().unwrap());
    assert_eq!(reg.get(eager).unwrap().graph_type(), GraphType::Eager);

    reg.push_graph_ctx(a).unwrap();
    assert_eq!(reg.current_graph().unwrap(), a);
    let op = reg
        .make_op(
            OpKind::Placeholder {
                shape: vec![2],
                dtype: DType::F32,
            },
            vec![],
            OpMeta::new().name("p"),
        )
        .unwrap();
    assert_eq!(op.graph_id, a);
    assert_eq!(reg.pop_graph_ctx().unwrap(), a);

    let n = reg.num_graphs();
    reg.delete_graph(a).unwrap();
    assert_eq!(reg.num_graphs(), n - 1);
    assert!(reg.get(a).is_err());
    assert!(reg.get_by_name("a").is_err());
}

#[test]
fn local_variable_data() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::DefineByRun, "vars").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let w = graph
        .variable(&[2], DType::F32, Initializer::Ones, true, "w")
        .unwrap();
    let y = graph.mul_scalar(w, 3.).unwrap();

    assert_eq!(reg.get_variable_data(w).unwrap_err().kind(), ErrorKind::Runtime);
    reg.alloc_variable_data(w).unwrap();
    assert_eq!(reg.get_variable_data(w).unwrap().to_vec(), vec![1., 1.]);

    let v = NDArray::from_vec(vec![2., 4.], &[2]).unwrap();
    reg.register_variable_data(w, v).unwrap();
    assert_eq!(reg.run(g, &[y], &[]).unwrap()[0].to_vec(), vec![6., 12.]);

    reg.reset_variable_data(w, Initializer::Constant(-1.)).unwrap();
    assert_eq!(reg.get_detached_variable_data(w).unwrap().to_vec(), vec![-1., -1.]);

    let wrong = NDArray::from_vec(vec![1., 2., 3.], &[3]).unwrap();
    assert_eq!(
        reg.register_variable_data(w, wrong).unwrap_err().kind(),
        ErrorKind::Value
    );
    assert_eq!(reg.get_variable_data(y).unwrap_err().kind(), ErrorKind::Value);
}

/// `loss = sum(x @ w)` followed by one SGD step on `w`.
struct Linear {
    x: Tensor,
    w: Tensor,
    y: Tensor,
    loss: Tensor,
    step: Tensor,
}

fn staged_linear(reg: &mut GraphRegistry, name: &str) -> (fluxgraph_core::GraphId, Linear) {
    let g = reg.make_graph(GraphType::DefineAndRun, name).unwrap();
    let graph = reg.get_mut(g).unwrap();
    let x = graph.placeholder(&[2, 3], DType::F32, "x").unwrap();
    let w = graph
        .variable(&[3, 1], DType::F32, Initializer::Ones, true, "w")
        .unwrap();
    let y = graph.matmul(x, w, false, false).unwrap();
    let loss = graph.reduce_sum(y).unwrap();
    let dw = graph.gradients(&[loss], &[w], &[]).unwrap()[0].unwrap();
    let step = graph.sgd_update(w, dw, None, 0.1, 0.).unwrap();
    (
        g,
        Linear {
            x,
            w,
            y,
            loss,
            step,
        },
    )
}

#[test]
fn define_and_run_holds_no_data() {
    let mut reg = GraphRegistry::new();
    let (g, m) = staged_linear(&mut reg, "staged");
    assert!(reg.get(g).unwrap().preserved_data(m.y).unwrap().is_none());
    assert_eq!(reg.get_variable_data(m.w).unwrap_err().kind(), ErrorKind::Runtime);
    assert_eq!(reg.alloc_variable_data(m.w).unwrap_err().kind(), ErrorKind::Runtime);
    assert_eq!(
        reg.get_detached_variable_data(m.w).unwrap_err().kind(),
        ErrorKind::Runtime
    );
    assert!(reg.get(g).unwrap().exec_plans().unwrap().is_empty());
}

#[test]
fn run_levels() {
    let mut reg = GraphRegistry::new();
    let (g, m) = staged_linear(&mut reg, "levels");

    let out = reg
        .run_with_options(g, RunOptions::new(vec![m.y]).run_level(RunLevel::Topo))
        .unwrap();
    assert!(out.is_empty());
    let plan = reg.get(g).unwrap().active_exec_plan().unwrap().unwrap().clone();
    assert_eq!(plan.strategy(), StrategyKey::new(0, 0));
    let exec = reg.get(plan.exec_graph()).unwrap();
    assert_eq!(exec.graph_type(), GraphType::Executable);
    assert_eq!(exec.exec_strategy().unwrap(), StrategyKey::new(0, 0));

    reg.run_with_options(g, RunOptions::new(vec![]).run_level(RunLevel::Alloc))
        .unwrap();
    assert_eq!(reg.get_detached_variable_data(m.w).unwrap().to_vec(), vec![1.; 3]);

    let out = reg
        .run_with_options(
            g,
            RunOptions::new(vec![m.y])
                .feed(m.x, x_data())
                .run_level(RunLevel::ComputeOnly),
        )
        .unwrap();
    assert_eq!(out[0].to_vec(), vec![6., 15.]);

    let err = reg
        .run_with_options(
            g,
            RunOptions::new(vec![m.step])
                .feed(m.x, x_data())
                .loss(m.loss)
                .run_level(RunLevel::Grad),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Value);

    let err = reg
        .run_with_options(g, RunOptions::new(vec![m.y]).feed(m.x, x_data()).micro_batches(0))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Value);

    let out = reg
        .run_with_options(
            g,
            RunOptions::new(vec![m.loss, m.step])
                .feed(m.x, x_data())
                .loss(m.loss),
        )
        .unwrap();
    assert_eq!(out[0].item().unwrap(), 21.);
    // colsum(x) = [5, 7, 9]
    let expected = NDArray::from_vec(vec![0.5, 0.3, 0.1], &[3, 1]).unwrap();
    assert!(out[1].allclose(&expected, 1e-5));
    assert!(reg.get_detached_variable_data(m.w).unwrap().allclose(&expected, 1e-5));
}

#[test]
fn registered_data_initializes_instantiations() {
    let mut reg = GraphRegistry::new();
    let (g, m) = staged_linear(&mut reg, "registered");
    let w0 = NDArray::from_vec(vec![2., 2., 2.], &[3, 1]).unwrap();
    reg.register_variable_data(m.w, w0).unwrap();

    reg.run_with_options(
        g,
        RunOptions::new(vec![m.loss]).feed(m.x, x_data()).loss(m.loss),
    )
    .unwrap();
    let expected = NDArray::from_vec(vec![1.5, 1.3, 1.1], &[3, 1]).unwrap();
    assert!(reg.get_detached_variable_data(m.w).unwrap().allclose(&expected, 1e-5));

    reg.reset_variable_data(m.w, Initializer::Zeros).unwrap();
    assert_eq!(reg.get_detached_variable_data(m.w).unwrap().to_vec(), vec![0.; 3]);
}

#[test]
fn gradients_accumulate_until_the_update() {
    let mut reg = GraphRegistry::new();
    let (g, m) = staged_linear(&mut reg, "accumulate");
    let grad_only = || {
        RunOptions::new(vec![m.loss])
            .feed(m.x, x_data())
            .loss(m.loss)
            .run_level(RunLevel::Grad)
    };
    reg.run_with_options(g, grad_only()).unwrap();
    reg.run_with_options(g, grad_only()).unwrap();
    let exec = reg.get(g).unwrap().active_exec_plan().unwrap().unwrap().exec_graph();
    assert!(reg.get(exec).unwrap().has_pending_grads().unwrap());
    assert_eq!(reg.get_detached_variable_data(m.w).unwrap().to_vec(), vec![1.; 3]);

    reg.run_with_options(
        g,
        RunOptions::new(vec![]).feed(m.x, x_data()).loss(m.loss).grad_scale(0.5),
    )
    .unwrap();
    assert!(!reg.get(exec).unwrap().has_pending_grads().unwrap());
    // three accumulated steps, halved
    let expected = NDArray::from_vec(vec![0.25, -0.05, -0.35], &[3, 1]).unwrap();
    assert!(reg.get_detached_variable_data(m.w).unwrap().allclose(&expected, 1e-5));
}

#[test]
fn micro_batches_match_the_full_batch() {
    let mut reg = GraphRegistry::new();
    let (full, a) = staged_linear(&mut reg, "full");
    let (split, b) = staged_linear(&mut reg, "split");

    let out_full = reg
        .run_with_options(
            full,
            RunOptions::new(vec![a.y]).feed(a.x, x_data()).loss(a.loss),
        )
        .unwrap();
    let out_split = reg
        .run_with_options(
            split,
            RunOptions::new(vec![b.y])
                .feed(b.x, x_data())
                .loss(b.loss)
                .micro_batches(2),
        )
        .unwrap();
    assert_eq!(out_full[0].shape(), &[2, 1]);
    assert!(out_full[0].allclose(&out_split[0], 1e-6));
    let wa = reg.get_detached_variable_data(a.w).unwrap();
    let wb = reg.get_detached_variable_data(b.w).unwrap();
    assert!(wa.allclose(&wb, 1e-5));

    let exec = reg.get(split).unwrap().active_exec_plan().unwrap().unwrap().exec_graph();
    // one plan for the [1, 3] micro-batches
    assert_eq!(reg.get(exec).unwrap().num_shape_plans().unwrap(), 1);
}

#[test]
fn growing_the_staged_graph_replaces_its_plan() {
    let mut reg = GraphRegistry::new();
    let (g, m) = staged_linear(&mut reg, "grow");
    reg.run_with_options(
        g,
        RunOptions::new(vec![m.loss]).feed(m.x, x_data()).loss(m.loss),
    )
    .unwrap();
    let first = reg.get(g).unwrap().active_exec_plan().unwrap().unwrap().exec_graph();
    let graphs = reg.num_graphs();

    let z = reg.get_mut(g).unwrap().neg(m.y).unwrap();
    let out = reg
        .run_with_options(g, RunOptions::new(vec![z]).feed(m.x, x_data()).run_level(RunLevel::ComputeOnly))
        .unwrap();

    let dar = reg.get(g).unwrap();
    assert_eq!(dar.exec_plans().unwrap().len(), 1);
    let second = dar.active_exec_plan().unwrap().unwrap().exec_graph();
    assert_ne!(first, second);
    assert!(reg.get(first).is_err());
    assert_eq!(reg.num_graphs(), graphs);

    // the trained weights moved over: w = [0.5, 0.3, 0.1]
    let expected = NDArray::from_vec(vec![-1.4, -4.1], &[2, 1]).unwrap();
    assert!(out[0].allclose(&expected, 1e-5));
}

#[test]
fn instantiate_and_delete() {
    let mut reg = GraphRegistry::new();
    let (g, _) = staged_linear(&mut reg, "inst");
    let exec = reg.instantiate(g, 0, 0).unwrap();
    assert_eq!(reg.instantiate(g, 0, 0).unwrap(), exec);
    assert_eq!(reg.get(g).unwrap().exec_plans().unwrap().len(), 1);
    assert!(reg.set_exec_plan(g, 1).is_err());
    assert_eq!(reg.get(exec).unwrap().op_type_count("SGDUpdate"), 1);

    reg.delete_graph(g).unwrap();
    assert!(reg.get(exec).is_err());
    assert_eq!(reg.num_graphs(), 0);
}

#[test]
fn define_by_run_recomputes_for_new_feeds() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::DefineByRun, "refeed").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let x = graph.placeholder(&[2], DType::F32, "x").unwrap();
    let y = graph.add_scalar(x, 1.).unwrap();
    let z = graph.square(y).unwrap();

    let feed = |v: Vec<f32>| NDArray::from_vec(v, &[2]).unwrap();
    let out = reg.run(g, &[y], &[(x, feed(vec![1., 2.]))]).unwrap();
    assert_eq!(out[0].to_vec(), vec![2., 3.]);
    let out = reg.run(g, &[y, z], &[(x, feed(vec![10., 20.]))]).unwrap();
    assert_eq!(out[0].to_vec(), vec![11., 21.]);
    assert_eq!(out[1].to_vec(), vec![121., 441.]);
}

#[test]
fn eager_graphs_recompute_for_new_feeds() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::Eager, "eager_refeed").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let x = graph.placeholder(&[2, 3], DType::F32, "x").unwrap();
    let y = graph.neg(x).unwrap();

    reg.run(g, &[y], &[(x, x_data())]).unwrap();
    let twice = NDArray::from_vec(vec![2., 4., 6., 8., 10., 12.], &[2, 3]).unwrap();
    let out = reg.run(g, &[y], &[(x, twice)]).unwrap();
    assert_eq!(out[0].to_vec(), vec![-2., -4., -6., -8., -10., -12.]);
}

#[test]
fn define_by_run_updates_apply_on_every_run() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::DefineByRun, "steps").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let w = graph
        .variable(&[2], DType::F32, Initializer::Ones, true, "w")
        .unwrap();
    let y = graph.square(w).unwrap();
    let loss = graph.reduce_sum(y).unwrap();
    let dw = graph.gradients(&[loss], &[w], &[]).unwrap()[0].unwrap();
    let step = graph.sgd_update(w, dw, None, 0.1, 0.).unwrap();

    let filled = |v: f32| NDArray::from_vec(vec![v; 2], &[2]).unwrap();

    // w <- w - 0.1 * 2w
    reg.run(g, &[step], &[]).unwrap();
    assert!(reg.get_variable_data(w).unwrap().allclose(&filled(0.8), 1e-6));
    let out = reg.run(g, &[loss, step], &[]).unwrap();
    assert!((out[0].item().unwrap() - 1.28).abs() < 1e-5);
    assert!(reg.get_variable_data(w).unwrap().allclose(&filled(0.64), 1e-6));
}

#[test]
fn anonymous_names_skip_taken_ones() {
    let mut reg = GraphRegistry::new();
    let first = reg.make_graph(GraphType::Eager, "eager_1").unwrap();
    let anon = reg.make_graph(GraphType::Eager, "").unwrap();
    assert_ne!(first, anon);
    assert_eq!(reg.get(anon).unwrap().name(), "eager_1_1");
    assert_eq!(reg.get_by_name("eager_1").unwrap().id(), first);
}
