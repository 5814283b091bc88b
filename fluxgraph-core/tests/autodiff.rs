use fluxgraph_core::{DType, GraphRegistry, GraphType, Initializer, NDArray};

fn arr(data: &[f32]) -> NDArray {
    NDArray::from_vec(data.to_vec(), &[data.len()]).unwrap()
}

fn assert_close(got: &NDArray, want: &[f32]) {
    assert!(got.allclose(&arr(want), 1e-5), "got {got:?}, want {want:?}");
}

#[test]
fn square_of_a_variable() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::DefineByRun, "square").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let x = graph
        .variable(&[3], DType::F32, Initializer::Constant(3.), true, "x")
        .unwrap();
    let y = graph.square(x).unwrap();
    let dx = graph.gradients(&[y], &[x], &[]).unwrap()[0].unwrap();

    let out = reg.run(g, &[y, dx], &[]).unwrap();
    assert_close(&out[0], &[9.; 3]);
    assert_close(&out[1], &[6.; 3]);
}

#[test]
fn chain_rule_through_exp() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::DefineByRun, "chain").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let x = graph.placeholder(&[3], DType::F32, "x").unwrap();
    let e = graph.exp(x).unwrap();
    let y = graph.mul(e, x).unwrap();
    let dx = graph.gradients(&[y], &[x], &[]).unwrap()[0].unwrap();

    let xs = [0f32, 1., 2.];
    let out = reg.run(g, &[dx], &[(x, arr(&xs))]).unwrap();
    let want: Vec<f32> = xs.iter().map(|v| v.exp() * (1. + v)).collect();
    assert_close(&out[0], &want);
}

#[test]
fn fan_out_gradients_are_summed() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::DefineByRun, "fan_out").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let x = graph.placeholder(&[3], DType::F32, "x").unwrap();
    let sq = graph.mul(x, x).unwrap();
    let y = graph.add(x, sq).unwrap();
    let dx = graph.gradients(&[y], &[x], &[]).unwrap()[0].unwrap();
    assert!(graph.op_type_count("Sum") >= 1);

    let out = reg.run(g, &[dx], &[(x, arr(&[1., 2., 3.]))]).unwrap();
    assert_close(&out[0], &[3., 5., 7.]);
}

#[test]
fn unrelated_inputs_have_no_gradient() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::DefineByRun, "unrelated").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let x = graph.placeholder(&[2], DType::F32, "x").unwrap();
    let z = graph.placeholder(&[2], DType::F32, "z").unwrap();
    let y = graph.relu(x).unwrap();
    let grads = graph.gradients(&[y], &[x, z], &[]).unwrap();
    assert!(grads[0].is_some());
    assert!(grads[1].is_none());
}

#[test]
fn seeded_gradients() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::DefineByRun, "seeded").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let x = graph.placeholder(&[2], DType::F32, "x").unwrap();
    let seed = graph.placeholder(&[2], DType::F32, "seed").unwrap();
    let y = graph.square(x).unwrap();
    let dx = graph.gradients(&[y], &[x], &[Some(seed)]).unwrap()[0].unwrap();

    let out = reg
        .run(g, &[dx], &[(x, arr(&[1., -2.])), (seed, arr(&[10., 0.5]))])
        .unwrap();
    assert_close(&out[0], &[20., -2.]);
}

#[test]
fn relu_and_slice_gradients() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::DefineByRun, "masks").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let x = graph.placeholder(&[4], DType::F32, "x").unwrap();
    let r = graph.relu(x).unwrap();
    let s = graph.slice(r, vec![1], vec![2]).unwrap();
    let loss = graph.reduce_sum(s).unwrap();
    let dx = graph.gradients(&[loss], &[x], &[]).unwrap()[0].unwrap();

    let out = reg
        .run(g, &[loss, dx], &[(x, arr(&[3., -1., 2., 5.]))])
        .unwrap();
    assert_eq!(out[0].item().unwrap(), 2.);
    assert_close(&out[1], &[0., 0., 1., 0.]);
}

#[test]
fn matmul_gradients() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::Eager, "matmul").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let a_init = NDArray::from_vec(vec![1., 2., 3., 4., 5., 6.], &[2, 3]).unwrap();
    let b_init = NDArray::from_vec(vec![1., -1., 2., 0., 0.5, 3.], &[3, 2]).unwrap();
    let a = graph
        .variable(&[2, 3], DType::F32, Initializer::Provided(a_init), true, "a")
        .unwrap();
    let b = graph
        .variable(&[3, 2], DType::F32, Initializer::Provided(b_init), true, "b")
        .unwrap();
    let y = graph.matmul(a, b, false, false).unwrap();
    let loss = graph.reduce_sum(y).unwrap();
    let grads = graph.gradients(&[loss], &[a, b], &[]).unwrap();
    let (da, db) = (grads[0].unwrap(), grads[1].unwrap());

    // eager graphs compute the gradients as they are built
    let da = graph.preserved_data(da).unwrap().unwrap().to_vec();
    let db = graph.preserved_data(db).unwrap().unwrap().to_vec();
    // row sums of b, repeated per row of a
    assert_eq!(da, vec![0., 2., 3.5, 0., 2., 3.5]);
    // column sums of a, repeated per column of b
    assert_eq!(db, vec![5., 5., 7., 7., 9., 9.]);
}

#[test]
fn optimizer_step_in_define_by_run() {
    let mut reg = GraphRegistry::new();
    let g = reg.make_graph(GraphType::DefineByRun, "sgd").unwrap();
    let graph = reg.get_mut(g).unwrap();
    let w = graph
        .variable(&[2], DType::F32, Initializer::Constant(1.), true, "w")
        .unwrap();
    let v = graph
        .variable(&[2], DType::F32, Initializer::Zeros, false, "velocity")
        .unwrap();
    let pv = graph.producer(v).unwrap().unwrap();
    graph.mark_as_optimizer_variable(pv).unwrap();
    let y = graph.square(w).unwrap();
    let loss = graph.reduce_sum(y).unwrap();
    let dw = graph.gradients(&[loss], &[w], &[]).unwrap()[0].unwrap();
    let step = graph.sgd_update(w, dw, Some(v), 0.1, 0.9).unwrap();

    let out = reg.run(g, &[step], &[]).unwrap();
    // v = 0.9 * 0 + 2, w = 1 - 0.1 * 2
    assert_close(&out[0], &[0.8, 0.8]);
    assert_close(&reg.get_variable_data(w).unwrap(), &[0.8, 0.8]);
    assert_close(&reg.get_variable_data(v).unwrap(), &[2., 2.]);
}
