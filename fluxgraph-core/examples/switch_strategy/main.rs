use fluxgraph_core::{
    DType, Device, DeviceGroup, DistributedStates, DistributedStatesHierarchy,
    DistributedStatesUnion, EngineConfig, GraphRegistry, GraphType, Initializer, NDArray, OpMeta,
    RunOptions,
};

fn per_strategy(states: Vec<DistributedStates>) -> DistributedStatesHierarchy {
    DistributedStatesHierarchy::new(states.into_iter().map(DistributedStatesUnion::single).collect())
}

fn main() -> fluxgraph_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut reg = GraphRegistry::with_config(EngineConfig::from_env()?);
    let g = reg.make_graph(GraphType::DefineAndRun, "linear")?;
    let graph = reg.get_mut(g)?;
    graph.set_default_device_group(DeviceGroup::new(vec![Device::cpu(0), Device::cpu(1)])?)?;

    // Strategy 0 splits the batch, strategy 1 splits the weight columns.
    let x = graph.placeholder_with(
        &[4, 3],
        DType::F32,
        OpMeta::new().name("x").states(per_strategy(vec![
            DistributedStates::split(2, 0),
            DistributedStates::duplicate(2),
        ])),
    )?;
    let w = graph.variable_with(
        &[3, 2],
        DType::F32,
        Initializer::Ones,
        true,
        OpMeta::new().name("w").states(per_strategy(vec![
            DistributedStates::duplicate(2),
            DistributedStates::split(2, 1),
        ])),
    )?;
    let y = graph.matmul(x, w, false, false)?;
    let loss = graph.reduce_sum(y)?;
    let grads = graph.gradients(&[loss], &[w], &[])?;
    let Some(dw) = grads[0] else {
        fluxgraph_core::bail!("w does not influence the loss");
    };
    graph.sgd_update(w, dw, None, 0.01, 0.)?;

    let data = NDArray::from_vec((0..12).map(|v| v as f32).collect(), &[4, 3])?;
    for (i, strategy) in [0, 1, 0, 1].into_iter().enumerate() {
        let out = reg.run_with_options(
            g,
            RunOptions::new(vec![loss])
                .feed(x, data.clone())
                .loss(loss)
                .strategy(strategy, strategy),
        )?;
        println!("step {i} (strategy {strategy}): loss = {}", out[0].item()?);
    }
    println!("w = {:?}", reg.get_detached_variable_data(w)?);

    let (params, grads) = reg.get(g)?.num_switchers()?;
    println!("switchers built: {params} for parameters, {grads} for gradients");

    if let Err(e) = reg.get(g)?.visualize("linear.png") {
        eprintln!("not rendering the graph: {e}");
    }
    Ok(())
}
