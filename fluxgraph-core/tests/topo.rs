use std::collections::HashMap;

use fluxgraph_core::{
    DType, Device, Graph, GraphRegistry, GraphType, OpKind, OpMeta, Operator, Tensor, UnaryOpType,
};

fn position(order: &[Operator]) -> HashMap<Operator, usize> {
    order.iter().enumerate().map(|(i, op)| (*op, i)).collect()
}

/// Every producer precedes each of its consumers.
fn assert_valid(graph: &Graph, order: &[Operator]) {
    let pos = position(order);
    for op in order {
        for t in graph.inputs(*op).unwrap() {
            let p = graph.producer(t).unwrap().unwrap();
            if let Some(pp) = pos.get(&p) {
                assert!(pp < &pos[op], "{:?} sorted after its consumer {:?}", p, op);
            }
        }
    }
}

/// A send of `inputs` to device 1, one destination per input.
fn send(graph: &mut Graph, inputs: Vec<Tensor>) -> Operator {
    let kind = OpKind::BatchedISendIRecv {
        dst_devices: vec![Device::cuda(1); inputs.len()],
    };
    graph.make_op(kind, inputs, OpMeta::new().name("send")).unwrap()
}

macro_rules! test_for_graph_type {
    ($ty:expr, $name:ident) => {
        mod $name {
            use super::*;

            fn graph(reg: &mut GraphRegistry) -> &mut Graph {
                let id = reg.make_graph($ty, "topo").unwrap();
                reg.get_mut(id).unwrap()
            }

            #[test]
            fn producers_come_first() {
                let mut reg = GraphRegistry::new();
                let g = graph(&mut reg);
                let x = g.placeholder(&[4], DType::F32, "x").unwrap();
                let a = g.exp(x).unwrap();
                let b = g.relu(x).unwrap();
                let c = g.add(a, b).unwrap();
                let d = g.square(c).unwrap();

                let order = g.topo_sort(&g.sink_ops(), |_| false).unwrap();
                assert_eq!(order.len(), 5);
                assert_valid(g, &order);
                assert_eq!(order.last(), g.producer(d).unwrap().as_ref());
            }

            #[test]
            fn readers_precede_inplace_writers() {
                let mut reg = GraphRegistry::new();
                let g = graph(&mut reg);
                let x = g.placeholder(&[4], DType::F32, "x").unwrap();
                let w = g.unary_inplace(UnaryOpType::Neg, x).unwrap();
                // made after the writer, but reads the value before it
                let r = g.exp(x).unwrap();

                let order = g.topo_sort_tensors(&[w, r], |_| false).unwrap();
                let pos = position(&order);
                let writer = g.producer(w).unwrap().unwrap();
                let reader = g.producer(r).unwrap().unwrap();
                assert!(pos[&reader] < pos[&writer]);
            }

            #[test]
            fn order_is_stable() {
                let mut reg = GraphRegistry::new();
                let g = graph(&mut reg);
                let mut outs = Vec::new();
                for i in 0..6 {
                    let x = g.placeholder(&[2], DType::F32, &format!("x{i}")).unwrap();
                    outs.push(g.relu(x).unwrap());
                }
                let y = g.sum(&outs).unwrap();
                let first = g.topo_sort_tensors(&[y], |_| false).unwrap();
                for _ in 0..5 {
                    assert_eq!(g.topo_sort_tensors(&[y], |_| false).unwrap(), first);
                }
                assert_valid(g, &first);
            }

            #[test]
            fn stop_at_cuts_traversal() {
                let mut reg = GraphRegistry::new();
                let g = graph(&mut reg);
                let x = g.placeholder(&[2], DType::F32, "x").unwrap();
                let a = g.relu(x).unwrap();
                let b = g.neg(a).unwrap();
                let a_op = g.producer(a).unwrap().unwrap();

                let order = g
                    .topo_sort_tensors(&[b], |def| def.id() == a_op.id)
                    .unwrap();
                assert_eq!(order.len(), 2);
                assert_eq!(order[0], a_op);
            }

            #[test]
            fn sends_follow_their_slice() {
                let mut reg = GraphRegistry::new();
                let g = graph(&mut reg);
                let x = g.placeholder(&[4], DType::F32, "x").unwrap();
                let a = g.exp(x).unwrap();
                let sliced = g.slice(a, vec![0], vec![2]).unwrap();
                let b = g.exp(x).unwrap();
                let c = g.exp(b).unwrap();
                let d = g.exp(c).unwrap();
                let send = send(g, vec![sliced]);

                let mut frontier = vec![send];
                frontier.push(g.producer(d).unwrap().unwrap());
                let order = g.topo_sort(&frontier, |_| false).unwrap();
                assert_valid(g, &order);
                let pos = position(&order);
                let slice_op = g.producer(sliced).unwrap().unwrap();
                assert_eq!(pos[&send], pos[&slice_op] + 1);
                // without the move, the unrelated chain would sit in between
                assert!(pos[&g.producer(c).unwrap().unwrap()] > pos[&send]);
            }

            #[test]
            fn sends_stay_behind_their_other_producers() {
                let mut reg = GraphRegistry::new();
                let g = graph(&mut reg);
                let x = g.placeholder(&[4], DType::F32, "x").unwrap();
                let a = g.exp(x).unwrap();
                let sliced = g.slice(a, vec![0], vec![2]).unwrap();
                let b = g.exp(x).unwrap();
                let c = g.slice(b, vec![2], vec![2]).unwrap();
                let c = g.exp(c).unwrap();
                let send = send(g, vec![sliced, c]);

                let order = g.topo_sort(&[send], |_| false).unwrap();
                assert_valid(g, &order);
                let pos = position(&order);
                let slice_op = g.producer(sliced).unwrap().unwrap();
                let blocker = g.producer(c).unwrap().unwrap();
                assert!(pos[&slice_op] < pos[&blocker]);
                assert_eq!(order.last(), Some(&send));
            }

            #[test]
            fn backward_ops_follow_forward_ops() {
                let mut reg = GraphRegistry::new();
                let g = graph(&mut reg);
                let x = g.placeholder(&[3], DType::F32, "x").unwrap();
                let y = g.square(x).unwrap();
                let loss = g.reduce_sum(y).unwrap();
                let dx = g.gradients(&[loss], &[x], &[]).unwrap()[0].unwrap();

                let order = g.topo_sort_tensors(&[dx], |_| false).unwrap();
                let (fwd, bwd) = g.disentangle_forward_and_backward_ops(&order).unwrap();
                assert!(!fwd.is_empty() && !bwd.is_empty());
                for op in &bwd {
                    for t in g.outputs(*op).unwrap() {
                        assert!(g.tensor(t).unwrap().is_grad());
                    }
                }

                let (fwd, bwd) = g
                    .disentangle_forward_and_backward_ops_by_loss(&order, &[loss])
                    .unwrap();
                let loss_op = g.producer(loss).unwrap().unwrap();
                assert_eq!(fwd.last(), Some(&loss_op));
                assert!(bwd.contains(&g.producer(dx).unwrap().unwrap()));
            }
        }
    };
}

test_for_graph_type!(GraphType::Eager, eager);
test_for_graph_type!(GraphType::DefineByRun, define_by_run);
test_for_graph_type!(GraphType::DefineAndRun, define_and_run);
