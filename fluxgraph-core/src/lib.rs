//! Fluxgraph is the dataflow-graph core of a distributed tensor engine.
//!
//! Programs are recorded as graphs of operators and tensors. A graph is one of
//! four kinds:
//! - **Eager**: every op computes as soon as it is made.
//! - **DefineByRun**: ops are traced, then computed by [`GraphRegistry::run`].
//! - **DefineAndRun**: ops are staged once and instantiated into an
//!   executable graph per strategy pair.
//! - **Executable**: a plan-bound graph whose tensors are sharded over a
//!   device mesh according to their [`DistributedStates`].
//!
//! Switching the strategy of a define-and-run graph moves parameters,
//! optimizer state and pending gradients from one executable graph to the
//! next through a compiled redistribution graph.
//!
//! ## A quick guide
//! - Create a [`GraphRegistry`]; it owns every graph.
//! - Make a graph with [`GraphRegistry::make_graph`] and build ops with the
//!   [`Graph`] builder methods.
//! - Differentiate with [`Graph::gradients`].
//! - Run with [`GraphRegistry::run`] or [`GraphRegistry::run_with_options`].
//!
//! ```
//! use fluxgraph_core::{DType, GraphRegistry, GraphType, Initializer, R1};
//! use fluxgraph_core::Shape;
//!
//! let mut reg = GraphRegistry::new();
//! let g = reg.make_graph(GraphType::DefineByRun, "square").unwrap();
//! let graph = reg.get_mut(g).unwrap();
//! let x = graph
//!     .variable(&R1::<3>::shape(), DType::F32, Initializer::Constant(3.), true, "x")
//!     .unwrap();
//! let y = graph.square(x).unwrap();
//! let grads = graph.gradients(&[y], &[x], &[]).unwrap();
//! let dx = grads[0].unwrap();
//!
//! let out = reg.run(g, &[y, dx], &[]).unwrap();
//! assert_eq!(out[0].to_vec(), vec![9.0; 3]);
//! assert_eq!(out[1].to_vec(), vec![6.0; 3]);
//! ```

pub mod comm;
mod config;
mod cpu_storage;
mod device;
pub mod dist_states;
mod dtype;
mod error;
pub mod graph;
pub mod op;
mod shape;
mod storage;
pub mod switch;
mod tensor;

pub use comm::{CommBackend, CommStats, LocalComm, Transfer};
pub use config::{EngineConfig, DEFAULT_GRAPH_INITIAL_CAPACITY, DEFAULT_MAX_MICRO_BATCHES};
pub use cpu_storage::Initializer;
pub use device::{Device, DeviceGroup, DeviceGroupHierarchy, DeviceGroupUnion, DeviceKind};
pub use dist_states::{
    DistributedStates, DistributedStatesHierarchy, DistributedStatesUnion, DUPLICATE, PARTIAL,
};
pub use dtype::DType;
pub use error::{Context, Error, ErrorKind, Result};
pub use graph::{
    ExecGraphPlan, Graph, GraphId, GraphRegistry, GraphType, OpClassTimes, RunLevel, RunOptions,
    StrategyKey, SubGraph, SubGraphOpType, SubGraphType,
};
pub use op::{
    BinaryOpType, CommTarget, ComputeCtx, CustomOp, OpId, OpKind, OpMeta, Operator, OperatorDef,
    UnaryOpType,
};
pub use shape::{IntSymbol, Shape, SymbolicShape, R1, R2, R3, R4, R5, R6};
pub use storage::{NDArray, ShardedArray};
pub use tensor::{Layout, Tensor, TensorDef, TensorId, TensorMeta};
