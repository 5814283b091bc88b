//! Variable data held by a graph, per graph type.

use tracing::debug;

use crate::{
    bail_runtime, bail_value, cpu_storage::Initializer, op::OpKind, switch::plan, Device, NDArray,
    Result, Tensor, TensorId,
};

use super::{Graph, GraphState, GraphType};

impl Graph {
    /// The initializer, shape and dtype of the Variable op producing `t`.
    fn variable_spec(&self, t: TensorId) -> Result<(Initializer, Vec<usize>, crate::DType)> {
        let def = self.tensor_def(t)?;
        let Some(op) = def.producer else {
            bail_value!("{} is not produced by a variable", def.name);
        };
        match &self.op_def(op)?.kind {
            OpKind::Variable {
                shape, dtype, init, ..
            } => Ok((init.clone(), shape.clone(), *dtype)),
            other => bail_value!("{} is produced by {}, not a variable", def.name, other.type_name()),
        }
    }

    fn check_variable_value(&self, t: TensorId, value: &NDArray) -> Result<()> {
        let (_, shape, dtype) = self.variable_spec(t)?;
        if value.shape() != shape.as_slice() {
            bail_value!(
                "variable {} has shape {shape:?}, got data of shape {:?}",
                self.tensor_def(t)?.name,
                value.shape()
            );
        }
        if value.dtype() != dtype {
            crate::bail_type!(
                "variable {} has dtype {dtype}, got data of dtype {}",
                self.tensor_def(t)?.name,
                value.dtype()
            );
        }
        Ok(())
    }

    /// Give a local variable its initial value unless it already has one.
    pub(crate) fn alloc_local_variable(&mut self, t: TensorId) -> Result<()> {
        if self.local_vars.contains_key(&t) {
            return Ok(());
        }
        let (init, shape, dtype) = self.variable_spec(t)?;
        let value = NDArray::new(init.materialize(&shape)?, &shape, dtype, Device::host())?;
        debug!(graph = %self.name(), tensor = %t, "allocated variable");
        self.local_vars.insert(t, value);
        Ok(())
    }

    /// Materialize the data of variable `t`.
    ///
    /// DefineAndRun graphs hold no data of their own; the registry forwards
    /// the call to the active executable graph.
    pub fn alloc_variable_data(&mut self, t: Tensor) -> Result<()> {
        let id = self.check_tensor(t)?;
        self.variable_spec(id)?;
        match self.graph_type() {
            GraphType::Eager | GraphType::DefineByRun => self.alloc_local_variable(id),
            GraphType::Executable => self.alloc_exec_variables(),
            GraphType::DefineAndRun => {
                bail_runtime!("{} stages variables and holds no data", self.name())
            }
        }
    }

    /// Overwrite the data of variable `t` with `value`.
    pub fn register_variable_data(&mut self, t: Tensor, value: NDArray) -> Result<()> {
        let id = self.check_tensor(t)?;
        self.check_variable_value(id, &value)?;
        if let GraphState::DefineAndRun(dar) = &mut self.state {
            dar.initializers.insert(id, Initializer::Provided(value));
        } else if matches!(self.state, GraphState::Executable(_)) {
            let shards = plan::scatter(&value, self.layout_of(id)?)?;
            self.exec_state_mut()?.variables.insert(id, shards);
        } else {
            self.local_vars.insert(id, value);
            self.preserved.remove(&id);
        }
        Ok(())
    }

    /// Re-initialize variable `t` from `init`.
    pub fn reset_variable_data(&mut self, t: Tensor, init: Initializer) -> Result<()> {
        let id = self.check_tensor(t)?;
        let (_, shape, dtype) = self.variable_spec(id)?;
        if let GraphState::DefineAndRun(dar) = &mut self.state {
            dar.initializers.insert(id, init);
            return Ok(());
        }
        let value = NDArray::new(init.materialize(&shape)?, &shape, dtype, Device::host())?;
        self.register_variable_data(t, value)
    }

    /// The live value of a local variable.
    pub fn get_variable_data(&self, t: Tensor) -> Result<NDArray> {
        let id = self.check_tensor(t)?;
        self.variable_spec(id)?;
        match &self.state {
            GraphState::Eager | GraphState::DefineByRun => match self.local_vars.get(&id) {
                Some(v) => Ok(v.clone()),
                None => bail_runtime!("variable {} has not been allocated", self.tensor_def(id)?.name),
            },
            GraphState::Executable(_) => bail_runtime!(
                "{} holds variable {} as shards, use get_detached_variable_data",
                self.name(),
                self.tensor_def(id)?.name
            ),
            GraphState::DefineAndRun(_) => {
                bail_runtime!("{} stages variables and holds no data", self.name())
            }
        }
    }

    /// A host copy of the whole logical value of variable `t`.
    pub fn get_detached_variable_data(&self, t: Tensor) -> Result<NDArray> {
        let id = self.check_tensor(t)?;
        self.variable_spec(id)?;
        match &self.state {
            GraphState::Executable(st) => match st.variables.get(&id) {
                Some(shards) => {
                    let def = self.tensor_def(id)?;
                    plan::gather(def.shape(), shards, self.layout_of(id)?)
                }
                None => bail_runtime!("variable {} has not been allocated", self.tensor_def(id)?.name),
            },
            GraphState::DefineAndRun(_) => bail_runtime!(
                "{} stages variables, read them through its active executable graph",
                self.name()
            ),
            _ => self.get_variable_data(t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{graph::GraphId, DType, EngineConfig};

    fn graph(ty: GraphType) -> Graph {
        Graph::new(GraphId(0), "vars".into(), GraphState::new(ty), EngineConfig::default())
    }

    #[test]
    fn local_variables_can_be_overwritten() {
        let mut g = graph(GraphType::DefineByRun);
        let w = g.variable(&[2], DType::F32, Initializer::Zeros, true, "w").unwrap();
        g.alloc_variable_data(w).unwrap();
        assert_eq!(g.get_variable_data(w).unwrap().to_vec(), vec![0., 0.]);

        let v = NDArray::from_vec(vec![3., 4.], &[2]).unwrap();
        g.register_variable_data(w, v).unwrap();
        assert_eq!(g.get_detached_variable_data(w).unwrap().to_vec(), vec![3., 4.]);

        g.reset_variable_data(w, Initializer::Ones).unwrap();
        assert_eq!(g.get_variable_data(w).unwrap().to_vec(), vec![1., 1.]);
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let mut g = graph(GraphType::Eager);
        let w = g.variable(&[2], DType::F32, Initializer::Zeros, true, "w").unwrap();
        let v = NDArray::from_vec(vec![1., 2., 3.], &[3]).unwrap();
        let err = g.register_variable_data(w, v).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Value);
    }

    #[test]
    fn non_variables_are_rejected() {
        let mut g = graph(GraphType::DefineByRun);
        let x = g.placeholder(&[2], DType::F32, "x").unwrap();
        assert!(g.alloc_variable_data(x).is_err());
    }

    #[test]
    fn staged_graphs_keep_initializers() {
        let mut g = graph(GraphType::DefineAndRun);
        let w = g.variable(&[2], DType::F32, Initializer::Zeros, true, "w").unwrap();
        assert!(g.get_variable_data(w).is_err());
        g.reset_variable_data(w, Initializer::Constant(5.)).unwrap();
        assert!(g.dar_state().unwrap().initializers.contains_key(&w.id));
    }
}
