use std::{env, path::PathBuf, str::FromStr};

use crate::{bail_value, Result};

pub const DEFAULT_GRAPH_INITIAL_CAPACITY: usize = 4096;
pub const DEFAULT_MAX_MICRO_BATCHES: usize = 64;

/// Engine-wide knobs shared by every graph created from one registry.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Initial capacity reserved for the op and tensor arenas of a new graph.
    pub graph_capacity: usize,
    /// Upper bound on `num_micro_batches` accepted by a run.
    pub max_micro_batches: usize,
    /// Build gradient switch graphs even when no accumulated gradient is pending.
    pub need_grad_switch_topo: bool,
    /// Parallelism handed to the CPU kernels.
    pub kernel_threads: usize,
    /// Where [`crate::Graph::visualize`] drops its intermediate DOT file.
    pub dump_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            graph_capacity: DEFAULT_GRAPH_INITIAL_CAPACITY,
            max_micro_batches: DEFAULT_MAX_MICRO_BATCHES,
            need_grad_switch_topo: false,
            kernel_threads: num_cpus::get(),
            dump_dir: default_dump_dir(),
        }
    }
}

impl EngineConfig {
    /// Defaults, overridden by any `FLUXGRAPH_*` variables present in the environment.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = parse_var::<usize>("FLUXGRAPH_GRAPH_CAPACITY")? {
            cfg.graph_capacity = v;
        }
        if let Some(v) = parse_var::<usize>("FLUXGRAPH_MAX_MICRO_BATCHES")? {
            if v == 0 {
                bail_value!("FLUXGRAPH_MAX_MICRO_BATCHES must be positive");
            }
            cfg.max_micro_batches = v;
        }
        if let Some(v) = parse_var::<bool>("FLUXGRAPH_GRAD_SWITCH_TOPO")? {
            cfg.need_grad_switch_topo = v;
        }
        if let Some(v) = parse_var::<usize>("FLUXGRAPH_KERNEL_THREADS")? {
            cfg.kernel_threads = v.max(1);
        }
        if let Ok(dir) = env::var("FLUXGRAPH_DUMP_DIR") {
            cfg.dump_dir = PathBuf::from(dir);
        }
        Ok(cfg)
    }
}

fn default_dump_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("fluxgraph")
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => Ok(Some(v)),
            Err(_) => bail_value!("environment variable {name} has malformed value {raw:?}"),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_variable_is_a_value_error() {
        env::set_var("FLUXGRAPH_TEST_ONLY_PARSE", "many");
        let err = parse_var::<usize>("FLUXGRAPH_TEST_ONLY_PARSE").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Value);
        env::set_var("FLUXGRAPH_TEST_ONLY_PARSE", " 12 ");
        assert_eq!(parse_var::<usize>("FLUXGRAPH_TEST_ONLY_PARSE").unwrap(), Some(12));
        env::remove_var("FLUXGRAPH_TEST_ONLY_PARSE");
        assert_eq!(parse_var::<usize>("FLUXGRAPH_TEST_ONLY_PARSE").unwrap(), None);
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.graph_capacity, DEFAULT_GRAPH_INITIAL_CAPACITY);
        assert_eq!(cfg.max_micro_batches, DEFAULT_MAX_MICRO_BATCHES);
        assert!(cfg.kernel_threads >= 1);
    }
}
