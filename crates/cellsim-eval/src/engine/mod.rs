//! Evaluation engine: demand-driven resolution of cells, the worker pool and
//! the parallel fan-out scheduler, and the per-step orchestration on top.

mod evaluator;
pub mod pool;
pub mod scheduler;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cellsim_common::{EvalError, NodeId, Step};
use rustc_hash::FxHashSet;

pub use evaluator::{CallContext, Evaluator};
pub use pool::WorkerPool;
pub use scheduler::{FanOutStats, ParallelScheduler};

use crate::cell::VariableCell;
use crate::run_state::RunState;
use crate::traits::{DebugHook, HistoryStore, ObjectGraph};

/// Configuration for the evaluation engine
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub enable_parallel: bool,
    /// Worker count; `None` uses the available parallelism.
    pub max_threads: Option<usize>,
    /// Longest a fan-out waits for a worker before declaring a deadlock.
    pub max_wait: Duration,
    /// Seed of the period-jitter generator.
    pub run_seed: u64,
    /// Fire `DebugCondition::Always` triggers.
    pub debug_mode: bool,
    /// Measure wall time spent in each cell's equation.
    pub profile: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            enable_parallel: true,
            max_threads: None,
            max_wait: Duration::from_secs(30),
            run_seed: 1,
            debug_mode: false,
            profile: false,
        }
    }
}

impl EvalConfig {
    pub fn with_workers(mut self, n: usize) -> Self {
        self.enable_parallel = true;
        self.max_threads = Some(n.max(1));
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.run_seed = seed;
        self
    }

    /// No worker pool; every fan-out resolves on the caller's thread.
    pub fn sequential(mut self) -> Self {
        self.enable_parallel = false;
        self
    }

    fn worker_count(&self) -> usize {
        self.max_threads.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Collaborators injected into an [`Engine`] before its workers start.
pub struct EngineBuilder {
    graph: Arc<dyn ObjectGraph>,
    config: EvalConfig,
    history: Option<Arc<dyn HistoryStore>>,
    debug: Option<Arc<dyn DebugHook>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EvalConfig) -> Self {
        self.config = config;
        self
    }

    pub fn history(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    pub fn debug_hook(mut self, hook: Arc<dyn DebugHook>) -> Self {
        self.debug = Some(hook);
        self
    }

    pub fn build(self) -> Engine {
        let pool = self
            .config
            .enable_parallel
            .then(|| Arc::new(WorkerPool::new(self.config.worker_count())));
        let scheduler = pool
            .as_ref()
            .map(|p| ParallelScheduler::new(Arc::clone(p), self.config.max_wait));
        let evaluator = Evaluator::new(self.graph, self.config, self.history, self.debug, scheduler);
        if let Some(pool) = &pool {
            pool.start(&evaluator);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            workers = pool.as_ref().map_or(0, |p| p.size()),
            "engine started"
        );

        Engine { evaluator, pool }
    }
}

/// Owns the worker pool and drives a model step by step.
pub struct Engine {
    evaluator: Evaluator,
    pool: Option<Arc<WorkerPool>>,
}

impl Engine {
    pub fn new(graph: Arc<dyn ObjectGraph>, config: EvalConfig) -> Self {
        Self::builder(graph).config(config).build()
    }

    pub fn builder(graph: Arc<dyn ObjectGraph>) -> EngineBuilder {
        EngineBuilder {
            graph,
            config: EvalConfig::default(),
            history: None,
            debug: None,
        }
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn graph(&self) -> &Arc<dyn ObjectGraph> {
        self.evaluator.graph()
    }

    pub fn run_state(&self) -> &RunState {
        self.evaluator.run_state()
    }

    pub fn step(&self) -> Step {
        self.evaluator.step()
    }

    pub fn advance(&self) -> Step {
        self.evaluator.advance()
    }

    pub fn resolve(&self, cell: &VariableCell, lag: u32) -> Result<f64, EvalError> {
        self.evaluator.resolve(cell, None, lag)
    }

    pub fn write(&self, cell: &VariableCell, value: f64, step: Step) -> Result<(), EvalError> {
        self.evaluator.write(cell, value, step)
    }

    pub fn fan_out(&self, node_type: &str, cell_name: &str) -> Result<FanOutStats, EvalError> {
        self.evaluator.fan_out(node_type, cell_name)
    }

    /// Fan out, then collect the current values in instance order.
    pub fn fan_out_values(
        &self,
        node_type: &str,
        cell_name: &str,
    ) -> Result<Vec<(NodeId, f64)>, EvalError> {
        self.fan_out(node_type, cell_name)?;
        let graph = self.graph();
        graph
            .instances_of(node_type)
            .into_iter()
            .map(|node| {
                let cell = self.evaluator.find_cell(node, cell_name)?;
                Ok((node, self.evaluator.resolve(&cell, None, 0)?))
            })
            .collect()
    }

    /// Advance the clock and bring every cell of every live node up to date.
    /// Parallel-eligible cells are fanned out once per node type.
    pub fn run_step(&self) -> Result<Step, EvalError> {
        if let Some(failure) = self.run_state().first_failure() {
            return Err(failure);
        }
        let t = self.advance();

        #[cfg(feature = "tracing")]
        let _span = tracing::debug_span!("step", t).entered();

        let graph = Arc::clone(self.graph());
        for node_type in graph.node_types() {
            let mut fanned: FxHashSet<Arc<str>> = FxHashSet::default();
            for node in graph.instances_of(&node_type) {
                for cell in graph.cells_of(node) {
                    if cell.is_parameter() {
                        continue;
                    }
                    if cell.eligible_for_parallel() {
                        let name: Arc<str> = Arc::from(cell.name());
                        if fanned.insert(name) {
                            self.fan_out(&node_type, cell.name())?;
                        }
                        continue;
                    }
                    self.evaluator.resolve(&cell, None, 0)?;
                }
            }
        }

        match self.run_state().first_failure() {
            Some(failure) => Err(failure),
            None => Ok(t),
        }
    }

    /// Run `steps` steps, stopping at the first error.
    pub fn run(&self, steps: u64) -> Result<Step, EvalError> {
        let mut t = self.step();
        for _ in 0..steps {
            t = self.run_step()?;
        }
        Ok(t)
    }

    pub fn worker_count(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.size())
    }

    /// True if `worker` is alive; reports its failure the first time it is
    /// found dead.
    pub fn check_worker(&self, worker: usize) -> bool {
        self.evaluator
            .scheduler()
            .is_some_and(|s| s.check(&self.evaluator, worker))
    }

    pub fn check_workers(&self) -> Result<(), EvalError> {
        match self.evaluator.scheduler() {
            Some(s) => s.check_all(&self.evaluator),
            None => Ok(()),
        }
    }

    /// Current values of every plotted cell, by node and name.
    pub fn plotted(&self) -> Vec<(NodeId, String, f64)> {
        let graph = self.graph();
        let mut out = Vec::new();
        for node_type in graph.node_types() {
            for node in graph.instances_of(&node_type) {
                for cell in graph.cells_of(node) {
                    if cell.plotted() {
                        out.push((node, cell.name().to_string(), cell.current()));
                    }
                }
            }
        }
        out
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
    }
}
