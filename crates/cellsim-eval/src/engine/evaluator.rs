use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use cellsim_common::{EvalError, EvalErrorExtra, EvalErrorKind, NodeId, Step};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::cell::{CellRef, VariableCell};
use crate::engine::EvalConfig;
use crate::engine::scheduler::{FanOutStats, ParallelScheduler};
use crate::run_state::RunState;
use crate::stack;
use crate::traits::{DebugHook, HistoryStore, ObjectGraph};

pub(crate) struct EvalCore {
    pub(crate) graph: Arc<dyn ObjectGraph>,
    pub(crate) config: EvalConfig,
    step: AtomicU64,
    pub(crate) run: RunState,
    history: Option<Arc<dyn HistoryStore>>,
    debug: Option<Arc<dyn DebugHook>>,
    jitter_rng: Mutex<SmallRng>,
    pub(crate) scheduler: Option<ParallelScheduler>,
}

/// Demand-driven resolver of cell values. Cheap to clone; every clone
/// shares the same step clock, run state and worker pool.
#[derive(Clone)]
pub struct Evaluator {
    core: Arc<EvalCore>,
}

/// Clears `under_computation` on every exit from a recomputation,
/// including unwinding out of the equation.
struct ComputeGuard<'a>(&'a VariableCell);

impl Drop for ComputeGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().under_computation = false;
    }
}

impl Evaluator {
    pub(crate) fn new(
        graph: Arc<dyn ObjectGraph>,
        config: EvalConfig,
        history: Option<Arc<dyn HistoryStore>>,
        debug: Option<Arc<dyn DebugHook>>,
        scheduler: Option<ParallelScheduler>,
    ) -> Self {
        let jitter_rng = Mutex::new(SmallRng::seed_from_u64(config.run_seed));
        Self {
            core: Arc::new(EvalCore {
                graph,
                config,
                step: AtomicU64::new(0),
                run: RunState::new(),
                history,
                debug,
                jitter_rng,
                scheduler,
            }),
        }
    }

    pub fn graph(&self) -> &Arc<dyn ObjectGraph> {
        &self.core.graph
    }

    pub fn config(&self) -> &EvalConfig {
        &self.core.config
    }

    pub fn run_state(&self) -> &RunState {
        &self.core.run
    }

    pub(crate) fn scheduler(&self) -> Option<&ParallelScheduler> {
        self.core.scheduler.as_ref()
    }

    pub fn step(&self) -> Step {
        self.core.step.load(Ordering::Acquire)
    }

    pub fn set_step(&self, step: Step) {
        self.core.step.store(step, Ordering::Release);
    }

    /// Move the clock one step forward and return the new step.
    pub fn advance(&self) -> Step {
        self.core.step.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Value of `cell` `lag` steps back, recomputing it when a lag-0
    /// request finds it stale.
    pub fn resolve(
        &self,
        cell: &VariableCell,
        caller: Option<NodeId>,
        lag: u32,
    ) -> Result<f64, EvalError> {
        let t = self.step();

        if cell.is_parameter() {
            return Ok(cell.current());
        }

        if cell.is_function() {
            if lag > 0 {
                let s = cell.state.lock();
                let depth = s.history.depth();
                if lag > depth {
                    return Err(self.lag_error(
                        EvalError::new(EvalErrorKind::InvalidLag).with_extra(
                            EvalErrorExtra::Lag {
                                requested: lag,
                                available: depth,
                            },
                        ),
                        cell,
                        caller,
                        lag,
                        t,
                    ));
                }
                return s
                    .history
                    .read(lag - 1)
                    .map_err(|e| self.lag_error(e, cell, caller, lag, t));
            }
            if caller.is_none() {
                return Ok(cell.current());
            }
            return self.recompute(cell, caller, t, false);
        }

        {
            let s = cell.state.lock();
            // Value as of the start of this step vs value already advanced
            // this step: a cell not yet updated at `t` is one rotation behind.
            let eff_lag = if s.last_update < t {
                lag as i64 - 1
            } else {
                lag as i64
            };

            if lag != 0 {
                if eff_lag < 0 {
                    return Err(self.lag_error(
                        EvalError::new(EvalErrorKind::InvalidLag).with_extra(
                            EvalErrorExtra::Lag {
                                requested: lag,
                                available: s.history.depth(),
                            },
                        ),
                        cell,
                        caller,
                        lag,
                        t,
                    ));
                }
                if eff_lag as u32 <= s.history.depth() {
                    return s
                        .history
                        .read(eff_lag as u32)
                        .map_err(|e| self.lag_error(e, cell, caller, lag, t));
                }
                let depth = s.history.depth();
                drop(s);
                return self.read_persisted(cell, caller, lag, depth, t);
            }

            if s.is_fresh(t) {
                return Ok(s.history.current());
            }
        }

        self.recompute(cell, caller, t, true)
    }

    fn read_persisted(
        &self,
        cell: &VariableCell,
        caller: Option<NodeId>,
        lag: u32,
        depth: u32,
        t: Step,
    ) -> Result<f64, EvalError> {
        let stored = match (&self.core.history, cell.persist_to_history()) {
            (Some(store), true) => t
                .checked_sub(lag as Step)
                .and_then(|step| store.fetch(cell, step)),
            _ => None,
        };
        stored.ok_or_else(|| {
            self.lag_error(
                EvalError::new(EvalErrorKind::InvalidLag).with_extra(EvalErrorExtra::Lag {
                    requested: lag,
                    available: depth,
                }),
                cell,
                caller,
                lag,
                t,
            )
        })
    }

    fn lag_error(
        &self,
        err: EvalError,
        cell: &VariableCell,
        caller: Option<NodeId>,
        lag: u32,
        t: Step,
    ) -> EvalError {
        err.with_message(format!("'{}' requested with lag {lag}", cell.name()))
            .at_cell(cell.name(), cell.owner())
            .with_caller(caller)
            .at_step(t)
            .with_stack(stack::snapshot())
    }

    fn recompute(
        &self,
        cell: &VariableCell,
        caller: Option<NodeId>,
        t: Step,
        memoized: bool,
    ) -> Result<f64, EvalError> {
        // A worker may be racing this thread for the same cell.
        let _exclusive = cell.compute.lock();
        {
            let mut s = cell.state.lock();
            if memoized && s.is_fresh(t) {
                return Ok(s.history.current());
            }
            if s.under_computation {
                return Err(EvalError::new(EvalErrorKind::Deadlock)
                    .with_message(format!(
                        "the equation for '{}' requested its own value while computing its current value",
                        cell.name()
                    ))
                    .at_cell(cell.name(), cell.owner())
                    .with_caller(caller)
                    .at_step(t)
                    .with_stack(stack::snapshot()));
            }
            s.under_computation = true;
        }
        let guard = ComputeGuard(cell);

        let started = self.core.config.profile.then(Instant::now);
        let outcome = {
            let _frame = stack::enter(cell.shared_name(), cell.owner());
            let ctx = CallContext {
                evaluator: self,
                cell,
                caller,
                step: t,
            };
            match cell.equation() {
                Some(eq) => eq.evaluate(&ctx).map_err(|e| e.with_stack(stack::snapshot())),
                None => Err(EvalError::equation("no equation defined")
                    .with_stack(stack::snapshot())),
            }
        };

        let value = match outcome {
            Ok(v) => self.screen_non_finite(cell, caller, t, v),
            Err(e) => {
                drop(guard);
                self.finish_deferred_delete(cell);
                return Err(e
                    .at_cell(cell.name(), cell.owner())
                    .with_caller(caller)
                    .at_step(t));
            }
        };

        let jitter = if cell.is_periodic() && cell.period_jitter() > 0 {
            self.core
                .jitter_rng
                .lock()
                .gen_range(0..=cell.period_jitter()) as Step
        } else {
            0
        };
        {
            let mut s = cell.state.lock();
            s.history.push(value);
            s.last_update = t;
            if cell.is_periodic() {
                s.next_update = t + cell.period() as Step + jitter;
            }
            s.profile.computations += 1;
            if let Some(started) = started {
                s.profile.elapsed += started.elapsed();
            }
        }
        drop(guard);
        self.finish_deferred_delete(cell);

        if cell.persist_to_history()
            && let Some(store) = &self.core.history
        {
            store.record(cell, t, value);
        }
        self.fire_debug(cell, caller, t, value);

        Ok(value)
    }

    fn screen_non_finite(
        &self,
        cell: &VariableCell,
        caller: Option<NodeId>,
        t: Step,
        value: f64,
    ) -> f64 {
        if !value.is_finite() {
            self.core.run.enter_non_finite_mode(
                EvalError::new(EvalErrorKind::NonFiniteResult)
                    .with_message(format!("equation for '{}' produced {value}", cell.name()))
                    .at_cell(cell.name(), cell.owner())
                    .with_caller(caller)
                    .at_step(t)
                    .with_stack(stack::snapshot()),
            );
        }
        value
    }

    fn finish_deferred_delete(&self, cell: &VariableCell) {
        let owner = self.core.graph.owner_of(cell);
        if self.core.graph.is_delete_pending(owner) {
            self.core.graph.complete_deferred_delete(owner);
        }
    }

    fn fire_debug(&self, cell: &VariableCell, caller: Option<NodeId>, t: Step, value: f64) {
        let (Some(hook), Some(cond)) = (&self.core.debug, cell.debug_condition()) else {
            return;
        };
        if cell.debug_trigger() && cond.holds(value, self.core.config.debug_mode) {
            hook.triggered(cell, caller, t, value);
        }
    }

    /// Overwrite the current value of `cell` as if it had been computed at
    /// `step`.
    pub fn write(&self, cell: &VariableCell, value: f64, step: Step) -> Result<(), EvalError> {
        if !value.is_finite() && !self.core.run.non_finite_mode() {
            return Err(EvalError::new(EvalErrorKind::NonFiniteResult)
                .with_message(format!("write of '{}' requested with {value}", cell.name()))
                .at_cell(cell.name(), cell.owner()));
        }
        let _exclusive = cell.compute.lock();
        {
            let mut s = cell.state.lock();
            if s.under_computation {
                return Err(EvalError::new(EvalErrorKind::Conflict)
                    .with_message(format!(
                        "trying to write '{}' while it is under computation",
                        cell.name()
                    ))
                    .at_cell(cell.name(), cell.owner())
                    .with_stack(stack::snapshot()));
            }
            s.history.overwrite(value);
            if !cell.is_parameter() {
                s.last_update = step;
            }
        }
        if cell.persist_to_history()
            && let Some(store) = &self.core.history
        {
            store.record(cell, step, value);
        }
        Ok(())
    }

    /// The cell called `name`, searched in `node` and then up its ancestors.
    pub fn find_cell(&self, node: NodeId, name: &str) -> Result<CellRef, EvalError> {
        let graph = &self.core.graph;
        let mut cur = Some(node);
        while let Some(n) = cur {
            if let Some(cell) = graph.named_cell(n, name) {
                return Ok(cell);
            }
            cur = graph.parent_of(n);
        }
        Err(EvalError::new(EvalErrorKind::UnknownCell)
            .with_message(format!(
                "search for '{name}' failed in {}",
                graph.label(node)
            ))
            .with_stack(stack::snapshot()))
    }

    /// Resolve `cell_name` on every instance of `node_type`, in parallel
    /// when a worker pool is available and no other fan-out is in flight.
    pub fn fan_out(&self, node_type: &str, cell_name: &str) -> Result<FanOutStats, EvalError> {
        let nodes = self.core.graph.instances_of(node_type);
        self.fan_out_nodes(nodes, cell_name)
    }

    /// Like [`fan_out`](Self::fan_out), restricted to `node` and the nodes
    /// sharing its parent and type.
    pub fn fan_out_siblings(&self, node: NodeId, cell_name: &str) -> Result<FanOutStats, EvalError> {
        let nodes = self.core.graph.siblings_of_same_type(node);
        self.fan_out_nodes(nodes, cell_name)
    }

    fn fan_out_nodes(&self, nodes: Vec<NodeId>, cell_name: &str) -> Result<FanOutStats, EvalError> {
        let graph = &self.core.graph;
        let mut cells = Vec::with_capacity(nodes.len());
        for node in nodes {
            match graph.named_cell(node, cell_name) {
                Some(cell) => cells.push(cell),
                None => {
                    return Err(EvalError::new(EvalErrorKind::UnknownCell)
                        .with_message(format!(
                            "'{cell_name}' not found in {}",
                            graph.label(node)
                        ))
                        .at_step(self.step()));
                }
            }
        }
        match self.scheduler() {
            Some(scheduler) => scheduler.fan_out(self, cells),
            None => ParallelScheduler::resolve_sequential(self, &cells),
        }
    }
}

/// What an equation sees of the engine while it runs.
pub struct CallContext<'a> {
    evaluator: &'a Evaluator,
    cell: &'a VariableCell,
    caller: Option<NodeId>,
    step: Step,
}

impl<'a> CallContext<'a> {
    pub fn evaluator(&self) -> &'a Evaluator {
        self.evaluator
    }

    /// The cell being computed.
    pub fn cell(&self) -> &'a VariableCell {
        self.cell
    }

    /// Node owning the cell being computed.
    pub fn node(&self) -> NodeId {
        self.cell.owner()
    }

    pub fn caller(&self) -> Option<NodeId> {
        self.caller
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Number of equations running on this thread, this one included.
    pub fn depth(&self) -> usize {
        stack::depth()
    }

    /// Name of the cell whose equation requested this one, if any.
    pub fn trigger(&self) -> Option<String> {
        stack::trigger()
    }

    /// `name` as seen from this cell's node (searched upwards).
    pub fn value(&self, name: &str, lag: u32) -> Result<f64, EvalError> {
        self.value_in(self.node(), name, lag)
    }

    /// `name` as seen from `node` (searched upwards).
    pub fn value_in(&self, node: NodeId, name: &str, lag: u32) -> Result<f64, EvalError> {
        let cell = self.evaluator.find_cell(node, name)?;
        self.evaluator.resolve(&cell, Some(self.node()), lag)
    }

    /// This cell's own past value. `lag` 0 is a self-request and fails with
    /// `Deadlock`.
    pub fn own(&self, lag: u32) -> Result<f64, EvalError> {
        self.evaluator.resolve(self.cell, Some(self.node()), lag)
    }

    /// Sum of `name` over the children of this node of type `child_type`.
    pub fn sum(&self, child_type: &str, name: &str, lag: u32) -> Result<f64, EvalError> {
        let graph = self.evaluator.graph();
        let mut total = 0.0;
        for child in graph.children_of(self.node()) {
            if graph.type_of(child).as_deref() != Some(child_type) {
                continue;
            }
            total += self.value_in(child, name, lag)?;
        }
        Ok(total)
    }

    /// Fan `name` out over every instance of `node_type`. Nested inside a
    /// running fan-out this resolves on the current thread instead.
    pub fn fan_out(&self, node_type: &str, name: &str) -> Result<FanOutStats, EvalError> {
        self.evaluator.fan_out(node_type, name)
    }

    /// Fan `name` out over this node's siblings of the same type.
    pub fn fan_out_siblings(&self, name: &str) -> Result<FanOutStats, EvalError> {
        self.evaluator.fan_out_siblings(self.node(), name)
    }
}
