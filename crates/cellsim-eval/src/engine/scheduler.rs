use std::sync::Arc;
use std::time::{Duration, Instant};

use cellsim_common::{EvalError, EvalErrorExtra, EvalErrorKind};
use parking_lot::Mutex;

use crate::cell::CellRef;
use crate::engine::Evaluator;
use crate::engine::pool::WorkerPool;

/// What one fan-out did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutStats {
    /// Cells handed to workers (or resolved on the caller's thread when
    /// `parallel` is false).
    pub dispatched: usize,
    /// Cells already up to date for the current step, parameters and
    /// functions.
    pub skipped: usize,
    pub parallel: bool,
}

/// Fans the resolution of one cell name out over all instances of a node
/// type, using the worker pool.
///
/// Only one fan-out is in flight at a time; a fan-out requested while
/// another runs (typically from inside an equation executing on a worker)
/// resolves its cells on the requesting thread instead of nesting.
pub struct ParallelScheduler {
    pool: Arc<WorkerPool>,
    in_flight: Mutex<()>,
    max_wait: Duration,
}

impl ParallelScheduler {
    pub(crate) fn new(pool: Arc<WorkerPool>, max_wait: Duration) -> Self {
        Self {
            pool,
            in_flight: Mutex::new(()),
            max_wait,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub(crate) fn fan_out(
        &self,
        evaluator: &Evaluator,
        cells: Vec<CellRef>,
    ) -> Result<FanOutStats, EvalError> {
        if let Some(failure) = evaluator.run_state().first_failure() {
            return Err(failure);
        }
        let Some(_token) = self.in_flight.try_lock() else {
            return Self::resolve_sequential(evaluator, &cells);
        };

        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("fan_out", cells = cells.len()).entered();

        let t = evaluator.step();
        let mut stats = FanOutStats {
            parallel: true,
            ..FanOutStats::default()
        };

        for cell in cells {
            if cell.is_parameter() || cell.is_function() || cell.is_fresh(t) {
                stats.skipped += 1;
                continue;
            }
            let mut pending = cell;
            loop {
                match self.pool.try_assign(pending) {
                    Ok(_) => break,
                    Err(back) => {
                        pending = back;
                        self.wait_until(evaluator, "a free worker", |pool| pool.any_free())?;
                    }
                }
            }
            stats.dispatched += 1;
        }

        self.wait_until(evaluator, "fan-out completion", |pool| pool.busy_count() == 0)?;
        Ok(stats)
    }

    /// Resolve every cell on the calling thread.
    pub(crate) fn resolve_sequential(
        evaluator: &Evaluator,
        cells: &[CellRef],
    ) -> Result<FanOutStats, EvalError> {
        let t = evaluator.step();
        let mut stats = FanOutStats::default();
        for cell in cells {
            if cell.is_parameter() || cell.is_function() || cell.is_fresh(t) {
                stats.skipped += 1;
                continue;
            }
            evaluator.resolve(cell, None, 0)?;
            stats.dispatched += 1;
        }
        Ok(stats)
    }

    /// Block on the worker rendezvous until `ready` holds, checking every
    /// worker's liveness each time it returns. A single wait longer than
    /// `max_wait` is a deadlock.
    fn wait_until(
        &self,
        evaluator: &Evaluator,
        what: &str,
        ready: impl Fn(&WorkerPool) -> bool,
    ) -> Result<(), EvalError> {
        let started = Instant::now();
        let mut changes = self.pool.lock_changes();
        loop {
            self.check_all(evaluator)?;
            if ready(&self.pool) {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= self.max_wait {
                drop(changes);
                return Err(self.timeout(evaluator, what, elapsed));
            }
            self.pool.wait_changes(&mut changes, self.max_wait - elapsed);
        }
    }

    fn timeout(&self, evaluator: &Evaluator, what: &str, elapsed: Duration) -> EvalError {
        let mut err = EvalError::new(EvalErrorKind::TimeoutDeadlock)
            .with_message(format!(
                "waited {:.1}s for {what}; an equation may never return",
                elapsed.as_secs_f64()
            ))
            .at_step(evaluator.step())
            .with_extra(EvalErrorExtra::Timeout { elapsed });
        if let Some((_, cell, node)) = self.pool.first_busy() {
            err = err.at_cell(&cell, node);
        }
        evaluator.run_state().report_hard_failure(err.clone());
        err
    }

    /// True if `worker` is alive. A dead worker's failure is reported to the
    /// run exactly once, whoever discovers it first.
    pub fn check(&self, evaluator: &Evaluator, worker: usize) -> bool {
        let Some(slot) = self.pool.slot(worker) else {
            return false;
        };
        // The slot lock serializes concurrent discoverers.
        let mut s = slot.state.lock();
        if s.alive {
            return true;
        }
        if !s.reported {
            s.reported = true;
            if let Some(fault) = s.fault.clone() {
                evaluator.run_state().report_hard_failure(fault);
            }
        }
        false
    }

    /// Check every worker; the first dead one aborts with its failure.
    pub fn check_all(&self, evaluator: &Evaluator) -> Result<(), EvalError> {
        for worker in 0..self.pool.size() {
            if !self.check(evaluator, worker) {
                return Err(self.fault_of(worker).unwrap_or_else(|| {
                    EvalError::new(EvalErrorKind::WorkerFault)
                        .with_message(format!("worker {worker} is not running"))
                }));
            }
        }
        Ok(())
    }

    /// Failure recorded by a dead worker.
    pub fn fault_of(&self, worker: usize) -> Option<EvalError> {
        self.pool
            .slot(worker)
            .and_then(|slot| slot.state.lock().fault.clone())
    }
}
