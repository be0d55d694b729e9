//! Fixed set of long-lived worker threads, each resolving at most one cell
//! at a time.
//!
//! ```text
//!   scheduler ──assign(cell)──► WorkerSlot { busy, target } ──run.notify──► worker thread
//!       ▲                                                                       │
//!       └──────────── changed.notify_all ◄── busy = false / alive = false ──────┘
//! ```
//!
//! A worker whose equation panics or returns an error records the failure
//! in its slot and exits its loop. It is "dead" from then on; the scheduler
//! discovers this through `ParallelScheduler::check`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use cellsim_common::{EvalError, EvalErrorExtra, EvalErrorKind, FaultKind, NodeId};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cell::CellRef;
use crate::engine::Evaluator;

#[derive(Default)]
pub(crate) struct SlotState {
    pub(crate) busy: bool,
    pub(crate) alive: bool,
    pub(crate) target: Option<CellRef>,
    /// Cell name and owner of the last assignment, kept after completion so
    /// a fault can be attributed.
    pub(crate) last: Option<(Arc<str>, NodeId)>,
    /// Written at most once, by the worker, as it dies.
    pub(crate) fault: Option<EvalError>,
    pub(crate) reported: bool,
}

pub(crate) struct WorkerSlot {
    pub(crate) state: Mutex<SlotState>,
    run: Condvar,
}

pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    /// Rendezvous between workers finishing and a scheduler waiting for
    /// them; the counter only exists so the condvar has a mutex to pair with.
    changed: Mutex<u64>,
    changed_cv: Condvar,
    shutdown: AtomicBool,
    handles: Mutex<Vec<Option<JoinHandle<()>>>>,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> Self {
        let slots = (0..size.max(1))
            .map(|_| WorkerSlot {
                state: Mutex::new(SlotState {
                    alive: true,
                    ..SlotState::default()
                }),
                run: Condvar::new(),
            })
            .collect();
        Self {
            slots,
            changed: Mutex::new(0),
            changed_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, worker: usize) -> Option<&WorkerSlot> {
        self.slots.get(worker)
    }

    /// Spawn one thread per slot. Threads that fail to spawn are recorded as
    /// dead workers.
    pub(crate) fn start(self: &Arc<Self>, evaluator: &Evaluator) {
        let mut handles = self.handles.lock();
        for id in 0..self.slots.len() {
            let pool = Arc::clone(self);
            let evaluator = evaluator.clone();
            let spawned = thread::Builder::new()
                .name(format!("cellsim-worker-{id}"))
                .spawn(move || pool.worker_loop(id, evaluator));
            match spawned {
                Ok(handle) => handles.push(Some(handle)),
                Err(e) => {
                    let mut s = self.slots[id].state.lock();
                    s.alive = false;
                    s.fault = Some(
                        EvalError::new(EvalErrorKind::WorkerFault)
                            .with_message(format!("failed to spawn worker thread: {e}")),
                    );
                    handles.push(None);
                }
            }
        }
    }

    /// Hand `cell` to the first free, live worker. Gives the cell back when
    /// every worker is busy or dead.
    pub(crate) fn try_assign(&self, cell: CellRef) -> Result<usize, CellRef> {
        for (id, slot) in self.slots.iter().enumerate() {
            let mut s = slot.state.lock();
            if s.alive && !s.busy {
                s.busy = true;
                s.last = Some((cell.shared_name(), cell.owner()));
                s.target = Some(cell);
                slot.run.notify_one();
                return Ok(id);
            }
        }
        Err(cell)
    }

    pub(crate) fn any_free(&self) -> bool {
        self.slots.iter().any(|slot| {
            let s = slot.state.lock();
            s.alive && !s.busy
        })
    }

    pub(crate) fn busy_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.state.lock().busy).count()
    }

    /// Cell and owner of the first busy worker, for timeout reports.
    pub(crate) fn first_busy(&self) -> Option<(usize, Arc<str>, NodeId)> {
        self.slots.iter().enumerate().find_map(|(id, slot)| {
            let s = slot.state.lock();
            match (&s.last, s.busy) {
                (Some((name, node)), true) => Some((id, Arc::clone(name), *node)),
                _ => None,
            }
        })
    }

    pub(crate) fn lock_changes(&self) -> MutexGuard<'_, u64> {
        self.changed.lock()
    }

    /// Wait on the rendezvous, at most `timeout`.
    pub(crate) fn wait_changes(&self, guard: &mut MutexGuard<'_, u64>, timeout: std::time::Duration) {
        self.changed_cv.wait_for(guard, timeout);
    }

    fn signal_change(&self) {
        let mut n = self.changed.lock();
        *n = n.wrapping_add(1);
        self.changed_cv.notify_all();
    }

    fn worker_loop(&self, id: usize, evaluator: Evaluator) {
        let slot = &self.slots[id];
        #[cfg(feature = "tracing")]
        tracing::debug!(worker = id, "worker started");

        loop {
            let cell = {
                let mut s = slot.state.lock();
                loop {
                    if let Some(cell) = s.target.clone() {
                        break cell;
                    }
                    if self.shutdown.load(Ordering::Acquire) {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(worker = id, "worker stopped");
                        return;
                    }
                    slot.run.wait(&mut s);
                }
            };

            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| evaluator.resolve(&cell, None, 0)));

            let fault = match outcome {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => {
                    // Blame the assigned cell; the raising cell stays in the
                    // message and the stack.
                    let kind = e.kind;
                    Some(
                        e.attribute_to(cell.name(), cell.owner())
                            .at_step(evaluator.step())
                            .with_extra(EvalErrorExtra::Fault {
                                worker: id,
                                fault: FaultKind::Uncaught(kind),
                            }),
                    )
                }
                Err(payload) => Some(
                    EvalError::new(EvalErrorKind::WorkerFault)
                        .with_message(format!(
                            "worker crashed while computing '{}'",
                            cell.name()
                        ))
                        .at_cell(cell.name(), cell.owner())
                        .at_step(evaluator.step())
                        .with_extra(EvalErrorExtra::Fault {
                            worker: id,
                            fault: FaultKind::Panic(panic_message(payload.as_ref())),
                        }),
                ),
            };
            let dead = fault.is_some();

            {
                let mut s = slot.state.lock();
                s.busy = false;
                s.target = None;
                if let Some(fault) = fault {
                    s.alive = false;
                    s.fault = Some(fault);
                }
            }
            self.signal_change();

            if dead {
                #[cfg(feature = "tracing")]
                tracing::debug!(worker = id, cell = cell.name(), "worker died");
                return;
            }
        }
    }

    /// Stop every idle worker and join it. Workers still busy (hung in an
    /// equation) are abandoned.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut handles = self.handles.lock();
        for (id, slot) in self.slots.iter().enumerate() {
            let busy = {
                let s = slot.state.lock();
                slot.run.notify_all();
                s.busy
            };
            if let Some(handle) = handles.get_mut(id).and_then(Option::take)
                && !busy
            {
                join_worker(id, handle);
            }
        }
    }
}

/// Join a stopped worker thread. False if the thread itself panicked.
fn join_worker(id: usize, handle: JoinHandle<()>) -> bool {
    match handle.join() {
        Ok(()) => true,
        Err(payload) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                worker = id,
                panic = %panic_message(payload.as_ref()),
                "worker thread ended abnormally"
            );
            #[cfg(not(feature = "tracing"))]
            let _ = (id, payload);
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellSpec, VariableCell};

    #[test]
    fn assign_marks_busy_until_no_worker_left() {
        let pool = WorkerPool::new(2);
        let cell = Arc::new(VariableCell::new(NodeId(0), CellSpec::variable("X", 0), None));
        assert!(pool.any_free());
        assert!(matches!(pool.try_assign(Arc::clone(&cell)), Ok(0)));
        assert!(matches!(pool.try_assign(Arc::clone(&cell)), Ok(1)));
        assert!(pool.try_assign(Arc::clone(&cell)).is_err());
        assert_eq!(pool.busy_count(), 2);
        assert!(!pool.any_free());
        let (id, name, node) = pool.first_busy().unwrap();
        assert_eq!((id, &*name, node), (0, "X", NodeId(0)));
    }

    #[test]
    fn joining_a_panicked_thread_is_reported() {
        let ok = thread::spawn(|| {});
        assert!(join_worker(0, ok));
        let crashed = thread::spawn(|| panic!("worker blew up"));
        assert!(!join_worker(1, crashed));
    }

    #[test]
    fn panic_messages() {
        let s: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(s.as_ref()), "boom");
        let s: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(s.as_ref()), "bang");
        let s: Box<dyn Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(s.as_ref()), "non-string panic payload");
    }
}
