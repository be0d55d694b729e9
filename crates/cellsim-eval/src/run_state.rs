//! Run-wide validity: hard failures, the non-finite propagation mode, and
//! the list of everything reported so far.

use std::sync::atomic::{AtomicBool, Ordering};

use cellsim_common::{EvalError, EvalErrorKind};
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct RunState {
    /// Any diagnostic has been surfaced; results are suspect.
    invalid: AtomicBool,
    /// A hard failure occurred; the run must stop.
    failed: AtomicBool,
    /// The first non-finite result has been reported; later ones propagate
    /// silently.
    non_finite_mode: AtomicBool,
    first_failure: Mutex<Option<EvalError>>,
    diagnostics: Mutex<Vec<EvalError>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn non_finite_mode(&self) -> bool {
        self.non_finite_mode.load(Ordering::Acquire)
    }

    /// First hard failure of the run, if any.
    pub fn first_failure(&self) -> Option<EvalError> {
        self.first_failure.lock().clone()
    }

    /// Everything surfaced so far, in report order.
    pub fn diagnostics(&self) -> Vec<EvalError> {
        self.diagnostics.lock().clone()
    }

    pub fn count(&self, kind: EvalErrorKind) -> usize {
        self.diagnostics
            .lock()
            .iter()
            .filter(|d| d.kind == kind)
            .count()
    }

    /// Record a run-invalidating failure. Returns true for the first one.
    ///
    /// Callers are responsible for not reporting the same failure twice.
    pub fn report_hard_failure(&self, error: EvalError) -> bool {
        #[cfg(feature = "tracing")]
        tracing::error!(error = %error, "hard failure");

        self.invalid.store(true, Ordering::Release);
        self.failed.store(true, Ordering::Release);
        self.diagnostics.lock().push(error.clone());
        let mut first = self.first_failure.lock();
        if first.is_none() {
            *first = Some(error);
            true
        } else {
            false
        }
    }

    /// Switch into non-finite propagation mode. Only the first call records
    /// `diagnostic`; returns whether it did.
    pub fn enter_non_finite_mode(&self, diagnostic: EvalError) -> bool {
        if self.non_finite_mode.swap(true, Ordering::AcqRel) {
            return false;
        }
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %diagnostic, "non-finite result, run flagged invalid");

        self.invalid.store(true, Ordering::Release);
        self.diagnostics.lock().push(diagnostic);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellsim_common::NodeId;

    #[test]
    fn first_hard_failure_is_kept() {
        let run = RunState::new();
        assert!(!run.is_failed());
        let a = EvalError::new(EvalErrorKind::WorkerFault).at_cell("A", NodeId(0));
        let b = EvalError::new(EvalErrorKind::TimeoutDeadlock);
        assert!(run.report_hard_failure(a.clone()));
        assert!(!run.report_hard_failure(b));
        assert!(run.is_failed() && run.is_invalid());
        assert_eq!(run.first_failure(), Some(a));
        assert_eq!(run.diagnostics().len(), 2);
    }

    #[test]
    fn non_finite_reported_once() {
        let run = RunState::new();
        let d = EvalError::new(EvalErrorKind::NonFiniteResult);
        assert!(run.enter_non_finite_mode(d.clone()));
        assert!(!run.enter_non_finite_mode(d));
        assert!(run.is_invalid());
        assert!(!run.is_failed());
        assert_eq!(run.count(EvalErrorKind::NonFiniteResult), 1);
    }
}
