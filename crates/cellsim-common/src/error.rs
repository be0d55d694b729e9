//! Evaluation error representation shared by the evaluator, the worker pool
//! and the parallel scheduler.
//!
//! - **`EvalErrorKind`** : the canonical failure classes
//! - **`ErrorContext`**  : which cell, which node, which step, which stack
//! - **`EvalErrorExtra`**: per-kind "extension slot" (fault, timeout, lag)
//! - **`EvalError`**     : one struct that glues the three together
//!
//! Local errors (`InvalidLag`, `Deadlock`, `EquationFailure`, ...) travel up
//! the dynamic call stack exactly like value requests do. `WorkerFault` and
//! `TimeoutDeadlock` are run-wide hard failures.

use std::{error::Error, fmt, time::Duration};

use crate::{NodeId, Step};

/// All recognised evaluation failure classes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EvalErrorKind {
    /// Requested history depth is not available.
    InvalidLag,
    /// A cell requested its own current value while computing it.
    Deadlock,
    /// A wait for a worker or for fan-out completion exceeded the bound.
    TimeoutDeadlock,
    /// A worker died while computing a cell.
    WorkerFault,
    /// The equation callback reported a user-level error.
    EquationFailure,
    /// An equation produced NaN or an infinity.
    NonFiniteResult,
    /// A write was attempted on a cell that is under computation.
    Conflict,
    /// A requested cell name does not exist where it was searched.
    UnknownCell,
}

impl fmt::Display for EvalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InvalidLag => "invalid lag",
            Self::Deadlock => "dead lock",
            Self::TimeoutDeadlock => "timeout dead lock",
            Self::WorkerFault => "worker fault",
            Self::EquationFailure => "equation failure",
            Self::NonFiniteResult => "non-finite result",
            Self::Conflict => "conflict",
            Self::UnknownCell => "unknown cell",
        })
    }
}

impl EvalErrorKind {
    /// Hard failures invalidate the whole run and are reported once.
    pub fn is_hard_failure(self) -> bool {
        matches!(self, Self::WorkerFault | Self::TimeoutDeadlock)
    }
}

/// What killed a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The equation panicked; the payload message if it was a string.
    Panic(String),
    /// The equation returned an error the worker could not hand back to
    /// any caller.
    Uncaught(EvalErrorKind),
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Panic(msg) => write!(f, "panic: {msg}"),
            FaultKind::Uncaught(kind) => write!(f, "uncaught {kind}"),
        }
    }
}

/// Where an error happened.
///
/// `stack` is the evaluation stack (outermost first) of the thread that
/// raised the error, when it was raised inside an equation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ErrorContext {
    pub cell: Option<String>,
    pub node: Option<NodeId>,
    pub caller: Option<NodeId>,
    pub step: Option<Step>,
    pub stack: Vec<String>,
}

/// Kind-specific payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum EvalErrorExtra {
    #[default]
    None,

    /// `InvalidLag` – what was asked for and what the cell keeps.
    Lag { requested: u32, available: u32 },

    /// `WorkerFault` – how the worker died.
    Fault { worker: usize, fault: FaultKind },

    /// `TimeoutDeadlock` – how long the scheduler waited.
    Timeout { elapsed: Duration },
}

/// The single error struct passed around by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub message: Option<String>,
    pub context: Option<ErrorContext>,
    pub extra: EvalErrorExtra,
}

/* ───────────────────── Constructors & helpers ─────────────────────── */

impl From<EvalErrorKind> for EvalError {
    fn from(kind: EvalErrorKind) -> Self {
        Self {
            kind,
            message: None,
            context: None,
            extra: EvalErrorExtra::None,
        }
    }
}

impl EvalError {
    pub fn new(kind: EvalErrorKind) -> Self {
        kind.into()
    }

    /// User-level failure raised from inside an equation.
    pub fn equation<S: Into<String>>(msg: S) -> Self {
        Self::new(EvalErrorKind::EquationFailure).with_message(msg)
    }

    pub fn with_message<S: Into<String>>(mut self, msg: S) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Attach the cell and its owning node. Does not overwrite a location
    /// that is already present, so the innermost cell wins when errors
    /// bubble through several equations.
    pub fn at_cell(mut self, cell: &str, node: NodeId) -> Self {
        let ctx = self.context.get_or_insert_with(ErrorContext::default);
        if ctx.cell.is_none() {
            ctx.cell = Some(cell.to_string());
            ctx.node = Some(node);
        }
        self
    }

    /// Blame `cell` in `node`, replacing any location already present. A
    /// different inner location is kept in front of the message.
    pub fn attribute_to(mut self, cell: &str, node: NodeId) -> Self {
        let ctx = self.context.get_or_insert_with(ErrorContext::default);
        if let Some(inner) = ctx.cell.as_deref()
            && (inner != cell || ctx.node != Some(node))
        {
            let origin = match ctx.node {
                Some(n) => format!("'{inner}' in node {n}"),
                None => format!("'{inner}'"),
            };
            self.message = Some(match self.message.take() {
                Some(msg) => format!("{origin}: {msg}"),
                None => format!("raised by {origin}"),
            });
        }
        ctx.cell = Some(cell.to_string());
        ctx.node = Some(node);
        self
    }

    pub fn with_caller(mut self, caller: Option<NodeId>) -> Self {
        let ctx = self.context.get_or_insert_with(ErrorContext::default);
        if ctx.caller.is_none() {
            ctx.caller = caller;
        }
        self
    }

    pub fn at_step(mut self, step: Step) -> Self {
        let ctx = self.context.get_or_insert_with(ErrorContext::default);
        ctx.step.get_or_insert(step);
        self
    }

    /// Attach an evaluation stack snapshot, unless one is already present.
    pub fn with_stack(mut self, stack: Vec<String>) -> Self {
        let ctx = self.context.get_or_insert_with(ErrorContext::default);
        if ctx.stack.is_empty() {
            ctx.stack = stack;
        }
        self
    }

    pub fn with_extra(mut self, extra: EvalErrorExtra) -> Self {
        self.extra = extra;
        self
    }

    /// Hard failure classes, plus any error a worker died of.
    pub fn is_hard_failure(&self) -> bool {
        self.kind.is_hard_failure() || matches!(self.extra, EvalErrorExtra::Fault { .. })
    }

    pub fn cell(&self) -> Option<&str> {
        self.context.as_ref().and_then(|c| c.cell.as_deref())
    }

    pub fn node(&self) -> Option<NodeId> {
        self.context.as_ref().and_then(|c| c.node)
    }
}

/* ───────────────────────── Display / Error ────────────────────────── */

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;

        if let Some(ref msg) = self.message {
            write!(f, ": {msg}")?;
        }

        if let Some(ref ctx) = self.context {
            match (&ctx.cell, ctx.node) {
                (Some(cell), Some(node)) => write!(f, " (cell '{cell}' in node {node})")?,
                (Some(cell), None) => write!(f, " (cell '{cell}')")?,
                (None, Some(node)) => write!(f, " (node {node})")?,
                (None, None) => {}
            }
            if let Some(step) = ctx.step {
                write!(f, " at step {step}")?;
            }
        }

        match &self.extra {
            EvalErrorExtra::None => {}
            EvalErrorExtra::Lag {
                requested,
                available,
            } => write!(f, " [lag {requested}, declared {available}]")?,
            EvalErrorExtra::Fault { worker, fault } => {
                write!(f, " [worker {worker}: {fault}]")?
            }
            EvalErrorExtra::Timeout { elapsed } => {
                write!(f, " [waited {:.3}s]", elapsed.as_secs_f64())?
            }
        }

        Ok(())
    }
}

impl Error for EvalError {}

impl From<EvalError> for String {
    fn from(error: EvalError) -> Self {
        format!("{error}")
    }
}
