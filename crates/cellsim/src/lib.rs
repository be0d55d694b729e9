//! Meta crate that re-exports the cellsim building blocks. Downstream users
//! can depend on this crate alone and opt into layers via feature flags.

#[cfg(feature = "common")]
pub use cellsim_common as common;

#[cfg(feature = "eval")]
pub use cellsim_eval as eval;

#[cfg(feature = "common")]
pub use cellsim_common::{EvalError, EvalErrorKind, FaultKind, NodeId, Step};

#[cfg(feature = "eval")]
pub use cellsim_eval::{
    CallContext, CellSpec, DebugCondition, DebugHook, Deletion, Engine, EvalConfig, HistoryStore,
    MemoryHistory, ModelGraph, ObjectGraph, VariableCell,
};

#[cfg(feature = "tracing")]
pub use cellsim_eval::telemetry::init_tracing;
