pub mod cell;
pub mod history;
pub mod model;
pub mod run_state;
pub mod stack;
pub mod store;
pub mod traits;

pub mod engine;
#[cfg(feature = "tracing")]
pub mod telemetry;

pub use cell::{CellFlags, CellId, CellProfile, CellRef, CellSpec, DebugCondition, VariableCell};
pub use engine::{
    CallContext, Engine, EngineBuilder, EvalConfig, Evaluator, FanOutStats, ParallelScheduler,
    WorkerPool,
};
pub use history::ValueHistory;
pub use model::{Deletion, GraphError, ModelGraph};
pub use run_state::RunState;
pub use store::MemoryHistory;
pub use traits::{DebugHook, Equation, HistoryStore, ObjectGraph};

pub use cellsim_common::{
    ErrorContext, EvalError, EvalErrorExtra, EvalErrorKind, FaultKind, NodeId, Step,
};
