//! cellsim-eval – collaborator traits (object-safe)

use std::sync::Arc;

use cellsim_common::{EvalError, NodeId, Step};

use crate::cell::{CellRef, VariableCell};
use crate::engine::CallContext;

/* ───────────────────────────── Equation ───────────────────────────── */

/// User-supplied computation of a cell's new value.
///
/// The engine treats equations as opaque: they may request any other cell
/// through the [`CallContext`], may fail with an [`EvalError`], and may
/// return a non-finite number.
pub trait Equation: Send + Sync {
    fn evaluate(&self, ctx: &CallContext<'_>) -> Result<f64, EvalError>;
}

impl<F> Equation for F
where
    F: Fn(&CallContext<'_>) -> Result<f64, EvalError> + Send + Sync,
{
    fn evaluate(&self, ctx: &CallContext<'_>) -> Result<f64, EvalError> {
        self(ctx)
    }
}

/* ─────────────────────────── Object graph ─────────────────────────── */

/// The object hierarchy the cells live in.
///
/// The engine never holds on to nodes; it only asks for navigation and
/// for the deferred-deletion protocol.
pub trait ObjectGraph: Send + Sync {
    fn owner_of(&self, cell: &VariableCell) -> NodeId {
        cell.owner()
    }

    fn type_of(&self, node: NodeId) -> Option<Arc<str>>;

    fn parent_of(&self, node: NodeId) -> Option<NodeId>;

    fn children_of(&self, node: NodeId) -> Vec<NodeId>;

    /// Nodes sharing `node`'s parent and type, including `node`, in
    /// creation order.
    fn siblings_of_same_type(&self, node: NodeId) -> Vec<NodeId>;

    /// Every live node of `node_type`, in creation order.
    fn instances_of(&self, node_type: &str) -> Vec<NodeId>;

    /// Node types in the order they were first created.
    fn node_types(&self) -> Vec<Arc<str>>;

    /// The cell called `name` held directly by `node`.
    fn named_cell(&self, node: NodeId, name: &str) -> Option<CellRef>;

    fn cells_of(&self, node: NodeId) -> Vec<CellRef>;

    /// Queue a deletion of `node` that could not happen immediately.
    fn request_deferred_delete(&self, node: NodeId);

    /// True when `node`, or one of its ancestors, has a queued deletion.
    fn is_delete_pending(&self, node: NodeId) -> bool;

    /// Called by the evaluator after a cell of `node` left computation;
    /// performs the queued deletion if nothing in it is still computing.
    fn complete_deferred_delete(&self, node: NodeId);

    fn label(&self, node: NodeId) -> String {
        match self.type_of(node) {
            Some(ty) => format!("{ty}{node}"),
            None => node.to_string(),
        }
    }
}

/* ───────────────────────── Extended history ───────────────────────── */

/// Storage for values of cells flagged `persist_to_history`, serving lag
/// requests deeper than the in-memory ring.
pub trait HistoryStore: Send + Sync {
    fn record(&self, cell: &VariableCell, step: Step, value: f64);

    /// Value `cell` had at `step`, if recorded.
    fn fetch(&self, cell: &VariableCell, step: Step) -> Option<f64>;

    fn forget(&self, _cell: &VariableCell) {}
}

/* ─────────────────────────────── Debug ────────────────────────────── */

/// Receives debug triggers raised by cells carrying a `DebugCondition`.
pub trait DebugHook: Send + Sync {
    fn triggered(&self, cell: &VariableCell, caller: Option<NodeId>, step: Step, value: f64);
}
