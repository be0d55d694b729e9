//! Per-thread evaluation stack: the chain of cells whose equations are
//! currently running on this thread, outermost first.

use std::cell::RefCell;
use std::sync::Arc;

use cellsim_common::NodeId;

struct Frame {
    cell: Arc<str>,
    node: NodeId,
}

thread_local! {
    static STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Pops its frame when dropped, so unwinding out of an equation leaves the
/// stack balanced.
pub(crate) struct FrameGuard(());

pub(crate) fn enter(cell: Arc<str>, node: NodeId) -> FrameGuard {
    STACK.with(|s| s.borrow_mut().push(Frame { cell, node }));
    FrameGuard(())
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        STACK.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

pub fn depth() -> usize {
    STACK.with(|s| s.borrow().len())
}

/// Rendered as `Name@#node`, outermost first.
pub fn snapshot() -> Vec<String> {
    STACK.with(|s| {
        s.borrow()
            .iter()
            .map(|f| format!("{}@{}", f.cell, f.node))
            .collect()
    })
}

/// Name of the cell whose equation requested the innermost one.
pub fn trigger() -> Option<String> {
    STACK.with(|s| {
        let s = s.borrow();
        s.len()
            .checked_sub(2)
            .and_then(|i| s.get(i))
            .map(|f| f.cell.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_nest_and_unwind() {
        assert_eq!(depth(), 0);
        let outer = enter(Arc::from("Sales"), NodeId(1));
        {
            let _inner = enter(Arc::from("Price"), NodeId(2));
            assert_eq!(depth(), 2);
            assert_eq!(trigger().as_deref(), Some("Sales"));
            assert_eq!(snapshot(), vec!["Sales@#1", "Price@#2"]);
        }
        assert_eq!(depth(), 1);
        assert_eq!(trigger(), None);
        drop(outer);
        assert!(snapshot().is_empty());
    }
}
