use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::common::{graph, sequential};
use crate::cell::CellSpec;
use crate::model::{Deletion, ModelGraph};

#[test]
fn deleting_a_computing_node_is_deferred() {
    let g = graph();
    let root = g.add_node("Market", None).unwrap();
    let firm = g.add_node("Firm", Some(root)).unwrap();
    let worker = g.add_node("Worker", Some(firm)).unwrap();

    let weak: Weak<ModelGraph> = Arc::downgrade(&g);
    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    let exit = g
        .add_variable(firm, CellSpec::variable("Exit", 0), move |ctx| {
            if let Some(graph) = weak.upgrade() {
                *o.lock() = Some(graph.delete_node(ctx.node()));
                assert!(graph.contains(ctx.node()));
            }
            Ok(1.0)
        })
        .unwrap();
    let engine = sequential(&g);
    engine.advance();

    assert_eq!(engine.resolve(&exit, 0).unwrap(), 1.0);
    assert_eq!(*outcome.lock(), Some(Ok(Deletion::Deferred)));
    assert!(!g.contains(firm));
    assert!(!g.contains(worker));
    assert!(g.contains(root));
}

#[test]
fn idle_nodes_are_deleted_immediately() {
    let g = graph();
    let firm = g.add_node("Firm", None).unwrap();
    g.add_variable(firm, CellSpec::variable("X", 0), |_| Ok(1.0))
        .unwrap();
    let engine = sequential(&g);
    engine.run(1).unwrap();
    assert_eq!(g.delete_node(firm), Ok(Deletion::Done));
    // The next step simply has nothing to update.
    assert_eq!(engine.run(1).unwrap(), 2);
}
