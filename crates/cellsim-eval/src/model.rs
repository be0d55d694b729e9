//! Arena object graph implementing [`ObjectGraph`].
//!
//! Nodes are addressed by stable [`NodeId`] indices that are never reused.
//! A deleted slot stays `None`, so stale handles stop resolving instead of
//! aliasing a newer node.

use std::sync::Arc;

use cellsim_common::NodeId;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::cell::{CellRef, CellSpec, VariableCell};
use crate::engine::CallContext;
use crate::traits::{Equation, ObjectGraph};
use cellsim_common::EvalError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("node {0} does not exist")]
    UnknownNode(NodeId),
    #[error("node {node} already holds a cell named '{name}'")]
    DuplicateCell { node: NodeId, name: String },
}

/// Outcome of [`ModelGraph::delete_node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    Done,
    /// A cell of the subtree is under computation; the evaluator finishes
    /// the deletion when it leaves the equation.
    Deferred,
}

struct NodeEntry {
    node_type: Arc<str>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    cells: SmallVec<[CellRef; 4]>,
    delete_pending: bool,
}

#[derive(Default)]
struct Inner {
    nodes: Vec<Option<NodeEntry>>,
    types: Vec<Arc<str>>,
    type_index: FxHashMap<Arc<str>, usize>,
}

impl Inner {
    fn entry(&self, node: NodeId) -> Option<&NodeEntry> {
        self.nodes.get(node.as_index()).and_then(Option::as_ref)
    }

    fn entry_mut(&mut self, node: NodeId) -> Option<&mut NodeEntry> {
        self.nodes.get_mut(node.as_index()).and_then(Option::as_mut)
    }

    fn intern(&mut self, node_type: &str) -> Arc<str> {
        if let Some(&i) = self.type_index.get(node_type) {
            return Arc::clone(&self.types[i]);
        }
        let ty: Arc<str> = Arc::from(node_type);
        self.type_index.insert(Arc::clone(&ty), self.types.len());
        self.types.push(Arc::clone(&ty));
        ty
    }

    fn subtree(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = vec![root];
        let mut i = 0;
        while i < out.len() {
            if let Some(e) = self.entry(out[i]) {
                out.extend(e.children.iter().copied());
            }
            i += 1;
        }
        out
    }

    fn subtree_computing(&self, root: NodeId) -> bool {
        self.subtree(root).into_iter().any(|n| {
            self.entry(n)
                .is_some_and(|e| e.cells.iter().any(|c| c.is_under_computation()))
        })
    }

    fn remove_subtree(&mut self, root: NodeId) {
        if let Some(parent) = self.entry(root).and_then(|e| e.parent)
            && let Some(p) = self.entry_mut(parent)
        {
            p.children.retain(|c| *c != root);
        }
        for n in self.subtree(root) {
            if let Some(slot) = self.nodes.get_mut(n.as_index()) {
                *slot = None;
            }
        }
    }

    /// Topmost node on the path from `node` to the root with a queued
    /// deletion.
    fn pending_root(&self, node: NodeId) -> Option<NodeId> {
        let mut found = None;
        let mut cur = Some(node);
        while let Some(n) = cur {
            let Some(e) = self.entry(n) else { break };
            if e.delete_pending {
                found = Some(n);
            }
            cur = e.parent;
        }
        found
    }
}

#[derive(Default)]
pub struct ModelGraph {
    inner: RwLock<Inner>,
}

impl ModelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node_type: &str, parent: Option<NodeId>) -> Result<NodeId, GraphError> {
        let mut inner = self.inner.write();
        if let Some(p) = parent
            && inner.entry(p).is_none()
        {
            return Err(GraphError::UnknownNode(p));
        }
        let node_type = inner.intern(node_type);
        let id = NodeId::new(inner.nodes.len() as u32);
        inner.nodes.push(Some(NodeEntry {
            node_type,
            parent,
            children: Vec::new(),
            cells: SmallVec::new(),
            delete_pending: false,
        }));
        if let Some(p) = parent.and_then(|p| inner.entry_mut(p)) {
            p.children.push(id);
        }
        Ok(id)
    }

    /// Add `n` nodes of one type under `parent`.
    pub fn add_nodes(
        &self,
        node_type: &str,
        parent: Option<NodeId>,
        n: usize,
    ) -> Result<Vec<NodeId>, GraphError> {
        (0..n).map(|_| self.add_node(node_type, parent)).collect()
    }

    pub fn add_cell(
        &self,
        node: NodeId,
        spec: CellSpec,
        equation: Option<Arc<dyn Equation>>,
    ) -> Result<CellRef, GraphError> {
        let mut inner = self.inner.write();
        let entry = inner.entry_mut(node).ok_or(GraphError::UnknownNode(node))?;
        if entry.cells.iter().any(|c| c.name() == spec.name) {
            return Err(GraphError::DuplicateCell {
                node,
                name: spec.name,
            });
        }
        let cell = Arc::new(VariableCell::new(node, spec, equation));
        entry.cells.push(Arc::clone(&cell));
        Ok(cell)
    }

    /// Add a variable or function computed by `f`.
    pub fn add_variable<F>(&self, node: NodeId, spec: CellSpec, f: F) -> Result<CellRef, GraphError>
    where
        F: Fn(&CallContext<'_>) -> Result<f64, EvalError> + Send + Sync + 'static,
    {
        self.add_cell(node, spec, Some(Arc::new(f)))
    }

    pub fn add_parameter(&self, node: NodeId, name: &str, value: f64) -> Result<CellRef, GraphError> {
        self.add_cell(node, CellSpec::parameter(name, value), None)
    }

    /// Delete `node` and its subtree, or queue the deletion when one of its
    /// cells is under computation.
    pub fn delete_node(&self, node: NodeId) -> Result<Deletion, GraphError> {
        let mut inner = self.inner.write();
        if inner.entry(node).is_none() {
            return Err(GraphError::UnknownNode(node));
        }
        if inner.subtree_computing(node) {
            if let Some(e) = inner.entry_mut(node) {
                e.delete_pending = true;
            }
            return Ok(Deletion::Deferred);
        }
        inner.remove_subtree(node);
        Ok(Deletion::Done)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.inner.read().entry(node).is_some()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.inner.read().nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectGraph for ModelGraph {
    fn type_of(&self, node: NodeId) -> Option<Arc<str>> {
        self.inner
            .read()
            .entry(node)
            .map(|e| Arc::clone(&e.node_type))
    }

    fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.inner.read().entry(node).and_then(|e| e.parent)
    }

    fn children_of(&self, node: NodeId) -> Vec<NodeId> {
        self.inner
            .read()
            .entry(node)
            .map(|e| e.children.clone())
            .unwrap_or_default()
    }

    fn siblings_of_same_type(&self, node: NodeId) -> Vec<NodeId> {
        let inner = self.inner.read();
        let Some(e) = inner.entry(node) else {
            return Vec::new();
        };
        let (ty, parent) = (Arc::clone(&e.node_type), e.parent);
        inner
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| {
                n.as_ref()
                    .filter(|n| n.parent == parent && n.node_type == ty)
                    .map(|_| NodeId::new(i as u32))
            })
            .collect()
    }

    fn instances_of(&self, node_type: &str) -> Vec<NodeId> {
        self.inner
            .read()
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| {
                n.as_ref()
                    .filter(|n| &*n.node_type == node_type)
                    .map(|_| NodeId::new(i as u32))
            })
            .collect()
    }

    fn node_types(&self) -> Vec<Arc<str>> {
        self.inner.read().types.clone()
    }

    fn named_cell(&self, node: NodeId, name: &str) -> Option<CellRef> {
        self.inner
            .read()
            .entry(node)?
            .cells
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    fn cells_of(&self, node: NodeId) -> Vec<CellRef> {
        self.inner
            .read()
            .entry(node)
            .map(|e| e.cells.to_vec())
            .unwrap_or_default()
    }

    fn request_deferred_delete(&self, node: NodeId) {
        if let Some(e) = self.inner.write().entry_mut(node) {
            e.delete_pending = true;
        }
    }

    fn is_delete_pending(&self, node: NodeId) -> bool {
        self.inner.read().pending_root(node).is_some()
    }

    fn complete_deferred_delete(&self, node: NodeId) {
        let mut inner = self.inner.write();
        let Some(root) = inner.pending_root(node) else {
            return;
        };
        if !inner.subtree_computing(root) {
            inner.remove_subtree(root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation() {
        let g = ModelGraph::new();
        let root = g.add_node("Root", None).unwrap();
        let firms = g.add_nodes("Firm", Some(root), 3).unwrap();
        let other = g.add_node("Bank", Some(root)).unwrap();
        let worker = g.add_node("Worker", Some(firms[1])).unwrap();

        assert_eq!(g.siblings_of_same_type(firms[2]), firms);
        assert_eq!(g.instances_of("Firm"), firms);
        assert_eq!(g.children_of(root), vec![firms[0], firms[1], firms[2], other]);
        assert_eq!(g.parent_of(worker), Some(firms[1]));
        assert_eq!(
            g.node_types().iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            vec!["Root", "Firm", "Bank", "Worker"]
        );
        assert_eq!(g.label(worker), format!("Worker{worker}"));
        assert_eq!(
            g.add_node("X", Some(NodeId(99))),
            Err(GraphError::UnknownNode(NodeId(99)))
        );
    }

    #[test]
    fn cells_are_unique_per_node() {
        let g = ModelGraph::new();
        let n = g.add_node("Firm", None).unwrap();
        let a = g.add_parameter(n, "Alpha", 0.5).unwrap();
        assert!(Arc::ptr_eq(&a, &g.named_cell(n, "Alpha").unwrap()));
        assert!(matches!(
            g.add_parameter(n, "Alpha", 1.0),
            Err(GraphError::DuplicateCell { .. })
        ));
        assert!(g.named_cell(n, "Beta").is_none());
        assert_eq!(g.cells_of(n).len(), 1);
    }

    #[test]
    fn delete_removes_subtree() {
        let g = ModelGraph::new();
        let root = g.add_node("Root", None).unwrap();
        let firm = g.add_node("Firm", Some(root)).unwrap();
        let worker = g.add_node("Worker", Some(firm)).unwrap();

        assert_eq!(g.delete_node(firm), Ok(Deletion::Done));
        assert!(!g.contains(firm));
        assert!(!g.contains(worker));
        assert!(g.children_of(root).is_empty());
        assert_eq!(g.len(), 1);
        assert_eq!(g.delete_node(firm), Err(GraphError::UnknownNode(firm)));
    }

    #[test]
    fn pending_deletion_is_seen_from_descendants() {
        let g = ModelGraph::new();
        let firm = g.add_node("Firm", None).unwrap();
        let worker = g.add_node("Worker", Some(firm)).unwrap();
        g.request_deferred_delete(firm);
        assert!(g.is_delete_pending(worker));

        g.complete_deferred_delete(worker);
        assert!(!g.contains(firm));
        assert!(!g.contains(worker));
    }
}
