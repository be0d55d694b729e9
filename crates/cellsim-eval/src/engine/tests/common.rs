//! Common test helpers
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::engine::{Engine, EvalConfig};
use crate::model::ModelGraph;

pub fn graph() -> Arc<ModelGraph> {
    Arc::new(ModelGraph::new())
}

pub fn sequential(graph: &Arc<ModelGraph>) -> Engine {
    Engine::new(graph.clone(), EvalConfig::default().sequential())
}

pub fn parallel(graph: &Arc<ModelGraph>, workers: usize) -> Engine {
    Engine::new(graph.clone(), EvalConfig::default().with_workers(workers))
}

#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
