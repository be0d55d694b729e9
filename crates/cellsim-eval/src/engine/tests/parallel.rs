use std::sync::Arc;
use std::time::Duration;

use cellsim_common::{EvalErrorExtra, EvalErrorKind, NodeId};
use parking_lot::Mutex;

use super::common::{Counter, graph, parallel, sequential};
use crate::cell::CellSpec;
use crate::engine::{Engine, EvalConfig};
use crate::model::ModelGraph;
use crate::traits::ObjectGraph;

/// 100 workers under one market; `Wage` depends on the worker's own seed and
/// its lagged value, `Payroll` sums it on the market.
fn labour_market() -> (Arc<ModelGraph>, NodeId) {
    let g = graph();
    let market = g.add_node("Market", None).unwrap();
    for i in 0..100 {
        let w = g.add_node("Worker", Some(market)).unwrap();
        g.add_parameter(w, "Seed", i as f64).unwrap();
        g.add_variable(
            w,
            CellSpec::variable("Wage", 1).initial(1.0).parallel(),
            |ctx| Ok(ctx.own(1)? * 1.01 + ctx.value("Seed", 0)? / 100.0),
        )
        .unwrap();
    }
    g.add_variable(market, CellSpec::variable("Payroll", 0), |ctx| {
        ctx.sum("Worker", "Wage", 0)
    })
    .unwrap();
    (g, market)
}

#[test]
fn fan_out_matches_sequential_results() {
    let (g1, _) = labour_market();
    let (g2, _) = labour_market();
    let par = parallel(&g1, 4);
    let seq = sequential(&g2);
    assert_eq!(par.worker_count(), 4);
    assert_eq!(seq.worker_count(), 0);

    for _ in 0..3 {
        par.advance();
        seq.advance();
        let a = par.fan_out_values("Worker", "Wage").unwrap();
        let b = seq.fan_out_values("Worker", "Wage").unwrap();
        assert_eq!(a.len(), 100);
        assert_eq!(a, b);
    }
    assert!(!par.run_state().is_invalid());
}

#[test]
fn fan_out_stats() {
    let (g, _) = labour_market();
    let engine = parallel(&g, 4);
    engine.advance();
    let stats = engine.fan_out("Worker", "Wage").unwrap();
    assert!(stats.parallel);
    assert_eq!((stats.dispatched, stats.skipped), (100, 0));

    let again = engine.fan_out("Worker", "Wage").unwrap();
    assert_eq!((again.dispatched, again.skipped), (0, 100));

    let params = engine.fan_out("Worker", "Seed").unwrap();
    assert_eq!(params.skipped, 100);
}

#[test]
fn run_steps_in_parallel_agree_with_sequential() {
    let (g1, m1) = labour_market();
    let (g2, m2) = labour_market();
    let par = parallel(&g1, 3);
    let seq = sequential(&g2);
    par.run(5).unwrap();
    seq.run(5).unwrap();
    let p1 = g1.named_cell(m1, "Payroll").unwrap();
    let p2 = g2.named_cell(m2, "Payroll").unwrap();
    assert_eq!(p1.current(), p2.current());
    assert_eq!(p1.last_update(), 5);
}

#[test]
fn equations_run_on_named_workers() {
    let g = graph();
    let names = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..8 {
        let n = g.add_node("Firm", None).unwrap();
        let names = names.clone();
        g.add_variable(n, CellSpec::variable("X", 0).parallel(), move |_| {
            let name = std::thread::current().name().map(str::to_string);
            names.lock().push(name);
            Ok(1.0)
        })
        .unwrap();
    }
    let engine = parallel(&g, 2);
    engine.run(1).unwrap();
    let names = names.lock();
    assert_eq!(names.len(), 8);
    assert!(
        names
            .iter()
            .all(|n| n.as_deref().is_some_and(|n| n.starts_with("cellsim-worker-")))
    );
}

#[test]
fn nested_fan_out_runs_inline() {
    let g = graph();
    let market = g.add_node("Market", None).unwrap();
    let effort_calls = Counter::default();
    for _ in 0..4 {
        let f = g.add_node("Firm", Some(market)).unwrap();
        for _ in 0..5 {
            let w = g.add_node("Worker", Some(f)).unwrap();
            let c = effort_calls.clone();
            g.add_variable(w, CellSpec::variable("Effort", 0).parallel(), move |_| {
                c.hit();
                Ok(1.0)
            })
            .unwrap();
        }
    }
    let nested = Arc::new(Mutex::new(Vec::new()));
    for f in g.instances_of("Firm") {
        let nested = nested.clone();
        g.add_variable(f, CellSpec::variable("Output", 0).parallel(), move |ctx| {
            let stats = ctx.fan_out("Worker", "Effort")?;
            nested.lock().push(stats.parallel);
            ctx.sum("Worker", "Effort", 0)
        })
        .unwrap();
    }
    let engine = parallel(&g, 4);
    engine.advance();
    let outer = engine.fan_out("Firm", "Output").unwrap();
    assert!(outer.parallel);
    assert_eq!(outer.dispatched, 4);
    assert_eq!(*nested.lock(), vec![false; 4]);
    assert_eq!(effort_calls.get(), 20);
    let values = engine.fan_out_values("Firm", "Output").unwrap();
    assert!(values.iter().all(|(_, v)| *v == 5.0));
}

#[test]
fn blocked_workers_time_out() {
    let g = graph();
    let gate = Arc::new(Mutex::new(()));
    for _ in 0..3 {
        let n = g.add_node("Firm", None).unwrap();
        let gate = gate.clone();
        g.add_variable(n, CellSpec::variable("Y", 0).parallel(), move |_| {
            let _open = gate.lock();
            Ok(1.0)
        })
        .unwrap();
    }
    let engine = Engine::new(
        g.clone(),
        EvalConfig::default()
            .with_workers(2)
            .with_max_wait(Duration::from_millis(200)),
    );
    engine.advance();

    let held = gate.lock();
    let err = engine.fan_out("Firm", "Y").unwrap_err();
    drop(held);

    assert_eq!(err.kind, EvalErrorKind::TimeoutDeadlock);
    assert!(err.is_hard_failure());
    assert_eq!(err.cell(), Some("Y"));
    assert!(matches!(err.extra, EvalErrorExtra::Timeout { elapsed } if elapsed >= Duration::from_millis(200)));

    let run = engine.run_state();
    assert!(run.is_failed());
    assert_eq!(run.count(EvalErrorKind::TimeoutDeadlock), 1);

    // The run stays failed.
    let again = engine.fan_out("Firm", "Y").unwrap_err();
    assert_eq!(again.kind, EvalErrorKind::TimeoutDeadlock);
    assert_eq!(run.count(EvalErrorKind::TimeoutDeadlock), 1);
    assert!(engine.run_step().is_err());
}

#[test]
fn squares_are_computed_exactly_once() {
    let g = graph();
    let calls = Counter::default();
    for i in 0..100u32 {
        let n = g.add_node("Cell", None).unwrap();
        let c = calls.clone();
        g.add_variable(n, CellSpec::variable("Sq", 0).parallel(), move |_| {
            c.hit();
            Ok(f64::from(i * i))
        })
        .unwrap();
    }
    let engine = parallel(&g, 4);
    engine.advance();
    let values = engine.fan_out_values("Cell", "Sq").unwrap();
    assert_eq!(calls.get(), 100);
    let expected: Vec<f64> = (0..100u32).map(|i| f64::from(i * i)).collect();
    assert_eq!(values.into_iter().map(|(_, v)| v).collect::<Vec<_>>(), expected);
}

#[test]
fn sibling_fan_out_stays_under_one_parent() {
    let g = graph();
    let a = g.add_node("Firm", None).unwrap();
    let b = g.add_node("Firm", None).unwrap();
    let calls = Counter::default();
    for parent in [a, b] {
        for _ in 0..3 {
            let w = g.add_node("Worker", Some(parent)).unwrap();
            let c = calls.clone();
            g.add_variable(w, CellSpec::variable("Effort", 0).parallel(), move |_| {
                c.hit();
                Ok(1.0)
            })
            .unwrap();
        }
    }
    let engine = parallel(&g, 2);
    engine.advance();
    let first = g.children_of(a)[0];
    let stats = engine.evaluator().fan_out_siblings(first, "Effort").unwrap();
    assert_eq!(stats.dispatched, 3);
    assert_eq!(calls.get(), 3);
}
