use super::common::{Counter, graph, sequential};
use crate::cell::CellSpec;

#[test]
fn run_step_updates_every_cell() {
    let g = graph();
    let market = g.add_node("Market", None).unwrap();
    let firms = g.add_nodes("Firm", Some(market), 3).unwrap();
    let calls = Counter::default();
    for (i, &f) in firms.iter().enumerate() {
        g.add_parameter(f, "Size", (i + 1) as f64).unwrap();
        let c = calls.clone();
        g.add_variable(f, CellSpec::variable("Output", 1).plotted(), move |ctx| {
            c.hit();
            Ok(ctx.value("Size", 0)? * ctx.step() as f64)
        })
        .unwrap();
    }
    g.add_variable(market, CellSpec::variable("Total", 0).plotted(), |ctx| {
        ctx.sum("Firm", "Output", 0)
    })
    .unwrap();
    let engine = sequential(&g);

    assert_eq!(engine.run(2).unwrap(), 2);
    assert_eq!(calls.get(), 6);
    let plotted = engine.plotted();
    assert_eq!(plotted.len(), 4);
    assert_eq!(plotted[0], (market, "Total".to_string(), 12.0));
    assert_eq!(plotted[3], (firms[2], "Output".to_string(), 6.0));
}

#[test]
fn run_stops_at_first_error() {
    let g = graph();
    let n = g.add_node("Firm", None).unwrap();
    g.add_variable(n, CellSpec::variable("Crash", 0), |ctx| {
        if ctx.step() == 3 {
            Err(cellsim_common::EvalError::equation("bankrupt"))
        } else {
            Ok(1.0)
        }
    })
    .unwrap();
    let engine = sequential(&g);
    let err = engine.run(10).unwrap_err();
    assert_eq!(err.message.as_deref(), Some("bankrupt"));
    assert_eq!(err.context.as_ref().unwrap().step, Some(3));
    assert_eq!(engine.step(), 3);
}

#[test]
fn profiling_accumulates_time() {
    let g = graph();
    let n = g.add_node("Firm", None).unwrap();
    let x = g
        .add_variable(n, CellSpec::variable("X", 0), |_| {
            std::thread::sleep(std::time::Duration::from_millis(2));
            Ok(1.0)
        })
        .unwrap();
    let engine = crate::engine::Engine::new(
        g.clone(),
        crate::engine::EvalConfig {
            profile: true,
            ..crate::engine::EvalConfig::default().sequential()
        },
    );
    engine.run(3).unwrap();
    let profile = x.profile();
    assert_eq!(profile.computations, 3);
    assert!(profile.elapsed >= std::time::Duration::from_millis(6));
}
