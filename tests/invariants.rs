//! Structural invariants checked over every reachable state of full runs.

mod common;

use clutch_sim::{build_engine, scenario_profiles, ThreadState};

/// Run a scenario with per-event invariant checks enabled, then close the
/// books: every charged CPU microsecond matches processor busy time.
fn run_checked(scenario: &str, cpus: u32, duration_us: u64, seed: u32) -> clutch_sim::SimEngine {
    let profiles = scenario_profiles(scenario).unwrap();
    let mut engine = build_engine(&profiles, cpus, seed).unwrap();
    engine.check_invariants = true;
    engine.run(duration_us);
    engine.scheduler.verify_invariants();
    engine
}

fn assert_cpu_accounting(engine: &clutch_sim::SimEngine) {
    let thread_total: u64 = engine
        .scheduler
        .threads
        .iter()
        .map(|t| t.total_cpu_us)
        .sum();
    let processor_total: u64 = engine
        .scheduler
        .processors
        .iter()
        .map(|p| p.busy_time_us)
        .sum();
    assert_eq!(
        thread_total, processor_total,
        "thread CPU accounting diverged from processor busy time"
    );
}

#[test]
fn test_invariants_mixed() {
    common::setup_test();
    let engine = run_checked("mixed", 4, 300_000, 42);
    assert_cpu_accounting(&engine);
}

#[test]
fn test_invariants_cpu_storm() {
    common::setup_test();
    let engine = run_checked("cpu_storm", 2, 300_000, 42);
    assert_cpu_accounting(&engine);
    // A saturated machine keeps every CPU almost fully busy.
    for p in &engine.scheduler.processors {
        assert!(
            p.busy_time_us >= 250_000,
            "CPU{} busy only {}us under storm load",
            p.id.0,
            p.busy_time_us
        );
    }
}

#[test]
fn test_invariants_rt_studio() {
    common::setup_test();
    let engine = run_checked("rt_studio", 2, 300_000, 42);
    assert_cpu_accounting(&engine);

    // Timeshare priorities never exceed their base.
    for t in &engine.scheduler.threads {
        if t.is_timeshare() {
            assert!(t.sched_pri <= t.base_pri);
        }
    }
}

#[test]
fn test_invariants_starvation() {
    common::setup_test();
    let engine = run_checked("starvation", 1, 400_000, 42);
    assert_cpu_accounting(&engine);

    // No thread is left in a transient state at the horizon.
    for t in &engine.scheduler.threads {
        assert!(matches!(
            t.state,
            ThreadState::Waiting | ThreadState::Runnable | ThreadState::Running
        ));
    }
}
