//! End-to-end scheduler scenarios driven through the simulation engine.

mod common;

use clutch_sim::{
    build_engine, run_scenario, BehaviorProfile, EventKind, SchedMode, SimEngine, Tid,
    TraceKind, WorkloadProfile,
};

fn ts_profile(
    name: &str,
    group: &str,
    num_threads: u32,
    base_pri: i32,
    mean_compute_us: u64,
    mean_sleep_us: u64,
) -> WorkloadProfile {
    WorkloadProfile {
        name: name.into(),
        thread_group: group.into(),
        num_threads,
        mode: SchedMode::Timeshare,
        base_pri,
        behavior: BehaviorProfile {
            mean_compute_us,
            mean_sleep_us,
            ..Default::default()
        },
        bound_cpu: None,
    }
}

fn rt_profile(
    name: &str,
    group: &str,
    base_pri: i32,
    period_us: u64,
    computation_us: u64,
    constraint_us: u64,
) -> WorkloadProfile {
    WorkloadProfile {
        name: name.into(),
        thread_group: group.into(),
        num_threads: 1,
        mode: SchedMode::Realtime,
        base_pri,
        behavior: BehaviorProfile {
            rt_period_us: period_us,
            rt_computation_us: computation_us,
            rt_constraint_us: constraint_us,
            ..Default::default()
        },
        bound_cpu: None,
    }
}

/// Two equal-priority timeshare threads on one CPU share it fairly.
#[test]
fn test_two_equal_threads_share_fairly() {
    common::setup_test();
    let profiles = vec![ts_profile("worker", "App", 2, 31, 5_000, 1_000)];
    let mut engine = build_engine(&profiles, 1, 42).unwrap();
    engine.check_invariants = true;
    engine.run(100_000);

    let cpu_a = engine.scheduler.thread(Tid(0)).total_cpu_us;
    let cpu_b = engine.scheduler.thread(Tid(1)).total_cpu_us;
    let diff = cpu_a.abs_diff(cpu_b);
    // Within one quantum plus burst variance.
    assert!(
        diff <= 10_000,
        "unfair split: {cpu_a}us vs {cpu_b}us (diff {diff})"
    );

    // The CPU stays mostly busy with two eager threads.
    assert!(
        cpu_a + cpu_b >= 80_000,
        "CPU underutilized: {}us",
        cpu_a + cpu_b
    );

    // Switching stays in the neighborhood of the burst/quantum cadence.
    let switches = engine.stats.context_switch_count;
    assert!(
        (5..=60).contains(&switches),
        "unexpected context switch count {switches}"
    );
}

/// An RT thread gets its periodic computation on time; the timeshare thread
/// absorbs the rest of the CPU.
#[test]
fn test_rt_period_meets_deadlines() {
    common::setup_test();
    let profiles = vec![
        rt_profile("audio", "Media", 97, 10_000, 3_000, 5_000),
        ts_profile("render", "App", 1, 47, 50_000, 1_000),
    ];
    let mut engine = build_engine(&profiles, 1, 42).unwrap();
    engine.check_invariants = true;
    engine.run(100_000);

    let rt_cpu = engine.scheduler.thread(Tid(0)).total_cpu_us;
    let ts_cpu = engine.scheduler.thread(Tid(1)).total_cpu_us;

    // ~10 periods x 3ms computation.
    assert!(
        (25_000..=33_000).contains(&rt_cpu),
        "rt cpu {rt_cpu}us out of range"
    );
    assert!(ts_cpu >= 55_000, "timeshare starved: {ts_cpu}us");
    assert_eq!(engine.stats.rt_deadline_misses, 0, "rt missed deadlines");
}

/// The warp scenario keeps foreground dispatch latency low while background
/// lanes still make progress.
#[test]
fn test_warp_scenario_latency() {
    common::setup_test();
    let engine = run_scenario("warp", 1, 300_000, 42).unwrap();

    let fg_tids: Vec<Tid> = engine
        .scheduler
        .threads
        .iter()
        .filter(|t| t.name.starts_with("fg-burst"))
        .map(|t| t.tid)
        .collect();
    assert!(!fg_tids.is_empty());
    for tid in fg_tids {
        let ts = &engine.stats.thread_stats[tid.0 as usize];
        assert!(
            ts.avg_latency_us() < 5_000.0,
            "fg thread {} avg latency {}us",
            tid.0,
            ts.avg_latency_us()
        );
    }

    let bg_cpu: u64 = engine
        .scheduler
        .threads
        .iter()
        .filter(|t| t.name.starts_with("bg-batch"))
        .map(|t| t.total_cpu_us)
        .sum();
    assert!(bg_cpu > 0, "background lane never ran");
}

/// Under sustained foreground load, the background lane is still served
/// within its WCEL window (starvation avoidance).
#[test]
fn test_starvation_bound() {
    common::setup_test();
    let profiles = vec![
        ts_profile("fg-hog", "FG", 2, 47, 20_000, 1_000),
        ts_profile("bg-lone", "BG", 1, 4, 50_000, 1_000),
    ];
    let mut engine = build_engine(&profiles, 1, 42).unwrap();
    engine.run(600_000);

    let bg_tid = engine
        .scheduler
        .threads
        .iter()
        .find(|t| t.name.starts_with("bg-lone"))
        .unwrap()
        .tid;
    let dispatches = engine.trace.dispatch_times(bg_tid);
    assert!(!dispatches.is_empty(), "background thread never dispatched");
    // First service within the BG WCEL (250ms) plus warp and quantum slack.
    assert!(
        dispatches[0] <= 300_000,
        "background first served at {}us",
        dispatches[0]
    );

    let bg_cpu = engine.scheduler.thread(bg_tid).total_cpu_us;
    assert!(bg_cpu > 0, "background thread got no CPU");
}

/// A processor-bound thread only ever runs on its processor, and loses its
/// CPU to a higher-priority unbound thread.
#[test]
fn test_bound_thread_affinity() {
    common::setup_test();
    let mut profiles = vec![
        ts_profile("unbound-fg", "App", 1, 50, 5_000, 5_000),
        ts_profile("bound-worker", "App", 1, 40, 5_000, 5_000),
    ];
    profiles[1].bound_cpu = Some(0);

    let mut engine = build_engine(&profiles, 2, 42).unwrap();
    engine.check_invariants = true;
    engine.run(100_000);

    let bound_tid = Tid(1);
    for event in engine.trace.events() {
        if let TraceKind::Dispatched { tid, cpu } = event.kind {
            if tid == bound_tid {
                assert_eq!(cpu.0, 0, "bound thread dispatched on CPU{}", cpu.0);
            }
        }
    }
    assert!(
        engine.scheduler.thread(bound_tid).total_cpu_us > 0,
        "bound thread never ran"
    );
    assert!(
        engine.scheduler.thread(Tid(0)).total_cpu_us > 0,
        "unbound thread never ran"
    );
}

/// A duplicate wakeup at the same timestamp leaves the trace unchanged.
#[test]
fn test_idempotent_wakeup_trace() {
    common::setup_test();
    let profiles = vec![ts_profile("solo", "App", 1, 31, 5_000, 20_000)];

    let run = |duplicate: bool| -> SimEngine {
        let mut engine = build_engine(&profiles, 1, 42).unwrap();
        if duplicate {
            engine.schedule(0, EventKind::Wakeup { tid: Tid(0) });
        }
        engine.run(50_000);
        engine
    };

    let baseline = run(false);
    let doubled = run(true);
    assert_eq!(
        baseline.trace.to_lines(),
        doubled.trace.to_lines(),
        "duplicate wakeup altered the trace"
    );
    assert_eq!(
        baseline.stats.wakeup_count, doubled.stats.wakeup_count,
        "duplicate wakeup was counted"
    );
}

/// Identical (seed, scenario, cpus, duration) reproduce the trace and the
/// report byte for byte.
#[test]
fn test_determinism_across_runs() {
    common::setup_test();
    let a = run_scenario("mixed", 4, 200_000, 7).unwrap();
    let b = run_scenario("mixed", 4, 200_000, 7).unwrap();

    assert_eq!(a.trace.to_lines(), b.trace.to_lines(), "traces diverged");
    let ra = serde_json::to_string(&a.stats.report()).unwrap();
    let rb = serde_json::to_string(&b.stats.report()).unwrap();
    assert_eq!(ra, rb, "reports diverged");
}

/// Different seeds actually change the sampled workload.
#[test]
fn test_seed_changes_trace() {
    common::setup_test();
    let a = run_scenario("mixed", 2, 200_000, 1).unwrap();
    let b = run_scenario("mixed", 2, 200_000, 2).unwrap();
    assert_ne!(a.trace.to_lines(), b.trace.to_lines());
}

/// The fixed-priority service scenario keeps the Above UI lane responsive.
#[test]
fn test_fixed_priority_lane() {
    common::setup_test();
    let engine = run_scenario("fixed", 2, 300_000, 42).unwrap();

    let fix = engine
        .scheduler
        .threads
        .iter()
        .find(|t| t.name.starts_with("windowserver"))
        .unwrap();
    assert_eq!(fix.bucket.name(), "FIXPRI");
    assert!(fix.total_cpu_us > 0, "fixed-priority service never ran");
    // Fixed threads never decay.
    assert_eq!(fix.sched_pri, fix.base_pri);
}

/// Snapshots serialize and expose the per-thread and per-bucket views.
#[test]
fn test_snapshot_surface() {
    common::setup_test();
    let engine = run_scenario("mixed", 2, 100_000, 42).unwrap();
    let snapshot = engine.snapshot();

    assert_eq!(snapshot.threads.len(), engine.scheduler.threads.len());
    assert_eq!(snapshot.root_buckets.len(), 6);
    assert_eq!(snapshot.processors.len(), 2);
    assert!(!snapshot.recent_trace.is_empty());

    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(json.contains("\"root_buckets\""));
}
