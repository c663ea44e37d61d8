//! clutch_sim - Deterministic event-driven simulator for an XNU Clutch-style
//! scheduler.
//!
//! The scheduler implements the Clutch hierarchy: per-QoS root buckets
//! selected by EDF with warp and starvation avoidance, per-thread-group
//! clutch buckets boosted by interactivity scoring, Mach timeshare decay, a
//! realtime deadline queue, and per-processor bound runqueues. A
//! discrete-event engine drives it with scripted workload behaviors; a fixed
//! seed reproduces the trace byte for byte.
//!
//! # Architecture
//!
//! - **Scheduler**: owns all state; setrun / select / dispatch / quantum
//!   expire / block / wakeup / sched-tick entry points
//! - **Clutch hierarchy**: root buckets (EDF + warp + starvation), clutch
//!   buckets (interactivity-ordered), thread runqueues (stable max-priority)
//! - **Engine**: event heap, seeded PRNG, workload sampling
//! - **Workloads**: built-in scenarios and JSON workload files
//!
//! # Usage
//!
//! ```rust
//! use clutch_sim::run_scenario;
//!
//! let engine = run_scenario("mixed", 4, 100_000, 42).unwrap();
//! engine.stats.print_summary();
//! ```

pub mod clutch;
pub mod clutch_root;
pub mod constants;
pub mod engine;
pub mod fmt;
pub mod processor;
pub mod root_bucket;
pub mod rt_queue;
pub mod runq;
pub mod scheduler;
pub mod snapshot;
pub mod stats;
pub mod thread;
pub mod timeshare;
pub mod trace;
pub mod types;
pub mod workload;

// Re-export the main public types for convenience.
pub use engine::{EventKind, Prng, SimEngine};
pub use fmt::SimFormat;
pub use scheduler::{Scheduler, ThreadSpec};
pub use snapshot::Snapshot;
pub use stats::StatsCollector;
pub use thread::{SchedMode, Thread, ThreadState};
pub use trace::{Trace, TraceEvent, TraceKind};
pub use types::{Bucket, CpuId, GroupId, Pri, Tid, TimeUs};
pub use workload::{
    build_engine, load_workload_json, parse_duration_us, parse_seed, run_scenario,
    scenario_profiles, seed_from_env, BehaviorProfile, WorkloadError, WorkloadProfile,
    SCENARIO_NAMES,
};
