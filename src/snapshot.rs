//! Serializable state snapshot: the read surface consumed by external
//! layers (dashboards, task managers) between events.

use serde::Serialize;

use crate::constants::{RT_DEADLINE_QUANTUM_EXPIRED, WARP_UNUSED};
use crate::scheduler::Scheduler;
use crate::thread::ThreadState;
use crate::trace::Trace;
use crate::types::{Bucket, Pri, TimeUs, NUM_BUCKETS};

#[derive(Debug, Serialize)]
pub struct ThreadSnapshot {
    pub tid: u32,
    pub name: String,
    pub state: &'static str,
    pub sched_pri: Pri,
    pub sched_bucket: &'static str,
    pub cpu_usage: u64,
    pub quantum_remaining: TimeUs,
    /// Full quantum for this thread's bucket (or RT computation).
    pub quantum_base: TimeUs,
    /// Current RT deadline, absent for non-RT threads and retired deadlines.
    pub rt_deadline: Option<TimeUs>,
    pub is_active: bool,
    /// Position in the thread's runqueue, when enqueued.
    pub run_queue_rank: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RootBucketSnapshot {
    pub band: &'static str,
    pub warp_remaining: TimeUs,
    pub warp_total: TimeUs,
    pub deadline: TimeUs,
    pub deadline_remaining: TimeUs,
}

#[derive(Debug, Serialize)]
pub struct ProcessorSnapshot {
    pub cpu: u32,
    pub active_tid: Option<u32>,
    pub current_pri: Pri,
}

/// Full scheduler state at one instant, plus the recent trace tail.
#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub time_us: TimeUs,
    pub threads: Vec<ThreadSnapshot>,
    pub root_buckets: Vec<RootBucketSnapshot>,
    pub processors: Vec<ProcessorSnapshot>,
    pub recent_trace: Vec<String>,
}

impl Snapshot {
    pub fn capture(sched: &Scheduler, trace: &Trace, time_us: TimeUs) -> Snapshot {
        let threads = sched
            .threads
            .iter()
            .map(|t| {
                let run_queue_rank = match t.state {
                    ThreadState::Runnable => {
                        if t.is_realtime() {
                            sched.rt_runq.rank_of(t.tid)
                        } else if let Some(cpu) = t.bound_processor {
                            sched.bound_runq(cpu).iter().position(|q| q == t.tid)
                        } else {
                            sched.groups[t.group.0 as usize].clutch.buckets
                                [t.bucket.index()]
                            .thread_runq
                            .iter()
                            .position(|q| q == t.tid)
                        }
                    }
                    _ => None,
                };
                ThreadSnapshot {
                    tid: t.tid.0,
                    name: t.name.clone(),
                    state: t.state.name(),
                    sched_pri: t.sched_pri,
                    sched_bucket: t.bucket.name(),
                    cpu_usage: t.cpu_usage,
                    quantum_remaining: t.quantum_remaining,
                    quantum_base: if t.is_realtime() && t.rt_computation > 0 {
                        t.rt_computation
                    } else {
                        t.bucket.quantum_us()
                    },
                    rt_deadline: (t.is_realtime()
                        && t.rt_deadline < RT_DEADLINE_QUANTUM_EXPIRED)
                        .then_some(t.rt_deadline),
                    is_active: t.state == ThreadState::Running,
                    run_queue_rank,
                }
            })
            .collect();

        let root_buckets = (0..NUM_BUCKETS)
            .map(|i| {
                let rb = &sched.clutch_root.unbound.buckets[i];
                let warp_remaining = if rb.warped_deadline != WARP_UNUSED {
                    rb.warped_deadline.saturating_sub(time_us)
                } else {
                    rb.warp_remaining
                };
                RootBucketSnapshot {
                    band: Bucket::from_index(i).name(),
                    warp_remaining,
                    warp_total: Bucket::from_index(i).warp_us(),
                    deadline: rb.deadline,
                    deadline_remaining: rb.deadline.saturating_sub(time_us),
                }
            })
            .collect();

        let processors = sched
            .processors
            .iter()
            .map(|p| ProcessorSnapshot {
                cpu: p.id.0,
                active_tid: p.active_thread.map(|t| t.0),
                current_pri: p.current_pri,
            })
            .collect();

        Snapshot {
            time_us,
            threads,
            root_buckets,
            processors,
            recent_trace: trace.recent_lines(50),
        }
    }
}
