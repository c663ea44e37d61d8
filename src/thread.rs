//! Thread model: scheduling state, mode, and the QoS bucket mapping.

use crate::constants::{
    BASEPRI_DEFAULT, BASEPRI_FOREGROUND, BASEPRI_RTQUEUES, BASEPRI_USER_INITIATED,
    BASEPRI_UTILITY, MAXPRI, MAXPRI_THROTTLE, PRI_SHIFT_NONE, RT_DEADLINE_NONE,
};
use crate::types::{Bucket, CpuId, GroupId, Pri, Tid, TimeUs};

/// Execution state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Blocked, waiting for a wakeup.
    Waiting,
    /// Enqueued on exactly one runqueue.
    Runnable,
    /// Installed on a processor.
    Running,
    /// Absorbing terminal state.
    Terminated,
}

impl ThreadState {
    pub fn name(self) -> &'static str {
        match self {
            ThreadState::Waiting => "WAITING",
            ThreadState::Runnable => "RUNNABLE",
            ThreadState::Running => "RUNNING",
            ThreadState::Terminated => "TERMINATED",
        }
    }
}

/// Scheduling class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedMode {
    Timeshare,
    Fixed,
    Realtime,
}

/// A simulated kernel thread with its scheduling-relevant fields.
#[derive(Debug)]
pub struct Thread {
    pub tid: Tid,
    pub name: String,
    pub group: GroupId,
    pub mode: SchedMode,
    /// Base priority assigned at creation.
    pub base_pri: Pri,
    /// Current scheduling priority used for runqueue ordering.
    pub sched_pri: Pri,
    /// Upper clamp for the dynamic scheduling priority.
    pub max_priority: Pri,
    /// Clutch QoS bucket derived from mode and base priority.
    pub bucket: Bucket,

    // CPU accounting for timeshare decay.
    pub cpu_usage: u64,
    pub sched_usage: u64,
    /// Last scheduler tick at which usage ageing was applied.
    pub sched_stamp: u64,
    /// CPU accumulated since the last ageing pass.
    pub cpu_delta: u64,
    /// Effective priority shift; `PRI_SHIFT_NONE` (127) disables decay.
    pub pri_shift: i32,

    // Realtime parameters (meaningful only for `SchedMode::Realtime`).
    pub rt_period: TimeUs,
    pub rt_computation: TimeUs,
    pub rt_constraint: TimeUs,
    pub rt_deadline: TimeUs,

    pub quantum_remaining: TimeUs,
    pub first_timeslice: bool,

    pub state: ThreadState,
    pub last_run_time: TimeUs,
    pub last_made_runnable_time: TimeUs,
    /// Start of the current running segment; `None` while off-core.
    pub computation_epoch: Option<TimeUs>,

    // Priority promotion (settable through the adapter surface).
    pub promoted_pri: Pri,
    pub sched_pri_promoted: bool,

    /// Optional hard CPU binding; bound threads use the per-processor
    /// runqueue instead of the Clutch hierarchy.
    pub bound_processor: Option<CpuId>,

    // Stats.
    pub total_cpu_us: u64,
    pub total_wait_us: u64,
    pub context_switches: u64,
    pub preemption_count: u64,
}

impl Thread {
    pub fn new(tid: Tid, group: GroupId, mode: SchedMode, base_pri: Pri, name: String) -> Self {
        let base_pri = if mode == SchedMode::Realtime && base_pri < BASEPRI_RTQUEUES {
            BASEPRI_RTQUEUES
        } else {
            base_pri
        };
        let bucket = bucket_map(mode, base_pri);
        let mut thread = Thread {
            tid,
            name,
            group,
            mode,
            base_pri,
            sched_pri: base_pri,
            max_priority: if mode == SchedMode::Realtime {
                MAXPRI
            } else {
                base_pri
            },
            bucket,
            cpu_usage: 0,
            sched_usage: 0,
            sched_stamp: 0,
            cpu_delta: 0,
            pri_shift: PRI_SHIFT_NONE,
            rt_period: 0,
            rt_computation: 0,
            rt_constraint: 0,
            rt_deadline: RT_DEADLINE_NONE,
            quantum_remaining: 0,
            first_timeslice: true,
            state: ThreadState::Waiting,
            last_run_time: 0,
            last_made_runnable_time: 0,
            computation_epoch: None,
            promoted_pri: 0,
            sched_pri_promoted: false,
            bound_processor: None,
            total_cpu_us: 0,
            total_wait_us: 0,
            context_switches: 0,
            preemption_count: 0,
        };
        thread.quantum_remaining = thread.initial_quantum();
        thread
    }

    pub fn is_realtime(&self) -> bool {
        self.mode == SchedMode::Realtime
    }

    pub fn is_timeshare(&self) -> bool {
        self.mode == SchedMode::Timeshare
    }

    /// Priority used for clutchpri ordering: promotion overrides base.
    pub fn clutchpri(&self) -> Pri {
        if self.sched_pri_promoted {
            self.sched_pri.max(self.promoted_pri)
        } else {
            self.base_pri
        }
    }

    fn initial_quantum(&self) -> TimeUs {
        if self.is_realtime() && self.rt_computation > 0 {
            self.rt_computation
        } else {
            self.bucket.quantum_us()
        }
    }

    /// Reset the quantum for a fresh timeslice.
    pub fn reset_quantum(&mut self) {
        self.quantum_remaining = self.initial_quantum();
        self.first_timeslice = true;
    }
}

fn convert_pri_to_bucket(pri: Pri) -> Bucket {
    if pri > BASEPRI_USER_INITIATED {
        Bucket::Fg
    } else if pri > BASEPRI_DEFAULT {
        Bucket::In
    } else if pri > BASEPRI_UTILITY {
        Bucket::Df
    } else if pri > MAXPRI_THROTTLE {
        Bucket::Ut
    } else {
        Bucket::Bg
    }
}

/// Map a thread to its scheduling bucket.
///
/// Realtime threads and high fixed-priority threads land in the Above UI
/// lane; everything else maps by base priority.
pub fn bucket_map(mode: SchedMode, base_pri: Pri) -> Bucket {
    match mode {
        SchedMode::Realtime => Bucket::Fixpri,
        SchedMode::Fixed => {
            if base_pri >= BASEPRI_FOREGROUND {
                Bucket::Fixpri
            } else {
                convert_pri_to_bucket(base_pri)
            }
        }
        SchedMode::Timeshare => convert_pri_to_bucket(base_pri),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_map() {
        assert_eq!(bucket_map(SchedMode::Realtime, 97), Bucket::Fixpri);
        assert_eq!(bucket_map(SchedMode::Fixed, 48), Bucket::Fixpri);
        assert_eq!(bucket_map(SchedMode::Fixed, 40), Bucket::Fg);
        assert_eq!(bucket_map(SchedMode::Timeshare, 47), Bucket::Fg);
        assert_eq!(bucket_map(SchedMode::Timeshare, 37), Bucket::In);
        assert_eq!(bucket_map(SchedMode::Timeshare, 31), Bucket::Df);
        assert_eq!(bucket_map(SchedMode::Timeshare, 20), Bucket::Ut);
        assert_eq!(bucket_map(SchedMode::Timeshare, 4), Bucket::Bg);
    }

    #[test]
    fn test_rt_priority_floor() {
        let t = Thread::new(Tid(0), GroupId(0), SchedMode::Realtime, 50, "rt".into());
        assert_eq!(t.base_pri, BASEPRI_RTQUEUES);
        assert_eq!(t.max_priority, MAXPRI);
    }

    #[test]
    fn test_timeshare_quantum_by_bucket() {
        let fg = Thread::new(Tid(0), GroupId(0), SchedMode::Timeshare, 47, "fg".into());
        let bg = Thread::new(Tid(1), GroupId(0), SchedMode::Timeshare, 4, "bg".into());
        assert_eq!(fg.quantum_remaining, 10_000);
        assert_eq!(bg.quantum_remaining, 2_000);
    }
}
