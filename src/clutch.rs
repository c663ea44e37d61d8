//! The per-thread-group clutch hierarchy: bucket groups, clutch buckets,
//! and the container tying the six QoS bands of one group together.
//!
//! A bucket group carries the timesharing inputs (load-derived pri_shift,
//! CPU used/blocked data, run counts) and the interactivity score that
//! boosts a group's clutch bucket in the hierarchy. The clutch bucket owns
//! the actual thread runqueue.

use crate::constants::{
    ADJUST_RATIO, ADJUST_THRESHOLD_US, INTERACTIVE_PRI_DEFAULT, PRI_SHIFT_NONE, TS_INVALID,
};
use crate::runq::{MaxPrioq, StableRunq};
use crate::timeshare::pri_shift_for_load;
use crate::types::{Bucket, Pri, Tid, TimeUs, NUM_BUCKETS};

/// Per thread-group, per QoS bucket group: timesharing properties, CPU
/// usage tracking, and interactivity scoring.
#[derive(Debug)]
pub struct ClutchBucketGroup {
    pub bucket: Bucket,
    /// Last scheduler tick at which the pri_shift was refreshed.
    pub timeshare_tick: u64,
    pub pri_shift: i32,

    /// CPU consumed by member threads since the last adjustment, µs.
    pub cpu_used: u64,
    /// Time the whole group spent blocked since the last adjustment, µs.
    pub cpu_blocked: u64,

    /// Runnable + running member threads (TH_RUN population).
    pub run_count: u32,
    /// When the group last went fully blocked; `TS_INVALID` while runnable.
    pub blocked_ts: TimeUs,

    /// Enqueued member threads, for pending-based interactivity ageing.
    pub pending_count: u32,
    pub pending_ts: TimeUs,

    /// Interactivity score in [0, 16]; 8 is neutral.
    pub interactivity_score: u64,
    pub interactivity_ts: TimeUs,
}

impl ClutchBucketGroup {
    pub fn new(bucket: Bucket) -> Self {
        ClutchBucketGroup {
            bucket,
            timeshare_tick: 0,
            pri_shift: PRI_SHIFT_NONE,
            cpu_used: 0,
            // Seeded with the full adjust threshold so a fresh group starts
            // fully interactive.
            cpu_blocked: ADJUST_THRESHOLD_US,
            run_count: 0,
            blocked_ts: TS_INVALID,
            pending_count: 0,
            pending_ts: TS_INVALID,
            interactivity_score: INTERACTIVE_PRI_DEFAULT * 2,
            interactivity_ts: 0,
        }
    }

    /// Increment the runnable/running population. On the all-blocked to
    /// runnable transition, fold the blocked interval into `cpu_blocked`.
    pub fn run_count_inc(&mut self, timestamp: TimeUs) -> u32 {
        let old_count = self.run_count;
        self.run_count += 1;

        if old_count == 0 {
            let old_ts = std::mem::replace(&mut self.blocked_ts, TS_INVALID);
            if old_ts != TS_INVALID && timestamp > old_ts {
                let blocked = (timestamp - old_ts).min(ADJUST_THRESHOLD_US);
                self.cpu_blocked += blocked;
            }
        }
        self.run_count
    }

    /// Decrement the runnable/running population, recording the blocked
    /// timestamp when the group goes fully idle.
    pub fn run_count_dec(&mut self, timestamp: TimeUs) -> u32 {
        self.run_count -= 1;
        if self.run_count == 0 {
            self.blocked_ts = timestamp;
        }
        self.run_count
    }

    pub fn thr_count_inc(&mut self, timestamp: TimeUs) {
        self.pending_count += 1;
        if self.pending_ts == TS_INVALID {
            self.pending_ts = timestamp;
        }
    }

    pub fn thr_count_dec(&mut self, timestamp: TimeUs) {
        self.pending_count -= 1;
        if self.pending_count == 0 {
            self.pending_ts = TS_INVALID;
        } else {
            // Refresh the pending timestamp while threads remain enqueued.
            self.pending_ts = timestamp;
        }
    }

    /// Add CPU usage for this bucket group, capped at the adjust threshold.
    pub fn cpu_usage_update(&mut self, delta: u64) {
        if self.bucket.is_above_timeshare() {
            return;
        }
        self.cpu_used += delta.min(ADJUST_THRESHOLD_US);
    }

    /// Scale CPU usage/blocked data down and apply pending ageing.
    fn cpu_adjust(&mut self, pending_intervals: u64) {
        let mut cpu_used = self.cpu_used;
        let mut cpu_blocked = self.cpu_blocked;

        if pending_intervals == 0 && cpu_used + cpu_blocked < ADJUST_THRESHOLD_US {
            return;
        }

        if cpu_used + cpu_blocked >= ADJUST_THRESHOLD_US {
            cpu_used /= ADJUST_RATIO;
            cpu_blocked /= ADJUST_RATIO;
        }

        self.cpu_used = Self::cpu_pending_adjust(cpu_used, cpu_blocked, pending_intervals);
        self.cpu_blocked = cpu_blocked;
    }

    fn cpu_pending_adjust(cpu_used: u64, cpu_blocked: u64, pending_intervals: u64) -> u64 {
        if pending_intervals == 0 {
            return cpu_used;
        }

        if cpu_blocked < cpu_used {
            // Non-interactive case.
            let numerator = INTERACTIVE_PRI_DEFAULT * cpu_blocked * cpu_used;
            let denominator =
                INTERACTIVE_PRI_DEFAULT * cpu_blocked + cpu_used * pending_intervals;
            if denominator == 0 {
                0
            } else {
                numerator / denominator
            }
        } else {
            // Interactive case.
            let adjust = cpu_blocked * pending_intervals / INTERACTIVE_PRI_DEFAULT;
            cpu_used.saturating_sub(adjust)
        }
    }

    /// Interactivity score from the used/blocked ratio. Range [0, 16].
    fn interactivity_from_cpu_data(&self) -> u64 {
        let cpu_used = self.cpu_used;
        let cpu_blocked = self.cpu_blocked;

        if cpu_blocked == 0 && cpu_used == 0 {
            return self.interactivity_score;
        }

        if cpu_blocked > cpu_used {
            INTERACTIVE_PRI_DEFAULT
                + INTERACTIVE_PRI_DEFAULT * (cpu_blocked - cpu_used) / cpu_blocked
        } else if cpu_used == 0 {
            INTERACTIVE_PRI_DEFAULT
        } else {
            INTERACTIVE_PRI_DEFAULT * cpu_blocked / cpu_used
        }
    }

    /// Recalculate and store the interactivity score, ageing pending data
    /// first.
    pub fn interactivity_score_calculate(
        &mut self,
        timestamp: TimeUs,
        global_bucket_load: u32,
    ) -> u64 {
        if self.bucket.is_above_timeshare() {
            return self.interactivity_score;
        }

        let pending_intervals = self.pending_ageout(timestamp, global_bucket_load);
        self.cpu_adjust(pending_intervals);
        let score = self.interactivity_from_cpu_data();

        if timestamp > self.interactivity_ts {
            self.interactivity_score = score;
            self.interactivity_ts = timestamp;
        }
        self.interactivity_score
    }

    fn pending_ageout(&mut self, timestamp: TimeUs, global_bucket_load: u32) -> u64 {
        let old_pending_ts = self.pending_ts;
        if old_pending_ts >= timestamp || old_pending_ts == TS_INVALID || global_bucket_load == 0
        {
            return 0;
        }

        let pending_delta = timestamp - old_pending_ts;
        let interactivity_delta = self.bucket.pending_delta_us()
            + global_bucket_load as u64 * self.bucket.quantum_us();
        if interactivity_delta == 0 || pending_delta < interactivity_delta {
            return 0;
        }

        let intervals = pending_delta / interactivity_delta;
        self.pending_ts = old_pending_ts + intervals * interactivity_delta;
        intervals
    }

    /// Refresh the decay shift from the group's current load, at most once
    /// per scheduler tick.
    pub fn pri_shift_update(&mut self, current_tick: u64, processor_count: u32) {
        if self.bucket.is_above_timeshare() {
            return;
        }
        if self.timeshare_tick < current_tick {
            self.timeshare_tick = current_tick;
            self.pri_shift = pri_shift_for_load(self.run_count, processor_count);
        }
    }
}

/// Per thread-group, per QoS clutch bucket: the thread runqueue itself.
#[derive(Debug)]
pub struct ClutchBucket {
    pub bucket: Bucket,
    /// Interactivity-adjusted priority ordering this bucket in its root
    /// bucket's runqueue.
    pub priority: Pri,
    pub thr_count: u32,
    /// Whether this bucket is currently inserted in the root hierarchy.
    pub in_hierarchy: bool,
    /// Thread runqueue ordered by sched_pri with preempted-first semantics.
    pub thread_runq: StableRunq,
    /// Base/promoted priority ordering, for the bucket's base priority.
    pub clutchpri_prioq: MaxPrioq,
    /// Member threads subject to sched-tick ageing.
    pub timeshare_threads: Vec<Tid>,
}

impl ClutchBucket {
    pub fn new(bucket: Bucket) -> Self {
        ClutchBucket {
            bucket,
            priority: 0,
            thr_count: 0,
            in_hierarchy: false,
            thread_runq: StableRunq::new(),
            clutchpri_prioq: MaxPrioq::new(),
            timeshare_threads: Vec::new(),
        }
    }

    /// Base priority of the bucket: highest base/promoted priority among
    /// member threads, or 0 when empty.
    pub fn base_pri(&self) -> Pri {
        self.clutchpri_prioq.max_priority().unwrap_or(0)
    }
}

/// The clutch of one thread group: six bucket groups and their (single
/// cluster) clutch buckets.
#[derive(Debug)]
pub struct SchedClutch {
    pub thr_count: u32,
    pub groups: [ClutchBucketGroup; NUM_BUCKETS],
    pub buckets: [ClutchBucket; NUM_BUCKETS],
}

impl SchedClutch {
    pub fn new() -> Self {
        SchedClutch {
            thr_count: 0,
            groups: std::array::from_fn(|i| ClutchBucketGroup::new(Bucket::from_index(i))),
            buckets: std::array::from_fn(|i| ClutchBucket::new(Bucket::from_index(i))),
        }
    }

    /// Clutch bucket priority: base priority plus the group's interactivity
    /// score, recalculated at `timestamp`.
    pub fn bucket_pri_calculate(
        &mut self,
        bucket: Bucket,
        timestamp: TimeUs,
        global_bucket_load: u32,
    ) -> Pri {
        let idx = bucket.index();
        if self.buckets[idx].thr_count == 0 {
            return 0;
        }
        let base = self.buckets[idx].base_pri();
        let score =
            self.groups[idx].interactivity_score_calculate(timestamp, global_bucket_load);
        (base + score as Pri).min(255)
    }
}

impl Default for SchedClutch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_group_is_fully_interactive() {
        let mut g = ClutchBucketGroup::new(Bucket::Fg);
        g.thr_count_inc(0);
        let score = g.interactivity_score_calculate(1, 1);
        // cpu_blocked starts at the full threshold with zero usage.
        assert_eq!(score, 2 * INTERACTIVE_PRI_DEFAULT);
    }

    #[test]
    fn test_cpu_bound_group_score_drops() {
        let mut g = ClutchBucketGroup::new(Bucket::Df);
        g.cpu_blocked = 0;
        g.cpu_used = 400_000;
        let score = g.interactivity_score_calculate(1, 1);
        assert!(score < INTERACTIVE_PRI_DEFAULT, "score={score}");
    }

    #[test]
    fn test_blocked_interval_folds_in_on_wake() {
        let mut g = ClutchBucketGroup::new(Bucket::Fg);
        g.run_count_inc(0);
        g.run_count_dec(1_000);
        assert_eq!(g.blocked_ts, 1_000);
        let before = g.cpu_blocked;
        g.run_count_inc(51_000);
        assert_eq!(g.cpu_blocked, before + 50_000);
        assert_eq!(g.blocked_ts, TS_INVALID);
    }

    #[test]
    fn test_bucket_pri_is_base_plus_score() {
        let mut clutch = SchedClutch::new();
        let idx = Bucket::Fg.index();
        clutch.buckets[idx].thr_count = 1;
        clutch.buckets[idx].clutchpri_prioq.insert(Tid(0), 47);
        let pri = clutch.bucket_pri_calculate(Bucket::Fg, 1, 1);
        assert_eq!(pri, 47 + 2 * INTERACTIVE_PRI_DEFAULT as Pri);
    }
}
