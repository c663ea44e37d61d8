//! Mach timeshare decay: priority computation, usage charging and ageing,
//! and the load-sensitive priority shift.
//!
//! `sched_pri = base_pri - (sched_usage >> pri_shift)`, clamped to
//! `[MINPRI, max_priority]`. The shift comes from the bucket group's load:
//! higher load gives a smaller shift, which decays CPU hogs faster.

use crate::constants::{
    sched_load_shift, MINPRI, NRQS, PRI_SHIFT_NONE, SCHED_DECAY_SHIFTS, SCHED_DECAY_TICKS,
    SCHED_FIXED_SHIFT, SCHED_PRI_SHIFT_MAX,
};
use crate::thread::Thread;
use crate::types::Pri;

/// Effective scheduling priority for a timeshare thread.
///
/// Above-UI threads and hard-bound threads never decay; the bound case
/// mirrors the kernel's INT8_MAX shift sentinel for non-clutch-eligible
/// threads.
pub fn compute_sched_pri(thread: &Thread) -> Pri {
    if thread.bucket.is_above_timeshare() {
        return thread.base_pri;
    }
    if thread.bound_processor.is_some() {
        return thread.base_pri;
    }
    if thread.pri_shift >= PRI_SHIFT_NONE {
        return thread.base_pri;
    }

    let decay = (thread.sched_usage >> thread.pri_shift) as Pri;
    (thread.base_pri - decay).clamp(MINPRI, thread.max_priority)
}

/// Charge a completed running segment to the thread's usage counters.
///
/// `sched_usage` (the decay input) is charged only while the previous window
/// was contended (shift below the sentinel).
pub fn charge_cpu(thread: &mut Thread, delta_us: u64) {
    thread.cpu_usage += delta_us;
    if thread.pri_shift < PRI_SHIFT_NONE {
        thread.sched_usage += delta_us;
    }
    thread.cpu_delta += delta_us;
}

/// Age accumulated usage by `ticks` scheduler ticks using the (5/8)^n
/// shift-pair approximation. Usage is zeroed outright past the table bound.
pub fn age_cpu_usage(thread: &mut Thread, ticks: u64) {
    if ticks as usize >= SCHED_DECAY_TICKS {
        thread.cpu_usage = 0;
        thread.sched_usage = 0;
        thread.cpu_delta = 0;
        return;
    }

    let (shift1, shift2) = SCHED_DECAY_SHIFTS[ticks as usize];
    if shift2 > 0 {
        thread.cpu_usage = (thread.cpu_usage >> shift1) + (thread.cpu_usage >> shift2 as u32);
        thread.sched_usage =
            (thread.sched_usage >> shift1) + (thread.sched_usage >> shift2 as u32);
    } else {
        let neg = (-shift2) as u32;
        thread.cpu_usage =
            (thread.cpu_usage >> shift1).saturating_sub(thread.cpu_usage >> neg);
        thread.sched_usage =
            (thread.sched_usage >> shift1).saturating_sub(thread.sched_usage >> neg);
    }
    thread.cpu_delta = 0;
}

/// Priority shift for a bucket group's load. The run count is discounted by
/// one so an NCPU-wide workload does not see decay.
pub fn pri_shift_for_load(run_count: u32, processor_count: u32) -> i32 {
    if processor_count == 0 {
        return PRI_SHIFT_NONE;
    }

    let effective = run_count.saturating_sub(1);
    let load = ((effective / processor_count) as usize).min(NRQS - 1);

    let pri_shift = SCHED_FIXED_SHIFT - sched_load_shift(load);
    if pri_shift > SCHED_PRI_SHIFT_MAX {
        PRI_SHIFT_NONE
    } else {
        pri_shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::SchedMode;
    use crate::types::{CpuId, GroupId, Tid};

    fn timeshare(base_pri: Pri) -> Thread {
        Thread::new(Tid(0), GroupId(0), SchedMode::Timeshare, base_pri, "t".into())
    }

    #[test]
    fn test_no_decay_at_sentinel_shift() {
        let mut t = timeshare(31);
        t.sched_usage = 1 << 20;
        assert_eq!(compute_sched_pri(&t), 31);
    }

    #[test]
    fn test_decay_lowers_priority() {
        let mut t = timeshare(31);
        t.pri_shift = 10;
        t.sched_usage = 8 << 10; // decay of 8
        assert_eq!(compute_sched_pri(&t), 23);
    }

    #[test]
    fn test_decay_clamps_at_minpri() {
        let mut t = timeshare(31);
        t.pri_shift = 0;
        t.sched_usage = 1 << 16;
        assert_eq!(compute_sched_pri(&t), MINPRI);
    }

    #[test]
    fn test_bound_thread_never_decays() {
        let mut t = timeshare(31);
        t.bound_processor = Some(CpuId(0));
        t.pri_shift = 5;
        t.sched_usage = 1 << 20;
        assert_eq!(compute_sched_pri(&t), 31);
    }

    #[test]
    fn test_sched_usage_charged_only_under_contention() {
        let mut t = timeshare(31);
        charge_cpu(&mut t, 1_000);
        assert_eq!(t.cpu_usage, 1_000);
        assert_eq!(t.sched_usage, 0);

        t.pri_shift = 20;
        charge_cpu(&mut t, 1_000);
        assert_eq!(t.cpu_usage, 2_000);
        assert_eq!(t.sched_usage, 1_000);
    }

    #[test]
    fn test_ageing_zeroes_past_table() {
        let mut t = timeshare(31);
        t.cpu_usage = 100_000;
        t.sched_usage = 100_000;
        age_cpu_usage(&mut t, SCHED_DECAY_TICKS as u64);
        assert_eq!(t.cpu_usage, 0);
        assert_eq!(t.sched_usage, 0);
    }

    #[test]
    fn test_ageing_single_tick() {
        let mut t = timeshare(31);
        t.cpu_usage = 1_024;
        t.sched_usage = 1_024;
        // One tick: (u >> 1) + (u >> 3) = 512 + 128 = 640 (~5/8).
        age_cpu_usage(&mut t, 1);
        assert_eq!(t.cpu_usage, 640);
        assert_eq!(t.sched_usage, 640);
    }

    #[test]
    fn test_pri_shift_for_load() {
        // No contention: one runnable thread per CPU sees no decay.
        assert_eq!(pri_shift_for_load(0, 4), PRI_SHIFT_NONE);
        assert_eq!(pri_shift_for_load(4, 4), PRI_SHIFT_NONE);
        // Light load.
        assert_eq!(pri_shift_for_load(5, 4), SCHED_FIXED_SHIFT);
        // Heavier load shrinks the shift.
        assert_eq!(pri_shift_for_load(9, 4), SCHED_FIXED_SHIFT - 1);
        assert_eq!(pri_shift_for_load(17, 4), SCHED_FIXED_SHIFT - 2);
    }
}
