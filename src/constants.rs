//! Scheduler constants: priority bands, per-bucket policy tables, and
//! timeshare decay parameters.
//!
//! Priority space is 128 levels. The RT band occupies [97, 127], kernel
//! priorities [80, 95], and user timeshare priorities [0, 63].

use crate::types::{Bucket, Pri, TimeUs, NUM_BUCKETS};

// Priority levels.
pub const NRQS_MAX: usize = 128;
pub const MAXPRI: Pri = (NRQS_MAX as Pri) - 1; // 127
pub const MINPRI: Pri = 0;
pub const NOPRI: Pri = -1;

pub const BASEPRI_REALTIME: Pri = MAXPRI - (NRQS_MAX as Pri / 4) + 1; // 96
pub const BASEPRI_RTQUEUES: Pri = BASEPRI_REALTIME + 1; // 97

pub const MAXPRI_KERNEL: Pri = BASEPRI_REALTIME - 1; // 95
pub const BASEPRI_PREEMPT: Pri = MAXPRI_KERNEL - 3; // 92

pub const MAXPRI_USER: Pri = 63;
pub const BASEPRI_DEFAULT: Pri = MAXPRI_USER - (NRQS_MAX as Pri / 4); // 31
pub const BASEPRI_CONTROL: Pri = BASEPRI_DEFAULT + 17; // 48
pub const BASEPRI_FOREGROUND: Pri = BASEPRI_DEFAULT + 16; // 47
pub const BASEPRI_USER_INITIATED: Pri = BASEPRI_DEFAULT + 6; // 37
pub const BASEPRI_UTILITY: Pri = BASEPRI_DEFAULT - 11; // 20
pub const MAXPRI_THROTTLE: Pri = MINPRI + 4; // 4

/// Number of non-realtime run-queue levels.
pub const NRQS: usize = BASEPRI_REALTIME as usize; // 96
/// Number of realtime priority levels [BASEPRI_RTQUEUES, MAXPRI].
pub const NRTQS: usize = (MAXPRI - BASEPRI_RTQUEUES) as usize + 1; // 31

// Realtime deadline sentinels.
pub const RT_DEADLINE_NONE: TimeUs = u64::MAX;
pub const RT_DEADLINE_QUANTUM_EXPIRED: TimeUs = u64::MAX - 1;

/// Marks a warp window that has not been opened yet.
pub const WARP_UNUSED: TimeUs = u64::MAX;

/// Root bucket WCEL (worst-case execution latency) per bucket, µs.
/// FIXPRI does not participate in EDF; its entry is never read.
pub const ROOT_BUCKET_WCEL_US: [TimeUs; NUM_BUCKETS] = [0, 0, 37_500, 75_000, 150_000, 250_000];

/// Root bucket warp budgets per bucket, µs.
pub const ROOT_BUCKET_WARP_US: [TimeUs; NUM_BUCKETS] = [0, 8_000, 4_000, 2_000, 1_000, 0];

/// Thread quantum per bucket, µs.
pub const THREAD_QUANTUM_US: [TimeUs; NUM_BUCKETS] =
    [10_000, 10_000, 8_000, 6_000, 4_000, 2_000];

/// Interval at which pending data is sampled for interactivity ageing, µs.
pub const BUCKET_GROUP_PENDING_DELTA_US: [TimeUs; NUM_BUCKETS] =
    [0, 10_000, 37_500, 75_000, 150_000, 250_000];

impl Bucket {
    pub fn quantum_us(self) -> TimeUs {
        THREAD_QUANTUM_US[self.index()]
    }

    pub fn wcel_us(self) -> TimeUs {
        ROOT_BUCKET_WCEL_US[self.index()]
    }

    pub fn warp_us(self) -> TimeUs {
        ROOT_BUCKET_WARP_US[self.index()]
    }

    pub fn pending_delta_us(self) -> TimeUs {
        BUCKET_GROUP_PENDING_DELTA_US[self.index()]
    }
}

// Interactivity scoring.
pub const INTERACTIVE_PRI_DEFAULT: u64 = 8;
pub const ADJUST_THRESHOLD_US: u64 = 500_000;
pub const ADJUST_RATIO: u64 = 10;
/// Sentinel for "no blocked/pending timestamp recorded".
pub const TS_INVALID: TimeUs = u64::MAX;

// Timeshare decay.
/// `pri_shift` values above this bound collapse to the no-decay sentinel.
pub const SCHED_PRI_SHIFT_MAX: i32 = 31;
/// The no-decay sentinel (INT8_MAX in the kernel's int8 field).
pub const PRI_SHIFT_NONE: i32 = 127;
pub const SCHED_FIXED_SHIFT: i32 = 31;
/// Usage is zeroed outright once this many ticks elapse without running.
pub const SCHED_DECAY_TICKS: usize = 32;

/// Shift-pair approximation of (5/8)^n usage ageing. Entry n applies n ticks;
/// a negative second shift means subtract instead of add.
pub const SCHED_DECAY_SHIFTS: [(u32, i32); SCHED_DECAY_TICKS] = [
    (1, 1),
    (1, 3),
    (1, -3),
    (2, -7),
    (3, 5),
    (3, -5),
    (4, -8),
    (5, 7),
    (5, -7),
    (6, -10),
    (7, 10),
    (7, -9),
    (8, -11),
    (9, 12),
    (9, -11),
    (10, -13),
    (11, 14),
    (11, -13),
    (12, -15),
    (13, 17),
    (13, -15),
    (14, -17),
    (15, 19),
    (16, 18),
    (16, -19),
    (17, 22),
    (18, 20),
    (18, -20),
    (19, 26),
    (20, 22),
    (20, -22),
    (21, -27),
];

/// Load-to-shift mapping: for load >= 2, the bracket [2^k, 2^(k+1)) maps to
/// shift k (decay penalty 1). Load 0 disables decay entirely.
pub fn sched_load_shift(load: usize) -> i32 {
    match load {
        0 => i8::MIN as i32,
        1 => 0,
        _ => {
            let mut k: i32 = 1;
            let mut bound: usize = 4;
            while load >= bound {
                bound <<= 1;
                k += 1;
            }
            k
        }
    }
}

/// Scheduler maintenance tick interval, µs.
pub const SCHED_TICK_INTERVAL_US: TimeUs = 125_000;

// Enqueue options.
pub const SCHED_TAILQ: u32 = 0x1;
pub const SCHED_HEADQ: u32 = 0x2;
pub const SCHED_PREEMPT: u32 = 0x4;

// Clutch bucket runqueue options.
pub const CLUTCH_BUCKET_OPTIONS_NONE: u32 = 0x0;
pub const CLUTCH_BUCKET_OPTIONS_SAMEPRI_RR: u32 = 0x1;
pub const CLUTCH_BUCKET_OPTIONS_HEADQ: u32 = 0x2;
pub const CLUTCH_BUCKET_OPTIONS_TAILQ: u32 = 0x4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bands() {
        assert_eq!(BASEPRI_RTQUEUES, 97);
        assert_eq!(BASEPRI_PREEMPT, 92);
        assert_eq!(BASEPRI_FOREGROUND, 47);
        assert_eq!(BASEPRI_USER_INITIATED, 37);
        assert_eq!(BASEPRI_DEFAULT, 31);
        assert_eq!(BASEPRI_UTILITY, 20);
        assert_eq!(MAXPRI_THROTTLE, 4);
        assert_eq!(NRTQS, 31);
    }

    #[test]
    fn test_load_shift_brackets() {
        assert_eq!(sched_load_shift(0), -128);
        assert_eq!(sched_load_shift(1), 0);
        assert_eq!(sched_load_shift(2), 1);
        assert_eq!(sched_load_shift(3), 1);
        assert_eq!(sched_load_shift(4), 2);
        assert_eq!(sched_load_shift(7), 2);
        assert_eq!(sched_load_shift(8), 3);
        assert_eq!(sched_load_shift(15), 3);
        assert_eq!(sched_load_shift(16), 4);
        assert_eq!(sched_load_shift(95), 6);
    }
}
