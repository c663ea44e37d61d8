//! Per-QoS root bucket: EDF deadline, warp budget, and starvation state.

use crate::constants::WARP_UNUSED;
use crate::runq::ClutchBucketRunq;
use crate::types::{Bucket, TimeUs};

/// All threads across all thread groups at one QoS level, as seen by the
/// root-level EDF policy.
#[derive(Debug)]
pub struct RootBucket {
    pub bucket: Bucket,
    pub bound: bool,

    pub starvation_avoidance: bool,
    pub starvation_ts: TimeUs,

    /// EDF virtual deadline.
    pub deadline: TimeUs,

    /// Remaining warp budget, µs.
    pub warp_remaining: TimeUs,
    /// Absolute end of the open warp window; `WARP_UNUSED` while closed.
    pub warped_deadline: TimeUs,

    /// Clutch buckets currently runnable in this band.
    pub clutch_buckets: ClutchBucketRunq,
}

impl RootBucket {
    pub fn new(bucket: Bucket, bound: bool) -> Self {
        RootBucket {
            bucket,
            bound,
            starvation_avoidance: false,
            starvation_ts: 0,
            deadline: 0,
            warp_remaining: bucket.warp_us(),
            warped_deadline: WARP_UNUSED,
            clutch_buckets: ClutchBucketRunq::new(),
        }
    }

    /// EDF deadline for this bucket at `timestamp`. Above UI always sorts
    /// first; timeshare buckets get `timestamp + WCEL`.
    pub fn deadline_calculate(&self, timestamp: TimeUs) -> TimeUs {
        if self.bucket.is_above_timeshare() {
            0
        } else {
            timestamp + self.bucket.wcel_us()
        }
    }

    /// Push the deadline out after this bucket is selected.
    pub fn deadline_update(&mut self, timestamp: TimeUs) {
        if self.bucket.is_above_timeshare() {
            return;
        }
        self.deadline = self.deadline_calculate(timestamp);
    }

    /// Restore the full warp budget and close the warp window.
    pub fn reset_warp(&mut self) {
        self.warp_remaining = self.bucket.warp_us();
        self.warped_deadline = WARP_UNUSED;
    }

    /// Settle the warp window when the bucket empties: whatever is left of
    /// an open window becomes the remaining budget.
    pub fn on_empty(&mut self, timestamp: TimeUs) {
        if self.bucket.is_above_timeshare() {
            return;
        }
        if self.warped_deadline != WARP_UNUSED {
            self.warp_remaining = self.warped_deadline.saturating_sub(timestamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_calculate() {
        let fixpri = RootBucket::new(Bucket::Fixpri, false);
        assert_eq!(fixpri.deadline_calculate(10_000), 0);
        let bg = RootBucket::new(Bucket::Bg, false);
        assert_eq!(bg.deadline_calculate(10_000), 260_000);
    }

    #[test]
    fn test_on_empty_settles_open_warp_window() {
        let mut fg = RootBucket::new(Bucket::Fg, false);
        fg.warped_deadline = 12_000;
        fg.on_empty(10_000);
        assert_eq!(fg.warp_remaining, 2_000);
        fg.warped_deadline = 5_000;
        fg.on_empty(10_000);
        assert_eq!(fg.warp_remaining, 0);
    }
}
