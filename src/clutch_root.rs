//! Root of the Clutch hierarchy: the per-QoS root buckets and the EDF +
//! warp + starvation-avoidance selection policy among them.
//!
//! Selection runs in two phases. The Above UI phase compares the FIXPRI lane
//! against the foreground timeshare lane on clutch-bucket priority; if
//! FIXPRI wins it bypasses EDF entirely. Otherwise the timeshare lanes
//! compete on their virtual deadlines, with two overrides: a higher lane
//! holding warp budget may jump ahead of the EDF winner, and a lane that was
//! passed over while higher lanes were runnable enters starvation avoidance
//! so it cannot be deferred past its quantum-sized grace window.
//!
//! When a processor re-evaluates with its outgoing thread still eligible,
//! that thread's root bucket competes inline (it is not re-enqueued first);
//! `chose_prev` reports that the caller should keep running it.

use crate::constants::WARP_UNUSED;
use crate::root_bucket::RootBucket;
use crate::runq::DeadlineMinQueue;
use crate::types::{Bucket, GroupId, Pri, TimeUs, NUM_BUCKETS};

/// The outgoing thread's standing in root-bucket selection.
#[derive(Debug, Clone, Copy)]
pub struct PrevBucketCtx {
    pub bucket: Bucket,
    /// Interactivity-adjusted clutch priority (sched_pri + group score).
    pub clutch_pri: Pri,
}

fn pri_greater_tiebreak(pri_one: Pri, pri_two: Pri, one_wins_ties: bool) -> bool {
    if one_wins_ties {
        pri_one >= pri_two
    } else {
        pri_one > pri_two
    }
}

fn bitmap_lsb(bitmap: u64) -> Option<usize> {
    if bitmap == 0 {
        None
    } else {
        Some(bitmap.trailing_zeros() as usize)
    }
}

/// One side of the root hierarchy (unbound or processor-bound lanes).
#[derive(Debug)]
pub struct RootBucketSet {
    pub buckets: [RootBucket; NUM_BUCKETS],
    pub prioq: DeadlineMinQueue,
    /// Bit i set while bucket i has runnable clutch buckets.
    pub runnable_bitmap: u64,
    /// Bit i set while bucket i is runnable with warp budget left.
    pub warp_available: u64,
}

impl RootBucketSet {
    fn new(bound: bool) -> Self {
        RootBucketSet {
            buckets: std::array::from_fn(|i| RootBucket::new(Bucket::from_index(i), bound)),
            prioq: DeadlineMinQueue::new(),
            runnable_bitmap: 0,
            warp_available: 0,
        }
    }

    pub fn is_runnable(&self, bucket: Bucket) -> bool {
        self.runnable_bitmap & (1 << bucket.index()) != 0
    }

    /// Insert a newly runnable root bucket into the EDF queue.
    fn root_bucket_runnable(&mut self, idx: usize, timestamp: TimeUs) {
        self.runnable_bitmap |= 1 << idx;
        if Bucket::from_index(idx).is_above_timeshare() {
            return;
        }

        // Keep the starvation deadline in place; otherwise start a fresh
        // WCEL window.
        if !self.buckets[idx].starvation_avoidance {
            self.buckets[idx].deadline = self.buckets[idx].deadline_calculate(timestamp);
        }
        self.prioq.insert(idx, self.buckets[idx].deadline);

        if self.buckets[idx].warp_remaining > 0 {
            self.warp_available |= 1 << idx;
        }
    }

    /// Remove an emptied root bucket from the EDF queue.
    fn root_bucket_empty(&mut self, idx: usize, timestamp: TimeUs) {
        self.runnable_bitmap &= !(1 << idx);
        if Bucket::from_index(idx).is_above_timeshare() {
            return;
        }

        self.prioq.remove(idx);
        self.warp_available &= !(1 << idx);
        self.buckets[idx].on_empty(timestamp);
    }
}

/// Root of the Clutch hierarchy for one cluster.
#[derive(Debug)]
pub struct ClutchRoot {
    /// Effective top priority across the hierarchy (highest runnable thread
    /// priority inside the leading root bucket).
    pub priority: Pri,
    pub thr_count: u32,
    /// Count of runnable threads above the timeshare bands.
    pub urgency: u32,

    pub unbound: RootBucketSet,
    pub bound: RootBucketSet,

    /// Number of runnable clutch buckets per QoS band.
    pub global_bucket_load: [u32; NUM_BUCKETS],
    /// All runnable clutch buckets, insertion-ordered (sched-tick walk).
    pub clutch_buckets_list: Vec<(GroupId, Bucket)>,
}

impl ClutchRoot {
    pub fn new() -> Self {
        ClutchRoot {
            priority: crate::constants::NOPRI,
            thr_count: 0,
            urgency: 0,
            unbound: RootBucketSet::new(false),
            bound: RootBucketSet::new(true),
            global_bucket_load: [0; NUM_BUCKETS],
            clutch_buckets_list: Vec::new(),
        }
    }

    /// Insert a clutch bucket into its root bucket's runqueue.
    pub fn clutch_bucket_hierarchy_insert(
        &mut self,
        group: GroupId,
        bucket: Bucket,
        cb_priority: Pri,
        timestamp: TimeUs,
        head: bool,
    ) {
        let idx = bucket.index();
        let was_empty = self.unbound.buckets[idx].clutch_buckets.is_empty();

        self.unbound.buckets[idx]
            .clutch_buckets
            .enqueue(group, cb_priority, head);
        self.clutch_buckets_list.push((group, bucket));
        self.global_bucket_load[idx] += 1;

        if was_empty {
            self.unbound.root_bucket_runnable(idx, timestamp);
        }
    }

    /// Remove a clutch bucket from its root bucket's runqueue.
    pub fn clutch_bucket_hierarchy_remove(
        &mut self,
        group: GroupId,
        bucket: Bucket,
        cb_priority: Pri,
        timestamp: TimeUs,
    ) {
        let idx = bucket.index();
        self.unbound.buckets[idx]
            .clutch_buckets
            .dequeue(group, cb_priority);
        if let Some(pos) = self
            .clutch_buckets_list
            .iter()
            .position(|&e| e == (group, bucket))
        {
            self.clutch_buckets_list.remove(pos);
        }
        self.global_bucket_load[idx] -= 1;

        if self.unbound.buckets[idx].clutch_buckets.is_empty() {
            self.unbound.root_bucket_empty(idx, timestamp);
        }
    }

    /// Highest-priority (lowest index) runnable QoS band across both sides.
    pub fn highest_runnable_qos(&self) -> Option<usize> {
        bitmap_lsb(self.unbound.runnable_bitmap | self.bound.runnable_bitmap)
    }

    /// Select the root bucket to serve: Above UI check, then EDF with warp
    /// and starvation avoidance. Returns `(bucket, chose_prev)`.
    pub fn highest_root_bucket(
        &mut self,
        timestamp: TimeUs,
        prev: Option<PrevBucketCtx>,
    ) -> Option<(Bucket, bool)> {
        let highest_runnable = self.highest_runnable_qos();

        match (highest_runnable, prev) {
            (None, None) => return None,
            // Nothing enqueued, but the outgoing thread is still eligible.
            (None, Some(p)) => return Some((p.bucket, true)),
            _ => {}
        }

        let fixpri_runnable = self.unbound.is_runnable(Bucket::Fixpri);
        let prev_is_fixpri = prev.is_some_and(|p| p.bucket == Bucket::Fixpri);

        if fixpri_runnable || prev_is_fixpri {
            if let Some(result) = self.select_aboveui(prev) {
                return Some(result);
            }
        }

        self.evaluate_root_buckets(timestamp, prev)
    }

    /// Decide whether the FIXPRI lane bypasses EDF, by comparing its top
    /// clutch bucket against the foreground lane's (FG loses ties). Returns
    /// None when EDF should decide.
    fn select_aboveui(&self, prev: Option<PrevBucketCtx>) -> Option<(Bucket, bool)> {
        // (bucket index, clutch-bucket priority, is_aboveui)
        let mut higher: Option<(usize, Pri, bool)> = None;

        if self.unbound.is_runnable(Bucket::Fixpri) {
            if let Some((pri, _)) = self.unbound.buckets[Bucket::Fixpri.index()]
                .clutch_buckets
                .peek_highest()
            {
                higher = Some((Bucket::Fixpri.index(), pri, true));
            }
        }

        if self.unbound.is_runnable(Bucket::Fg) {
            if let Some((fg_pri, _)) = self.unbound.buckets[Bucket::Fg.index()]
                .clutch_buckets
                .peek_highest()
            {
                if higher.is_none() || fg_pri > higher.unwrap().1 {
                    higher = Some((Bucket::Fg.index(), fg_pri, false));
                }
            }
        }

        if let Some(p) = prev {
            // A FIXPRI prev wins ties only against a non-AboveUI incumbent.
            let prev_wins_ties =
                p.bucket == Bucket::Fixpri && !higher.is_some_and(|(_, _, aboveui)| aboveui);
            if higher.is_none()
                || pri_greater_tiebreak(p.clutch_pri, higher.unwrap().1, prev_wins_ties)
            {
                higher = Some((p.bucket.index(), p.clutch_pri, p.bucket == Bucket::Fixpri));
            }
        }

        let (idx, _, is_aboveui) = higher?;
        if !is_aboveui {
            return None;
        }

        // If the winning bucket has nothing enqueued, prev is its only
        // candidate: keep running it.
        let chose_prev = prev.is_some() && self.unbound.runnable_bitmap & (1 << idx) == 0;
        Some((Bucket::from_index(idx), chose_prev))
    }

    /// The EDF loop: earliest-deadline lane wins unless a higher lane with
    /// warp budget overrides, with starvation-avoidance expiry folded in.
    fn evaluate_root_buckets(
        &mut self,
        timestamp: TimeUs,
        prev: Option<PrevBucketCtx>,
    ) -> Option<(Bucket, bool)> {
        let prev_in_edf = prev.filter(|p| !p.bucket.is_above_timeshare());

        loop {
            let Some(mut edf_idx) = self.unbound.prioq.peek_min() else {
                // Timeshare portion of the queue is empty.
                return prev_in_edf.map(|p| (p.bucket, true));
            };
            let mut enqueued_normally = true;

            // The outgoing thread's bucket competes inline; strict `<`.
            if let Some(p) = prev_in_edf {
                let pi = p.bucket.index();
                if pi != edf_idx
                    && self.unbound.buckets[pi].deadline < self.unbound.buckets[edf_idx].deadline
                {
                    edf_idx = pi;
                    enqueued_normally = false;
                }
            }

            // Starvation-avoidance grace window expired: restart this lane
            // with a fresh deadline and re-evaluate.
            if self.unbound.buckets[edf_idx].starvation_avoidance {
                let window = self.unbound.buckets[edf_idx].bucket.quantum_us();
                if timestamp >= self.unbound.buckets[edf_idx].starvation_ts + window {
                    let rb = &mut self.unbound.buckets[edf_idx];
                    rb.starvation_avoidance = false;
                    rb.starvation_ts = 0;
                    rb.deadline_update(timestamp);
                    let deadline = rb.deadline;
                    if enqueued_normally {
                        self.unbound.prioq.update_deadline(edf_idx, deadline);
                    }
                    continue;
                }
            }

            let warp_idx = bitmap_lsb(self.unbound.warp_available);

            // A prev bucket above the EDF winner may spend its own warp,
            // but only if no enqueued bucket warps ahead of it.
            let prev_bucket_warping = prev_in_edf.is_some_and(|p| {
                let pi = p.bucket.index();
                pi != edf_idx
                    && self.unbound.buckets[pi].warp_remaining > 0
                    && pi < edf_idx
                    && warp_idx.is_none_or(|w| pi < w)
            });

            let non_edf_can_warp =
                warp_idx.is_some_and(|w| w < edf_idx) || prev_bucket_warping;

            if !non_edf_can_warp {
                self.handle_edf_selection(
                    edf_idx,
                    timestamp,
                    prev_in_edf.map(|p| p.bucket),
                    enqueued_normally,
                );
                return Some((Bucket::from_index(edf_idx), !enqueued_normally));
            }

            let warp_bucket_idx = if prev_bucket_warping {
                prev_in_edf.unwrap().bucket.index()
            } else {
                warp_idx.unwrap()
            };

            // Warp window not yet opened: open it now.
            if self.unbound.buckets[warp_bucket_idx].warped_deadline == WARP_UNUSED {
                let rb = &mut self.unbound.buckets[warp_bucket_idx];
                rb.warped_deadline = timestamp + rb.warp_remaining;
                rb.deadline_update(timestamp);
                let deadline = rb.deadline;
                if !prev_bucket_warping {
                    self.unbound.prioq.update_deadline(warp_bucket_idx, deadline);
                }
                return Some((Bucket::from_index(warp_bucket_idx), prev_bucket_warping));
            }

            // Warp window still open.
            if self.unbound.buckets[warp_bucket_idx].warped_deadline > timestamp {
                let rb = &mut self.unbound.buckets[warp_bucket_idx];
                rb.deadline_update(timestamp);
                let deadline = rb.deadline;
                if !prev_bucket_warping {
                    self.unbound.prioq.update_deadline(warp_bucket_idx, deadline);
                }
                return Some((Bucket::from_index(warp_bucket_idx), prev_bucket_warping));
            }

            // Warp expired: retire this lane's budget and re-evaluate.
            self.unbound.buckets[warp_bucket_idx].warp_remaining = 0;
            if !prev_bucket_warping {
                self.unbound.warp_available &= !(1 << warp_bucket_idx);
            }
        }
    }

    /// The EDF winner was selected without warp: either enter starvation
    /// avoidance (a higher lane is runnable but lost on deadline) or push
    /// the deadline out and refill the warp budget.
    fn handle_edf_selection(
        &mut self,
        edf_idx: usize,
        timestamp: TimeUs,
        prev_bucket: Option<Bucket>,
        enqueued_normally: bool,
    ) {
        let mut highest_runnable = self.highest_runnable_qos();
        if let Some(pb) = prev_bucket {
            if !pb.is_above_timeshare()
                && highest_runnable.is_none_or(|h| pb.index() < h)
            {
                highest_runnable = Some(pb.index());
            }
        }

        if self.unbound.buckets[edf_idx].starvation_avoidance {
            return;
        }

        if highest_runnable.is_some_and(|h| h < edf_idx) {
            // A higher lane is runnable yet EDF picked this lane: it is
            // being served out of order, so bound how long the higher lane
            // can defer it next time.
            let rb = &mut self.unbound.buckets[edf_idx];
            rb.starvation_avoidance = true;
            rb.starvation_ts = timestamp;
        } else {
            let rb = &mut self.unbound.buckets[edf_idx];
            rb.deadline_update(timestamp);
            let deadline = rb.deadline;
            rb.reset_warp();
            if enqueued_normally {
                self.unbound.prioq.update_deadline(edf_idx, deadline);
                self.unbound.warp_available |= 1 << edf_idx;
            }
        }
    }
}

impl Default for ClutchRoot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(root: &mut ClutchRoot, group: u32, bucket: Bucket, pri: Pri, ts: TimeUs) {
        root.clutch_bucket_hierarchy_insert(GroupId(group), bucket, pri, ts, false);
    }

    #[test]
    fn test_single_runnable_bucket_wins() {
        let mut root = ClutchRoot::new();
        insert(&mut root, 0, Bucket::Df, 40, 0);
        let (bucket, chose_prev) = root.highest_root_bucket(0, None).unwrap();
        assert_eq!(bucket, Bucket::Df);
        assert!(!chose_prev);
    }

    #[test]
    fn test_fixpri_bypasses_edf() {
        let mut root = ClutchRoot::new();
        insert(&mut root, 0, Bucket::Bg, 10, 0);
        insert(&mut root, 1, Bucket::Fixpri, 80, 0);
        let (bucket, _) = root.highest_root_bucket(0, None).unwrap();
        assert_eq!(bucket, Bucket::Fixpri);
    }

    #[test]
    fn test_fg_outranks_fixpri_on_clutch_pri() {
        let mut root = ClutchRoot::new();
        insert(&mut root, 0, Bucket::Fixpri, 50, 0);
        insert(&mut root, 1, Bucket::Fg, 60, 0);
        // FG's higher clutch priority sends selection through EDF, where FG
        // holds the earliest deadline (WCEL 0).
        let (bucket, _) = root.highest_root_bucket(0, None).unwrap();
        assert_eq!(bucket, Bucket::Fg);
    }

    #[test]
    fn test_warp_overrides_edf() {
        let mut root = ClutchRoot::new();
        // Both lanes become runnable at t=0: BG's deadline lands at its WCEL
        // (250ms), FG's at 0.
        insert(&mut root, 0, Bucket::Bg, 10, 0);
        insert(&mut root, 1, Bucket::Fg, 60, 0);
        // FG wins naturally and its deadline is pushed to the selection time.
        let (bucket, _) = root.highest_root_bucket(300_000, None).unwrap();
        assert_eq!(bucket, Bucket::Fg);
        assert_eq!(root.unbound.buckets[Bucket::Fg.index()].deadline, 300_000);

        // Now BG holds the earlier deadline, but FG's warp budget lets it
        // jump ahead of the EDF order.
        let (bucket, _) = root.highest_root_bucket(300_001, None).unwrap();
        assert_eq!(bucket, Bucket::Fg);
        assert_ne!(
            root.unbound.buckets[Bucket::Fg.index()].warped_deadline,
            WARP_UNUSED
        );
    }

    #[test]
    fn test_expired_warp_falls_back_to_edf() {
        let mut root = ClutchRoot::new();
        insert(&mut root, 0, Bucket::Bg, 10, 0);
        insert(&mut root, 1, Bucket::Fg, 60, 0);
        // Natural FG selection, then a warp selection that opens the window.
        let _ = root.highest_root_bucket(300_000, None);
        let _ = root.highest_root_bucket(300_001, None);
        let warp_end = root.unbound.buckets[Bucket::Fg.index()].warped_deadline;
        assert_ne!(warp_end, WARP_UNUSED);

        // Past the window, the expired warp retires and EDF resumes with BG.
        let (bucket, _) = root.highest_root_bucket(warp_end + 1, None).unwrap();
        assert_eq!(bucket, Bucket::Bg);
        assert_eq!(root.unbound.buckets[Bucket::Fg.index()].warp_remaining, 0);
    }

    #[test]
    fn test_starvation_avoidance_entered_for_out_of_order_service() {
        let mut root = ClutchRoot::new();
        insert(&mut root, 0, Bucket::Fg, 60, 0);
        insert(&mut root, 1, Bucket::Bg, 10, 0);
        // Force BG to the front of EDF while FG is runnable. BG has no warp
        // (budget 0), so it wins EDF out of QoS order.
        root.unbound.buckets[Bucket::Bg.index()].deadline = 0;
        root.unbound.prioq.update_deadline(Bucket::Bg.index(), 0);
        root.unbound.buckets[Bucket::Fg.index()].deadline = 1_000_000;
        root.unbound.prioq.update_deadline(Bucket::Fg.index(), 1_000_000);
        root.unbound.warp_available = 0;

        let (bucket, _) = root.highest_root_bucket(100, None).unwrap();
        assert_eq!(bucket, Bucket::Bg);
        assert!(root.unbound.buckets[Bucket::Bg.index()].starvation_avoidance);
        assert_eq!(root.unbound.buckets[Bucket::Bg.index()].starvation_ts, 100);
    }

    #[test]
    fn test_prev_bucket_wins_on_earlier_deadline() {
        let mut root = ClutchRoot::new();
        insert(&mut root, 0, Bucket::Df, 40, 0);
        // The outgoing UT thread's bucket holds an earlier deadline than the
        // enqueued DF bucket.
        root.unbound.buckets[Bucket::Ut.index()].deadline = 10;
        root.unbound.buckets[Bucket::Df.index()].deadline = 100_000;
        root.unbound.prioq.update_deadline(Bucket::Df.index(), 100_000);
        root.unbound.warp_available = 0;

        let prev = PrevBucketCtx {
            bucket: Bucket::Ut,
            clutch_pri: 30,
        };
        let (bucket, chose_prev) = root.highest_root_bucket(50, Some(prev)).unwrap();
        assert_eq!(bucket, Bucket::Ut);
        assert!(chose_prev);
    }
}
