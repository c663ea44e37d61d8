//! Realtime runqueue with per-band deadline ordering.
//!
//! Ordering contract: primary key is RT priority (higher band first),
//! deadline ascending within a band, insertion order among equal deadlines.
//! In non-strict mode the dequeue policy may pick a lower-band thread with
//! an earlier deadline when the constraint-safety check shows the higher
//! band can still make its own deadline afterwards.

use crate::constants::{BASEPRI_RTQUEUES, MAXPRI, NOPRI, NRTQS};
use crate::types::{Pri, Tid, TimeUs};

/// Snapshot of the RT parameters a queued thread was enqueued with.
/// Deadlines are fixed for the lifetime of a queue entry.
#[derive(Debug, Clone, Copy)]
pub struct RtEntry {
    pub tid: Tid,
    pub deadline: TimeUs,
    pub computation: TimeUs,
    pub constraint: TimeUs,
}

/// Realtime runqueue covering priorities [BASEPRI_RTQUEUES, MAXPRI].
#[derive(Debug)]
pub struct RtQueue {
    queues: Vec<Vec<RtEntry>>,
    count: usize,
    earliest_deadline: TimeUs,
    ed_index: Option<usize>,
    strict_priority: bool,
    deadline_epsilon: TimeUs,
}

impl Default for RtQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RtQueue {
    pub fn new() -> Self {
        RtQueue {
            queues: (0..NRTQS).map(|_| Vec::new()).collect(),
            count: 0,
            earliest_deadline: TimeUs::MAX,
            ed_index: None,
            strict_priority: false,
            deadline_epsilon: 100,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn strict_priority(&self) -> bool {
        self.strict_priority
    }

    pub fn set_strict_priority(&mut self, strict: bool) {
        self.strict_priority = strict;
    }

    pub fn deadline_epsilon(&self) -> TimeUs {
        self.deadline_epsilon
    }

    fn to_index(pri: Pri) -> usize {
        (pri - BASEPRI_RTQUEUES) as usize
    }

    fn refresh_global_ed(&mut self) {
        let mut earliest = TimeUs::MAX;
        let mut ed_index = None;
        // Walk bands highest-first so equal deadlines keep the higher band.
        for i in (0..NRTQS).rev() {
            if let Some(head) = self.queues[i].first() {
                if head.deadline < earliest {
                    earliest = head.deadline;
                    ed_index = Some(i);
                }
            }
        }
        self.earliest_deadline = earliest;
        self.ed_index = ed_index;
    }

    fn highest_pri_index(&self) -> Option<usize> {
        (0..NRTQS).rev().find(|&i| !self.queues[i].is_empty())
    }

    /// Highest RT priority currently enqueued, or NOPRI when empty.
    pub fn highest_priority(&self) -> Pri {
        self.highest_pri_index()
            .map_or(NOPRI, |i| BASEPRI_RTQUEUES + i as Pri)
    }

    /// First entry at the highest enqueued RT priority.
    pub fn peek_highest_priority(&self) -> Option<&RtEntry> {
        self.queues[self.highest_pri_index()?].first()
    }

    /// Pick the band to dequeue from: highest priority, unless EDF override
    /// applies and the lower band can run without breaking the higher band's
    /// constraint.
    fn choose_index_for_dequeue(&self) -> Option<usize> {
        let hi_index = self.highest_pri_index()?;
        let mut chosen = hi_index;
        if !self.strict_priority {
            if let Some(ed_index) = self.ed_index {
                if ed_index != hi_index {
                    let ed = &self.queues[ed_index][0];
                    let hi = &self.queues[hi_index][0];
                    if ed.computation + hi.computation + self.deadline_epsilon < hi.constraint {
                        chosen = ed_index;
                    }
                }
            }
        }
        Some(chosen)
    }

    /// Insert an RT thread, deadline-ordered within its priority band.
    /// Returns true when the entry became the head of its band (an immediate
    /// preemption opportunity).
    pub fn enqueue(&mut self, pri: Pri, entry: RtEntry) -> bool {
        assert!(
            (BASEPRI_RTQUEUES..=MAXPRI).contains(&pri),
            "RT priority {pri} out of band for {:?}",
            entry.tid
        );
        let q = &mut self.queues[Self::to_index(pri)];
        let pos = q
            .iter()
            .position(|e| entry.deadline < e.deadline)
            .unwrap_or(q.len());
        q.insert(pos, entry);
        self.count += 1;
        self.refresh_global_ed();
        pos == 0
    }

    /// Remove and return the next RT thread per the dequeue policy.
    pub fn dequeue(&mut self) -> Option<RtEntry> {
        let idx = self.choose_index_for_dequeue()?;
        let entry = self.queues[idx].remove(0);
        self.count -= 1;
        self.refresh_global_ed();
        Some(entry)
    }

    /// Next RT thread per the dequeue policy, without removing it.
    pub fn peek(&self) -> Option<&RtEntry> {
        let idx = self.choose_index_for_dequeue()?;
        self.queues[idx].first()
    }

    /// Earliest deadline across all bands (MAX when empty).
    pub fn peek_deadline(&self) -> TimeUs {
        self.earliest_deadline
    }

    /// Remove a specific thread enqueued at `pri`.
    pub fn remove(&mut self, tid: Tid, pri: Pri) -> bool {
        if !(BASEPRI_RTQUEUES..=MAXPRI).contains(&pri) {
            return false;
        }
        let q = &mut self.queues[Self::to_index(pri)];
        if let Some(pos) = q.iter().position(|e| e.tid == tid) {
            q.remove(pos);
            self.count -= 1;
            self.refresh_global_ed();
            true
        } else {
            false
        }
    }

    /// Queue position of a thread in overall dequeue order (band-major).
    pub fn rank_of(&self, tid: Tid) -> Option<usize> {
        let mut rank = 0;
        for i in (0..NRTQS).rev() {
            for e in &self.queues[i] {
                if e.tid == tid {
                    return Some(rank);
                }
                rank += 1;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tid: u32, deadline: TimeUs, computation: TimeUs, constraint: TimeUs) -> RtEntry {
        RtEntry {
            tid: Tid(tid),
            deadline,
            computation,
            constraint,
        }
    }

    #[test]
    fn test_deadline_order_within_band() {
        let mut rq = RtQueue::new();
        rq.enqueue(97, entry(1, 5_000, 1_000, 10_000));
        rq.enqueue(97, entry(2, 3_000, 1_000, 10_000));
        rq.enqueue(97, entry(3, 4_000, 1_000, 10_000));
        assert_eq!(rq.dequeue().unwrap().tid, Tid(2));
        assert_eq!(rq.dequeue().unwrap().tid, Tid(3));
        assert_eq!(rq.dequeue().unwrap().tid, Tid(1));
    }

    #[test]
    fn test_higher_band_wins_in_strict_mode() {
        let mut rq = RtQueue::new();
        rq.set_strict_priority(true);
        rq.enqueue(97, entry(1, 1_000, 100, 50_000));
        rq.enqueue(110, entry(2, 90_000, 100, 50_000));
        assert_eq!(rq.dequeue().unwrap().tid, Tid(2));
    }

    #[test]
    fn test_edf_override_when_constraint_safe() {
        let mut rq = RtQueue::new();
        // Lower band has a much earlier deadline; both computations plus the
        // epsilon fit well inside the higher thread's constraint.
        rq.enqueue(97, entry(1, 1_000, 100, 50_000));
        rq.enqueue(110, entry(2, 90_000, 100, 50_000));
        assert_eq!(rq.dequeue().unwrap().tid, Tid(1));
        assert_eq!(rq.dequeue().unwrap().tid, Tid(2));
    }

    #[test]
    fn test_no_edf_override_when_unsafe() {
        let mut rq = RtQueue::new();
        // Running the earlier-deadline thread would blow the higher band's
        // constraint, so strict priority order holds.
        rq.enqueue(97, entry(1, 1_000, 30_000, 50_000));
        rq.enqueue(110, entry(2, 90_000, 25_000, 50_000));
        assert_eq!(rq.dequeue().unwrap().tid, Tid(2));
    }

    #[test]
    fn test_targeted_removal() {
        let mut rq = RtQueue::new();
        rq.enqueue(97, entry(1, 5_000, 1_000, 10_000));
        rq.enqueue(99, entry(2, 7_000, 1_000, 10_000));
        assert!(rq.remove(Tid(2), 99));
        assert!(!rq.remove(Tid(2), 99));
        assert_eq!(rq.len(), 1);
        assert_eq!(rq.peek_deadline(), 5_000);
    }
}
