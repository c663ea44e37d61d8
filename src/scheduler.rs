//! The scheduler core: owns every arena (threads, groups, processors, the
//! clutch hierarchy, the RT queue, bound runqueues) and implements the
//! canonical entry points — setrun, select, dispatch, quantum expire, block,
//! wakeup, and the periodic tick — plus the preemption decision that ties
//! them together.
//!
//! All cross-references travel as handles (`Tid`, `GroupId`, `CpuId`)
//! indexing the arenas; nothing holds a direct reference across the
//! hierarchy.

use std::collections::HashMap;

use tracing::debug;

use crate::clutch::SchedClutch;
use crate::clutch_root::{ClutchRoot, PrevBucketCtx};
use crate::constants::{
    BASEPRI_PREEMPT, BASEPRI_RTQUEUES, NOPRI, PRI_SHIFT_NONE, RT_DEADLINE_NONE,
    RT_DEADLINE_QUANTUM_EXPIRED, SCHED_HEADQ, SCHED_PREEMPT, SCHED_TAILQ,
};
use crate::processor::{Processor, ProcessorState};
use crate::rt_queue::{RtEntry, RtQueue};
use crate::runq::StableRunq;
use crate::thread::{bucket_map, SchedMode, Thread, ThreadState};
use crate::timeshare::{age_cpu_usage, charge_cpu, compute_sched_pri};
use crate::types::{Bucket, CpuId, GroupId, Pri, Tid, TimeUs};
use crate::workload::WorkloadError;

/// A thread group: one application-like scheduling unit owning a clutch.
#[derive(Debug)]
pub struct ThreadGroup {
    pub id: GroupId,
    pub name: String,
    pub clutch: SchedClutch,
}

/// Parameters for creating a thread through the adapter surface.
#[derive(Debug, Clone)]
pub struct ThreadSpec {
    pub name: String,
    pub group: GroupId,
    pub mode: SchedMode,
    pub base_pri: Pri,
    pub rt_period: TimeUs,
    pub rt_computation: TimeUs,
    pub rt_constraint: TimeUs,
    pub bound_processor: Option<CpuId>,
}

impl ThreadSpec {
    pub fn timeshare(name: &str, group: GroupId, base_pri: Pri) -> Self {
        ThreadSpec {
            name: name.into(),
            group,
            mode: SchedMode::Timeshare,
            base_pri,
            rt_period: 0,
            rt_computation: 0,
            rt_constraint: 0,
            bound_processor: None,
        }
    }
}

fn pri_greater_tiebreak(pri_one: Pri, pri_two: Pri, one_wins_ties: bool) -> bool {
    if one_wins_ties {
        pri_one >= pri_two
    } else {
        pri_one > pri_two
    }
}

/// Core Clutch scheduler orchestrating all components.
#[derive(Debug)]
pub struct Scheduler {
    pub threads: Vec<Thread>,
    pub groups: Vec<ThreadGroup>,
    pub processors: Vec<Processor>,
    pub clutch_root: ClutchRoot,
    pub rt_runq: RtQueue,
    bound_runqs: Vec<StableRunq>,
    pub current_tick: u64,
    /// Per-CPU run-target change log with reasons.
    pub switch_log: Vec<String>,
    pending_preemption_reason: HashMap<u32, String>,
}

impl Scheduler {
    pub fn new(num_cpus: u32) -> Self {
        Scheduler {
            threads: Vec::new(),
            groups: Vec::new(),
            processors: (0..num_cpus).map(|i| Processor::new(CpuId(i))).collect(),
            clutch_root: ClutchRoot::new(),
            rt_runq: RtQueue::new(),
            bound_runqs: (0..num_cpus).map(|_| StableRunq::new()).collect(),
            current_tick: 0,
            switch_log: Vec::new(),
            pending_preemption_reason: HashMap::new(),
        }
    }

    pub fn processor_count(&self) -> u32 {
        self.processors.len() as u32
    }

    pub fn thread(&self, tid: Tid) -> &Thread {
        &self.threads[tid.0 as usize]
    }

    pub fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        &mut self.threads[tid.0 as usize]
    }

    pub fn bound_runq(&self, cpu: CpuId) -> &StableRunq {
        &self.bound_runqs[cpu.0 as usize]
    }

    // ------------------------------------------------------------------
    // Adapter surface: quiescent-window mutations.
    // ------------------------------------------------------------------

    pub fn create_thread_group(&mut self, name: &str) -> GroupId {
        let id = GroupId(self.groups.len() as u32);
        self.groups.push(ThreadGroup {
            id,
            name: name.to_string(),
            clutch: SchedClutch::new(),
        });
        id
    }

    pub fn create_thread(&mut self, spec: ThreadSpec) -> Result<Tid, WorkloadError> {
        if spec.group.0 as usize >= self.groups.len() {
            return Err(WorkloadError::InvalidValue(format!(
                "unknown thread group {:?}",
                spec.group
            )));
        }
        if spec.mode == SchedMode::Realtime {
            if spec.rt_computation == 0 || spec.rt_constraint == 0 {
                return Err(WorkloadError::InvalidValue(format!(
                    "realtime thread {:?} needs nonzero computation and constraint",
                    spec.name
                )));
            }
            if spec.rt_computation > spec.rt_constraint {
                return Err(WorkloadError::InvalidValue(format!(
                    "realtime thread {:?}: computation {} exceeds constraint {}",
                    spec.name, spec.rt_computation, spec.rt_constraint
                )));
            }
        }
        if let Some(cpu) = spec.bound_processor {
            if cpu.0 as usize >= self.processors.len() {
                return Err(WorkloadError::InvalidValue(format!(
                    "thread {:?} bound to nonexistent processor {}",
                    spec.name, cpu.0
                )));
            }
        }

        let tid = Tid(self.threads.len() as u32);
        let mut thread = Thread::new(tid, spec.group, spec.mode, spec.base_pri, spec.name);
        thread.rt_period = spec.rt_period;
        thread.rt_computation = spec.rt_computation;
        thread.rt_constraint = spec.rt_constraint;
        thread.bound_processor = spec.bound_processor;
        if thread.is_realtime() && thread.rt_computation > 0 {
            thread.quantum_remaining = thread.rt_computation;
        }
        self.threads.push(thread);
        Ok(tid)
    }

    /// Detach a thread from the scheduler. Events still naming the tid are
    /// dropped by the engine's handlers.
    pub fn terminate_thread(&mut self, tid: Tid, timestamp: TimeUs) {
        match self.thread(tid).state {
            ThreadState::Terminated => return,
            ThreadState::Runnable => {
                self.thread_remove(tid, timestamp);
                let t = self.thread(tid);
                if !t.is_realtime() && t.bound_processor.is_none() {
                    let (group, bucket) = (t.group, t.bucket);
                    self.clutch_mut(group).groups[bucket.index()].run_count_dec(timestamp);
                }
            }
            ThreadState::Running => {
                if let Some(cpu) = self.processor_of(tid) {
                    self.charge_running(tid, cpu, timestamp);
                    let t = self.thread(tid);
                    if !t.is_realtime() && t.bound_processor.is_none() {
                        let (group, bucket) = (t.group, t.bucket);
                        self.clutch_mut(group).groups[bucket.index()]
                            .run_count_dec(timestamp);
                    }
                    self.log_processor_switch(
                        timestamp,
                        cpu,
                        Some(tid),
                        None,
                        "thread terminated",
                    );
                    self.processors[cpu.0 as usize].go_idle();
                }
            }
            ThreadState::Waiting => {}
        }
        self.thread_mut(tid).state = ThreadState::Terminated;
    }

    /// Move a thread to another QoS band at a quiescent point: re-base it on
    /// the band's canonical base priority and requeue if it was enqueued.
    pub fn set_thread_urgency(&mut self, tid: Tid, band: Bucket, timestamp: TimeUs) {
        let t = self.thread(tid);
        if t.state == ThreadState::Terminated || t.is_realtime() {
            return;
        }
        let was_queued = t.state == ThreadState::Runnable;
        if was_queued {
            self.thread_remove(tid, timestamp);
        }

        let new_base = band_base_pri(band);
        let t = self.thread_mut(tid);
        t.base_pri = new_base;
        t.max_priority = new_base;
        t.bucket = bucket_map(t.mode, new_base);
        t.sched_pri = compute_sched_pri(t);
        let new_pri = t.sched_pri;

        if was_queued {
            if let Some(cpu) = self.thread(tid).bound_processor {
                self.bound_runqs[cpu.0 as usize].insert(tid, new_pri, false, timestamp);
            } else {
                self.clutch_thread_setrun(tid, timestamp, SCHED_TAILQ, false);
            }
        } else if self.thread(tid).state == ThreadState::Running {
            if let Some(cpu) = self.processor_of(tid) {
                self.processors[cpu.0 as usize].current_pri = new_pri;
            }
        }
    }

    // ------------------------------------------------------------------
    // Internal accessors.
    // ------------------------------------------------------------------

    fn clutch_mut(&mut self, group: GroupId) -> &mut SchedClutch {
        &mut self.groups[group.0 as usize].clutch
    }

    fn clutch(&self, group: GroupId) -> &SchedClutch {
        &self.groups[group.0 as usize].clutch
    }

    fn processor_of(&self, tid: Tid) -> Option<CpuId> {
        self.processors
            .iter()
            .find(|p| p.active_thread == Some(tid))
            .map(|p| p.id)
    }

    fn log_processor_switch(
        &mut self,
        timestamp: TimeUs,
        cpu: CpuId,
        old: Option<Tid>,
        new: Option<Tid>,
        reason: &str,
    ) {
        if old == new {
            return;
        }
        let old_name = old.map_or("idle", |t| self.thread(t).name.as_str());
        let new_name = new.map_or("idle", |t| self.thread(t).name.as_str());
        self.switch_log.push(format!(
            "[{timestamp:>10}us] CPU{}: {old_name} -> {new_name} | reason: {reason}",
            cpu.0
        ));
    }

    fn set_preemption_reason(&mut self, cpu: CpuId, reason: String) {
        self.pending_preemption_reason.insert(cpu.0, reason);
    }

    /// Consume the pending preemption/dispatch reason for a processor.
    pub fn consume_preemption_reason(&mut self, cpu: CpuId) -> String {
        self.pending_preemption_reason
            .remove(&cpu.0)
            .unwrap_or_else(|| "runnable thread became eligible for this processor".into())
    }

    /// Charge the running segment since `computation_epoch` to the thread,
    /// its bucket group, and the processor's busy time.
    pub fn charge_running(&mut self, tid: Tid, cpu: CpuId, timestamp: TimeUs) {
        let Some(epoch) = self.thread_mut(tid).computation_epoch.take() else {
            return;
        };
        let delta = timestamp.saturating_sub(epoch);
        let t = self.thread_mut(tid);
        t.total_cpu_us += delta;
        charge_cpu(t, delta);

        let (group, bucket, bound) = {
            let t = self.thread(tid);
            (t.group, t.bucket, t.bound_processor.is_some())
        };
        // Hard-bound threads are not clutch-eligible and must not perturb
        // bucket-group CPU accounting.
        if !bound {
            self.clutch_mut(group).groups[bucket.index()].cpu_usage_update(delta);
        }
        self.processors[cpu.0 as usize].busy_time_us += delta;
    }

    /// Age usage and refresh priority on the setrun path, mirroring the
    /// kernel's can_update_priority gate: nothing happens within one tick.
    pub fn timeshare_setrun_update(&mut self, tid: Tid) {
        let (group, bucket, stamp, bound) = {
            let t = self.thread(tid);
            (t.group, t.bucket, t.sched_stamp, t.bound_processor.is_some())
        };
        let elapsed = self.current_tick.saturating_sub(stamp);
        if elapsed == 0 {
            return;
        }

        let shift = if bound {
            PRI_SHIFT_NONE
        } else {
            self.clutch(group).groups[bucket.index()].pri_shift
        };
        let tick = self.current_tick;
        let t = self.thread_mut(tid);
        age_cpu_usage(t, elapsed);
        t.sched_stamp = tick;
        t.pri_shift = shift;
        t.sched_pri = compute_sched_pri(t);
    }

    // ------------------------------------------------------------------
    // Thread enqueue (setrun path).
    // ------------------------------------------------------------------

    /// Enqueue a thread that has become runnable. Returns a processor to
    /// signal for preemption, if any.
    pub fn thread_setrun(&mut self, tid: Tid, timestamp: TimeUs, options: u32) -> Option<CpuId> {
        let old_state = self.thread(tid).state;
        assert!(
            old_state != ThreadState::Running,
            "setrun on RUNNING thread {tid:?}"
        );
        let became_runnable =
            !matches!(old_state, ThreadState::Runnable | ThreadState::Running);
        {
            let t = self.thread_mut(tid);
            t.state = ThreadState::Runnable;
            t.last_made_runnable_time = timestamp;
        }

        if self.thread(tid).is_timeshare() {
            self.timeshare_setrun_update(tid);
        }

        if self.thread(tid).is_realtime() {
            return self.rt_thread_setrun(tid, timestamp);
        }
        if self.thread(tid).bound_processor.is_some() {
            return self.bound_thread_setrun(tid, timestamp, options);
        }
        self.clutch_thread_setrun(tid, timestamp, options, became_runnable);
        self.check_preemption(tid, timestamp, options)
    }

    fn rt_thread_setrun(&mut self, tid: Tid, timestamp: TimeUs) -> Option<CpuId> {
        let entry = {
            let t = self.thread_mut(tid);
            if t.rt_deadline == RT_DEADLINE_NONE {
                t.rt_deadline = timestamp + t.rt_constraint;
            }
            RtEntry {
                tid,
                deadline: t.rt_deadline,
                computation: t.rt_computation,
                constraint: t.rt_constraint,
            }
        };
        let pri = self.thread(tid).sched_pri;
        self.rt_runq.enqueue(pri, entry);
        debug!(
            tid = tid.0,
            deadline = entry.deadline,
            "rt enqueue"
        );

        self.check_preemption(tid, timestamp, SCHED_PREEMPT)
    }

    fn bound_thread_setrun(
        &mut self,
        tid: Tid,
        timestamp: TimeUs,
        options: u32,
    ) -> Option<CpuId> {
        let target = self.thread(tid).bound_processor.unwrap();
        let pri = self.thread(tid).sched_pri;
        // Bound runqueue follows run_queue_enqueue semantics: non-TAILQ
        // inserts mark the entry preempted (head of its level).
        let preempted = options & SCHED_TAILQ == 0;
        self.bound_runqs[target.0 as usize].insert(tid, pri, preempted, timestamp);
        debug!(tid = tid.0, cpu = target.0, "bound enqueue");
        self.check_preemption(tid, timestamp, options)
    }

    fn clutch_thread_setrun(
        &mut self,
        tid: Tid,
        timestamp: TimeUs,
        options: u32,
        became_runnable: bool,
    ) {
        let (group, bucket, sched_pri, clutchpri) = {
            let t = self.thread(tid);
            (t.group, t.bucket, t.sched_pri, t.clutchpri())
        };
        let idx = bucket.index();

        {
            let clutch = self.clutch_mut(group);
            // The run count tracks the runnable+running population, not
            // runqueue membership.
            if became_runnable {
                clutch.groups[idx].run_count_inc(timestamp);
            }
            clutch.thr_count += 1;
            clutch.groups[idx].thr_count_inc(timestamp);

            let cb = &mut clutch.buckets[idx];
            let preempted = options & SCHED_TAILQ == 0;
            cb.thread_runq.insert(tid, sched_pri, preempted, timestamp);
            cb.clutchpri_prioq.insert(tid, clutchpri);
            cb.timeshare_threads.push(tid);
        }

        if sched_pri >= BASEPRI_RTQUEUES {
            self.clutch_root.urgency += 1;
        }

        let head = options & SCHED_HEADQ != 0;
        let was_empty = self.clutch(group).buckets[idx].thr_count == 0;
        {
            let clutch = self.clutch_mut(group);
            clutch.buckets[idx].thr_count += 1;
        }
        self.clutch_root.thr_count += 1;

        if was_empty {
            self.clutch_bucket_runnable(group, bucket, timestamp, head);
        } else {
            self.clutch_bucket_update(group, bucket, timestamp, head, false);
        }

        debug!(
            tid = tid.0,
            group = group.0,
            bucket = bucket.name(),
            pri = sched_pri,
            "clutch enqueue"
        );
    }

    // ------------------------------------------------------------------
    // Thread dequeue (remove path).
    // ------------------------------------------------------------------

    /// Remove a thread from its runqueue (selected to run, blocked, or
    /// terminated).
    pub fn thread_remove(&mut self, tid: Tid, timestamp: TimeUs) {
        let (is_rt, bound, sched_pri, group, bucket) = {
            let t = self.thread(tid);
            (
                t.is_realtime(),
                t.bound_processor,
                t.sched_pri,
                t.group,
                t.bucket,
            )
        };
        if is_rt {
            self.rt_runq.remove(tid, sched_pri);
            return;
        }
        if let Some(cpu) = bound {
            self.bound_runqs[cpu.0 as usize].remove(tid);
            return;
        }

        let idx = bucket.index();
        if !self.clutch(group).buckets[idx].in_hierarchy {
            return;
        }

        if sched_pri >= BASEPRI_RTQUEUES {
            self.clutch_root.urgency = self.clutch_root.urgency.saturating_sub(1);
        }

        {
            let clutch = self.clutch_mut(group);
            let cb = &mut clutch.buckets[idx];
            cb.thread_runq.remove(tid);
            if let Some(pos) = cb.timeshare_threads.iter().position(|&t| t == tid) {
                cb.timeshare_threads.remove(pos);
            }
            cb.clutchpri_prioq.remove(tid);

            clutch.thr_count -= 1;
            clutch.groups[idx].thr_count_dec(timestamp);
            cb.thr_count -= 1;
        }
        self.clutch_root.thr_count -= 1;

        if self.clutch(group).buckets[idx].thr_count == 0 {
            self.clutch_bucket_empty(group, bucket, timestamp);
        } else {
            self.clutch_bucket_update(group, bucket, timestamp, false, true);
        }
    }

    // ------------------------------------------------------------------
    // Clutch bucket transitions in the root hierarchy.
    // ------------------------------------------------------------------

    fn clutch_bucket_runnable(
        &mut self,
        group: GroupId,
        bucket: Bucket,
        timestamp: TimeUs,
        head: bool,
    ) {
        let idx = bucket.index();
        let load = self.clutch_root.global_bucket_load[idx];
        let pri = self
            .clutch_mut(group)
            .bucket_pri_calculate(bucket, timestamp, load);
        {
            let cb = &mut self.clutch_mut(group).buckets[idx];
            cb.priority = pri;
            cb.in_hierarchy = true;
        }
        self.clutch_root
            .clutch_bucket_hierarchy_insert(group, bucket, pri, timestamp, head);
        self.root_pri_update();
    }

    /// Reposition a clutch bucket after membership or priority changed.
    /// `same_pri_rotate` applies round-robin among equal-priority groups.
    fn clutch_bucket_update(
        &mut self,
        group: GroupId,
        bucket: Bucket,
        timestamp: TimeUs,
        head: bool,
        same_pri_rotate: bool,
    ) {
        let idx = bucket.index();
        let load = self.clutch_root.global_bucket_load[idx];
        let new_pri = self
            .clutch_mut(group)
            .bucket_pri_calculate(bucket, timestamp, load);
        let old_pri = self.clutch(group).buckets[idx].priority;

        if new_pri == old_pri {
            if same_pri_rotate {
                self.clutch_root.unbound.buckets[idx]
                    .clutch_buckets
                    .rotate_at(old_pri);
            }
            return;
        }

        let rbq = &mut self.clutch_root.unbound.buckets[idx].clutch_buckets;
        rbq.dequeue(group, old_pri);
        rbq.enqueue(group, new_pri, head);
        self.clutch_mut(group).buckets[idx].priority = new_pri;
        self.root_pri_update();
    }

    fn clutch_bucket_empty(&mut self, group: GroupId, bucket: Bucket, timestamp: TimeUs) {
        let idx = bucket.index();
        let pri = self.clutch(group).buckets[idx].priority;
        self.clutch_root
            .clutch_bucket_hierarchy_remove(group, bucket, pri, timestamp);
        {
            let cb = &mut self.clutch_mut(group).buckets[idx];
            cb.priority = 0;
            cb.in_hierarchy = false;
        }
        self.root_pri_update();
    }

    /// Refresh `clutch_root.priority` to the highest runnable thread
    /// priority within the leading root bucket.
    fn root_pri_update(&mut self) {
        // Above UI comparison first: FIXPRI vs the foreground lane.
        let mut leading: Option<(usize, Pri, bool)> = None;
        let fixpri_idx = Bucket::Fixpri.index();
        if self.clutch_root.unbound.is_runnable(Bucket::Fixpri) {
            if let Some((pri, _)) = self.clutch_root.unbound.buckets[fixpri_idx]
                .clutch_buckets
                .peek_highest()
            {
                leading = Some((fixpri_idx, pri, true));
            }
        }
        if self.clutch_root.unbound.is_runnable(Bucket::Fg) {
            if let Some((pri, _)) = self.clutch_root.unbound.buckets[Bucket::Fg.index()]
                .clutch_buckets
                .peek_highest()
            {
                if leading.is_none() || pri > leading.unwrap().1 {
                    leading = Some((Bucket::Fg.index(), pri, false));
                }
            }
        }

        // If Above UI did not choose FIXPRI, take the highest runnable
        // timeshare band instead of the priority winner.
        let mut leading_idx = leading.map(|(idx, _, _)| idx);
        if let Some((_, _, is_fixpri)) = leading {
            if !is_fixpri {
                leading_idx = (Bucket::Fg.index()..crate::types::NUM_BUCKETS).find(|&i| {
                    self.clutch_root.unbound.runnable_bitmap & (1 << i) != 0
                        && !self.clutch_root.unbound.buckets[i].clutch_buckets.is_empty()
                });
            }
        }
        if leading_idx.is_none() {
            leading_idx = (0..crate::types::NUM_BUCKETS).find(|&i| {
                self.clutch_root.unbound.runnable_bitmap & (1 << i) != 0
                    && !self.clutch_root.unbound.buckets[i].clutch_buckets.is_empty()
            });
        }

        let mut pri = NOPRI;
        if let Some(idx) = leading_idx {
            if let Some((_, gid)) = self.clutch_root.unbound.buckets[idx]
                .clutch_buckets
                .peek_highest()
            {
                if let Some(p) = self.clutch(gid).buckets[idx].clutchpri_prioq.max_priority()
                {
                    pri = p;
                }
            }
        }
        self.clutch_root.priority = pri;
    }

    // ------------------------------------------------------------------
    // Hierarchy traversal (select path).
    // ------------------------------------------------------------------

    fn prev_clutch_pri(&self, tid: Tid) -> Pri {
        let t = self.thread(tid);
        let score =
            self.clutch(t.group).groups[t.bucket.index()].interactivity_score;
        t.sched_pri + score as Pri
    }

    /// Highest clutch bucket within a root bucket, with the outgoing thread
    /// competing on its interactivity-adjusted priority.
    fn root_bucket_highest_clutch_bucket(
        &self,
        bucket: Bucket,
        prev: Option<Tid>,
        first_timeslice: bool,
    ) -> Option<(GroupId, bool)> {
        let idx = bucket.index();
        let Some((pri, gid)) = self.clutch_root.unbound.buckets[idx]
            .clutch_buckets
            .peek_highest()
        else {
            // Queue is empty; the outgoing thread is the only candidate.
            return prev.map(|p| (self.thread(p).group, true));
        };

        if let Some(p) = prev {
            let pt = self.thread(p);
            if (pt.group, pt.bucket) != (gid, bucket)
                && pri_greater_tiebreak(self.prev_clutch_pri(p), pri, first_timeslice)
            {
                return Some((pt.group, true));
            }
        }
        Some((gid, false))
    }

    /// Traverse the hierarchy for the highest thread: root bucket (EDF +
    /// warp + starvation), clutch bucket (interactivity priority), thread
    /// (sched_pri). Returns `(thread, chose_prev)`.
    pub fn hierarchy_thread_highest(
        &mut self,
        timestamp: TimeUs,
        prev: Option<Tid>,
        first_timeslice: bool,
    ) -> Option<(Tid, bool)> {
        let prev = prev.filter(|&p| !self.thread(p).is_realtime());
        let prev_ctx = prev.map(|p| PrevBucketCtx {
            bucket: self.thread(p).bucket,
            clutch_pri: self.prev_clutch_pri(p),
        });

        let (root_bucket, chose_prev) =
            self.clutch_root.highest_root_bucket(timestamp, prev_ctx)?;
        if chose_prev {
            return Some((prev.unwrap(), true));
        }

        // A different root bucket won: the outgoing thread is out of the
        // running at deeper levels.
        let prev = prev.filter(|&p| self.thread(p).bucket == root_bucket);

        let (gid, cb_chose_prev) =
            self.root_bucket_highest_clutch_bucket(root_bucket, prev, first_timeslice)?;
        if cb_chose_prev {
            return Some((prev.unwrap(), true));
        }

        let thread = self.clutch(gid).buckets[root_bucket.index()]
            .thread_runq
            .peek_max();

        if let (Some(p), Some(t)) = (prev, thread) {
            let pt = self.thread(p);
            if (pt.group, pt.bucket) == (gid, root_bucket)
                && pri_greater_tiebreak(
                    pt.sched_pri,
                    self.thread(t).sched_pri,
                    first_timeslice,
                )
            {
                return Some((p, true));
            }
        }

        thread.map(|t| (t, false))
    }

    // ------------------------------------------------------------------
    // Thread selection.
    // ------------------------------------------------------------------

    /// Keep-running check for a running RT thread: allowed on its first
    /// timeslice unless a queued RT thread beats it on priority (and the
    /// constraint-safety inequality fails) or on deadline.
    fn rt_prev_can_continue(&self, cpu: CpuId, prev: Tid) -> bool {
        if self.rt_runq.is_empty() {
            return true;
        }
        if !self.processors[cpu.0 as usize].first_timeslice {
            return false;
        }

        let prev_t = self.thread(prev);
        let rt_highest_pri = self.rt_runq.highest_priority();
        if rt_highest_pri < BASEPRI_RTQUEUES {
            return true;
        }

        if rt_highest_pri > prev_t.sched_pri {
            if self.rt_runq.strict_priority() {
                return false;
            }
            let Some(hi) = self.rt_runq.peek_highest_priority() else {
                return true;
            };
            // Constraint-safety: can both computations still fit?
            return prev_t.rt_computation + hi.computation + self.rt_runq.deadline_epsilon()
                < hi.constraint;
        }

        self.rt_runq
            .peek_deadline()
            .saturating_add(self.rt_runq.deadline_epsilon())
            >= prev_t.rt_deadline
    }

    /// Select the highest-priority thread for this processor. The outgoing
    /// thread (when supplied) participates without being re-enqueued;
    /// `chose_prev` tells the caller to keep running it.
    pub fn thread_select(
        &mut self,
        cpu: CpuId,
        timestamp: TimeUs,
        prev: Option<Tid>,
    ) -> (Option<Tid>, bool) {
        // A running RT thread may keep the processor on its first timeslice.
        if let Some(p) = prev {
            if self.thread(p).is_realtime() {
                if self.rt_prev_can_continue(cpu, p) {
                    debug!(tid = p.0, "select prev rt");
                    return (Some(p), true);
                }
                if !self.rt_runq.is_empty() {
                    let entry = self.rt_runq.dequeue().unwrap();
                    debug!(tid = entry.tid.0, deadline = entry.deadline, "select rt");
                    return (Some(entry.tid), false);
                }
                return (Some(p), true);
            }
        }

        // Any enqueued RT thread beats non-RT candidates.
        if !self.rt_runq.is_empty() {
            let entry = self.rt_runq.dequeue().unwrap();
            debug!(tid = entry.tid.0, deadline = entry.deadline, "select rt");
            return (Some(entry.tid), false);
        }

        let bound_runq = &self.bound_runqs[cpu.0 as usize];
        let bound_head = bound_runq.peek_max();
        let mut bound_pri = bound_runq.max_priority(NOPRI);
        let mut clutch_pri = self.clutch_root.priority;

        let prev_is_bound = prev
            .is_some_and(|p| self.thread(p).bound_processor == Some(cpu));
        if let Some(p) = prev {
            if prev_is_bound {
                bound_pri = bound_pri.max(self.thread(p).sched_pri);
            } else {
                clutch_pri = clutch_pri.max(self.thread(p).sched_pri);
            }
        }

        // Non-RT sources: Clutch hierarchy vs the processor-bound queue;
        // ties prefer the bound side.
        if clutch_pri > bound_pri {
            if self.clutch_root.thr_count == 0 {
                if let Some(p) = prev {
                    debug!(tid = p.0, "select prev (hierarchy empty)");
                    return (Some(p), true);
                }
                return (None, false);
            }

            // Bound threads do not participate in the hierarchy lookup.
            let prev_for_clutch =
                prev.filter(|&p| self.thread(p).bound_processor.is_none());
            let first_timeslice = self.processors[cpu.0 as usize].first_timeslice;
            if let Some((tid, chose_prev)) =
                self.hierarchy_thread_highest(timestamp, prev_for_clutch, first_timeslice)
            {
                if chose_prev {
                    debug!(tid = tid.0, "select prev");
                    return (Some(tid), true);
                }
                debug!(tid = tid.0, pri = self.thread(tid).sched_pri, "select clutch");
                self.thread_remove(tid, timestamp);
                return (Some(tid), false);
            }
        } else {
            let first_timeslice = self.processors[cpu.0 as usize].first_timeslice;
            let bound_empty = self.bound_runqs[cpu.0 as usize].is_empty();
            if bound_empty
                || (prev_is_bound
                    && pri_greater_tiebreak(
                        self.thread(prev.unwrap()).sched_pri,
                        bound_pri,
                        first_timeslice,
                    ))
            {
                if let Some(p) = prev {
                    debug!(tid = p.0, "select prev bound");
                    return (Some(p), true);
                }
                return (None, false);
            }
            if bound_head.is_some() {
                let tid = self.bound_runqs[cpu.0 as usize].pop_max().unwrap();
                debug!(tid = tid.0, pri = self.thread(tid).sched_pri, "select bound");
                return (Some(tid), false);
            }
        }

        // Runqueues came up empty: the outgoing thread keeps running.
        if let Some(p) = prev {
            debug!(tid = p.0, "select prev (fallback)");
            return (Some(p), true);
        }
        (None, false)
    }

    // ------------------------------------------------------------------
    // Dispatch.
    // ------------------------------------------------------------------

    /// Install a thread on a processor, accounting the outgoing thread.
    pub fn thread_dispatch(
        &mut self,
        cpu: CpuId,
        old: Option<Tid>,
        new: Tid,
        timestamp: TimeUs,
        reason: &str,
    ) {
        if let Some(o) = old {
            if o != new {
                self.charge_running(o, cpu, timestamp);
                let t = self.thread_mut(o);
                match t.state {
                    ThreadState::Waiting => t.last_run_time = timestamp,
                    ThreadState::Runnable => t.preemption_count += 1,
                    _ => {}
                }
                t.context_switches += 1;
                self.processors[cpu.0 as usize].context_switches += 1;
            }
        }

        {
            let t = self.thread_mut(new);
            t.state = ThreadState::Running;
            t.computation_epoch = Some(timestamp);
            t.last_run_time = timestamp;
            if t.last_made_runnable_time > 0 {
                t.total_wait_us += timestamp - t.last_made_runnable_time;
            }
            if t.quantum_remaining == 0 {
                t.reset_quantum();
            }
            t.context_switches += 1;
        }

        let (sched_pri, first_timeslice, quantum) = {
            let t = self.thread(new);
            (t.sched_pri, t.first_timeslice, t.quantum_remaining)
        };
        let proc = &mut self.processors[cpu.0 as usize];
        proc.active_thread = Some(new);
        proc.current_pri = sched_pri;
        proc.state = ProcessorState::Running;
        proc.first_timeslice = first_timeslice;
        proc.starting_pri = sched_pri;
        proc.last_dispatch_time = timestamp;

        self.log_processor_switch(timestamp, cpu, old, Some(new), reason);
        debug!(
            cpu = cpu.0,
            tid = new.0,
            pri = sched_pri,
            quantum,
            "dispatch"
        );
    }

    // ------------------------------------------------------------------
    // Quantum expiry.
    // ------------------------------------------------------------------

    /// Handle quantum expiry on a processor. The old thread is not
    /// re-enqueued before selection; it competes as the previous thread and
    /// is only re-enqueued (at tail, for fairness) when it loses.
    pub fn thread_quantum_expire(&mut self, cpu: CpuId, timestamp: TimeUs) -> Option<Tid> {
        let old = self.processors[cpu.0 as usize].active_thread?;
        self.charge_running(old, cpu, timestamp);

        if self.thread(old).is_timeshare() {
            self.timeshare_setrun_update(old);
        }

        {
            let t = self.thread_mut(old);
            t.first_timeslice = false;
            t.quantum_remaining = 0;
            if t.mode == SchedMode::Realtime {
                // A consumed RT quantum retires the deadline for this period.
                t.rt_deadline = RT_DEADLINE_QUANTUM_EXPIRED;
            }
            t.state = ThreadState::Runnable;
        }
        debug!(tid = old.0, cpu = cpu.0, "quantum expire");

        let (new, chose_prev) = self.thread_select(cpu, timestamp, Some(old));

        if chose_prev && new == Some(old) {
            self.thread_dispatch(cpu, Some(old), old, timestamp, "quantum expired; thread remained best eligible");
            return Some(old);
        }

        if let Some(new) = new {
            self.thread_setrun(old, timestamp, SCHED_TAILQ);
            self.thread_dispatch(cpu, Some(old), new, timestamp, "quantum expired; switched to higher-ranked runnable thread");
            return Some(new);
        }

        self.thread_dispatch(cpu, Some(old), old, timestamp, "quantum expired; no better runnable thread");
        Some(old)
    }

    // ------------------------------------------------------------------
    // Blocking and wakeup.
    // ------------------------------------------------------------------

    /// A thread voluntarily blocks. Returns the replacement thread, or None
    /// when the processor idles.
    pub fn thread_block(
        &mut self,
        tid: Tid,
        cpu: CpuId,
        timestamp: TimeUs,
    ) -> Option<Tid> {
        self.charge_running(tid, cpu, timestamp);

        {
            let t = self.thread_mut(tid);
            // Unblock clears stale quantum state; drop the remainder here.
            t.quantum_remaining = 0;
            t.state = ThreadState::Waiting;
            t.last_run_time = timestamp;
        }

        let (is_rt, bound, group, bucket) = {
            let t = self.thread(tid);
            (t.is_realtime(), t.bound_processor.is_some(), t.group, t.bucket)
        };
        if !is_rt && !bound {
            self.clutch_mut(group).groups[bucket.index()].run_count_dec(timestamp);
        }
        debug!(tid = tid.0, cpu = cpu.0, "block");

        let (new, _) = self.thread_select(cpu, timestamp, None);
        if let Some(new) = new {
            self.thread_dispatch(cpu, Some(tid), new, timestamp, "blocked thread replaced by next runnable");
            return Some(new);
        }

        self.log_processor_switch(
            timestamp,
            cpu,
            Some(tid),
            None,
            "blocked with no runnable replacement",
        );
        self.processors[cpu.0 as usize].go_idle();
        None
    }

    /// Wake a blocked thread. Idempotent: a non-WAITING thread is left
    /// untouched. Returns a processor to signal for preemption.
    pub fn thread_wakeup(&mut self, tid: Tid, timestamp: TimeUs) -> Option<CpuId> {
        if self.thread(tid).state != ThreadState::Waiting {
            return None;
        }

        if self.thread(tid).is_realtime() {
            let t = self.thread_mut(tid);
            t.rt_deadline = timestamp + t.rt_constraint;
        }
        debug!(tid = tid.0, "wakeup");
        self.thread_setrun(tid, timestamp, SCHED_PREEMPT | SCHED_TAILQ)
    }

    // ------------------------------------------------------------------
    // Periodic maintenance.
    // ------------------------------------------------------------------

    /// Scheduler tick: refresh per-group decay shifts from load, age every
    /// timeshare thread's usage, and reposition clutch buckets whose
    /// priorities moved. Iteration order is deterministic (insertion order
    /// of clutch buckets, tid order within each).
    pub fn sched_tick(&mut self, timestamp: TimeUs) {
        self.current_tick += 1;
        let tick = self.current_tick;
        let ncpus = self.processor_count();

        let runnable_buckets = self.clutch_root.clutch_buckets_list.clone();

        for &(gid, bucket) in &runnable_buckets {
            self.clutch_mut(gid).groups[bucket.index()].pri_shift_update(tick, ncpus);
        }

        for &(gid, bucket) in &runnable_buckets {
            let idx = bucket.index();
            let shift = self.clutch(gid).groups[idx].pri_shift;

            let mut tids = self.clutch(gid).buckets[idx].timeshare_threads.clone();
            tids.sort_unstable();

            let mut reprioritized = false;
            for tid in tids {
                if !self.thread(tid).is_timeshare() {
                    continue;
                }
                let t = self.thread_mut(tid);
                age_cpu_usage(t, 1);
                t.sched_stamp = tick;
                t.pri_shift = shift;
                let new_pri = compute_sched_pri(t);
                if new_pri != t.sched_pri {
                    t.sched_pri = new_pri;
                    reprioritized = true;
                }
            }

            if reprioritized {
                // Re-key the bucket runqueue to the updated priorities.
                let prios: HashMap<Tid, Pri> = self.clutch(gid).buckets[idx]
                    .thread_runq
                    .iter()
                    .map(|t| (t, self.threads[t.0 as usize].sched_pri))
                    .collect();
                self.clutch_mut(gid).buckets[idx]
                    .thread_runq
                    .refresh(|t| prios[&t]);
            }

            if self.clutch(gid).buckets[idx].in_hierarchy {
                self.clutch_bucket_update(gid, bucket, timestamp, false, false);
            }
        }

        debug!(
            tick,
            runnable = self.clutch_root.thr_count,
            "sched tick"
        );
    }

    // ------------------------------------------------------------------
    // Preemption check.
    // ------------------------------------------------------------------

    /// Decide whether a newly enqueued thread should preempt, and which
    /// processor to signal.
    pub fn check_preemption(
        &mut self,
        tid: Tid,
        _timestamp: TimeUs,
        options: u32,
    ) -> Option<CpuId> {
        let explicit_preempt = options & SCHED_PREEMPT != 0;
        let (new_pri, new_is_rt, new_deadline, bound) = {
            let t = self.thread(tid);
            (t.sched_pri, t.is_realtime(), t.rt_deadline, t.bound_processor)
        };
        let preempt_allowed = explicit_preempt || new_pri >= BASEPRI_PREEMPT;
        let name = self.thread(tid).name.clone();
        let eps = self.rt_runq.deadline_epsilon();

        // Bound threads only ever target their own processor.
        if let Some(target) = bound {
            let active = self.processors[target.0 as usize].active_thread;
            let Some(active) = active else {
                self.set_preemption_reason(
                    target,
                    format!("{name} became runnable and CPU{} was idle", target.0),
                );
                return Some(target);
            };
            let (act_pri, act_is_rt, act_deadline, act_name) = {
                let a = self.thread(active);
                (a.sched_pri, a.is_realtime(), a.rt_deadline, a.name.clone())
            };
            if new_is_rt {
                if !act_is_rt {
                    self.set_preemption_reason(
                        target,
                        format!("RT thread {name} preempted non-RT {act_name}"),
                    );
                    return Some(target);
                }
                if new_pri > act_pri {
                    self.set_preemption_reason(
                        target,
                        format!("RT thread {name} has higher RT priority than {act_name}"),
                    );
                    return Some(target);
                }
                if new_pri == act_pri && new_deadline.saturating_add(eps) < act_deadline {
                    self.set_preemption_reason(
                        target,
                        format!("RT thread {name} has earlier deadline than {act_name}"),
                    );
                    return Some(target);
                }
                return None;
            }
            if preempt_allowed {
                if new_pri > act_pri {
                    self.set_preemption_reason(
                        target,
                        format!("{name} has higher priority than running {act_name}"),
                    );
                    return Some(target);
                }
                if new_pri == act_pri && explicit_preempt {
                    self.set_preemption_reason(
                        target,
                        format!(
                            "{name} requested explicit preemption against equal-priority {act_name}"
                        ),
                    );
                    return Some(target);
                }
            }
            return None;
        }

        // Dispatch-to-idle wins over any preemption.
        if let Some(idle) = self.find_idle_processor() {
            self.set_preemption_reason(
                idle,
                format!("{name} became runnable and was placed on an idle processor"),
            );
            return Some(idle);
        }

        // RT preempts non-RT unconditionally; RT-vs-RT goes by priority,
        // then deadline.
        if new_is_rt {
            for i in 0..self.processors.len() {
                let cpu = CpuId(i as u32);
                let Some(active) = self.processors[i].active_thread else {
                    self.set_preemption_reason(
                        cpu,
                        format!("RT thread {name} found an idle processor"),
                    );
                    return Some(cpu);
                };
                let (act_pri, act_is_rt, act_deadline, act_name) = {
                    let a = self.thread(active);
                    (a.sched_pri, a.is_realtime(), a.rt_deadline, a.name.clone())
                };
                if !act_is_rt {
                    self.set_preemption_reason(
                        cpu,
                        format!("RT thread {name} preempted non-RT {act_name}"),
                    );
                    return Some(cpu);
                }
                if new_pri > act_pri {
                    self.set_preemption_reason(
                        cpu,
                        format!("RT thread {name} has higher RT priority than {act_name}"),
                    );
                    return Some(cpu);
                }
                if new_pri == act_pri && new_deadline.saturating_add(eps) < act_deadline {
                    self.set_preemption_reason(
                        cpu,
                        format!("RT thread {name} has earlier deadline than {act_name}"),
                    );
                    return Some(cpu);
                }
            }
            return None;
        }

        // Non-RT: target the lowest-priority running thread.
        if preempt_allowed {
            if let Some(lowest) = self.find_lowest_priority_processor() {
                if new_pri > self.processors[lowest.0 as usize].current_pri {
                    let target_name = self.processors[lowest.0 as usize]
                        .active_thread
                        .map_or("idle".to_string(), |t| self.thread(t).name.clone());
                    self.set_preemption_reason(
                        lowest,
                        format!("{name} outranked lowest-priority running thread {target_name}"),
                    );
                    return Some(lowest);
                }
            }

            // Equal priority preempts only on explicit request.
            if explicit_preempt {
                for i in 0..self.processors.len() {
                    let cpu = CpuId(i as u32);
                    if let Some(active) = self.processors[i].active_thread {
                        if !self.thread(active).is_realtime()
                            && self.processors[i].current_pri == new_pri
                        {
                            let act_name = self.thread(active).name.clone();
                            self.set_preemption_reason(
                                cpu,
                                format!(
                                    "{name} requested explicit preemption against equal-priority {act_name}"
                                ),
                            );
                            return Some(cpu);
                        }
                    }
                }
            }
        }

        None
    }

    pub fn find_idle_processor(&self) -> Option<CpuId> {
        self.processors.iter().find(|p| p.is_idle()).map(|p| p.id)
    }

    pub fn find_lowest_priority_processor(&self) -> Option<CpuId> {
        self.processors
            .iter()
            .filter(|p| p.active_thread.is_some())
            .min_by_key(|p| (p.current_pri, p.id))
            .map(|p| p.id)
    }

    // ------------------------------------------------------------------
    // Invariant checks (for tests).
    // ------------------------------------------------------------------

    /// Assert structural invariants over the current state: one running
    /// thread per processor with matching priority, runnable threads in
    /// exactly one runqueue, non-runnable threads in none, and timeshare
    /// priorities clamped by base priority.
    pub fn verify_invariants(&self) {
        let mut running_on: HashMap<Tid, u32> = HashMap::new();
        for p in &self.processors {
            if let Some(tid) = p.active_thread {
                let t = self.thread(tid);
                assert_eq!(
                    t.state,
                    ThreadState::Running,
                    "active thread {tid:?} on CPU{} is {}",
                    p.id.0,
                    t.state.name()
                );
                assert_eq!(
                    p.current_pri, t.sched_pri,
                    "CPU{} current_pri diverged from {tid:?}",
                    p.id.0
                );
                let count = running_on.entry(tid).or_insert(0);
                *count += 1;
                assert_eq!(*count, 1, "thread {tid:?} active on multiple processors");
            }
        }

        for t in &self.threads {
            let mut memberships = 0;
            if self.rt_runq.rank_of(t.tid).is_some() {
                memberships += 1;
            }
            for rq in &self.bound_runqs {
                if rq.contains(t.tid) {
                    memberships += 1;
                }
            }
            let cb = &self.clutch(t.group).buckets[t.bucket.index()];
            if cb.thread_runq.contains(t.tid) {
                memberships += 1;
            }

            match t.state {
                ThreadState::Runnable => assert_eq!(
                    memberships, 1,
                    "runnable thread {:?} in {memberships} runqueues",
                    t.tid
                ),
                _ => assert_eq!(
                    memberships, 0,
                    "{} thread {:?} in {memberships} runqueues",
                    t.state.name(),
                    t.tid
                ),
            }

            if t.state == ThreadState::Running {
                assert!(
                    running_on.contains_key(&t.tid),
                    "RUNNING thread {:?} not on any processor",
                    t.tid
                );
            }

            if t.is_timeshare() {
                assert!(
                    t.sched_pri <= t.base_pri,
                    "timeshare thread {:?} sched_pri {} above base {}",
                    t.tid,
                    t.sched_pri,
                    t.base_pri
                );
            }
        }
    }
}

/// Canonical base priority for a QoS band (urgency changes re-base here).
pub fn band_base_pri(band: Bucket) -> Pri {
    use crate::constants::{
        BASEPRI_DEFAULT, BASEPRI_FOREGROUND, BASEPRI_USER_INITIATED, BASEPRI_UTILITY,
        MAXPRI_THROTTLE,
    };
    match band {
        Bucket::Fixpri => BASEPRI_FOREGROUND + 1,
        Bucket::Fg => BASEPRI_FOREGROUND,
        Bucket::In => BASEPRI_USER_INITIATED,
        Bucket::Df => BASEPRI_DEFAULT,
        Bucket::Ut => BASEPRI_UTILITY,
        Bucket::Bg => MAXPRI_THROTTLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched_with_group(cpus: u32) -> (Scheduler, GroupId) {
        let mut s = Scheduler::new(cpus);
        let g = s.create_thread_group("app");
        (s, g)
    }

    #[test]
    fn test_setrun_select_dispatch_roundtrip() {
        let (mut s, g) = sched_with_group(1);
        let t = s
            .create_thread(ThreadSpec::timeshare("w", g, 31))
            .unwrap();
        let target = s.thread_setrun(t, 0, SCHED_PREEMPT | SCHED_TAILQ);
        assert_eq!(target, Some(CpuId(0)));

        let (sel, chose_prev) = s.thread_select(CpuId(0), 0, None);
        assert_eq!(sel, Some(t));
        assert!(!chose_prev);
        s.thread_dispatch(CpuId(0), None, t, 0, "test");
        assert_eq!(s.thread(t).state, ThreadState::Running);
        s.verify_invariants();
    }

    #[test]
    fn test_higher_pri_thread_selected_first() {
        let (mut s, g) = sched_with_group(1);
        let lo = s.create_thread(ThreadSpec::timeshare("lo", g, 20)).unwrap();
        let hi = s.create_thread(ThreadSpec::timeshare("hi", g, 47)).unwrap();
        s.thread_setrun(lo, 0, SCHED_TAILQ);
        s.thread_setrun(hi, 0, SCHED_TAILQ);

        let (sel, _) = s.thread_select(CpuId(0), 0, None);
        assert_eq!(sel, Some(hi));
        s.thread_dispatch(CpuId(0), None, hi, 0, "test");
        s.verify_invariants();
    }

    #[test]
    fn test_rt_beats_timeshare() {
        let (mut s, g) = sched_with_group(1);
        let ts = s.create_thread(ThreadSpec::timeshare("ts", g, 47)).unwrap();
        let mut rt_spec = ThreadSpec::timeshare("rt", g, 97);
        rt_spec.mode = SchedMode::Realtime;
        rt_spec.rt_computation = 3_000;
        rt_spec.rt_constraint = 5_000;
        rt_spec.rt_period = 10_000;
        let rt = s.create_thread(rt_spec).unwrap();

        s.thread_setrun(ts, 0, SCHED_TAILQ);
        s.thread_setrun(rt, 0, SCHED_TAILQ);
        let (sel, _) = s.thread_select(CpuId(0), 0, None);
        assert_eq!(sel, Some(rt));
    }

    #[test]
    fn test_bound_thread_stays_on_its_processor() {
        let (mut s, g) = sched_with_group(2);
        let mut spec = ThreadSpec::timeshare("bound", g, 40);
        spec.bound_processor = Some(CpuId(0));
        let b = s.create_thread(spec).unwrap();
        s.thread_setrun(b, 0, SCHED_TAILQ);

        // CPU1 sees nothing to run.
        let (sel, _) = s.thread_select(CpuId(1), 0, None);
        assert_eq!(sel, None);
        let (sel, _) = s.thread_select(CpuId(0), 0, None);
        assert_eq!(sel, Some(b));
    }

    #[test]
    fn test_wakeup_idempotent() {
        let (mut s, g) = sched_with_group(1);
        let t = s.create_thread(ThreadSpec::timeshare("w", g, 31)).unwrap();
        assert!(s.thread_wakeup(t, 0).is_some());
        // Second wakeup is a no-op.
        assert!(s.thread_wakeup(t, 0).is_none());
        assert_eq!(s.thread(t).state, ThreadState::Runnable);
        s.verify_invariants();
    }

    #[test]
    fn test_invalid_rt_params_rejected() {
        let (mut s, g) = sched_with_group(1);
        let mut spec = ThreadSpec::timeshare("rt", g, 97);
        spec.mode = SchedMode::Realtime;
        assert!(s.create_thread(spec.clone()).is_err());
        spec.rt_computation = 10_000;
        spec.rt_constraint = 5_000;
        assert!(s.create_thread(spec).is_err());
    }

    #[test]
    fn test_terminate_runnable_thread_detaches() {
        let (mut s, g) = sched_with_group(1);
        let t = s.create_thread(ThreadSpec::timeshare("w", g, 31)).unwrap();
        s.thread_setrun(t, 0, SCHED_TAILQ);
        s.terminate_thread(t, 10);
        assert_eq!(s.thread(t).state, ThreadState::Terminated);
        s.verify_invariants();
        let (sel, _) = s.thread_select(CpuId(0), 10, None);
        assert_eq!(sel, None);
    }

    #[test]
    fn test_urgency_change_moves_bucket() {
        let (mut s, g) = sched_with_group(1);
        let t = s.create_thread(ThreadSpec::timeshare("w", g, 47)).unwrap();
        s.thread_setrun(t, 0, SCHED_TAILQ);
        assert_eq!(s.thread(t).bucket, Bucket::Fg);
        s.set_thread_urgency(t, Bucket::Bg, 10);
        assert_eq!(s.thread(t).bucket, Bucket::Bg);
        assert_eq!(s.thread(t).base_pri, 4);
        s.verify_invariants();
        let (sel, _) = s.thread_select(CpuId(0), 10, None);
        assert_eq!(sel, Some(t));
    }

    #[test]
    fn test_quantum_expire_keeps_first_timeslice_thread() {
        let (mut s, g) = sched_with_group(1);
        let a = s.create_thread(ThreadSpec::timeshare("a", g, 31)).unwrap();
        let b = s.create_thread(ThreadSpec::timeshare("b", g, 31)).unwrap();
        s.thread_setrun(a, 0, SCHED_TAILQ);
        s.thread_setrun(b, 0, SCHED_TAILQ);

        let (first, _) = s.thread_select(CpuId(0), 0, None);
        let first = first.unwrap();
        assert_eq!(first, a, "tail-queued equals dequeue FIFO");
        s.thread_dispatch(CpuId(0), None, first, 0, "test");

        // On its first timeslice the expiring thread wins the equal-priority
        // tie and continues without a switch.
        let kept = s.thread_quantum_expire(CpuId(0), 6_000).unwrap();
        assert_eq!(kept, a);
        s.verify_invariants();

        // Once it blocks, the waiting peer takes the processor.
        let next = s.thread_block(a, CpuId(0), 8_000);
        assert_eq!(next, Some(b));
        s.verify_invariants();
    }
}
