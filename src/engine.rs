//! Event-driven simulation engine.
//!
//! Maintains the event heap and simulated clock, and drives the scheduler
//! through its entry points. Handlers never call each other directly; they
//! communicate by scheduling future events. With a fixed seed the event
//! order, and therefore the trace, is byte-for-byte reproducible.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tracing::{debug, info};

use crate::constants::{
    RT_DEADLINE_QUANTUM_EXPIRED, SCHED_HEADQ, SCHED_PREEMPT, SCHED_TAILQ,
    SCHED_TICK_INTERVAL_US,
};
use crate::fmt::set_sim_clock;
use crate::scheduler::Scheduler;
use crate::snapshot::Snapshot;
use crate::stats::StatsCollector;
use crate::thread::ThreadState;
use crate::trace::{Trace, TraceKind};
use crate::types::{CpuId, Tid, TimeUs};
use crate::workload::BehaviorProfile;

/// Deterministic xorshift32 PRNG for workload sampling.
#[derive(Debug, Clone)]
pub struct Prng {
    state: u32,
}

impl Prng {
    pub fn new(seed: u32) -> Self {
        // Seed 0 is a fixed point for xorshift.
        Prng {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// Uniform sample in `[lo, hi]`.
    pub fn sample_range(&mut self, lo: u64, hi: u64) -> u64 {
        if hi <= lo {
            return lo;
        }
        lo + self.next_u32() as u64 % (hi - lo + 1)
    }
}

/// A simulation event, ordered by `(timestamp, kind priority, seq)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub time_us: TimeUs,
    /// Kind-derived tiebreak for events at the same timestamp.
    pub prio: u8,
    /// Insertion sequence, the final tiebreak.
    pub seq: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A thread becomes runnable.
    Wakeup { tid: Tid },
    /// A running thread voluntarily blocks.
    Block { tid: Tid },
    /// The armed timeslice on a processor runs out.
    QuantumExpire { tid: Tid, cpu: CpuId },
    /// Periodic scheduler maintenance.
    SchedTick,
    /// An RT thread's period begins.
    RtPeriodStart { tid: Tid },
    /// End of the simulation.
    SimulationEnd,
}

impl EventKind {
    fn priority(self) -> u8 {
        match self {
            EventKind::Wakeup { .. } => 1,
            EventKind::RtPeriodStart { .. } => 2,
            EventKind::QuantumExpire { .. } => 4,
            EventKind::Block { .. } => 5,
            EventKind::SchedTick => 6,
            EventKind::SimulationEnd => 99,
        }
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time_us
            .cmp(&other.time_us)
            .then_with(|| self.prio.cmp(&other.prio))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Discrete-event simulation engine.
#[derive(Debug)]
pub struct SimEngine {
    pub clock: TimeUs,
    pub scheduler: Scheduler,
    pub stats: StatsCollector,
    pub trace: Trace,
    events: BinaryHeap<Reverse<Event>>,
    seq: u64,
    behaviors: HashMap<Tid, BehaviorProfile>,
    /// Latest armed voluntary-block time per thread; stale block events are
    /// dropped against this.
    block_deadlines: HashMap<Tid, TimeUs>,
    prng: Prng,
    /// Assert scheduler invariants after every event (test harness knob).
    pub check_invariants: bool,
}

impl SimEngine {
    pub fn new(num_cpus: u32, seed: u32) -> Self {
        SimEngine {
            clock: 0,
            scheduler: Scheduler::new(num_cpus),
            stats: StatsCollector::new(num_cpus),
            trace: Trace::new(),
            events: BinaryHeap::new(),
            seq: 0,
            behaviors: HashMap::new(),
            block_deadlines: HashMap::new(),
            prng: Prng::new(seed),
            check_invariants: false,
        }
    }

    pub fn schedule(&mut self, time_us: TimeUs, kind: EventKind) {
        let event = Event {
            time_us,
            prio: kind.priority(),
            seq: self.seq,
            kind,
        };
        self.seq += 1;
        self.events.push(Reverse(event));
    }

    /// Register a created thread with the engine: remember its behavior and
    /// schedule its first activation.
    pub fn add_thread(&mut self, tid: Tid, behavior: BehaviorProfile, start_time: TimeUs) {
        self.stats.register_thread(self.scheduler.thread(tid), &self.scheduler);
        let is_rt = self.scheduler.thread(tid).is_realtime();
        self.behaviors.insert(tid, behavior);

        if is_rt {
            self.schedule(start_time, EventKind::RtPeriodStart { tid });
        } else {
            self.schedule(start_time, EventKind::Wakeup { tid });
        }
    }

    /// Run the simulation for `duration_us` of simulated time.
    pub fn run(&mut self, duration_us: TimeUs) {
        self.schedule(duration_us, EventKind::SimulationEnd);

        let mut tick_time = SCHED_TICK_INTERVAL_US;
        while tick_time < duration_us {
            self.schedule(tick_time, EventKind::SchedTick);
            tick_time += SCHED_TICK_INTERVAL_US;
        }

        while let Some(Reverse(event)) = self.events.pop() {
            if event.time_us > duration_us {
                break;
            }
            if event.kind == EventKind::SimulationEnd {
                self.clock = event.time_us;
                break;
            }

            self.clock = event.time_us;
            set_sim_clock(self.clock);
            self.handle_event(event);
            if self.check_invariants {
                self.scheduler.verify_invariants();
            }
        }

        // Charge in-flight segments so accounting closes at the horizon.
        for i in 0..self.scheduler.processors.len() {
            let cpu = CpuId(i as u32);
            if let Some(tid) = self.scheduler.processors[i].active_thread {
                self.scheduler.charge_running(tid, cpu, self.clock);
            }
        }

        self.stats.finalize(&self.scheduler, self.clock);
    }

    /// Capture the serializable state snapshot (adapter surface).
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.scheduler, &self.trace, self.clock)
    }

    fn thread_alive(&self, tid: Tid) -> bool {
        (tid.0 as usize) < self.scheduler.threads.len()
            && self.scheduler.thread(tid).state != ThreadState::Terminated
    }

    fn handle_event(&mut self, event: Event) {
        match event.kind {
            EventKind::Wakeup { tid } => self.handle_wakeup(tid),
            EventKind::Block { tid } => self.handle_block(tid, event.time_us),
            EventKind::QuantumExpire { tid, cpu } => {
                self.handle_quantum_expire(tid, cpu, event.time_us)
            }
            EventKind::SchedTick => self.handle_sched_tick(),
            EventKind::RtPeriodStart { tid } => self.handle_rt_period_start(tid),
            EventKind::SimulationEnd => {}
        }
    }

    fn handle_wakeup(&mut self, tid: Tid) {
        if !self.thread_alive(tid) {
            return;
        }
        // Idempotent: a second wakeup of a runnable/running thread leaves
        // state and trace untouched.
        if self.scheduler.thread(tid).state != ThreadState::Waiting {
            return;
        }

        self.stats.wakeup_count += 1;
        self.trace.record(self.clock, TraceKind::Woke { tid });

        if let Some(cpu) = self.scheduler.thread_wakeup(tid, self.clock) {
            self.handle_preemption(cpu);
        }
    }

    fn handle_block(&mut self, tid: Tid, event_time: TimeUs) {
        if !self.thread_alive(tid) {
            return;
        }

        // Drop stale block events armed for a previous dispatch slice.
        let expected = self.block_deadlines.get(&tid).copied();
        if expected.is_some_and(|t| t != event_time) {
            return;
        }
        if self.scheduler.thread(tid).state != ThreadState::Running {
            if expected == Some(event_time) {
                self.block_deadlines.remove(&tid);
            }
            return;
        }

        self.stats.block_count += 1;

        let Some(cpu) = self
            .scheduler
            .processors
            .iter()
            .find(|p| p.active_thread == Some(tid))
            .map(|p| p.id)
        else {
            return;
        };

        self.block_deadlines.remove(&tid);

        // An RT computation finishing past its deadline is a reported miss.
        {
            let t = self.scheduler.thread(tid);
            if t.is_realtime()
                && t.rt_deadline < RT_DEADLINE_QUANTUM_EXPIRED
                && self.clock > t.rt_deadline
            {
                self.stats.rt_deadline_misses += 1;
                self.trace.record(self.clock, TraceKind::RtDeadlineMiss { tid });
                info!(tid = tid.0, deadline = t.rt_deadline, "rt deadline missed");
            }
        }

        self.trace.record(self.clock, TraceKind::Blocked { tid, cpu });
        let new = self.scheduler.thread_block(tid, cpu, self.clock);

        if let Some(new) = new {
            self.record_dispatch(new, cpu, true);
            self.schedule_quantum_expire(cpu, new);
            if !self.scheduler.thread(new).is_realtime() {
                self.schedule_thread_block(new);
            }
        } else {
            self.trace.record(self.clock, TraceKind::CpuIdle { cpu });
            self.try_dispatch_idle(cpu);
        }

        // Arm the blocked thread's next wakeup.
        if !self.scheduler.thread(tid).is_realtime() {
            if let Some(behavior) = self.behaviors.get(&tid) {
                let duration = behavior.sample_block_duration(&mut self.prng);
                self.schedule(self.clock + duration, EventKind::Wakeup { tid });
            }
        }
    }

    fn handle_quantum_expire(&mut self, tid: Tid, cpu: CpuId, event_time: TimeUs) {
        let proc = &self.scheduler.processors[cpu.0 as usize];
        let Some(active) = proc.active_thread else {
            return;
        };
        // Only the currently armed quantum event is live.
        if active != tid || event_time != proc.quantum_end {
            return;
        }

        self.stats.quantum_expire_count += 1;
        self.trace
            .record(self.clock, TraceKind::QuantumExpired { tid, cpu });

        let old = active;
        let new = self.scheduler.thread_quantum_expire(cpu, self.clock);

        match new {
            Some(new) if new != old => {
                self.record_dispatch(new, cpu, true);
                self.schedule_quantum_expire(cpu, new);
                self.schedule_thread_block(old);
            }
            _ => {
                if let Some(active) = self.scheduler.processors[cpu.0 as usize].active_thread {
                    self.schedule_quantum_expire(cpu, active);
                }
            }
        }
    }

    fn handle_sched_tick(&mut self) {
        self.stats.tick_count += 1;
        self.scheduler.sched_tick(self.clock);
    }

    fn handle_rt_period_start(&mut self, tid: Tid) {
        if !self.thread_alive(tid) {
            return;
        }
        let Some(behavior) = self.behaviors.get(&tid).copied() else {
            return;
        };

        // A new period arriving while the previous one is still in flight is
        // a reported (never recovered) deadline miss.
        if self.scheduler.thread(tid).state != ThreadState::Waiting {
            self.stats.rt_deadline_misses += 1;
            self.trace.record(self.clock, TraceKind::RtDeadlineMiss { tid });
            info!(tid = tid.0, "rt period overrun");
        }

        self.scheduler.thread_mut(tid).rt_deadline = self.clock + behavior.rt_constraint_us;

        if self.scheduler.thread(tid).state == ThreadState::Waiting {
            self.stats.wakeup_count += 1;
            self.trace.record(self.clock, TraceKind::Woke { tid });
            if let Some(cpu) =
                self.scheduler
                    .thread_setrun(tid, self.clock, SCHED_PREEMPT | SCHED_TAILQ)
            {
                self.handle_preemption(cpu);
            }
        }

        // The synthetic computation burst ends in a block.
        self.schedule(
            self.clock + behavior.rt_computation_us,
            EventKind::Block { tid },
        );

        if behavior.rt_period_us > 0 {
            self.schedule(
                self.clock + behavior.rt_period_us,
                EventKind::RtPeriodStart { tid },
            );
        }
    }

    /// Run a select/dispatch pass on a processor after the scheduler
    /// requested preemption. The outgoing thread competes as prev and is
    /// re-enqueued at head only when it loses.
    fn handle_preemption(&mut self, cpu: CpuId) {
        let reason = self.scheduler.consume_preemption_reason(cpu);
        let proc = &self.scheduler.processors[cpu.0 as usize];
        if proc.is_idle() {
            self.try_dispatch_idle(cpu);
            return;
        }
        let Some(old) = proc.active_thread else {
            self.try_dispatch_idle(cpu);
            return;
        };

        self.scheduler.charge_running(old, cpu, self.clock);

        // The switched-out thread keeps its remaining quantum only while on
        // its first timeslice with its priority intact.
        {
            let proc = &self.scheduler.processors[cpu.0 as usize];
            let keep_quantum = proc.first_timeslice
                && proc.starting_pri <= self.scheduler.thread(old).sched_pri;
            let ran = self.clock - proc.last_dispatch_time;
            let t = self.scheduler.thread_mut(old);
            if keep_quantum {
                t.quantum_remaining = t.quantum_remaining.saturating_sub(ran);
            } else {
                t.quantum_remaining = 0;
            }
            if t.is_realtime() && t.quantum_remaining == 0 {
                t.rt_deadline = RT_DEADLINE_QUANTUM_EXPIRED;
            }
            t.state = ThreadState::Runnable;
        }
        if self.scheduler.thread(old).is_timeshare() {
            self.scheduler.timeshare_setrun_update(old);
        }
        self.stats.preemption_count += 1;

        let (new, chose_prev) = self.scheduler.thread_select(cpu, self.clock, Some(old));

        if chose_prev && new == Some(old) {
            self.scheduler.thread_dispatch(
                cpu,
                Some(old),
                old,
                self.clock,
                &format!("preemption requested ({reason}), but thread remained best eligible"),
            );
            self.schedule_quantum_expire(cpu, old);
            return;
        }

        if let Some(new) = new {
            self.scheduler.thread_setrun(old, self.clock, SCHED_HEADQ);
            self.trace
                .record(self.clock, TraceKind::Preempted { tid: old, cpu });
            self.scheduler
                .thread_dispatch(cpu, Some(old), new, self.clock, &reason);
            self.trace
                .record(self.clock, TraceKind::Dispatched { tid: new, cpu });
            self.stats.record_dispatch(self.scheduler.thread(new), self.clock);
            self.stats.context_switch_count += 1;
            debug!(cpu = cpu.0, old = old.0, new = new.0, "preempted");
            self.schedule_quantum_expire(cpu, new);
            if !self.scheduler.thread(new).is_realtime() {
                self.schedule_thread_block(new);
            }
        } else {
            self.scheduler.thread_dispatch(
                cpu,
                Some(old),
                old,
                self.clock,
                &format!("preemption requested ({reason}), but no better replacement"),
            );
            self.schedule_quantum_expire(cpu, old);
        }
    }

    /// Try to put work on an idle processor.
    fn try_dispatch_idle(&mut self, cpu: CpuId) {
        let (new, _) = self.scheduler.thread_select(cpu, self.clock, None);
        if let Some(new) = new {
            self.scheduler
                .thread_dispatch(cpu, None, new, self.clock, "dispatching work to idle CPU");
            self.record_dispatch(new, cpu, false);
            self.schedule_quantum_expire(cpu, new);
            if !self.scheduler.thread(new).is_realtime() {
                self.schedule_thread_block(new);
            }
        }
    }

    fn record_dispatch(&mut self, tid: Tid, cpu: CpuId, context_switch: bool) {
        self.trace.record(self.clock, TraceKind::Dispatched { tid, cpu });
        self.stats.record_dispatch(self.scheduler.thread(tid), self.clock);
        if context_switch {
            self.stats.context_switch_count += 1;
        }
    }

    fn schedule_quantum_expire(&mut self, cpu: CpuId, tid: Tid) {
        let quantum = {
            let t = self.scheduler.thread_mut(tid);
            if t.quantum_remaining == 0 {
                t.reset_quantum();
            }
            t.quantum_remaining
        };
        let expire_time = self.clock + quantum;
        self.scheduler.processors[cpu.0 as usize].quantum_end = expire_time;
        self.schedule(expire_time, EventKind::QuantumExpire { tid, cpu });
    }

    fn schedule_thread_block(&mut self, tid: Tid) {
        let Some(behavior) = self.behaviors.get(&tid) else {
            return;
        };
        if self.scheduler.thread(tid).is_realtime() {
            return;
        }
        let burst = behavior.sample_cpu_burst(&mut self.prng);
        let block_time = self.clock + burst;
        self.block_deadlines.insert(tid, block_time);
        self.schedule(block_time, EventKind::Block { tid });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prng_deterministic() {
        let mut a = Prng::new(12345);
        let mut b = Prng::new(12345);
        let xs: Vec<u32> = (0..8).map(|_| a.next_u32()).collect();
        let ys: Vec<u32> = (0..8).map(|_| b.next_u32()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_prng_zero_seed_is_remapped() {
        let mut p = Prng::new(0);
        assert_ne!(p.next_u32(), 0);
    }

    #[test]
    fn test_event_ordering() {
        let mk = |time_us, prio, seq| Event {
            time_us,
            prio,
            seq,
            kind: EventKind::SchedTick,
        };
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(mk(100, 5, 0)));
        heap.push(Reverse(mk(100, 1, 1)));
        heap.push(Reverse(mk(50, 6, 2)));
        heap.push(Reverse(mk(100, 1, 3)));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(e)| e.seq)).collect();
        assert_eq!(order, vec![2, 1, 3, 0]);
    }
}
