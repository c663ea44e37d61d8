//! Trace event recording.
//!
//! Every scheduling action (dispatch, preemption, block, wakeup, quantum
//! expiry, idle transition, RT deadline miss) is recorded with its simulated
//! timestamp. With a fixed seed the rendered trace is byte-identical across
//! runs, which the determinism tests rely on.

use crate::types::{CpuId, Tid, TimeUs};

/// A single trace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub time_us: TimeUs,
    pub kind: TraceKind,
}

/// The kind of scheduling event recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    /// A thread was installed on a processor.
    Dispatched { tid: Tid, cpu: CpuId },
    /// A thread was switched out involuntarily.
    Preempted { tid: Tid, cpu: CpuId },
    /// A thread voluntarily blocked.
    Blocked { tid: Tid, cpu: CpuId },
    /// A thread became runnable.
    Woke { tid: Tid },
    /// A thread's timeslice ran out.
    QuantumExpired { tid: Tid, cpu: CpuId },
    /// A processor went idle.
    CpuIdle { cpu: CpuId },
    /// An RT thread missed its deadline.
    RtDeadlineMiss { tid: Tid },
}

/// A complete simulation trace in chronological order.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, time_us: TimeUs, kind: TraceKind) {
        self.events.push(TraceEvent { time_us, kind });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of times a thread was dispatched.
    pub fn dispatch_count(&self, tid: Tid) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::Dispatched { tid: t, .. } if t == tid))
            .count()
    }

    /// Number of times a CPU went idle.
    pub fn idle_count(&self, cpu: CpuId) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::CpuIdle { cpu: c } if c == cpu))
            .count()
    }

    /// Number of RT deadline misses recorded for a thread.
    pub fn deadline_miss_count(&self, tid: Tid) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::RtDeadlineMiss { tid: t } if t == tid))
            .count()
    }

    /// Timestamps at which a thread was dispatched.
    pub fn dispatch_times(&self, tid: Tid) -> Vec<TimeUs> {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::Dispatched { tid: t, .. } if t == tid))
            .map(|e| e.time_us)
            .collect()
    }

    fn format_event(event: &TraceEvent) -> String {
        let desc = match event.kind {
            TraceKind::Dispatched { tid, cpu } => {
                format!("DISPATCH tid={} cpu={}", tid.0, cpu.0)
            }
            TraceKind::Preempted { tid, cpu } => {
                format!("PREEMPT  tid={} cpu={}", tid.0, cpu.0)
            }
            TraceKind::Blocked { tid, cpu } => format!("BLOCK    tid={} cpu={}", tid.0, cpu.0),
            TraceKind::Woke { tid } => format!("WAKE     tid={}", tid.0),
            TraceKind::QuantumExpired { tid, cpu } => {
                format!("QUANTUM  tid={} cpu={}", tid.0, cpu.0)
            }
            TraceKind::CpuIdle { cpu } => format!("IDLE     cpu={}", cpu.0),
            TraceKind::RtDeadlineMiss { tid } => format!("RT-MISS  tid={}", tid.0),
        };
        format!("[{:>12}us] {desc}", event.time_us)
    }

    /// Render every event as a line (the determinism comparison input).
    pub fn to_lines(&self) -> Vec<String> {
        self.events.iter().map(Self::format_event).collect()
    }

    /// The last `n` rendered trace lines (snapshot surface).
    pub fn recent_lines(&self, n: usize) -> Vec<String> {
        let start = self.events.len().saturating_sub(n);
        self.events[start..].iter().map(Self::format_event).collect()
    }

    /// Pretty-print the trace to stderr.
    pub fn dump(&self) {
        for event in &self.events {
            eprintln!("{}", Self::format_event(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_lines() {
        let mut trace = Trace::new();
        trace.record(0, TraceKind::Woke { tid: Tid(1) });
        trace.record(0, TraceKind::Dispatched { tid: Tid(1), cpu: CpuId(0) });
        trace.record(5_000, TraceKind::Blocked { tid: Tid(1), cpu: CpuId(0) });
        trace.record(5_000, TraceKind::CpuIdle { cpu: CpuId(0) });

        assert_eq!(trace.dispatch_count(Tid(1)), 1);
        assert_eq!(trace.idle_count(CpuId(0)), 1);
        assert_eq!(trace.to_lines().len(), 4);
        assert_eq!(trace.recent_lines(2).len(), 2);
        assert!(trace.to_lines()[1].contains("DISPATCH tid=1 cpu=0"));
    }
}
