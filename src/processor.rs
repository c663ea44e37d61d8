//! Simulated processor state.

use crate::constants::NOPRI;
use crate::types::{CpuId, Pri, Tid, TimeUs};

/// Processor execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Running,
}

/// A single CPU core.
#[derive(Debug)]
pub struct Processor {
    pub id: CpuId,
    pub state: ProcessorState,
    /// Currently installed thread, or None while idle.
    pub active_thread: Option<Tid>,
    /// Priority of the active thread (NOPRI while idle).
    pub current_pri: Pri,
    /// Absolute time the armed quantum-expire event fires.
    pub quantum_end: TimeUs,
    /// Whether the active thread is on its first timeslice.
    pub first_timeslice: bool,
    /// Active thread's priority at dispatch, for keep-quantum decisions.
    pub starting_pri: Pri,
    pub last_dispatch_time: TimeUs,

    // Stats.
    pub busy_time_us: u64,
    pub context_switches: u64,
}

impl Processor {
    pub fn new(id: CpuId) -> Self {
        Processor {
            id,
            state: ProcessorState::Idle,
            active_thread: None,
            current_pri: NOPRI,
            quantum_end: 0,
            first_timeslice: false,
            starting_pri: NOPRI,
            last_dispatch_time: 0,
            busy_time_us: 0,
            context_switches: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == ProcessorState::Idle || self.active_thread.is_none()
    }

    /// Drop to idle.
    pub fn go_idle(&mut self) {
        self.active_thread = None;
        self.current_pri = NOPRI;
        self.state = ProcessorState::Idle;
    }
}
