//! Per-processor state: the running thread and the bound runqueue.

use clutch_api::{Pri, ProcessorId, Tid, NOPRI};

use crate::runq::ThreadRunQueue;

/// Processor run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Idle,
    Running,
}

/// A logical processor.
#[derive(Debug)]
pub struct Processor {
    pub id: ProcessorId,
    pub state: ProcState,
    pub active_thread: Option<Tid>,
    /// Mirrors the active thread's sched_pri while running; NOPRI when idle
    pub current_pri: Pri,
    /// Runqueue for threads bound to this processor
    pub bound_runq: ThreadRunQueue,
    /// Total busy time, microseconds
    pub busy_us: u64,
}

impl Processor {
    pub fn new(id: ProcessorId) -> Self {
        Self {
            id,
            state: ProcState::Idle,
            active_thread: None,
            current_pri: NOPRI,
            bound_runq: ThreadRunQueue::new(),
            busy_us: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == ProcState::Idle
    }
}
