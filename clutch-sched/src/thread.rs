//! Thread control state owned by the scheduler.

use clutch_api::{Pri, ProcessorId, QosBucket, RtParams, SchedPolicy, SimTime, ThreadState, Tid};

/// Which runqueue currently holds a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLocation {
    /// Not enqueued anywhere (waiting, running, or terminated)
    None,
    /// In the global real-time queue
    RtQueue,
    /// In a processor's bound runqueue
    Bound(ProcessorId),
    /// In the clutch bucket group at the given arena index
    Clutch(usize),
}

/// Thread control block.
///
/// All fields are owned by the scheduler; the engine and adapters refer to
/// threads by tid only.
#[derive(Debug)]
pub struct Thread {
    pub tid: Tid,
    /// Arena index of the owning thread group
    pub group: usize,
    pub policy: SchedPolicy,
    pub base_pri: Pri,
    pub sched_pri: Pri,
    pub state: ThreadState,
    /// QoS band within the group; `None` for real-time threads
    pub sched_bucket: Option<QosBucket>,
    pub bound_processor: Option<ProcessorId>,
    /// Total CPU consumed, microseconds
    pub cpu_usage: u64,
    /// Decaying usage driving the timeshare priority penalty
    pub sched_usage: u64,
    pub pri_shift: u32,
    pub quantum_base: u64,
    pub quantum_remaining: u64,
    /// True until the first quantum of a run expires
    pub first_timeslice: bool,
    pub rt: Option<RtParams>,
    /// Absolute deadline of the current RT activation
    pub rt_deadline: Option<SimTime>,
    pub last_made_runnable_time: SimTime,
    /// Tick count at the last usage aging
    pub sched_stamp: u64,
    /// Start of the current run segment; CPU is charged from here
    pub computation_epoch: SimTime,
    /// Processor currently running this thread
    pub running_on: Option<ProcessorId>,
    pub location: RunLocation,
    pub run_count: u64,
    pub deadline_misses: u64,
}

impl Thread {
    /// Whether the thread participates in the clutch hierarchy (unbound,
    /// non-realtime).
    pub fn in_hierarchy(&self) -> bool {
        self.policy != SchedPolicy::Realtime && self.bound_processor.is_none()
    }

    /// Whether the thread is runnable or running.
    pub fn is_active(&self) -> bool {
        matches!(self.state, ThreadState::Runnable | ThreadState::Running)
    }
}
