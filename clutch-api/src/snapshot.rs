//! Serializable snapshot of the scheduler state.
//!
//! External consumers (dashboards, the human task layer) read scheduler
//! state exclusively through these structures; they never hold references
//! into the scheduler itself.

use serde::Serialize;

use crate::types::{Pri, ProcessorId, QosBucket, SimTime, ThreadState, Tid};

/// Aggregate event counters maintained by the scheduler core.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StatsCounters {
    /// Threads made runnable from a wait
    pub wakeups: u64,
    /// Threads that blocked off a processor
    pub blocks: u64,
    /// Quantum expirations handled
    pub quantum_expires: u64,
    /// Periodic maintenance ticks
    pub sched_ticks: u64,
    /// Dispatches that installed a different thread than before
    pub context_switches: u64,
    /// Real-time activations that missed their deadline
    pub rt_deadline_misses: u64,
    /// Select passes that left the processor idle
    pub idle_dispatches: u64,
    /// Preemption checks that returned a target processor
    pub preemptions: u64,
    /// Root-bucket selections where a higher band overrode EDF on warp
    pub root_warp_selections: u64,
    /// Root-bucket selections forced by starvation avoidance
    pub root_starvation_selections: u64,
}

/// Per-thread view.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSnapshot {
    pub tid: Tid,
    pub state: ThreadState,
    pub sched_pri: Pri,
    pub base_pri: Pri,
    /// QoS band for threads in the clutch hierarchy; `None` for RT threads
    pub sched_bucket: Option<QosBucket>,
    /// Total CPU consumed, in microseconds
    pub cpu_usage: u64,
    pub quantum_remaining: u64,
    pub quantum_base: u64,
    pub rt_deadline: Option<SimTime>,
    /// Whether a processor currently runs this thread
    pub is_active: bool,
    /// Position within its runqueue, 0 = next to run; `None` if not enqueued
    pub run_queue_rank: Option<usize>,
    /// Times the thread has been dispatched
    pub run_count: u64,
    /// Real-time deadline misses attributed to this thread
    pub deadline_misses: u64,
}

/// Per-root-bucket view.
#[derive(Debug, Clone, Serialize)]
pub struct RootBucketSnapshot {
    pub band: QosBucket,
    pub warp_remaining: u64,
    pub warp_total: u64,
    /// Absolute EDF virtual deadline
    pub deadline: SimTime,
    /// Microseconds until the deadline; negative when already past
    pub deadline_remaining: i64,
    pub runnable: bool,
}

/// Per-processor view.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorSnapshot {
    pub id: ProcessorId,
    pub active_tid: Option<Tid>,
    pub current_pri: Pri,
    /// Total busy time, in microseconds
    pub busy_us: u64,
}

/// Full scheduler snapshot at a quiescent point.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    /// Simulation time the snapshot was taken at
    pub time: SimTime,
    pub threads: Vec<ThreadSnapshot>,
    pub root_buckets: Vec<RootBucketSnapshot>,
    pub processors: Vec<ProcessorSnapshot>,
    pub stats: StatsCounters,
    /// Most recent trace lines, oldest first
    pub trace: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_to_json() {
        let snap = SchedulerSnapshot {
            time: 1_000,
            threads: vec![ThreadSnapshot {
                tid: 1,
                state: ThreadState::Runnable,
                sched_pri: 31,
                base_pri: 31,
                sched_bucket: Some(QosBucket::Default),
                cpu_usage: 500,
                quantum_remaining: 10_000,
                quantum_base: 10_000,
                rt_deadline: None,
                is_active: false,
                run_queue_rank: Some(0),
                run_count: 2,
                deadline_misses: 0,
            }],
            root_buckets: Vec::new(),
            processors: vec![ProcessorSnapshot {
                id: 0,
                active_tid: None,
                current_pri: -1,
                busy_us: 500,
            }],
            stats: StatsCounters::default(),
            trace: vec!["[      1000] tid=1 wakeup".into()],
        };
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"tid\":1"));
        assert!(json.contains("\"Default\""));
    }
}
