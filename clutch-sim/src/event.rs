//! Simulation events and their deterministic ordering.

use clutch_api::{SimTime, Tid};

/// Event kinds, in tie-break order: maintenance first, then completions,
/// then arrivals, with the end marker last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    SchedTick,
    RtPeriodStart,
    Block,
    QuantumExpire,
    Wakeup,
    SimulationEnd,
}

/// One scheduled event.
///
/// Heap order is (timestamp, kind, seq), all ascending; the sequence
/// number makes ordering total so identical runs pop identical sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub timestamp: SimTime,
    pub kind: EventKind,
    pub seq: u64,
    pub tid: Option<Tid>,
    /// Dispatch generation the event was scheduled under; stale events
    /// are dropped when the generation has moved on
    pub gen: u64,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.kind.cmp(&other.kind))
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
