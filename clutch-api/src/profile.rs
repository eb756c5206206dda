//! Workload behavior profiles consumed by the discrete-event engine.

use crate::types::{RtParams, SchedPolicy};

/// Describes how a simulated thread behaves over time.
///
/// Timeshare and fixed-priority threads alternate compute bursts and
/// sleeps, both sampled around the configured means. Real-time threads are
/// driven by their period instead: each activation runs a fixed computation
/// burst against the constraint deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BehaviorProfile {
    /// Which scheduling policy the thread runs under
    pub policy: SchedPolicy,
    /// Mean compute burst length in microseconds
    pub mean_compute_us: u64,
    /// Mean sleep between bursts in microseconds
    pub mean_sleep_us: u64,
    /// Real-time parameters; required for `SchedPolicy::Realtime`
    pub rt: Option<RtParams>,
}

impl BehaviorProfile {
    /// Timeshare worker alternating compute and sleep.
    pub fn timeshare(mean_compute_us: u64, mean_sleep_us: u64) -> Self {
        Self {
            policy: SchedPolicy::Timeshare,
            mean_compute_us,
            mean_sleep_us,
            rt: None,
        }
    }

    /// Fixed-priority worker alternating compute and sleep.
    pub fn fixpri(mean_compute_us: u64, mean_sleep_us: u64) -> Self {
        Self {
            policy: SchedPolicy::Fixpri,
            mean_compute_us,
            mean_sleep_us,
            rt: None,
        }
    }

    /// Periodic real-time worker.
    pub fn rt(period_us: u64, computation_us: u64, constraint_us: u64) -> Self {
        Self {
            policy: SchedPolicy::Realtime,
            mean_compute_us: computation_us,
            mean_sleep_us: 0,
            rt: Some(RtParams {
                period_us,
                computation_us,
                constraint_us,
            }),
        }
    }
}
