//! Clutch scheduler core.
//!
//! A faithful re-implementation of the clutch scheduler: thread groups
//! feed per-QoS clutch buckets, root buckets race on virtual deadlines
//! with warp overrides and starvation avoidance, real-time threads run
//! from a dedicated queue, and bound threads from per-processor
//! runqueues. The `Scheduler` owns every piece of state; the four entry
//! points (setrun via wakeup, select, dispatch, sched_tick) are the only
//! ways to move it.
//!
//! The crate is strictly single-threaded; all time is simulation time
//! supplied by the caller.

pub mod core;
pub mod group;
pub mod processor;
pub mod root;
pub mod rt;
pub mod runq;
pub mod thread;
pub mod timeshare;

pub use crate::core::{DispatchResult, SchedConfig, Scheduler};
pub use crate::root::ServiceKind;
pub use crate::runq::ThreadRunQueue;
pub use crate::timeshare::{DEFAULT_QUANTUM_US, SCHED_TICK_INTERVAL_US, STARVATION_THRESHOLD_US};
