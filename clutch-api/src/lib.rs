//! Shared vocabulary for the clutch scheduler and its simulator.
//!
//! This crate holds the types that cross the boundary between the scheduler
//! core, the discrete-event engine, and external consumers of scheduler
//! snapshots: identifiers, the priority range, QoS buckets, scheduling
//! policies, thread states, setrun options, real-time parameters, workload
//! behavior profiles, the common error type, and the serializable snapshot
//! structures. No scheduling logic lives here.

pub mod error;
pub mod profile;
pub mod snapshot;
pub mod types;

pub use error::{Error, Result};
pub use profile::BehaviorProfile;
pub use snapshot::{
    ProcessorSnapshot, RootBucketSnapshot, SchedulerSnapshot, StatsCounters, ThreadSnapshot,
};
pub use types::{
    GroupId, Pri, ProcessorId, QosBucket, RtParams, SchedPolicy, SetrunFlags, SimTime, ThreadState,
    Tid, BASEPRI_DEFAULT, BASEPRI_FOREGROUND, BASEPRI_RTQUEUES, BASEPRI_USER_INITIATED,
    BASEPRI_UTILITY, MAXPRI, MAXPRI_THROTTLE, MINPRI, NOPRI,
};
