//! Thread groups and clutch bucket groups.
//!
//! A thread group owns one clutch bucket group per QoS band. The bucket
//! group aggregates load and usage for its threads and carries the
//! per-band runqueue (the clutch bucket) that participates in root-bucket
//! selection.

use std::collections::BTreeSet;

use clutch_api::{GroupId, QosBucket, Tid};

use crate::runq::ThreadRunQueue;

/// The runqueue side of a bucket group: a max-priority queue of threads
/// contending within one (group, band) pair.
#[derive(Debug, Default)]
pub struct ClutchBucket {
    pub runq: ThreadRunQueue,
}

/// Per-(group, band) aggregate: the clutch bucket plus membership and
/// load accounting that drives the timeshare priority shift.
#[derive(Debug)]
pub struct ClutchBucketGroup {
    /// Arena index of the owning thread group
    pub group: usize,
    pub band: QosBucket,
    pub bucket: ClutchBucket,
    /// Timeshare threads of this bucket group that are runnable or
    /// running, for aging at the maintenance tick (ordered by tid)
    pub timeshare_threads: BTreeSet<Tid>,
    /// Threads of this bucket group in runnable or running state
    pub runnable_count: u64,
    /// Cumulative CPU consumed by this bucket group's threads
    pub cpu_used: u64,
    /// Smoothed runnable load sampled at each tick
    pub load_avg: u64,
    /// Current priority shift applied to member threads
    pub pri_shift: u32,
    /// Whether the clutch bucket sits in its root bucket's FIFO
    pub in_root_fifo: bool,
}

impl ClutchBucketGroup {
    pub fn new(group: usize, band: QosBucket, initial_pri_shift: u32) -> Self {
        Self {
            group,
            band,
            bucket: ClutchBucket::default(),
            timeshare_threads: BTreeSet::new(),
            runnable_count: 0,
            cpu_used: 0,
            load_avg: 0,
            pri_shift: initial_pri_shift,
            in_root_fifo: false,
        }
    }
}

/// A thread group: six bucket groups, one per QoS band, plus membership.
#[derive(Debug)]
pub struct ThreadGroup {
    pub id: GroupId,
    /// Arena indices of the bucket groups, indexed by band
    pub bucket_groups: [usize; QosBucket::COUNT],
    /// Member threads, ordered by tid
    pub threads: BTreeSet<Tid>,
}
