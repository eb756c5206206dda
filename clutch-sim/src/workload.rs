//! Scenario library: named workloads with literal parameters.

use clutch_api::{BehaviorProfile, GroupId, Pri, ProcessorId, SimTime, Tid};

use crate::config::Scenario;

/// One thread of a workload, ready to hand to the scheduler and engine.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadThread {
    pub tid: Tid,
    pub group: GroupId,
    pub base_pri: Pri,
    pub bound: Option<ProcessorId>,
    pub profile: BehaviorProfile,
    /// When the thread first wakes (or its first RT period starts)
    pub start_us: SimTime,
}

fn thread(
    tid: Tid,
    group: GroupId,
    base_pri: Pri,
    profile: BehaviorProfile,
    start_us: SimTime,
) -> WorkloadThread {
    WorkloadThread {
        tid,
        group,
        base_pri,
        bound: None,
        profile,
        start_us,
    }
}

/// Build the thread set for a scenario.
pub fn build(scenario: Scenario, cpus: usize) -> Vec<WorkloadThread> {
    match scenario {
        Scenario::Mixed => mixed(),
        Scenario::Warp => warp(),
        Scenario::Starvation => starvation(),
        Scenario::Rt => rt(),
        Scenario::Bound => bound(),
        Scenario::Smp => smp(cpus),
    }
}

/// Interactive, default, and background groups plus one RT thread.
fn mixed() -> Vec<WorkloadThread> {
    vec![
        // Interactive group: short bursts, long sleeps.
        thread(1, 1, 47, BehaviorProfile::timeshare(2_000, 5_000), 0),
        thread(2, 1, 47, BehaviorProfile::timeshare(2_000, 5_000), 500),
        // Default group: steady medium load.
        thread(3, 2, 31, BehaviorProfile::timeshare(5_000, 2_000), 0),
        thread(4, 2, 31, BehaviorProfile::timeshare(5_000, 2_000), 250),
        // Background group: long bursts, barely sleeps.
        thread(5, 3, 4, BehaviorProfile::timeshare(8_000, 1_000), 0),
        thread(6, 3, 4, BehaviorProfile::timeshare(8_000, 1_000), 750),
        // One periodic RT thread.
        thread(7, 4, 97, BehaviorProfile::rt(10_000, 2_000, 5_000), 0),
    ]
}

/// One foreground group against three user-initiated groups, all hungry.
/// The foreground band keeps winning EDF until its refreshed deadline
/// passes the others', then stretches its lead through warp.
fn warp() -> Vec<WorkloadThread> {
    vec![
        thread(1, 1, 47, BehaviorProfile::timeshare(40_000, 500), 0),
        thread(2, 2, 40, BehaviorProfile::timeshare(40_000, 500), 0),
        thread(3, 3, 40, BehaviorProfile::timeshare(40_000, 500), 0),
        thread(4, 4, 40, BehaviorProfile::timeshare(40_000, 500), 0),
    ]
}

/// Heavy foreground load plus a single background thread that only
/// starvation avoidance can rescue before its distant EDF turn.
fn starvation() -> Vec<WorkloadThread> {
    vec![
        thread(1, 1, 47, BehaviorProfile::timeshare(20_000, 200), 0),
        thread(2, 1, 47, BehaviorProfile::timeshare(20_000, 200), 0),
        thread(3, 1, 47, BehaviorProfile::timeshare(20_000, 200), 0),
        thread(4, 2, 4, BehaviorProfile::timeshare(5_000, 1_000), 0),
    ]
}

/// A periodic RT thread against a CPU-hungry foreground thread.
fn rt() -> Vec<WorkloadThread> {
    vec![
        thread(1, 1, 97, BehaviorProfile::rt(10_000, 3_000, 5_000), 0),
        thread(2, 2, 47, BehaviorProfile::timeshare(50_000, 500), 0),
    ]
}

/// An unbound foreground thread outranking a thread bound to CPU 0.
fn bound() -> Vec<WorkloadThread> {
    let mut threads = vec![
        thread(1, 1, 50, BehaviorProfile::timeshare(20_000, 1_000), 0),
    ];
    let mut bound_thread = thread(2, 1, 40, BehaviorProfile::timeshare(20_000, 1_000), 0);
    bound_thread.bound = Some(0);
    threads.push(bound_thread);
    threads
}

/// The mixed workload widened for several processors.
fn smp(cpus: usize) -> Vec<WorkloadThread> {
    let mut threads = Vec::new();
    let mut tid = 1;
    // One interactive and one default group per processor.
    for group in 0..cpus.max(1) {
        threads.push(thread(tid, group + 1, 47, BehaviorProfile::timeshare(2_000, 4_000), 0));
        tid += 1;
        threads.push(thread(tid, group + 1, 31, BehaviorProfile::timeshare(6_000, 2_000), 300));
        tid += 1;
    }
    // A shared background group and one RT thread.
    let bg_group = cpus.max(1) + 1;
    threads.push(thread(tid, bg_group, 4, BehaviorProfile::timeshare(10_000, 500), 0));
    tid += 1;
    threads.push(thread(
        tid,
        bg_group + 1,
        97,
        BehaviorProfile::rt(10_000, 2_000, 5_000),
        0,
    ));
    threads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenarios_have_unique_tids() {
        for scenario in Scenario::ALL {
            let threads = build(scenario, 4);
            let mut tids: Vec<Tid> = threads.iter().map(|t| t.tid).collect();
            tids.sort_unstable();
            tids.dedup();
            assert_eq!(tids.len(), threads.len(), "{} has duplicate tids", scenario);
        }
    }

    #[test]
    fn bound_scenario_pins_exactly_one_thread() {
        let threads = build(Scenario::Bound, 1);
        assert_eq!(threads.iter().filter(|t| t.bound.is_some()).count(), 1);
    }
}
