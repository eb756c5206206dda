//! Integration tests driving the scheduler core directly.

use clutch_api::{QosBucket, RtParams, SchedPolicy, ThreadState};
use clutch_sched::{SchedConfig, Scheduler};

fn scheduler(cpus: usize) -> Scheduler {
    Scheduler::new(SchedConfig {
        cpus,
        ..SchedConfig::default()
    })
    .unwrap()
}

fn rt_params(period: u64, computation: u64, constraint: u64) -> RtParams {
    RtParams {
        period_us: period,
        computation_us: computation,
        constraint_us: constraint,
    }
}

#[test]
fn wakeup_dispatches_to_idle_processor() {
    let mut s = scheduler(1);
    s.create_thread_group(1).unwrap();
    s.create_thread(1, 1, SchedPolicy::Timeshare, 47, None, None)
        .unwrap();

    let target = s.thread_wakeup(1, 0);
    assert_eq!(target, Some(0));
    let result = s.preempt(0, 0);
    assert_eq!(result.dispatched, Some(1));
    assert_eq!(s.thread_state(1), Some(ThreadState::Running));
    assert_eq!(s.running_on(1), Some(0));
    s.verify_integrity();
}

#[test]
fn equal_priority_threads_alternate_on_quantum_expiry() {
    let mut s = scheduler(1);
    s.create_thread_group(1).unwrap();
    s.create_thread(1, 1, SchedPolicy::Timeshare, 47, None, None)
        .unwrap();
    s.create_thread(2, 1, SchedPolicy::Timeshare, 47, None, None)
        .unwrap();

    assert_eq!(s.thread_wakeup(1, 0), Some(0));
    s.preempt(0, 0);

    // An equal-priority wakeup requests the processor, but the incumbent
    // on its first timeslice survives the select.
    let target = s.thread_wakeup(2, 0);
    assert_eq!(target, Some(0));
    let result = s.preempt(0, 0);
    assert!(result.kept_prev);
    assert_eq!(result.dispatched, Some(1));

    // Once the quantum expires the expired thread loses the tie.
    let result = s.thread_quantum_expire(0, 10_000);
    assert_eq!(result.dispatched, Some(2));
    assert_eq!(result.descheduled, Some(1));
    let result = s.thread_quantum_expire(0, 20_000);
    assert_eq!(result.dispatched, Some(1));
    assert_eq!(result.descheduled, Some(2));

    assert_eq!(s.thread_cpu(1), 10_000);
    assert_eq!(s.thread_cpu(2), 10_000);
    s.verify_integrity();
}

#[test]
fn rt_selects_earlier_deadline_at_equal_priority() {
    let mut s = scheduler(1);
    s.create_thread_group(1).unwrap();
    s.create_thread(1, 1, SchedPolicy::Realtime, 97, Some(rt_params(0, 1_000, 5_000)), None)
        .unwrap();
    s.create_thread(2, 1, SchedPolicy::Realtime, 97, Some(rt_params(0, 1_000, 3_000)), None)
        .unwrap();

    s.rt_activate(1, 0);
    s.rt_activate(2, 0);
    let result = s.preempt(0, 0);
    // Deadline 3000 beats deadline 5000 at equal priority.
    assert_eq!(result.dispatched, Some(2));

    s.thread_block(2, 1_000);
    assert_eq!(s.running_on(1), Some(0));
    s.verify_integrity();
}

#[test]
fn rt_preemption_by_earlier_deadline() {
    let mut s = scheduler(1);
    s.create_thread_group(1).unwrap();
    s.create_thread(1, 1, SchedPolicy::Realtime, 97, Some(rt_params(0, 2_000, 10_000)), None)
        .unwrap();
    s.create_thread(2, 1, SchedPolicy::Realtime, 97, Some(rt_params(0, 1_000, 3_000)), None)
        .unwrap();

    assert_eq!(s.rt_activate(1, 0), Some(0));
    s.preempt(0, 0);
    assert_eq!(s.running_on(1), Some(0));

    // Same band, much earlier deadline: the incumbent loses its slot.
    let target = s.rt_activate(2, 1_000);
    assert_eq!(target, Some(0));
    let result = s.preempt(0, 1_000);
    assert_eq!(result.dispatched, Some(2));
    assert_eq!(result.descheduled, Some(1));
    assert_eq!(s.thread_state(1), Some(ThreadState::Runnable));
    s.verify_integrity();
}

#[test]
fn non_strict_constraint_safety_promotes_lower_priority() {
    let mut s = scheduler(1);
    s.create_thread_group(1).unwrap();
    // Higher priority, distant deadline, short burst.
    s.create_thread(1, 1, SchedPolicy::Realtime, 98, Some(rt_params(0, 2_000, 20_000)), None)
        .unwrap();
    // Lower priority but a much earlier deadline.
    s.create_thread(2, 1, SchedPolicy::Realtime, 97, Some(rt_params(0, 1_000, 4_000)), None)
        .unwrap();

    s.rt_activate(1, 0);
    s.rt_activate(2, 0);
    let result = s.preempt(0, 0);
    // 0 + 1000 + 2000 <= 20000: the lower-priority thread can finish
    // without endangering the higher one.
    assert_eq!(result.dispatched, Some(2));
    s.verify_integrity();
}

#[test]
fn strict_mode_ignores_deadlines_across_priorities() {
    let mut s = Scheduler::new(SchedConfig {
        cpus: 1,
        strict_rt: true,
        ..SchedConfig::default()
    })
    .unwrap();
    s.create_thread_group(1).unwrap();
    s.create_thread(1, 1, SchedPolicy::Realtime, 98, Some(rt_params(0, 2_000, 20_000)), None)
        .unwrap();
    s.create_thread(2, 1, SchedPolicy::Realtime, 97, Some(rt_params(0, 1_000, 4_000)), None)
        .unwrap();

    s.rt_activate(1, 0);
    s.rt_activate(2, 0);
    let result = s.preempt(0, 0);
    assert_eq!(result.dispatched, Some(1));
}

#[test]
fn bound_thread_waits_for_its_processor() {
    let mut s = scheduler(2);
    s.create_thread_group(1).unwrap();
    s.create_thread(1, 1, SchedPolicy::Timeshare, 50, None, None)
        .unwrap();
    s.create_thread(2, 1, SchedPolicy::Timeshare, 40, None, Some(0))
        .unwrap();

    assert_eq!(s.thread_wakeup(1, 0), Some(0));
    s.preempt(0, 0);
    assert_eq!(s.running_on(1), Some(0));

    // Lower priority and bound to the busy CPU 0: no preemption, and
    // CPU 1 never becomes an option.
    assert_eq!(s.thread_wakeup(2, 0), None);
    assert_eq!(s.thread_state(2), Some(ThreadState::Runnable));
    assert!(s.processor_is_idle(1));
    s.verify_integrity();

    // Once the unbound thread blocks, the bound one gets CPU 0.
    let result = s.thread_block(1, 5_000).unwrap();
    assert_eq!(result.processor, 0);
    assert_eq!(result.dispatched, Some(2));
    assert_eq!(s.running_on(2), Some(0));
    assert!(s.processor_is_idle(1));
    s.verify_integrity();
}

#[test]
fn wakeup_is_idempotent() {
    let mut s = scheduler(1);
    s.create_thread_group(1).unwrap();
    s.create_thread(1, 1, SchedPolicy::Timeshare, 31, None, None)
        .unwrap();

    assert_eq!(s.thread_wakeup(1, 0), Some(0));
    assert_eq!(s.stats().wakeups, 1);
    // Second wakeup of a runnable thread changes nothing.
    assert_eq!(s.thread_wakeup(1, 0), None);
    assert_eq!(s.stats().wakeups, 1);
    s.verify_integrity();

    s.preempt(0, 0);
    assert_eq!(s.thread_wakeup(1, 100), None);
    assert_eq!(s.stats().wakeups, 1);
    s.verify_integrity();
}

#[test]
fn tick_decays_the_running_hog() {
    let mut s = scheduler(1);
    s.create_thread_group(1).unwrap();
    for tid in 1..=8 {
        s.create_thread(tid, 1, SchedPolicy::Timeshare, 47, None, None)
            .unwrap();
        s.thread_wakeup(tid, 0);
    }
    s.preempt(0, 0);
    // Wakeups enqueue at the head, so the most recent waker runs first.
    let hog = 8;
    assert_eq!(s.running_on(hog), Some(0));

    s.sched_tick(125_000);
    let hog_pri = s.thread_sched_pri(hog).unwrap();
    let waiter_pri = s.thread_sched_pri(1).unwrap();
    assert!(hog_pri < 47, "hog kept priority {}", hog_pri);
    assert_eq!(waiter_pri, 47);
    s.verify_integrity();

    // With the hog parked, decay recovers its priority tick by tick.
    s.thread_block(hog, 125_000);
    s.sched_tick(250_000);
    s.sched_tick(375_000);
    s.thread_wakeup(hog, 375_000);
    assert!(s.thread_sched_pri(hog).unwrap() > hog_pri);
    s.verify_integrity();
}

#[test]
fn terminate_running_thread_idles_processor() {
    let mut s = scheduler(1);
    s.create_thread_group(1).unwrap();
    s.create_thread(1, 1, SchedPolicy::Timeshare, 31, None, None)
        .unwrap();
    s.create_thread(2, 1, SchedPolicy::Timeshare, 31, None, None)
        .unwrap();

    s.thread_wakeup(1, 0);
    s.preempt(0, 0);
    s.terminate_thread(1, 4_000).unwrap();
    assert_eq!(s.thread_state(1), Some(ThreadState::Terminated));
    assert!(s.processor_is_idle(0));
    assert_eq!(s.thread_cpu(1), 4_000);
    s.verify_integrity();

    // The next wakeup fills the idle processor again.
    assert_eq!(s.thread_wakeup(2, 5_000), Some(0));
    s.preempt(0, 5_000);
    assert_eq!(s.running_on(2), Some(0));
    s.verify_integrity();

    // Termination is absorbing.
    assert_eq!(s.thread_wakeup(1, 6_000), None);
    s.terminate_thread(1, 6_000).unwrap();
}

#[test]
fn urgency_change_moves_thread_between_buckets() {
    let mut s = scheduler(1);
    s.create_thread_group(1).unwrap();
    s.create_thread(1, 1, SchedPolicy::Timeshare, 47, None, None)
        .unwrap();
    s.create_thread(2, 1, SchedPolicy::Timeshare, 47, None, None)
        .unwrap();
    s.thread_wakeup(1, 0);
    s.preempt(0, 0);
    s.thread_wakeup(2, 0);

    s.set_thread_urgency(2, QosBucket::Background, 100).unwrap();
    assert_eq!(s.thread_state(2), Some(ThreadState::Runnable));
    s.verify_integrity();

    let snapshot = s.snapshot(100);
    let t2 = snapshot.threads.iter().find(|t| t.tid == 2).unwrap();
    assert_eq!(t2.sched_bucket, Some(QosBucket::Background));

    // Still selectable from its new band.
    let result = s.thread_block(1, 1_000).unwrap();
    assert_eq!(result.dispatched, Some(2));
    s.verify_integrity();
}

#[test]
fn urgency_rejected_for_non_timeshare() {
    let mut s = scheduler(1);
    s.create_thread_group(1).unwrap();
    s.create_thread(1, 1, SchedPolicy::Realtime, 97, Some(rt_params(0, 1_000, 2_000)), None)
        .unwrap();
    assert!(s.set_thread_urgency(1, QosBucket::Utility, 0).is_err());
}

#[test]
fn construction_rejects_illegal_input() {
    let mut s = scheduler(1);
    s.create_thread_group(1).unwrap();
    assert!(s.create_thread_group(1).is_err());

    // Unknown group.
    assert!(s
        .create_thread(1, 9, SchedPolicy::Timeshare, 31, None, None)
        .is_err());
    // Timeshare priority out of range.
    assert!(s
        .create_thread(1, 1, SchedPolicy::Timeshare, 90, None, None)
        .is_err());
    // Realtime without parameters.
    assert!(s
        .create_thread(1, 1, SchedPolicy::Realtime, 97, None, None)
        .is_err());
    // Constraint shorter than computation.
    assert!(s
        .create_thread(1, 1, SchedPolicy::Realtime, 97, Some(rt_params(0, 5_000, 2_000)), None)
        .is_err());
    // Bad processor binding.
    assert!(s
        .create_thread(1, 1, SchedPolicy::Timeshare, 31, None, Some(7))
        .is_err());

    s.create_thread(1, 1, SchedPolicy::Timeshare, 31, None, None)
        .unwrap();
    assert!(s
        .create_thread(1, 1, SchedPolicy::Timeshare, 31, None, None)
        .is_err());
}

#[test]
fn fixpri_lane_outranks_timeshare_bands() {
    let mut s = scheduler(1);
    s.create_thread_group(1).unwrap();
    s.create_thread(1, 1, SchedPolicy::Timeshare, 47, None, None)
        .unwrap();
    s.create_thread(2, 1, SchedPolicy::Fixpri, 80, None, None)
        .unwrap();

    s.thread_wakeup(1, 0);
    s.preempt(0, 0);
    assert_eq!(s.thread_wakeup(2, 0), Some(0));
    let result = s.preempt(0, 0);
    assert_eq!(result.dispatched, Some(2));
    assert_eq!(result.descheduled, Some(1));
    s.verify_integrity();
}

#[test]
fn cpu_accounting_matches_processor_busy_time() {
    let mut s = scheduler(1);
    s.create_thread_group(1).unwrap();
    s.create_thread(1, 1, SchedPolicy::Timeshare, 31, None, None)
        .unwrap();
    s.create_thread(2, 1, SchedPolicy::Timeshare, 31, None, None)
        .unwrap();

    s.thread_wakeup(1, 0);
    s.preempt(0, 0);
    s.thread_wakeup(2, 2_500);
    s.thread_quantum_expire(0, 10_000);
    s.thread_block(2, 14_000);
    s.settle(20_000);

    assert_eq!(s.thread_cpu(1), 10_000 + 6_000);
    assert_eq!(s.thread_cpu(2), 4_000);
    // verify_integrity asserts the busy-time identity.
    s.verify_integrity();

    let snapshot = s.snapshot(20_000);
    assert_eq!(snapshot.processors[0].busy_us, 20_000);
}
