//! Property tests: arbitrary event sequences never break the structural
//! invariants (single-occupancy runqueues, priority mirroring, exact CPU
//! accounting, timeshare priority bounds).

use proptest::prelude::*;

use clutch_api::{QosBucket, RtParams, SchedPolicy};
use clutch_sched::{SchedConfig, Scheduler};

#[derive(Debug, Clone, Copy)]
enum Op {
    Wakeup(usize),
    Block(usize),
    QuantumExpire(usize),
    Tick,
    Urgency(usize, usize),
    Terminate(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..6usize).prop_map(Op::Wakeup),
        (0..6usize).prop_map(Op::Block),
        (0..2usize).prop_map(Op::QuantumExpire),
        Just(Op::Tick),
        (0..6usize, 0..5usize).prop_map(|(t, b)| Op::Urgency(t, b)),
        (0..6usize).prop_map(Op::Terminate),
    ]
}

fn build_scheduler() -> Scheduler {
    let mut s = Scheduler::new(SchedConfig {
        cpus: 2,
        ..SchedConfig::default()
    })
    .unwrap();
    s.create_thread_group(1).unwrap();
    s.create_thread_group(2).unwrap();
    s.create_thread(0, 1, SchedPolicy::Timeshare, 47, None, None)
        .unwrap();
    s.create_thread(1, 1, SchedPolicy::Timeshare, 31, None, None)
        .unwrap();
    s.create_thread(2, 2, SchedPolicy::Timeshare, 4, None, None)
        .unwrap();
    s.create_thread(3, 2, SchedPolicy::Timeshare, 40, None, Some(0))
        .unwrap();
    s.create_thread(4, 2, SchedPolicy::Fixpri, 70, None, None)
        .unwrap();
    s.create_thread(
        5,
        1,
        SchedPolicy::Realtime,
        97,
        Some(RtParams {
            period_us: 0,
            computation_us: 1_000,
            constraint_us: 4_000,
        }),
        None,
    )
    .unwrap();
    s
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn invariants_hold_under_arbitrary_sequences(
        ops in proptest::collection::vec((op_strategy(), 1u64..5_000), 1..120)
    ) {
        let mut s = build_scheduler();
        let timeshare_bands = [
            QosBucket::Foreground,
            QosBucket::UserInitiated,
            QosBucket::Default,
            QosBucket::Utility,
            QosBucket::Background,
        ];
        let mut now = 0u64;
        for (op, dt) in ops {
            now += dt;
            match op {
                Op::Wakeup(tid) => {
                    if let Some(target) = s.thread_wakeup(tid, now) {
                        s.preempt(target, now);
                    }
                }
                Op::Block(tid) => {
                    s.thread_block(tid, now);
                }
                Op::QuantumExpire(cpu) => {
                    if !s.processor_is_idle(cpu) {
                        s.thread_quantum_expire(cpu, now);
                    }
                }
                Op::Tick => s.sched_tick(now),
                Op::Urgency(tid, band) => {
                    // Non-timeshare targets are rejected; that is fine.
                    let _ = s.set_thread_urgency(tid, timeshare_bands[band], now);
                }
                Op::Terminate(tid) => {
                    let _ = s.terminate_thread(tid, now);
                }
            }
            s.verify_integrity();
        }
        s.settle(now);
        s.verify_integrity();
    }
}
