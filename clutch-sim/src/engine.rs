//! The discrete-event engine.
//!
//! A single tight loop over the event heap drives the scheduler. Handlers
//! are total functions of scheduler state; they never call each other and
//! communicate only by scheduling future events. The clock advances only
//! when an event pops.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use log::info;

use clutch_api::{
    BehaviorProfile, ProcessorId, Result, SchedPolicy, SchedulerSnapshot, SimTime, StatsCounters,
    ThreadState, Tid,
};
use clutch_sched::{DispatchResult, SchedConfig, Scheduler};

use crate::config::SimConfig;
use crate::event::{Event, EventKind};
use crate::rng::Prng;
use crate::trace::TraceBuffer;
use crate::workload::{self, WorkloadThread};

/// Engine-side bookkeeping for one simulated thread.
#[derive(Debug)]
struct Worker {
    profile: BehaviorProfile,
    /// Dispatch generation; events from older generations are stale
    gen: u64,
    /// Remaining compute burst for timeshare/fixpri threads
    burst_remaining: u64,
    /// Thread CPU total when it last went on-core
    cpu_at_dispatch: u64,
    /// Thread CPU total when the current RT period started
    rt_cpu_at_period_start: u64,
}

/// Result of a finished simulation.
#[derive(Debug)]
pub struct SimReport {
    pub stats: StatsCounters,
    pub trace: Vec<String>,
    pub cpu_by_tid: BTreeMap<Tid, u64>,
    pub snapshot: SchedulerSnapshot,
}

/// The discrete-event engine.
pub struct Engine {
    clock: SimTime,
    duration: SimTime,
    heap: BinaryHeap<Reverse<Event>>,
    seq: u64,
    sched: Scheduler,
    rng: Prng,
    workers: BTreeMap<Tid, Worker>,
    trace: TraceBuffer,
    /// Run the full invariant check after every event (tests)
    verify: bool,
}

impl Engine {
    /// Build an engine for a configuration, loading its scenario.
    pub fn new(config: &SimConfig) -> Result<Self> {
        let threads = workload::build(config.scenario, config.cpus);
        Self::with_workload(config, &threads)
    }

    /// Build an engine around an explicit workload instead of a named
    /// scenario.
    pub fn with_workload(config: &SimConfig, threads: &[WorkloadThread]) -> Result<Self> {
        let sched = Scheduler::new(SchedConfig {
            cpus: config.cpus,
            ..SchedConfig::default()
        })?;
        let mut engine = Self {
            clock: 0,
            duration: config.duration_us,
            heap: BinaryHeap::new(),
            seq: 0,
            sched,
            rng: Prng::new(config.seed),
            workers: BTreeMap::new(),
            trace: TraceBuffer::default(),
            verify: false,
        };
        engine.load_workload(threads)?;
        let tick = engine.sched.config().sched_tick_interval_us;
        engine.schedule(tick, EventKind::SchedTick, None, 0);
        engine.schedule(config.duration_us, EventKind::SimulationEnd, None, 0);
        Ok(engine)
    }

    /// Register workload threads with the scheduler and seed their first
    /// events.
    fn load_workload(&mut self, threads: &[WorkloadThread]) -> Result<()> {
        let mut groups_seen = std::collections::BTreeSet::new();
        for wt in threads {
            if groups_seen.insert(wt.group) {
                self.sched.create_thread_group(wt.group)?;
            }
            self.sched.create_thread(
                wt.tid,
                wt.group,
                wt.profile.policy,
                wt.base_pri,
                wt.profile.rt,
                wt.bound,
            )?;
            self.workers.insert(
                wt.tid,
                Worker {
                    profile: wt.profile,
                    gen: 0,
                    burst_remaining: 0,
                    cpu_at_dispatch: 0,
                    rt_cpu_at_period_start: 0,
                },
            );
            let kind = match wt.profile.policy {
                SchedPolicy::Realtime => EventKind::RtPeriodStart,
                _ => EventKind::Wakeup,
            };
            self.schedule(wt.start_us, kind, Some(wt.tid), 0);
        }
        Ok(())
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.sched
    }

    pub fn clock(&self) -> SimTime {
        self.clock
    }

    /// Enable per-event invariant verification.
    pub fn set_verify(&mut self, verify: bool) {
        self.verify = verify;
    }

    /// Inject an extra wakeup event, e.g. from the adapter layer.
    pub fn schedule_wakeup(&mut self, tid: Tid, at: SimTime) {
        self.schedule(at, EventKind::Wakeup, Some(tid), 0);
    }

    /// Run to completion and report.
    pub fn run(&mut self) -> SimReport {
        while let Some(Reverse(event)) = self.heap.pop() {
            if event.timestamp > self.duration {
                break;
            }
            self.clock = event.timestamp;
            if event.kind == EventKind::SimulationEnd {
                break;
            }
            match event.kind {
                EventKind::SchedTick => self.handle_sched_tick(),
                EventKind::RtPeriodStart => self.handle_rt_period_start(event.tid.unwrap()),
                EventKind::Block => self.handle_block(event.tid.unwrap(), event.gen),
                EventKind::QuantumExpire => self.handle_quantum_expire(event.tid.unwrap(), event.gen),
                EventKind::Wakeup => self.handle_wakeup(event.tid.unwrap()),
                EventKind::SimulationEnd => unreachable!(),
            }
            if self.verify {
                self.sched.verify_integrity();
            }
        }
        self.clock = self.duration;
        self.sched.settle(self.duration);
        if self.verify {
            self.sched.verify_integrity();
        }

        let cpu_by_tid = self
            .workers
            .keys()
            .map(|&tid| (tid, self.sched.thread_cpu(tid)))
            .collect();
        let mut snapshot = self.sched.snapshot(self.duration);
        snapshot.trace = self.trace.lines();
        info!(
            "simulation complete at {}us: {} context switches, {} rt misses",
            self.duration,
            snapshot.stats.context_switches,
            snapshot.stats.rt_deadline_misses
        );
        SimReport {
            stats: snapshot.stats.clone(),
            trace: self.trace.lines(),
            cpu_by_tid,
            snapshot,
        }
    }

    /// Quiescent snapshot mid-run, trace attached.
    pub fn snapshot(&mut self) -> SchedulerSnapshot {
        self.sched.settle(self.clock);
        let mut snapshot = self.sched.snapshot(self.clock);
        snapshot.trace = self.trace.lines();
        snapshot
    }

    fn schedule(&mut self, at: SimTime, kind: EventKind, tid: Option<Tid>, gen: u64) {
        self.seq += 1;
        self.heap.push(Reverse(Event {
            timestamp: at,
            kind,
            seq: self.seq,
            tid,
            gen,
        }));
    }

    fn trace_line(&mut self, line: String) {
        self.trace.push(line);
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    fn handle_wakeup(&mut self, tid: Tid) {
        // Redundant wakeups of runnable or running threads and wakeups of
        // terminated threads fall through without a trace.
        if self.sched.thread_state(tid) != Some(ThreadState::Waiting) {
            return;
        }
        let Some(worker) = self.workers.get(&tid) else {
            return;
        };
        let mean_compute = worker.profile.mean_compute_us;
        let burst = self.rng.sample_us(mean_compute);
        self.workers.get_mut(&tid).unwrap().burst_remaining = burst;

        let target = self.sched.thread_wakeup(tid, self.clock);
        self.trace_line(format!("[{:>10}] tid={} wakeup", self.clock, tid));
        if let Some(processor) = target {
            self.handle_preemption(processor);
        }
    }

    fn handle_rt_period_start(&mut self, tid: Tid) {
        let Some(worker) = self.workers.get(&tid) else {
            return;
        };
        let profile = worker.profile;
        match self.sched.thread_state(tid) {
            None | Some(ThreadState::Terminated) => return,
            _ => {}
        }
        let cpu = self.sched.thread_cpu(tid);
        self.workers.get_mut(&tid).unwrap().rt_cpu_at_period_start = cpu;

        let target = self.sched.rt_activate(tid, self.clock);
        self.trace_line(format!("[{:>10}] tid={} rt_period", self.clock, tid));

        let rt = profile.rt.expect("rt worker without parameters");
        // The computation burst ends at a fixed offset from the period
        // start, whether or not the thread held a processor throughout.
        self.schedule(self.clock + rt.computation_us, EventKind::Block, Some(tid), 0);
        if rt.period_us > 0 {
            self.schedule(self.clock + rt.period_us, EventKind::RtPeriodStart, Some(tid), 0);
        }
        if let Some(processor) = target {
            self.handle_preemption(processor);
        }
    }

    fn handle_block(&mut self, tid: Tid, gen: u64) {
        let Some(worker) = self.workers.get(&tid) else {
            return;
        };
        let profile = worker.profile;
        let worker_gen = worker.gen;
        let rt_base = worker.rt_cpu_at_period_start;

        if profile.policy == SchedPolicy::Realtime {
            match self.sched.thread_state(tid) {
                Some(ThreadState::Runnable) | Some(ThreadState::Running) => {}
                _ => return,
            }
            let computation = profile.rt.map(|r| r.computation_us).unwrap_or(0);
            let result = self.sched.thread_block(tid, self.clock);
            let received = self.sched.thread_cpu(tid).saturating_sub(rt_base);
            if received < computation {
                self.sched.record_rt_miss(tid, self.clock);
            }
            self.bump_gen(tid);
            self.trace_line(format!("[{:>10}] tid={} block", self.clock, tid));
            if let Some(result) = result {
                self.apply_dispatch(result);
            }
        } else {
            if worker_gen != gen {
                return;
            }
            if self.sched.thread_state(tid) != Some(ThreadState::Running) {
                return;
            }
            let result = self.sched.thread_block(tid, self.clock);
            self.trace_line(format!("[{:>10}] tid={} block", self.clock, tid));
            let sleep = self.rng.sample_us(profile.mean_sleep_us);
            self.schedule(self.clock + sleep, EventKind::Wakeup, Some(tid), 0);
            if let Some(result) = result {
                self.apply_dispatch(result);
            }
        }
    }

    fn handle_quantum_expire(&mut self, tid: Tid, gen: u64) {
        let Some(worker) = self.workers.get(&tid) else {
            return;
        };
        if worker.gen != gen {
            return;
        }
        let Some(processor) = self.sched.running_on(tid) else {
            return;
        };
        let result = self.sched.thread_quantum_expire(processor, self.clock);
        self.trace_line(format!(
            "[{:>10}] cpu{} quantum tid={}",
            self.clock, processor, tid
        ));
        self.apply_dispatch(result);
    }

    fn handle_sched_tick(&mut self) {
        self.sched.sched_tick(self.clock);
        self.trace_line(format!("[{:>10}] tick", self.clock));
        let interval = self.sched.config().sched_tick_interval_us;
        self.schedule(self.clock + interval, EventKind::SchedTick, None, 0);
    }

    /// Select/dispatch pass on a processor the preemption check singled
    /// out, then schedule the consequences.
    fn handle_preemption(&mut self, processor: ProcessorId) {
        let result = self.sched.preempt(processor, self.clock);
        self.apply_dispatch(result);
    }

    // ------------------------------------------------------------------
    // Dispatch consequences
    // ------------------------------------------------------------------

    fn apply_dispatch(&mut self, result: DispatchResult) {
        if let Some(old) = result.descheduled {
            self.note_off_cpu(old);
        }
        match result.dispatched {
            Some(tid) => {
                if result.kept_prev {
                    self.note_off_cpu(tid);
                }
                self.schedule_run_events(tid);
                let pri = self.sched.thread_sched_pri(tid).unwrap_or(-1);
                self.trace_line(format!(
                    "[{:>10}] cpu{} run tid={} pri={}",
                    self.clock, result.processor, tid, pri
                ));
            }
            None => {
                self.trace_line(format!("[{:>10}] cpu{} idle", self.clock, result.processor));
            }
        }
    }

    /// Fold the just-finished run segment into the worker's burst
    /// bookkeeping and invalidate its scheduled events.
    fn note_off_cpu(&mut self, tid: Tid) {
        let cpu = self.sched.thread_cpu(tid);
        let Some(worker) = self.workers.get_mut(&tid) else {
            return;
        };
        worker.gen = worker.gen.wrapping_add(1);
        if worker.profile.policy != SchedPolicy::Realtime {
            let ran = cpu.saturating_sub(worker.cpu_at_dispatch);
            worker.burst_remaining = worker.burst_remaining.saturating_sub(ran);
            worker.cpu_at_dispatch = cpu;
        }
    }

    /// Schedule the event that ends the thread's new run segment: the
    /// burst completing, or the quantum expiring first.
    fn schedule_run_events(&mut self, tid: Tid) {
        let quantum = self.sched.quantum_remaining(tid);
        let cpu = self.sched.thread_cpu(tid);
        let (kind, delay, gen) = {
            let worker = self.workers.get_mut(&tid).expect("dispatched unknown tid");
            worker.gen = worker.gen.wrapping_add(1);
            worker.cpu_at_dispatch = cpu;
            if worker.profile.policy == SchedPolicy::Realtime {
                // The burst-end block is already on the heap; only the
                // quantum needs watching.
                (EventKind::QuantumExpire, quantum, worker.gen)
            } else {
                if worker.burst_remaining == 0 {
                    worker.burst_remaining = 1;
                }
                if worker.burst_remaining <= quantum {
                    (EventKind::Block, worker.burst_remaining, worker.gen)
                } else {
                    (EventKind::QuantumExpire, quantum, worker.gen)
                }
            }
        };
        self.schedule(self.clock + delay, kind, Some(tid), gen);
    }

    fn bump_gen(&mut self, tid: Tid) {
        if let Some(worker) = self.workers.get_mut(&tid) {
            worker.gen = worker.gen.wrapping_add(1);
        }
    }
}
