//! The scheduler core: owns all state and implements the entry points.
//!
//! Everything mutable lives in one owned `Scheduler` passed explicitly to
//! each entry point. Threads, groups, bucket groups, and processors sit in
//! arenas; cross-references are stable indices, never pointers.

use std::collections::BTreeSet;

use hashbrown::HashMap;
use log::{debug, trace, warn};

use clutch_api::{
    Error, GroupId, Pri, ProcessorId, ProcessorSnapshot, QosBucket, Result, RootBucketSnapshot,
    RtParams, SchedPolicy, SchedulerSnapshot, SetrunFlags, SimTime, StatsCounters, ThreadSnapshot,
    ThreadState, Tid, BASEPRI_RTQUEUES, BASEPRI_USER_INITIATED, MAXPRI, MINPRI, NOPRI,
};

use crate::group::{ClutchBucketGroup, ThreadGroup};
use crate::processor::{ProcState, Processor};
use crate::root::{ClutchRoot, ServiceKind};
use crate::rt::RtQueue;
use crate::thread::{RunLocation, Thread};
use crate::timeshare::{
    age_usage, compute_sched_pri, pri_shift_for_load, DEFAULT_QUANTUM_US, PRI_SHIFT_PINNED,
    SCHED_TICK_INTERVAL_US, STARVATION_THRESHOLD_US,
};

/// Highest base priority accepted for fixed-priority threads; the band
/// above is reserved for real-time threads.
const MAXPRI_FIXPRI: Pri = BASEPRI_RTQUEUES - 1;
/// Highest base priority accepted for timeshare threads.
const MAXPRI_TIMESHARE: Pri = 63;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Number of logical processors
    pub cpus: usize,
    /// Scheduling quantum in microseconds
    pub quantum_us: u64,
    /// Strict real-time priority: ignore deadlines between RT bands
    pub strict_rt: bool,
    /// Maintenance tick interval in microseconds
    pub sched_tick_interval_us: u64,
    /// Root-bucket starvation threshold in microseconds
    pub starvation_threshold_us: u64,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            quantum_us: DEFAULT_QUANTUM_US,
            strict_rt: false,
            sched_tick_interval_us: SCHED_TICK_INTERVAL_US,
            starvation_threshold_us: STARVATION_THRESHOLD_US,
        }
    }
}

/// Outcome of a select/dispatch pass on one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchResult {
    pub processor: ProcessorId,
    /// Thread now installed on the processor, if any
    pub dispatched: Option<Tid>,
    /// True when the previously running thread kept the processor
    pub kept_prev: bool,
    /// Thread that lost the processor (re-enqueued or blocked)
    pub descheduled: Option<Tid>,
}

/// The scheduler.
pub struct Scheduler {
    config: SchedConfig,
    threads: Vec<Thread>,
    tid_map: HashMap<Tid, usize>,
    groups: Vec<ThreadGroup>,
    group_map: HashMap<GroupId, usize>,
    bucket_groups: Vec<ClutchBucketGroup>,
    root: ClutchRoot,
    rt_queue: RtQueue,
    processors: Vec<Processor>,
    stats: StatsCounters,
    /// Maintenance ticks elapsed; drives usage aging stamps
    tick_count: u64,
    rt_seq: u64,
}

impl Scheduler {
    pub fn new(config: SchedConfig) -> Result<Self> {
        if config.cpus == 0 {
            return Err(Error::ConfigError("at least one processor required".into()));
        }
        if config.quantum_us == 0 {
            return Err(Error::ConfigError("quantum must be positive".into()));
        }
        let processors = (0..config.cpus).map(Processor::new).collect();
        Ok(Self {
            config,
            threads: Vec::new(),
            tid_map: HashMap::new(),
            groups: Vec::new(),
            group_map: HashMap::new(),
            bucket_groups: Vec::new(),
            root: ClutchRoot::new(),
            rt_queue: RtQueue::new(),
            processors,
            stats: StatsCounters::default(),
            tick_count: 0,
            rt_seq: 0,
        })
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn stats(&self) -> &StatsCounters {
        &self.stats
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    pub fn processor_is_idle(&self, id: ProcessorId) -> bool {
        self.processors[id].is_idle()
    }

    pub fn thread_state(&self, tid: Tid) -> Option<ThreadState> {
        self.tid_map.get(&tid).map(|&ix| self.threads[ix].state)
    }

    /// Total CPU consumed by a thread, microseconds. Zero for unknown tids.
    pub fn thread_cpu(&self, tid: Tid) -> u64 {
        self.tid_map
            .get(&tid)
            .map(|&ix| self.threads[ix].cpu_usage)
            .unwrap_or(0)
    }

    pub fn thread_sched_pri(&self, tid: Tid) -> Option<Pri> {
        self.tid_map.get(&tid).map(|&ix| self.threads[ix].sched_pri)
    }

    pub fn running_on(&self, tid: Tid) -> Option<ProcessorId> {
        self.tid_map.get(&tid).and_then(|&ix| self.threads[ix].running_on)
    }

    pub fn quantum_remaining(&self, tid: Tid) -> u64 {
        self.tid_map
            .get(&tid)
            .map(|&ix| self.threads[ix].quantum_remaining)
            .unwrap_or(0)
    }

    pub fn rt_params(&self, tid: Tid) -> Option<RtParams> {
        self.tid_map.get(&tid).and_then(|&ix| self.threads[ix].rt)
    }

    // ------------------------------------------------------------------
    // Adapter surface: quiescent mutations
    // ------------------------------------------------------------------

    /// Create a thread group with its six bucket groups.
    pub fn create_thread_group(&mut self, id: GroupId) -> Result<()> {
        if self.group_map.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("thread group {}", id)));
        }
        let group_idx = self.groups.len();
        let initial_shift = pri_shift_for_load(0, self.config.cpus);
        let mut bucket_groups = [0usize; QosBucket::COUNT];
        for band in QosBucket::ALL {
            let cbg_idx = self.bucket_groups.len();
            self.bucket_groups
                .push(ClutchBucketGroup::new(group_idx, band, initial_shift));
            bucket_groups[band.index()] = cbg_idx;
        }
        self.groups.push(ThreadGroup {
            id,
            bucket_groups,
            threads: BTreeSet::new(),
        });
        self.group_map.insert(id, group_idx);
        Ok(())
    }

    /// Create a thread in `Waiting` state.
    pub fn create_thread(
        &mut self,
        tid: Tid,
        group_id: GroupId,
        policy: SchedPolicy,
        base_pri: Pri,
        rt: Option<RtParams>,
        bound_processor: Option<ProcessorId>,
    ) -> Result<()> {
        if self.tid_map.contains_key(&tid) {
            return Err(Error::AlreadyExists(format!("thread {}", tid)));
        }
        let &group_idx = self
            .group_map
            .get(&group_id)
            .ok_or_else(|| Error::NotFound(format!("thread group {}", group_id)))?;
        if let Some(p) = bound_processor {
            if p >= self.processors.len() {
                return Err(Error::InvalidArgument(format!("processor {}", p)));
            }
        }
        let sched_bucket = match policy {
            SchedPolicy::Timeshare => {
                if !(MINPRI..=MAXPRI_TIMESHARE).contains(&base_pri) {
                    return Err(Error::InvalidArgument(format!(
                        "timeshare base_pri {} outside {}..={}",
                        base_pri, MINPRI, MAXPRI_TIMESHARE
                    )));
                }
                Some(QosBucket::from_base_pri(base_pri))
            }
            SchedPolicy::Fixpri => {
                // The fixed-priority lane sits above the user-initiated
                // timeshare band by definition.
                if !((BASEPRI_USER_INITIATED + 1)..=MAXPRI_FIXPRI).contains(&base_pri) {
                    return Err(Error::InvalidArgument(format!(
                        "fixpri base_pri {} outside {}..={}",
                        base_pri,
                        BASEPRI_USER_INITIATED + 1,
                        MAXPRI_FIXPRI
                    )));
                }
                Some(QosBucket::Fixpri)
            }
            SchedPolicy::Realtime => {
                if !(BASEPRI_RTQUEUES..=MAXPRI).contains(&base_pri) {
                    return Err(Error::InvalidArgument(format!(
                        "realtime base_pri {} outside {}..={}",
                        base_pri, BASEPRI_RTQUEUES, MAXPRI
                    )));
                }
                let params = rt.ok_or_else(|| {
                    Error::InvalidArgument("realtime thread requires rt params".into())
                })?;
                params.validate()?;
                None
            }
        };
        if policy != SchedPolicy::Realtime && rt.is_some() {
            return Err(Error::InvalidArgument(
                "rt params on a non-realtime thread".into(),
            ));
        }

        let pri_shift = if bound_processor.is_some() {
            PRI_SHIFT_PINNED
        } else {
            pri_shift_for_load(0, self.config.cpus)
        };
        let tix = self.threads.len();
        self.threads.push(Thread {
            tid,
            group: group_idx,
            policy,
            base_pri,
            sched_pri: base_pri,
            state: ThreadState::Waiting,
            sched_bucket,
            bound_processor,
            cpu_usage: 0,
            sched_usage: 0,
            pri_shift,
            quantum_base: self.config.quantum_us,
            quantum_remaining: 0,
            first_timeslice: false,
            rt,
            rt_deadline: None,
            last_made_runnable_time: 0,
            sched_stamp: self.tick_count,
            computation_epoch: 0,
            running_on: None,
            location: RunLocation::None,
            run_count: 0,
            deadline_misses: 0,
        });
        self.tid_map.insert(tid, tix);
        self.groups[group_idx].threads.insert(tid);
        Ok(())
    }

    /// Terminate a thread. Quiescent: a running thread's processor goes
    /// idle and is re-filled by the next event that touches it.
    pub fn terminate_thread(&mut self, tid: Tid, now: SimTime) -> Result<()> {
        let &tix = self
            .tid_map
            .get(&tid)
            .ok_or_else(|| Error::NotFound(format!("thread {}", tid)))?;
        match self.threads[tix].state {
            ThreadState::Terminated => return Ok(()),
            ThreadState::Running => {
                let pidx = self.threads[tix].running_on.expect("running thread without processor");
                self.charge_cpu(pidx, now);
                self.mark_unrunnable(tix);
                let proc = &mut self.processors[pidx];
                proc.active_thread = None;
                proc.state = ProcState::Idle;
                proc.current_pri = NOPRI;
            }
            ThreadState::Runnable => {
                self.dequeue_thread(tix);
                self.mark_unrunnable(tix);
            }
            ThreadState::Waiting => {}
        }
        let t = &mut self.threads[tix];
        t.state = ThreadState::Terminated;
        t.running_on = None;
        t.rt_deadline = None;
        let group = t.group;
        self.groups[group].threads.remove(&tid);
        debug!("tid={} terminated at {}", tid, now);
        Ok(())
    }

    /// Move a timeshare thread to another QoS band of its group.
    pub fn set_thread_urgency(&mut self, tid: Tid, band: QosBucket, now: SimTime) -> Result<()> {
        let &tix = self
            .tid_map
            .get(&tid)
            .ok_or_else(|| Error::NotFound(format!("thread {}", tid)))?;
        if self.threads[tix].policy != SchedPolicy::Timeshare {
            return Err(Error::InvalidState(
                "urgency applies to timeshare threads only".into(),
            ));
        }
        if band == QosBucket::Fixpri {
            return Err(Error::InvalidArgument(
                "timeshare threads cannot enter the fixpri band".into(),
            ));
        }
        if self.threads[tix].sched_bucket == Some(band) {
            return Ok(());
        }

        let was_enqueued = matches!(self.threads[tix].location, RunLocation::Clutch(_));
        if was_enqueued {
            self.dequeue_thread(tix);
        }
        if self.threads[tix].in_hierarchy() && self.threads[tix].is_active() {
            // Move the runnable accounting between bucket groups.
            self.mark_unrunnable(tix);
            self.threads[tix].sched_bucket = Some(band);
            self.mark_runnable(tix);
        } else {
            self.threads[tix].sched_bucket = Some(band);
        }
        if was_enqueued {
            self.enqueue_thread(tix, now, SetrunFlags::empty());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Wake a thread. Idempotent for threads that are already runnable,
    /// running, or terminated. Returns a processor worth a
    /// select/dispatch pass, if the preemption check found one.
    pub fn thread_wakeup(&mut self, tid: Tid, now: SimTime) -> Option<ProcessorId> {
        let &tix = self.tid_map.get(&tid)?;
        match self.threads[tix].state {
            ThreadState::Waiting => {
                self.stats.wakeups += 1;
                trace!("tid={} wakeup at {}", tid, now);
                self.thread_setrun(tix, now, SetrunFlags::PREEMPT | SetrunFlags::HEADQ)
            }
            // Redundant wakeups and events aimed at dead threads are
            // silently dropped.
            _ => None,
        }
    }

    /// Start a real-time activation: stamp the deadline and make the
    /// thread runnable if it was waiting.
    pub fn rt_activate(&mut self, tid: Tid, now: SimTime) -> Option<ProcessorId> {
        let &tix = self.tid_map.get(&tid)?;
        let params = self.threads[tix]
            .rt
            .expect("rt activation on a non-realtime thread");
        let deadline = now + params.constraint_us;
        match self.threads[tix].state {
            ThreadState::Terminated => None,
            ThreadState::Waiting => {
                self.threads[tix].rt_deadline = Some(deadline);
                self.stats.wakeups += 1;
                trace!("tid={} rt activation at {} deadline {}", tid, now, deadline);
                self.thread_setrun(tix, now, SetrunFlags::PREEMPT | SetrunFlags::HEADQ)
            }
            ThreadState::Runnable => {
                // Previous activation still queued; refresh its deadline.
                if self.threads[tix].location == RunLocation::RtQueue {
                    let pri = self.threads[tix].sched_pri;
                    self.rt_queue.remove(tid);
                    self.rt_seq += 1;
                    self.rt_queue.insert(tid, pri, deadline, self.rt_seq);
                }
                self.threads[tix].rt_deadline = Some(deadline);
                None
            }
            ThreadState::Running => {
                self.threads[tix].rt_deadline = Some(deadline);
                None
            }
        }
    }

    /// Record a missed real-time deadline. Reported, never recovered.
    pub fn record_rt_miss(&mut self, tid: Tid, now: SimTime) {
        if let Some(&tix) = self.tid_map.get(&tid) {
            self.threads[tix].deadline_misses += 1;
            self.stats.rt_deadline_misses += 1;
            warn!("tid={} missed rt deadline at {}", tid, now);
        }
    }

    /// Block a thread.
    ///
    /// A running thread is charged, moved to `Waiting`, and its processor
    /// re-selected (the result describes the replacement dispatch). A
    /// runnable thread is dequeued and parked; already-waiting or
    /// terminated threads are left alone.
    pub fn thread_block(&mut self, tid: Tid, now: SimTime) -> Option<DispatchResult> {
        let &tix = self.tid_map.get(&tid)?;
        match self.threads[tix].state {
            ThreadState::Waiting | ThreadState::Terminated => None,
            ThreadState::Running => {
                let pidx = self.threads[tix].running_on.expect("running thread without processor");
                self.charge_cpu(pidx, now);
                self.stats.blocks += 1;
                self.mark_unrunnable(tix);
                {
                    let t = &mut self.threads[tix];
                    t.state = ThreadState::Waiting;
                    t.running_on = None;
                    t.rt_deadline = None;
                    t.quantum_remaining = 0;
                }
                self.processors[pidx].active_thread = None;
                trace!("tid={} block at {}", tid, now);

                let (sel, _) = self.thread_select(pidx, now, None);
                let result = match sel {
                    Some(nix) => {
                        self.dispatch(pidx, nix, now, true);
                        DispatchResult {
                            processor: pidx,
                            dispatched: Some(self.threads[nix].tid),
                            kept_prev: false,
                            descheduled: Some(tid),
                        }
                    }
                    None => {
                        self.make_idle(pidx);
                        DispatchResult {
                            processor: pidx,
                            dispatched: None,
                            kept_prev: false,
                            descheduled: Some(tid),
                        }
                    }
                };
                Some(result)
            }
            ThreadState::Runnable => {
                // Burst ended before the thread ever reached a processor.
                self.stats.blocks += 1;
                self.dequeue_thread(tix);
                self.mark_unrunnable(tix);
                let t = &mut self.threads[tix];
                t.state = ThreadState::Waiting;
                t.rt_deadline = None;
                t.quantum_remaining = 0;
                trace!("tid={} block off-queue at {}", tid, now);
                None
            }
        }
    }

    /// Handle a quantum expiration on a processor.
    pub fn thread_quantum_expire(&mut self, pidx: ProcessorId, now: SimTime) -> DispatchResult {
        self.stats.quantum_expires += 1;
        let old_tid = self.processors[pidx]
            .active_thread
            .expect("quantum expire on an idle processor");
        let oix = self.tid_map[&old_tid];
        self.charge_cpu(pidx, now);
        {
            let t = &mut self.threads[oix];
            t.first_timeslice = false;
            t.quantum_remaining = 0;
            t.state = ThreadState::Runnable;
            t.running_on = None;
        }
        if self.threads[oix].policy == SchedPolicy::Timeshare {
            self.timeshare_update(oix);
        }
        trace!("tid={} quantum expire on cpu{} at {}", old_tid, pidx, now);

        let (sel, chose_prev) = self.thread_select(pidx, now, Some(oix));
        match sel {
            Some(nix) if chose_prev => {
                // Continuation: same thread, fresh quantum.
                self.dispatch(pidx, nix, now, true);
                DispatchResult {
                    processor: pidx,
                    dispatched: Some(old_tid),
                    kept_prev: true,
                    descheduled: None,
                }
            }
            Some(nix) => {
                // Expired threads go to the tail of their band.
                self.enqueue_thread(oix, now, SetrunFlags::TAILQ);
                self.dispatch(pidx, nix, now, true);
                DispatchResult {
                    processor: pidx,
                    dispatched: Some(self.threads[nix].tid),
                    kept_prev: false,
                    descheduled: Some(old_tid),
                }
            }
            None => unreachable!("select dropped a runnable prev thread"),
        }
    }

    /// Select/dispatch pass on a processor, used after a preemption check
    /// returns a target or a quiescent mutation leaves a processor idle.
    pub fn preempt(&mut self, pidx: ProcessorId, now: SimTime) -> DispatchResult {
        let old = self.processors[pidx].active_thread;
        let Some(old_tid) = old else {
            let (sel, _) = self.thread_select(pidx, now, None);
            return match sel {
                Some(nix) => {
                    self.dispatch(pidx, nix, now, true);
                    DispatchResult {
                        processor: pidx,
                        dispatched: Some(self.threads[nix].tid),
                        kept_prev: false,
                        descheduled: None,
                    }
                }
                None => {
                    self.make_idle(pidx);
                    DispatchResult {
                        processor: pidx,
                        dispatched: None,
                        kept_prev: false,
                        descheduled: None,
                    }
                }
            };
        };

        let oix = self.tid_map[&old_tid];
        self.charge_cpu(pidx, now);
        {
            let t = &mut self.threads[oix];
            t.state = ThreadState::Runnable;
            t.running_on = None;
        }
        let (sel, chose_prev) = self.thread_select(pidx, now, Some(oix));
        match sel {
            Some(nix) if chose_prev => {
                // The incumbent survives mid-quantum; nothing is refreshed.
                self.dispatch(pidx, nix, now, false);
                DispatchResult {
                    processor: pidx,
                    dispatched: Some(old_tid),
                    kept_prev: true,
                    descheduled: None,
                }
            }
            Some(nix) => {
                // Preempted threads keep their remaining quantum and
                // re-enter at the head of their band.
                self.enqueue_thread(oix, now, SetrunFlags::HEADQ);
                self.dispatch(pidx, nix, now, true);
                DispatchResult {
                    processor: pidx,
                    dispatched: Some(self.threads[nix].tid),
                    kept_prev: false,
                    descheduled: Some(old_tid),
                }
            }
            None => unreachable!("select dropped a runnable prev thread"),
        }
    }

    /// Periodic maintenance: refresh bucket-group loads and priority
    /// shifts, age timeshare usage, recompute priorities.
    pub fn sched_tick(&mut self, now: SimTime) {
        self.stats.sched_ticks += 1;
        self.tick_count += 1;

        // Charge running threads so decay sees up-to-date usage.
        for pidx in 0..self.processors.len() {
            self.charge_cpu(pidx, now);
        }

        let cpus = self.config.cpus;
        for cbg in &mut self.bucket_groups {
            cbg.load_avg = (cbg.load_avg * 3 + cbg.runnable_count) / 4;
            cbg.pri_shift = pri_shift_for_load(cbg.load_avg, cpus);
        }

        // Deterministic sweep: bucket groups in arena order, member
        // threads by tid.
        let mut members: Vec<usize> = Vec::new();
        for cbg in &self.bucket_groups {
            for &tid in &cbg.timeshare_threads {
                members.push(self.tid_map[&tid]);
            }
        }
        for tix in members {
            self.timeshare_update(tix);
        }
    }

    /// Charge all running threads up to `now`; used at simulation end and
    /// before taking snapshots so accounting is exact.
    pub fn settle(&mut self, now: SimTime) {
        for pidx in 0..self.processors.len() {
            self.charge_cpu(pidx, now);
        }
    }

    // ------------------------------------------------------------------
    // Setrun and preemption
    // ------------------------------------------------------------------

    /// Make a thread runnable and enqueue it (`state` must not be
    /// `Running`), then run the preemption check.
    fn thread_setrun(
        &mut self,
        tix: usize,
        now: SimTime,
        flags: SetrunFlags,
    ) -> Option<ProcessorId> {
        assert!(
            self.threads[tix].state != ThreadState::Running,
            "setrun of a running thread (tid {})",
            self.threads[tix].tid
        );
        let was_waiting = self.threads[tix].state == ThreadState::Waiting;
        {
            let t = &mut self.threads[tix];
            t.state = ThreadState::Runnable;
            t.last_made_runnable_time = now;
        }
        if was_waiting {
            self.mark_runnable(tix);
        }
        if self.threads[tix].policy == SchedPolicy::Timeshare {
            self.timeshare_update(tix);
        }
        self.enqueue_thread(tix, now, flags);
        self.check_preemption(tix, flags)
    }

    /// Insert a runnable thread into the queue its policy and binding
    /// select. The thread must not be enqueued anywhere.
    fn enqueue_thread(&mut self, tix: usize, now: SimTime, flags: SetrunFlags) {
        debug_assert_eq!(self.threads[tix].location, RunLocation::None);
        debug_assert_eq!(self.threads[tix].state, ThreadState::Runnable);
        let head = flags.contains(SetrunFlags::HEADQ) && !flags.contains(SetrunFlags::TAILQ);
        let (tid, pri) = (self.threads[tix].tid, self.threads[tix].sched_pri);

        if self.threads[tix].policy == SchedPolicy::Realtime {
            if self.threads[tix].rt_deadline.is_none() {
                let constraint = self.threads[tix].rt.expect("rt thread without params").constraint_us;
                self.threads[tix].rt_deadline = Some(now + constraint);
            }
            if let Some(p) = self.threads[tix].bound_processor {
                let runq = &mut self.processors[p].bound_runq;
                if head {
                    runq.push_head(pri, tid);
                } else {
                    runq.push_tail(pri, tid);
                }
                self.threads[tix].location = RunLocation::Bound(p);
            } else {
                let deadline = self.threads[tix].rt_deadline.unwrap();
                self.rt_seq += 1;
                self.rt_queue.insert(tid, pri, deadline, self.rt_seq);
                self.threads[tix].location = RunLocation::RtQueue;
            }
        } else if let Some(p) = self.threads[tix].bound_processor {
            let runq = &mut self.processors[p].bound_runq;
            if head {
                runq.push_head(pri, tid);
            } else {
                runq.push_tail(pri, tid);
            }
            self.threads[tix].location = RunLocation::Bound(p);
        } else {
            let band = self.threads[tix].sched_bucket.expect("hierarchy thread without band");
            let cbg_idx = self.groups[self.threads[tix].group].bucket_groups[band.index()];
            let cbg = &mut self.bucket_groups[cbg_idx];
            if head {
                cbg.bucket.runq.push_head(pri, tid);
            } else {
                cbg.bucket.runq.push_tail(pri, tid);
            }
            if !cbg.in_root_fifo {
                cbg.in_root_fifo = true;
                self.root.insert_bucket_group(band, cbg_idx, now);
            }
            self.threads[tix].location = RunLocation::Clutch(cbg_idx);
        }
    }

    /// Remove a thread from whichever queue holds it.
    fn dequeue_thread(&mut self, tix: usize) {
        let (tid, pri) = (self.threads[tix].tid, self.threads[tix].sched_pri);
        match self.threads[tix].location {
            RunLocation::None => {}
            RunLocation::RtQueue => {
                self.rt_queue.remove(tid);
            }
            RunLocation::Bound(p) => {
                self.processors[p].bound_runq.remove(pri, tid);
            }
            RunLocation::Clutch(cbg_idx) => {
                let cbg = &mut self.bucket_groups[cbg_idx];
                cbg.bucket.runq.remove(pri, tid);
                if cbg.bucket.runq.is_empty() && cbg.in_root_fifo {
                    cbg.in_root_fifo = false;
                    self.root.remove_bucket_group(cbg.band, cbg_idx);
                }
            }
        }
        self.threads[tix].location = RunLocation::None;
    }

    /// Preemption check after setrun: find the processor the new thread
    /// should take, if any.
    fn check_preemption(&mut self, tix: usize, flags: SetrunFlags) -> Option<ProcessorId> {
        let t = &self.threads[tix];
        let pri = t.sched_pri;
        let is_rt = t.policy == SchedPolicy::Realtime;
        let deadline = t.rt_deadline;

        // Bound threads only ever contend for their own processor.
        if let Some(bp) = t.bound_processor {
            if self.processors[bp].is_idle() {
                return Some(bp);
            }
            let cur_tid = self.processors[bp].active_thread.expect("busy processor without thread");
            let cur = &self.threads[self.tid_map[&cur_tid]];
            if self.beats(pri, is_rt, deadline, cur, flags) {
                self.stats.preemptions += 1;
                return Some(bp);
            }
            return None;
        }

        // Dispatching to an idle processor always wins.
        if let Some(p) = self.processors.iter().find(|p| p.is_idle()) {
            return Some(p.id);
        }

        // Pick the weakest incumbent and see whether the new thread beats
        // it: non-RT incumbents first (lowest current_pri), then RT ones
        // (lowest priority, then latest deadline).
        let mut victim: Option<(ProcessorId, usize)> = None;
        for proc in &self.processors {
            let cur_tid = proc.active_thread.expect("busy processor without thread");
            let cix = self.tid_map[&cur_tid];
            let better = match victim {
                None => true,
                Some((_, vix)) => {
                    let v = &self.threads[vix];
                    let c = &self.threads[cix];
                    let v_rt = v.policy == SchedPolicy::Realtime;
                    let c_rt = c.policy == SchedPolicy::Realtime;
                    if v_rt != c_rt {
                        // A non-RT incumbent is always the weaker victim.
                        !c_rt
                    } else if c.sched_pri != v.sched_pri {
                        c.sched_pri < v.sched_pri
                    } else if c_rt {
                        c.rt_deadline > v.rt_deadline
                    } else {
                        false
                    }
                }
            };
            if better {
                victim = Some((proc.id, cix));
            }
        }
        let (vid, vix) = victim?;
        let cur = &self.threads[vix];
        if self.beats(pri, is_rt, deadline, cur, flags) {
            self.stats.preemptions += 1;
            Some(vid)
        } else {
            None
        }
    }

    /// Whether a candidate (pri, policy, deadline) preempts the incumbent.
    fn beats(
        &self,
        pri: Pri,
        is_rt: bool,
        deadline: Option<SimTime>,
        cur: &Thread,
        flags: SetrunFlags,
    ) -> bool {
        let cur_rt = cur.policy == SchedPolicy::Realtime;
        if is_rt && !cur_rt {
            return true;
        }
        if is_rt && cur_rt {
            if pri > cur.sched_pri {
                return true;
            }
            return !self.config.strict_rt && pri == cur.sched_pri && deadline < cur.rt_deadline;
        }
        if !is_rt && cur_rt {
            return false;
        }
        pri > cur.sched_pri || (flags.contains(SetrunFlags::PREEMPT) && pri == cur.sched_pri)
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// Choose the next thread for a processor. `prev`, when given, is the
    /// thread that just ran: runnable but not enqueued anywhere. Returns
    /// the chosen thread (dequeued if it came from a queue) and whether it
    /// is `prev`.
    fn thread_select(
        &mut self,
        pidx: ProcessorId,
        now: SimTime,
        prev: Option<usize>,
    ) -> (Option<usize>, bool) {
        // An unbound real-time incumbent keeps the processor while it
        // can; bound RT threads contend through the bound runqueue below.
        if let Some(pi) = prev {
            if self.threads[pi].policy == SchedPolicy::Realtime
                && self.threads[pi].bound_processor.is_none()
                && self.rt_can_continue(pi, now)
            {
                return (Some(pi), true);
            }
        }

        // The real-time queue outranks everything below it.
        if !self.rt_queue.is_empty() {
            let nix = self.rt_dequeue_best(now);
            return (Some(nix), false);
        }

        let proc_head_pri = self.processors[pidx].bound_runq.highest_pri();
        let prev_bound_here =
            prev.filter(|&pi| self.threads[pi].bound_processor == Some(pidx));
        let mut bound_pri = proc_head_pri;
        if let Some(pi) = prev_bound_here {
            bound_pri = bound_pri.max(self.threads[pi].sched_pri);
        }

        let prev_hier = prev.filter(|&pi| self.threads[pi].in_hierarchy());
        let prev_first = prev
            .map(|pi| self.threads[pi].first_timeslice)
            .unwrap_or(false);
        let mut clutch_pri = self.root.scr_priority(&self.bucket_groups);
        if let Some(pi) = prev_hier {
            clutch_pri = clutch_pri.max(self.threads[pi].sched_pri);
        }

        if clutch_pri != NOPRI && clutch_pri > bound_pri {
            let (sel, chose_prev) = self.hierarchy_thread_highest(now, prev_hier, prev_first);
            if sel.is_some() {
                return (sel, chose_prev);
            }
        }

        if bound_pri != NOPRI {
            if let Some(pi) = prev_bound_here {
                let p = self.threads[pi].sched_pri;
                if p > proc_head_pri
                    || (p == proc_head_pri && self.threads[pi].first_timeslice)
                    || proc_head_pri == NOPRI
                {
                    return (Some(pi), true);
                }
            }
            if proc_head_pri != NOPRI {
                let (_, tid) = self.processors[pidx].bound_runq.pop_max().unwrap();
                let nix = self.tid_map[&tid];
                self.threads[nix].location = RunLocation::None;
                return (Some(nix), false);
            }
        }

        if let Some(pi) = prev {
            return (Some(pi), true);
        }
        (None, false)
    }

    /// Whether a running RT thread may keep its processor.
    fn rt_can_continue(&self, pi: usize, now: SimTime) -> bool {
        let t = &self.threads[pi];
        let deadline = match t.rt_deadline {
            Some(d) if d > now => d,
            // Deadline expired: the thread no longer outranks the queue.
            _ => return false,
        };
        let Some(head) = self.rt_queue.peek() else {
            return true;
        };
        if head.pri > t.sched_pri {
            return false;
        }
        if self.config.strict_rt {
            return true;
        }
        if head.pri == t.sched_pri && head.deadline < deadline {
            return false;
        }
        // A queued lower-priority thread with an earlier deadline wins
        // only when it can finish without pushing the incumbent past its
        // own deadline.
        let my_comp = t.rt.map(|p| p.computation_us).unwrap_or(0);
        for entry in self.rt_queue.iter() {
            if entry.deadline < deadline {
                let cand_comp = self
                    .rt_params(entry.tid)
                    .map(|p| p.computation_us)
                    .unwrap_or(0);
                if now + cand_comp + my_comp <= deadline {
                    return false;
                }
            }
        }
        true
    }

    /// Dequeue the RT thread to run next. In strict mode the queue head;
    /// otherwise an earlier-deadline, lower-priority thread may win when
    /// constraint-safety holds against the head.
    fn rt_dequeue_best(&mut self, now: SimTime) -> usize {
        let head = *self.rt_queue.peek().expect("rt dequeue from empty queue");
        let mut chosen = head;
        if !self.config.strict_rt {
            let head_comp = self
                .rt_params(head.tid)
                .map(|p| p.computation_us)
                .unwrap_or(0);
            for entry in self.rt_queue.iter() {
                if entry.deadline < chosen.deadline {
                    let cand_comp = self
                        .rt_params(entry.tid)
                        .map(|p| p.computation_us)
                        .unwrap_or(0);
                    if now + cand_comp + head_comp <= head.deadline {
                        chosen = *entry;
                    }
                }
            }
        }
        self.rt_queue.remove(chosen.tid);
        let nix = self.tid_map[&chosen.tid];
        self.threads[nix].location = RunLocation::None;
        nix
    }

    /// Two-phase hierarchy selection: pick the root bucket, then the
    /// thread inside its head clutch bucket.
    fn hierarchy_thread_highest(
        &mut self,
        now: SimTime,
        prev_hier: Option<usize>,
        prev_first: bool,
    ) -> (Option<usize>, bool) {
        let prev_band = prev_hier.map(|pi| {
            self.threads[pi]
                .sched_bucket
                .expect("hierarchy thread without band")
        });
        let Some((band, kind)) = self.highest_root_bucket(now, prev_band) else {
            return (prev_hier, prev_hier.is_some());
        };
        self.root.bucket_mut(band).serviced(kind, now);
        match kind {
            ServiceKind::Warp => self.stats.root_warp_selections += 1,
            ServiceKind::Starvation => self.stats.root_starvation_selections += 1,
            _ => {}
        }
        trace!("root bucket {} served via {:?} at {}", band.label(), kind, now);

        let head_cbg = self.root.bucket(band).fifo_head();
        let top = head_cbg.and_then(|c| self.bucket_groups[c].bucket.runq.peek_max());

        if let Some(pi) = prev_hier {
            if prev_band == Some(band) {
                let ppri = self.threads[pi].sched_pri;
                let prev_cbg = self.groups[self.threads[pi].group].bucket_groups[band.index()];
                let prev_wins = match top {
                    None => true,
                    Some((tpri, _)) => {
                        ppri > tpri
                            || (ppri == tpri && Some(prev_cbg) == head_cbg && prev_first)
                    }
                };
                if prev_wins {
                    return (Some(pi), true);
                }
            }
        }

        let cbg_idx = head_cbg.expect("selected root bucket with empty fifo");
        let (_, tid) = self.bucket_groups[cbg_idx]
            .bucket
            .runq
            .pop_max()
            .expect("runnable clutch bucket with empty runq");
        let nix = self.tid_map[&tid];
        self.threads[nix].location = RunLocation::None;
        let still_runnable = !self.bucket_groups[cbg_idx].bucket.runq.is_empty();
        if !still_runnable {
            self.bucket_groups[cbg_idx].in_root_fifo = false;
        }
        self.root.rotate_bucket_group(band, cbg_idx, still_runnable);
        (Some(nix), false)
    }

    /// Root-bucket phase: fixed-priority lane first, then starvation
    /// avoidance, then warp, then EDF.
    fn highest_root_bucket(
        &self,
        now: SimTime,
        prev_band: Option<QosBucket>,
    ) -> Option<(QosBucket, ServiceKind)> {
        let runnable =
            |band: QosBucket| self.root.is_band_runnable(band) || prev_band == Some(band);

        if runnable(QosBucket::Fixpri) {
            return Some((QosBucket::Fixpri, ServiceKind::Fixpri));
        }

        let timeshare_bands = &QosBucket::ALL[1..];

        let mut edf: Option<QosBucket> = None;
        for &band in timeshare_bands {
            if runnable(band) {
                let better = match edf {
                    None => true,
                    Some(cur) => {
                        self.root.bucket(band).deadline < self.root.bucket(cur).deadline
                    }
                };
                if better {
                    edf = Some(band);
                }
            }
        }
        let edf = edf?;

        // A band left runnable but unserved past the threshold outranks
        // both warp and EDF; oldest stamp first.
        let mut starving: Option<QosBucket> = None;
        for &band in timeshare_bands {
            if runnable(band) {
                let age_base = self.root.bucket(band).starvation_ts;
                if now.saturating_sub(age_base) >= self.config.starvation_threshold_us {
                    let older = match starving {
                        None => true,
                        Some(cur) => age_base < self.root.bucket(cur).starvation_ts,
                    };
                    if older {
                        starving = Some(band);
                    }
                }
            }
        }
        if let Some(band) = starving {
            return Some((band, ServiceKind::Starvation));
        }

        // Warp: the highest band above the EDF winner with budget left.
        for &band in &timeshare_bands[..edf.index() - 1] {
            if runnable(band) && self.root.bucket(band).warp_available(now) {
                return Some((band, ServiceKind::Warp));
            }
        }

        Some((edf, ServiceKind::Edf))
    }

    // ------------------------------------------------------------------
    // Dispatch and accounting
    // ------------------------------------------------------------------

    /// Install a thread on a processor. `fresh` grants a new quantum.
    fn dispatch(&mut self, pidx: ProcessorId, tix: usize, now: SimTime, fresh: bool) {
        debug_assert_eq!(self.threads[tix].location, RunLocation::None);
        let (tid, pri) = {
            let t = &mut self.threads[tix];
            debug_assert_eq!(t.state, ThreadState::Runnable);
            t.state = ThreadState::Running;
            t.running_on = Some(pidx);
            // A preempted thread resumes its leftover quantum; a fresh
            // grant happens only once the old one is spent.
            if fresh && t.quantum_remaining == 0 {
                t.quantum_remaining = t.quantum_base;
                t.first_timeslice = true;
            }
            t.computation_epoch = now;
            (t.tid, t.sched_pri)
        };
        let proc = &mut self.processors[pidx];
        let switched = proc.active_thread != Some(tid);
        proc.active_thread = Some(tid);
        proc.state = ProcState::Running;
        proc.current_pri = pri;
        if switched {
            self.stats.context_switches += 1;
            self.threads[tix].run_count += 1;
            debug!("cpu{} dispatch tid={} pri={} at {}", pidx, tid, pri, now);
        }
    }

    fn make_idle(&mut self, pidx: ProcessorId) {
        let proc = &mut self.processors[pidx];
        proc.active_thread = None;
        proc.state = ProcState::Idle;
        proc.current_pri = NOPRI;
        self.stats.idle_dispatches += 1;
    }

    /// Charge the running thread's CPU segment since its computation
    /// epoch. Usage, quantum, processor busy time, and bucket-group CPU
    /// all move together so accounting stays exact.
    fn charge_cpu(&mut self, pidx: ProcessorId, now: SimTime) {
        let Some(tid) = self.processors[pidx].active_thread else {
            return;
        };
        let tix = self.tid_map[&tid];
        let delta = {
            let t = &mut self.threads[tix];
            let delta = now.saturating_sub(t.computation_epoch);
            if delta == 0 {
                return;
            }
            t.cpu_usage += delta;
            if t.pri_shift < PRI_SHIFT_PINNED {
                t.sched_usage += delta;
            }
            t.quantum_remaining = t.quantum_remaining.saturating_sub(delta);
            t.computation_epoch = now;
            delta
        };
        self.processors[pidx].busy_us += delta;
        if self.threads[tix].in_hierarchy() {
            let band = self.threads[tix].sched_bucket.expect("hierarchy thread without band");
            let cbg_idx = self.groups[self.threads[tix].group].bucket_groups[band.index()];
            self.bucket_groups[cbg_idx].cpu_used += delta;
        }
    }

    /// Age usage, refresh the priority shift from the bucket group, and
    /// recompute the effective priority.
    fn timeshare_update(&mut self, tix: usize) {
        let ticks = self.tick_count - self.threads[tix].sched_stamp;
        if ticks > 0 {
            let t = &mut self.threads[tix];
            t.sched_usage = age_usage(t.sched_usage, ticks);
            t.sched_stamp = self.tick_count;
        }
        let shift = if self.threads[tix].bound_processor.is_some() {
            PRI_SHIFT_PINNED
        } else {
            let band = self.threads[tix].sched_bucket.expect("timeshare thread without band");
            let cbg_idx = self.groups[self.threads[tix].group].bucket_groups[band.index()];
            self.bucket_groups[cbg_idx].pri_shift
        };
        self.threads[tix].pri_shift = shift;
        let t = &self.threads[tix];
        let new_pri = compute_sched_pri(t.base_pri, t.sched_usage, t.pri_shift);
        self.set_sched_pri(tix, new_pri);
    }

    /// Update a thread's effective priority, repositioning it in its
    /// runqueue and refreshing its processor's current priority.
    fn set_sched_pri(&mut self, tix: usize, new_pri: Pri) {
        let old_pri = self.threads[tix].sched_pri;
        if new_pri == old_pri {
            return;
        }
        let tid = self.threads[tix].tid;
        match self.threads[tix].location {
            RunLocation::None => {
                if let Some(pidx) = self.threads[tix].running_on {
                    self.processors[pidx].current_pri = new_pri;
                }
            }
            RunLocation::Bound(p) => {
                self.processors[p].bound_runq.reposition(old_pri, new_pri, tid);
            }
            RunLocation::Clutch(cbg_idx) => {
                self.bucket_groups[cbg_idx]
                    .bucket
                    .runq
                    .reposition(old_pri, new_pri, tid);
            }
            // RT priorities are fixed; the queue key never changes.
            RunLocation::RtQueue => {}
        }
        self.threads[tix].sched_pri = new_pri;
    }

    /// Account a waiting thread entering the runnable set.
    fn mark_runnable(&mut self, tix: usize) {
        if !self.threads[tix].in_hierarchy() {
            return;
        }
        let band = self.threads[tix].sched_bucket.expect("hierarchy thread without band");
        let cbg_idx = self.groups[self.threads[tix].group].bucket_groups[band.index()];
        let cbg = &mut self.bucket_groups[cbg_idx];
        cbg.runnable_count += 1;
        if self.threads[tix].policy == SchedPolicy::Timeshare {
            cbg.timeshare_threads.insert(self.threads[tix].tid);
        }
    }

    /// Account a runnable or running thread leaving the runnable set.
    fn mark_unrunnable(&mut self, tix: usize) {
        if !self.threads[tix].in_hierarchy() {
            return;
        }
        let band = self.threads[tix].sched_bucket.expect("hierarchy thread without band");
        let cbg_idx = self.groups[self.threads[tix].group].bucket_groups[band.index()];
        let cbg = &mut self.bucket_groups[cbg_idx];
        cbg.runnable_count = cbg.runnable_count.saturating_sub(1);
        cbg.timeshare_threads.remove(&self.threads[tix].tid);
    }

    // ------------------------------------------------------------------
    // Snapshot and invariants
    // ------------------------------------------------------------------

    /// Serializable view of the whole scheduler at a quiescent point.
    /// Trace lines are attached by the caller that owns them.
    pub fn snapshot(&self, now: SimTime) -> SchedulerSnapshot {
        let mut threads: Vec<ThreadSnapshot> = self
            .threads
            .iter()
            .map(|t| ThreadSnapshot {
                tid: t.tid,
                state: t.state,
                sched_pri: t.sched_pri,
                base_pri: t.base_pri,
                sched_bucket: t.sched_bucket,
                cpu_usage: t.cpu_usage,
                quantum_remaining: t.quantum_remaining,
                quantum_base: t.quantum_base,
                rt_deadline: t.rt_deadline,
                is_active: t.state == ThreadState::Running,
                run_queue_rank: self.run_queue_rank(t),
                run_count: t.run_count,
                deadline_misses: t.deadline_misses,
            })
            .collect();
        threads.sort_by_key(|t| t.tid);

        let root_buckets = QosBucket::ALL
            .iter()
            .map(|&band| {
                let rb = self.root.bucket(band);
                RootBucketSnapshot {
                    band,
                    warp_remaining: rb.warp_remaining,
                    warp_total: band.warp_us(),
                    deadline: rb.deadline,
                    deadline_remaining: rb.deadline as i64 - now as i64,
                    runnable: rb.is_runnable(),
                }
            })
            .collect();

        let processors = self
            .processors
            .iter()
            .map(|p| ProcessorSnapshot {
                id: p.id,
                active_tid: p.active_thread,
                current_pri: p.current_pri,
                busy_us: p.busy_us,
            })
            .collect();

        SchedulerSnapshot {
            time: now,
            threads,
            root_buckets,
            processors,
            stats: self.stats.clone(),
            trace: Vec::new(),
        }
    }

    fn run_queue_rank(&self, t: &Thread) -> Option<usize> {
        match t.location {
            RunLocation::None => None,
            RunLocation::RtQueue => self.rt_queue.rank(t.tid),
            RunLocation::Bound(p) => self.processors[p].bound_runq.rank(t.sched_pri, t.tid),
            RunLocation::Clutch(cbg_idx) => self.bucket_groups[cbg_idx]
                .bucket
                .runq
                .rank(t.sched_pri, t.tid),
        }
    }

    /// Assert the structural invariants. Panics with a diagnostic on any
    /// violation; meant to run between events in tests.
    pub fn verify_integrity(&self) {
        // Processor side: one running thread each, mirrored priority.
        for proc in &self.processors {
            match proc.state {
                ProcState::Running => {
                    let tid = proc.active_thread.expect("running processor without thread");
                    let t = &self.threads[self.tid_map[&tid]];
                    assert_eq!(t.state, ThreadState::Running, "tid {} not running", tid);
                    assert_eq!(t.running_on, Some(proc.id), "tid {} processor mismatch", tid);
                    assert_eq!(
                        proc.current_pri, t.sched_pri,
                        "cpu{} current_pri diverged from tid {}",
                        proc.id, tid
                    );
                    assert_eq!(t.location, RunLocation::None, "running tid {} enqueued", tid);
                }
                ProcState::Idle => {
                    assert!(proc.active_thread.is_none(), "idle cpu{} has a thread", proc.id);
                }
            }
        }

        // Occurrence count of every tid across all queues.
        let mut counts: std::collections::BTreeMap<Tid, usize> = std::collections::BTreeMap::new();
        for entry in self.rt_queue.iter() {
            *counts.entry(entry.tid).or_default() += 1;
        }
        for proc in &self.processors {
            for (_, tid) in proc.bound_runq.iter() {
                *counts.entry(tid).or_default() += 1;
            }
        }
        for cbg in &self.bucket_groups {
            for (_, tid) in cbg.bucket.runq.iter() {
                *counts.entry(tid).or_default() += 1;
            }
        }
        for t in &self.threads {
            let expected = match t.state {
                ThreadState::Runnable => 1,
                _ => 0,
            };
            let actual = counts.get(&t.tid).copied().unwrap_or(0);
            assert_eq!(
                actual, expected,
                "tid {} in {} queues while {:?}",
                t.tid, actual, t.state
            );
            if t.state == ThreadState::Runnable {
                assert_ne!(t.location, RunLocation::None, "runnable tid {} unlocated", t.tid);
            } else {
                assert_eq!(t.location, RunLocation::None, "tid {} stale location", t.tid);
            }
            if t.policy == SchedPolicy::Timeshare {
                assert!(
                    t.sched_pri <= t.base_pri && t.sched_pri >= MINPRI,
                    "tid {} sched_pri {} outside [{}, {}]",
                    t.tid,
                    t.sched_pri,
                    MINPRI,
                    t.base_pri
                );
            }
        }

        // CPU accounting: thread usage and processor busy time advance in
        // lockstep.
        let thread_total: u64 = self.threads.iter().map(|t| t.cpu_usage).sum();
        let proc_total: u64 = self.processors.iter().map(|p| p.busy_us).sum();
        assert_eq!(thread_total, proc_total, "cpu accounting diverged");
    }
}
