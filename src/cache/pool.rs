//! Worker thread pools.
//!
//! Each pool owns a fixed set of OS threads, a stack of parked workers
//! and one task queue per priority class. A reserve of idle threads is
//! withheld from the lower classes so backend work can always find a
//! thread. The herder breeds workers up to the configured band, retires
//! the long-idle, and doubles as a deadlock watchdog: if the highest
//! priority queue has work but does not move, the process is taken down
//! on purpose.

use crate::config::{SharedParams, TASK_PRIO_COUNT};
use crate::stats::{Counters, Global};
use crate::types::{mono_now, real_now, sleep_secs};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

pub const NPRIO: usize = TASK_PRIO_COUNT as usize;

/// Priority classes, highest first. Backend work must not starve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TaskPrio {
    /// Backend/fetch work.
    Bo = 0,
    /// Requests woken from a waiting list.
    Rush = 1,
    /// New requests.
    Req = 2,
    /// Streaming delivery.
    Str = 3,
    /// Acceptor pumps.
    Vca = 4,
    /// Background (lurker and expiry offload).
    Bg = 5,
}

impl TaskPrio {
    pub fn idx(self) -> usize {
        self as usize
    }

    /// Only the request-carrying classes honor the queue limit; the
    /// rest always queue.
    fn is_limited(self) -> bool {
        matches!(self, TaskPrio::Req | TaskPrio::Str)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task queue full")]
    QueueFull,
    #[error("queue failure injected")]
    Injected,
    #[error("no pools")]
    NoPools,
}

type TaskFn = Box<dyn FnOnce(&mut Worker) + Send + 'static>;

enum TaskKind {
    Run(TaskFn),
    /// Ends the receiving worker's loop.
    KissOfDeath,
}

pub struct Task {
    kind: TaskKind,
}

impl Task {
    pub fn new(f: impl FnOnce(&mut Worker) + Send + 'static) -> Self {
        Self { kind: TaskKind::Run(Box::new(f)) }
    }

    fn kiss_of_death() -> Self {
        Self { kind: TaskKind::KissOfDeath }
    }
}

/// The dispatch slot and scratch space of one worker thread.
pub(crate) struct WorkerCtl {
    slot: Mutex<Option<Task>>,
    cond: Condvar,
    /// Small argument handed over with a direct task (see `task_arg`).
    scratch: Mutex<Vec<u8>>,
    /// Wall clock of the last park, read by the herder.
    lastused: AtomicU64,
}

impl WorkerCtl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
            scratch: Mutex::new(Vec::new()),
            lastused: AtomicU64::new(real_now().to_bits()),
        })
    }

    fn hand(&self, task: Task) {
        let mut slot = self.slot.lock();
        assert!(slot.is_none(), "worker already has a task");
        *slot = Some(task);
        self.cond.notify_one();
    }

    fn wait_for_task(&self) -> Task {
        let mut slot = self.slot.lock();
        loop {
            if let Some(t) = slot.take() {
                return t;
            }
            self.cond.wait(&mut slot);
        }
    }

    fn lastused(&self) -> f64 {
        f64::from_bits(self.lastused.load(Ordering::Relaxed))
    }
}

/// Per-thread worker state handed to every task.
pub struct Worker {
    pub stats: Counters,
    pub(crate) ctl: Arc<WorkerCtl>,
    /// Follow-up task prepared by `task_arg` when no idle worker was
    /// available; the worker loop runs it when the current task
    /// returns.
    pub(crate) pending: Option<Task>,
}

impl Worker {
    /// Standalone worker for code paths that run tasks inline (tests,
    /// rush fallbacks).
    pub fn solo() -> Self {
        Self {
            stats: Counters::default(),
            ctl: WorkerCtl::new(),
            pending: None,
        }
    }
}

struct PoolInner {
    /// Parked workers, most recently idle first.
    idle: VecDeque<Arc<WorkerCtl>>,
    nidle: u32,
    queues: [VecDeque<Task>; NPRIO],
    nthr: u32,
    lqueue: u32,
    ndequeued: u64,
    nqueued: u64,
    sdropped: u64,
    rdropped: u64,
    /// Worker counters folded in at `wthread_stats_rate`.
    a_stat: Counters,
}

pub struct Pool {
    pub(crate) mtx: Mutex<PoolInner>,
    herder_cond: Condvar,
    die: AtomicBool,
    params: SharedParams,
    stats: Arc<Global>,
    reqpoolfail: Arc<AtomicU64>,
}

impl Pool {
    fn new_raw(
        params: SharedParams,
        stats: Arc<Global>,
        reqpoolfail: Arc<AtomicU64>,
    ) -> Arc<Pool> {
        Arc::new(Pool {
            mtx: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                nidle: 0,
                queues: Default::default(),
                nthr: 0,
                lqueue: 0,
                ndequeued: 0,
                nqueued: 0,
                sdropped: 0,
                rdropped: 0,
                a_stat: Counters::default(),
            }),
            herder_cond: Condvar::new(),
            die: AtomicBool::new(false),
            params,
            stats,
            reqpoolfail,
        })
    }

    /// Create a pool and its herder; blocks until the first worker is
    /// parked.
    pub fn start(
        params: SharedParams,
        stats: Arc<Global>,
        reqpoolfail: Arc<AtomicU64>,
    ) -> Arc<Pool> {
        let pool = Self::new_raw(params, stats, reqpoolfail);
        let p = Arc::clone(&pool);
        std::thread::Builder::new()
            .name("pool-herder".into())
            .spawn(move || herder(p))
            .expect("spawn pool herder");
        while pool.mtx.lock().nidle == 0 {
            sleep_secs(0.01);
        }
        pool
    }

    pub fn dying(&self) -> bool {
        self.die.load(Ordering::Acquire)
    }

    /// Mark the pool to die; the herder sheds its threads.
    pub(crate) fn retire(&self) {
        self.die.store(true, Ordering::Release);
        self.herder_cond.notify_one();
    }

    pub fn nthr(&self) -> u32 {
        self.mtx.lock().nthr
    }

    /// Idle worker eligible for this priority, honoring the reserve.
    fn get_idle(&self, inner: &mut PoolInner, prio: TaskPrio) -> Option<Arc<WorkerCtl>> {
        let reserve = self.params.read().pool_reserve() as u64;
        if (inner.nidle as u64) <= reserve * prio.idx() as u64 / NPRIO as u64 {
            return None;
        }
        let ctl = inner.idle.pop_front();
        if ctl.is_some() {
            inner.nidle -= 1;
        } else {
            assert_eq!(inner.nidle, 0);
        }
        ctl
    }

    /// Enter a new task: direct handoff when an idle thread may take
    /// it, else queue, else drop.
    pub fn task(&self, task: Task, prio: TaskPrio) -> Result<(), TaskError> {
        if prio == TaskPrio::Req {
            // fault injection eats one bit per request-priority task
            let bits = self
                .reqpoolfail
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v >> 1))
                .unwrap_or(0);
            if bits & 1 != 0 {
                debug!(next = bits >> 1, "failing due to reqpoolfail");
                return Err(TaskError::Injected);
            }
        }

        let mut inner = self.mtx.lock();

        if let Some(ctl) = self.get_idle(&mut inner, prio) {
            drop(inner);
            ctl.hand(task);
            return Ok(());
        }

        let (max, queue_limit) = {
            let p = self.params.read();
            (p.wthread_max, p.wthread_queue_limit)
        };
        if !prio.is_limited() || inner.lqueue + inner.nthr < max + queue_limit {
            inner.nqueued += 1;
            inner.lqueue += 1;
            inner.queues[prio.idx()].push_back(task);
            self.herder_cond.notify_one();
            Ok(())
        } else {
            if prio == TaskPrio::Req {
                inner.sdropped += 1;
            } else {
                inner.rdropped += 1;
            }
            Err(TaskError::QueueFull)
        }
    }

    /// Hand a task plus a small argument directly to an idle worker's
    /// scratch space. When none is available the calling worker is
    /// prepared to run it itself after the current task returns;
    /// returns false in that case. Only direct handoffs carry
    /// arguments: an empty argument wakes nobody.
    pub fn task_arg(
        &self,
        wrk: &mut Worker,
        prio: TaskPrio,
        func: impl FnOnce(&mut Worker, &[u8]) + Send + 'static,
        arg: &[u8],
    ) -> bool {
        if arg.is_empty() {
            return false;
        }

        let target = {
            let mut inner = self.mtx.lock();
            self.get_idle(&mut inner, prio)
        };

        match target {
            Some(ctl) => {
                *ctl.scratch.lock() = arg.to_vec();
                let ctl2 = Arc::clone(&ctl);
                ctl.hand(Task::new(move |w| {
                    let data = std::mem::take(&mut *ctl2.scratch.lock());
                    func(w, &data);
                }));
                true
            }
            None => {
                *wrk.ctl.scratch.lock() = arg.to_vec();
                let ctl = Arc::clone(&wrk.ctl);
                assert!(wrk.pending.is_none(), "worker rescheduled twice");
                wrk.pending = Some(Task::new(move |w| {
                    let data = std::mem::take(&mut *ctl.scratch.lock());
                    func(w, &data);
                }));
                false
            }
        }
    }

    /// Queue snapshot for status output.
    pub fn queue_len(&self) -> u32 {
        self.mtx.lock().lqueue
    }

    /// Fold pool counters and drop tallies into the global set.
    fn sumstat(&self) {
        let (mut stats, nqueued, sdropped, rdropped) = {
            let mut inner = self.mtx.lock();
            let s = std::mem::take(&mut inner.a_stat);
            let out = (s, inner.nqueued, inner.sdropped, inner.rdropped);
            inner.nqueued = 0;
            inner.sdropped = 0;
            inner.rdropped = 0;
            out
        };
        self.stats.sess_queued.fetch_add(nqueued, Ordering::Relaxed);
        self.stats.sess_dropped.fetch_add(sdropped, Ordering::Relaxed);
        self.stats.req_dropped.fetch_add(rdropped, Ordering::Relaxed);
        if stats.summs > 0 {
            self.stats.summ(&mut stats);
        }
    }
}

/// The work loop of one pool thread.
fn worker_loop(pool: Arc<Pool>) {
    let ctl = WorkerCtl::new();
    let mut wrk = Worker {
        stats: Counters::default(),
        ctl: Arc::clone(&ctl),
        pending: None,
    };
    let stats_rate = pool.params.read().wthread_stats_rate as u64;
    debug!("worker starts");

    loop {
        let mut task: Option<Task> = None;
        {
            let mut inner = pool.mtx.lock();
            let reserve = pool.params.read().pool_reserve() as u64;
            for i in 0..NPRIO {
                if (inner.nidle as u64) < reserve * i as u64 / NPRIO as u64 {
                    break;
                }
                if let Some(t) = inner.queues[i].pop_front() {
                    inner.lqueue -= 1;
                    inner.ndequeued += 1;
                    task = Some(t);
                    break;
                }
            }

            if wrk.stats.summs >= stats_rate {
                inner.a_stat.summ(&mut wrk.stats);
            }

            if task.is_none() {
                // to sleep, perchance to dream
                ctl.lastused.store(real_now().to_bits(), Ordering::Relaxed);
                inner.idle.push_front(Arc::clone(&ctl));
                inner.nidle += 1;
            }
        }

        let task = match task {
            Some(t) => t,
            None => ctl.wait_for_task(),
        };

        match task.kind {
            TaskKind::KissOfDeath => break,
            TaskKind::Run(f) => {
                f(&mut wrk);
                wrk.stats.summs += 1;
            }
        }
        // a direct handoff may have been prepared for us mid-task
        while let Some(t) = wrk.pending.take() {
            match t.kind {
                TaskKind::KissOfDeath => unreachable!("death is never pending"),
                TaskKind::Run(f) => {
                    f(&mut wrk);
                    wrk.stats.summs += 1;
                }
            }
        }
    }

    if wrk.stats.summs > 0 {
        pool.stats.summ(&mut wrk.stats);
    }
    debug!("worker ends");
}

/// Breed one worker thread.
fn pool_breed(pool: &Arc<Pool>) {
    let p = Arc::clone(pool);
    let res = std::thread::Builder::new()
        .name("cache-worker".into())
        .spawn(move || worker_loop(p));
    match res {
        Err(e) => {
            error!("create worker thread failed: {e}");
            pool.stats.threads_failed.fetch_add(1, Ordering::Relaxed);
            sleep_secs(pool.params.read().wthread_fail_delay);
        }
        Ok(_) => {
            pool.mtx.lock().nthr += 1;
            pool.stats.threads.fetch_add(1, Ordering::Relaxed);
            pool.stats.threads_created.fetch_add(1, Ordering::Relaxed);
            let delay = pool.params.read().wthread_add_delay;
            if delay > 0.0 {
                sleep_secs(delay);
            } else {
                std::thread::yield_now();
            }
        }
    }
}

/// Herd a single pool: breed and retire workers, watch the queues.
fn herder(pool: Arc<Pool>) {
    // watchdog state: the highest priority queue must keep moving
    let mut dq: u64 = 1 << 31;
    let mut dqt: f64 = 0.0;

    loop {
        let die = pool.dying();
        {
            let inner = pool.mtx.lock();
            if inner.queues[TaskPrio::Bo.idx()].is_empty() {
                dq = inner.ndequeued + 1;
            } else if dq != inner.ndequeued {
                dq = inner.ndequeued;
                dqt = mono_now();
            } else {
                let watchdog = pool.params.read().wthread_watchdog;
                if mono_now() - dqt > watchdog {
                    error!(
                        lqueue = inner.lqueue,
                        stalled = mono_now() - dqt,
                        "pool herder: queue does not move"
                    );
                    std::process::abort();
                }
            }
        }

        let (wthread_min, wthread_max, wthread_timeout, destroy_delay) = {
            let p = pool.params.read();
            (p.wthread_min, p.wthread_max, p.wthread_timeout, p.wthread_destroy_delay)
        };
        let wthread_min = if die { 0 } else { wthread_min };

        let (nthr, lqueue) = {
            let inner = pool.mtx.lock();
            (inner.nthr, inner.lqueue)
        };

        if nthr < wthread_min || (lqueue > 0 && nthr < wthread_max) {
            pool_breed(&pool);
            continue;
        }

        let mut delay = wthread_timeout;
        if nthr > wthread_min {
            pool.sumstat();
            let t_idle = real_now() - wthread_timeout;
            let victim = {
                let mut inner = pool.mtx.lock();
                let oldest = inner.idle.back().map(|c| c.lastused());
                match oldest {
                    Some(lastused)
                        if die || lastused < t_idle || inner.nthr > wthread_max =>
                    {
                        let ctl = inner.idle.pop_back().expect("idle tail just seen");
                        inner.nidle -= 1;
                        Some(ctl)
                    }
                    Some(lastused) => {
                        delay = lastused - t_idle;
                        None
                    }
                    None => None,
                }
            };
            if let Some(ctl) = victim {
                ctl.hand(Task::kiss_of_death());
                pool.mtx.lock().nthr -= 1;
                pool.stats.threads.fetch_sub(1, Ordering::Relaxed);
                pool.stats.threads_destroyed.fetch_add(1, Ordering::Relaxed);
                delay = destroy_delay;
            } else {
                delay = delay.max(destroy_delay);
            }
        }

        if die {
            if pool.mtx.lock().nthr == 0 {
                break;
            }
            sleep_secs(if delay < 2.0 { 0.01 } else { 1.0 });
            continue;
        }

        let mut inner = pool.mtx.lock();
        if inner.lqueue == 0 {
            let _ = pool.herder_cond.wait_for(
                &mut inner,
                std::time::Duration::from_secs_f64(delay.clamp(0.01, 3600.0)),
            );
        } else if inner.nthr >= wthread_max {
            pool.stats.threads_limited.fetch_add(1, Ordering::Relaxed);
            let _ = pool
                .herder_cond
                .wait_for(&mut inner, std::time::Duration::from_secs(1));
        }
    }
    pool.sumstat();
    info!("pool herder exits");
}

/// The set of pools; tasks with no pool affinity round-robin over it.
pub struct PoolSet {
    pools: Mutex<VecDeque<Arc<Pool>>>,
    params: SharedParams,
    stats: Arc<Global>,
    /// Fault injection bitmap shared by every pool.
    pub reqpoolfail: Arc<AtomicU64>,
}

impl PoolSet {
    pub fn new(params: SharedParams, stats: Arc<Global>) -> Arc<PoolSet> {
        Arc::new(PoolSet {
            pools: Mutex::new(VecDeque::new()),
            params,
            stats,
            reqpoolfail: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Add a pool to the set.
    pub fn new_pool(&self) -> Arc<Pool> {
        let pool = Pool::start(
            self.params.clone(),
            Arc::clone(&self.stats),
            Arc::clone(&self.reqpoolfail),
        );
        self.pools.lock().push_back(Arc::clone(&pool));
        self.stats.pools.fetch_add(1, Ordering::Relaxed);
        pool
    }

    /// Retire a pool: it sheds threads and leaves the rotation.
    pub fn destroy_pool(&self, pool: &Arc<Pool>) {
        let mut pools = self.pools.lock();
        if let Some(pos) = pools.iter().position(|p| Arc::ptr_eq(p, pool)) {
            pools.remove(pos);
            self.stats.pools.fetch_sub(1, Ordering::Relaxed);
        }
        drop(pools);
        pool.retire();
    }

    /// Schedule on any convenient pool, round-robin.
    pub fn task_any(&self, task: Task, prio: TaskPrio) -> Result<(), TaskError> {
        let pool = {
            let mut pools = self.pools.lock();
            match pools.pop_front() {
                Some(p) => {
                    pools.push_back(Arc::clone(&p));
                    p
                }
                None => return Err(TaskError::NoPools),
            }
        };
        pool.task(task, prio)
    }

    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.pools.lock().iter().cloned().collect()
    }

    /// Total queued tasks over all pools, mirrored into the stats.
    pub fn update_queue_gauge(&self) -> u64 {
        let total: u64 = self.pools().iter().map(|p| p.queue_len() as u64).sum();
        self.stats.thread_queue_len.store(total, Ordering::Relaxed);
        total
    }

    /// Set the fault-injection bitmap from a pattern of 'F' marks.
    pub fn set_reqpoolfail(&self, pattern: &str) {
        let mut bits: u64 = 0;
        for (i, c) in pattern.chars().enumerate().take(64) {
            if c == 'F' || c == 'f' {
                bits |= 1 << i;
            }
        }
        self.reqpoolfail.store(bits, Ordering::Release);
    }
}
