//! Object expiry: the timer heap and its engine thread.
//!
//! Everyone else talks to the engine through a mailbox: INSERT, MOVE and
//! REMOVE commands accumulate in per-core expiry flags while the core
//! sits on the inbox, REMOVE jumping the queue. The engine owns exactly
//! one object reference per REFD core and is the only thread that
//! touches the heap.

use crate::cache::binheap::{BinHeap, NOIDX};
use crate::cache::objcore::{exp_flags as ef, ObjCore};
use crate::cache::pool::{PoolSet, Task, TaskPrio};
use crate::cache::Cache;
use crate::policy::Req;
use crate::storage::ObjEvent;
use crate::types::{real_now, Dur, Real};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Idle poll interval when the heap is empty or far in the future.
const ENGINE_IDLE: Dur = 355.0 / 113.0;

/// Inbox items drained per engine iteration.
const INBOX_BATCH: usize = 1024;

/// Expired cores handed to a background task instead of dereferenced
/// inline, once a single sweep collects at least this many.
const DEREF_OFFLOAD: usize = 128;

/// Reusable dereference task slots.
const NDEREF_TASKS: usize = 4;

/// Effective ttl instant, capped by the request if it brought one.
pub fn exp_ttl(oc: &ObjCore, req: Option<&Req>) -> Real {
    let t = oc.timers();
    let mut r = t.ttl;
    if let Some(req) = req {
        if req.d_ttl > 0.0 && req.d_ttl < r {
            r = req.d_ttl;
        }
    }
    t.t_origin + r
}

/// Effective ttl+grace instant, capped by the request.
pub fn exp_ttl_grace(oc: &ObjCore, req: Option<&Req>) -> Real {
    let t = oc.timers();
    let mut g = t.grace;
    if let Some(req) = req {
        if req.d_grace >= 0.0 && req.d_grace < g {
            g = req.d_grace;
        }
    }
    exp_ttl(oc, req) + g
}

struct ExpInner {
    inbox: VecDeque<Arc<ObjCore>>,
    free_tasks: usize,
}

pub struct Expiry {
    mtx: Mutex<ExpInner>,
    /// Signalled when the inbox gains an entry or shutdown starts.
    inbox_cond: Condvar,
    /// Signalled when a dereference task slot frees up. Distinct from
    /// the inbox condvar; they guard different invariants.
    task_cond: Condvar,
    /// Engine-thread-only.
    heap: Mutex<BinHeap<Arc<ObjCore>>>,
    shutdown: std::sync::atomic::AtomicBool,
}

/// Cores collected by one engine sweep, waiting to be dereferenced.
#[derive(Default)]
struct ExpDeref {
    removes: Vec<Arc<ObjCore>>,
    expires: Vec<Arc<ObjCore>>,
}

impl ExpDeref {
    fn len(&self) -> usize {
        self.removes.len() + self.expires.len()
    }

    fn is_empty(&self) -> bool {
        self.removes.is_empty() && self.expires.is_empty()
    }

    /// Finish removals and expiries: event, kill where needed, drop the
    /// engine's reference. Runs without any engine lock.
    fn work(self, cache: &Cache, now: Real) {
        for oc in self.removes {
            assert_eq!(oc.timer_idx(), NOIDX);
            assert!(oc.refcnt() > 0);
            assert_eq!(oc.exp_flags(), 0);
            debug!(t = exp_ttl(&oc, None) - now, "expiry removed object");
            cache.stevedore.send_event(&oc, ObjEvent::Expire);
            cache.deref_core(oc);
        }
        for oc in self.expires {
            if !oc.is_dying() {
                cache.kill(&oc);
            }
            assert_eq!(oc.timer_idx(), NOIDX);
            assert!(oc.refcnt() > 0);
            debug!(
                t = exp_ttl(&oc, None) - now,
                hits = oc.hits.load(Ordering::Relaxed),
                "object expired"
            );
            cache.stevedore.send_event(&oc, ObjEvent::Expire);
            cache.deref_core(oc);
        }
    }
}

/// Wall-clock state the engine loop carries between iterations.
pub(crate) struct EngineTick {
    t: Real,
    tnext: Real,
}

impl EngineTick {
    pub(crate) fn new() -> Self {
        Self { t: 0.0, tnext: 0.0 }
    }
}

impl Expiry {
    pub(crate) fn new() -> Self {
        Self {
            mtx: Mutex::new(ExpInner {
                inbox: VecDeque::new(),
                free_tasks: NDEREF_TASKS,
            }),
            inbox_cond: Condvar::new(),
            task_cond: Condvar::new(),
            heap: Mutex::new(BinHeap::new()),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Post commands for a REFD core. Engine mutex held by the caller.
    fn mail_locked(&self, inner: &mut ExpInner, oc: &Arc<ObjCore>, cmds: u8, cache: &Cache) {
        assert_eq!(cmds & ef::REFD, 0);
        assert!(oc.refcnt() > 0);
        let f = oc.exp_flags();
        if f & ef::REFD == 0 {
            return;
        }
        if f & ef::POSTED == 0 {
            if cmds & ef::REMOVE != 0 {
                inner.inbox.push_front(Arc::clone(oc));
            } else {
                inner.inbox.push_back(Arc::clone(oc));
            }
            cache.stats.exp_mailed.fetch_add(1, Ordering::Relaxed);
        }
        oc.exp_flags.fetch_or(cmds | ef::POSTED, Ordering::AcqRel);
        self.inbox_cond.notify_one();
    }

    /// Set up a new core for engine control. Must be called with the
    /// object head locked; the engine's reference is taken here.
    pub(crate) fn ref_new(&self, oc: &Arc<ObjCore>) {
        assert_eq!(oc.exp_flags(), 0);
        assert!(oc.refcnt() >= 1);
        oc.refcnt.fetch_add(1, Ordering::AcqRel);
        oc.exp_flags.store(ef::REFD | ef::NEW, Ordering::Release);
    }

    /// First insertion after unbusy (or load). The caller holds a
    /// reference besides the engine's.
    pub(crate) fn insert(&self, cache: &Cache, oc: &Arc<ObjCore>) {
        assert!(!oc.is_busy());
        if oc.exp_flags() & ef::REFD == 0 {
            return;
        }
        assert!(oc.refcnt() >= 2);
        cache.stevedore.send_event(oc, ObjEvent::Insert);

        let remove_race;
        {
            let mut inner = self.mtx.lock();
            assert!(oc.exp_flags() & ef::NEW != 0);
            oc.exp_flags.fetch_and(!ef::NEW, Ordering::AcqRel);
            assert_eq!(oc.exp_flags() & (ef::INSERT | ef::MOVE | ef::POSTED), 0);
            if oc.exp_flags() & ef::REMOVE != 0 {
                // raced another thread's remove; insertion is cancelled
                remove_race = true;
                oc.exp_flags.store(0, Ordering::Release);
            } else {
                remove_race = false;
                oc.set_timer_when(oc.timers().when());
                self.mail_locked(&mut inner, oc, ef::INSERT | ef::MOVE, cache);
            }
        }

        if remove_race {
            cache.stevedore.send_event(oc, ObjEvent::Expire);
            cache.deref_core(Arc::clone(oc));
        }
    }

    /// Take the core off the engine's plate.
    pub(crate) fn remove(&self, cache: &Cache, oc: &Arc<ObjCore>) {
        if oc.exp_flags() & ef::REFD == 0 {
            return;
        }
        let mut inner = self.mtx.lock();
        if oc.exp_flags() & ef::NEW != 0 {
            // insert has not been called yet; it will clean up
            assert_eq!(oc.exp_flags() & ef::POSTED, 0);
            oc.exp_flags.fetch_or(ef::REMOVE, Ordering::AcqRel);
        } else {
            self.mail_locked(&mut inner, oc, ef::REMOVE, cache);
        }
    }

    /// One or more timers changed. NaN keeps the old value. Only an
    /// earlier deadline needs the engine's attention.
    pub(crate) fn rearm(
        &self,
        cache: &Cache,
        oc: &Arc<ObjCore>,
        now: Real,
        ttl: f64,
        grace: f64,
        keep: f64,
    ) {
        assert!(oc.refcnt() > 0);
        if oc.exp_flags() & ef::REFD == 0 {
            return;
        }
        let t = oc.update_timers(|t| {
            if !ttl.is_nan() {
                t.ttl = now + ttl - t.t_origin;
            }
            if !grace.is_nan() {
                t.grace = grace;
            }
            if !keep.is_nan() {
                t.keep = keep;
            }
        });
        let when = t.when();
        debug!(
            cur = oc.timer_when(),
            new = when,
            "expiry rearm"
        );
        if when < t.t_origin || when < oc.timer_when() {
            let mut inner = self.mtx.lock();
            if oc.exp_flags() & ef::NEW != 0 {
                // the pending insert will pick the new deadline up
            } else {
                self.mail_locked(&mut inner, oc, ef::MOVE, cache);
            }
        }
    }

    /// Like rearm, but never extends a timer.
    pub(crate) fn reduce(
        &self,
        cache: &Cache,
        oc: &Arc<ObjCore>,
        now: Real,
        ttl: f64,
        grace: f64,
        keep: f64,
    ) {
        let t = oc.timers();
        let ttl = if !ttl.is_nan() && now + ttl - t.t_origin >= t.ttl {
            f64::NAN
        } else {
            ttl
        };
        let grace = if !grace.is_nan() && grace >= t.grace { f64::NAN } else { grace };
        let keep = if !keep.is_nan() && keep >= t.keep { f64::NAN } else { keep };
        self.rearm(cache, oc, now, ttl, grace, keep);
    }

    /// Drain a batch from the inbox and apply the heap operations, then
    /// sweep expired roots. One engine iteration.
    pub(crate) fn step(
        &self,
        cache: &Cache,
        pools: Option<&PoolSet>,
        tick: &mut EngineTick,
        block: bool,
    ) {
        let mut todo: Vec<(Arc<ObjCore>, u8)> = Vec::new();
        let mut deref = ExpDeref::default();

        {
            let mut inner = self.mtx.lock();
            while let Some(oc) = inner.inbox.front().cloned() {
                if todo.len() >= INBOX_BATCH {
                    break;
                }
                assert!(oc.refcnt() >= 1);
                assert!(oc.exp_flags() & ef::POSTED != 0);
                inner.inbox.pop_front();
                cache.stats.exp_received.fetch_add(1, Ordering::Relaxed);
                tick.tnext = 0.0;
                let flags = oc.exp_flags();
                if flags & ef::REMOVE != 0 {
                    oc.exp_flags.store(0, Ordering::Release);
                    if flags & ef::INSERT != 0 {
                        // never reached the heap; nothing to delete
                        deref.removes.push(oc);
                        continue;
                    }
                    deref.removes.push(Arc::clone(&oc));
                } else {
                    oc.exp_flags.fetch_and(ef::REFD, Ordering::AcqRel);
                }
                todo.push((oc, flags));
            }
            if block
                && todo.is_empty()
                && deref.is_empty()
                && tick.tnext > tick.t
                && !self.is_shutdown()
            {
                let dur = (tick.tnext - real_now()).max(0.001);
                let _ = self
                    .inbox_cond
                    .wait_for(&mut inner, std::time::Duration::from_secs_f64(dur));
            }
        }

        {
            let mut heap = self.heap.lock();
            for (oc, flags) in &todo {
                if flags & ef::REMOVE != 0 {
                    assert!(flags & ef::INSERT == 0);
                    heap.delete(oc.timer_idx());
                    continue;
                }
                if flags & ef::MOVE != 0 {
                    oc.set_timer_when(oc.timers().when());
                    cache.stevedore.send_event(oc, ObjEvent::TtlChange);
                }
                debug!(when = oc.timer_when(), "expiry inbox");
                if flags & ef::INSERT != 0 {
                    assert_eq!(oc.timer_idx(), NOIDX);
                    heap.insert(Arc::clone(oc));
                    assert_ne!(oc.timer_idx(), NOIDX);
                } else if flags & ef::MOVE != 0 {
                    assert_ne!(oc.timer_idx(), NOIDX);
                    heap.reorder(oc.timer_idx());
                } else {
                    unreachable!("objcore state wrong in inbox");
                }
            }
        }

        tick.t = real_now();
        tick.tnext = self.sweep(cache, &mut deref, tick.t);

        if deref.is_empty() {
            return;
        }

        if pools.is_none() || deref.len() < DEREF_OFFLOAD {
            deref.work(cache, tick.t);
            return;
        }
        let pools = pools.expect("checked above");

        // hand the batch to a reusable dereference task
        {
            let mut inner = self.mtx.lock();
            while inner.free_tasks == 0 {
                self.task_cond.wait(&mut inner);
            }
            inner.free_tasks -= 1;
        }
        let now = tick.t;
        let cache2 = cache.self_arc();
        let holder = Arc::new(Mutex::new(Some(deref)));
        let taken = Arc::clone(&holder);
        let task = Task::new(move |_wrk| {
            let d = taken.lock().take();
            {
                let mut inner = cache2.expiry.mtx.lock();
                inner.free_tasks += 1;
                cache2.expiry.task_cond.notify_one();
            }
            if let Some(d) = d {
                d.work(&cache2, now);
            }
        });
        if pools.task_any(task, TaskPrio::Bo).is_err() {
            // no pool took it; give the slot back and finish inline
            {
                let mut inner = self.mtx.lock();
                inner.free_tasks += 1;
                self.task_cond.notify_one();
            }
            if let Some(d) = holder.lock().take() {
                d.work(cache, now);
            }
        }
    }

    /// Pop expired roots. Returns the next wakeup instant.
    fn sweep(&self, cache: &Cache, deref: &mut ExpDeref, now: Real) -> Real {
        let mut n: u64 = 0;
        let ret;
        {
            let mut inner = self.mtx.lock();
            let mut heap = self.heap.lock();
            loop {
                let oc = match heap.root() {
                    None => {
                        ret = now + ENGINE_IDLE;
                        break;
                    }
                    Some(oc) => Arc::clone(oc),
                };
                debug!(e = oc.timer_when() - now, "expiry inspect");
                if oc.timer_when() > now {
                    ret = oc.timer_when();
                    break;
                }
                n += 1;
                let f = oc.exp_flags();
                if f & ef::POSTED != 0 {
                    if f & ef::REMOVE != 0 {
                        n -= 1;
                    }
                    if let Some(pos) =
                        inner.inbox.iter().position(|x| Arc::ptr_eq(x, &oc))
                    {
                        inner.inbox.remove(pos);
                    }
                    oc.exp_flags.store(0, Ordering::Release);
                } else {
                    oc.exp_flags.fetch_and(!ef::REFD, Ordering::AcqRel);
                }
                deref.expires.push(Arc::clone(&oc));
                assert_ne!(oc.timer_idx(), NOIDX);
                heap.delete(oc.timer_idx());
                assert_eq!(oc.timer_idx(), NOIDX);
            }
        }
        cache.stats.n_expired.fetch_add(n, Ordering::Relaxed);
        ret
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _inner = self.mtx.lock();
        self.inbox_cond.notify_all();
    }

    /// Wait until every dereference task slot has come home.
    pub(crate) fn drain_tasks(&self) {
        let mut inner = self.mtx.lock();
        while inner.free_tasks < NDEREF_TASKS {
            self.task_cond.wait(&mut inner);
        }
    }

    /// Synchronous engine iteration for tests.
    #[cfg(test)]
    pub(crate) fn drain_for_test(&self, cache: &Cache) {
        let mut tick = EngineTick::new();
        self.step(cache, None, &mut tick, false);
    }
}

impl Cache {
    /// Take a core off the expiry engine's plate.
    pub fn expiry_remove(&self, oc: &Arc<ObjCore>) {
        self.expiry.remove(self, oc);
    }

    /// Change object timers; NaN keeps a value.
    pub fn expiry_rearm(&self, oc: &Arc<ObjCore>, now: Real, ttl: f64, grace: f64, keep: f64) {
        self.expiry.rearm(self, oc, now, ttl, grace, keep);
    }

    /// Like rearm, but only ever shortens.
    pub fn expiry_reduce(&self, oc: &Arc<ObjCore>, now: Real, ttl: f64, grace: f64, keep: f64) {
        self.expiry.reduce(self, oc, now, ttl, grace, keep);
    }
}

/// Engine thread body.
pub(crate) fn engine_thread(cache: Arc<Cache>, pools: Arc<PoolSet>) {
    let mut tick = EngineTick::new();
    while !cache.expiry.is_shutdown() {
        cache.expiry.step(&cache, Some(&pools), &mut tick, true);
    }
    cache.expiry.drain_tasks();
    debug!("expiry engine exits");
}
