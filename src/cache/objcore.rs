//! Object cores: one cached representation each.
//!
//! A core's logical lifetime is governed by its explicit refcount, which
//! is only changed while holding the owning object head's mutex. The
//! `Arc` merely keeps the memory alive for late readers (heap, ban list,
//! parked requests).

use crate::cache::binheap::{HeapEntry, NOIDX};
use crate::cache::objhead::ObjHead;
use crate::types::{Dur, Real};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Core flags. Mutated under the head mutex; readers that cannot take the
/// mutex (lurker probes, trace lines) see a consistent snapshot via the
/// atomic.
pub mod flags {
    pub const BUSY: u32 = 1 << 1;
    pub const HITMISS: u32 = 1 << 2;
    pub const HITPASS: u32 = 1 << 3;
    pub const CANCEL: u32 = 1 << 4;
    pub const PRIVATE: u32 = 1 << 5;
    pub const FAILED: u32 = 1 << 6;
    pub const DYING: u32 = 1 << 7;
}

/// Expiry-engine flags, mutated under the engine mutex only.
pub mod exp_flags {
    pub const REFD: u8 = 1 << 0;
    pub const NEW: u8 = 1 << 1;
    pub const INSERT: u8 = 1 << 2;
    pub const MOVE: u8 = 1 << 3;
    pub const REMOVE: u8 = 1 << 4;
    pub const POSTED: u8 = 1 << 5;
}

/// Absolute origin plus the three relative windows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timers {
    pub t_origin: Real,
    pub ttl: Dur,
    pub grace: Dur,
    pub keep: Dur,
}

impl Timers {
    pub fn new(t_origin: Real, ttl: Dur, grace: Dur, keep: Dur) -> Self {
        Self { t_origin, ttl, grace, keep }
    }

    /// The expiry-heap key: the instant after which not even conditional
    /// revalidation can use the object.
    pub fn when(&self) -> Real {
        self.t_origin + self.ttl + self.grace + self.keep
    }
}

/// Fetch progress of a busy object. Exclusive writer until finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BocState {
    Fetching,
    Streaming,
    Finished,
    Failed,
}

/// Busy-object side structure, reference-counted independently of the
/// core so a cancelling client can wait for the fetch to wind down.
pub struct Boc {
    state: Mutex<BocState>,
    cond: Condvar,
    pub refcount: AtomicU32,
    pub fetched_so_far: AtomicU64,
    /// Vary signature announced by the in-flight fetch, if any.
    pub vary: Mutex<Option<Vec<u8>>>,
}

impl Boc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BocState::Fetching),
            cond: Condvar::new(),
            refcount: AtomicU32::new(1),
            fetched_so_far: AtomicU64::new(0),
            vary: Mutex::new(None),
        })
    }

    pub fn state(&self) -> BocState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: BocState) {
        let mut s = self.state.lock();
        assert!(*s <= state, "busy object state went backwards");
        *s = state;
        self.cond.notify_all();
    }

    /// Block until the fetch has reached at least `target`.
    pub fn wait_state(&self, target: BocState) {
        let mut s = self.state.lock();
        while *s < target {
            self.cond.wait(&mut s);
        }
    }
}

pub struct ObjCore {
    head: OnceLock<Weak<ObjHead>>,

    flags: AtomicU32,
    pub(crate) refcnt: AtomicU32,

    pub(crate) exp_flags: AtomicU8,
    timer_when: AtomicU64,
    timer_idx: AtomicU32,

    timers: Mutex<Timers>,

    pub hits: AtomicU64,
    /// Wall-clock of the last dereference, for LRU decisions.
    pub last_lru: AtomicU64,

    /// The ban this core has been checked up to. Mutated under the ban
    /// mutex.
    pub(crate) ban: Mutex<Option<Arc<crate::cache::ban::Ban>>>,

    pub(crate) boc: Mutex<Option<Arc<Boc>>>,

    /// Requests parked on this core's fetch. Guarded by the head mutex
    /// discipline; own lock so late rushers stay safe.
    pub(crate) waiting: Mutex<Vec<crate::cache::hash::Waiter>>,

    /// Storage-private slot, owned by the stevedore.
    pub stobj: Mutex<Option<Box<dyn Any + Send>>>,
}

impl ObjCore {
    /// New cores are always busy; leaving busy is one-way.
    pub fn new_busy() -> Arc<Self> {
        Arc::new(Self {
            head: OnceLock::new(),
            flags: AtomicU32::new(flags::BUSY),
            refcnt: AtomicU32::new(0),
            exp_flags: AtomicU8::new(0),
            timer_when: AtomicU64::new(0f64.to_bits()),
            timer_idx: AtomicU32::new(NOIDX),
            timers: Mutex::new(Timers::new(0.0, 0.0, 0.0, 0.0)),
            hits: AtomicU64::new(0),
            last_lru: AtomicU64::new(0f64.to_bits()),
            ban: Mutex::new(None),
            boc: Mutex::new(Some(Boc::new())),
            waiting: Mutex::new(Vec::new()),
            stobj: Mutex::new(None),
        })
    }

    pub(crate) fn set_head(&self, head: &Arc<ObjHead>) {
        self.head
            .set(Arc::downgrade(head))
            .unwrap_or_else(|_| panic!("object core re-homed"));
    }

    pub fn head(&self) -> Arc<ObjHead> {
        self.head
            .get()
            .and_then(Weak::upgrade)
            .expect("object core without a head")
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub(crate) fn set_flags(&self, f: u32) {
        self.flags.fetch_or(f, Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, f: u32) {
        self.flags.fetch_and(!f, Ordering::AcqRel);
    }

    pub fn is_busy(&self) -> bool {
        self.flags() & flags::BUSY != 0
    }

    pub fn is_dying(&self) -> bool {
        self.flags() & flags::DYING != 0
    }

    pub fn is_hitmiss(&self) -> bool {
        self.flags() & flags::HITMISS != 0
    }

    pub fn is_hitpass(&self) -> bool {
        self.flags() & flags::HITPASS != 0
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub fn timers(&self) -> Timers {
        *self.timers.lock()
    }

    pub fn set_timers(&self, t: Timers) {
        *self.timers.lock() = t;
    }

    pub(crate) fn update_timers(&self, f: impl FnOnce(&mut Timers)) -> Timers {
        let mut t = self.timers.lock();
        f(&mut t);
        *t
    }

    pub fn timer_when(&self) -> Real {
        f64::from_bits(self.timer_when.load(Ordering::Acquire))
    }

    pub(crate) fn set_timer_when(&self, when: Real) {
        self.timer_when.store(when.to_bits(), Ordering::Release);
    }

    pub fn timer_idx(&self) -> u32 {
        self.timer_idx.load(Ordering::Acquire)
    }

    pub(crate) fn exp_flags(&self) -> u8 {
        self.exp_flags.load(Ordering::Acquire)
    }

    pub fn touch_lru(&self, now: Real) {
        self.last_lru.store(now.to_bits(), Ordering::Relaxed);
    }

    /// Bump the busy-object refcount if the fetch is still running.
    pub fn ref_boc(&self) -> Option<Arc<Boc>> {
        let head = self.head();
        let _inner = head.lock();
        let boc = self.boc.lock();
        match boc.as_ref() {
            Some(b) if b.state() < BocState::Finished => {
                b.refcount.fetch_add(1, Ordering::AcqRel);
                Some(Arc::clone(b))
            }
            _ => None,
        }
    }

    /// Drop a busy-object reference; the last one detaches it.
    pub fn deref_boc(&self) {
        let head = self.head();
        let boc_out;
        {
            let _inner = head.lock();
            let mut boc = self.boc.lock();
            let b = boc.as_ref().expect("deref of absent busy object");
            let r = b.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
            boc_out = if r == 0 { boc.take() } else { None };
        }
        drop(boc_out);
    }

    pub fn boc(&self) -> Option<Arc<Boc>> {
        self.boc.lock().clone()
    }

    pub fn ban(&self) -> Option<Arc<crate::cache::ban::Ban>> {
        self.ban.lock().clone()
    }
}

impl HeapEntry for Arc<ObjCore> {
    fn heap_when(&self) -> f64 {
        self.timer_when()
    }
    fn heap_idx(&self) -> u32 {
        self.timer_idx()
    }
    fn set_heap_idx(&self, idx: u32) {
        self.timer_idx.store(idx, Ordering::Release);
    }
}
