//! The ban lurker: background sweep of the ban list.
//!
//! The canonical locking order is head mutex first, ban mutex second,
//! because that is what lookup wants. The lurker comes the other way:
//! it try-locks each core's head and gets out of the way on contention,
//! deferring the core once and holding off with a short sleep when only
//! contested cores remain, preserving order.
//!
//! Each pass reaps the unreferenced tail, picks the bans old enough to
//! work on, walks their core lists, kills matching cores and advances
//! the survivors' ban pointers so future work shrinks.

use crate::cache::ban::{ban_len, lock_inner, Ban};
use crate::cache::objcore::{flags as oc_flags, ObjCore};
use crate::cache::Cache;
use crate::stats::Counters;
use crate::storage::ObjEvent;
use crate::types::{real_now, sleep_secs, Dur};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Idle sleep when there is nothing to age out. Random, non-magic.
pub const LURKER_IDLE_SLEEP: Dur = 49.62;

struct LurkerPass<'a> {
    cache: &'a Cache,
    stats: Counters,
    batch: u32,
}

impl<'a> LurkerPass<'a> {
    fn throttle(&mut self) {
        let (limit, sleep) = {
            let p = self.cache.params.read();
            (p.ban_lurker_batch, p.ban_lurker_sleep)
        };
        self.batch += 1;
        if self.batch > limit {
            sleep_secs(sleep);
            self.batch = 0;
        }
    }

    /// Reap the tail of the ban list up to the first ban still
    /// referenced. Freed bans also leave `obans`.
    fn cleantail(&mut self, obans: &mut Vec<Arc<Ban>>) {
        let mut freed: Vec<Arc<Ban>> = Vec::new();
        {
            let mut inner = lock_inner(&self.cache.bans);
            loop {
                let reap = match (inner.bans.back(), inner.bans.front()) {
                    (Some(tail), Some(head)) if !Arc::ptr_eq(tail, head) => {
                        *tail.refcount.lock() == 0
                    }
                    _ => false,
                };
                if !reap {
                    break;
                }
                let b = inner.bans.pop_back().expect("tail just checked");
                assert!(b.objcore.lock().is_empty());
                let stats = &self.cache.stats;
                if b.is_completed() {
                    stats.bans_completed.fetch_sub(1, Ordering::Relaxed);
                }
                if b.flags() & crate::cache::ban::ban_flags::OBJ != 0 {
                    stats.bans_obj.fetch_sub(1, Ordering::Relaxed);
                }
                if b.is_req() {
                    stats.bans_req.fetch_sub(1, Ordering::Relaxed);
                }
                stats.bans.fetch_sub(1, Ordering::Relaxed);
                stats.bans_deleted.fetch_add(1, Ordering::Relaxed);
                let spec = b.spec_bytes();
                inner.persisted_fragmentation += ban_len(&spec).unwrap_or(0) as u64;
                stats
                    .bans_persisted_fragmentation
                    .store(inner.persisted_fragmentation, Ordering::Relaxed);
                self.cache.ban_info_drop(&mut inner, &spec);
                freed.push(b);
            }
        }
        if !freed.is_empty() {
            obans.retain(|o| !freed.iter().any(|f| Arc::ptr_eq(f, o)));
        }
    }

    /// Grab one core off the working queue: upgrade, re-check its ban
    /// pointer, try-lock its head and take a reference. `Err` means
    /// contested.
    fn grab(
        &mut self,
        bt: &Arc<Ban>,
        w: &Weak<ObjCore>,
    ) -> Result<Option<Arc<ObjCore>>, ()> {
        let _inner = lock_inner(&self.cache.bans);
        let oc = match w.upgrade() {
            Some(oc) => oc,
            None => return Ok(None),
        };
        let still = oc.ban.lock().as_ref().map_or(false, |b| Arc::ptr_eq(b, bt));
        if !still {
            // lookup grabbed it, killed it or tested it to the top
            return Ok(None);
        }
        let oh = oc.head();
        let guard = match oh.try_lock() {
            Some(g) => g,
            None => return Err(()),
        };
        let f = oc.flags();
        if f & oc_flags::BUSY != 0 {
            // its fetcher owns it; come back later
            return Err(());
        }
        if oc.refcnt() == 0 || f & (oc_flags::DYING | oc_flags::FAILED) != 0 {
            // both mutexes in hand: take it off the ban list for good
            let mut b = oc.ban.lock();
            if b.take().is_some() {
                *bt.refcount.lock() -= 1;
            }
            return Ok(None);
        }
        oc.refcnt.fetch_add(1, Ordering::AcqRel);
        drop(guard);
        Ok(Some(oc))
    }

    /// Evaluate one referenced core against the old bans; kill it or
    /// advance its pointer to `bd`.
    fn examine(&mut self, bt: &Arc<Ban>, bd: &Arc<Ban>, obans: &[Arc<Ban>], kill: bool, oc: Arc<ObjCore>) {
        let mut killed = false;
        // oldest oban first, like the pointer advancement implies
        for bl in obans.iter().rev() {
            let still = oc.ban.lock().as_ref().map_or(false, |b| Arc::ptr_eq(b, bt));
            if !still {
                break;
            }
            if bl.is_completed() || bl.is_req() {
                continue;
            }
            let matched = if kill {
                true
            } else {
                let mut tests = 0;
                let m = crate::cache::ban::ban_evaluate(
                    self.cache, bl, &oc, None, &mut tests,
                );
                self.stats.bans_lurker_tested += 1;
                self.stats.bans_lurker_tests_tested += tests;
                m
            };
            if matched {
                if kill {
                    debug!("killed for lurker cutoff");
                    self.stats.bans_lurker_obj_killed_cutoff += 1;
                } else {
                    debug!(ban = %bl.render(), "banned by lurker");
                    self.stats.bans_lurker_obj_killed += 1;
                }
                self.cache.kill(&oc);
                killed = true;
                break;
            }
        }

        let mut moved = false;
        {
            let _inner = lock_inner(&self.cache.bans);
            let mut b = oc.ban.lock();
            let still = b.as_ref().map_or(false, |x| Arc::ptr_eq(x, bt));
            if still {
                if killed || Arc::ptr_eq(bt, bd) {
                    // still ours: back on the list it goes
                    bt.objcore.lock().push_back(Arc::downgrade(&oc));
                } else {
                    *bt.refcount.lock() -= 1;
                    *bd.refcount.lock() += 1;
                    bd.objcore.lock().push_back(Arc::downgrade(&oc));
                    *b = Some(Arc::clone(bd));
                    moved = true;
                }
            }
        }
        if moved {
            self.cache.stevedore.send_event(&oc, ObjEvent::BanChange);
        }
        self.cache.deref_core_rush(oc, crate::cache::hash::RushMax::None);
    }

    /// Work through one ban's core list.
    fn test_ban(&mut self, bt: &Arc<Ban>, obans: &[Arc<Ban>], bd: &Arc<Ban>, kill: bool) {
        let mut work: VecDeque<Weak<ObjCore>> = {
            let _inner = lock_inner(&self.cache.bans);
            std::mem::take(&mut *bt.objcore.lock())
        };
        if work.is_empty() {
            return;
        }

        let mut deferred: VecDeque<Weak<ObjCore>> = VecDeque::new();
        while let Some(w) = work.pop_front() {
            self.throttle();
            match self.grab(bt, &w) {
                Ok(Some(oc)) => self.examine(bt, bd, obans, kill, oc),
                Ok(None) => {}
                Err(()) => deferred.push_back(w),
            }
        }

        // Only contested cores remain; retry them in order, giving
        // lookup a chance between attempts.
        while let Some(w) = deferred.pop_front() {
            loop {
                self.throttle();
                match self.grab(bt, &w) {
                    Ok(Some(oc)) => {
                        self.examine(bt, bd, obans, kill, oc);
                        break;
                    }
                    Ok(None) => break,
                    Err(()) => {
                        self.stats.bans_lurker_contention += 1;
                        let holdoff = self.cache.params.read().ban_lurker_holdoff;
                        sleep_secs(holdoff);
                    }
                }
            }
        }
    }

    /// One full pass. Returns how long to sleep.
    fn work(&mut self) -> Dur {
        let mut dt = LURKER_IDLE_SLEEP;
        let (sleep, age, cutoff_param) = {
            let p = self.cache.params.read();
            (p.ban_lurker_sleep, p.ban_lurker_age, p.ban_cutoff)
        };
        if sleep <= 0.0 {
            self.cleantail(&mut Vec::new());
            return dt;
        }
        let cutoff = if cutoff_param > 0 { cutoff_param } else { u32::MAX };

        let bans: Vec<Arc<Ban>> = {
            let inner = lock_inner(&self.cache.bans);
            inner.bans.iter().cloned().collect()
        };

        let d = real_now() - age;
        let mut bd: Option<Arc<Ban>> = None;
        let mut obans: Vec<Arc<Ban>> = Vec::new();

        for (count, b) in bans.iter().enumerate() {
            if let Some(target) = &bd {
                self.test_ban(b, &obans, target, count as u32 > cutoff);
            }
            if b.is_completed() {
                continue;
            }
            if b.is_req() && count as u32 <= cutoff {
                // request bans are barriers: pointers may only advance
                // up to the ban just below them
                if bd.is_some() {
                    bd = bans.get(count + 1).cloned();
                }
                continue;
            }
            let n = b.time() - d;
            if n < 0.0 {
                obans.push(Arc::clone(b));
                if bd.is_none() {
                    bd = Some(Arc::clone(b));
                }
            } else if n < dt {
                dt = n;
            }
        }

        // conceptually all obans are now completed; reap the tail first
        // and mark whatever remains
        self.cleantail(&mut obans);
        if obans.is_empty() {
            return dt;
        }
        let mut inner = lock_inner(&self.cache.bans);
        for b in &obans {
            self.cache.ban_mark_completed(&mut inner, b);
        }
        dt
    }
}

/// Lurker thread body.
pub(crate) fn lurker_thread(cache: Arc<Cache>) {
    let mut pass = LurkerPass { cache: &cache, stats: Counters::default(), batch: 0 };
    let mut gen = {
        let inner = lock_inner(&cache.bans);
        inner.generation + 1
    };

    while !cache.bans.is_shutdown() {
        let held = {
            let inner = lock_inner(&cache.bans);
            inner.holds > 0
        };
        let dt = if held { LURKER_IDLE_SLEEP } else { pass.work() };
        if cache.params.read().debug_lurker {
            debug!(sleep = dt, "lurker pass done");
        }

        let mut stats = std::mem::take(&mut pass.stats);
        cache.stats.summ(&mut stats);

        let mut inner = lock_inner(&cache.bans);
        if gen == inner.generation {
            let _ = cache.bans.lurker_cond.wait_for(
                &mut inner,
                std::time::Duration::from_secs_f64(dt.clamp(0.001, LURKER_IDLE_SLEEP)),
            );
            pass.batch = 0;
        }
        gen = inner.generation;
    }
    debug!("ban lurker exits");
}
