//! Two-level statistics aggregation.
//!
//! Workers count into a private `Counters`, fold it into their pool under
//! the pool mutex every `wthread_stats_rate` tasks, and idle moments fold
//! pool counters into the process-wide set under `wstat_mtx`. This bounds
//! contention on the global mutex to one lock per flush, not per event.
//!
//! Gauges (thread counts, ban counts, object counts) are atomics updated
//! directly by whichever subsystem owns them.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Event counters accumulated per worker.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Counters {
    pub summs: u64,

    // lookup outcomes
    pub cache_hit: u64,
    pub cache_hit_grace: u64,
    pub cache_hitmiss: u64,
    pub cache_hitpass: u64,
    pub cache_miss: u64,

    // coalescing
    pub busy_sleep: u64,
    pub busy_wakeup: u64,
    pub vary_mismatch: u64,

    // sessions
    pub s_sess: u64,
    pub sess_conn: u64,
    pub sess_fail: u64,
    pub sess_fail_econnaborted: u64,
    pub sess_fail_eintr: u64,
    pub sess_fail_emfile: u64,
    pub sess_fail_ebadf: u64,
    pub sess_fail_enomem: u64,
    pub sess_fail_other: u64,

    // bans (worker side: lookup-time evaluation)
    pub bans_tested: u64,
    pub bans_tests_tested: u64,
    pub bans_obj_killed: u64,

    // lurker
    pub bans_lurker_tested: u64,
    pub bans_lurker_tests_tested: u64,
    pub bans_lurker_obj_killed: u64,
    pub bans_lurker_obj_killed_cutoff: u64,
    pub bans_lurker_contention: u64,

    // purges
    pub n_purges: u64,
    pub n_obj_purged: u64,
}

macro_rules! summ_fields {
    ($dst:expr, $src:expr, $($f:ident),+ $(,)?) => {
        $( $dst.$f += $src.$f; )+
    };
}

impl Counters {
    /// Add `src` into `self` and clear `src`.
    pub fn summ(&mut self, src: &mut Counters) {
        summ_fields!(
            self, src, summs, cache_hit, cache_hit_grace, cache_hitmiss,
            cache_hitpass, cache_miss, busy_sleep, busy_wakeup,
            vary_mismatch, s_sess, sess_conn, sess_fail,
            sess_fail_econnaborted, sess_fail_eintr, sess_fail_emfile,
            sess_fail_ebadf, sess_fail_enomem, sess_fail_other,
            bans_tested, bans_tests_tested, bans_obj_killed,
            bans_lurker_tested, bans_lurker_tests_tested,
            bans_lurker_obj_killed, bans_lurker_obj_killed_cutoff,
            bans_lurker_contention, n_purges, n_obj_purged,
        );
        *src = Counters::default();
    }
}

/// Process-wide statistics. One per server.
#[derive(Debug, Default)]
pub struct Global {
    /// `wstat_mtx`: the folded event counters.
    counters: Mutex<Counters>,

    // thread gauges
    pub threads: AtomicI64,
    pub threads_created: AtomicU64,
    pub threads_destroyed: AtomicU64,
    pub threads_failed: AtomicU64,
    pub threads_limited: AtomicU64,
    pub pools: AtomicI64,
    pub thread_queue_len: AtomicU64,

    // queue drops (folded from pools)
    pub sess_queued: AtomicU64,
    pub sess_dropped: AtomicU64,
    pub req_dropped: AtomicU64,

    // object gauges
    pub n_object: AtomicI64,
    pub n_objecthead: AtomicI64,

    // ban gauges, maintained under the ban mutex
    pub bans: AtomicI64,
    pub bans_added: AtomicU64,
    pub bans_deleted: AtomicU64,
    pub bans_completed: AtomicI64,
    pub bans_obj: AtomicI64,
    pub bans_req: AtomicI64,
    pub bans_dups: AtomicU64,
    pub bans_persisted_bytes: AtomicU64,
    pub bans_persisted_fragmentation: AtomicU64,

    // expiry engine
    pub exp_mailed: AtomicU64,
    pub exp_received: AtomicU64,
    pub n_expired: AtomicU64,

    pub uptime: AtomicU64,
}

impl Global {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a counter set into the global set.
    pub fn summ(&self, src: &mut Counters) {
        self.counters.lock().summ(src);
    }

    /// Like `summ` but gives up instead of blocking. Used from error
    /// paths that already hold other locks' attention.
    pub fn try_summ(&self, src: &mut Counters) -> bool {
        match self.counters.try_lock() {
            Some(mut g) => {
                g.summ(src);
                true
            }
            None => false,
        }
    }

    pub fn purge_stat(&self, nobj: u64) {
        let mut g = self.counters.lock();
        g.n_purges += 1;
        g.n_obj_purged += nobj;
    }

    /// Snapshot of the folded counters.
    pub fn counters(&self) -> Counters {
        self.counters.lock().clone()
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        let c = self.counters();
        serde_json::json!({
            "uptime": self.uptime.load(Ordering::Relaxed),
            "threads": self.threads.load(Ordering::Relaxed),
            "pools": self.pools.load(Ordering::Relaxed),
            "thread_queue_len": self.thread_queue_len.load(Ordering::Relaxed),
            "n_object": self.n_object.load(Ordering::Relaxed),
            "n_objecthead": self.n_objecthead.load(Ordering::Relaxed),
            "bans": self.bans.load(Ordering::Relaxed),
            "bans_completed": self.bans_completed.load(Ordering::Relaxed),
            "n_expired": self.n_expired.load(Ordering::Relaxed),
            "sess_dropped": self.sess_dropped.load(Ordering::Relaxed),
            "req_dropped": self.req_dropped.load(Ordering::Relaxed),
            "counters": c,
        })
    }
}
