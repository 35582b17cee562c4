//! Runtime parameters.
//!
//! One flat table of tunables, shared as `Arc<RwLock<Params>>`. Components
//! read fields at point of use, so a management write is picked up on the
//! next tick (the acceptor nanny re-checks socket options every second).

use crate::types::Dur;
use parking_lot::RwLock;
use std::sync::Arc;

pub type SharedParams = Arc<RwLock<Params>>;

/// Number of priority classes; the reserve arithmetic divides by this.
pub const TASK_PRIO_COUNT: u32 = 6;

#[derive(Debug, Clone)]
pub struct Params {
    // -------------------------------------------------------------
    // Object index
    // -------------------------------------------------------------
    /// Waiters woken per serviceable unbusy. The first request gets one
    /// extra slot; a failed fetch wakes everyone.
    pub rush_exponent: u32,

    /// Shards of the fingerprint table.
    pub hash_shards: usize,

    /// Remap the first distinct digests onto edge bit patterns to
    /// exercise collision paths.
    pub debug_hash_edge: bool,

    /// Default object timers, applied when the fetch supplies none.
    pub default_ttl: Dur,
    pub default_grace: Dur,
    pub default_keep: Dur,

    // -------------------------------------------------------------
    // Bans
    // -------------------------------------------------------------
    /// Mark older identical bans COMPLETED on commit.
    pub ban_dups: bool,

    /// Upper bound on bans a core is evaluated against before the lurker
    /// kills it unconditionally. 0 disables the cutoff.
    pub ban_cutoff: u32,

    /// A ban must be at least this old before the lurker works on it.
    pub ban_lurker_age: Dur,

    /// Lurker inter-batch sleep. 0 disables lurker evaluation entirely
    /// (tail reaping still runs).
    pub ban_lurker_sleep: Dur,

    /// Cores examined between lurker sleeps.
    pub ban_lurker_batch: u32,

    /// Back-off when the lurker keeps losing the head-mutex race.
    pub ban_lurker_holdoff: Dur,

    // -------------------------------------------------------------
    // Worker pools
    // -------------------------------------------------------------
    pub wthread_pools: usize,
    pub wthread_min: u32,
    pub wthread_max: u32,

    /// Idle workers above `wthread_min` are retired after this long.
    pub wthread_timeout: Dur,

    /// Idle threads withheld from lower priority classes. 0 derives
    /// min/20+1.
    pub wthread_reserve: u32,

    /// Abort the process if the highest-priority queue has work but does
    /// not advance for this long.
    pub wthread_watchdog: Dur,

    pub wthread_add_delay: Dur,
    pub wthread_fail_delay: Dur,
    pub wthread_destroy_delay: Dur,

    /// Worker-local counters are folded into the pool every N tasks.
    pub wthread_stats_rate: u32,

    /// Queued tasks tolerated beyond `wthread_max`.
    pub wthread_queue_limit: u32,

    // -------------------------------------------------------------
    // Acceptor
    // -------------------------------------------------------------
    pub accept_traffic: bool,
    pub listen_depth: i32,

    /// Pacer: added on resource-exhausted accept, capped, decayed on
    /// success.
    pub acceptor_sleep_incr: Dur,
    pub acceptor_sleep_max: Dur,
    pub acceptor_sleep_decay: f64,

    /// SO_RCVTIMEO on accepted sessions; also bounds how long shutdown
    /// waits for a blocked accept.
    pub timeout_idle: Dur,

    /// SO_SNDTIMEO on accepted sessions.
    pub idle_send_timeout: Dur,

    pub tcp_keepalive_time: Dur,
    pub tcp_keepalive_probes: u32,
    pub tcp_keepalive_intvl: Dur,

    // -------------------------------------------------------------
    // Debug
    // -------------------------------------------------------------
    /// Waiting-list trace lines.
    pub debug_waitinglist: bool,

    /// Lurker trace lines and per-ban core dumps in ban.list.
    pub debug_lurker: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            rush_exponent: 3,
            hash_shards: 64,
            debug_hash_edge: false,
            default_ttl: 120.0,
            default_grace: 10.0,
            default_keep: 0.0,

            ban_dups: true,
            ban_cutoff: 0,
            ban_lurker_age: 60.0,
            ban_lurker_sleep: 0.010,
            ban_lurker_batch: 1000,
            ban_lurker_holdoff: 0.010,

            wthread_pools: 2,
            wthread_min: 10,
            wthread_max: 500,
            wthread_timeout: 300.0,
            wthread_reserve: 0,
            wthread_watchdog: 60.0,
            wthread_add_delay: 0.0,
            wthread_fail_delay: 0.2,
            wthread_destroy_delay: 1.0,
            wthread_stats_rate: 10,
            wthread_queue_limit: 20,

            accept_traffic: true,
            listen_depth: 1024,
            acceptor_sleep_incr: 0.001,
            acceptor_sleep_max: 0.050,
            acceptor_sleep_decay: 0.9,
            timeout_idle: 5.0,
            idle_send_timeout: 60.0,
            tcp_keepalive_time: 600.0,
            tcp_keepalive_probes: 5,
            tcp_keepalive_intvl: 5.0,

            debug_waitinglist: false,
            debug_lurker: false,
        }
    }
}

impl Params {
    pub fn shared(self) -> SharedParams {
        Arc::new(RwLock::new(self))
    }

    /// Idle threads withheld from the lower priority classes.
    /// Matches the pool reserve rule: explicit value clamped to at most
    /// 95% of `wthread_min`, defaulting to min/20+1, never below the
    /// number of priority classes.
    pub fn pool_reserve(&self) -> u32 {
        let lim = if self.wthread_reserve == 0 {
            self.wthread_min / 20 + 1
        } else {
            self.wthread_reserve.min(self.wthread_min * 950 / 1000)
        };
        lim.max(TASK_PRIO_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_default_derivation() {
        let mut p = Params::default();
        p.wthread_min = 100;
        p.wthread_reserve = 0;
        assert_eq!(p.pool_reserve(), 6);
        p.wthread_min = 200;
        assert_eq!(p.pool_reserve(), 11);
    }

    #[test]
    fn test_reserve_clamped_to_min() {
        let mut p = Params::default();
        p.wthread_min = 100;
        p.wthread_reserve = 1000;
        assert_eq!(p.pool_reserve(), 95);
    }

    #[test]
    fn test_reserve_never_below_prio_count() {
        let mut p = Params::default();
        p.wthread_min = 10;
        p.wthread_reserve = 2;
        assert_eq!(p.pool_reserve(), TASK_PRIO_COUNT);
    }
}
