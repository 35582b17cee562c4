//! Expiry engine behavior: the timer heap, rearm/reduce, and the
//! engine thread reaping expired objects.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use stratus::cache::binheap::NOIDX;
use stratus::cache::pool::PoolSet;
use stratus::cache::{Cache, Lookup, Timers};
use stratus::{Counters, Digest, Global, MemStevedore, Params, Req};

fn started_cache() -> (Arc<Cache>, Arc<PoolSet>) {
    let mut params = Params::default();
    params.wthread_pools = 1;
    params.wthread_min = 2;
    params.wthread_max = 4;
    // keep the lurker quiet; this suite is about expiry
    params.ban_lurker_sleep = 0.0;
    let cache = Cache::new(
        params.shared(),
        Arc::new(MemStevedore::new()),
        Arc::new(Global::new()),
    );
    let pools = PoolSet::new(cache.params.clone(), Arc::clone(&cache.stats));
    pools.new_pool();
    cache.start(&pools);
    (cache, pools)
}

fn req_for(b: u8) -> Req {
    let mut r = Req::new("/exp");
    r.digest = Digest([b; 32]);
    r
}

fn seed(cache: &Arc<Cache>, b: u8, timers: Timers) -> Arc<stratus::ObjCore> {
    let mut stats = Counters::default();
    let (_, lr) = cache.lookup(req_for(b), &mut stats);
    let fetch = match lr {
        Lookup::Miss { fetch } => fetch,
        _ => panic!("expected miss while seeding"),
    };
    fetch.set_timers(timers);
    cache.unbusy(&fetch);
    fetch
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !cond() {
        assert!(std::time::Instant::now() < deadline, "timed out: {what}");
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
}

#[test]
fn test_zero_ttl_expires_immediately() {
    let (cache, _pools) = started_cache();
    let oc = seed(&cache, 1, Timers::new(stratus::real_now(), 0.0, 0.0, 0.0));
    let expired_before = cache.stats.n_expired.load(Ordering::Relaxed);

    // the engine's first pass after the insert reaps it
    wait_until("zero-ttl object expired", || oc.is_dying());
    wait_until("expiry counted", || {
        cache.stats.n_expired.load(Ordering::Relaxed) > expired_before
    });
    // the engine dropped its reference; only the fetcher's remains
    wait_until("engine reference dropped", || oc.refcnt() == 1);
    assert_eq!(oc.timer_idx(), NOIDX);

    cache.deref_core(oc);
    cache.shutdown();
}

#[test]
fn test_long_ttl_object_stays() {
    let (cache, _pools) = started_cache();
    let oc = seed(&cache, 2, Timers::new(stratus::real_now(), 3600.0, 0.0, 0.0));

    wait_until("object entered the heap", || oc.timer_idx() != NOIDX);
    std::thread::sleep(std::time::Duration::from_millis(300));
    assert!(!oc.is_dying());
    assert_ne!(oc.timer_idx(), NOIDX);

    cache.deref_core(oc);
    cache.shutdown();
}

#[test]
fn test_insert_then_remove_leaves_heap_unchanged() {
    let (cache, _pools) = started_cache();
    let keeper = seed(&cache, 3, Timers::new(stratus::real_now(), 3600.0, 0.0, 0.0));
    wait_until("keeper on the heap", || keeper.timer_idx() != NOIDX);

    let victim = seed(&cache, 4, Timers::new(stratus::real_now(), 3600.0, 0.0, 0.0));
    cache.expiry_remove(&victim);

    // the remove unwinds the engine's interest and reference
    wait_until("victim off the engine", || victim.refcnt() == 1);
    assert_eq!(victim.timer_idx(), NOIDX);
    // and the bystander is untouched
    assert_ne!(keeper.timer_idx(), NOIDX);
    assert!(!keeper.is_dying());

    cache.deref_core(victim);
    cache.deref_core(keeper);
    cache.shutdown();
}

#[test]
fn test_rearm_shortens_deadline() {
    let (cache, _pools) = started_cache();
    let oc = seed(&cache, 5, Timers::new(stratus::real_now(), 3600.0, 0.0, 0.0));
    wait_until("object on the heap", || oc.timer_idx() != NOIDX);

    // pull the ttl down to nothing; the engine reaps on its next pass
    cache.expiry_rearm(&oc, stratus::real_now(), 0.0, 0.0, 0.0);
    wait_until("rearmed object expired", || oc.is_dying());

    cache.deref_core(oc);
    cache.shutdown();
}

#[test]
fn test_reduce_never_extends() {
    let (cache, _pools) = started_cache();
    let now = stratus::real_now();
    let oc = seed(&cache, 6, Timers::new(now, 100.0, 20.0, 5.0));

    // longer values are ignored
    cache.expiry_reduce(&oc, now, 500.0, 50.0, 50.0);
    let t = oc.timers();
    assert_eq!(t.ttl, 100.0);
    assert_eq!(t.grace, 20.0);
    assert_eq!(t.keep, 5.0);

    // shorter values stick
    cache.expiry_reduce(&oc, now, 50.0, 2.0, 0.0);
    let t = oc.timers();
    assert!((t.t_origin + t.ttl - (now + 50.0)).abs() < 1.0);
    assert_eq!(t.grace, 2.0);
    assert_eq!(t.keep, 0.0);

    cache.deref_core(oc);
    cache.shutdown();
}

#[test]
fn test_purge_reaps_whole_head() {
    let (cache, _pools) = started_cache();
    let digest = Digest([7; 32]);
    let oc = seed(&cache, 7, Timers::new(stratus::real_now(), 3600.0, 60.0, 0.0));
    wait_until("object on the heap", || oc.timer_idx() != NOIDX);

    let n = cache.purge_digest(&digest, stratus::real_now(), 0.0, 0.0, 0.0);
    assert_eq!(n, 1);

    // zeroed timers mean the engine expires it right away
    wait_until("purged object expired", || oc.is_dying());
    // missing heads purge nothing
    assert_eq!(
        cache.purge_digest(&Digest([99; 32]), stratus::real_now(), 0.0, 0.0, 0.0),
        0
    );

    cache.deref_core(oc);
    cache.shutdown();
}

#[test]
fn test_timer_when_is_full_window_sum() {
    // the heap key covers ttl, grace and keep
    let t = Timers::new(1000.0, 10.0, 20.0, 30.0);
    assert_eq!(t.when(), 1060.0);
}
