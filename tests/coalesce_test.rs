//! Coalescing behavior of the object index: one fetch per fingerprint,
//! waiting lists, rush, grace.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use stratus::cache::{Cache, Lookup, Timers};
use stratus::{Counters, Digest, Global, MemStevedore, Params, Req};

fn new_cache() -> Arc<Cache> {
    Cache::new(
        Params::default().shared(),
        Arc::new(MemStevedore::new()),
        Arc::new(Global::new()),
    )
}

fn req_for(b: u8, url: &str) -> Req {
    let mut r = Req::new(url);
    r.digest = Digest([b; 32]);
    r
}

fn fresh_timers(ttl: f64, grace: f64, keep: f64) -> Timers {
    Timers::new(stratus::real_now(), ttl, grace, keep)
}

#[test]
fn test_coalesced_miss_three_requests() {
    let cache = new_cache();
    let mut stats = Counters::default();

    // first request misses and becomes the fetcher
    let (_, lr) = cache.lookup(req_for(1, "/a"), &mut stats);
    let fetch = match lr {
        Lookup::Miss { fetch } => fetch,
        _ => panic!("first request should miss"),
    };

    // two more requests meet the busy core and park
    let (tx, rx) = mpsc::channel();
    for _ in 0..2 {
        let cache2 = Arc::clone(&cache);
        let tx2 = tx.clone();
        let mut r = req_for(1, "/a");
        r.on_rush(move |req| {
            let mut stats = Counters::default();
            let (_, lr) = cache2.lookup(req, &mut stats);
            let oc = match lr {
                Lookup::Hit(oc) => oc,
                _ => panic!("rushed request should hit"),
            };
            tx2.send(oc).unwrap();
        });
        let (taken, lr) = cache.lookup(r, &mut stats);
        assert!(matches!(lr, Lookup::Parked));
        assert!(taken.is_none());
    }
    assert_eq!(stats.busy_sleep, 2);

    // the fetch completes; waiters are rushed and each observes a hit
    fetch.set_timers(fresh_timers(60.0, 10.0, 0.0));
    cache.unbusy(&fetch);

    let a = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    let b = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    assert!(Arc::ptr_eq(&a, &fetch));
    assert!(Arc::ptr_eq(&b, &fetch));
    assert_eq!(fetch.hits.load(Ordering::Relaxed), 2);
}

#[test]
fn test_failed_fetch_wakes_all_waiters() {
    let cache = new_cache();
    let mut stats = Counters::default();

    let (_, lr) = cache.lookup(req_for(2, "/b"), &mut stats);
    let fetch = match lr {
        Lookup::Miss { fetch } => fetch,
        _ => panic!("expected miss"),
    };

    let woken = Arc::new(AtomicU32::new(0));
    let (tx, rx) = mpsc::channel();
    for _ in 0..5 {
        let cache2 = Arc::clone(&cache);
        let tx2 = tx.clone();
        let woken2 = Arc::clone(&woken);
        let mut r = req_for(2, "/b");
        r.on_rush(move |req| {
            woken2.fetch_add(1, Ordering::SeqCst);
            let mut stats = Counters::default();
            let (_, lr) = cache2.lookup(req, &mut stats);
            // the failed core is skipped; each retry becomes a fetcher
            // or parks on another retry's fetch
            match lr {
                Lookup::Miss { fetch } => {
                    cache2.fail(&fetch);
                    cache2.deref_core(fetch);
                    tx2.send(()).unwrap();
                }
                Lookup::Parked => {}
                _ => panic!("unexpected outcome after failure"),
            }
        });
        let (_, lr) = cache.lookup(r, &mut stats);
        assert!(matches!(lr, Lookup::Parked));
    }

    // a failed fetch must wake everyone: they all have to retry
    cache.fail(&fetch);
    cache.deref_core(fetch);

    // at least one retry completed the cycle; all five were woken
    rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    assert_eq!(woken.load(Ordering::SeqCst), 5);
}

#[test]
fn test_unbusy_then_lookup_bumps_ref_once() {
    let cache = new_cache();
    let mut stats = Counters::default();

    let (_, lr) = cache.lookup(req_for(3, "/c"), &mut stats);
    let fetch = match lr {
        Lookup::Miss { fetch } => fetch,
        _ => panic!("expected miss"),
    };
    fetch.set_timers(fresh_timers(60.0, 0.0, 0.0));
    cache.unbusy(&fetch);
    let before = fetch.refcnt();

    let (_, lr) = cache.lookup(req_for(3, "/c"), &mut stats);
    match lr {
        Lookup::Hit(oc) => {
            assert!(Arc::ptr_eq(&oc, &fetch));
            assert_eq!(oc.refcnt(), before + 1);
            cache.deref_core(oc);
        }
        _ => panic!("expected hit"),
    }
    assert_eq!(fetch.refcnt(), before);
}

#[test]
fn test_grace_serves_stale_while_refetching() {
    let cache = new_cache();
    let mut stats = Counters::default();

    // build an object that expired 1s ago but has a long grace
    let (_, lr) = cache.lookup(req_for(4, "/d"), &mut stats);
    let stale = match lr {
        Lookup::Miss { fetch } => fetch,
        _ => panic!("expected miss"),
    };
    stale.set_timers(Timers::new(stratus::real_now() - 2.0, 1.0, 60.0, 0.0));
    cache.unbusy(&stale);

    // the next request is served stale and starts the refresh
    let (_, lr) = cache.lookup(req_for(4, "/d"), &mut stats);
    let refresh = match lr {
        Lookup::Grace { stale: s, fetch } => {
            assert!(Arc::ptr_eq(&s, &stale));
            cache.deref_core(s);
            fetch.expect("first grace request refreshes")
        }
        _ => panic!("expected grace"),
    };

    // with the refresh in flight, further requests still get the stale
    // object and do not insert a second fetch
    let (_, lr) = cache.lookup(req_for(4, "/d"), &mut stats);
    match lr {
        Lookup::Grace { stale: s, fetch } => {
            assert!(Arc::ptr_eq(&s, &stale));
            assert!(fetch.is_none());
            cache.deref_core(s);
        }
        _ => panic!("expected grace without a second fetch"),
    }
    assert_eq!(stats.cache_hit_grace, 2);

    cache.fail(&refresh);
    cache.deref_core(refresh);
}

#[test]
fn test_keep_window_parks_on_busy() {
    let cache = new_cache();
    let mut stats = Counters::default();

    // expired beyond grace, only the keep window remains
    let (_, lr) = cache.lookup(req_for(5, "/e"), &mut stats);
    let old = match lr {
        Lookup::Miss { fetch } => fetch,
        _ => panic!("expected miss"),
    };
    old.set_timers(Timers::new(stratus::real_now() - 10.0, 1.0, 0.0, 600.0));
    cache.unbusy(&old);

    // revalidation candidate comes back along with the fetch slot
    let (_, lr) = cache.lookup(req_for(5, "/e"), &mut stats);
    let fetch = match lr {
        Lookup::MissExp { stale, fetch } => {
            assert!(Arc::ptr_eq(&stale, &old));
            cache.deref_core(stale);
            fetch
        }
        _ => panic!("expected revalidation miss"),
    };

    // nothing serveable while that fetch runs: the next request parks
    let mut r = req_for(5, "/e");
    r.on_rush(|_req| {});
    let (_, lr) = cache.lookup(r, &mut stats);
    assert!(matches!(lr, Lookup::Parked));

    cache.fail(&fetch);
    cache.deref_core(fetch);
}

#[test]
fn test_vary_mismatch_does_not_coalesce() {
    let cache = new_cache();
    let mut stats = Counters::default();

    let (_, lr) = cache.lookup(req_for(6, "/f"), &mut stats);
    let fetch = match lr {
        Lookup::Miss { fetch } => fetch,
        _ => panic!("expected miss"),
    };
    // the in-flight fetch announces a vary signature
    *fetch.boc().unwrap().vary.lock() = Some(b"gzip".to_vec());

    // a request with a different signature must not wait on it
    let mut r = req_for(6, "/f");
    r.vary_key = Some(b"br".to_vec());
    let (_, lr) = cache.lookup(r, &mut stats);
    match lr {
        Lookup::Miss { fetch: f2 } => {
            assert!(!Arc::ptr_eq(&f2, &fetch));
            cache.fail(&f2);
            cache.deref_core(f2);
        }
        _ => panic!("vary mismatch should miss"),
    }
    assert_eq!(stats.vary_mismatch, 1);

    cache.fail(&fetch);
    cache.deref_core(fetch);
}
