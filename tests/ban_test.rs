//! Ban list behavior: lookup-time invalidation, the lurker, dedup and
//! the persistence round-trip.

use std::sync::Arc;
use stratus::cache::ban::{ban_flags, ban_time};
use stratus::cache::pool::PoolSet;
use stratus::cache::{Cache, Lookup, Timers};
use stratus::{Counters, Digest, Global, MemStevedore, ObjAttr, Params, Req};

fn new_cache_with(params: Params) -> Arc<Cache> {
    Cache::new(
        params.shared(),
        Arc::new(MemStevedore::new()),
        Arc::new(Global::new()),
    )
}

fn new_cache() -> Arc<Cache> {
    new_cache_with(Params::default())
}

fn req_for(b: u8, url: &str) -> Req {
    let mut r = Req::new(url);
    r.digest = Digest([b; 32]);
    r
}

/// Insert a serviceable object for the given digest and url.
fn insert_obj(cache: &Arc<Cache>, b: u8, url: &str) -> Arc<stratus::ObjCore> {
    let mut stats = Counters::default();
    let (_, lr) = cache.lookup(req_for(b, url), &mut stats);
    let fetch = match lr {
        Lookup::Miss { fetch } => fetch,
        _ => panic!("expected miss while seeding"),
    };
    fetch.set_timers(Timers::new(stratus::real_now(), 600.0, 10.0, 0.0));
    cache.unbusy(&fetch);
    fetch
}

#[test]
fn test_ban_kills_at_lookup() {
    let cache = new_cache();
    let mut stats = Counters::default();
    let oc = insert_obj(&cache, 1, "/x");

    let mut proto = cache.ban_build();
    proto.add_test("req.url", "==", "/x").unwrap();
    cache.ban_commit(proto).unwrap();

    // the walk evaluates the new ban, kills the object and misses
    let (_, lr) = cache.lookup(req_for(1, "/x"), &mut stats);
    match lr {
        Lookup::Miss { fetch } => {
            cache.fail(&fetch);
            cache.deref_core(fetch);
        }
        _ => panic!("banned object must not hit"),
    }
    assert!(oc.is_dying());
    assert_eq!(stats.bans_obj_killed, 1);

    cache.deref_core(oc);
}

#[test]
fn test_non_matching_ban_fast_forwards_pointer() {
    let cache = new_cache();
    let mut stats = Counters::default();
    let oc = insert_obj(&cache, 2, "/y");
    let b1 = oc.ban().expect("published core has a ban link");

    let mut proto = cache.ban_build();
    proto.add_test("req.url", "==", "/other").unwrap();
    let b2 = cache.ban_commit(proto).unwrap();

    let (_, lr) = cache.lookup(req_for(2, "/y"), &mut stats);
    match lr {
        Lookup::Hit(hit) => {
            cache.deref_core(hit);
        }
        _ => panic!("non-matching ban must not kill"),
    }
    // the pointer moved over the checked ban to the head
    let now_at = oc.ban().unwrap();
    assert!(Arc::ptr_eq(&now_at, &b2));
    assert!(!Arc::ptr_eq(&now_at, &b1));

    cache.deref_core(oc);
}

#[test]
fn test_obj_ttl_ban() {
    let cache = new_cache();
    let mut stats = Counters::default();
    let oc = insert_obj(&cache, 3, "/long");

    // the object has 600s of ttl left, so "obj.ttl > 1m" matches
    let mut proto = cache.ban_build();
    proto.add_test("obj.ttl", ">", "1m").unwrap();
    cache.ban_commit(proto).unwrap();

    let (_, lr) = cache.lookup(req_for(3, "/long"), &mut stats);
    match lr {
        Lookup::Miss { fetch } => {
            cache.fail(&fetch);
            cache.deref_core(fetch);
        }
        _ => panic!("ttl ban must kill"),
    }
    assert!(oc.is_dying());
    cache.deref_core(oc);
}

#[test]
fn test_obj_header_regex_ban() {
    let cache = new_cache();
    let mut stats = Counters::default();
    let oc = insert_obj(&cache, 4, "/tagged");
    stratus::MemStevedore::set_attr(
        &oc,
        ObjAttr::Headers,
        b"X-Tag: alpha\r\nContent-Type: text/plain".to_vec(),
    );

    let mut proto = cache.ban_build();
    proto.add_test("obj.http.X-Tag", "~", "^al").unwrap();
    cache.ban_commit(proto).unwrap();

    let (_, lr) = cache.lookup(req_for(4, "/tagged"), &mut stats);
    assert!(matches!(lr, Lookup::Miss { .. } | Lookup::HitMiss { .. }));
    assert!(oc.is_dying());
    if let Lookup::Miss { fetch } = lr {
        cache.fail(&fetch);
        cache.deref_core(fetch);
    }
    cache.deref_core(oc);
}

#[test]
fn test_lurker_advances_pointer_and_reaps() {
    let mut params = Params::default();
    params.ban_lurker_age = 0.0;
    params.ban_lurker_sleep = 0.001;
    params.wthread_pools = 1;
    params.wthread_min = 2;
    params.wthread_max = 4;
    let cache = new_cache_with(params);
    let stats = Arc::clone(&cache.stats);
    let pools = PoolSet::new(cache.params.clone(), stats);
    pools.new_pool();
    cache.start(&pools);
    // release the load-time hold so the lurker may work
    cache.ban_compile();

    // B1, then an object pointing at B1, then B2; neither ban matches
    let mut proto = cache.ban_build();
    proto.add_test("obj.status", "==", "999").unwrap();
    let b1 = cache.ban_commit(proto).unwrap();

    let oc = insert_obj(&cache, 5, "/z");
    assert!(Arc::ptr_eq(&oc.ban().unwrap(), &b1));

    let mut proto = cache.ban_build();
    proto.add_test("obj.status", "==", "998").unwrap();
    let b2 = cache.ban_commit(proto).unwrap();

    // one lurker pass moves the pointer up and strands B1 at refcount
    // zero, ready for the tail reap
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let at = oc.ban().unwrap();
        if Arc::ptr_eq(&at, &b2) {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "lurker did not advance the ban pointer"
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert!(!oc.is_dying());

    // B1 (and the place-holder behind it) disappear from the list
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let snap = cache.bans.snapshot();
        if !snap.iter().any(|b| Arc::ptr_eq(b, &b1)) {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "unreferenced tail ban was not reaped"
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    cache.deref_core(oc);
    cache.shutdown();
}

#[test]
fn test_lurker_kills_matching_object() {
    let mut params = Params::default();
    params.ban_lurker_age = 0.0;
    params.ban_lurker_sleep = 0.001;
    let cache = new_cache_with(params);
    let pools = PoolSet::new(cache.params.clone(), Arc::clone(&cache.stats));
    pools.new_pool();
    cache.start(&pools);
    cache.ban_compile();

    let oc = insert_obj(&cache, 6, "/doomed");
    // obj.age >= 0s matches everything ever cached
    let mut proto = cache.ban_build();
    proto.add_test("obj.age", ">=", "0s").unwrap();
    cache.ban_commit(proto).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !oc.is_dying() {
        assert!(
            std::time::Instant::now() < deadline,
            "lurker did not kill the matching object"
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    cache.deref_core(oc);
    cache.shutdown();
}

#[test]
fn test_dedup_cancels_older_identical() {
    let cache = new_cache();
    let mut proto = cache.ban_build();
    proto.add_test("req.url", "==", "/dup").unwrap();
    let old = cache.ban_commit(proto).unwrap();
    assert!(!old.is_completed());

    let mut proto = cache.ban_build();
    proto.add_test("req.url", "==", "/dup").unwrap();
    let new = cache.ban_commit(proto).unwrap();

    assert!(old.is_completed());
    assert!(!new.is_completed());
}

#[test]
fn test_nodedup_is_never_cancelled() {
    let cache = new_cache();
    let mut proto = stratus::BanProto::with_flags(ban_flags::NODEDUP);
    proto.add_test("req.url", "==", "/keep").unwrap();
    let protected = cache.ban_commit(proto).unwrap();

    // an identical later ban (with and without the flag) cancels nothing
    let mut proto = cache.ban_build();
    proto.add_test("req.url", "==", "/keep").unwrap();
    cache.ban_commit(proto).unwrap();
    assert!(!protected.is_completed());

    let mut proto = stratus::BanProto::with_flags(ban_flags::NODEDUP);
    proto.add_test("req.url", "==", "/keep").unwrap();
    cache.ban_commit(proto).unwrap();
    assert!(!protected.is_completed());
}

#[test]
fn test_list_is_strictly_newest_first() {
    let cache = new_cache();
    for i in 0..5 {
        let mut proto = cache.ban_build();
        proto.add_test("req.url", "==", &format!("/{i}")).unwrap();
        cache.ban_commit(proto).unwrap();
    }
    let snap = cache.bans.snapshot();
    for pair in snap.windows(2) {
        assert!(pair[0].time() > pair[1].time());
    }
}

#[test]
fn test_export_reload_roundtrip() {
    let cache = new_cache();
    // a mixed list: live, regex, duration, and one completed duplicate
    let mut proto = cache.ban_build();
    proto.add_test("req.url", "==", "/dup").unwrap();
    cache.ban_commit(proto).unwrap();
    let mut proto = cache.ban_build();
    proto.add_test("req.url", "==", "/dup").unwrap();
    cache.ban_commit(proto).unwrap();
    let mut proto = cache.ban_build();
    proto.add_test("obj.http.X-T", "~", "^a.c$").unwrap();
    proto.add_test("obj.ttl", "<=", "2h").unwrap();
    cache.ban_commit(proto).unwrap();

    let bytes = cache.ban_export();
    assert!(!bytes.is_empty());
    // exported specs are newest last
    let first_time = ban_time(&bytes).unwrap();
    assert!(first_time < cache.bans.head().time());

    let other = new_cache();
    other.ban_reload(&bytes).unwrap();
    for b in cache.bans.snapshot() {
        let found = other
            .bans
            .find_by_timestamp(b.time())
            .unwrap_or_else(|| panic!("reloaded list lost ban at {}", b.time()));
        assert_eq!(found.is_completed(), b.is_completed());
        assert_eq!(found.render(), b.render());
    }

    // a second reload of the same bytes changes nothing
    let len = other.bans.snapshot().len();
    other.ban_reload(&bytes).unwrap();
    assert_eq!(other.bans.snapshot().len(), len);
}

#[test]
fn test_commit_after_shutdown_fails() {
    let cache = new_cache();
    cache.shutdown();
    let mut proto = cache.ban_build();
    proto.add_test("req.url", "==", "/late").unwrap();
    assert!(matches!(
        cache.ban_commit(proto),
        Err(stratus::BanError::ShuttingDown)
    ));
}

#[test]
fn test_find_by_timestamp() {
    let cache = new_cache();
    let mut proto = cache.ban_build();
    proto.add_test("req.url", "==", "/t").unwrap();
    let b = cache.ban_commit(proto).unwrap();
    let found = cache.bans.find_by_timestamp(b.time()).unwrap();
    assert!(Arc::ptr_eq(&found, &b));
    assert!(cache.bans.find_by_timestamp(b.time() + 1.0).is_none());
}
