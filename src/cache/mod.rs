//! The cache core: object index, ban list, expiry engine and their
//! shared state.

pub mod acceptor;
pub mod ban;
pub mod ban_build;
pub mod ban_lurker;
pub mod binheap;
pub mod expire;
pub mod hash;
pub mod objcore;
pub mod objhead;
pub mod pool;
pub mod sockopt;

pub use ban::{Ban, BanList};
pub use ban_build::{BanError, BanProto};
pub use expire::{exp_ttl, exp_ttl_grace, Expiry};
pub use hash::{Index, Lookup, RushMax};
pub use objcore::{Boc, BocState, ObjCore, Timers};
pub use objhead::ObjHead;

use crate::config::SharedParams;
use crate::stats::Global;
use crate::storage::Stevedore;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Everything the four core subsystems share. Operations live in the
/// submodules as `impl Cache` blocks.
pub struct Cache {
    pub params: SharedParams,
    pub stats: Arc<Global>,
    pub stevedore: Arc<dyn Stevedore>,
    pub(crate) index: Index,
    pub bans: BanList,
    pub(crate) expiry: Expiry,
    self_weak: Weak<Cache>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Cache {
    pub fn new(
        params: SharedParams,
        stevedore: Arc<dyn Stevedore>,
        stats: Arc<Global>,
    ) -> Arc<Cache> {
        let shards = params.read().hash_shards;
        let cache = Arc::new_cyclic(|w| Cache {
            params,
            stats,
            stevedore,
            index: Index::new(shards),
            bans: BanList::new(),
            expiry: Expiry::new(),
            self_weak: w.clone(),
            threads: Mutex::new(Vec::new()),
        });

        // The list always carries a place-holder ban so the head exists
        // before the first real ban is committed.
        let proto = BanProto::new();
        let b = cache.ban_commit(proto).expect("placeholder ban commit");
        {
            let mut inner = ban::lock_inner(&cache.bans);
            cache.ban_mark_completed(&mut inner, &b);
        }
        cache
    }

    pub(crate) fn self_arc(&self) -> Arc<Cache> {
        self.self_weak.upgrade().expect("cache torn down under user")
    }

    /// Spawn the expiry engine and the ban lurker.
    pub fn start(self: &Arc<Self>, pools: &Arc<pool::PoolSet>) {
        let mut threads = self.threads.lock();
        let c = Arc::clone(self);
        let p = Arc::clone(pools);
        threads.push(
            std::thread::Builder::new()
                .name("cache-exp".into())
                .spawn(move || expire::engine_thread(c, p))
                .expect("spawn cache-exp"),
        );
        let c = Arc::clone(self);
        threads.push(
            std::thread::Builder::new()
                .name("ban-lurker".into())
                .spawn(move || ban_lurker::lurker_thread(c))
                .expect("spawn ban-lurker"),
        );
    }

    /// Stop the background threads and compact the persisted ban list.
    /// After this no new bans are accepted and no ban-info callbacks
    /// fire.
    pub fn shutdown(&self) {
        self.ban_shutdown_list();
        self.expiry.begin_shutdown();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for t in threads {
            let _ = t.join();
        }
        self.ban_final_export();
    }
}

#[cfg(test)]
pub(crate) fn test_cache() -> Arc<Cache> {
    use crate::config::Params;
    use crate::storage::MemStevedore;
    Cache::new(
        Params::default().shared(),
        Arc::new(MemStevedore::new()),
        Arc::new(Global::new()),
    )
}
