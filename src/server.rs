//! Assembly of the cache core: pools, acceptor, index, bans, expiry.

use crate::cache::acceptor::{AcceptError, Acceptor};
use crate::cache::pool::{Pool, PoolSet};
use crate::cache::Cache;
use crate::config::SharedParams;
use crate::stats::Global;
use crate::storage::Stevedore;
use crate::transport::{SinkTransport, Transport, TransportRegistry};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("already running")]
    AlreadyRunning,
    #[error("not running")]
    NotRunning,
    #[error("child has already run; start a new process")]
    Retired,
    #[error(transparent)]
    Accept(#[from] AcceptError),
}

pub struct Server {
    pub params: SharedParams,
    pub stats: Arc<Global>,
    pub cache: Arc<Cache>,
    pub pools: Arc<PoolSet>,
    pub acceptor: Arc<Acceptor>,
    pub transports: Arc<TransportRegistry>,
    default_transport: Arc<dyn Transport>,
    running: AtomicBool,
    /// Teardown is terminal; a stopped child is not restarted in-place.
    retired: AtomicBool,
    own_pools: Mutex<Vec<Arc<Pool>>>,
    t_start: f64,
}

impl Server {
    pub fn new(params: SharedParams, stevedore: Arc<dyn Stevedore>) -> Arc<Server> {
        let stats = Arc::new(Global::new());
        let cache = Cache::new(params.clone(), stevedore, Arc::clone(&stats));
        let pools = PoolSet::new(params.clone(), Arc::clone(&stats));
        let transports = TransportRegistry::new();
        let default_transport: Arc<dyn Transport> = Arc::new(SinkTransport);
        transports.register(Arc::clone(&default_transport));
        let acceptor = Acceptor::new(params.clone(), Arc::clone(&stats));
        Arc::new(Server {
            params,
            stats,
            cache,
            pools,
            acceptor,
            transports,
            default_transport,
            running: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            own_pools: Mutex::new(Vec::new()),
            t_start: crate::types::real_now(),
        })
    }

    pub fn t_start(&self) -> f64 {
        self.t_start
    }

    /// Add a listening endpoint served by the default transport.
    pub fn add_listen(&self, spec: &str) -> Result<(), AcceptError> {
        self.acceptor
            .add_endpoint(spec, Arc::clone(&self.default_transport))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bring everything up: worker pools with their accept tasks, the
    /// expiry engine, the ban lurker, then the listeners.
    pub fn start(&self) -> Result<(), ServerError> {
        if self.retired.load(Ordering::Acquire) {
            return Err(ServerError::Retired);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyRunning);
        }
        let npools = self.params.read().wthread_pools;
        for _ in 0..npools {
            let pool = self.pools.new_pool();
            self.acceptor.new_pool(&pool);
            self.own_pools.lock().push(pool);
        }
        self.cache.start(&self.pools);
        self.cache.ban_compile();
        if self.params.read().accept_traffic {
            self.acceptor.start()?;
        }
        info!("server started");
        Ok(())
    }

    /// Orderly teardown: stop accepting, drain pools, stop the engine
    /// threads, compact the ban list.
    pub fn stop(&self) -> Result<(), ServerError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(ServerError::NotRunning);
        }
        self.retired.store(true, Ordering::Release);
        self.acceptor.shutdown();
        for pool in self.own_pools.lock().drain(..) {
            self.acceptor.destroy_pool(&pool);
            self.pools.destroy_pool(&pool);
        }
        self.cache.shutdown();
        info!("server stopped");
        Ok(())
    }
}
