//! The acceptor: listening endpoints, accept pumps and their pacing.
//!
//! Every (endpoint, pool) pair has one accept task at VCA priority.
//! The task blocks in accept inside a worker; the listener's receive
//! timeout makes the call wake periodically so shutdown and pool death
//! are observed without signalling anybody. Accepted connections are
//! handed to a fresh REQ task when a thread is free; under pressure the
//! accept task is re-queued and the current worker serves the session
//! itself, so accepting never monopolises a thread.

use crate::cache::pool::{Pool, Task, TaskPrio, Worker};
use crate::cache::sockopt::{ConnHeritage, SockOptSet, N_SOCK_OPTS};
use crate::config::SharedParams;
use crate::stats::{Counters, Global};
use crate::transport::{Session, Transport};
use crate::types::{real_now, sleep_secs};
use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Rebind attempts before a lost listen socket takes the process down.
const REOPEN_TRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("invalid listen endpoint \"{0}\"")]
    BadEndpoint(String),
    #[error("listen failed on '{endpoint}': {err}")]
    Listen { endpoint: String, err: std::io::Error },
    #[error("not accepting traffic")]
    NotAccepting,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Socket slot states; `Teardown` is the "being torn down" sentinel.
enum ListenSock {
    Closed,
    Open(Arc<Socket>),
    Teardown,
}

pub struct Listener {
    pub name: String,
    pub endpoint: String,
    addr: SocketAddr,
    sock: Mutex<ListenSock>,
    heritage: Mutex<[ConnHeritage; N_SOCK_OPTS]>,
    /// Re-test option inheritance on the next accepted session.
    test_heritage: AtomicBool,
    transport: Arc<dyn Transport>,
}

impl Listener {
    fn socket(&self) -> Option<Arc<Socket>> {
        match &*self.sock.lock() {
            ListenSock::Open(s) => Some(Arc::clone(s)),
            _ => None,
        }
    }

    fn in_teardown(&self) -> bool {
        matches!(&*self.sock.lock(), ListenSock::Teardown)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket()?.local_addr().ok()?.as_socket()
    }
}

struct ShutState {
    /// Accept tasks currently inside accept(2).
    busy: usize,
}

pub struct Acceptor {
    params: SharedParams,
    stats: Arc<Global>,
    listeners: Mutex<Vec<Arc<Listener>>>,
    sock_opts: Mutex<SockOptSet>,
    /// Exponential sleeper fed by resource-exhausted accepts.
    pace: Mutex<f64>,
    shut: Mutex<ShutState>,
    shut_cond: Condvar,
    pool_accepting: AtomicBool,
    nanny_stop: AtomicBool,
    nanny: Mutex<Option<std::thread::JoinHandle<()>>>,
    t_start: AtomicU64,
    self_weak: std::sync::Weak<Acceptor>,
}

impl Acceptor {
    pub fn new(params: SharedParams, stats: Arc<Global>) -> Arc<Acceptor> {
        let opts = SockOptSet::new(&params.read());
        Arc::new_cyclic(|w| Acceptor {
            params,
            stats,
            listeners: Mutex::new(Vec::new()),
            sock_opts: Mutex::new(opts),
            pace: Mutex::new(0.0),
            shut: Mutex::new(ShutState { busy: 0 }),
            shut_cond: Condvar::new(),
            pool_accepting: AtomicBool::new(false),
            nanny_stop: AtomicBool::new(false),
            nanny: Mutex::new(None),
            t_start: AtomicU64::new(real_now().to_bits()),
            self_weak: w.clone(),
        })
    }

    fn self_arc(&self) -> Arc<Acceptor> {
        self.self_weak.upgrade().expect("acceptor torn down under user")
    }

    pub fn is_accepting(&self) -> bool {
        self.pool_accepting.load(Ordering::Acquire)
    }

    /// Add a listening endpoint: `[name=]addr:port`.
    pub fn add_endpoint(
        &self,
        spec: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<(), AcceptError> {
        let (name, addr_str) = match spec.split_once('=') {
            Some((n, a)) => (n.to_string(), a),
            None => {
                let n = format!("a{}", self.listeners.lock().len());
                (n, spec)
            }
        };
        let addr: SocketAddr = addr_str
            .parse()
            .map_err(|_| AcceptError::BadEndpoint(spec.to_string()))?;
        self.listeners.lock().push(Arc::new(Listener {
            name,
            endpoint: addr_str.to_string(),
            addr,
            sock: Mutex::new(ListenSock::Closed),
            heritage: Mutex::new([ConnHeritage::default(); N_SOCK_OPTS]),
            test_heritage: AtomicBool::new(false),
            transport,
        }));
        Ok(())
    }

    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        self.listeners.lock().iter().cloned().collect()
    }

    fn open_socket(&self, addr: SocketAddr) -> std::io::Result<Socket> {
        let domain = Domain::for_address(addr);
        let sock = Socket::new(domain, Type::STREAM, None)?;
        sock.set_reuse_address(true)?;
        sock.bind(&addr.into())?;
        sock.listen(self.params.read().listen_depth)?;
        Ok(sock)
    }

    /// Open and option every endpoint, then let the pools accept.
    pub fn start(&self) -> Result<(), AcceptError> {
        {
            let mut opts = self.sock_opts.lock();
            opts.refresh(&self.params.read());
            for ls in self.listeners() {
                let sock = self.open_socket(ls.addr).map_err(|err| {
                    AcceptError::Listen { endpoint: ls.endpoint.clone(), err }
                })?;
                self.sock_opt_set(&opts, &ls, &sock, true);
                *ls.heritage.lock() = [ConnHeritage::default(); N_SOCK_OPTS];
                self.sock_opt_mark_listener(&opts, &ls);
                ls.test_heritage.store(true, Ordering::Release);
                *ls.sock.lock() = ListenSock::Open(Arc::new(sock));
                info!(name = %ls.name, endpoint = %ls.endpoint, "listening");
            }
        }
        self.pool_accepting.store(true, Ordering::Release);
        self.start_nanny();
        Ok(())
    }

    fn start_nanny(&self) {
        let mut nanny = self.nanny.lock();
        if nanny.is_some() {
            return;
        }
        let acc = self.self_arc();
        *nanny = Some(
            std::thread::Builder::new()
                .name("cache-acceptor".into())
                .spawn(move || nanny_thread(acc))
                .expect("spawn acceptor nanny"),
        );
    }

    /// Apply every option to a socket. For listeners only the options
    /// whose mod counter moved since the last application are touched;
    /// for sessions only the ones known not to inherit.
    fn sock_opt_set(&self, opts: &SockOptSet, ls: &Listener, sock: &Socket, listener: bool) {
        let heritage = *ls.heritage.lock();
        for (i, opt) in opts.opts().iter().enumerate() {
            if listener {
                if heritage[i].listen_mod == opt.mod_count {
                    continue;
                }
            } else if !heritage[i].sess_set {
                debug!(opt = opt.name, name = %ls.name, "may be inherited");
                continue;
            }
            if let Err(e) = opts.set(i, sock) {
                debug!(opt = opt.name, name = %ls.name, "setsockopt failed: {e}");
            }
        }
    }

    /// Record the listener as up to date with the current mod counters.
    fn sock_opt_mark_listener(&self, opts: &SockOptSet, ls: &Listener) {
        let mut heritage = ls.heritage.lock();
        for (i, opt) in opts.opts().iter().enumerate() {
            heritage[i].listen_mod = opt.mod_count;
        }
    }

    /// First session after a config change: find out which options the
    /// accepted socket did not inherit.
    fn sock_opt_test(&self, opts: &SockOptSet, ls: &Listener, sock: &Socket) {
        let mut heritage = ls.heritage.lock();
        for (i, opt) in opts.opts().iter().enumerate() {
            if heritage[i].sess_set {
                debug!(opt = opt.name, name = %ls.name, "not testing nonhereditary");
                continue;
            }
            if !opts.inherited(i, sock) {
                debug!(opt = opt.name, name = %ls.name, "confirmed non heredity");
                heritage[i].sess_set = true;
            }
        }
    }

    // ----------------------------------------------------------------
    // Pacing

    fn pace_check(&self) {
        if !self.is_accepting() {
            *self.pace.lock() = 0.0;
            return;
        }
        let p = *self.pace.lock();
        if p > 0.0 {
            sleep_secs(p);
        }
    }

    fn pace_bad(&self) {
        let (incr, max) = {
            let p = self.params.read();
            (p.acceptor_sleep_incr, p.acceptor_sleep_max)
        };
        let mut pace = self.pace.lock();
        *pace = (*pace + incr).min(max);
    }

    fn pace_good(&self) {
        if *self.pace.lock() == 0.0 {
            return;
        }
        let (incr, decay) = {
            let p = self.params.read();
            (p.acceptor_sleep_incr, p.acceptor_sleep_decay)
        };
        let mut pace = self.pace.lock();
        *pace *= decay;
        if *pace < incr {
            *pace = 0.0;
        }
    }

    #[cfg(test)]
    pub(crate) fn pace_for_test(&self) -> f64 {
        *self.pace.lock()
    }

    #[cfg(test)]
    pub(crate) fn pace_ops_for_test(&self, good: bool) {
        if good {
            self.pace_good()
        } else {
            self.pace_bad()
        }
    }

    // ----------------------------------------------------------------
    // Accept path

    /// Turn an accepted socket into a session on this worker.
    fn make_session(&self, ls: &Arc<Listener>, sock: Socket, peer: &str, wrk: &mut Worker) {
        wrk.stats.s_sess += 1;
        self.pace_good();
        wrk.stats.sess_conn += 1;

        {
            let opts = self.sock_opts.lock();
            if ls.test_heritage.swap(false, Ordering::AcqRel) {
                self.sock_opt_test(&opts, ls, &sock);
            }
            self.sock_opt_set(&opts, ls, &sock, false);
        }

        let local = sock
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .map(|a| a.to_string())
            .unwrap_or_default();
        let sess = Session {
            sock,
            remote_addr: peer.to_string(),
            local_addr: local,
            listener: ls.name.clone(),
            t_open: real_now(),
        };
        debug!(peer = %sess.remote_addr, listener = %ls.name, "session open");
        let transport = Arc::clone(&ls.transport);
        transport.new_session(wrk, sess);
    }

    /// Count and classify one failed accept; pace when it smells like
    /// resource exhaustion.
    fn accept_failed(&self, ls: &Listener, err: &std::io::Error, stats: &mut Counters) {
        match err.raw_os_error() {
            Some(libc_consts::ECONNABORTED) => stats.sess_fail_econnaborted += 1,
            Some(libc_consts::EINTR) => stats.sess_fail_eintr += 1,
            Some(libc_consts::EMFILE) => {
                stats.sess_fail_emfile += 1;
                self.pace_bad();
            }
            Some(libc_consts::EBADF) => {
                stats.sess_fail_ebadf += 1;
                self.pace_bad();
            }
            Some(libc_consts::ENOBUFS) | Some(libc_consts::ENOMEM) => {
                stats.sess_fail_enomem += 1;
                self.pace_bad();
            }
            _ => {
                stats.sess_fail_other += 1;
                self.pace_bad();
            }
        }
        stats.sess_fail += 1;
        warn!(name = %ls.name, endpoint = %ls.endpoint, "accept failed: {err}");
    }

    /// The accept pump for one (endpoint, pool) pair.
    fn accept_task(self: &Arc<Self>, pool: &Arc<Pool>, ls: &Arc<Listener>, wrk: &mut Worker) {
        while !self.is_accepting() && !pool.dying() {
            sleep_secs(0.1);
        }

        while !pool.dying() {
            self.pace_check();

            if !self.is_accepting() {
                self.requeue_accept(pool, ls);
                return;
            }

            let sock = match ls.socket() {
                Some(s) => s,
                None => {
                    if ls.in_teardown() {
                        // shut down in progress
                        sleep_secs(2.0);
                        continue;
                    }
                    self.requeue_accept(pool, ls);
                    return;
                }
            };

            {
                let mut shut = self.shut.lock();
                shut.busy += 1;
            }
            // the listener's receive timeout bounds each wait, so the
            // loop observes shutdown and pool death
            let res = loop {
                match sock.accept() {
                    Err(e)
                        if (e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut)
                            && !pool.dying()
                            && self.is_accepting() =>
                    {
                        continue;
                    }
                    other => break other,
                }
            };
            {
                let mut shut = self.shut.lock();
                shut.busy -= 1;
                if !self.is_accepting() && shut.busy == 0 {
                    self.shut_cond.notify_all();
                }
            }

            match res {
                Err(_) if pool.dying() => break,
                Err(_) if !self.is_accepting() => {
                    self.requeue_accept(pool, ls);
                    return;
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    self.accept_failed(ls, &e, &mut wrk.stats);
                    let _ = self.stats.try_summ(&mut wrk.stats);
                    continue;
                }
                Ok((conn, peer)) => {
                    let peer = peer
                        .as_socket()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "0.0.0.0:0".into());
                    let acc = self.self_arc();
                    let ls2 = Arc::clone(ls);
                    let conn_slot = Mutex::new(Some(conn));
                    let handed = pool.task_arg(
                        wrk,
                        TaskPrio::Req,
                        move |w, arg| {
                            let peer = String::from_utf8_lossy(arg).into_owned();
                            if let Some(conn) = conn_slot.lock().take() {
                                acc.make_session(&ls2, conn, &peer, w);
                            }
                        },
                        peer.as_bytes(),
                    );
                    if !handed && !pool.dying() {
                        // No thread for the session: requeue the accept
                        // pump and serve this connection ourselves
                        // (prepared on this worker by task_arg).
                        self.requeue_accept(pool, ls);
                        return;
                    }
                }
            }
        }
        debug!(name = %ls.name, "accept task exits");
    }

    fn requeue_accept(self: &Arc<Self>, pool: &Arc<Pool>, ls: &Arc<Listener>) {
        let acc = self.self_arc();
        let pool2 = Arc::clone(pool);
        let ls2 = Arc::clone(ls);
        let t = Task::new(move |wrk| acc.accept_task(&pool2, &ls2, wrk));
        if pool.task(t, TaskPrio::Vca).is_err() {
            warn!(name = %ls.name, "could not requeue accept task");
        }
    }

    /// Install one accept task per endpoint on a fresh pool.
    pub fn new_pool(self: &Arc<Self>, pool: &Arc<Pool>) {
        for ls in self.listeners() {
            self.requeue_accept(pool, &ls);
        }
    }

    /// Accept tasks notice a dying pool on their own; nothing to
    /// unhook.
    pub fn destroy_pool(&self, _pool: &Arc<Pool>) {}

    /// Endpoint-to-address map; waits until accepting so callers can
    /// connect right away.
    pub fn listen_addresses(&self) -> Result<Vec<(String, String)>, AcceptError> {
        if !self.params.read().accept_traffic {
            return Err(AcceptError::NotAccepting);
        }
        while !self.is_accepting() {
            sleep_secs(0.1);
        }
        Ok(self
            .listeners()
            .iter()
            .map(|ls| {
                let addr = ls
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".into());
                (ls.name.clone(), addr)
            })
            .collect())
    }

    /// Close and rebind every endpoint. A persistently lost listen
    /// socket is fatal.
    pub fn reopen_sockets(&self) {
        let opts = self.sock_opts.lock();
        for ls in self.listeners() {
            *ls.sock.lock() = ListenSock::Closed;
            let mut last_err = None;
            for _ in 0..REOPEN_TRIES {
                match self.open_socket(ls.addr) {
                    Ok(sock) => {
                        self.sock_opt_set(&opts, &ls, &sock, true);
                        self.sock_opt_mark_listener(&opts, &ls);
                        ls.test_heritage.store(true, Ordering::Release);
                        *ls.sock.lock() = ListenSock::Open(Arc::new(sock));
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        warn!(endpoint = %ls.endpoint, "reopen failed: {e}");
                        last_err = Some(e);
                        sleep_secs(0.5);
                    }
                }
            }
            if let Some(e) = last_err {
                error!(endpoint = %ls.endpoint, "could not reopen listen socket: {e}");
                std::process::abort();
            }
        }
    }

    /// Stop accepting: break every blocked accept, then close all
    /// listener sockets. All of them are closed before this returns.
    pub fn shutdown(&self) {
        self.pool_accepting.store(false, Ordering::Release);
        {
            let mut shut = self.shut.lock();
            while shut.busy > 0 {
                // blocked accepts wake within the listener's receive
                // timeout and see the cleared flag
                let _ = self
                    .shut_cond
                    .wait_for(&mut shut, std::time::Duration::from_millis(100));
            }
        }
        for ls in self.listeners() {
            let mut sock = ls.sock.lock();
            if matches!(&*sock, ListenSock::Open(_)) {
                *sock = ListenSock::Teardown;
            }
            *ls.heritage.lock() = [ConnHeritage::default(); N_SOCK_OPTS];
        }
        self.nanny_stop.store(true, Ordering::Release);
        if let Some(h) = self.nanny.lock().take() {
            let _ = h.join();
        }
        info!("acceptor shut down");
    }
}

/// Periodic housekeeping: uptime, and option refresh on config change.
fn nanny_thread(acc: Arc<Acceptor>) {
    let t0 = f64::from_bits(acc.t_start.load(Ordering::Relaxed));
    while !acc.nanny_stop.load(Ordering::Acquire) {
        sleep_secs(1.0);
        acc.stats
            .uptime
            .store((real_now() - t0).max(0.0) as u64, Ordering::Relaxed);
        if !acc.is_accepting() {
            continue;
        }
        let mut opts = acc.sock_opts.lock();
        if opts.refresh(&acc.params.read()) {
            for ls in acc.listeners() {
                let sock = match ls.socket() {
                    Some(s) => s,
                    None => continue, // teardown in progress
                };
                acc.sock_opt_set(&opts, &ls, &sock, true);
                acc.sock_opt_mark_listener(&opts, &ls);
                // a changed option may also change what inherits; the
                // next session re-tests
                ls.test_heritage.store(true, Ordering::Release);
                debug!(name = %ls.name, "socket options refreshed");
            }
        }
    }
}

/// The errno values the accept loop classifies. Stable on every target
/// this runs on.
mod libc_consts {
    pub const EINTR: i32 = 4;
    pub const EBADF: i32 = 9;
    pub const ENOMEM: i32 = 12;
    pub const EMFILE: i32 = 24;
    pub const ECONNABORTED: i32 = 103;
    pub const ENOBUFS: i32 = 105;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Params;
    use crate::transport::SinkTransport;

    fn test_acceptor(params: Params) -> Arc<Acceptor> {
        Acceptor::new(params.shared(), Arc::new(Global::new()))
    }

    #[test]
    fn test_endpoint_parsing() {
        let acc = test_acceptor(Params::default());
        acc.add_endpoint("web=127.0.0.1:0", Arc::new(SinkTransport)).unwrap();
        acc.add_endpoint("127.0.0.1:8080", Arc::new(SinkTransport)).unwrap();
        assert!(acc.add_endpoint("nonsense", Arc::new(SinkTransport)).is_err());
        let ls = acc.listeners();
        assert_eq!(ls[0].name, "web");
        assert_eq!(ls[1].name, "a1");
        assert_eq!(ls[1].endpoint, "127.0.0.1:8080");
    }

    #[test]
    fn test_config_change_rearms_heritage_test() {
        let params = Params::default().shared();
        let acc = Acceptor::new(params.clone(), Arc::new(Global::new()));
        acc.add_endpoint("t=127.0.0.1:0", Arc::new(SinkTransport)).unwrap();
        acc.start().unwrap();

        let ls = &acc.listeners()[0];
        // armed at startup; pretend the first session consumed it
        assert!(ls.test_heritage.load(Ordering::Acquire));
        ls.test_heritage.store(false, Ordering::Release);

        // the nanny's next tick notices the keepalive change, re-sets
        // the listener options and re-arms the heritage test
        params.write().tcp_keepalive_time = 777.0;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !ls.test_heritage.load(Ordering::Acquire) {
            assert!(
                std::time::Instant::now() < deadline,
                "nanny did not pick up the config change"
            );
            sleep_secs(0.1);
        }
        acc.shutdown();
    }

    #[test]
    fn test_pace_stays_zero_until_failure() {
        let mut p = Params::default();
        p.acceptor_sleep_incr = 0.01;
        p.acceptor_sleep_max = 0.05;
        p.acceptor_sleep_decay = 0.5;
        let acc = test_acceptor(p);

        assert_eq!(acc.pace_for_test(), 0.0);
        acc.pace_ops_for_test(true);
        assert_eq!(acc.pace_for_test(), 0.0);

        acc.pace_ops_for_test(false);
        assert!((acc.pace_for_test() - 0.01).abs() < 1e-9);
        for _ in 0..20 {
            acc.pace_ops_for_test(false);
        }
        // capped
        assert!((acc.pace_for_test() - 0.05).abs() < 1e-9);

        // decays, then snaps to zero below the increment
        acc.pace_ops_for_test(true);
        assert!((acc.pace_for_test() - 0.025).abs() < 1e-9);
        acc.pace_ops_for_test(true);
        acc.pace_ops_for_test(true);
        assert_eq!(acc.pace_for_test(), 0.0);
        // and stays there
        acc.pace_ops_for_test(true);
        assert_eq!(acc.pace_for_test(), 0.0);
    }
}
