//! The managed socket-option set.
//!
//! Some kernels do not inherit every option from the listening socket
//! to the accepted one, so each option carries a mod counter and each
//! endpoint tracks, per option, whether accepted sockets need an
//! explicit set. A changed configuration bumps the counter, forcing a
//! re-set on the listener and a re-test on the next accepted session.

use crate::config::Params;
use socket2::{Socket, TcpKeepalive};
use std::time::Duration;

pub const N_SOCK_OPTS: usize = 8;

fn secs(d: f64) -> Duration {
    Duration::from_secs_f64(d.max(0.0))
}

/// A typed option value; variants mirror what the kernel stores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptValue {
    /// SO_LINGER; disabled so close(2) never blocks on trouble-hit
    /// connections.
    Linger(Option<Duration>),
    /// SO_KEEPALIVE; on, to notice clients that hung up while parked
    /// on a waiting list.
    KeepAlive(bool),
    /// SO_SNDTIMEO.
    SndTimeo(Duration),
    /// SO_RCVTIMEO. On the listener this doubles as the accept wakeup
    /// for shutdown.
    RcvTimeo(Duration),
    /// TCP_NODELAY; on, latency beats Nagle here.
    NoDelay(bool),
    KeepIdle(Duration),
    KeepCnt(u32),
    KeepIntvl(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct SockOpt {
    pub name: &'static str,
    pub value: OptValue,
    /// Bumped whenever the configured value changes; non-zero from the
    /// start so the initial set always happens.
    pub mod_count: u32,
}

/// Per-endpoint, per-option inheritance state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnHeritage {
    /// The option did not inherit on this endpoint; set it on every
    /// accepted socket.
    pub sess_set: bool,
    /// Mod counter last applied to the listening socket.
    pub listen_mod: u32,
}

pub struct SockOptSet {
    opts: [SockOpt; N_SOCK_OPTS],
}

impl SockOptSet {
    pub fn new(params: &Params) -> Self {
        let mut set = Self {
            opts: [
                SockOpt { name: "SO_LINGER", value: OptValue::Linger(None), mod_count: 1 },
                SockOpt { name: "SO_KEEPALIVE", value: OptValue::KeepAlive(true), mod_count: 1 },
                SockOpt {
                    name: "SO_SNDTIMEO",
                    value: OptValue::SndTimeo(Duration::ZERO),
                    mod_count: 1,
                },
                SockOpt {
                    name: "SO_RCVTIMEO",
                    value: OptValue::RcvTimeo(Duration::ZERO),
                    mod_count: 1,
                },
                SockOpt { name: "TCP_NODELAY", value: OptValue::NoDelay(true), mod_count: 1 },
                SockOpt {
                    name: "TCP_KEEPIDLE",
                    value: OptValue::KeepIdle(Duration::ZERO),
                    mod_count: 1,
                },
                SockOpt { name: "TCP_KEEPCNT", value: OptValue::KeepCnt(0), mod_count: 1 },
                SockOpt {
                    name: "TCP_KEEPINTVL",
                    value: OptValue::KeepIntvl(Duration::ZERO),
                    mod_count: 1,
                },
            ],
        };
        set.refresh(params);
        set
    }

    pub fn opts(&self) -> &[SockOpt; N_SOCK_OPTS] {
        &self.opts
    }

    /// Pull current values from the configuration. Returns true when
    /// any option changed (its mod counter was bumped).
    pub fn refresh(&mut self, params: &Params) -> bool {
        let wanted = [
            OptValue::Linger(None),
            OptValue::KeepAlive(true),
            OptValue::SndTimeo(secs(params.idle_send_timeout)),
            OptValue::RcvTimeo(secs(params.timeout_idle)),
            OptValue::NoDelay(true),
            OptValue::KeepIdle(secs(params.tcp_keepalive_time)),
            OptValue::KeepCnt(params.tcp_keepalive_probes),
            OptValue::KeepIntvl(secs(params.tcp_keepalive_intvl)),
        ];
        let mut chg = false;
        for (opt, want) in self.opts.iter_mut().zip(wanted) {
            if opt.value != want {
                opt.value = want;
                opt.mod_count += 1;
                chg = true;
            }
        }
        chg
    }

    /// Apply option `i` to a socket.
    pub fn set(&self, i: usize, sock: &Socket) -> std::io::Result<()> {
        match self.opts[i].value {
            OptValue::Linger(l) => sock.set_linger(l),
            OptValue::KeepAlive(v) => sock.set_keepalive(v),
            OptValue::SndTimeo(d) => sock.set_write_timeout(Some(d)),
            OptValue::RcvTimeo(d) => sock.set_read_timeout(Some(d)),
            OptValue::NoDelay(v) => sock.set_nodelay(v),
            OptValue::KeepIdle(d) => {
                sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(d))
            }
            OptValue::KeepCnt(n) => {
                sock.set_tcp_keepalive(&TcpKeepalive::new().with_retries(n))
            }
            OptValue::KeepIntvl(d) => {
                sock.set_tcp_keepalive(&TcpKeepalive::new().with_interval(d))
            }
        }
    }

    /// Read option `i` back from a socket.
    pub fn get(&self, i: usize, sock: &Socket) -> std::io::Result<OptValue> {
        Ok(match self.opts[i].value {
            OptValue::Linger(_) => OptValue::Linger(sock.linger()?),
            OptValue::KeepAlive(_) => OptValue::KeepAlive(sock.keepalive()?),
            OptValue::SndTimeo(_) => {
                OptValue::SndTimeo(sock.write_timeout()?.unwrap_or(Duration::ZERO))
            }
            OptValue::RcvTimeo(_) => {
                OptValue::RcvTimeo(sock.read_timeout()?.unwrap_or(Duration::ZERO))
            }
            OptValue::NoDelay(_) => OptValue::NoDelay(sock.nodelay()?),
            OptValue::KeepIdle(_) => OptValue::KeepIdle(sock.keepalive_time()?),
            OptValue::KeepCnt(_) => OptValue::KeepCnt(sock.keepalive_retries()?),
            OptValue::KeepIntvl(_) => OptValue::KeepIntvl(sock.keepalive_interval()?),
        })
    }

    /// Did the accepted socket inherit the configured value?
    pub fn inherited(&self, i: usize, sock: &Socket) -> bool {
        match self.get(i, sock) {
            Ok(actual) => actual == self.opts[i].value,
            // unsupported option on this platform: treat as inherited
            Err(_) => true,
        }
    }
}
