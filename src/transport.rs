//! Protocol transports and their registry.
//!
//! The cache core hands accepted sessions to a transport; what happens
//! on the wire after that is not its business. Transports register at
//! startup and are addressed by name or by the number assigned in
//! registration order.

use crate::cache::pool::Worker;
use crate::types::Real;
use parking_lot::Mutex;
use socket2::Socket;
use std::sync::Arc;
use tracing::debug;

/// One accepted connection, dressed up for a transport.
pub struct Session {
    pub sock: Socket,
    /// Peer address, reserved at accept time.
    pub remote_addr: String,
    /// Local address of the accepting endpoint.
    pub local_addr: String,
    pub listener: String,
    pub t_open: Real,
}

pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wire identifier for lookup by name; transports without one are
    /// internal.
    fn proto_ident(&self) -> Option<&'static str> {
        None
    }

    /// Take over an accepted session.
    fn new_session(&self, wrk: &mut Worker, sess: Session);
}

/// Closes every session it is given. Stands in where no protocol stack
/// is wired up.
pub struct SinkTransport;

impl Transport for SinkTransport {
    fn name(&self) -> &'static str {
        "sink"
    }

    fn proto_ident(&self) -> Option<&'static str> {
        Some("sink")
    }

    fn new_session(&self, _wrk: &mut Worker, sess: Session) {
        debug!(peer = %sess.remote_addr, "sink transport closes session");
        drop(sess.sock);
    }
}

pub struct TransportRegistry {
    transports: Mutex<Vec<(u16, Arc<dyn Transport>)>>,
}

impl TransportRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { transports: Mutex::new(Vec::new()) })
    }

    /// Register a transport; numbers are assigned in registration
    /// order, starting at 1.
    pub fn register(&self, t: Arc<dyn Transport>) -> u16 {
        let mut ts = self.transports.lock();
        let number = ts.len() as u16 + 1;
        ts.push((number, t));
        number
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .lock()
            .iter()
            .find(|(_, t)| {
                t.proto_ident()
                    .map_or(false, |id| id.eq_ignore_ascii_case(name))
            })
            .map(|(_, t)| Arc::clone(t))
    }

    pub fn by_number(&self, no: u16) -> Option<Arc<dyn Transport>> {
        self.transports
            .lock()
            .iter()
            .find(|(n, _)| *n == no)
            .map(|(_, t)| Arc::clone(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct T2;
    impl Transport for T2 {
        fn name(&self) -> &'static str {
            "second"
        }
        fn proto_ident(&self) -> Option<&'static str> {
            Some("SeCoNd")
        }
        fn new_session(&self, _wrk: &mut Worker, _sess: Session) {}
    }

    #[test]
    fn test_registration_order_numbers() {
        let reg = TransportRegistry::new();
        assert_eq!(reg.register(Arc::new(SinkTransport)), 1);
        assert_eq!(reg.register(Arc::new(T2)), 2);
        assert_eq!(reg.by_number(1).unwrap().name(), "sink");
        assert_eq!(reg.by_number(2).unwrap().name(), "second");
        assert!(reg.by_number(3).is_none());
    }

    #[test]
    fn test_find_by_name_case_insensitive() {
        let reg = TransportRegistry::new();
        reg.register(Arc::new(SinkTransport));
        reg.register(Arc::new(T2));
        assert_eq!(reg.find_by_name("second").unwrap().name(), "second");
        assert_eq!(reg.find_by_name("SINK").unwrap().name(), "sink");
        assert!(reg.find_by_name("h3").is_none());
    }
}
