//! The policy seam: what the embedded policy engine decides per request.
//!
//! The cache core never parses HTTP. It receives a [`Req`] whose digest,
//! vary key and lookup modifiers were filled in by a [`Policy`]
//! implementation (the VCL stand-in).

use crate::cache::objcore::ObjCore;
use crate::cache::pool::Pool;
use crate::types::{Digest, DigestCtx, Dur, Real};
use std::sync::Arc;

/// One client request as seen by the cache core.
pub struct Req {
    pub url: String,
    pub headers: Vec<(String, String)>,

    /// Arrival time; the TTL window is evaluated against this.
    pub t_req: Real,

    pub digest: Digest,

    /// Request-side vary signature; compared bytewise against the object
    /// vary blob.
    pub vary_key: Option<Vec<u8>>,

    /// Request-scoped caps on the object windows. `d_ttl <= 0` and
    /// `d_grace < 0` mean unset.
    pub d_ttl: Dur,
    pub d_grace: Dur,

    pub hash_ignore_busy: bool,
    pub hash_ignore_vary: bool,
    pub hash_always_miss: bool,

    /// Core this request is (or was) parked on; carries the busy
    /// reference across the waiting list.
    pub(crate) hash_oc: Option<Arc<ObjCore>>,
    pub(crate) waitinglist: bool,

    /// Pool the request is rescheduled on when rushed off a waiting
    /// list. Absent in unit tests, where the rush runs inline.
    pub pool: Option<Arc<Pool>>,

    /// Fresh task to run when rushed; retries the lookup from scratch.
    pub(crate) resume: Option<Box<dyn FnOnce(Req) + Send>>,
}

impl Req {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            t_req: crate::types::real_now(),
            digest: Digest([0; crate::types::DIGEST_LEN]),
            vary_key: None,
            d_ttl: 0.0,
            d_grace: -1.0,
            hash_ignore_busy: false,
            hash_ignore_vary: false,
            hash_always_miss: false,
            hash_oc: None,
            waitinglist: false,
            pool: None,
            resume: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Install the task to run if this request ends up parked on a
    /// waiting list.
    pub fn on_rush(&mut self, f: impl FnOnce(Req) + Send + 'static) {
        self.resume = Some(Box::new(f));
    }

    pub fn is_waitinglisted(&self) -> bool {
        self.waitinglist
    }
}

/// What the policy engine decides before the index is consulted.
pub trait Policy: Send + Sync {
    /// Fill in digest, vary key and the lookup modifiers.
    fn lookup_prepare(&self, req: &mut Req);
}

/// Hashes URL and Host, no vary, no modifiers.
pub struct DefaultPolicy;

impl Policy for DefaultPolicy {
    fn lookup_prepare(&self, req: &mut Req) {
        let mut ctx = DigestCtx::new();
        ctx.add(Some(&req.url));
        ctx.add(req.header("host"));
        req.digest = ctx.finish();
    }
}
