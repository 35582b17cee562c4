//! Shared primitives: request fingerprints and the two clocks.

use sha2::{Digest as _, Sha256};
use std::fmt;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Fingerprint width in bytes. Not configurable.
pub const DIGEST_LEN: usize = 32;

/// Wall-clock instant, seconds since the epoch.
pub type Real = f64;

/// Duration in seconds.
pub type Dur = f64;

/// A request fingerprint. Equal digests address the same object head.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &hex::encode(self.0)[..16])
    }
}

/// Incremental SHA-256 over the attributes policy selects for hashing.
/// An absent attribute contributes a single NUL so that ("a", None) and
/// ("a" + "") hash differently.
pub struct DigestCtx {
    hash: Sha256,
}

impl DigestCtx {
    pub fn new() -> Self {
        Self { hash: Sha256::new() }
    }

    pub fn add(&mut self, s: Option<&str>) {
        match s {
            Some(s) => self.hash.update(s.as_bytes()),
            None => self.hash.update([0u8]),
        }
    }

    pub fn finish(self) -> Digest {
        Digest(self.hash.finalize().into())
    }
}

impl Default for DigestCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock time in seconds.
pub fn real_now() -> Real {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

static MONO_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic seconds since first call. Used where wall-clock steps must
/// not confuse interval arithmetic (watchdog, uptime).
pub fn mono_now() -> f64 {
    MONO_EPOCH
        .get_or_init(Instant::now)
        .elapsed()
        .as_secs_f64()
}

/// Sleep for a fractional number of seconds. Negative and NaN are no-ops.
pub fn sleep_secs(d: Dur) {
    if d.is_finite() && d > 0.0 {
        std::thread::sleep(std::time::Duration::from_secs_f64(d));
    }
}
