//! Ban processing.
//!
//! A ban is a conjunction of tests; an object matching all of them is
//! invalid. Bans live in a newest-first list and are never reordered;
//! they are reaped from the tail once nothing references them. Each
//! object core points at the ban it has been checked up to, and both
//! lookups and the background lurker advance that pointer.
//!
//! Bans are compiled into bytestrings:
//!     8 bytes  - IEEE-754 double timestamp, big-endian
//!     4 bytes  - be32: total length including this header
//!     1 byte   - flags
//!     3 bytes  - zero padding (header is 16 bytes)
//!     N tests
//! A test:
//!     1 byte   - argument code
//!     (n bytes)- header name spec: len byte, name, ':', NUL
//!     lump     - literal, or 8-byte be64 double for durations
//!     1 byte   - operator code
//!     (lump)   - regex pattern for ~ and !~
//! A lump is 0xff padding to 4-byte alignment, be32 length, content.

use crate::cache::objcore::{flags as oc_flags, ObjCore};
use crate::cache::Cache;
use crate::policy::Req;
use crate::stats::Counters;
use crate::storage::{packed_header, ObjAttr, ObjEvent};
use crate::types::Real;
use parking_lot::{Condvar, Mutex, MutexGuard};
use regex::Regex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

pub const BANS_TIMESTAMP: usize = 0;
pub const BANS_LENGTH: usize = 8;
pub const BANS_FLAGS: usize = 12;
pub const BANS_HEAD_LEN: usize = 16;

pub mod ban_flags {
    pub const REQ: u8 = 1 << 0;
    pub const OBJ: u8 = 1 << 1;
    pub const COMPLETED: u8 = 1 << 2;
    pub const HTTP: u8 = 1 << 3;
    pub const DURATION: u8 = 1 << 4;
    pub const NODEDUP: u8 = 1 << 5;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BanOper {
    Eq = 0x10,
    Neq = 0x11,
    Match = 0x12,
    Nmatch = 0x13,
    Gt = 0x14,
    Gte = 0x15,
    Lt = 0x16,
    Lte = 0x17,
}

impl BanOper {
    pub fn from_code(c: u8) -> Option<Self> {
        Some(match c {
            0x10 => Self::Eq,
            0x11 => Self::Neq,
            0x12 => Self::Match,
            0x13 => Self::Nmatch,
            0x14 => Self::Gt,
            0x15 => Self::Gte,
            0x16 => Self::Lt,
            0x17 => Self::Lte,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Match => "~",
            Self::Nmatch => "!~",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BanArg {
    Url = 0x18,
    ReqHttp = 0x19,
    ObjHttp = 0x1a,
    ObjStatus = 0x1b,
    ObjTtl = 0x1c,
    ObjAge = 0x1d,
    ObjGrace = 0x1e,
    ObjKeep = 0x1f,
}

impl BanArg {
    pub fn from_code(c: u8) -> Option<Self> {
        Some(match c {
            0x18 => Self::Url,
            0x19 => Self::ReqHttp,
            0x1a => Self::ObjHttp,
            0x1b => Self::ObjStatus,
            0x1c => Self::ObjTtl,
            0x1d => Self::ObjAge,
            0x1e => Self::ObjGrace,
            0x1f => Self::ObjKeep,
            _ => return None,
        })
    }

    pub fn has_name_spec(self) -> bool {
        matches!(self, Self::ReqHttp | Self::ObjHttp)
    }

    pub fn takes_duration(self) -> bool {
        matches!(self, Self::ObjTtl | Self::ObjAge | Self::ObjGrace | Self::ObjKeep)
    }

    /// References request data the lurker does not have.
    pub fn is_req(self) -> bool {
        matches!(self, Self::Url | Self::ReqHttp)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Url => "req.url",
            Self::ReqHttp => "req.http.",
            Self::ObjHttp => "obj.http.",
            Self::ObjStatus => "obj.status",
            Self::ObjTtl => "obj.ttl",
            Self::ObjAge => "obj.age",
            Self::ObjGrace => "obj.grace",
            Self::ObjKeep => "obj.keep",
        }
    }
}

/// One decoded test.
pub struct BanTest {
    pub arg: BanArg,
    /// Header name for the http-family arguments.
    pub name: Option<String>,
    pub oper: BanOper,
    pub literal: Option<String>,
    pub duration: f64,
    pub regex: Option<Regex>,
}

/// One ban: the encoded spec plus its decoded tests and list state.
pub struct Ban {
    time: Real,
    spec: Mutex<Vec<u8>>,
    flags: AtomicU8,
    pub(crate) tests: Vec<BanTest>,
    /// Cores whose ban pointer targets this ban, plus transient pins.
    /// Both guarded by the list mutex.
    pub(crate) refcount: Mutex<u64>,
    pub(crate) objcore: Mutex<VecDeque<Weak<ObjCore>>>,
}

impl Ban {
    pub(crate) fn from_spec(spec: Vec<u8>) -> Result<Arc<Ban>, BanDecodeError> {
        let time = ban_time(&spec)?;
        let len = ban_len(&spec)?;
        if spec.len() < len {
            return Err(BanDecodeError);
        }
        let flags = spec[BANS_FLAGS];
        let tests = decode_tests(&spec[BANS_HEAD_LEN..len])?;
        Ok(Arc::new(Ban {
            time,
            spec: Mutex::new(spec),
            flags: AtomicU8::new(flags),
            tests,
            refcount: Mutex::new(0),
            objcore: Mutex::new(VecDeque::new()),
        }))
    }

    pub fn time(&self) -> Real {
        self.time
    }

    pub fn flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.flags() & ban_flags::COMPLETED != 0
    }

    pub fn is_req(&self) -> bool {
        self.flags() & ban_flags::REQ != 0
    }

    pub fn spec_bytes(&self) -> Vec<u8> {
        let spec = self.spec.lock();
        let len = ban_len(&spec).unwrap_or(spec.len());
        spec[..len].to_vec()
    }

    /// Human-readable predicate, `&&`-joined.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, t) in self.tests.iter().enumerate() {
            if i > 0 {
                out.push_str(" && ");
            }
            out.push_str(t.arg.display_name());
            if let Some(name) = &t.name {
                out.push_str(name);
            }
            out.push(' ');
            out.push_str(t.oper.symbol());
            out.push(' ');
            if t.arg.takes_duration() {
                out.push_str(&fmt_duration(t.duration));
            } else {
                out.push_str(t.literal.as_deref().unwrap_or(""));
            }
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid ban spec encoding")]
pub struct BanDecodeError;

pub fn ban_time(spec: &[u8]) -> Result<Real, BanDecodeError> {
    let raw = spec
        .get(BANS_TIMESTAMP..BANS_TIMESTAMP + 8)
        .ok_or(BanDecodeError)?;
    Ok(f64::from_bits(u64::from_be_bytes(raw.try_into().unwrap())))
}

pub fn ban_len(spec: &[u8]) -> Result<usize, BanDecodeError> {
    let raw = spec.get(BANS_LENGTH..BANS_LENGTH + 4).ok_or(BanDecodeError)?;
    Ok(u32::from_be_bytes(raw.try_into().unwrap()) as usize)
}

/// Two ban specs are identical if everything past the timestamp agrees.
/// NODEDUP bans never count as equal.
fn ban_equal(a: &[u8], b: &[u8]) -> bool {
    let (Ok(la), Ok(lb)) = (ban_len(a), ban_len(b)) else {
        return false;
    };
    if la != lb {
        return false;
    }
    if a[BANS_FLAGS] & ban_flags::NODEDUP != 0 {
        return false;
    }
    a[BANS_LENGTH..la] == b[BANS_LENGTH..lb]
}

fn read_lump<'a>(bs: &mut &'a [u8]) -> Result<&'a [u8], BanDecodeError> {
    while bs.first() == Some(&0xff) {
        *bs = &bs[1..];
    }
    let len = bs.get(..4).ok_or(BanDecodeError)?;
    let len = u32::from_be_bytes(len.try_into().unwrap()) as usize;
    *bs = &bs[4..];
    let lump = bs.get(..len).ok_or(BanDecodeError)?;
    *bs = &bs[len..];
    Ok(lump)
}

fn decode_tests(mut bs: &[u8]) -> Result<Vec<BanTest>, BanDecodeError> {
    let mut tests = Vec::new();
    while !bs.is_empty() {
        let arg = BanArg::from_code(bs[0]).ok_or(BanDecodeError)?;
        bs = &bs[1..];
        let name = if arg.has_name_spec() {
            let l = *bs.first().ok_or(BanDecodeError)? as usize;
            // layout: len byte counting name + colon, name (l-1 bytes),
            // ':', NUL
            let name_len = l.checked_sub(1).ok_or(BanDecodeError)?;
            let spec = bs.get(1..l + 2).ok_or(BanDecodeError)?;
            let name = std::str::from_utf8(&spec[..name_len])
                .map_err(|_| BanDecodeError)?
                .to_string();
            bs = &bs[l + 2..];
            Some(name)
        } else {
            None
        };
        if arg.takes_duration() {
            let lump = read_lump(&mut bs)?;
            if lump.len() != 8 {
                return Err(BanDecodeError);
            }
            let duration = f64::from_bits(u64::from_be_bytes(lump.try_into().unwrap()));
            let oper = BanOper::from_code(*bs.first().ok_or(BanDecodeError)?)
                .ok_or(BanDecodeError)?;
            bs = &bs[1..];
            tests.push(BanTest {
                arg,
                name,
                oper,
                literal: None,
                duration,
                regex: None,
            });
            continue;
        }
        let lump = read_lump(&mut bs)?;
        // literals carry a trailing NUL
        let lit = lump.strip_suffix(&[0]).unwrap_or(lump);
        let literal = std::str::from_utf8(lit).map_err(|_| BanDecodeError)?.to_string();
        let oper = BanOper::from_code(*bs.first().ok_or(BanDecodeError)?)
            .ok_or(BanDecodeError)?;
        bs = &bs[1..];
        let regex = if matches!(oper, BanOper::Match | BanOper::Nmatch) {
            let pat = read_lump(&mut bs)?;
            let pat = std::str::from_utf8(pat).map_err(|_| BanDecodeError)?;
            Some(Regex::new(pat).map_err(|_| BanDecodeError)?)
        } else {
            None
        };
        tests.push(BanTest {
            arg,
            name,
            oper,
            literal: Some(literal),
            duration: f64::NAN,
            regex,
        });
    }
    Ok(tests)
}

/// Render a duration the way operators write them: integral units when
/// they divide evenly, fractional seconds otherwise.
pub fn fmt_duration(d: f64) -> String {
    const M: u64 = 60;
    const H: u64 = M * 60;
    const D: u64 = H * 24;
    const W: u64 = D * 7;
    const Y: u64 = D * 365;
    let dec = d.floor() as u64;
    let frac = ((d * 1e3).floor() as u64) % 1000;
    if dec == 0 && frac == 0 {
        return "0s".into();
    }
    if dec == 0 {
        return format!("{frac}ms");
    }
    if frac != 0 {
        return format!("{dec}.{frac:03}s");
    }
    for (unit, s) in [("y", Y), ("w", W), ("d", D), ("h", H), ("m", M)] {
        if dec >= s && dec % s == 0 {
            return format!("{}{}", dec / s, unit);
        }
    }
    format!("{dec}s")
}

/// Everything guarded by the ban mutex.
pub(crate) struct BanListInner {
    /// Front is the newest ban (the head).
    pub bans: VecDeque<Arc<Ban>>,
    /// Bumped on every lurker kick; the lurker sleeps only while it is
    /// unchanged.
    pub generation: u64,
    /// While positive the lurker must not run (persistence is still
    /// loading objects against reloaded bans).
    pub holds: u32,
    pub persisted_bytes: u64,
    pub persisted_fragmentation: u64,
}

pub struct BanList {
    pub(crate) mtx: Mutex<BanListInner>,
    pub(crate) lurker_cond: Condvar,
    pub(crate) shutdown: AtomicBool,
}

impl BanList {
    pub(crate) fn new() -> Self {
        Self {
            mtx: Mutex::new(BanListInner {
                bans: VecDeque::new(),
                generation: 0,
                holds: 1,
                persisted_bytes: 0,
                persisted_fragmentation: 0,
            }),
            lurker_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Newest ban. The list is never empty after init.
    pub fn head(&self) -> Arc<Ban> {
        Arc::clone(self.mtx.lock().bans.front().expect("empty ban list"))
    }

    pub fn len(&self) -> usize {
        self.mtx.lock().bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All bans newest-first.
    pub fn snapshot(&self) -> Vec<Arc<Ban>> {
        self.mtx.lock().bans.iter().cloned().collect()
    }

    pub(crate) fn kick_lurker(&self, inner: &mut BanListInner) {
        inner.generation += 1;
        self.lurker_cond.notify_one();
    }

    /// Prevent the lurker from running while persistence loads objects.
    pub fn hold(&self) {
        let mut inner = self.mtx.lock();
        assert!(inner.holds > 0, "hold after release");
        inner.holds += 1;
    }

    pub fn release(&self) {
        let mut inner = self.mtx.lock();
        assert!(inner.holds > 0);
        inner.holds -= 1;
        if inner.holds == 0 {
            self.kick_lurker(&mut inner);
        }
    }

    /// Attach a new object core to the current head ban.
    pub(crate) fn new_objcore(&self, _cache: &Cache, oc: &Arc<ObjCore>) {
        let inner = self.mtx.lock();
        let head = inner.bans.front().expect("empty ban list");
        let mut b = oc.ban.lock();
        assert!(b.is_none(), "object already banned-linked");
        *head.refcount.lock() += 1;
        head.objcore.lock().push_back(Arc::downgrade(oc));
        *b = Some(Arc::clone(head));
    }

    /// Attach a loaded core to a specific ban.
    pub(crate) fn ref_ban(&self, oc: &Arc<ObjCore>, ban: &Arc<Ban>) {
        let _inner = self.mtx.lock();
        let mut b = oc.ban.lock();
        assert!(b.is_none());
        *ban.refcount.lock() += 1;
        ban.objcore.lock().push_back(Arc::downgrade(oc));
        *b = Some(Arc::clone(ban));
    }

    /// Detach a core on destruction.
    pub(crate) fn destroy_obj(&self, oc: &Arc<ObjCore>) {
        let _inner = self.mtx.lock();
        let mut b = oc.ban.lock();
        if let Some(ban) = b.take() {
            let mut rc = ban.refcount.lock();
            assert!(*rc > 0);
            *rc -= 1;
            drop(rc);
            let mut ocs = ban.objcore.lock();
            if let Some(pos) = ocs.iter().position(|w| w.as_ptr() == Arc::as_ptr(oc)) {
                ocs.remove(pos);
            }
        }
    }

    /// Find a ban by its exact timestamp.
    pub fn find_by_timestamp(&self, t0: Real) -> Option<Arc<Ban>> {
        let inner = self.mtx.lock();
        for b in inner.bans.iter() {
            if b.time() == t0 {
                return Some(Arc::clone(b));
            }
            if b.time() < t0 {
                break;
            }
        }
        None
    }
}

/// Evaluation context: the lurker has no request.
pub(crate) fn ban_evaluate(
    cache: &Cache,
    ban: &Ban,
    oc: &ObjCore,
    req: Option<&Req>,
    tests: &mut u64,
) -> bool {
    for t in &ban.tests {
        *tests += 1;
        let mut arg1: Option<String> = None;
        let mut darg1 = f64::NAN;
        let mut darg2 = f64::NAN;
        let timers = oc.timers();
        match t.arg {
            BanArg::Url => {
                arg1 = req.map(|r| r.url.clone());
            }
            BanArg::ReqHttp => {
                arg1 = req.and_then(|r| {
                    r.header(t.name.as_deref().unwrap_or("")).map(str::to_string)
                });
            }
            BanArg::ObjHttp => {
                arg1 = cache
                    .stevedore
                    .get_attr(oc, ObjAttr::Headers)
                    .and_then(|h| {
                        packed_header(&h, t.name.as_deref().unwrap_or(""))
                            .map(str::to_string)
                    });
            }
            BanArg::ObjStatus => {
                arg1 = cache
                    .stevedore
                    .get_attr(oc, ObjAttr::Status)
                    .and_then(|s| String::from_utf8(s).ok());
            }
            BanArg::ObjTtl => {
                // fix the point in time so the test means the same
                // whenever it is evaluated
                darg1 = timers.t_origin + timers.ttl;
                darg2 = ban.time() + t.duration;
            }
            BanArg::ObjAge => {
                darg1 = 0.0 - timers.t_origin;
                darg2 = 0.0 - (ban.time() - t.duration);
            }
            BanArg::ObjGrace => {
                darg1 = timers.grace;
                darg2 = t.duration;
            }
            BanArg::ObjKeep => {
                darg1 = timers.keep;
                darg2 = t.duration;
            }
        }

        let pass = match t.oper {
            BanOper::Eq => match &arg1 {
                Some(a) => Some(a.as_str()) == t.literal.as_deref(),
                None => !darg1.is_nan() && darg1 == darg2,
            },
            BanOper::Neq => match &arg1 {
                Some(a) => Some(a.as_str()) != t.literal.as_deref(),
                None => darg1.is_nan() || darg1 != darg2,
            },
            BanOper::Match => match (&arg1, &t.regex) {
                (Some(a), Some(re)) => re.is_match(a),
                _ => false,
            },
            BanOper::Nmatch => match (&arg1, &t.regex) {
                (Some(a), Some(re)) => !re.is_match(a),
                _ => false,
            },
            BanOper::Gt => !darg1.is_nan() && darg1 > darg2,
            BanOper::Gte => !darg1.is_nan() && darg1 >= darg2,
            BanOper::Lt => !darg1.is_nan() && darg1 < darg2,
            BanOper::Lte => !darg1.is_nan() && darg1 <= darg2,
        };
        if !pass {
            return false;
        }
    }
    true
}

impl Cache {
    /// Mark a ban COMPLETED: the predicate no longer needs evaluation,
    /// and the persisted spec shrinks to the bare header.
    pub(crate) fn ban_mark_completed(&self, inner: &mut BanListInner, b: &Ban) {
        if b.is_completed() {
            return;
        }
        let mut spec = b.spec.lock();
        let ln = ban_len(&spec).unwrap_or(spec.len());
        b.flags.fetch_or(ban_flags::COMPLETED, Ordering::AcqRel);
        spec[BANS_FLAGS] |= ban_flags::COMPLETED;
        spec[BANS_LENGTH..BANS_LENGTH + 4]
            .copy_from_slice(&(BANS_HEAD_LEN as u32).to_be_bytes());
        self.stats.bans_completed.fetch_add(1, Ordering::Relaxed);
        inner.persisted_fragmentation += (ln - BANS_HEAD_LEN) as u64;
        self.stats
            .bans_persisted_fragmentation
            .store(inner.persisted_fragmentation, Ordering::Relaxed);
    }

    /// Mark all non-completed bans identical to `spec` COMPLETED,
    /// starting at list index `start`.
    pub(crate) fn ban_cancel_locked(
        &self,
        inner: &mut BanListInner,
        spec: &[u8],
        start: usize,
    ) -> u64 {
        let bans: Vec<Arc<Ban>> = inner.bans.iter().skip(start).cloned().collect();
        let mut dups = 0;
        for b in bans {
            if b.is_completed() {
                continue;
            }
            let equal = {
                let bspec = b.spec.lock();
                ban_equal(spec, &bspec)
            };
            if equal {
                self.ban_mark_completed(inner, &b);
                dups += 1;
            }
        }
        dups
    }

    /// Persistence callbacks; a `true` answer requests a full export.
    pub(crate) fn ban_info_new(&self, inner: &mut BanListInner, spec: &[u8]) {
        if self.stevedore.ban_info_new(spec) {
            self.ban_export_locked(inner);
        }
    }

    pub(crate) fn ban_info_drop(&self, inner: &mut BanListInner, spec: &[u8]) {
        if self.stevedore.ban_info_drop(spec) {
            self.ban_export_locked(inner);
        }
    }

    /// Serialise the live list, newest last, and hand it to persistence.
    pub(crate) fn ban_export_locked(&self, inner: &mut BanListInner) {
        let mut out = Vec::new();
        for b in inner.bans.iter().rev() {
            out.extend_from_slice(&b.spec_bytes());
        }
        inner.persisted_bytes = out.len() as u64;
        inner.persisted_fragmentation = 0;
        self.stats
            .bans_persisted_bytes
            .store(inner.persisted_bytes, Ordering::Relaxed);
        self.stats.bans_persisted_fragmentation.store(0, Ordering::Relaxed);
        self.stevedore.ban_export(&out);
    }

    /// Public export: serialise under the mutex and return the bytes.
    pub fn ban_export(&self) -> Vec<u8> {
        let mut inner = self.bans.mtx.lock();
        let mut out = Vec::new();
        for b in inner.bans.iter().rev() {
            out.extend_from_slice(&b.spec_bytes());
        }
        inner.persisted_bytes = out.len() as u64;
        inner.persisted_fragmentation = 0;
        out
    }

    /// Insert one reloaded spec in timestamp order, deduplicating.
    fn ban_reload_one(&self, inner: &mut BanListInner, spec: &[u8]) {
        let t0 = match ban_time(spec) {
            Ok(t) => t,
            Err(_) => return,
        };
        let mut duplicate = false;
        let mut pos = inner.bans.len();
        for (i, b) in inner.bans.iter().enumerate() {
            let t1 = b.time();
            if t1 == t0 {
                return;
            }
            if t1 < t0 {
                pos = i;
                break;
            }
            let equal = {
                let bspec = b.spec.lock();
                ban_equal(&bspec, spec)
            };
            if equal {
                duplicate = true;
            }
        }

        let ban = match Ban::from_spec(spec.to_vec()) {
            Ok(b) => b,
            Err(_) => return,
        };
        self.stats.bans.fetch_add(1, Ordering::Relaxed);
        self.stats.bans_added.fetch_add(1, Ordering::Relaxed);
        if ban.is_req() {
            self.stats.bans_req.fetch_add(1, Ordering::Relaxed);
        }
        if duplicate {
            self.stats.bans_dups.fetch_add(1, Ordering::Relaxed);
        }
        inner.persisted_bytes += ban_len(spec).unwrap_or(0) as u64;
        inner.bans.insert(pos, Arc::clone(&ban));
        if duplicate || spec[BANS_FLAGS] & ban_flags::COMPLETED != 0 {
            self.ban_mark_completed(inner, &ban);
        }
        let dups = self.ban_cancel_locked(inner, &ban.spec_bytes(), pos + 1);
        self.stats.bans_dups.fetch_add(dups, Ordering::Relaxed);
    }

    /// Reload a series of persisted ban specs. Idempotent against the
    /// live list.
    pub fn ban_reload(&self, mut bytes: &[u8]) -> Result<(), BanDecodeError> {
        assert!(!self.bans.is_shutdown());
        let mut inner = self.bans.mtx.lock();
        while !bytes.is_empty() {
            let l = ban_len(bytes)?;
            if l < BANS_HEAD_LEN || l > bytes.len() {
                return Err(BanDecodeError);
            }
            self.ban_reload_one(&mut inner, &bytes[..l]);
            bytes = &bytes[l..];
        }
        Ok(())
    }

    /// Check an object against all bans newer than its pointer.
    /// Returns true when the object was banned (it is marked dying and
    /// handed to expiry). Head mutex held by the caller.
    pub(crate) fn ban_check_object(
        &self,
        oc: &Arc<ObjCore>,
        req: &Req,
        stats: &mut Counters,
    ) -> bool {
        let oc_ban = oc.ban().expect("published core without ban link");

        // optimistic: pointer already at the head
        {
            let inner = self.bans.mtx.lock();
            let b0 = inner.bans.front().expect("empty ban list");
            if Arc::ptr_eq(b0, &oc_ban) {
                return false;
            }
        }

        // pin the stop ban, snapshot everything newer
        let (b0, to_check) = {
            let inner = self.bans.mtx.lock();
            let b0 = Arc::clone(inner.bans.front().expect("empty ban list"));
            if Arc::ptr_eq(&b0, &oc_ban) {
                return false;
            }
            *oc_ban.refcount.lock() += 1;
            let mut v = Vec::new();
            for b in inner.bans.iter() {
                if Arc::ptr_eq(b, &oc_ban) {
                    break;
                }
                v.push(Arc::clone(b));
            }
            (b0, v)
        };

        // evaluate without the list mutex
        let mut tests: u64 = 0;
        let mut banned_by: Option<Arc<Ban>> = None;
        for b in &to_check {
            if b.is_completed() {
                continue;
            }
            if ban_evaluate(self, b, oc, Some(req), &mut tests) {
                banned_by = Some(Arc::clone(b));
                break;
            }
        }

        {
            let mut inner = self.bans.mtx.lock();
            *oc_ban.refcount.lock() -= 1;
            stats.bans_tested += 1;
            stats.bans_tests_tested += tests;

            if banned_by.is_none() {
                // fast-forward the pointer to the head
                let mut b = oc.ban.lock();
                if let Some(old) = b.take() {
                    *old.refcount.lock() -= 1;
                    let mut ocs = old.objcore.lock();
                    if let Some(pos) =
                        ocs.iter().position(|w| w.as_ptr() == Arc::as_ptr(oc))
                    {
                        ocs.remove(pos);
                    }
                }
                *b0.refcount.lock() += 1;
                b0.objcore.lock().push_back(Arc::downgrade(oc));
                *b = Some(Arc::clone(&b0));
            } else {
                stats.bans_obj_killed += 1;
            }

            let tail_free = {
                let tail = inner.bans.back().expect("empty ban list");
                !Arc::ptr_eq(tail, &b0) && *tail.refcount.lock() == 0
            };
            if tail_free {
                self.bans.kick_lurker(&mut inner);
            }
        }

        match banned_by {
            None => {
                self.stevedore.send_event(oc, ObjEvent::BanChange);
                false
            }
            Some(b) => {
                debug!(ban = %b.render(), "banned at lookup");
                oc.set_flags(oc_flags::DYING);
                self.expiry.remove(self, oc);
                true
            }
        }
    }

    /// Pin the tail ban and snapshot the list for rendering. Returns
    /// (snapshot, pinned tail).
    pub(crate) fn ban_list_pinned(&self) -> (Vec<Arc<Ban>>, Arc<Ban>) {
        let inner = self.bans.mtx.lock();
        let tail = Arc::clone(inner.bans.back().expect("empty ban list"));
        *tail.refcount.lock() += 1;
        (inner.bans.iter().cloned().collect(), tail)
    }

    pub(crate) fn ban_list_unpin(&self, tail: Arc<Ban>) {
        let mut inner = self.bans.mtx.lock();
        *tail.refcount.lock() -= 1;
        self.bans.kick_lurker(&mut inner);
    }

    pub(crate) fn ban_shutdown_list(&self) {
        {
            let mut inner = self.bans.mtx.lock();
            self.bans.shutdown.store(true, Ordering::Release);
            self.bans.kick_lurker(&mut inner);
        }
    }

    /// Compact the persisted list after the lurker has stopped.
    pub(crate) fn ban_final_export(&self) {
        let mut inner = self.bans.mtx.lock();
        self.ban_export_locked(&mut inner);
    }

    /// All bans read back from persistence: report the place-holder,
    /// export the compiled list and let the lurker loose.
    pub fn ban_compile(&self) {
        {
            let mut inner = self.bans.mtx.lock();
            let spec = inner.bans.front().expect("empty ban list").spec_bytes();
            self.ban_info_new(&mut inner, &spec);
            self.ban_export_locked(&mut inner);
        }
        self.bans.release();
    }
}

pub(crate) fn lock_inner(list: &BanList) -> MutexGuard<'_, BanListInner> {
    list.mtx.lock()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_duration() {
        assert_eq!(fmt_duration(0.0), "0s");
        assert_eq!(fmt_duration(0.25), "250ms");
        assert_eq!(fmt_duration(10.0), "10s");
        assert_eq!(fmt_duration(90.0), "90s");
        assert_eq!(fmt_duration(120.0), "2m");
        assert_eq!(fmt_duration(3600.0), "1h");
        assert_eq!(fmt_duration(1.5), "1.500s");
        assert_eq!(fmt_duration(86400.0 * 7.0), "1w");
    }

    #[test]
    fn test_zero_name_length_is_rejected() {
        // header, then a req.http test whose name-length byte is zero
        let mut spec = vec![0u8; BANS_HEAD_LEN];
        spec[BANS_FLAGS] = ban_flags::REQ;
        spec.extend_from_slice(&[BanArg::ReqHttp as u8, 0x00, b':', 0x00]);
        let ln = spec.len() as u32;
        spec[BANS_LENGTH..BANS_LENGTH + 4].copy_from_slice(&ln.to_be_bytes());
        assert!(Ban::from_spec(spec).is_err());
    }

    #[test]
    fn test_oper_codes_roundtrip() {
        for c in 0x10..=0x17u8 {
            assert_eq!(BanOper::from_code(c).unwrap() as u8, c);
        }
        assert!(BanOper::from_code(0x18).is_none());
    }

    #[test]
    fn test_arg_codes_roundtrip() {
        for c in 0x18..=0x1fu8 {
            assert_eq!(BanArg::from_code(c).unwrap() as u8, c);
        }
        assert!(BanArg::from_code(0x20).is_none());
    }
}
