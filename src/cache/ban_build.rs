//! Building bans from management arguments.
//!
//! `BanProto` accumulates validated tests into the encoded form; the
//! first error is sticky and aborts the commit. The argument/operator
//! matrix is fixed: string arguments compare and match, duration
//! arguments compare and order.

use crate::cache::ban::{
    ban_flags, ban_len, Ban, BanArg, BanOper, BANS_FLAGS, BANS_HEAD_LEN, BANS_LENGTH,
    BANS_TIMESTAMP,
};
use crate::cache::Cache;
use crate::types::Real;
use regex::Regex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BanError {
    #[error("Unknown or unsupported field \"{0}\"")]
    UnknownField(String),
    #[error("Missing header name: \"{0}\"")]
    MissingHeader(String),
    #[error("expected conditional ({0}) got \"{1}\"")]
    BadConditional(String, String),
    #[error("expected duration <n.nn>[ms|s|m|h|d|w|y] got \"{0}\"")]
    BadDuration(String),
    #[error("Regex compile error: {0}")]
    Regex(String),
    #[error("Shutting down")]
    ShuttingDown,
    #[error("No ban to cancel")]
    NothingCancelled,
}

/// Variables a ban may test, with their spec flag and tag.
const PVARS: &[(&str, u8, BanArg)] = &[
    ("req.url", ban_flags::REQ, BanArg::Url),
    ("req.http.", ban_flags::REQ | ban_flags::HTTP, BanArg::ReqHttp),
    ("obj.http.", ban_flags::OBJ | ban_flags::HTTP, BanArg::ObjHttp),
    ("obj.status", ban_flags::OBJ, BanArg::ObjStatus),
    ("obj.ttl", ban_flags::OBJ | ban_flags::DURATION, BanArg::ObjTtl),
    ("obj.age", ban_flags::OBJ | ban_flags::DURATION, BanArg::ObjAge),
    ("obj.grace", ban_flags::OBJ | ban_flags::DURATION, BanArg::ObjGrace),
    ("obj.keep", ban_flags::OBJ | ban_flags::DURATION, BanArg::ObjKeep),
];

const STRING_OPERS: &[BanOper] =
    &[BanOper::Eq, BanOper::Neq, BanOper::Match, BanOper::Nmatch];
const DURATION_OPERS: &[BanOper] = &[
    BanOper::Eq,
    BanOper::Neq,
    BanOper::Gt,
    BanOper::Gte,
    BanOper::Lt,
    BanOper::Lte,
];

fn opers_for(arg: BanArg) -> &'static [BanOper] {
    if arg.takes_duration() {
        DURATION_OPERS
    } else {
        STRING_OPERS
    }
}

fn oper_help(arg: BanArg) -> String {
    let ops = opers_for(arg);
    let syms: Vec<&str> = ops.iter().map(|o| o.symbol()).collect();
    match syms.split_last() {
        Some((last, rest)) if !rest.is_empty() => {
            format!("{} or {}", rest.join(", "), last)
        }
        _ => syms.join(""),
    }
}

fn parse_oper(s: &str) -> Option<BanOper> {
    Some(match s {
        "==" => BanOper::Eq,
        "!=" => BanOper::Neq,
        "~" => BanOper::Match,
        "!~" => BanOper::Nmatch,
        ">" => BanOper::Gt,
        ">=" => BanOper::Gte,
        "<" => BanOper::Lt,
        "<=" => BanOper::Lte,
        _ => return None,
    })
}

/// `<n.nn>[ms|s|m|h|d|w|y]`, bare numbers are seconds.
pub fn parse_duration(s: &str) -> Option<f64> {
    let s = s.trim();
    let (num, mult) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1e-3)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1.0)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60.0)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3600.0)
    } else if let Some(v) = s.strip_suffix('d') {
        (v, 86400.0)
    } else if let Some(v) = s.strip_suffix('w') {
        (v, 86400.0 * 7.0)
    } else if let Some(v) = s.strip_suffix('y') {
        (v, 86400.0 * 365.0)
    } else {
        (s, 1.0)
    };
    let v: f64 = num.trim().parse().ok()?;
    if v.is_finite() {
        Some(v * mult)
    } else {
        None
    }
}

/// Pad to 4-byte alignment with 0xff, then be32 length, then content.
fn add_lump(body: &mut Vec<u8>, content: &[u8]) {
    while (BANS_HEAD_LEN + body.len()) % 4 != 0 {
        body.push(0xff);
    }
    body.extend_from_slice(&(content.len() as u32).to_be_bytes());
    body.extend_from_slice(content);
}

/// A ban under construction.
pub struct BanProto {
    flags: u8,
    body: Vec<u8>,
    err: Option<BanError>,
}

impl BanProto {
    pub fn new() -> Self {
        Self { flags: 0, body: Vec::new(), err: None }
    }

    pub fn with_flags(flags: u8) -> Self {
        Self { flags, body: Vec::new(), err: None }
    }

    pub fn error(&self) -> Option<&BanError> {
        self.err.as_ref()
    }

    fn fail(&mut self, e: BanError) -> Result<(), BanError> {
        // first error is sticky
        if self.err.is_none() {
            self.err = Some(e);
        }
        Err(self.err.clone().unwrap())
    }

    /// Add one and'ed test: `field oper literal`.
    pub fn add_test(&mut self, a1: &str, a2: &str, a3: &str) -> Result<(), BanError> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }

        let pv = PVARS.iter().find(|(name, flag, _)| {
            if flag & ban_flags::HTTP != 0 {
                a1.starts_with(name)
            } else {
                a1 == *name
            }
        });
        let &(name, flag, tag) = match pv {
            Some(pv) => pv,
            None => return self.fail(BanError::UnknownField(a1.into())),
        };

        self.flags |= flag & (ban_flags::REQ | ban_flags::OBJ);

        let mut body = std::mem::take(&mut self.body);
        body.push(tag as u8);

        if flag & ban_flags::HTTP != 0 {
            let hdr = &a1[name.len()..];
            if hdr.is_empty() {
                self.body = body;
                return self.fail(BanError::MissingHeader(name.into()));
            }
            // len byte counts the name plus the colon
            assert!(hdr.len() + 1 <= 127);
            body.push((hdr.len() + 1) as u8);
            body.extend_from_slice(hdr.as_bytes());
            body.push(b':');
            body.push(0);
        }

        let op = match parse_oper(a2) {
            Some(op) if opers_for(tag).contains(&op) => op,
            _ => {
                self.body = body;
                return self.fail(BanError::BadConditional(oper_help(tag), a2.into()));
            }
        };

        if flag & ban_flags::DURATION == 0 {
            // literal with trailing NUL, operator, then the compiled
            // pattern for the match operators
            let mut lit = a3.as_bytes().to_vec();
            lit.push(0);
            add_lump(&mut body, &lit);
            body.push(op as u8);
            if matches!(op, BanOper::Match | BanOper::Nmatch) {
                match Regex::new(a3) {
                    Ok(_) => add_lump(&mut body, a3.as_bytes()),
                    Err(e) => {
                        self.body = body;
                        return self.fail(BanError::Regex(e.to_string()));
                    }
                }
            }
            self.body = body;
            return Ok(());
        }

        let d = match parse_duration(a3) {
            Some(d) => d,
            None => {
                self.body = body;
                return self.fail(BanError::BadDuration(a3.into()));
            }
        };
        add_lump(&mut body, &d.to_bits().to_be_bytes());
        body.push(op as u8);
        self.body = body;
        Ok(())
    }

    /// Assemble the full spec with the given timestamp.
    pub fn to_spec(&self, t0: Real) -> Vec<u8> {
        let ln = BANS_HEAD_LEN + self.body.len();
        let mut spec = vec![0u8; BANS_HEAD_LEN];
        spec[BANS_TIMESTAMP..BANS_TIMESTAMP + 8]
            .copy_from_slice(&t0.to_bits().to_be_bytes());
        spec[BANS_LENGTH..BANS_LENGTH + 4].copy_from_slice(&(ln as u32).to_be_bytes());
        spec[BANS_FLAGS] = self.flags;
        spec.extend_from_slice(&self.body);
        spec
    }
}

impl Default for BanProto {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    /// Start building a ban.
    pub fn ban_build(&self) -> BanProto {
        BanProto::new()
    }

    /// Insert a finished ban at the head of the list. The new ban
    /// becomes visible to every subsequent object; older identical bans
    /// are cancelled when dedup is on.
    pub fn ban_commit(&self, proto: BanProto) -> Result<Arc<Ban>, BanError> {
        if let Some(e) = proto.error() {
            return Err(e.clone());
        }
        if self.bans.is_shutdown() {
            return Err(BanError::ShuttingDown);
        }

        let mut inner = self.bans.mtx.lock();
        if self.bans.is_shutdown() {
            // raced a shutdown
            return Err(BanError::ShuttingDown);
        }

        // timestamps are strictly monotonic within the list
        let mut t0 = crate::types::real_now();
        if let Some(head) = inner.bans.front() {
            if t0 <= head.time() {
                t0 = head.time() + 1e-6;
            }
        }
        let spec = proto.to_spec(t0);
        let ln = spec.len();
        let had_bans = !inner.bans.is_empty();
        let ban = Ban::from_spec(spec).expect("freshly encoded spec decodes");

        inner.bans.push_front(Arc::clone(&ban));
        self.stats.bans.fetch_add(1, Ordering::Relaxed);
        self.stats.bans_added.fetch_add(1, Ordering::Relaxed);
        inner.persisted_bytes += ln as u64;
        self.stats
            .bans_persisted_bytes
            .store(inner.persisted_bytes, Ordering::Relaxed);
        if ban.flags() & ban_flags::OBJ != 0 {
            self.stats.bans_obj.fetch_add(1, Ordering::Relaxed);
        }
        if ban.flags() & ban_flags::REQ != 0 {
            self.stats.bans_req.fetch_add(1, Ordering::Relaxed);
        }

        if had_bans {
            let spec = ban.spec_bytes();
            self.ban_info_new(&mut inner, &spec);
        }

        if self.params.read().ban_dups {
            let dups = self.ban_cancel_locked(&mut inner, &ban.spec_bytes(), 1);
            self.stats.bans_dups.fetch_add(dups, Ordering::Relaxed);
        }
        if !ban.is_req() {
            self.bans.kick_lurker(&mut inner);
        }
        Ok(ban)
    }

    /// Drop a ban under construction.
    pub fn ban_abandon(&self, proto: BanProto) {
        drop(proto);
    }

    /// Hunt down live bans matching the given predicate and mark them
    /// COMPLETED without inserting anything.
    pub fn ban_cancel(&self, proto: BanProto) -> Result<u64, BanError> {
        if let Some(e) = proto.error() {
            return Err(e.clone());
        }
        if self.bans.is_shutdown() {
            return Err(BanError::ShuttingDown);
        }
        let spec = proto.to_spec(crate::types::real_now());
        let mut inner = self.bans.mtx.lock();
        let dups = self.ban_cancel_locked(&mut inner, &spec, 0);
        if dups == 0 {
            return Err(BanError::NothingCancelled);
        }
        self.stats.bans_dups.fetch_add(dups, Ordering::Relaxed);
        Ok(dups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("10"), Some(10.0));
        assert_eq!(parse_duration("10s"), Some(10.0));
        assert_eq!(parse_duration("500ms"), Some(0.5));
        assert_eq!(parse_duration("2m"), Some(120.0));
        assert_eq!(parse_duration("1h"), Some(3600.0));
        assert_eq!(parse_duration("1d"), Some(86400.0));
        assert_eq!(parse_duration("1w"), Some(604800.0));
        assert_eq!(parse_duration("bogus"), None);
    }

    #[test]
    fn test_add_test_validates_matrix() {
        let mut p = BanProto::new();
        // ordering on a string argument is rejected
        assert!(p.add_test("req.url", ">", "/x").is_err());
        // the first error is sticky
        assert!(p.add_test("req.url", "==", "/x").is_err());

        let mut p = BanProto::new();
        assert!(p.add_test("obj.ttl", "~", "10s").is_err());

        let mut p = BanProto::new();
        assert!(p.add_test("req.url", "==", "/x").is_ok());
        assert!(p.add_test("obj.ttl", ">", "10s").is_ok());
        assert_eq!(p.flags & ban_flags::REQ, ban_flags::REQ);
        assert_eq!(p.flags & ban_flags::OBJ, ban_flags::OBJ);
    }

    #[test]
    fn test_unknown_field() {
        let mut p = BanProto::new();
        assert!(matches!(
            p.add_test("beresp.status", "==", "200"),
            Err(BanError::UnknownField(_))
        ));
    }

    #[test]
    fn test_missing_header_name() {
        let mut p = BanProto::new();
        assert!(matches!(
            p.add_test("req.http.", "==", "x"),
            Err(BanError::MissingHeader(_))
        ));
    }

    #[test]
    fn test_bad_regex_reported() {
        let mut p = BanProto::new();
        assert!(matches!(
            p.add_test("req.url", "~", "(["),
            Err(BanError::Regex(_))
        ));
    }

    #[test]
    fn test_spec_layout() {
        let mut p = BanProto::new();
        p.add_test("req.url", "==", "/x").unwrap();
        let spec = p.to_spec(1234.5);
        assert_eq!(ban_len(&spec).unwrap(), spec.len());
        assert_eq!(
            f64::from_bits(u64::from_be_bytes(spec[0..8].try_into().unwrap())),
            1234.5
        );
        assert_eq!(spec[BANS_FLAGS], ban_flags::REQ);
        assert_eq!(&spec[13..16], &[0, 0, 0]);
        // first test byte is the argument code
        assert_eq!(spec[BANS_HEAD_LEN], BanArg::Url as u8);
        // spec decodes back to one test
        let ban = Ban::from_spec(spec).unwrap();
        assert_eq!(ban.tests.len(), 1);
        assert_eq!(ban.render(), "req.url == /x");
    }

    #[test]
    fn test_duration_spec_roundtrip() {
        let mut p = BanProto::new();
        p.add_test("obj.ttl", ">=", "90s").unwrap();
        let ban = Ban::from_spec(p.to_spec(1.0)).unwrap();
        assert_eq!(ban.tests[0].duration, 90.0);
        assert_eq!(ban.render(), "obj.ttl >= 90s");
    }

    #[test]
    fn test_header_spec_roundtrip() {
        let mut p = BanProto::new();
        p.add_test("obj.http.X-Tag", "~", "^a").unwrap();
        let ban = Ban::from_spec(p.to_spec(1.0)).unwrap();
        assert_eq!(ban.tests[0].name.as_deref(), Some("X-Tag"));
        assert!(ban.tests[0].regex.is_some());
        assert_eq!(ban.render(), "obj.http.X-Tag ~ ^a");
    }
}
