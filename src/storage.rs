//! The stevedore seam: pluggable storage for object bytes and attributes.
//!
//! The cache core holds object identity and timers; everything else about
//! an object (its vary blob, packed headers, status, body) lives behind
//! this trait. Ban persistence also flows through here: a stevedore that
//! answers `true` to an info callback is asking for a full re-export.

use crate::cache::objcore::ObjCore;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjAttr {
    /// Vary signature blob.
    Vary,
    /// Packed response headers, "name: value" joined by CRLF.
    Headers,
    /// ASCII status code.
    Status,
}

/// Lifecycle events the storage layer may care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjEvent {
    Insert,
    Expire,
    TtlChange,
    BanChange,
}

pub trait Stevedore: Send + Sync {
    fn get_attr(&self, oc: &ObjCore, attr: ObjAttr) -> Option<Vec<u8>>;

    fn has_attr(&self, oc: &ObjCore, attr: ObjAttr) -> bool {
        self.get_attr(oc, attr).is_some()
    }

    /// Release body storage while keeping the core (cancel, slim).
    fn free_object_content(&self, oc: &ObjCore);

    fn send_event(&self, oc: &ObjCore, ev: ObjEvent);

    /// A new ban hit the list. `true` requests a full re-export.
    fn ban_info_new(&self, _spec: &[u8]) -> bool {
        false
    }

    /// A ban left the list. `true` requests a full re-export.
    fn ban_info_drop(&self, _spec: &[u8]) -> bool {
        false
    }

    /// Full ban list, newest last, concatenated specs.
    fn ban_export(&self, _specs: &[u8]) {}
}

/// Attribute lookup helpers over the packed forms.
pub fn packed_header<'a>(packed: &'a [u8], name: &str) -> Option<&'a str> {
    let text = std::str::from_utf8(packed).ok()?;
    for line in text.split("\r\n") {
        let Some((n, v)) = line.split_once(':') else {
            continue;
        };
        if n.trim().eq_ignore_ascii_case(name) {
            return Some(v.trim());
        }
    }
    None
}

/// In-memory stevedore. Attributes live in the core's storage slot.
#[derive(Default)]
pub struct MemStevedore {
    events: Mutex<Vec<ObjEvent>>,
}

struct MemObj {
    attrs: HashMap<ObjAttr, Vec<u8>>,
}

impl MemStevedore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach or update an attribute on a core. Fetch-side helper.
    pub fn set_attr(oc: &ObjCore, attr: ObjAttr, value: Vec<u8>) {
        let mut slot = oc.stobj.lock();
        let obj = slot
            .get_or_insert_with(|| {
                Box::new(MemObj { attrs: HashMap::new() }) as Box<dyn Any + Send>
            })
            .downcast_mut::<MemObj>()
            .expect("foreign storage slot");
        obj.attrs.insert(attr, value);
    }

    pub fn drain_events(&self) -> Vec<ObjEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl Stevedore for MemStevedore {
    fn get_attr(&self, oc: &ObjCore, attr: ObjAttr) -> Option<Vec<u8>> {
        let slot = oc.stobj.lock();
        slot.as_ref()?
            .downcast_ref::<MemObj>()?
            .attrs
            .get(&attr)
            .cloned()
    }

    fn free_object_content(&self, oc: &ObjCore) {
        oc.stobj.lock().take();
    }

    fn send_event(&self, _oc: &ObjCore, ev: ObjEvent) {
        self.events.lock().push(ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_attrs_roundtrip() {
        let stv = MemStevedore::new();
        let oc = ObjCore::new_busy();
        assert!(!stv.has_attr(&oc, ObjAttr::Vary));
        MemStevedore::set_attr(&oc, ObjAttr::Vary, b"accept-encoding: gzip".to_vec());
        assert_eq!(
            stv.get_attr(&oc, ObjAttr::Vary).as_deref(),
            Some(&b"accept-encoding: gzip"[..])
        );
        stv.free_object_content(&oc);
        assert!(!stv.has_attr(&oc, ObjAttr::Vary));
    }

    #[test]
    fn test_packed_header_lookup() {
        let packed = b"Content-Type: text/html\r\nX-Tag: alpha";
        assert_eq!(packed_header(packed, "x-tag"), Some("alpha"));
        assert_eq!(packed_header(packed, "content-type"), Some("text/html"));
        assert_eq!(packed_header(packed, "none"), None);
    }
}
