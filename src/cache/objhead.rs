//! Object heads: the aggregation point for one fingerprint.
//!
//! The head mutex guards the core sequence, the head refcount, every
//! member core's refcount, and the busy/dying flag transitions. The
//! refcount equals the number of member cores plus outstanding lookup
//! references; the index unlinks and drops the head when it reaches zero.

use crate::cache::objcore::ObjCore;
use crate::types::Digest;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

pub struct HeadInner {
    pub refcnt: u64,
    /// Most-recently-unbusied first.
    pub cores: Vec<Arc<ObjCore>>,
}

pub struct ObjHead {
    pub digest: Digest,
    inner: Mutex<HeadInner>,
}

impl ObjHead {
    pub fn new(digest: Digest) -> Arc<Self> {
        Arc::new(Self {
            digest,
            inner: Mutex::new(HeadInner { refcnt: 1, cores: Vec::new() }),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, HeadInner> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, HeadInner>> {
        self.inner.try_lock()
    }

    pub fn refcnt(&self) -> u64 {
        self.inner.lock().refcnt
    }
}

impl HeadInner {
    /// Unlink a core from the sequence. The caller still holds its own
    /// reference bookkeeping.
    pub fn remove_core(&mut self, oc: &Arc<ObjCore>) {
        if let Some(pos) = self.cores.iter().position(|c| Arc::ptr_eq(c, oc)) {
            self.cores.remove(pos);
        }
    }

    /// Move a core to the front (most recently unbusied).
    pub fn move_core_front(&mut self, oc: &Arc<ObjCore>) {
        if let Some(pos) = self.cores.iter().position(|c| Arc::ptr_eq(c, oc)) {
            let c = self.cores.remove(pos);
            self.cores.insert(0, c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DIGEST_LEN;

    #[test]
    fn test_new_head_holds_one_ref() {
        let oh = ObjHead::new(Digest([0; DIGEST_LEN]));
        assert_eq!(oh.refcnt(), 1);
        assert!(oh.lock().cores.is_empty());
    }

    #[test]
    fn test_move_core_front() {
        let oh = ObjHead::new(Digest([0; DIGEST_LEN]));
        let a = ObjCore::new_busy();
        let b = ObjCore::new_busy();
        {
            let mut inner = oh.lock();
            inner.cores.push(Arc::clone(&a));
            inner.cores.push(Arc::clone(&b));
            inner.move_core_front(&b);
            assert!(Arc::ptr_eq(&inner.cores[0], &b));
            inner.remove_core(&b);
            assert_eq!(inner.cores.len(), 1);
        }
    }
}
