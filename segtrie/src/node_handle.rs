use std::fmt;

use segtrie_core::IdAddress;

use crate::{error::Error, seg_alloc::AllocSession};

/// An owned reference to a node, released when dropped.
///
/// Handles are bound to the session that created them and release through it.
pub struct NodeHandle<'s> {
    session: &'s AllocSession,
    id: IdAddress,
}

impl<'s> NodeHandle<'s> {
    /// Take over a reference the caller already owns.
    pub(crate) fn adopt(session: &'s AllocSession, id: IdAddress) -> Self {
        NodeHandle { session, id }
    }

    /// Add a reference to `id` and own it.
    pub(crate) fn retain(session: &'s AllocSession, id: IdAddress) -> Result<Self, Error> {
        if id.is_valid() {
            session.lock().retain(id)?;
        }
        Ok(NodeHandle { session, id })
    }

    pub fn id(&self) -> IdAddress {
        self.id
    }

    /// The current reference count of the node, 0 for a null handle.
    pub fn ref_count(&self) -> u64 {
        if !self.id.is_valid() {
            return 0;
        }
        self.session.lock().get(self.id).ref_count()
    }

    /// Another owned reference to the same node.
    pub fn try_clone(&self) -> Result<Self, Error> {
        Self::retain(self.session, self.id)
    }

    /// Give up ownership without releasing. The caller becomes responsible for the reference.
    pub fn take(mut self) -> IdAddress {
        std::mem::replace(&mut self.id, IdAddress::NULL)
    }

    /// Release the current reference and take over `id`, which the caller already owns.
    pub fn give(&mut self, id: IdAddress) {
        let old = std::mem::replace(&mut self.id, id);
        if old.is_valid() {
            self.session.lock().release_node(old);
        }
    }
}

impl Drop for NodeHandle<'_> {
    fn drop(&mut self) {
        if self.id.is_valid() {
            self.session.lock().release_node(self.id);
        }
    }
}

impl fmt::Debug for NodeHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeHandle").field(&self.id).finish()
    }
}

/// Owned references taken while building a node, released unless the build succeeds.
pub(crate) struct Retained<'s> {
    handles: Vec<NodeHandle<'s>>,
}

impl<'s> Retained<'s> {
    pub fn new() -> Self {
        Retained {
            handles: Vec::new(),
        }
    }

    /// Retain each of `ids`. On failure the ones already retained are released again.
    pub fn retain_all(
        session: &'s AllocSession,
        ids: impl IntoIterator<Item = IdAddress>,
    ) -> Result<Self, Error> {
        let mut retained = Retained::new();
        for id in ids {
            retained.handles.push(NodeHandle::retain(session, id)?);
        }
        Ok(retained)
    }

    /// The references now belong to a published node.
    pub fn disarm(self) {
        for handle in self.handles {
            handle.take();
        }
    }
}
