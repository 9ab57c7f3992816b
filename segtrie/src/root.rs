use std::{fmt, sync::Arc};

use segtrie_core::IdAddress;

use crate::{database::Shared, seg_alloc::ReadLock};

/// A version of a tree.
///
/// Cloning a root is cheap and yields the same version. A root whose handle is not shared and
/// which does not borrow from another tree is *unique*: writes through it may then modify nodes
/// nobody else can see in place instead of copying them.
///
/// Roots obtained from within another tree (subtree values) keep that tree alive instead of
/// holding a reference of their own.
#[derive(Clone)]
pub struct Root {
    inner: Arc<RootInner>,
}

struct RootInner {
    shared: Arc<Shared>,
    id: IdAddress,
    ancestor: Option<Root>,
}

impl Root {
    /// A root owning one reference to `id`.
    pub(crate) fn owned(shared: Arc<Shared>, id: IdAddress) -> Self {
        Root {
            inner: Arc::new(RootInner {
                shared,
                id,
                ancestor: None,
            }),
        }
    }

    /// A root for `id`, kept alive by `ancestor` which reaches it.
    pub(crate) fn borrowed(id: IdAddress, ancestor: Root) -> Self {
        Root {
            inner: Arc::new(RootInner {
                shared: ancestor.inner.shared.clone(),
                id,
                ancestor: Some(ancestor),
            }),
        }
    }

    pub fn id(&self) -> IdAddress {
        self.inner.id
    }

    /// Whether the tree has no keys.
    pub fn is_empty(&self) -> bool {
        !self.inner.id.is_valid()
    }

    /// Whether this handle is the only way to reach this version of the tree.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.inner) == 1 && self.inner.ancestor.is_none()
    }

    /// The tree this root was found in, if any.
    pub fn ancestor(&self) -> Option<&Root> {
        self.inner.ancestor.as_ref()
    }

    /// Point the root at `new_id`, an id whose reference the caller hands over.
    ///
    /// A unique root is updated in place and its old reference released through `lock`; a
    /// shared one is replaced by a fresh root, leaving other holders on the old version.
    pub(crate) fn update(&mut self, new_id: IdAddress, lock: &ReadLock) {
        if self.inner.id == new_id {
            return;
        }
        if self.inner.ancestor.is_none() {
            if let Some(inner) = Arc::get_mut(&mut self.inner) {
                let old = std::mem::replace(&mut inner.id, new_id);
                if old.is_valid() {
                    lock.release_node(old);
                }
                return;
            }
        }
        *self = Root::owned(self.inner.shared.clone(), new_id);
    }
}

impl Root {
    /// Hand this root's reference over to the caller, if nothing else shares it.
    pub(crate) fn try_into_id(mut self) -> Result<IdAddress, Root> {
        if self.inner.ancestor.is_none() {
            if let Some(inner) = Arc::get_mut(&mut self.inner) {
                return Ok(std::mem::replace(&mut inner.id, IdAddress::NULL));
            }
        }
        Err(self)
    }
}

impl Drop for RootInner {
    fn drop(&mut self) {
        if self.ancestor.is_none() && self.id.is_valid() {
            self.shared.release_detached(self.id);
        }
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Root")
            .field("id", &self.inner.id)
            .field("nested", &self.inner.ancestor.is_some())
            .finish()
    }
}
