//! Sessions: a thread's view of the store.

use std::{ops::Deref, sync::Arc};

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use segtrie_core::{node::value::value_node_size, IdAddress, MAX_KEY_SIZE};

use crate::{
    database::Shared,
    error::Error,
    node_handle::NodeHandle,
    root::Root,
    seg_alloc::{AllocSession, SEGMENT_HEADER_SIZE},
    trie::{
        self,
        iter::TrieIterator,
        update::{self, NewValue, Prior, Removal},
        Found,
    },
};

/// Reads trees. Every operation holds a read lock for its own duration only.
///
/// A session is bound to one thread at a time.
pub struct ReadSession {
    session: AllocSession,
    shared: Arc<Shared>,
}

impl ReadSession {
    pub(crate) fn new(shared: Arc<Shared>) -> Result<Self, Error> {
        Ok(ReadSession {
            session: AllocSession::new(shared.alloc.clone())?,
            shared,
        })
    }

    /// The value under `key`, or `None` if it is absent or holds a subtree.
    pub fn get(&self, root: &Root, key: &[u8]) -> Option<Vec<u8>> {
        self.get_with(root, key, |value| value.map(<[u8]>::to_vec))
    }

    /// Call `f` with the value under `key` without copying it out.
    pub fn get_with<R>(&self, root: &Root, key: &[u8], f: impl FnOnce(Option<&[u8]>) -> R) -> R {
        let lock = self.session.lock();
        match trie::lookup(&lock, root.id(), key) {
            Some(Found::Data(data)) => f(Some(data)),
            _ => f(None),
        }
    }

    /// Whether `key` holds a value or a subtree.
    pub fn contains(&self, root: &Root, key: &[u8]) -> bool {
        let lock = self.session.lock();
        trie::lookup(&lock, root.id(), key).is_some()
    }

    /// The subtree stored under `key`. It keeps `root` alive.
    pub fn get_subtree(&self, root: &Root, key: &[u8]) -> Option<Root> {
        let lock = self.session.lock();
        match trie::lookup(&lock, root.id(), key)? {
            Found::Subtree(id) => Some(Root::borrowed(id, root.clone())),
            Found::Data(_) => None,
        }
    }

    /// The number of keys in the tree, subtrees counting as one key each.
    pub fn count_keys(&self, root: &Root) -> u64 {
        let lock = self.session.lock();
        trie::count_keys(&lock, root.id())
    }

    /// Iterate over the whole tree in key order.
    pub fn iter(&self, root: &Root) -> TrieIterator<'_> {
        TrieIterator::new(&self.session, root.clone())
    }

    /// Iterate over the keys not less than `start` and, if given, less than `end`.
    pub fn range(&self, root: &Root, start: &[u8], end: Option<&[u8]>) -> TrieIterator<'_> {
        let iter = TrieIterator::new(&self.session, root.clone()).with_start(start);
        match end {
            Some(end) => iter.with_end(end),
            None => iter,
        }
    }

    /// Iterate over the keys starting with `prefix`.
    pub fn prefix(&self, root: &Root, prefix: &[u8]) -> TrieIterator<'_> {
        TrieIterator::new(&self.session, root.clone()).with_prefix(prefix)
    }

    /// The tree currently stored in top root slot `index`.
    ///
    /// Panics if `index` is not less than [`crate::NUM_TOP_ROOTS`].
    pub fn get_top_root(&self, index: usize) -> Result<Root, Error> {
        let lock = self.session.lock();
        let id = self.shared.load_top_root(&lock, index)?;
        Ok(Root::owned(self.shared.clone(), id))
    }

    /// An owned reference to the top node of `root`.
    pub fn handle(&self, root: &Root) -> Result<NodeHandle<'_>, Error> {
        NodeHandle::retain(&self.session, root.id())
    }
}

/// Reads and writes trees.
///
/// Writes go through a `&mut Root`. When the root is unique, nodes nobody else can reach are
/// updated in place; otherwise the changed path is copied and the root replaced by the new
/// version, leaving every other holder of the old one unaffected.
pub struct WriteSession {
    read: ReadSession,
}

impl Deref for WriteSession {
    type Target = ReadSession;

    fn deref(&self) -> &ReadSession {
        &self.read
    }
}

impl WriteSession {
    pub(crate) fn new(shared: Arc<Shared>) -> Result<Self, Error> {
        Ok(WriteSession {
            read: ReadSession::new(shared)?,
        })
    }

    /// A new, empty tree.
    pub fn create_root(&self) -> Root {
        Root::owned(self.shared.clone(), IdAddress::NULL)
    }

    /// The largest value that can be stored.
    pub fn max_value_size(&self) -> usize {
        self.session.allocator().segment_size() as usize
            - SEGMENT_HEADER_SIZE as usize
            - value_node_size(0)
    }

    /// Store `value` under `key`. Returns the length of the value it replaced, 0 if that was a
    /// subtree, or `None` if the key was absent.
    pub fn upsert(&self, root: &mut Root, key: &[u8], value: &[u8]) -> Result<Option<usize>, Error> {
        let max = self.max_value_size();
        if value.len() > max {
            return Err(Error::ValueTooLarge {
                len: value.len(),
                max,
            });
        }
        self.write(root, key, NewValue::Data(value))
    }

    /// Store `subtree` under `key`, as for [`Self::upsert`]. The tree takes its own reference to
    /// the subtree.
    pub fn upsert_subtree(
        &self,
        root: &mut Root,
        key: &[u8],
        subtree: &Root,
    ) -> Result<Option<usize>, Error> {
        self.write(root, key, NewValue::Subtree(subtree.id()))
    }

    fn write(&self, root: &mut Root, key: &[u8], value: NewValue) -> Result<Option<usize>, Error> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge {
                len: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        let lock = self.session.lock();
        let (id, prior) = update::upsert(&lock, root.id(), root.is_unique(), key, value)?;
        root.update(id, &lock);
        Ok(match prior {
            Prior::Absent => None,
            Prior::Data(len) => Some(len),
            Prior::Subtree => Some(0),
        })
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&self, root: &mut Root, key: &[u8]) -> Result<bool, Error> {
        if key.len() > MAX_KEY_SIZE {
            return Ok(false);
        }
        let lock = self.session.lock();
        match update::remove(&lock, root.id(), root.is_unique(), key)? {
            Removal::NotFound => Ok(false),
            Removal::Removed(id) => {
                root.update(id, &lock);
                Ok(true)
            }
        }
    }

    /// Store `root` in top root slot `index`. Returns the tree stored there before.
    ///
    /// Panics if `index` is not less than [`crate::NUM_TOP_ROOTS`].
    pub fn set_top_root(&self, index: usize, root: &Root) -> Result<Root, Error> {
        let id = root.id();
        if id.is_valid() {
            self.session.lock().retain(id)?;
        }
        let old = self.shared.swap_top_root(index, id);
        Ok(Root::owned(self.shared.clone(), old))
    }

    /// Start a transaction on top root slot `index`. Transactions on the same slot run one at a
    /// time; this blocks until earlier ones are done.
    ///
    /// Panics if `index` is not less than [`crate::NUM_TOP_ROOTS`].
    pub fn start_transaction(&self, index: usize) -> Result<WriteTransaction<'_>, Error> {
        let guard = Mutex::lock_arc(&self.shared.transaction_lock(index));
        let root = self.get_top_root(index)?;
        Ok(WriteTransaction {
            session: self,
            index,
            root,
            _guard: guard,
        })
    }
}

/// A sequence of writes to the tree in a top root slot, published all at once.
///
/// Dropping a transaction without committing aborts it.
pub struct WriteTransaction<'s> {
    session: &'s WriteSession,
    index: usize,
    root: Root,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl WriteTransaction<'_> {
    /// The working version of the tree.
    pub fn root(&self) -> &Root {
        &self.root
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.session.get(&self.root, key)
    }

    pub fn upsert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<usize>, Error> {
        self.session.upsert(&mut self.root, key, value)
    }

    pub fn upsert_subtree(&mut self, key: &[u8], subtree: &Root) -> Result<Option<usize>, Error> {
        self.session.upsert_subtree(&mut self.root, key, subtree)
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<bool, Error> {
        self.session.remove(&mut self.root, key)
    }

    /// Publish the working tree in the slot. Returns the tree it replaced.
    ///
    /// Only fails if the working tree is shared with another handle and already has the maximum
    /// number of references; the slot is then left unchanged.
    pub fn commit(self) -> Result<Root, Error> {
        let session = self.session;
        let id = match self.root.try_into_id() {
            Ok(id) => id,
            Err(root) => {
                if root.id().is_valid() {
                    session.session.lock().retain(root.id())?;
                }
                root.id()
            }
        };
        let old = session.shared.swap_top_root(self.index, id);
        Ok(Root::owned(session.shared.clone(), old))
    }

    /// Give up the transaction, leaving the slot unchanged. Returns the working tree.
    pub fn abort(self) -> Root {
        self.root
    }
}
