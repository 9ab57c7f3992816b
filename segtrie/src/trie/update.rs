//! Upsert and remove.
//!
//! Every update walks down to the node holding the key, changes it and rebuilds the path back up.
//! How a node is changed depends on whether anyone else can observe it:
//!
//! - A node is *unique* when the root being written is unique and every node from the root down
//!   to and including it has a single reference. Unique nodes are edited in place when the edit
//!   fits the space they occupy, and are otherwise rewritten under the same id.
//! - Any other node is copied: the new version gets a fresh id and shares the children it did not
//!   change with the old one.
//!
//! Nodes hold a reference to everything they point at. Writing a node retains all of its
//! children; rewriting a unique node then releases the children of its previous contents. New
//! nodes are kept in [`NodeHandle`]s until a parent has retained them, so a failure halfway
//! releases everything that was built and leaves the tree as it was.
//!
//! A call returns the id of the updated node. If it differs from the id passed in, the caller owns
//! one reference to it. A unique caller then links it in place of the old id and releases the old
//! one; a copying caller links it into its own copy. A node that becomes empty is returned as the
//! null id and is left untouched, to be released as a whole by its parent.

use segtrie_core::{
    common_prefix_len,
    node::{
        binary::{binary_fits, binary_size, set_inline_value_in_place, write_binary, MAX_INLINE_VALUE},
        value::{fits_in_place, set_value_in_place, value_node_size, write_value_node},
        BinaryEntry, BinaryNode, InnerBuilder, InnerNode, InnerNodeMut, NodeView, ValueRef,
    },
    IdAddress, NodeType,
};

use super::unexpected_value_node;
use crate::{
    error::Error,
    node_handle::{NodeHandle, Retained},
    seg_alloc::{AllocSession, ReadLock},
};

/// A value to store.
#[derive(Debug, Clone, Copy)]
pub(crate) enum NewValue<'v> {
    Data(&'v [u8]),
    /// The root of another tree. The tree takes its own reference to it.
    Subtree(IdAddress),
}

/// What was stored under a key before an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Prior {
    Absent,
    Data(usize),
    Subtree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    NotFound,
    /// The key was removed. Holds the updated node, null if nothing is left.
    Removed(IdAddress),
}

/// Store `value` under `key` in the tree rooted at `root`.
///
/// `unique` tells whether the root handle is unique. Returns the new root id, which the caller
/// owns if it differs from `root`.
pub(crate) fn upsert(
    lock: &ReadLock,
    root: IdAddress,
    unique: bool,
    key: &[u8],
    value: NewValue,
) -> Result<(IdAddress, Prior), Error> {
    Writer { lock }.upsert_node(root, key, &value, unique)
}

/// Remove `key` from the tree rooted at `root`. Ownership of the result is as for [`upsert`].
pub(crate) fn remove(
    lock: &ReadLock,
    root: IdAddress,
    unique: bool,
    key: &[u8],
) -> Result<Removal, Error> {
    if !root.is_valid() {
        return Ok(Removal::NotFound);
    }
    Writer { lock }.remove_node(root, key, unique)
}

struct Writer<'l, 's> {
    lock: &'l ReadLock<'s>,
}

impl<'l, 's> Writer<'l, 's> {
    fn session(&self) -> &'s AllocSession {
        self.lock.session()
    }

    fn view(&self, id: IdAddress) -> NodeView<'l> {
        self.lock.get(id).view()
    }

    fn is_unique(&self, id: IdAddress, path_unique: bool) -> bool {
        path_unique && self.lock.get(id).ref_count() == 1
    }

    fn release(&self, id: IdAddress) {
        if id.is_valid() {
            self.lock.release_node(id);
        }
    }

    fn prior(&self, value: ValueRef) -> Prior {
        match value {
            ValueRef::Inline(data) => Prior::Data(data.len()),
            ValueRef::Node(id) => match self.view(id) {
                NodeView::Value(v) => Prior::Data(v.value().len()),
                _ => unexpected_value_kind(id),
            },
            ValueRef::Subtree(_) => Prior::Subtree,
        }
    }

    fn value_node(&self, data: &[u8]) -> Result<NodeHandle<'s>, Error> {
        let id = self
            .lock
            .alloc_node(value_node_size(data.len()), NodeType::Value, |out, id| {
                write_value_node(out, id, data)
            })?;
        Ok(NodeHandle::adopt(self.session(), id))
    }

    /// Prepare `value` for linking into a node. The handle holds the reference the value needs
    /// until a node retains it.
    fn stored<'v>(
        &self,
        value: &NewValue<'v>,
        inline: bool,
    ) -> Result<(ValueRef<'v>, NodeHandle<'s>), Error> {
        match *value {
            NewValue::Data(data) if inline && data.len() <= MAX_INLINE_VALUE => Ok((
                ValueRef::Inline(data),
                NodeHandle::adopt(self.session(), IdAddress::NULL),
            )),
            NewValue::Data(data) => {
                let handle = self.value_node(data)?;
                Ok((ValueRef::Node(handle.id()), handle))
            }
            NewValue::Subtree(id) => Ok((
                ValueRef::Subtree(id),
                NodeHandle::retain(self.session(), id)?,
            )),
        }
    }

    /// Write a node with the given contents, retaining all of `children`.
    ///
    /// A unique node is rewritten under its id and the children of its previous contents are
    /// released; otherwise a new node is allocated.
    fn commit(
        &self,
        id: IdAddress,
        unique: bool,
        size: usize,
        node_type: NodeType,
        children: impl IntoIterator<Item = IdAddress>,
        write: impl FnOnce(&mut [u8], IdAddress),
    ) -> Result<IdAddress, Error> {
        let retained = Retained::retain_all(self.session(), children)?;
        let id = if unique {
            let mut previous = Vec::new();
            self.view(id).visit_branches(|child| previous.push(child));
            self.lock.realloc_node(id, size, node_type, write)?;
            for child in previous {
                self.lock.release_node(child);
            }
            id
        } else {
            self.lock.alloc_node(size, node_type, write)?
        };
        retained.disarm();
        Ok(id)
    }

    fn commit_binary(
        &self,
        id: IdAddress,
        unique: bool,
        entries: &[BinaryEntry],
    ) -> Result<IdAddress, Error> {
        self.commit(
            id,
            unique,
            binary_size(entries),
            NodeType::Binary,
            entries.iter().filter_map(|e| e.value.child_id()),
            |out, id| write_binary(out, id, entries),
        )
    }

    fn commit_inner(
        &self,
        id: IdAddress,
        unique: bool,
        builder: &InnerBuilder,
    ) -> Result<IdAddress, Error> {
        let eof = builder.eof.and_then(|eof| eof.child_id());
        let branches = builder.branches().iter().map(|(_, child)| *child);
        self.commit(
            id,
            unique,
            builder.size(),
            builder.node_type(),
            eof.into_iter().chain(branches),
            |out, id| builder.write(out, id),
        )
    }

    /// A new binary node holding a single entry.
    fn leaf(&self, key: &[u8], value: &NewValue) -> Result<NodeHandle<'s>, Error> {
        let (stored, _value) = self.stored(value, true)?;
        let id = self.commit_binary(
            IdAddress::NULL,
            false,
            &[BinaryEntry { key, value: stored }],
        )?;
        Ok(NodeHandle::adopt(self.session(), id))
    }

    /// A new tree holding `entries`, which are sorted and relative to the tree's position.
    fn build(&self, entries: &[BinaryEntry]) -> Result<NodeHandle<'s>, Error> {
        let id = if binary_fits(entries) {
            self.commit_binary(IdAddress::NULL, false, entries)?
        } else {
            let mut children = Vec::new();
            let builder = self.split_entries(entries, &mut children)?;
            self.commit_inner(IdAddress::NULL, false, &builder)?
        };
        Ok(NodeHandle::adopt(self.session(), id))
    }

    /// Lay out `entries` as an inner node over their common prefix. The new children are pushed
    /// to `children` and must outlive the write of the node.
    fn split_entries<'e>(
        &self,
        entries: &[BinaryEntry<'e>],
        children: &mut Vec<NodeHandle<'s>>,
    ) -> Result<InnerBuilder<'e>, Error> {
        let first = entries[0].key;
        let last = entries[entries.len() - 1].key;
        let prefix_len = common_prefix_len(first, last);

        let mut builder = InnerBuilder::new(&first[..prefix_len]);
        builder.descendants = entries.len() as u64;
        let mut rest = entries;
        if first.len() == prefix_len {
            let eof = match entries[0].value {
                ValueRef::Inline(data) => {
                    let handle = self.value_node(data)?;
                    let id = handle.id();
                    children.push(handle);
                    ValueRef::Node(id)
                }
                value => value,
            };
            builder.eof = Some(eof);
            rest = &entries[1..];
        }

        while let Some(head) = rest.first() {
            let byte = head.key[prefix_len];
            let n = rest
                .iter()
                .take_while(|e| e.key[prefix_len] == byte)
                .count();
            let group: Vec<BinaryEntry> = rest[..n]
                .iter()
                .map(|e| BinaryEntry {
                    key: &e.key[prefix_len + 1..],
                    value: e.value,
                })
                .collect();
            let child = self.build(&group)?;
            builder.set_branch(byte, child.id());
            children.push(child);
            rest = &rest[n..];
        }
        Ok(builder)
    }

    fn upsert_node(
        &self,
        id: IdAddress,
        key: &[u8],
        value: &NewValue,
        path_unique: bool,
    ) -> Result<(IdAddress, Prior), Error> {
        if !id.is_valid() {
            let leaf = self.leaf(key, value)?;
            return Ok((leaf.take(), Prior::Absent));
        }
        let unique = self.is_unique(id, path_unique);
        match self.view(id) {
            NodeView::Binary(node) => self.upsert_binary(id, node, key, value, unique),
            NodeView::Inner(node) => self.upsert_inner(id, node, key, value, unique),
            NodeView::Value(_) => unexpected_value_node(id),
        }
    }

    fn upsert_binary(
        &self,
        id: IdAddress,
        node: BinaryNode<'l>,
        key: &[u8],
        value: &NewValue,
        unique: bool,
    ) -> Result<(IdAddress, Prior), Error> {
        let mut entries: Vec<BinaryEntry> = node.entries();
        let (prior, _value) = match node.find(key) {
            Ok(i) => {
                let old = node.value(i);
                let prior = self.prior(old);
                if unique && self.replace_in_place(id, i, old, value) {
                    return Ok((id, prior));
                }
                let (stored, handle) = self.stored(value, true)?;
                entries[i].value = stored;
                (prior, handle)
            }
            Err(i) => {
                let (stored, handle) = self.stored(value, true)?;
                entries.insert(i, BinaryEntry { key, value: stored });
                (Prior::Absent, handle)
            }
        };

        let id = if binary_fits(&entries) {
            self.commit_binary(id, unique, &entries)?
        } else {
            let mut children = Vec::new();
            let builder = self.split_entries(&entries, &mut children)?;
            self.commit_inner(id, unique, &builder)?
        };
        Ok((id, prior))
    }

    /// Overwrite the value of entry `i` of a unique binary node without moving the node.
    fn replace_in_place(&self, id: IdAddress, i: usize, old: ValueRef, value: &NewValue) -> bool {
        let NewValue::Data(data) = *value else {
            return false;
        };
        match old {
            ValueRef::Inline(old) if old.len() == data.len() => {
                let mut guard = self.lock.get(id).modify();
                set_inline_value_in_place(guard.bytes_mut(), i, data)
            }
            ValueRef::Node(value_id) if data.len() > MAX_INLINE_VALUE => {
                self.set_value_in_place(value_id, data)
            }
            _ => false,
        }
    }

    /// Overwrite a value node in place if nobody else refers to it and the new value takes the
    /// same space.
    fn set_value_in_place(&self, value_id: IdAddress, data: &[u8]) -> bool {
        let obj = self.lock.get(value_id);
        if obj.ref_count() != 1 {
            return false;
        }
        let size = match obj.view() {
            NodeView::Value(v) => v.bytes().len(),
            _ => unexpected_value_kind(value_id),
        };
        if !fits_in_place(size, data.len()) {
            return false;
        }
        let mut guard = obj.modify();
        set_value_in_place(guard.bytes_mut(), data);
        true
    }

    fn upsert_inner(
        &self,
        id: IdAddress,
        node: InnerNode<'l>,
        key: &[u8],
        value: &NewValue,
        unique: bool,
    ) -> Result<(IdAddress, Prior), Error> {
        let prefix = node.prefix();
        let matched = common_prefix_len(prefix, key);
        if matched < prefix.len() {
            let id = self.split_prefix(id, node, matched, key, value, unique)?;
            return Ok((id, Prior::Absent));
        }

        let Some((&byte, rest)) = key[prefix.len()..].split_first() else {
            return self.upsert_eof(id, node, value, unique);
        };
        if let Some(child) = node.get_branch(byte) {
            let (new_child, prior) = self.upsert_node(child, rest, value, unique)?;
            let delta = (prior == Prior::Absent) as i64;
            let id = self.replace_branch(id, node, unique, byte, child, new_child, delta)?;
            return Ok((id, prior));
        }

        let leaf = self.leaf(rest, value)?;
        if unique && node.has_room() {
            {
                let mut guard = self.lock.get(id).modify();
                let mut edit = InnerNodeMut::new(guard.bytes_mut());
                let added = edit.try_add_branch(byte, leaf.id());
                debug_assert!(added);
                edit.add_descendants(1);
            }
            leaf.take();
            return Ok((id, Prior::Absent));
        }
        let mut builder = InnerBuilder::from_node(&node);
        builder.set_branch(byte, leaf.id());
        builder.descendants += 1;
        Ok((self.commit_inner(id, unique, &builder)?, Prior::Absent))
    }

    /// Insert a key that diverges from the node's prefix after `matched` bytes. The node's
    /// contents move to a new node below the split point and the node itself becomes the new
    /// parent.
    fn split_prefix(
        &self,
        id: IdAddress,
        node: InnerNode<'l>,
        matched: usize,
        key: &[u8],
        value: &NewValue,
        unique: bool,
    ) -> Result<IdAddress, Error> {
        let prefix = node.prefix();
        let mut lower = InnerBuilder::from_node(&node);
        lower.prefix = &prefix[matched + 1..];
        let lower = self.commit_inner(IdAddress::NULL, false, &lower)?;
        let lower = NodeHandle::adopt(self.session(), lower);

        let mut upper = InnerBuilder::new(&prefix[..matched]);
        upper.descendants = node.descendants() + 1;
        upper.set_branch(prefix[matched], lower.id());
        let _new = match key.get(matched) {
            None => {
                let (stored, handle) = self.stored(value, false)?;
                upper.eof = Some(stored);
                handle
            }
            Some(&byte) => {
                let leaf = self.leaf(&key[matched + 1..], value)?;
                upper.set_branch(byte, leaf.id());
                leaf
            }
        };
        self.commit_inner(id, unique, &upper)
    }

    fn upsert_eof(
        &self,
        id: IdAddress,
        node: InnerNode<'l>,
        value: &NewValue,
        unique: bool,
    ) -> Result<(IdAddress, Prior), Error> {
        let old = node.eof();
        let prior = old.map_or(Prior::Absent, |old| self.prior(old));
        let delta = (prior == Prior::Absent) as i64;

        if unique {
            if let (Some(ValueRef::Node(value_id)), NewValue::Data(data)) = (old, value) {
                if self.set_value_in_place(value_id, data) {
                    return Ok((id, prior));
                }
            }
            let (stored, handle) = self.stored(value, false)?;
            {
                let mut guard = self.lock.get(id).modify();
                let mut edit = InnerNodeMut::new(guard.bytes_mut());
                edit.set_eof(Some(stored));
                edit.add_descendants(delta);
            }
            handle.take();
            if let Some(old) = old.and_then(|old| old.child_id()) {
                self.release(old);
            }
            return Ok((id, prior));
        }

        let (stored, _value) = self.stored(value, false)?;
        let mut builder = InnerBuilder::from_node(&node);
        builder.eof = Some(stored);
        builder.descendants = builder.descendants.wrapping_add_signed(delta);
        Ok((self.commit_inner(id, false, &builder)?, prior))
    }

    /// Link `new_child` in place of `old_child` under `byte` and adjust the key count.
    #[allow(clippy::too_many_arguments)]
    fn replace_branch(
        &self,
        id: IdAddress,
        node: InnerNode<'l>,
        unique: bool,
        byte: u8,
        old_child: IdAddress,
        new_child: IdAddress,
        delta: i64,
    ) -> Result<IdAddress, Error> {
        let replaced = new_child != old_child;
        if unique {
            if replaced || delta != 0 {
                let mut guard = self.lock.get(id).modify();
                let mut edit = InnerNodeMut::new(guard.bytes_mut());
                if replaced {
                    edit.set_branch(byte, new_child);
                }
                edit.add_descendants(delta);
            }
            if replaced {
                self.lock.release_node(old_child);
            }
            return Ok(id);
        }

        let _new_child = replaced.then(|| NodeHandle::adopt(self.session(), new_child));
        let mut builder = InnerBuilder::from_node(&node);
        builder.set_branch(byte, new_child);
        builder.descendants = builder.descendants.wrapping_add_signed(delta);
        self.commit_inner(id, false, &builder)
    }

    fn remove_node(
        &self,
        id: IdAddress,
        key: &[u8],
        path_unique: bool,
    ) -> Result<Removal, Error> {
        let unique = self.is_unique(id, path_unique);
        match self.view(id) {
            NodeView::Binary(node) => {
                let Ok(i) = node.find(key) else {
                    return Ok(Removal::NotFound);
                };
                if node.num_entries() == 1 {
                    return Ok(Removal::Removed(IdAddress::NULL));
                }
                let mut entries = node.entries();
                entries.remove(i);
                Ok(Removal::Removed(self.commit_binary(id, unique, &entries)?))
            }
            NodeView::Inner(node) => {
                let Some(rest) = key.strip_prefix(node.prefix()) else {
                    return Ok(Removal::NotFound);
                };
                let Some((&byte, rest)) = rest.split_first() else {
                    return self.remove_eof(id, node, unique);
                };
                let Some(child) = node.get_branch(byte) else {
                    return Ok(Removal::NotFound);
                };
                match self.remove_node(child, rest, unique)? {
                    Removal::NotFound => Ok(Removal::NotFound),
                    Removal::Removed(new_child) if !new_child.is_valid() => {
                        self.remove_branch(id, node, unique, byte, child)
                    }
                    Removal::Removed(new_child) => {
                        let id = self.replace_branch(id, node, unique, byte, child, new_child, -1)?;
                        Ok(Removal::Removed(id))
                    }
                }
            }
            NodeView::Value(_) => unexpected_value_node(id),
        }
    }

    fn remove_eof(
        &self,
        id: IdAddress,
        node: InnerNode<'l>,
        unique: bool,
    ) -> Result<Removal, Error> {
        let Some(old) = node.eof() else {
            return Ok(Removal::NotFound);
        };
        if node.num_branches() == 0 {
            return Ok(Removal::Removed(IdAddress::NULL));
        }
        if unique {
            {
                let mut guard = self.lock.get(id).modify();
                let mut edit = InnerNodeMut::new(guard.bytes_mut());
                edit.set_eof(None);
                edit.add_descendants(-1);
            }
            if let Some(old) = old.child_id() {
                self.release(old);
            }
            return Ok(Removal::Removed(id));
        }
        let mut builder = InnerBuilder::from_node(&node);
        builder.eof = None;
        builder.descendants -= 1;
        Ok(Removal::Removed(self.commit_inner(id, false, &builder)?))
    }

    /// Drop the branch under `byte`, whose node `child` has become empty.
    fn remove_branch(
        &self,
        id: IdAddress,
        node: InnerNode<'l>,
        unique: bool,
        byte: u8,
        child: IdAddress,
    ) -> Result<Removal, Error> {
        if node.num_branches() == 1 && node.eof().is_none() {
            return Ok(Removal::Removed(IdAddress::NULL));
        }
        if unique {
            {
                let mut guard = self.lock.get(id).modify();
                let mut edit = InnerNodeMut::new(guard.bytes_mut());
                let removed = edit.remove_branch(byte);
                debug_assert!(removed);
                edit.add_descendants(-1);
            }
            self.lock.release_node(child);
            return Ok(Removal::Removed(id));
        }
        let mut builder = InnerBuilder::from_node(&node);
        builder.remove_branch(byte);
        builder.descendants -= 1;
        Ok(Removal::Removed(self.commit_inner(id, false, &builder)?))
    }
}

fn unexpected_value_kind(id: IdAddress) -> ! {
    tracing::error!(%id, "value id is not a value node");
    panic!("corrupt node: value {id} is not a value node")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use segtrie_core::node::InnerKind;

    use super::*;
    use crate::{
        metrics::Metrics,
        options::Options,
        seg_alloc::SegAllocator,
        trie::{count_keys, lookup, Found},
    };

    fn open(dir: &std::path::Path) -> Arc<SegAllocator> {
        let mut o = Options::new();
        o.path(dir);
        o.segment_size(1 << 20);
        o.max_segments(64);
        o.validate_checksums(true);
        Arc::new(SegAllocator::open(&o, Metrics::new(false)).unwrap())
    }

    fn put(lock: &ReadLock, root: &mut IdAddress, key: &[u8], value: &[u8]) -> Prior {
        let (new, prior) = upsert(lock, *root, true, key, NewValue::Data(value)).unwrap();
        if new != *root && root.is_valid() {
            lock.release_node(*root);
        }
        *root = new;
        prior
    }

    fn get(lock: &ReadLock, root: IdAddress, key: &[u8]) -> Option<Vec<u8>> {
        match lookup(lock, root, key)? {
            Found::Data(data) => Some(data.to_vec()),
            Found::Subtree(_) => panic!("unexpected subtree"),
        }
    }

    #[test]
    fn unique_root_keeps_its_id() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = open(dir.path());
        let session = AllocSession::new(alloc.clone()).unwrap();
        let lock = session.lock();

        let mut root = IdAddress::NULL;
        assert_eq!(put(&lock, &mut root, b"a", b"1"), Prior::Absent);
        let first = root;
        for i in 0..2000u32 {
            put(&lock, &mut root, &i.to_be_bytes(), &i.to_le_bytes());
        }
        assert_eq!(root, first);
        assert_eq!(put(&lock, &mut root, b"a", b"2"), Prior::Data(1));
        assert_eq!(get(&lock, root, b"a").unwrap(), b"2");
        for i in 0..2000u32 {
            assert_eq!(get(&lock, root, &i.to_be_bytes()).unwrap(), i.to_le_bytes());
        }
        assert_eq!(count_keys(&lock, root), 2001);

        lock.release_node(root);
        assert_eq!(alloc.ids.live_ids(), 0);
    }

    #[test]
    fn shared_nodes_are_copied() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = open(dir.path());
        let session = AllocSession::new(alloc.clone()).unwrap();
        let lock = session.lock();

        let mut root = IdAddress::NULL;
        for i in 0..500u32 {
            put(&lock, &mut root, &i.to_be_bytes(), b"old");
        }
        let (next, prior) = upsert(&lock, root, false, &7u32.to_be_bytes(), NewValue::Data(b"new"))
            .unwrap();
        assert_eq!(prior, Prior::Data(3));
        assert_ne!(next, root);
        assert_eq!(get(&lock, root, &7u32.to_be_bytes()).unwrap(), b"old");
        assert_eq!(get(&lock, next, &7u32.to_be_bytes()).unwrap(), b"new");

        let removed = remove(&lock, next, false, &8u32.to_be_bytes()).unwrap();
        let Removal::Removed(after) = removed else {
            panic!("key 8 is present");
        };
        assert!(get(&lock, after, &8u32.to_be_bytes()).is_none());
        assert_eq!(get(&lock, next, &8u32.to_be_bytes()).unwrap(), b"old");
        assert_eq!(count_keys(&lock, after), 499);

        for id in [root, next, after] {
            lock.release_node(id);
        }
        assert_eq!(alloc.ids.live_ids(), 0);
    }

    #[test]
    fn wide_fanout_promotes_to_full() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = open(dir.path());
        let session = AllocSession::new(alloc.clone()).unwrap();
        let lock = session.lock();

        let mut root = IdAddress::NULL;
        for byte in 0..=255u8 {
            put(&lock, &mut root, &[byte, 1, 2, 3], &[byte; 80]);
        }
        match lock.get(root).view() {
            NodeView::Inner(node) => {
                assert_eq!(node.kind(), InnerKind::Full);
                assert_eq!(node.num_branches(), 256);
            }
            _ => panic!("expected an inner root"),
        }
        for byte in 0..=255u8 {
            assert_eq!(get(&lock, root, &[byte, 1, 2, 3]).unwrap(), [byte; 80]);
        }
        lock.release_node(root);
        assert_eq!(alloc.ids.live_ids(), 0);
    }

    #[test]
    fn prefix_split_and_eof() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = open(dir.path());
        let session = AllocSession::new(alloc.clone()).unwrap();
        let lock = session.lock();

        let mut root = IdAddress::NULL;
        // enough entries under one prefix to force an inner node with a long prefix.
        for i in 0..200u32 {
            put(&lock, &mut root, &[b"shared/prefix/".as_slice(), &i.to_be_bytes()].concat(), b"v");
        }
        put(&lock, &mut root, b"shared/", b"eof");
        put(&lock, &mut root, b"shared/other", b"x");
        put(&lock, &mut root, b"", b"empty key");

        assert_eq!(get(&lock, root, b"shared/").unwrap(), b"eof");
        assert_eq!(get(&lock, root, b"shared/other").unwrap(), b"x");
        assert_eq!(get(&lock, root, b"").unwrap(), b"empty key");
        assert!(get(&lock, root, b"shared").is_none());
        assert_eq!(count_keys(&lock, root), 203);

        for key in [b"shared/".as_slice(), b"", b"shared/other"] {
            let Removal::Removed(next) = remove(&lock, root, true, key).unwrap() else {
                panic!("key is present");
            };
            assert_eq!(next, root);
        }
        assert_eq!(remove(&lock, root, true, b"shared/").unwrap(), Removal::NotFound);
        assert_eq!(count_keys(&lock, root), 200);
        lock.release_node(root);
        assert_eq!(alloc.ids.live_ids(), 0);
    }

    #[test]
    fn large_values_live_in_value_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = open(dir.path());
        let session = AllocSession::new(alloc.clone()).unwrap();
        let lock = session.lock();

        let mut root = IdAddress::NULL;
        put(&lock, &mut root, b"big", &[7; 1000]);
        assert_eq!(alloc.ids.live_ids(), 2);
        // same size, rewritten in place.
        put(&lock, &mut root, b"big", &[8; 1000]);
        assert_eq!(alloc.ids.live_ids(), 2);
        assert_eq!(get(&lock, root, b"big").unwrap(), [8; 1000]);
        // small enough to go inline, the value node goes away.
        assert_eq!(put(&lock, &mut root, b"big", b"small"), Prior::Data(1000));
        assert_eq!(alloc.ids.live_ids(), 1);

        let Removal::Removed(empty) = remove(&lock, root, true, b"big").unwrap() else {
            panic!("key is present");
        };
        assert!(!empty.is_valid());
        lock.release_node(root);
        assert_eq!(alloc.ids.live_ids(), 0);
    }
}
