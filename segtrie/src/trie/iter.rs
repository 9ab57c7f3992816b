//! Ordered iteration over a tree, from either end.
//!
//! A cursor keeps the path to its current position as ids and positions within nodes, not as
//! node bytes. Every step takes a fresh read lock and resolves the ids again, so the compactor is
//! free to move nodes between steps. The nodes themselves cannot change underneath: the iterator
//! holds a clone of its root, which forces writers to copy.

use segtrie_core::{
    common_prefix_len,
    node::{NodeView, ValueRef},
    IdAddress,
};

use super::{resolve, unexpected_value_node, Value};
use crate::{
    root::Root,
    seg_alloc::{AllocSession, ReadLock},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pos {
    /// At the eof value of an inner node.
    Eof,
    /// Inside the child under this branch byte.
    Branch(u8),
    /// At an entry of a binary node.
    Entry(usize),
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    id: IdAddress,
    /// The length of the key leading up to the node.
    key_len: usize,
    pos: Pos,
}

/// A position in a tree: the path down to one key.
#[derive(Default)]
struct Cursor {
    stack: Vec<Frame>,
    key: Vec<u8>,
}

impl Cursor {
    fn reset(&mut self) {
        self.stack.clear();
        self.key.clear();
    }

    fn is_positioned(&self) -> bool {
        !self.stack.is_empty()
    }

    fn set_top(&mut self, pos: Pos) {
        if let Some(top) = self.stack.last_mut() {
            top.pos = pos;
        }
    }

    fn push(&mut self, id: IdAddress, key_len: usize, pos: Pos) {
        self.stack.push(Frame { id, key_len, pos });
    }

    /// Push frames down to the smallest key below `id`.
    fn descend_first(&mut self, lock: &ReadLock, mut id: IdAddress) {
        loop {
            let key_len = self.key.len();
            match lock.get(id).view() {
                NodeView::Inner(node) => {
                    self.key.extend_from_slice(node.prefix());
                    if node.eof().is_some() {
                        self.push(id, key_len, Pos::Eof);
                        return;
                    }
                    let Some((byte, child)) = node.next_branch(0) else {
                        empty_inner_node(id)
                    };
                    self.push(id, key_len, Pos::Branch(byte));
                    self.key.push(byte);
                    id = child;
                }
                NodeView::Binary(node) => {
                    self.key.extend_from_slice(node.key(0));
                    self.push(id, key_len, Pos::Entry(0));
                    return;
                }
                NodeView::Value(_) => unexpected_value_node(id),
            }
        }
    }

    /// Push frames down to the largest key below `id`.
    fn descend_last(&mut self, lock: &ReadLock, mut id: IdAddress) {
        loop {
            let key_len = self.key.len();
            match lock.get(id).view() {
                NodeView::Inner(node) => {
                    self.key.extend_from_slice(node.prefix());
                    match node.prev_branch(256) {
                        Some((byte, child)) => {
                            self.push(id, key_len, Pos::Branch(byte));
                            self.key.push(byte);
                            id = child;
                        }
                        None if node.eof().is_some() => {
                            self.push(id, key_len, Pos::Eof);
                            return;
                        }
                        None => empty_inner_node(id),
                    }
                }
                NodeView::Binary(node) => {
                    let last = node.num_entries() - 1;
                    self.key.extend_from_slice(node.key(last));
                    self.push(id, key_len, Pos::Entry(last));
                    return;
                }
                NodeView::Value(_) => unexpected_value_node(id),
            }
        }
    }

    /// Move to the next key. Returns false, leaving the path empty, at the end.
    fn advance(&mut self, lock: &ReadLock) -> bool {
        while let Some(frame) = self.stack.last().copied() {
            match lock.get(frame.id).view() {
                NodeView::Binary(node) => {
                    if let Pos::Entry(i) = frame.pos {
                        if i + 1 < node.num_entries() {
                            self.key.truncate(frame.key_len);
                            self.key.extend_from_slice(node.key(i + 1));
                            self.set_top(Pos::Entry(i + 1));
                            return true;
                        }
                    }
                }
                NodeView::Inner(node) => {
                    let from = match frame.pos {
                        Pos::Eof => 0,
                        Pos::Branch(byte) => byte as u16 + 1,
                        Pos::Entry(_) => 256,
                    };
                    if let Some((byte, child)) = node.next_branch(from) {
                        self.key.truncate(frame.key_len + node.prefix().len());
                        self.key.push(byte);
                        self.set_top(Pos::Branch(byte));
                        self.descend_first(lock, child);
                        return true;
                    }
                }
                NodeView::Value(_) => unexpected_value_node(frame.id),
            }
            self.stack.pop();
        }
        false
    }

    /// Move to the previous key. Returns false, leaving the path empty, at the start.
    fn retreat(&mut self, lock: &ReadLock) -> bool {
        while let Some(frame) = self.stack.last().copied() {
            match lock.get(frame.id).view() {
                NodeView::Binary(node) => {
                    if let Pos::Entry(i) = frame.pos {
                        if i > 0 {
                            self.key.truncate(frame.key_len);
                            self.key.extend_from_slice(node.key(i - 1));
                            self.set_top(Pos::Entry(i - 1));
                            return true;
                        }
                    }
                }
                NodeView::Inner(node) => {
                    if let Pos::Branch(byte) = frame.pos {
                        let at_node = frame.key_len + node.prefix().len();
                        if let Some((prev, child)) = node.prev_branch(byte as u16) {
                            self.key.truncate(at_node);
                            self.key.push(prev);
                            self.set_top(Pos::Branch(prev));
                            self.descend_last(lock, child);
                            return true;
                        }
                        if node.eof().is_some() {
                            self.key.truncate(at_node);
                            self.set_top(Pos::Eof);
                            return true;
                        }
                    }
                }
                NodeView::Value(_) => unexpected_value_node(frame.id),
            }
            self.stack.pop();
        }
        false
    }

    /// Position at the first key below `id` that is not less than the current key followed by
    /// `target`. Returns false, with the position unchanged, if there is none.
    fn seek_node(&mut self, lock: &ReadLock, id: IdAddress, target: &[u8]) -> bool {
        let key_len = self.key.len();
        match lock.get(id).view() {
            NodeView::Inner(node) => {
                let prefix = node.prefix();
                let matched = common_prefix_len(prefix, target);
                if matched == target.len() {
                    // every key below is at or after the target.
                    self.descend_first(lock, id);
                    return true;
                }
                if matched < prefix.len() {
                    if prefix[matched] > target[matched] {
                        self.descend_first(lock, id);
                        return true;
                    }
                    return false;
                }

                let byte = target[matched];
                self.key.extend_from_slice(prefix);
                self.push(id, key_len, Pos::Branch(byte));
                if let Some(child) = node.get_branch(byte) {
                    self.key.push(byte);
                    if self.seek_node(lock, child, &target[matched + 1..]) {
                        return true;
                    }
                    self.key.pop();
                }
                if let Some((next, child)) = node.next_branch(byte as u16 + 1) {
                    self.key.push(next);
                    self.set_top(Pos::Branch(next));
                    self.descend_first(lock, child);
                    return true;
                }
                self.stack.pop();
                self.key.truncate(key_len);
                false
            }
            NodeView::Binary(node) => {
                let i = node.lower_bound(target);
                if i == node.num_entries() {
                    return false;
                }
                self.key.extend_from_slice(node.key(i));
                self.push(id, key_len, Pos::Entry(i));
                true
            }
            NodeView::Value(_) => unexpected_value_node(id),
        }
    }

    /// Position at the last key below `id` that is less than, or with `inclusive` equal to, the
    /// current key followed by `target`. Returns false, with the position unchanged, if there is
    /// none.
    fn seek_back_node(
        &mut self,
        lock: &ReadLock,
        id: IdAddress,
        target: &[u8],
        inclusive: bool,
    ) -> bool {
        let key_len = self.key.len();
        match lock.get(id).view() {
            NodeView::Inner(node) => {
                let prefix = node.prefix();
                let matched = common_prefix_len(prefix, target);
                if matched < prefix.len() {
                    // the target ends inside the prefix or diverges from it.
                    if matched < target.len() && prefix[matched] < target[matched] {
                        self.descend_last(lock, id);
                        return true;
                    }
                    return false;
                }

                let Some((&byte, rest)) = target[matched..].split_first() else {
                    // only the eof value can be at or before the target.
                    if inclusive && node.eof().is_some() {
                        self.key.extend_from_slice(prefix);
                        self.push(id, key_len, Pos::Eof);
                        return true;
                    }
                    return false;
                };
                self.key.extend_from_slice(prefix);
                self.push(id, key_len, Pos::Branch(byte));
                if let Some(child) = node.get_branch(byte) {
                    self.key.push(byte);
                    if self.seek_back_node(lock, child, rest, inclusive) {
                        return true;
                    }
                    self.key.pop();
                }
                if let Some((prev, child)) = node.prev_branch(byte as u16) {
                    self.key.push(prev);
                    self.set_top(Pos::Branch(prev));
                    self.descend_last(lock, child);
                    return true;
                }
                if node.eof().is_some() {
                    self.set_top(Pos::Eof);
                    return true;
                }
                self.stack.pop();
                self.key.truncate(key_len);
                false
            }
            NodeView::Binary(node) => {
                let i = node.lower_bound(target);
                let i = if inclusive && i < node.num_entries() && node.key(i) == target {
                    i
                } else if i == 0 {
                    return false;
                } else {
                    i - 1
                };
                self.key.extend_from_slice(node.key(i));
                self.push(id, key_len, Pos::Entry(i));
                true
            }
            NodeView::Value(_) => unexpected_value_node(id),
        }
    }

    fn current<'l>(&self, lock: &'l ReadLock) -> Option<ValueRef<'l>> {
        let frame = self.stack.last()?;
        match (lock.get(frame.id).view(), frame.pos) {
            (NodeView::Inner(node), Pos::Eof) => node.eof(),
            (NodeView::Binary(node), Pos::Entry(i)) => Some(node.value(i)),
            _ => None,
        }
    }
}

/// Where the back end of an iterator resumes.
#[derive(Debug, Clone)]
enum BackSeek {
    /// The last key within bounds.
    Last,
    /// The last key not greater than this one.
    AtMost(Vec<u8>),
}

/// An iterator over the keys and values of a tree, in key order.
///
/// Both ends can be consumed and repositioned independently; they never yield the same key.
/// Created by [`crate::ReadSession::iter`], [`crate::ReadSession::range`] and
/// [`crate::ReadSession::prefix`].
pub struct TrieIterator<'s> {
    session: &'s AllocSession,
    root: Root,
    front: Cursor,
    back: Cursor,
    /// Where the front resumes on the next call to `next`, if not from its current position.
    front_seek: Option<Vec<u8>>,
    back_seek: Option<BackSeek>,
    start: Vec<u8>,
    end: Option<Vec<u8>>,
    prefix: Vec<u8>,
}

impl<'s> TrieIterator<'s> {
    pub(crate) fn new(session: &'s AllocSession, root: Root) -> Self {
        TrieIterator {
            session,
            root,
            front: Cursor::default(),
            back: Cursor::default(),
            front_seek: Some(Vec::new()),
            back_seek: Some(BackSeek::Last),
            start: Vec::new(),
            end: None,
            prefix: Vec::new(),
        }
    }

    /// Skip keys less than `start`.
    pub(crate) fn with_start(mut self, start: &[u8]) -> Self {
        self.start = start.to_vec();
        self.front_seek = Some(start.to_vec());
        self
    }

    /// Stop before the first key that is not less than `end`.
    pub(crate) fn with_end(mut self, end: &[u8]) -> Self {
        self.end = Some(end.to_vec());
        self
    }

    /// Only yield keys starting with `prefix`.
    pub(crate) fn with_prefix(self, prefix: &[u8]) -> Self {
        let mut iter = self.with_start(prefix);
        iter.prefix = prefix.to_vec();
        iter
    }

    /// The tree being iterated.
    pub fn root(&self) -> &Root {
        &self.root
    }

    /// Continue the front from the first key not less than `key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.front_seek = Some(key.max(&self.start[..]).to_vec());
    }

    /// Continue the front from the first key within bounds.
    pub fn seek_first(&mut self) {
        self.front_seek = Some(self.start.clone());
    }

    /// Continue the back from the last key not greater than `key`.
    pub fn seek_back(&mut self, key: &[u8]) {
        self.back_seek = Some(BackSeek::AtMost(key.to_vec()));
    }

    /// Continue the back from the last key within bounds.
    pub fn seek_last(&mut self) {
        self.back_seek = Some(BackSeek::Last);
    }

    /// The exclusive upper bound implied by `end` and `prefix`, if any.
    fn upper_bound(&self) -> Option<Vec<u8>> {
        let after_prefix = prefix_successor(&self.prefix);
        match (self.end.clone(), after_prefix) {
            (Some(end), Some(after)) => Some(end.min(after)),
            (end, after) => end.or(after),
        }
    }

    fn in_bounds(&self, key: &[u8]) -> bool {
        key >= &self.start[..]
            && key.starts_with(&self.prefix)
            && self.end.as_ref().map_or(true, |end| key < &end[..])
    }

    /// Nothing is left between the two ends.
    fn finish(&mut self) {
        self.front.reset();
        self.back.reset();
        self.front_seek = None;
        self.back_seek = None;
    }

    fn item(&self, lock: &ReadLock, cursor: &Cursor) -> Option<(Vec<u8>, Value)> {
        let value = resolve(lock, cursor.current(lock)?).to_value(&self.root);
        Some((cursor.key.clone(), value))
    }
}

impl Iterator for TrieIterator<'_> {
    type Item = (Vec<u8>, Value);

    fn next(&mut self) -> Option<Self::Item> {
        let session = self.session;
        let lock = session.lock();
        let root = self.root.id();
        let found = match self.front_seek.take() {
            Some(target) => {
                self.front.reset();
                root.is_valid() && self.front.seek_node(&lock, root, &target)
            }
            None => self.front.is_positioned() && self.front.advance(&lock),
        };
        let back =
            (self.back_seek.is_none() && self.back.is_positioned()).then_some(&self.back.key);
        let crossed = back.map_or(false, |back| self.front.key >= *back);
        if !found || crossed || !self.in_bounds(&self.front.key) {
            self.finish();
            return None;
        }
        self.item(&lock, &self.front)
    }
}

impl DoubleEndedIterator for TrieIterator<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        let session = self.session;
        let lock = session.lock();
        let root = self.root.id();
        let found = match self.back_seek.take() {
            Some(seek) => {
                self.back.reset();
                let upper = self.upper_bound();
                root.is_valid()
                    && match (seek, upper) {
                        (BackSeek::AtMost(key), Some(upper)) if key >= upper => {
                            self.back.seek_back_node(&lock, root, &upper, false)
                        }
                        (BackSeek::AtMost(key), _) => {
                            self.back.seek_back_node(&lock, root, &key, true)
                        }
                        (BackSeek::Last, Some(upper)) => {
                            self.back.seek_back_node(&lock, root, &upper, false)
                        }
                        (BackSeek::Last, None) => {
                            self.back.descend_last(&lock, root);
                            true
                        }
                    }
            }
            None => self.back.is_positioned() && self.back.retreat(&lock),
        };
        let front =
            (self.front_seek.is_none() && self.front.is_positioned()).then_some(&self.front.key);
        let crossed = front.map_or(false, |front| self.back.key <= *front);
        if !found || crossed || !self.in_bounds(&self.back.key) {
            self.finish();
            return None;
        }
        self.item(&lock, &self.back)
    }
}

/// The smallest key greater than every key starting with `prefix`, or `None` if there is no
/// such key.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let last = prefix.iter().rposition(|b| *b != 0xff)?;
    let mut after = prefix[..=last].to_vec();
    after[last] += 1;
    Some(after)
}

fn empty_inner_node(id: IdAddress) -> ! {
    tracing::error!(%id, "inner node without keys");
    panic!("corrupt node: inner node {id} holds no keys")
}

#[cfg(test)]
mod tests {
    use super::prefix_successor;

    #[test]
    fn successor_of_prefix() {
        assert_eq!(prefix_successor(b""), None);
        assert_eq!(prefix_successor(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(&[1, 0xff, 0xff]), Some(vec![2]));
        assert_eq!(prefix_successor(&[0xff]), None);
    }
}
