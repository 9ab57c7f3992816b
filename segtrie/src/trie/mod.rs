//! The radix trie over nodes of the segment allocator.
//!
//! Keys are consumed one node at a time. An inner node matches its prefix and then one branch
//! byte; a binary node matches the whole remaining suffix against its sorted entries. A value
//! stored exactly at an inner node's prefix is that node's eof value.

use segtrie_core::{
    node::{NodeView, ValueRef},
    IdAddress,
};

use crate::{root::Root, seg_alloc::ReadLock};

pub(crate) mod iter;
pub(crate) mod update;

/// A value read out of a tree.
#[derive(Debug, Clone)]
pub enum Value {
    Data(Vec<u8>),
    /// The root of a nested tree.
    Subtree(Root),
}

impl Value {
    /// The data, if this is not a subtree.
    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Value::Data(data) => Some(data),
            Value::Subtree(_) => None,
        }
    }

    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            Value::Data(data) => Some(data),
            Value::Subtree(_) => None,
        }
    }
}

/// A value found in place, borrowing from the read lock it was found under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Found<'l> {
    Data(&'l [u8]),
    Subtree(IdAddress),
}

impl<'l> Found<'l> {
    /// Turn into an owned value. Subtree roots stay reachable through `ancestor`.
    pub fn to_value(self, ancestor: &Root) -> Value {
        match self {
            Found::Data(data) => Value::Data(data.to_vec()),
            Found::Subtree(id) => Value::Subtree(Root::borrowed(id, ancestor.clone())),
        }
    }
}

/// Resolve a stored value, following value nodes.
pub(crate) fn resolve<'l>(lock: &'l ReadLock, value: ValueRef<'l>) -> Found<'l> {
    match value {
        ValueRef::Inline(data) => Found::Data(data),
        ValueRef::Subtree(id) => Found::Subtree(id),
        ValueRef::Node(id) => match lock.get(id).view() {
            NodeView::Value(v) => Found::Data(v.value()),
            other => {
                tracing::error!(%id, node_type = ?other.node_type(), "value id is not a value node");
                panic!("corrupt node: value {id} is a {:?} node", other.node_type())
            }
        },
    }
}

/// Look `key` up in the tree rooted at `root`.
pub(crate) fn lookup<'l>(lock: &'l ReadLock, root: IdAddress, key: &[u8]) -> Option<Found<'l>> {
    let mut id = root;
    let mut key = key;
    loop {
        if !id.is_valid() {
            return None;
        }
        match lock.get(id).view() {
            NodeView::Inner(node) => {
                key = key.strip_prefix(node.prefix())?;
                let Some((&byte, rest)) = key.split_first() else {
                    return node.eof().map(|eof| resolve(lock, eof));
                };
                id = node.get_branch(byte)?;
                key = rest;
            }
            NodeView::Binary(node) => {
                let i = node.find(key).ok()?;
                return Some(resolve(lock, node.value(i)));
            }
            NodeView::Value(_) => unexpected_value_node(id),
        }
    }
}

/// The number of keys in the tree rooted at `root`.
pub(crate) fn count_keys(lock: &ReadLock, root: IdAddress) -> u64 {
    if !root.is_valid() {
        return 0;
    }
    match lock.get(root).view() {
        NodeView::Value(_) => unexpected_value_node(root),
        view => view.descendants(),
    }
}

pub(crate) fn unexpected_value_node(id: IdAddress) -> ! {
    tracing::error!(%id, "value node reached as a trie node");
    panic!("corrupt node: value node {id} reached as a trie node")
}
