//! The common layout of inner nodes, the fan-out policy and the inner node builder.
//!
//! ```text
//!  16..24  descendants: u64    keys stored at or below this node
//!  24..29  eof value id        NULL if the node has no eof value
//!  29      unused
//!  30..32  num_branches: u16
//!  32..    prefix
//!  ...     variant body
//! ```

use arrayvec::ArrayVec;

use super::{
    bitset::{self, BitsetNode},
    full::{self, FullNode},
    index::{self, IndexNode},
    set_flags,
    setlist::{self, SetlistNode},
    write_header, NodeHeader, ValueRef, FLAG_EOF_SUBTREE, FLAG_HAS_EOF,
};
use crate::{
    address::{IdAddress, PACKED_ID_SIZE},
    meta::NodeType,
    MAX_KEY_SIZE,
};

const DESCENDANTS_OFFSET: usize = 16;
const EOF_OFFSET: usize = 24;
const NUM_BRANCHES_OFFSET: usize = 30;
const PREFIX_OFFSET: usize = 32;

/// Setlist nodes hold at most this many branches.
pub const MAX_SETLIST_BRANCHES: usize = 32;
/// Bitset nodes hold at most this many branches.
pub const MAX_BITSET_BRANCHES: usize = 64;
/// Index nodes hold at most this many branches.
pub const MAX_INDEX_BRANCHES: usize = 128;

pub(crate) fn body_offset(bytes: &[u8]) -> usize {
    PREFIX_OFFSET + NodeHeader::new(bytes).prefix_len()
}

pub(crate) fn num_branches(bytes: &[u8]) -> usize {
    u16::from_le_bytes(
        bytes[NUM_BRANCHES_OFFSET..NUM_BRANCHES_OFFSET + 2]
            .try_into()
            .unwrap(),
    ) as usize
}

fn set_num_branches(bytes: &mut [u8], n: usize) {
    bytes[NUM_BRANCHES_OFFSET..NUM_BRANCHES_OFFSET + 2].copy_from_slice(&(n as u16).to_le_bytes());
}

/// The branch table representations, in order of increasing fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerKind {
    Setlist,
    Bitset,
    Index,
    Full,
}

impl InnerKind {
    /// The representation used for a node built with `n` branches.
    pub fn for_branches(n: usize) -> Self {
        if n <= MAX_SETLIST_BRANCHES {
            InnerKind::Setlist
        } else if n <= MAX_BITSET_BRANCHES {
            InnerKind::Bitset
        } else if n <= MAX_INDEX_BRANCHES {
            InnerKind::Index
        } else {
            InnerKind::Full
        }
    }

    pub fn from_node_type(t: NodeType) -> Option<Self> {
        match t {
            NodeType::Setlist => Some(InnerKind::Setlist),
            NodeType::Bitset => Some(InnerKind::Bitset),
            NodeType::Index => Some(InnerKind::Index),
            NodeType::Full => Some(InnerKind::Full),
            _ => None,
        }
    }

    pub fn node_type(self) -> NodeType {
        match self {
            InnerKind::Setlist => NodeType::Setlist,
            InnerKind::Bitset => NodeType::Bitset,
            InnerKind::Index => NodeType::Index,
            InnerKind::Full => NodeType::Full,
        }
    }

    /// The branch capacity to reserve for `n` branches. Setlist and index nodes get some slack
    /// so that a few branches can be added in place.
    fn capacity_for(self, n: usize) -> usize {
        match self {
            InnerKind::Setlist => n.next_multiple_of(4).clamp(4, MAX_SETLIST_BRANCHES),
            InnerKind::Bitset => n,
            InnerKind::Index => n.next_multiple_of(8).min(MAX_INDEX_BRANCHES),
            InnerKind::Full => 256,
        }
    }

    fn body_size(self, capacity: usize) -> usize {
        match self {
            InnerKind::Setlist => setlist::body_size(capacity),
            InnerKind::Bitset => bitset::body_size(capacity),
            InnerKind::Index => index::body_size(capacity),
            InnerKind::Full => full::body_size(capacity),
        }
    }
}

/// Operations every branch table representation provides.
pub(crate) trait Branches {
    fn get_branch(&self, byte: u8) -> Option<IdAddress>;
    /// The first branch whose byte is `>= from`. `from` may be 256.
    fn next_branch(&self, from: u16) -> Option<(u8, IdAddress)>;
    /// The last branch whose byte is `< before`. `before` may be 256.
    fn prev_branch(&self, before: u16) -> Option<(u8, IdAddress)>;
    fn for_each_branch(&self, f: &mut dyn FnMut(u8, IdAddress));
}

/// An inner node of any representation.
#[derive(Clone, Copy)]
pub enum InnerNode<'a> {
    Setlist(SetlistNode<'a>),
    Bitset(BitsetNode<'a>),
    Index(IndexNode<'a>),
    Full(FullNode<'a>),
}

macro_rules! dispatch {
    ($node:expr, $n:ident => $body:expr) => {
        match $node {
            InnerNode::Setlist($n) => $body,
            InnerNode::Bitset($n) => $body,
            InnerNode::Full($n) => $body,
            InnerNode::Index($n) => $body,
        }
    };
}

impl<'a> InnerNode<'a> {
    pub fn bytes(&self) -> &'a [u8] {
        dispatch!(self, n => n.bytes())
    }

    pub fn kind(&self) -> InnerKind {
        match self {
            InnerNode::Setlist(_) => InnerKind::Setlist,
            InnerNode::Bitset(_) => InnerKind::Bitset,
            InnerNode::Index(_) => InnerKind::Index,
            InnerNode::Full(_) => InnerKind::Full,
        }
    }

    pub fn header(&self) -> NodeHeader<'a> {
        NodeHeader::new(self.bytes())
    }

    pub fn prefix(&self) -> &'a [u8] {
        let bytes = self.bytes();
        &bytes[PREFIX_OFFSET..body_offset(bytes)]
    }

    pub fn descendants(&self) -> u64 {
        let bytes = self.bytes();
        u64::from_le_bytes(
            bytes[DESCENDANTS_OFFSET..DESCENDANTS_OFFSET + 8]
                .try_into()
                .unwrap(),
        )
    }

    /// The value stored under exactly this node's prefix.
    pub fn eof(&self) -> Option<ValueRef<'a>> {
        let flags = self.header().flags();
        if flags & FLAG_HAS_EOF == 0 {
            return None;
        }
        let id = IdAddress::read_from(&self.bytes()[EOF_OFFSET..]);
        Some(if flags & FLAG_EOF_SUBTREE != 0 {
            ValueRef::Subtree(id)
        } else {
            ValueRef::Node(id)
        })
    }

    pub fn num_branches(&self) -> usize {
        num_branches(self.bytes())
    }

    pub fn branch_capacity(&self) -> usize {
        self.header().branch_capacity()
    }

    /// Whether [`InnerNodeMut::try_add_branch`] would succeed for a byte not yet present.
    pub fn has_room(&self) -> bool {
        match self.kind() {
            InnerKind::Bitset => false,
            InnerKind::Full => true,
            InnerKind::Setlist | InnerKind::Index => self.num_branches() < self.branch_capacity(),
        }
    }

    pub fn get_branch(&self, byte: u8) -> Option<IdAddress> {
        dispatch!(self, n => n.get_branch(byte))
    }

    /// The first branch whose byte is `>= from`. Passing 256 always yields `None`.
    pub fn next_branch(&self, from: u16) -> Option<(u8, IdAddress)> {
        if from > 255 {
            return None;
        }
        dispatch!(self, n => n.next_branch(from))
    }

    /// The last branch whose byte is `< before`. Passing 256 yields the last branch.
    pub fn prev_branch(&self, before: u16) -> Option<(u8, IdAddress)> {
        dispatch!(self, n => n.prev_branch(before.min(256)))
    }

    /// Call `f` for every branch in byte order.
    pub fn for_each_branch(&self, mut f: impl FnMut(u8, IdAddress)) {
        dispatch!(self, n => n.for_each_branch(&mut f))
    }

    /// All branches in byte order.
    pub fn branches(&self) -> ArrayVec<(u8, IdAddress), 256> {
        let mut out = ArrayVec::new();
        self.for_each_branch(|b, id| out.push((b, id)));
        out
    }
}

/// In-place edits of an inner node. None of them change the node's size.
///
/// Checksums are not touched; callers update them once their edits are done.
pub struct InnerNodeMut<'a> {
    bytes: &'a mut [u8],
    kind: InnerKind,
}

impl<'a> InnerNodeMut<'a> {
    /// Panics if `bytes` is not an inner node.
    pub fn new(bytes: &'a mut [u8]) -> Self {
        let header = NodeHeader::new(bytes);
        let kind = match InnerKind::from_node_type(header.node_type()) {
            Some(kind) => kind,
            None => panic!("corrupt node: {:?} is not an inner node", header.node_type()),
        };
        let size = header.size();
        InnerNodeMut {
            bytes: &mut bytes[..size],
            kind,
        }
    }

    fn parts(&mut self) -> (&mut [u8], usize, usize) {
        let body = body_offset(self.bytes);
        let cap = NodeHeader::new(self.bytes).branch_capacity();
        let n = num_branches(self.bytes);
        (&mut self.bytes[body..], cap, n)
    }

    /// Point an existing branch at `id`. Returns false if the branch is absent.
    pub fn set_branch(&mut self, byte: u8, id: IdAddress) -> bool {
        let kind = self.kind;
        let (body, cap, n) = self.parts();
        match kind {
            InnerKind::Setlist => setlist::set_branch(body, cap, n, byte, id),
            InnerKind::Bitset => bitset::set_branch(body, byte, id),
            InnerKind::Index => index::set_branch(body, byte, id),
            InnerKind::Full => full::set_branch(body, byte, id),
        }
    }

    /// Add a branch that is not yet present. Returns false if the representation has no room
    /// for it; the node is then unchanged.
    pub fn try_add_branch(&mut self, byte: u8, id: IdAddress) -> bool {
        let kind = self.kind;
        let (body, cap, n) = self.parts();
        let added = match kind {
            InnerKind::Setlist => setlist::add_branch(body, cap, n, byte, id),
            InnerKind::Bitset => false,
            InnerKind::Index => index::add_branch(body, cap, byte, id),
            InnerKind::Full => full::add_branch(body, byte, id),
        };
        if added {
            set_num_branches(self.bytes, n + 1);
        }
        added
    }

    /// Remove a branch. Returns false if it is absent.
    pub fn remove_branch(&mut self, byte: u8) -> bool {
        let kind = self.kind;
        let (body, cap, n) = self.parts();
        let removed = match kind {
            InnerKind::Setlist => setlist::remove_branch(body, cap, n, byte),
            InnerKind::Bitset => bitset::remove_branch(body, byte),
            InnerKind::Index => index::remove_branch(body, byte),
            InnerKind::Full => full::remove_branch(body, byte),
        };
        if removed {
            set_num_branches(self.bytes, n - 1);
        }
        removed
    }

    /// Replace the eof value. `value` must not be inline.
    pub fn set_eof(&mut self, value: Option<ValueRef>) {
        let flags = NodeHeader::new(self.bytes).flags() & !(FLAG_HAS_EOF | FLAG_EOF_SUBTREE);
        let (flags, id) = match value {
            None => (flags, IdAddress::NULL),
            Some(ValueRef::Node(id)) => (flags | FLAG_HAS_EOF, id),
            Some(ValueRef::Subtree(id)) => (flags | FLAG_HAS_EOF | FLAG_EOF_SUBTREE, id),
            Some(ValueRef::Inline(_)) => panic!("inner nodes cannot hold inline values"),
        };
        id.write_to(&mut self.bytes[EOF_OFFSET..]);
        set_flags(self.bytes, flags);
    }

    pub fn add_descendants(&mut self, delta: i64) {
        let at = DESCENDANTS_OFFSET..DESCENDANTS_OFFSET + 8;
        let current = u64::from_le_bytes(self.bytes[at.clone()].try_into().unwrap());
        let updated = current.wrapping_add_signed(delta);
        self.bytes[at].copy_from_slice(&updated.to_le_bytes());
    }
}

/// Builds inner nodes, choosing the representation from the number of branches.
#[derive(Clone)]
pub struct InnerBuilder<'a> {
    pub prefix: &'a [u8],
    pub eof: Option<ValueRef<'a>>,
    branches: ArrayVec<(u8, IdAddress), 256>,
    pub descendants: u64,
}

impl<'a> InnerBuilder<'a> {
    pub fn new(prefix: &'a [u8]) -> Self {
        assert!(prefix.len() <= MAX_KEY_SIZE);
        InnerBuilder {
            prefix,
            eof: None,
            branches: ArrayVec::new(),
            descendants: 0,
        }
    }

    /// Start from the contents of an existing node.
    pub fn from_node(node: &InnerNode<'a>) -> Self {
        InnerBuilder {
            prefix: node.prefix(),
            eof: node.eof(),
            branches: node.branches(),
            descendants: node.descendants(),
        }
    }

    pub fn branches(&self) -> &[(u8, IdAddress)] {
        &self.branches
    }

    pub fn num_branches(&self) -> usize {
        self.branches.len()
    }

    /// Insert or replace a branch, keeping the table sorted.
    pub fn set_branch(&mut self, byte: u8, id: IdAddress) {
        match self.branches.binary_search_by_key(&byte, |(b, _)| *b) {
            Ok(i) => self.branches[i].1 = id,
            Err(i) => self.branches.insert(i, (byte, id)),
        }
    }

    /// Remove a branch, returning the id it pointed at.
    pub fn remove_branch(&mut self, byte: u8) -> Option<IdAddress> {
        match self.branches.binary_search_by_key(&byte, |(b, _)| *b) {
            Ok(i) => Some(self.branches.remove(i).1),
            Err(_) => None,
        }
    }

    pub fn kind(&self) -> InnerKind {
        InnerKind::for_branches(self.branches.len())
    }

    pub fn node_type(&self) -> NodeType {
        self.kind().node_type()
    }

    /// The encoded size of the node.
    pub fn size(&self) -> usize {
        let kind = self.kind();
        PREFIX_OFFSET + self.prefix.len() + kind.body_size(kind.capacity_for(self.branches.len()))
    }

    /// Write the node into `out`, which must be `self.size()` long.
    pub fn write(&self, out: &mut [u8], id: IdAddress) {
        let kind = self.kind();
        let cap = kind.capacity_for(self.branches.len());
        let size = self.size();
        let (flags, eof_id) = match self.eof {
            None => (0, IdAddress::NULL),
            Some(ValueRef::Node(id)) => (FLAG_HAS_EOF, id),
            Some(ValueRef::Subtree(id)) => (FLAG_HAS_EOF | FLAG_EOF_SUBTREE, id),
            Some(ValueRef::Inline(_)) => panic!("inner nodes cannot hold inline values"),
        };
        write_header(
            out,
            kind.node_type(),
            size,
            cap,
            self.prefix.len(),
            flags,
            id,
        );
        out[DESCENDANTS_OFFSET..DESCENDANTS_OFFSET + 8]
            .copy_from_slice(&self.descendants.to_le_bytes());
        eof_id.write_to(&mut out[EOF_OFFSET..]);
        out[EOF_OFFSET + PACKED_ID_SIZE] = 0;
        set_num_branches(out, self.branches.len());
        let body = PREFIX_OFFSET + self.prefix.len();
        out[PREFIX_OFFSET..body].copy_from_slice(self.prefix);

        let body = &mut out[body..size];
        match kind {
            InnerKind::Setlist => setlist::write_body(body, cap, &self.branches),
            InnerKind::Bitset => bitset::write_body(body, &self.branches),
            InnerKind::Index => index::write_body(body, cap, &self.branches),
            InnerKind::Full => full::write_body(body, &self.branches),
        }
    }
}

pub(crate) fn is_well_formed(bytes: &[u8], node_type: NodeType) -> bool {
    if bytes.len() < PREFIX_OFFSET {
        return false;
    }
    let header = NodeHeader::new(bytes);
    let body = PREFIX_OFFSET + header.prefix_len();
    let cap = header.branch_capacity();
    let n = num_branches(bytes);
    if body > bytes.len() || n > 256 {
        return false;
    }
    let body = &bytes[body..];
    match node_type {
        NodeType::Setlist => setlist::is_well_formed(body, cap, n),
        NodeType::Bitset => bitset::is_well_formed(body, n),
        NodeType::Index => index::is_well_formed(body, cap, n),
        NodeType::Full => full::is_well_formed(body, n),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::{IdIndex, IdRegion},
        node::{checksum, NodeView},
    };
    use alloc::vec::Vec;

    fn id(i: u32) -> IdAddress {
        IdAddress::new(IdRegion(2), IdIndex::new(i).unwrap())
    }

    fn build(builder: &InnerBuilder) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; builder.size()];
        builder.write(&mut buf, id(1000));
        checksum::update(&mut buf);
        buf
    }

    fn inner(buf: &[u8]) -> InnerNode<'_> {
        match NodeView::new(buf) {
            NodeView::Inner(n) => n,
            _ => panic!("expected an inner node"),
        }
    }

    fn builder_with(bytes: impl Iterator<Item = u8>) -> InnerBuilder<'static> {
        let mut b = InnerBuilder::new(b"pre");
        for byte in bytes {
            b.set_branch(byte, id(byte as u32 + 1));
        }
        b.descendants = b.num_branches() as u64;
        b
    }

    #[test]
    fn policy_thresholds() {
        assert_eq!(InnerKind::for_branches(0), InnerKind::Setlist);
        assert_eq!(InnerKind::for_branches(32), InnerKind::Setlist);
        assert_eq!(InnerKind::for_branches(33), InnerKind::Bitset);
        assert_eq!(InnerKind::for_branches(64), InnerKind::Bitset);
        assert_eq!(InnerKind::for_branches(65), InnerKind::Index);
        assert_eq!(InnerKind::for_branches(128), InnerKind::Index);
        assert_eq!(InnerKind::for_branches(129), InnerKind::Full);
        assert_eq!(InnerKind::for_branches(256), InnerKind::Full);
    }

    /// Every representation answers lookups and enumerations identically.
    #[test]
    fn representations_agree() {
        for count in [1usize, 5, 32, 33, 64, 65, 128, 129, 256] {
            let bytes: Vec<u8> = (0..count).map(|i| ((i * 7) % 256) as u8).collect();
            let mut sorted = bytes.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), count);

            let b = builder_with(bytes.iter().copied());
            let buf = build(&b);
            let node = inner(&buf);
            assert_eq!(node.kind(), InnerKind::for_branches(count));
            assert_eq!(node.prefix(), b"pre");
            assert_eq!(node.num_branches(), count);
            assert!(NodeView::is_well_formed(&buf));

            let listed: Vec<u8> = node.branches().iter().map(|(b, _)| *b).collect();
            assert_eq!(listed, sorted);

            for byte in 0..=255u8 {
                let expected = sorted.binary_search(&byte).ok().map(|_| id(byte as u32 + 1));
                assert_eq!(node.get_branch(byte), expected, "byte {byte} count {count}");
                let next = sorted.iter().find(|b| **b >= byte).map(|b| (*b, id(*b as u32 + 1)));
                assert_eq!(node.next_branch(byte as u16), next);
                let prev = sorted.iter().rev().find(|b| **b < byte).map(|b| (*b, id(*b as u32 + 1)));
                assert_eq!(node.prev_branch(byte as u16), prev);
            }
            assert_eq!(node.next_branch(256), None);
            assert_eq!(node.prev_branch(0), None);
            let last = sorted.last().map(|b| (*b, id(*b as u32 + 1)));
            assert_eq!(node.prev_branch(256), last);

            let mut visited = Vec::new();
            NodeView::new(&buf).visit_branches(|c| visited.push(c));
            assert_eq!(visited.len(), count);
        }
    }

    #[test]
    fn eof_values() {
        let mut b = builder_with([1u8, 2].into_iter());
        b.eof = Some(ValueRef::Subtree(id(77)));
        let buf = build(&b);
        let node = inner(&buf);
        assert_eq!(node.eof(), Some(ValueRef::Subtree(id(77))));

        let mut visited = Vec::new();
        NodeView::new(&buf).visit_branches(|c| visited.push(c));
        assert_eq!(visited, alloc::vec![id(77), id(2), id(3)]);

        let mut buf = buf.clone();
        let mut m = InnerNodeMut::new(&mut buf);
        m.set_eof(Some(ValueRef::Node(id(78))));
        assert_eq!(inner(&buf).eof(), Some(ValueRef::Node(id(78))));
        let mut m = InnerNodeMut::new(&mut buf);
        m.set_eof(None);
        assert_eq!(inner(&buf).eof(), None);
    }

    #[test]
    fn in_place_edits_match_rebuilds() {
        for count in [3usize, 40, 100, 200] {
            let bytes: Vec<u8> = (0..count).map(|i| (i + 2) as u8).collect();
            let b = builder_with(bytes.iter().copied());
            let mut buf = build(&b);
            let size = buf.len();

            let mut m = InnerNodeMut::new(&mut buf);
            assert!(m.set_branch(bytes[1], id(5000)));
            assert!(!m.set_branch(1, id(5000)));
            assert!(m.remove_branch(bytes[0]));
            assert!(!m.remove_branch(bytes[0]));
            let added = m.try_add_branch(1, id(6000));
            m.add_descendants(-1);

            let node = inner(&buf);
            assert_eq!(buf.len(), size);
            assert_eq!(node.get_branch(bytes[0]), None);
            assert_eq!(node.get_branch(bytes[1]), Some(id(5000)));
            assert_eq!(node.get_branch(1), added.then(|| id(6000)));
            assert_eq!(
                node.num_branches(),
                count - 1 + added as usize,
                "count {count}"
            );
            assert_eq!(node.descendants(), count as u64 - 1);
            assert!(NodeView::is_well_formed(&buf));

            let listed = node.branches();
            assert!(listed.windows(2).all(|w| w[0].0 < w[1].0));
        }
    }

    #[test]
    fn setlist_fills_to_capacity() {
        let b = builder_with([10u8, 20, 30].into_iter());
        let mut buf = build(&b);
        assert_eq!(inner(&buf).branch_capacity(), 4);
        let mut m = InnerNodeMut::new(&mut buf);
        assert!(m.try_add_branch(15, id(15)));
        assert!(!m.try_add_branch(25, id(25)));
        let listed: Vec<u8> = inner(&buf).branches().iter().map(|(b, _)| *b).collect();
        assert_eq!(listed, alloc::vec![10, 15, 20, 30]);
    }

    /// Random edits, in place where the node has room and by rebuilding where it does not,
    /// keep the node in line with a sorted map.
    #[test]
    fn edits_match_model() {
        use alloc::collections::BTreeMap;
        use quickcheck::{QuickCheck, TestResult};

        fn prop(initial: Vec<u8>, edits: Vec<(u8, bool)>) -> TestResult {
            let mut model: BTreeMap<u8, IdAddress> = BTreeMap::new();
            let mut b = InnerBuilder::new(b"k");
            for byte in initial {
                b.set_branch(byte, id(byte as u32 + 1));
                model.insert(byte, id(byte as u32 + 1));
            }
            if model.is_empty() {
                return TestResult::discard();
            }
            let mut buf = build(&b);

            for (n, (byte, add)) in edits.into_iter().enumerate() {
                let child = id(n as u32 + 300);
                let present = model.contains_key(&byte);
                if add {
                    model.insert(byte, child);
                    let mut m = InnerNodeMut::new(&mut buf);
                    let done = if present {
                        m.set_branch(byte, child)
                    } else {
                        m.try_add_branch(byte, child)
                    };
                    if !done {
                        let mut rebuilt = InnerBuilder::from_node(&inner(&buf));
                        rebuilt.set_branch(byte, child);
                        let grown = build(&rebuilt);
                        buf = grown;
                    }
                } else if model.remove(&byte).is_some() {
                    if !InnerNodeMut::new(&mut buf).remove_branch(byte) {
                        return TestResult::failed();
                    }
                }
            }

            let node = inner(&buf);
            let listed: Vec<(u8, IdAddress)> = node.branches().into_iter().collect();
            let expected: Vec<(u8, IdAddress)> = model.iter().map(|(b, id)| (*b, *id)).collect();
            let lookups_agree = (0..=255u8).all(|b| node.get_branch(b) == model.get(&b).copied());
            TestResult::from_bool(
                listed == expected
                    && lookups_agree
                    && node.num_branches() == model.len()
                    && NodeView::is_well_formed(&buf),
            )
        }

        QuickCheck::new()
            .tests(500)
            .quickcheck(prop as fn(Vec<u8>, Vec<(u8, bool)>) -> TestResult);
    }

    #[test]
    fn empty_prefix_and_no_branches() {
        let mut b = InnerBuilder::new(b"");
        b.eof = Some(ValueRef::Node(id(9)));
        b.descendants = 1;
        let buf = build(&b);
        let node = inner(&buf);
        assert_eq!(node.prefix(), b"");
        assert_eq!(node.num_branches(), 0);
        assert_eq!(node.next_branch(0), None);
        assert_eq!(node.descendants(), 1);
    }
}
