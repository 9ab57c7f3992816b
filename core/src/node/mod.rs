//! Node formats.
//!
//! Every node starts with a 16-byte header:
//!
//! ```text
//!  0..4   checksum         xxh3-64 of bytes 4..size, truncated. 0 = not computed
//!  4..8   type:4 size:28   size is the exact encoded length in bytes
//!  8..16  branch_capacity:9 prefix_len:10 flags:5 id:40
//! ```
//!
//! The body depends on the type. [`NodeView`] is the single place where the type tag is
//! matched; everything above it works on the sum type.

use crate::{
    address::IdAddress,
    location::object_capacity,
    meta::NodeType,
};

pub mod binary;
pub mod bitset;
pub mod checksum;
pub mod full;
pub mod index;
pub mod inner;
pub mod setlist;
pub mod value;

pub use binary::{BinaryEntry, BinaryNode};
pub use inner::{InnerBuilder, InnerKind, InnerNode, InnerNodeMut};
pub use value::ValueNode;

/// The size of the common node header.
pub const HEADER_SIZE: usize = 16;

/// The largest size the header can describe.
pub const MAX_NODE_SIZE: usize = (1 << 28) - 1;

/// Set when an inner node carries a value for the key ending exactly at its prefix.
pub const FLAG_HAS_EOF: u8 = 1;
/// Set when the eof value is a subtree root rather than a value node.
pub const FLAG_EOF_SUBTREE: u8 = 2;

/// A value as stored in a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRef<'a> {
    /// Value bytes stored directly in a binary node.
    Inline(&'a [u8]),
    /// Value bytes stored in a separate value node.
    Node(IdAddress),
    /// The root of another tree.
    Subtree(IdAddress),
}

impl<'a> ValueRef<'a> {
    /// The id this value keeps alive, if any.
    pub fn child_id(&self) -> Option<IdAddress> {
        match *self {
            ValueRef::Inline(_) => None,
            ValueRef::Node(id) | ValueRef::Subtree(id) => Some(id),
        }
    }

    pub fn is_subtree(&self) -> bool {
        matches!(self, ValueRef::Subtree(_))
    }
}

/// Read-only access to the common header.
#[derive(Clone, Copy)]
pub struct NodeHeader<'a> {
    bytes: &'a [u8],
}

impl<'a> NodeHeader<'a> {
    /// Panics if `bytes` is shorter than the header.
    pub fn new(bytes: &'a [u8]) -> Self {
        assert!(bytes.len() >= HEADER_SIZE, "node shorter than its header");
        NodeHeader { bytes }
    }

    pub fn checksum(&self) -> u32 {
        u32::from_le_bytes(self.bytes[0..4].try_into().unwrap())
    }

    fn type_and_size(&self) -> u32 {
        u32::from_le_bytes(self.bytes[4..8].try_into().unwrap())
    }

    fn word(&self) -> u64 {
        u64::from_le_bytes(self.bytes[8..16].try_into().unwrap())
    }

    pub fn node_type(&self) -> NodeType {
        NodeType::from_u8((self.type_and_size() & 0xf) as u8)
    }

    /// The exact encoded length of the node.
    pub fn size(&self) -> usize {
        (self.type_and_size() >> 4) as usize
    }

    /// The number of bytes the node occupies in its segment.
    pub fn object_capacity(&self) -> usize {
        object_capacity(self.size())
    }

    pub fn branch_capacity(&self) -> usize {
        (self.word() & 0x1ff) as usize
    }

    pub fn prefix_len(&self) -> usize {
        ((self.word() >> 9) & 0x3ff) as usize
    }

    pub fn flags(&self) -> u8 {
        ((self.word() >> 19) & 0x1f) as u8
    }

    /// The id the node was created under.
    pub fn id(&self) -> IdAddress {
        IdAddress::from_u64(self.word() >> 24)
    }
}

/// Write a node header into the first 16 bytes of `out`.
pub fn write_header(
    out: &mut [u8],
    node_type: NodeType,
    size: usize,
    branch_capacity: usize,
    prefix_len: usize,
    flags: u8,
    id: IdAddress,
) {
    assert!(size <= MAX_NODE_SIZE);
    assert!(branch_capacity < 512);
    assert!(prefix_len < 1024);
    let type_and_size = (node_type as u32) | ((size as u32) << 4);
    let word = branch_capacity as u64
        | (prefix_len as u64) << 9
        | ((flags & 0x1f) as u64) << 19
        | id.to_u64() << 24;
    out[0..4].copy_from_slice(&0u32.to_le_bytes());
    out[4..8].copy_from_slice(&type_and_size.to_le_bytes());
    out[8..16].copy_from_slice(&word.to_le_bytes());
}

/// Overwrite the size field of an existing header.
pub(crate) fn set_size(out: &mut [u8], size: usize) {
    let node_type = u32::from_le_bytes(out[4..8].try_into().unwrap()) & 0xf;
    let type_and_size = node_type | ((size as u32) << 4);
    out[4..8].copy_from_slice(&type_and_size.to_le_bytes());
}

/// Overwrite the flags of an existing header.
pub(crate) fn set_flags(out: &mut [u8], flags: u8) {
    let mut word = u64::from_le_bytes(out[8..16].try_into().unwrap());
    word &= !(0x1f << 19);
    word |= ((flags & 0x1f) as u64) << 19;
    out[8..16].copy_from_slice(&word.to_le_bytes());
}

/// A typed view over the bytes of a node.
///
/// This is the only dispatch on the type tag. Reaching a freelist slot or an unknown tag
/// through it means the store is corrupt, and panics.
#[derive(Clone, Copy)]
pub enum NodeView<'a> {
    Inner(InnerNode<'a>),
    Binary(BinaryNode<'a>),
    Value(ValueNode<'a>),
}

impl<'a> NodeView<'a> {
    /// Interpret `bytes`, which must start at a node header and extend at least over the node.
    pub fn new(bytes: &'a [u8]) -> Self {
        let header = NodeHeader::new(bytes);
        let size = header.size();
        if size < HEADER_SIZE || size > bytes.len() {
            panic!(
                "corrupt node: size {size} outside of [{HEADER_SIZE}, {}]",
                bytes.len()
            );
        }
        let bytes = &bytes[..size];
        match header.node_type() {
            NodeType::Setlist => NodeView::Inner(InnerNode::Setlist(setlist::SetlistNode::new(bytes))),
            NodeType::Bitset => NodeView::Inner(InnerNode::Bitset(bitset::BitsetNode::new(bytes))),
            NodeType::Full => NodeView::Inner(InnerNode::Full(full::FullNode::new(bytes))),
            NodeType::Index => NodeView::Inner(InnerNode::Index(index::IndexNode::new(bytes))),
            NodeType::Binary => NodeView::Binary(BinaryNode::new(bytes)),
            NodeType::Value => NodeView::Value(ValueNode::new(bytes)),
            t @ (NodeType::Freelist | NodeType::Undefined) => {
                panic!("corrupt node: dispatch reached a {t:?} node")
            }
        }
    }

    pub fn header(&self) -> NodeHeader<'a> {
        NodeHeader::new(self.bytes())
    }

    pub fn bytes(&self) -> &'a [u8] {
        match self {
            NodeView::Inner(n) => n.bytes(),
            NodeView::Binary(n) => n.bytes(),
            NodeView::Value(n) => n.bytes(),
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.header().node_type()
    }

    /// Call `f` with every id this node keeps alive: branches, eof values, value nodes and
    /// subtrees. Null ids, such as the root of an empty subtree, are never reported.
    pub fn visit_branches(&self, mut f: impl FnMut(IdAddress)) {
        let mut visit = |id: IdAddress| {
            if id.is_valid() {
                f(id)
            }
        };
        match self {
            NodeView::Inner(n) => {
                if let Some(id) = n.eof().and_then(|eof| eof.child_id()) {
                    visit(id);
                }
                n.for_each_branch(|_, id| visit(id));
            }
            NodeView::Binary(n) => {
                for i in 0..n.num_entries() {
                    if let Some(id) = n.value(i).child_id() {
                        visit(id);
                    }
                }
            }
            NodeView::Value(_) => {}
        }
    }

    /// The number of keys stored at or below this node.
    pub fn descendants(&self) -> u64 {
        match self {
            NodeView::Inner(n) => n.descendants(),
            NodeView::Binary(n) => n.num_entries() as u64,
            NodeView::Value(_) => 0,
        }
    }

    /// Check the internal consistency of the node's layout without trusting its checksum.
    pub fn is_well_formed(bytes: &[u8]) -> bool {
        if bytes.len() < HEADER_SIZE {
            return false;
        }
        let header = NodeHeader::new(bytes);
        let size = header.size();
        if size < HEADER_SIZE || size > bytes.len() {
            return false;
        }
        let bytes = &bytes[..size];
        match header.node_type() {
            NodeType::Value => true,
            NodeType::Binary => binary::is_well_formed(bytes),
            t if t.is_inner() => inner::is_well_formed(bytes, t),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{IdIndex, IdRegion};

    fn id(i: u32) -> IdAddress {
        IdAddress::new(IdRegion(1), IdIndex::new(i).unwrap())
    }

    #[test]
    fn header_fields() {
        let mut buf = [0u8; 32];
        write_header(&mut buf, NodeType::Setlist, 30, 257, 1000, 0b10101, id(42));
        let h = NodeHeader::new(&buf);
        assert_eq!(h.node_type(), NodeType::Setlist);
        assert_eq!(h.size(), 30);
        assert_eq!(h.object_capacity(), 32);
        assert_eq!(h.branch_capacity(), 257);
        assert_eq!(h.prefix_len(), 1000);
        assert_eq!(h.flags(), 0b10101);
        assert_eq!(h.id(), id(42));
        assert_eq!(h.checksum(), 0);

        set_flags(&mut buf, 0);
        set_size(&mut buf, 20);
        let h = NodeHeader::new(&buf);
        assert_eq!(h.flags(), 0);
        assert_eq!(h.size(), 20);
        assert_eq!(h.prefix_len(), 1000);
        assert_eq!(h.node_type(), NodeType::Setlist);
    }

    #[test]
    #[should_panic(expected = "corrupt node")]
    fn freelist_dispatch_traps() {
        let mut buf = [0u8; 16];
        write_header(&mut buf, NodeType::Freelist, 16, 0, 0, 0, id(1));
        let _ = NodeView::new(&buf);
    }

    #[test]
    #[should_panic(expected = "corrupt node")]
    fn undefined_dispatch_traps() {
        let mut buf = [0u8; 16];
        write_header(&mut buf, NodeType::Undefined, 16, 0, 0, 0, id(1));
        let _ = NodeView::new(&buf);
    }

    #[test]
    #[should_panic(expected = "corrupt node")]
    fn oversized_traps() {
        let mut buf = [0u8; 16];
        write_header(&mut buf, NodeType::Value, 64, 0, 0, 0, id(1));
        let _ = NodeView::new(&buf);
    }
}
