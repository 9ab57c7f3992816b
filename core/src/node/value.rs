//! Value nodes: a header followed by the value bytes.

use super::{set_size, write_header, HEADER_SIZE};
use crate::{address::IdAddress, location::object_capacity, meta::NodeType};

/// A value node.
#[derive(Clone, Copy)]
pub struct ValueNode<'a> {
    bytes: &'a [u8],
}

impl<'a> ValueNode<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        ValueNode { bytes }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn value(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE..]
    }
}

/// The encoded size of a value node holding `len` bytes.
pub fn value_node_size(len: usize) -> usize {
    HEADER_SIZE + len
}

/// Write a value node into `out`, which must be exactly `value_node_size(value.len())` long.
pub fn write_value_node(out: &mut [u8], id: IdAddress, value: &[u8]) {
    let size = value_node_size(value.len());
    write_header(out, NodeType::Value, size, 0, 0, 0, id);
    out[HEADER_SIZE..size].copy_from_slice(value);
}

/// Whether a value node of size `old_size` can hold `new_len` bytes without changing the space it
/// occupies.
pub fn fits_in_place(old_size: usize, new_len: usize) -> bool {
    object_capacity(old_size) == object_capacity(value_node_size(new_len))
}

/// Replace the value of the node in `out` in place. The caller checks [`fits_in_place`].
///
/// `out` spans the whole allocated object, not just the node's current size.
pub fn set_value_in_place(out: &mut [u8], value: &[u8]) {
    let size = value_node_size(value.len());
    set_size(out, size);
    out[HEADER_SIZE..size].copy_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::{IdIndex, IdRegion},
        node::{NodeHeader, NodeView},
    };

    #[test]
    fn write_and_read() {
        let id = IdAddress::new(IdRegion(3), IdIndex::new(9).unwrap());
        let mut buf = vec![0u8; value_node_size(5)];
        write_value_node(&mut buf, id, b"hello");
        match NodeView::new(&buf) {
            NodeView::Value(v) => assert_eq!(v.value(), b"hello"),
            _ => panic!("expected a value node"),
        }
        assert_eq!(NodeHeader::new(&buf).id(), id);
    }

    #[test]
    fn empty_value() {
        let mut buf = vec![0u8; value_node_size(0)];
        write_value_node(&mut buf, IdAddress::NULL, b"");
        match NodeView::new(&buf) {
            NodeView::Value(v) => assert!(v.value().is_empty()),
            _ => panic!("expected a value node"),
        }
    }

    #[test]
    fn in_place_only_within_capacity() {
        let old = value_node_size(10);
        assert!(fits_in_place(old, 16));
        assert!(fits_in_place(old, 1));
        assert!(!fits_in_place(old, 17));
        assert!(!fits_in_place(old, 0));

        let mut buf = vec![0u8; 32];
        write_value_node(&mut buf[..old], IdAddress::NULL, b"0123456789");
        set_value_in_place(&mut buf, b"abcdefghijklmnop");
        match NodeView::new(&buf) {
            NodeView::Value(v) => assert_eq!(v.value(), b"abcdefghijklmnop"),
            _ => panic!("expected a value node"),
        }
    }
}
