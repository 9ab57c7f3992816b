//! Binary nodes: small sorted lists of key suffixes.
//!
//! Layout after the header:
//!
//! ```text
//!  16..18  num_entries: u16
//!  18..20  unused
//!  20..    offsets: [u16; num_entries], sorted by key
//!  ...     entries: key_len: u16, kind: u8, val_len: u16, key, value
//! ```
//!
//! An entry value is either stored inline, or is the packed id of a value node or subtree root.

use core::cmp::Ordering;

use super::{write_header, ValueRef, HEADER_SIZE};
use crate::{
    address::{IdAddress, PACKED_ID_SIZE},
    meta::NodeType,
};

/// Values up to this many bytes are stored inside the binary node.
pub const MAX_INLINE_VALUE: usize = 64;
/// Binary nodes are refactored into inner nodes beyond this many entries.
pub const MAX_BINARY_ENTRIES: usize = 128;
/// Binary nodes are refactored into inner nodes beyond this encoded size.
pub const MAX_BINARY_SIZE: usize = 2048;

const NUM_ENTRIES_OFFSET: usize = HEADER_SIZE;
const OFFSETS_OFFSET: usize = HEADER_SIZE + 4;
const ENTRY_HEADER_SIZE: usize = 5;

const KIND_INLINE: u8 = 0;
const KIND_NODE: u8 = 1;
const KIND_SUBTREE: u8 = 2;

/// One entry of a binary node under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryEntry<'a> {
    pub key: &'a [u8],
    pub value: ValueRef<'a>,
}

impl<'a> BinaryEntry<'a> {
    fn encoded_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.key.len() + value_len(&self.value)
    }
}

fn value_len(value: &ValueRef) -> usize {
    match value {
        ValueRef::Inline(v) => v.len(),
        ValueRef::Node(_) | ValueRef::Subtree(_) => PACKED_ID_SIZE,
    }
}

/// A binary node.
#[derive(Clone, Copy)]
pub struct BinaryNode<'a> {
    bytes: &'a [u8],
}

impl<'a> BinaryNode<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        BinaryNode { bytes }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn num_entries(&self) -> usize {
        u16::from_le_bytes(
            self.bytes[NUM_ENTRIES_OFFSET..NUM_ENTRIES_OFFSET + 2]
                .try_into()
                .unwrap(),
        ) as usize
    }

    fn entry_offset(&self, i: usize) -> usize {
        let at = OFFSETS_OFFSET + i * 2;
        u16::from_le_bytes(self.bytes[at..at + 2].try_into().unwrap()) as usize
    }

    fn entry_parts(&self, i: usize) -> (usize, u8, usize, usize) {
        let off = self.entry_offset(i);
        let key_len = u16::from_le_bytes(self.bytes[off..off + 2].try_into().unwrap()) as usize;
        let kind = self.bytes[off + 2];
        let val_len = u16::from_le_bytes(self.bytes[off + 3..off + 5].try_into().unwrap()) as usize;
        (off, kind, key_len, val_len)
    }

    pub fn key(&self, i: usize) -> &'a [u8] {
        let (off, _, key_len, _) = self.entry_parts(i);
        let start = off + ENTRY_HEADER_SIZE;
        &self.bytes[start..start + key_len]
    }

    pub fn value(&self, i: usize) -> ValueRef<'a> {
        let (off, kind, key_len, val_len) = self.entry_parts(i);
        let start = off + ENTRY_HEADER_SIZE + key_len;
        let raw = &self.bytes[start..start + val_len];
        match kind {
            KIND_INLINE => ValueRef::Inline(raw),
            KIND_NODE => ValueRef::Node(IdAddress::read_from(raw)),
            KIND_SUBTREE => ValueRef::Subtree(IdAddress::read_from(raw)),
            other => panic!("corrupt binary node: unknown entry kind {other}"),
        }
    }

    pub fn entry(&self, i: usize) -> BinaryEntry<'a> {
        BinaryEntry {
            key: self.key(i),
            value: self.value(i),
        }
    }

    /// Binary search for `key`. `Ok` holds the entry index, `Err` the insertion point.
    pub fn find(&self, key: &[u8]) -> Result<usize, usize> {
        let (mut lo, mut hi) = (0, self.num_entries());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid).cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// The index of the first entry whose key is not less than `key`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        match self.find(key) {
            Ok(i) | Err(i) => i,
        }
    }

    /// Collect all entries in key order.
    pub fn entries(&self) -> alloc::vec::Vec<BinaryEntry<'a>> {
        (0..self.num_entries()).map(|i| self.entry(i)).collect()
    }

    /// The byte range of entry `i`'s inline value, if it is stored inline.
    pub fn inline_value_range(&self, i: usize) -> Option<core::ops::Range<usize>> {
        let (off, kind, key_len, val_len) = self.entry_parts(i);
        if kind != KIND_INLINE {
            return None;
        }
        let start = off + ENTRY_HEADER_SIZE + key_len;
        Some(start..start + val_len)
    }
}

/// The encoded size of a binary node holding `entries`.
pub fn binary_size(entries: &[BinaryEntry]) -> usize {
    OFFSETS_OFFSET + entries.len() * 2 + entries.iter().map(|e| e.encoded_len()).sum::<usize>()
}

/// Whether `entries` can be stored in a single binary node.
pub fn binary_fits(entries: &[BinaryEntry]) -> bool {
    entries.len() <= MAX_BINARY_ENTRIES && binary_size(entries) <= MAX_BINARY_SIZE
}

/// Write a binary node into `out`, which must be `binary_size(entries)` long.
///
/// `entries` must be sorted by key without duplicates.
pub fn write_binary(out: &mut [u8], id: IdAddress, entries: &[BinaryEntry]) {
    debug_assert!(entries.windows(2).all(|w| w[0].key < w[1].key));
    let size = binary_size(entries);
    write_header(out, NodeType::Binary, size, entries.len(), 0, 0, id);
    out[NUM_ENTRIES_OFFSET..NUM_ENTRIES_OFFSET + 2]
        .copy_from_slice(&(entries.len() as u16).to_le_bytes());
    out[NUM_ENTRIES_OFFSET + 2..OFFSETS_OFFSET].fill(0);

    let mut pos = OFFSETS_OFFSET + entries.len() * 2;
    for (i, entry) in entries.iter().enumerate() {
        let at = OFFSETS_OFFSET + i * 2;
        out[at..at + 2].copy_from_slice(&(pos as u16).to_le_bytes());

        let (kind, val_len) = match entry.value {
            ValueRef::Inline(v) => (KIND_INLINE, v.len()),
            ValueRef::Node(_) => (KIND_NODE, PACKED_ID_SIZE),
            ValueRef::Subtree(_) => (KIND_SUBTREE, PACKED_ID_SIZE),
        };
        out[pos..pos + 2].copy_from_slice(&(entry.key.len() as u16).to_le_bytes());
        out[pos + 2] = kind;
        out[pos + 3..pos + 5].copy_from_slice(&(val_len as u16).to_le_bytes());
        pos += ENTRY_HEADER_SIZE;
        out[pos..pos + entry.key.len()].copy_from_slice(entry.key);
        pos += entry.key.len();
        match entry.value {
            ValueRef::Inline(v) => out[pos..pos + v.len()].copy_from_slice(v),
            ValueRef::Node(id) | ValueRef::Subtree(id) => id.write_to(&mut out[pos..]),
        }
        pos += val_len;
    }
    debug_assert_eq!(pos, size);
}

/// Overwrite the inline value of entry `i` with a value of the same length.
///
/// Returns false if the entry is not inline or the lengths differ.
pub fn set_inline_value_in_place(out: &mut [u8], i: usize, value: &[u8]) -> bool {
    let range = match BinaryNode::new(out).inline_value_range(i) {
        Some(r) if r.len() == value.len() => r,
        _ => return false,
    };
    out[range].copy_from_slice(value);
    true
}

pub(crate) fn is_well_formed(bytes: &[u8]) -> bool {
    if bytes.len() < OFFSETS_OFFSET {
        return false;
    }
    let node = BinaryNode::new(bytes);
    let n = node.num_entries();
    if OFFSETS_OFFSET + n * 2 > bytes.len() {
        return false;
    }
    let mut prev: Option<&[u8]> = None;
    for i in 0..n {
        let off = node.entry_offset(i);
        if off + ENTRY_HEADER_SIZE > bytes.len() {
            return false;
        }
        let (_, kind, key_len, val_len) = node.entry_parts(i);
        if kind > KIND_SUBTREE || off + ENTRY_HEADER_SIZE + key_len + val_len > bytes.len() {
            return false;
        }
        if kind != KIND_INLINE && val_len != PACKED_ID_SIZE {
            return false;
        }
        let key = node.key(i);
        if prev.map_or(false, |p| p >= key) {
            return false;
        }
        prev = Some(key);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::{IdIndex, IdRegion},
        node::{NodeView, NodeHeader},
    };
    use alloc::vec;

    fn id(i: u32) -> IdAddress {
        IdAddress::new(IdRegion(0), IdIndex::new(i).unwrap())
    }

    fn build(entries: &[BinaryEntry]) -> alloc::vec::Vec<u8> {
        let mut buf = vec![0u8; binary_size(entries)];
        write_binary(&mut buf, id(1), entries);
        buf
    }

    #[test]
    fn find_and_values() {
        let entries = [
            BinaryEntry { key: b"", value: ValueRef::Inline(b"empty-key") },
            BinaryEntry { key: b"a", value: ValueRef::Inline(b"") },
            BinaryEntry { key: b"ab", value: ValueRef::Node(id(7)) },
            BinaryEntry { key: b"b", value: ValueRef::Subtree(id(8)) },
        ];
        let buf = build(&entries);
        let node = match NodeView::new(&buf) {
            NodeView::Binary(b) => b,
            _ => panic!("expected a binary node"),
        };
        assert_eq!(node.num_entries(), 4);
        assert_eq!(node.find(b""), Ok(0));
        assert_eq!(node.find(b"a"), Ok(1));
        assert_eq!(node.value(1), ValueRef::Inline(b""));
        assert_eq!(node.find(b"aa"), Err(2));
        assert_eq!(node.value(2), ValueRef::Node(id(7)));
        assert_eq!(node.value(3), ValueRef::Subtree(id(8)));
        assert_eq!(node.find(b"c"), Err(4));
        assert_eq!(node.lower_bound(b"abc"), 3);
        assert_eq!(node.entries(), entries.to_vec());
        assert!(is_well_formed(&buf));
    }

    #[test]
    fn visit_reports_only_ids() {
        let entries = [
            BinaryEntry { key: b"x", value: ValueRef::Inline(b"1") },
            BinaryEntry { key: b"y", value: ValueRef::Node(id(5)) },
            BinaryEntry { key: b"z", value: ValueRef::Subtree(id(6)) },
        ];
        let buf = build(&entries);
        let mut seen = vec![];
        NodeView::new(&buf).visit_branches(|c| seen.push(c));
        assert_eq!(seen, vec![id(5), id(6)]);
        assert_eq!(NodeView::new(&buf).descendants(), 3);
    }

    #[test]
    fn inline_update_in_place() {
        let entries = [
            BinaryEntry { key: b"k1", value: ValueRef::Inline(b"aaaa") },
            BinaryEntry { key: b"k2", value: ValueRef::Node(id(2)) },
        ];
        let mut buf = build(&entries);
        assert!(set_inline_value_in_place(&mut buf, 0, b"bbbb"));
        assert!(!set_inline_value_in_place(&mut buf, 0, b"ccc"));
        assert!(!set_inline_value_in_place(&mut buf, 1, b"ddddd"));
        let node = BinaryNode::new(&buf);
        assert_eq!(node.value(0), ValueRef::Inline(b"bbbb"));
        assert_eq!(NodeHeader::new(&buf).size(), buf.len());
    }

    #[test]
    fn limits() {
        let key = [0u8; 8];
        let one = BinaryEntry { key: &key, value: ValueRef::Inline(&[0; 64]) };
        let many = vec![one; 40];
        assert!(!binary_fits(&many));
        assert!(binary_fits(&many[..20]));
    }

    #[test]
    fn rejects_unsorted() {
        let entries = [
            BinaryEntry { key: b"b", value: ValueRef::Inline(b"1") },
            BinaryEntry { key: b"c", value: ValueRef::Inline(b"2") },
        ];
        let mut buf = build(&entries);
        // swap the two offsets so keys are out of order.
        let (a, b) = (buf[20], buf[22]);
        buf[20] = b;
        buf[22] = a;
        assert!(!is_well_formed(&buf));
    }
}
