//! The per-object metadata word.
//!
//! Each id owns one 64-bit word in the metadata table. All of the object's mutable state is
//! packed into it so that every state transition is a single atomic operation:
//!
//! ```text
//!  bits  0..14  reference count
//!  bits 14..17  node type
//!  bit  17      read        (sampled as recently read)
//!  bit  18      copy        (a compactor is copying the object)
//!  bit  19      modify      (the object's bytes are being changed in place)
//!  bit  20      pending     (reserved)
//!  bits 21..64  location    (in 16-byte units)
//! ```
//!
//! When a slot is on its region's freelist its type is [`NodeType::Freelist`] and the location
//! field holds the index of the next free slot.

use crate::location::{NodeLocation, LOCATION_BITS};

const REF_BITS: u32 = 14;
const TYPE_SHIFT: u32 = 14;
const READ_SHIFT: u32 = 17;
const COPY_SHIFT: u32 = 18;
const MODIFY_SHIFT: u32 = 19;
const PENDING_SHIFT: u32 = 20;
const LOCATION_SHIFT: u32 = 21;

pub const REF_MASK: u64 = (1 << REF_BITS) - 1;
pub const TYPE_MASK: u64 = 0b111 << TYPE_SHIFT;
pub const READ_MASK: u64 = 1 << READ_SHIFT;
pub const COPY_MASK: u64 = 1 << COPY_SHIFT;
pub const MODIFY_MASK: u64 = 1 << MODIFY_SHIFT;
pub const PENDING_MASK: u64 = 1 << PENDING_SHIFT;
pub const LOCATION_MASK: u64 = ((1 << LOCATION_BITS) - 1) << LOCATION_SHIFT;

/// The most threads that may race a retain against the overflow check.
pub const MAX_THREADS: u64 = 64;

/// Retains beyond this count fail.
pub const MAX_REF_COUNT: u64 = REF_MASK - MAX_THREADS;

/// The kind of a node, shared by the meta word and the node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeType {
    Freelist = 0,
    Binary = 1,
    Value = 2,
    Setlist = 3,
    Full = 4,
    Bitset = 5,
    Index = 6,
    Undefined = 7,
}

impl NodeType {
    /// Decode a type tag. Anything outside the known range is `Undefined`.
    pub const fn from_u8(tag: u8) -> NodeType {
        match tag {
            0 => NodeType::Freelist,
            1 => NodeType::Binary,
            2 => NodeType::Value,
            3 => NodeType::Setlist,
            4 => NodeType::Full,
            5 => NodeType::Bitset,
            6 => NodeType::Index,
            _ => NodeType::Undefined,
        }
    }

    /// Whether nodes of this type dispatch on a branch byte.
    pub const fn is_inner(self) -> bool {
        matches!(
            self,
            NodeType::Setlist | NodeType::Full | NodeType::Bitset | NodeType::Index
        )
    }
}

/// A snapshot of an object's metadata word.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaWord(pub u64);

impl MetaWord {
    /// A freshly allocated object: one reference, the given type and location.
    pub fn new(node_type: NodeType, location: NodeLocation) -> Self {
        MetaWord(1)
            .with_type(node_type)
            .with_location(location)
    }

    /// A free slot whose freelist successor is `next_free`.
    pub fn free_slot(next_free: NodeLocation) -> Self {
        MetaWord(0)
            .with_type(NodeType::Freelist)
            .with_location(next_free)
    }

    pub const fn ref_count(&self) -> u64 {
        self.0 & REF_MASK
    }

    pub const fn node_type(&self) -> NodeType {
        NodeType::from_u8(((self.0 & TYPE_MASK) >> TYPE_SHIFT) as u8)
    }

    pub const fn location(&self) -> NodeLocation {
        NodeLocation::from_aligned((self.0 & LOCATION_MASK) >> LOCATION_SHIFT)
    }

    pub const fn is_read(&self) -> bool {
        self.0 & READ_MASK != 0
    }

    pub const fn is_copying(&self) -> bool {
        self.0 & COPY_MASK != 0
    }

    pub const fn is_changing(&self) -> bool {
        self.0 & MODIFY_MASK != 0
    }

    pub const fn is_pending(&self) -> bool {
        self.0 & PENDING_MASK != 0
    }

    pub const fn with_ref_count(self, count: u64) -> Self {
        MetaWord((self.0 & !REF_MASK) | (count & REF_MASK))
    }

    pub const fn with_type(self, node_type: NodeType) -> Self {
        MetaWord((self.0 & !TYPE_MASK) | ((node_type as u64) << TYPE_SHIFT))
    }

    pub const fn with_location(self, location: NodeLocation) -> Self {
        MetaWord((self.0 & !LOCATION_MASK) | (location.aligned() << LOCATION_SHIFT))
    }

    pub const fn with_copying(self, copying: bool) -> Self {
        if copying {
            MetaWord(self.0 | COPY_MASK)
        } else {
            MetaWord(self.0 & !COPY_MASK)
        }
    }

    pub const fn with_changing(self, changing: bool) -> Self {
        if changing {
            MetaWord(self.0 | MODIFY_MASK)
        } else {
            MetaWord(self.0 & !MODIFY_MASK)
        }
    }

    pub const fn with_read(self, read: bool) -> Self {
        if read {
            MetaWord(self.0 | READ_MASK)
        } else {
            MetaWord(self.0 & !READ_MASK)
        }
    }
}

impl core::fmt::Debug for MetaWord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MetaWord")
            .field("ref", &self.ref_count())
            .field("type", &self.node_type())
            .field("loc", &self.location().aligned())
            .field("read", &self.is_read())
            .field("copy", &self.is_copying())
            .field("modify", &self.is_changing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_do_not_overlap() {
        let masks = [
            REF_MASK,
            TYPE_MASK,
            READ_MASK,
            COPY_MASK,
            MODIFY_MASK,
            PENDING_MASK,
            LOCATION_MASK,
        ];
        let mut seen = 0u64;
        for mask in masks {
            assert_eq!(seen & mask, 0);
            seen |= mask;
        }
        assert_eq!(seen, u64::MAX);
    }

    #[test]
    fn builders_round_trip() {
        let loc = NodeLocation::from_absolute(64 * 1024 + 32);
        let m = MetaWord::new(NodeType::Setlist, loc)
            .with_ref_count(9)
            .with_read(true)
            .with_changing(true);
        assert_eq!(m.ref_count(), 9);
        assert_eq!(m.node_type(), NodeType::Setlist);
        assert_eq!(m.location(), loc);
        assert!(m.is_read());
        assert!(m.is_changing());
        assert!(!m.is_copying());

        let m = m.with_changing(false).with_copying(true);
        assert!(!m.is_changing());
        assert!(m.is_copying());
        assert_eq!(m.location(), loc);
    }

    #[test]
    fn sentinel_locations_fit() {
        let m = MetaWord::free_slot(NodeLocation::END_OF_FREELIST);
        assert_eq!(m.location(), NodeLocation::END_OF_FREELIST);
        assert_eq!(m.node_type(), NodeType::Freelist);
        assert_eq!(m.ref_count(), 0);
    }

    #[test]
    fn unknown_type_tags_are_undefined() {
        for tag in 7..=255u8 {
            assert_eq!(NodeType::from_u8(tag), NodeType::Undefined);
        }
    }
}
