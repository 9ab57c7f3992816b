//! Physical node locations.
//!
//! A [`NodeLocation`] is a byte offset into the concatenation of all segments, stored in units
//! of the 16-byte object alignment. It fits the 43-bit location field of the meta word.

/// Objects are aligned to this many bytes within a segment.
pub const OBJECT_ALIGN: u64 = 16;

/// The number of bits a location occupies in the meta word.
pub const LOCATION_BITS: u32 = 43;

const MAX_RAW: u64 = (1 << LOCATION_BITS) - 1;

/// The position of a node's bytes: segment and aligned offset packed into one integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeLocation(u64);

impl NodeLocation {
    /// A location that has not been assigned.
    pub const NULL: NodeLocation = NodeLocation(MAX_RAW);
    /// Terminates a region freelist threaded through free meta slots.
    pub const END_OF_FREELIST: NodeLocation = NodeLocation(MAX_RAW - 1);

    /// Create a location from an absolute byte offset.
    ///
    /// Panics if the offset is not 16-byte aligned or out of range.
    pub fn from_absolute(offset: u64) -> Self {
        assert_eq!(offset % OBJECT_ALIGN, 0, "misaligned node location {offset}");
        let aligned = offset / OBJECT_ALIGN;
        assert!(aligned < MAX_RAW - 1, "node location {offset} out of range");
        NodeLocation(aligned)
    }

    /// Create a location from an offset already expressed in 16-byte units.
    ///
    /// Only the low 43 bits are kept, so any raw location field value round-trips.
    pub const fn from_aligned(aligned: u64) -> Self {
        NodeLocation(aligned & MAX_RAW)
    }

    /// Create the location of `offset` within `segment`.
    pub fn from_segment(segment: u32, offset: u32, segment_size: u64) -> Self {
        Self::from_absolute(segment as u64 * segment_size + offset as u64)
    }

    pub const fn aligned(&self) -> u64 {
        self.0
    }

    pub const fn absolute(&self) -> u64 {
        self.0 * OBJECT_ALIGN
    }

    /// The segment this location falls in.
    pub const fn segment(&self, segment_size: u64) -> u32 {
        (self.absolute() / segment_size) as u32
    }

    /// The byte offset within the segment.
    pub const fn offset_in_segment(&self, segment_size: u64) -> u32 {
        (self.absolute() % segment_size) as u32
    }

    /// Whether this is a real location rather than one of the sentinels.
    pub const fn is_valid(&self) -> bool {
        self.0 < MAX_RAW - 1
    }
}

/// Round `size` up to the object alignment.
pub const fn object_capacity(size: usize) -> usize {
    (size + OBJECT_ALIGN as usize - 1) & !(OBJECT_ALIGN as usize - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG: u64 = 1 << 20;

    #[test]
    fn sentinels_are_not_valid() {
        assert!(!NodeLocation::NULL.is_valid());
        assert!(!NodeLocation::END_OF_FREELIST.is_valid());
        assert_ne!(NodeLocation::NULL, NodeLocation::END_OF_FREELIST);
        assert!(NodeLocation::from_absolute(0).is_valid());
    }

    #[test]
    fn segment_and_offset() {
        let loc = NodeLocation::from_segment(3, 4096 + 48, SEG);
        assert_eq!(loc.segment(SEG), 3);
        assert_eq!(loc.offset_in_segment(SEG), 4096 + 48);
        assert_eq!(loc.absolute(), 3 * SEG + 4096 + 48);
        assert_eq!(NodeLocation::from_aligned(loc.aligned()), loc);
    }

    #[test]
    #[should_panic]
    fn misaligned_rejected() {
        let _ = NodeLocation::from_absolute(17);
    }

    #[test]
    fn ordering_is_by_offset() {
        let a = NodeLocation::from_segment(0, SEG as u32 - 16, SEG);
        let b = NodeLocation::from_segment(1, 0, SEG);
        assert!(a < b);
    }

    #[test]
    fn capacity_rounds_up() {
        assert_eq!(object_capacity(0), 0);
        assert_eq!(object_capacity(1), 16);
        assert_eq!(object_capacity(16), 16);
        assert_eq!(object_capacity(33), 48);
    }
}
