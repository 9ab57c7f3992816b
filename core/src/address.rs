//! Object identities.
//!
//! Every node in the store is referred to by an [`IdAddress`]: a region and an index within that
//! region. Regions partition the id space so that concurrent allocators mostly touch disjoint
//! parts of the metadata table. The index 0 of every region is never handed out, which makes an
//! all-zero address a natural null.
//!
//! Inside node bodies ids are stored in their packed 5-byte form, see [`PackedIdAddress`].

use core::fmt;

/// The number of bits an [`IdIndex`] occupies.
pub const INDEX_BITS: u32 = 24;

/// The largest representable index within a region.
pub const MAX_INDEX: u32 = (1 << INDEX_BITS) - 1;

/// The size of a packed id address in bytes.
pub const PACKED_ID_SIZE: usize = 5;

/// A region of the id space.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdRegion(pub u16);

/// A slot within an [`IdRegion`]. Only the low 24 bits are meaningful.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdIndex(u32);

impl IdIndex {
    /// Create a new index. Returns `None` if it does not fit in 24 bits.
    pub const fn new(index: u32) -> Option<Self> {
        if index > MAX_INDEX {
            return None;
        }
        Some(IdIndex(index))
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }
}

/// The stable identity of a node.
///
/// An address is valid iff its index is non-zero.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdAddress {
    region: IdRegion,
    index: IdIndex,
}

impl IdAddress {
    /// The null address.
    pub const NULL: IdAddress = IdAddress {
        region: IdRegion(0),
        index: IdIndex(0),
    };

    pub const fn new(region: IdRegion, index: IdIndex) -> Self {
        IdAddress { region, index }
    }

    pub const fn region(&self) -> IdRegion {
        self.region
    }

    pub const fn index(&self) -> IdIndex {
        self.index
    }

    pub const fn is_valid(&self) -> bool {
        self.index.0 != 0
    }

    /// Encode as a 40-bit integer: `region << 24 | index`.
    pub const fn to_u64(&self) -> u64 {
        (self.region.0 as u64) << INDEX_BITS | self.index.0 as u64
    }

    /// Decode from the 40-bit integer form. Bits above 40 are ignored.
    pub const fn from_u64(raw: u64) -> Self {
        IdAddress {
            region: IdRegion((raw >> INDEX_BITS) as u16),
            index: IdIndex((raw & MAX_INDEX as u64) as u32),
        }
    }

    pub const fn pack(&self) -> PackedIdAddress {
        let raw = self.to_u64().to_le_bytes();
        PackedIdAddress([raw[0], raw[1], raw[2], raw[3], raw[4]])
    }

    /// Read a packed address from the first 5 bytes of `bytes`.
    ///
    /// Panics if `bytes` is shorter than 5 bytes.
    pub fn read_from(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw[..PACKED_ID_SIZE].copy_from_slice(&bytes[..PACKED_ID_SIZE]);
        IdAddress::from_u64(u64::from_le_bytes(raw))
    }

    /// Write the packed form into the first 5 bytes of `bytes`.
    ///
    /// Panics if `bytes` is shorter than 5 bytes.
    pub fn write_to(&self, bytes: &mut [u8]) {
        bytes[..PACKED_ID_SIZE].copy_from_slice(&self.pack().0);
    }
}

impl fmt::Debug for IdAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdAddress({}:{})", self.region.0, self.index.0)
    }
}

impl fmt::Display for IdAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.region.0, self.index.0)
    }
}

/// An [`IdAddress`] packed into 5 little-endian bytes with an alignment of 1, so it can be
/// embedded in node bodies without padding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PackedIdAddress(pub [u8; PACKED_ID_SIZE]);

impl PackedIdAddress {
    pub const NULL: PackedIdAddress = PackedIdAddress([0; PACKED_ID_SIZE]);

    pub fn unpack(&self) -> IdAddress {
        IdAddress::read_from(&self.0)
    }
}

impl From<IdAddress> for PackedIdAddress {
    fn from(id: IdAddress) -> Self {
        id.pack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn null_is_invalid() {
        assert!(!IdAddress::NULL.is_valid());
        assert!(!IdAddress::new(IdRegion(7), IdIndex::new(0).unwrap()).is_valid());
        assert!(IdAddress::new(IdRegion(0), IdIndex::new(1).unwrap()).is_valid());
    }

    #[test]
    fn index_bounds() {
        assert!(IdIndex::new(MAX_INDEX).is_some());
        assert!(IdIndex::new(MAX_INDEX + 1).is_none());
    }

    #[test]
    fn packed_layout() {
        let id = IdAddress::new(IdRegion(0x0201), IdIndex::new(0x0a0b0c).unwrap());
        assert_eq!(id.to_u64(), 0x0201_0a0b0c);
        assert_eq!(id.pack().0, hex!("0c0b0a0102"));
        assert_eq!(id.pack().unpack(), id);
        assert_eq!(IdAddress::from_u64(id.to_u64()), id);
    }

    #[test]
    fn packed_has_byte_alignment() {
        assert_eq!(core::mem::align_of::<PackedIdAddress>(), 1);
        assert_eq!(core::mem::size_of::<PackedIdAddress>(), PACKED_ID_SIZE);
    }

    #[test]
    fn ordering_follows_region_then_index() {
        let a = IdAddress::new(IdRegion(1), IdIndex::new(500).unwrap());
        let b = IdAddress::new(IdRegion(2), IdIndex::new(1).unwrap());
        assert!(a < b);
        assert!(a.to_u64() < b.to_u64());
    }
}
