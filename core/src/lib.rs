//! Core encodings of the segtrie store.
//!
//! This crate defines the on-disk shapes of everything the store persists: object identities,
//! physical node locations, the per-object metadata word and the node formats themselves,
//! together with the builders that produce them.
//!
//! Nothing in here touches files or threads. The types do not require the standard library,
//! but do require Rust's alloc crate.

#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod address;
pub mod location;
pub mod meta;
pub mod node;

pub use address::{IdAddress, IdIndex, IdRegion, PackedIdAddress};
pub use location::NodeLocation;
pub use meta::{MetaWord, NodeType};

/// The maximum length of a key, in bytes.
///
/// Bounded by the width of the prefix length field in the node header.
pub const MAX_KEY_SIZE: usize = 1023;

/// Returns the length of the longest common prefix of `a` and `b`.
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::common_prefix_len;

    #[test]
    fn common_prefix() {
        assert_eq!(common_prefix_len(b"", b"abc"), 0);
        assert_eq!(common_prefix_len(b"abc", b"abd"), 2);
        assert_eq!(common_prefix_len(b"abc", b"abc"), 3);
        assert_eq!(common_prefix_len(b"ab", b"abc"), 2);
        assert_eq!(common_prefix_len(b"x", b"abc"), 0);
    }
}
