//! Node checksums.
//!
//! The checksum covers every byte of the node after the checksum field itself, so any change to
//! the header or the body must be followed by [`update`].

use twox_hash::XxHash3_64;

/// Compute the checksum of a node. Never returns 0, which marks an absent checksum.
pub fn compute(node: &[u8]) -> u32 {
    let h = XxHash3_64::oneshot(&node[4..]) as u32;
    if h == 0 {
        1
    } else {
        h
    }
}

/// Recompute and store the checksum of `node`, which must span exactly the node's size.
pub fn update(node: &mut [u8]) {
    let sum = compute(node);
    node[0..4].copy_from_slice(&sum.to_le_bytes());
}

/// Clear the stored checksum, marking it as not computed.
pub fn clear(node: &mut [u8]) {
    node[0..4].copy_from_slice(&0u32.to_le_bytes());
}

/// Whether the stored checksum of `node` matches its contents. Nodes without a checksum pass.
pub fn verify(node: &[u8]) -> bool {
    let stored = u32::from_le_bytes(node[0..4].try_into().unwrap());
    stored == 0 || stored == compute(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_flipped_bit() {
        let mut node = [7u8; 48];
        update(&mut node);
        assert!(verify(&node));
        node[30] ^= 0x10;
        assert!(!verify(&node));
    }

    #[test]
    fn absent_checksum_passes() {
        let mut node = [3u8; 32];
        clear(&mut node);
        assert!(verify(&node));
    }

    #[test]
    fn checksum_field_excluded() {
        let mut a = [9u8; 32];
        let mut b = [9u8; 32];
        b[0] = 0;
        b[3] = 0xff;
        assert_eq!(compute(&a), compute(&b));
        update(&mut a);
        update(&mut b);
        assert_eq!(a, b);
    }
}
