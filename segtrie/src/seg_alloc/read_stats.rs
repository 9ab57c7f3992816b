//! Sampled read statistics.
//!
//! Recording every node access would cost a shared write per read, so sessions sample accesses
//! with a cheap private generator. Sampled objects get their read bit set, which decides whether
//! the compactor treats them as hot, and their bytes are tallied per segment. The compactor folds
//! the tallies into a size-weighted read time for every segment.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::{rngs::SmallRng, RngCore, SeedableRng};

/// Decides which accesses are sampled. A difficulty of `d` samples roughly one access in `d`.
pub struct ReadSampler {
    rng: SmallRng,
    threshold: u32,
}

impl ReadSampler {
    /// A difficulty of 0 disables sampling.
    pub fn new(difficulty: u32) -> Self {
        let threshold = match difficulty {
            0 => 0,
            1 => u32::MAX,
            d => u32::MAX / d,
        };
        ReadSampler {
            rng: SmallRng::seed_from_u64(seed()),
            threshold,
        }
    }

    pub fn sample(&mut self) -> bool {
        self.threshold != 0 && self.rng.next_u32() <= self.threshold
    }
}

fn seed() -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            // SAFETY: rdtsc has no preconditions.
            unsafe { core::arch::x86_64::_rdtsc() }
        } else {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos() as u64)
        }
    }
}

/// Bytes read per segment by one session since the last aggregation.
pub struct SegmentReads {
    bytes: Box<[AtomicU64]>,
}

impl SegmentReads {
    pub fn new(max_segments: u32) -> Self {
        SegmentReads {
            bytes: (0..max_segments).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn record(&self, segment: u32, bytes: u64) {
        self.bytes[segment as usize].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn take(&self, segment: u32) -> u64 {
        self.bytes[segment as usize].swap(0, Ordering::Relaxed)
    }
}

/// Fold `new_bytes` read at `now` into a size-weighted average read time.
pub fn weighted_read_time(old_bytes: u64, old_time: u64, new_bytes: u64, now: u64) -> u64 {
    let total = old_bytes as u128 + new_bytes as u128;
    if total == 0 {
        return old_time;
    }
    ((old_bytes as u128 * old_time as u128 + new_bytes as u128 * now as u128) / total) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_rate_follows_difficulty() {
        let mut never = ReadSampler::new(0);
        assert!((0..1000).all(|_| !never.sample()));

        let mut always = ReadSampler::new(1);
        assert!((0..1000).all(|_| always.sample()));

        let mut sometimes = ReadSampler::new(16);
        let hits = (0..16_000).filter(|_| sometimes.sample()).count();
        assert!(hits > 500 && hits < 2000, "{hits} samples");
    }

    #[test]
    fn tallies_reset_on_take() {
        let reads = SegmentReads::new(4);
        reads.record(2, 100);
        reads.record(2, 28);
        assert_eq!(reads.take(2), 128);
        assert_eq!(reads.take(2), 0);
        assert_eq!(reads.take(1), 0);
    }

    #[test]
    fn read_time_is_weighted_by_size() {
        assert_eq!(weighted_read_time(0, 0, 10, 500), 500);
        assert_eq!(weighted_read_time(100, 1000, 100, 2000), 1500);
        assert_eq!(weighted_read_time(300, 1000, 100, 2000), 1250);
        assert_eq!(weighted_read_time(0, 42, 0, 9000), 42);
    }
}
