//! The object id table.
//!
//! Ids live in regions so that nodes allocated together get ids that are close together. Each
//! block of the table file holds one page of 512 meta words for every region; the table grows one
//! block at a time and blocks are mapped individually, so meta word addresses never change.
//!
//! Index 0 of every region is reserved, which keeps [`IdAddress::NULL`] from ever being handed out.
//! Free slots are chained through the location field of their meta words.

use std::{
    fs::{File, OpenOptions},
    path::Path,
    ptr,
    sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering},
};

use parking_lot::Mutex;
use segtrie_core::{
    address::MAX_INDEX, IdAddress, IdIndex, IdRegion, MetaWord, NodeLocation,
};

use crate::{
    error::Error,
    location_mutex::LocationMutex,
    mapping::{MappedFile, Mmap},
    options::SyncMode,
};

/// The number of id regions.
pub const NUM_REGIONS: usize = 4096;

const PAGE_SIZE: usize = 4096;
const IDS_PER_PAGE: u32 = (PAGE_SIZE / 8) as u32;
const BLOCK_SIZE: usize = PAGE_SIZE * NUM_REGIONS;
const MAX_BLOCKS: usize = (MAX_INDEX as usize + 1) / IDS_PER_PAGE as usize;

const STATE_MAGIC: u64 = u64::from_le_bytes(*b"SGTRIDS1");
const MAGIC_OFFSET: usize = 0;
const NUM_BLOCKS_OFFSET: usize = 8;
const NEXT_REGION_OFFSET: usize = 12;
const REGIONS_OFFSET: usize = 64;
const REGION_STATE_SIZE: usize = 16;
const STATE_SIZE: usize = REGIONS_OFFSET + NUM_REGIONS * REGION_STATE_SIZE;

/// Per-region bookkeeping, stored in `ids.state`.
struct RegionState<'a> {
    use_count: &'a AtomicU32,
    next_alloc: &'a AtomicU32,
    /// Index of the first free slot, 0 when the freelist is empty.
    first_free: &'a AtomicU64,
}

pub struct IdAlloc {
    state: MappedFile,
    blocks_file: File,
    blocks: Box<[AtomicPtr<u8>]>,
    mappings: Mutex<Vec<Mmap>>,
    region_locks: LocationMutex,
}

impl IdAlloc {
    /// Open the id table in `dir`, creating it if needed.
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        let (state, created) = MappedFile::open(&dir.join("ids.state"), STATE_SIZE)?;
        let blocks_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join("ids.blocks"))?;

        let magic = state.map.atomic_u64(MAGIC_OFFSET);
        if created || magic.load(Ordering::Relaxed) == 0 {
            for r in 0..NUM_REGIONS {
                let region = Self::region_at(&state.map, r);
                region.use_count.store(0, Ordering::Relaxed);
                region.next_alloc.store(1, Ordering::Relaxed);
                region.first_free.store(0, Ordering::Relaxed);
            }
            state.map.atomic_u32(NUM_BLOCKS_OFFSET).store(0, Ordering::Relaxed);
            magic.store(STATE_MAGIC, Ordering::Release);
        } else if magic.load(Ordering::Relaxed) != STATE_MAGIC {
            anyhow::bail!("ids.state is not an id table");
        }

        let num_blocks = state.map.atomic_u32(NUM_BLOCKS_OFFSET).load(Ordering::Acquire) as usize;
        if blocks_file.metadata()?.len() < (num_blocks * BLOCK_SIZE) as u64 {
            anyhow::bail!("ids.blocks is shorter than its {num_blocks} recorded blocks");
        }

        let blocks: Box<[AtomicPtr<u8>]> = (0..MAX_BLOCKS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        let mut mappings = Vec::with_capacity(num_blocks);
        for b in 0..num_blocks {
            let map = Mmap::map(&blocks_file, (b * BLOCK_SIZE) as u64, BLOCK_SIZE)?;
            blocks[b].store(map.as_ptr(), Ordering::Release);
            mappings.push(map);
        }

        Ok(IdAlloc {
            state,
            blocks_file,
            blocks,
            mappings: Mutex::new(mappings),
            region_locks: LocationMutex::new(),
        })
    }

    fn region_at(map: &Mmap, r: usize) -> RegionState<'_> {
        let base = REGIONS_OFFSET + r * REGION_STATE_SIZE;
        RegionState {
            use_count: map.atomic_u32(base),
            next_alloc: map.atomic_u32(base + 4),
            first_free: map.atomic_u64(base + 8),
        }
    }

    fn region(&self, region: IdRegion) -> RegionState<'_> {
        Self::region_at(&self.state.map, region.0 as usize)
    }

    /// Pick a region for a session to allocate from. Regions are handed out round-robin.
    pub fn next_region(&self) -> IdRegion {
        let r = self
            .state
            .map
            .atomic_u32(NEXT_REGION_OFFSET)
            .fetch_add(1, Ordering::Relaxed);
        IdRegion((r as usize % NUM_REGIONS) as u16)
    }

    /// The meta word of `id`, if the table covers it.
    pub fn try_get(&self, id: IdAddress) -> Option<&AtomicU64> {
        if !id.is_valid() || id.region().0 as usize >= NUM_REGIONS {
            return None;
        }
        let index = id.index().to_u32();
        let block = (index / IDS_PER_PAGE) as usize;
        let ptr = self.blocks.get(block)?.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        let offset = id.region().0 as usize * PAGE_SIZE + (index % IDS_PER_PAGE) as usize * 8;
        // SAFETY: the block is mapped for the lifetime of `self`, the offset lies within it and
        //         is 8-byte aligned. Meta words are only ever accessed atomically.
        Some(unsafe { &*(ptr.add(offset) as *const AtomicU64) })
    }

    /// The meta word of `id`. Panics if the id lies outside the table, which means a node
    /// references an id that was never allocated.
    pub fn get(&self, id: IdAddress) -> &AtomicU64 {
        match self.try_get(id) {
            Some(meta) => meta,
            None => panic!("corrupt reference: id {id} is outside of the id table"),
        }
    }

    /// Allocate an id in `region`. Its meta word is zeroed; the caller publishes the object.
    pub fn alloc(&self, region: IdRegion) -> Result<(IdAddress, &AtomicU64), Error> {
        let _guard = self.region_locks.lock(region.0 as u64);
        let state = self.region(region);

        let head = state.first_free.load(Ordering::Relaxed);
        let index = if head != 0 {
            let id = IdAddress::new(region, IdIndex::new(head as u32).ok_or(Error::IdSpaceExhausted)?);
            let next = MetaWord(self.get(id).load(Ordering::Acquire)).location();
            let next = if next == NodeLocation::END_OF_FREELIST {
                0
            } else {
                next.aligned()
            };
            state.first_free.store(next, Ordering::Relaxed);
            head as u32
        } else {
            let index = state.next_alloc.load(Ordering::Relaxed);
            if index > MAX_INDEX {
                return Err(Error::IdSpaceExhausted);
            }
            self.ensure_block((index / IDS_PER_PAGE) as usize)?;
            state.next_alloc.store(index + 1, Ordering::Relaxed);
            index
        };
        state.use_count.fetch_add(1, Ordering::Relaxed);

        // UNWRAP: index was checked against MAX_INDEX, or came from a valid freelist entry.
        let id = IdAddress::new(region, IdIndex::new(index).unwrap());
        let meta = self.get(id);
        meta.store(0, Ordering::Release);
        Ok((id, meta))
    }

    /// Return `id` to its region's freelist. The object it named must already be released.
    pub fn free(&self, id: IdAddress) {
        let region = id.region();
        let _guard = self.region_locks.lock(region.0 as u64);
        let state = self.region(region);
        let head = state.first_free.load(Ordering::Relaxed);
        let next = if head == 0 {
            NodeLocation::END_OF_FREELIST
        } else {
            NodeLocation::from_aligned(head)
        };
        self.get(id)
            .store(MetaWord::free_slot(next).0, Ordering::Release);
        state
            .first_free
            .store(id.index().to_u32() as u64, Ordering::Relaxed);
        state.use_count.fetch_sub(1, Ordering::Relaxed);
    }

    fn ensure_block(&self, block: usize) -> Result<(), Error> {
        if block >= MAX_BLOCKS {
            return Err(Error::IdSpaceExhausted);
        }
        if !self.blocks[block].load(Ordering::Acquire).is_null() {
            return Ok(());
        }
        let mut mappings = self.mappings.lock();
        while mappings.len() <= block {
            let b = mappings.len();
            self.blocks_file.set_len(((b + 1) * BLOCK_SIZE) as u64)?;
            let map = Mmap::map(&self.blocks_file, (b * BLOCK_SIZE) as u64, BLOCK_SIZE)?;
            self.blocks[b].store(map.as_ptr(), Ordering::Release);
            mappings.push(map);
            self.state
                .map
                .atomic_u32(NUM_BLOCKS_OFFSET)
                .store((b + 1) as u32, Ordering::Release);
            tracing::debug!(block = b, "grew id table");
        }
        Ok(())
    }

    /// The number of ids currently allocated.
    pub fn live_ids(&self) -> u64 {
        (0..NUM_REGIONS)
            .map(|r| Self::region_at(&self.state.map, r).use_count.load(Ordering::Relaxed) as u64)
            .sum()
    }

    /// Call `f` with every id that was ever handed out, free or not.
    pub fn for_each_id(&self, mut f: impl FnMut(IdAddress, &AtomicU64)) {
        for r in 0..NUM_REGIONS {
            let region = IdRegion(r as u16);
            let end = self.region(region).next_alloc.load(Ordering::Acquire);
            for index in 1..end {
                // UNWRAP: every index below next_alloc was valid when handed out.
                let id = IdAddress::new(region, IdIndex::new(index).unwrap());
                f(id, self.get(id));
            }
        }
    }

    /// Rebuild every freelist and use count from scratch, keeping the ids for which `live`
    /// returns true. Must not run concurrently with any allocation.
    pub fn rebuild_freelists(&self, mut live: impl FnMut(IdAddress, MetaWord) -> bool) {
        for r in 0..NUM_REGIONS {
            let region = IdRegion(r as u16);
            let state = self.region(region);
            let end = state.next_alloc.load(Ordering::Acquire);
            let mut head = 0u64;
            let mut used = 0u32;
            for index in (1..end).rev() {
                // UNWRAP: see `for_each_id`.
                let id = IdAddress::new(region, IdIndex::new(index).unwrap());
                let meta = self.get(id);
                if live(id, MetaWord(meta.load(Ordering::Acquire))) {
                    used += 1;
                    continue;
                }
                let next = if head == 0 {
                    NodeLocation::END_OF_FREELIST
                } else {
                    NodeLocation::from_aligned(head)
                };
                meta.store(MetaWord::free_slot(next).0, Ordering::Release);
                head = index as u64;
            }
            state.first_free.store(head, Ordering::Relaxed);
            state.use_count.store(used, Ordering::Relaxed);
        }
    }

    pub fn flush(&self, mode: SyncMode) -> std::io::Result<()> {
        for map in self.mappings.lock().iter() {
            map.flush(mode)?;
        }
        self.state.map.flush(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segtrie_core::NodeType;

    #[test]
    fn ids_are_reused_lifo() {
        let dir = tempfile::tempdir().unwrap();
        let ids = IdAlloc::open(dir.path()).unwrap();
        let region = IdRegion(3);

        let (a, _) = ids.alloc(region).unwrap();
        let (b, _) = ids.alloc(region).unwrap();
        assert_eq!(a.index().to_u32(), 1);
        assert_eq!(b.index().to_u32(), 2);
        assert_eq!(ids.live_ids(), 2);

        ids.free(a);
        ids.free(b);
        assert_eq!(ids.live_ids(), 0);
        assert_eq!(ids.alloc(region).unwrap().0, b);
        assert_eq!(ids.alloc(region).unwrap().0, a);
        assert_eq!(ids.alloc(region).unwrap().0.index().to_u32(), 3);
    }

    #[test]
    fn meta_words_persist() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let ids = IdAlloc::open(dir.path()).unwrap();
            let (id, meta) = ids.alloc(IdRegion(9)).unwrap();
            let word = MetaWord::new(NodeType::Binary, NodeLocation::from_absolute(4096));
            meta.store(word.0, Ordering::Release);
            id
        };
        let ids = IdAlloc::open(dir.path()).unwrap();
        let word = MetaWord(ids.get(id).load(Ordering::Acquire));
        assert_eq!(word.node_type(), NodeType::Binary);
        assert_eq!(word.location(), NodeLocation::from_absolute(4096));
        assert_eq!(ids.live_ids(), 1);
    }

    #[test]
    fn grows_past_one_block() {
        let dir = tempfile::tempdir().unwrap();
        let ids = IdAlloc::open(dir.path()).unwrap();
        let mut last = IdAddress::NULL;
        for _ in 0..IDS_PER_PAGE + 10 {
            last = ids.alloc(IdRegion(0)).unwrap().0;
        }
        assert_eq!(last.index().to_u32(), IDS_PER_PAGE + 10);
        assert!(ids.try_get(last).is_some());
        assert!(ids.try_get(IdAddress::new(IdRegion(0), IdIndex::new(5 * IDS_PER_PAGE).unwrap())).is_none());
    }

    #[test]
    fn rebuild_keeps_only_live() {
        let dir = tempfile::tempdir().unwrap();
        let ids = IdAlloc::open(dir.path()).unwrap();
        let all: Vec<_> = (0..6).map(|_| ids.alloc(IdRegion(1)).unwrap().0).collect();
        ids.rebuild_freelists(|id, _| id == all[1] || id == all[4]);
        assert_eq!(ids.live_ids(), 2);

        let mut reused = Vec::new();
        for _ in 0..4 {
            reused.push(ids.alloc(IdRegion(1)).unwrap().0);
        }
        reused.sort();
        let mut expected = vec![all[0], all[2], all[3], all[5]];
        expected.sort();
        assert_eq!(reused, expected);
    }
}
