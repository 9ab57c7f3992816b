//! Segment allocation.
//!
//! Node bytes live in fixed-size segment files, each mapped into memory on its own. Every session
//! bump-allocates out of a private active segment; when it fills up it is sealed and a new one is
//! taken from the free list or created. Space given up by freed or moved objects is tallied per
//! segment, and the compactor relocates the live objects of segments with enough free space so
//! that they can be reclaimed once no session can observe them anymore.
//!
//! `seg.header` persists, for every segment, its state, freed bytes, bump pointer and read
//! statistics. Segment files start with a small header of their own.

use std::{
    fs::{File, OpenOptions},
    path::PathBuf,
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;
use segtrie_core::{
    node::{NodeHeader, HEADER_SIZE},
    NodeLocation,
};

use crate::{
    error::Error,
    gc_queue::GcQueue,
    id_alloc::IdAlloc,
    location_mutex::LocationMutex,
    mapping::{MappedFile, Mmap},
    metrics::{Metric, Metrics},
    options::{Options, SyncMode},
};

pub use compactor::Compactor;
pub use session::{AllocSession, ReadLock};

use read_stats::{weighted_read_time, SegmentReads};
use sync_lock::SyncLock;

mod compactor;
mod read_stats;
mod session;
mod sync_lock;

/// The maximum number of sessions open at once, including internal ones.
pub const MAX_SESSIONS: usize = 64;

/// Objects are never allocated in the first bytes of a segment file.
pub const SEGMENT_HEADER_SIZE: u32 = 64;

const HEADER_MAGIC: u64 = u64::from_le_bytes(*b"SGTRSEGS");
const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"SGTRSEG1");

const MAGIC_OFFSET: usize = 0;
const SEGMENT_SIZE_OFFSET: usize = 8;
const MAX_SEGMENTS_OFFSET: usize = 16;
const NUM_SEGMENTS_OFFSET: usize = 20;
const ALLOC_SEQ_OFFSET: usize = 24;
const METAS_OFFSET: usize = 64;
const SEGMENT_META_SIZE: usize = 64;

/// The life cycle of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SegmentState {
    /// Unmapped, its file truncated. Available for reuse.
    Free = 0,
    /// Being allocated from by one session.
    Active = 1,
    /// Full. Only ever loses objects.
    Sealed = 2,
    /// Claimed by the compactor.
    Compacting = 3,
    /// Vacated, waiting for every session to stop observing it.
    Pending = 4,
}

impl SegmentState {
    fn from_u32(x: u32) -> Self {
        match x {
            0 => SegmentState::Free,
            1 => SegmentState::Active,
            2 => SegmentState::Sealed,
            3 => SegmentState::Compacting,
            4 => SegmentState::Pending,
            _ => panic!("corrupt segment header: unknown state {x}"),
        }
    }
}

/// The persistent bookkeeping of one segment.
pub(crate) struct SegmentMeta<'a> {
    pub freed_bytes: &'a AtomicU64,
    /// The bump pointer. Objects lie in `[SEGMENT_HEADER_SIZE, alloc_end)`.
    pub alloc_end: &'a AtomicU32,
    state: &'a AtomicU32,
    pub read_bytes: &'a AtomicU64,
    /// Size-weighted average time of sampled reads, in milliseconds since open.
    pub read_time: &'a AtomicU64,
    /// Allocation order of the segment.
    pub seq: &'a AtomicU64,
}

impl SegmentMeta<'_> {
    pub fn state(&self) -> SegmentState {
        SegmentState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SegmentState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn claim(&self, from: SegmentState, to: SegmentState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct SegmentFile {
    file: File,
    map: Mmap,
}

/// Per-segment statistics, as reported by [`crate::Database::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    pub segment: u32,
    pub state: SegmentState,
    pub freed_bytes: u64,
    pub alloc_end: u32,
    pub read_bytes: u64,
}

pub struct SegAllocator {
    dir: PathBuf,
    segment_size: u64,
    max_segments: u32,
    header: MappedFile,
    segments: Box<[AtomicPtr<u8>]>,
    files: Box<[Mutex<Option<SegmentFile>>]>,
    free_segments: Mutex<Vec<u32>>,
    sessions: AtomicU64,
    sync_locks: Box<[SyncLock]>,
    reads: Box<[SegmentReads]>,
    modify_countdown: AtomicU64,
    poisoned: AtomicBool,
    opened_at: Instant,
    compact_threshold_percent: u8,
    pub(crate) read_sample_difficulty: u32,
    pub(crate) validate_checksums: bool,
    pub(crate) update_checksums: bool,
    pub(crate) ids: IdAlloc,
    pub(crate) gc: GcQueue<u32>,
    pub(crate) location_mutex: LocationMutex,
    pub(crate) metrics: Metrics,
}

impl SegAllocator {
    /// Open the segments and the id table in `o.path`.
    pub fn open(o: &Options, metrics: Metrics) -> anyhow::Result<Self> {
        let dir = o.path.join("segments");
        std::fs::create_dir_all(&dir)?;

        let header_len = METAS_OFFSET + o.max_segments as usize * SEGMENT_META_SIZE;
        let (header, created) = MappedFile::open(&o.path.join("seg.header"), header_len)?;
        let map = &header.map;
        if created || map.atomic_u64(MAGIC_OFFSET).load(Ordering::Acquire) == 0 {
            map.atomic_u64(SEGMENT_SIZE_OFFSET)
                .store(o.segment_size, Ordering::Relaxed);
            map.atomic_u32(MAX_SEGMENTS_OFFSET)
                .store(o.max_segments, Ordering::Relaxed);
            map.atomic_u32(NUM_SEGMENTS_OFFSET).store(0, Ordering::Relaxed);
            map.atomic_u64(MAGIC_OFFSET).store(HEADER_MAGIC, Ordering::Release);
        } else {
            if map.atomic_u64(MAGIC_OFFSET).load(Ordering::Acquire) != HEADER_MAGIC {
                anyhow::bail!("seg.header is not a segment header");
            }
            let stored = map.atomic_u64(SEGMENT_SIZE_OFFSET).load(Ordering::Relaxed);
            if stored != o.segment_size {
                anyhow::bail!(
                    "store was created with segment size {stored}, opened with {}",
                    o.segment_size
                );
            }
            let stored = map.atomic_u32(MAX_SEGMENTS_OFFSET).load(Ordering::Relaxed);
            if stored != o.max_segments {
                anyhow::bail!(
                    "store was created with at most {stored} segments, opened with {}",
                    o.max_segments
                );
            }
        }

        let alloc = SegAllocator {
            dir,
            segment_size: o.segment_size,
            max_segments: o.max_segments,
            segments: (0..o.max_segments)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            files: (0..o.max_segments).map(|_| Mutex::new(None)).collect(),
            free_segments: Mutex::new(Vec::new()),
            sessions: AtomicU64::new(0),
            sync_locks: (0..o.max_segments).map(|_| SyncLock::default()).collect(),
            reads: (0..MAX_SESSIONS)
                .map(|_| SegmentReads::new(o.max_segments))
                .collect(),
            modify_countdown: AtomicU64::new(o.panic_on_modify.unwrap_or(u64::MAX)),
            poisoned: AtomicBool::new(false),
            opened_at: Instant::now(),
            compact_threshold_percent: o.compact_threshold_percent,
            read_sample_difficulty: o.read_sample_difficulty,
            validate_checksums: o.validate_checksums,
            update_checksums: o.update_checksums,
            ids: IdAlloc::open(&o.path)?,
            gc: GcQueue::new(o.gc_queue_capacity, MAX_SESSIONS),
            location_mutex: LocationMutex::new(),
            metrics,
            header,
        };

        let mut free = Vec::new();
        for seg in (0..alloc.num_segments()).rev() {
            let meta = alloc.meta(seg);
            match meta.state() {
                SegmentState::Free => free.push(seg),
                SegmentState::Pending => {
                    // vacated before shutdown; nobody can observe it anymore.
                    alloc.truncate_segment_file(seg)?;
                    alloc.reset_meta(seg);
                    free.push(seg);
                }
                state => {
                    alloc.map_segment(seg, false)?;
                    if state == SegmentState::Compacting {
                        meta.set_state(SegmentState::Sealed);
                    }
                }
            }
        }
        *alloc.free_segments.lock() = free;
        Ok(alloc)
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn num_segments(&self) -> u32 {
        self.header
            .map
            .atomic_u32(NUM_SEGMENTS_OFFSET)
            .load(Ordering::Acquire)
    }

    pub(crate) fn meta(&self, seg: u32) -> SegmentMeta<'_> {
        assert!(seg < self.max_segments, "segment {seg} out of range");
        let base = METAS_OFFSET + seg as usize * SEGMENT_META_SIZE;
        let map = &self.header.map;
        SegmentMeta {
            freed_bytes: map.atomic_u64(base),
            alloc_end: map.atomic_u32(base + 8),
            state: map.atomic_u32(base + 12),
            read_bytes: map.atomic_u64(base + 16),
            read_time: map.atomic_u64(base + 24),
            seq: map.atomic_u64(base + 32),
        }
    }

    fn reset_meta(&self, seg: u32) {
        let meta = self.meta(seg);
        meta.freed_bytes.store(0, Ordering::Relaxed);
        meta.alloc_end.store(0, Ordering::Relaxed);
        meta.read_bytes.store(0, Ordering::Relaxed);
        meta.read_time.store(0, Ordering::Relaxed);
        meta.set_state(SegmentState::Free);
    }

    pub(crate) fn segment_path(&self, seg: u32) -> PathBuf {
        self.dir.join(format!("seg.{seg:0>10}.dat"))
    }

    fn map_segment(&self, seg: u32, fresh: bool) -> std::io::Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(fresh)
            .truncate(false)
            .open(self.segment_path(seg))?;
        file.set_len(self.segment_size)?;
        let map = Mmap::map(&file, 0, self.segment_size as usize)?;
        if fresh {
            map.atomic_u64(0).store(SEGMENT_MAGIC, Ordering::Relaxed);
            map.atomic_u32(8).store(seg, Ordering::Relaxed);
        } else if map.atomic_u64(0).load(Ordering::Relaxed) != SEGMENT_MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("segment file {seg} has a bad header"),
            ));
        }
        self.segments[seg as usize].store(map.as_ptr(), Ordering::Release);
        *self.files[seg as usize].lock() = Some(SegmentFile { file, map });
        Ok(())
    }

    fn truncate_segment_file(&self, seg: u32) -> std::io::Result<()> {
        let path = self.segment_path(seg);
        if path.exists() {
            OpenOptions::new().write(true).open(path)?.set_len(0)?;
        }
        Ok(())
    }

    /// Take a segment for a session to allocate from.
    pub(crate) fn new_segment(&self) -> Result<u32, Error> {
        self.recycle(self.gc.poll());

        let seg = {
            let mut free = self.free_segments.lock();
            match free.pop() {
                Some(seg) => seg,
                None => {
                    let n = self.num_segments();
                    if n >= self.max_segments {
                        return Err(Error::SegmentSpaceExhausted {
                            max_segments: self.max_segments,
                        });
                    }
                    self.header
                        .map
                        .atomic_u32(NUM_SEGMENTS_OFFSET)
                        .store(n + 1, Ordering::Release);
                    n
                }
            }
        };

        if let Err(e) = self.map_segment(seg, true) {
            self.free_segments.lock().push(seg);
            return Err(e.into());
        }

        let seq = self
            .header
            .map
            .atomic_u64(ALLOC_SEQ_OFFSET)
            .fetch_add(1, Ordering::Relaxed);
        let meta = self.meta(seg);
        meta.freed_bytes.store(0, Ordering::Relaxed);
        meta.alloc_end.store(SEGMENT_HEADER_SIZE, Ordering::Relaxed);
        meta.read_bytes.store(0, Ordering::Relaxed);
        meta.read_time.store(self.now_ms(), Ordering::Relaxed);
        meta.seq.store(seq, Ordering::Relaxed);
        meta.set_state(SegmentState::Active);
        tracing::trace!(segment = seg, seq, "activated segment");
        Ok(seg)
    }

    /// Stop allocating from `seg`. The unused tail counts as freed.
    pub(crate) fn seal_segment(&self, seg: u32, end: u32) {
        let meta = self.meta(seg);
        meta.alloc_end.store(end, Ordering::Release);
        meta.freed_bytes
            .fetch_add(self.segment_size - end as u64, Ordering::AcqRel);
        meta.set_state(SegmentState::Sealed);
        tracing::trace!(segment = seg, end, "sealed segment");
    }

    /// Seal segments left active by a previous process.
    pub(crate) fn seal_orphans(&self) {
        for seg in 0..self.num_segments() {
            let meta = self.meta(seg);
            if meta.state() == SegmentState::Active {
                let end = meta.alloc_end.load(Ordering::Acquire).max(SEGMENT_HEADER_SIZE);
                self.seal_segment(seg, end);
            }
        }
    }

    /// Account `capacity` bytes at `loc` as garbage.
    pub(crate) fn free_object(&self, loc: NodeLocation, capacity: usize) {
        let seg = loc.segment(self.segment_size);
        self.meta(seg)
            .freed_bytes
            .fetch_add(capacity as u64, Ordering::AcqRel);
    }

    fn segment_ptr(&self, seg: u32) -> *mut u8 {
        let ptr = match self.segments.get(seg as usize) {
            Some(ptr) => ptr.load(Ordering::Acquire),
            None => ptr::null_mut(),
        };
        if ptr.is_null() {
            panic!("corrupt location: segment {seg} is not mapped");
        }
        ptr
    }

    /// The bytes of the node at `loc`, trimmed to the size in its header.
    ///
    /// The caller must hold a read lock for as long as it uses the returned slice.
    pub(crate) fn node_bytes(&self, loc: NodeLocation) -> &[u8] {
        match self.try_node_bytes(loc) {
            Some(bytes) => bytes,
            None => {
                tracing::error!(location = ?loc, "location does not hold a node");
                panic!("corrupt location: {loc:?} does not hold a node")
            }
        }
    }

    /// Like [`Self::node_bytes`], but `None` if the segment is not mapped or the header does not
    /// describe a node that fits in it.
    pub(crate) fn try_node_bytes(&self, loc: NodeLocation) -> Option<&[u8]> {
        let seg = loc.segment(self.segment_size);
        let offset = loc.offset_in_segment(self.segment_size) as usize;
        let ptr = self.segments.get(seg as usize)?.load(Ordering::Acquire);
        let room = self.segment_size as usize - offset;
        if ptr.is_null() || room < HEADER_SIZE {
            return None;
        }
        // SAFETY: the segment is mapped and `offset + HEADER_SIZE` lies within it. It stays mapped
        //         while any read lock that could reach this location is held.
        let header = unsafe { std::slice::from_raw_parts(ptr.add(offset), HEADER_SIZE) };
        let size = NodeHeader::new(header).size();
        if size < HEADER_SIZE || size > room {
            return None;
        }
        // SAFETY: as above, now over the whole node.
        Some(unsafe { std::slice::from_raw_parts(ptr.add(offset), size) })
    }

    /// The `len` bytes starting at `loc`, for writing.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the range: either it was just allocated, or the
    /// object's modify bit is held.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn object_bytes_mut(&self, loc: NodeLocation, len: usize) -> &mut [u8] {
        let seg = loc.segment(self.segment_size);
        let offset = loc.offset_in_segment(self.segment_size) as usize;
        assert!(offset + len <= self.segment_size as usize);
        std::slice::from_raw_parts_mut(self.segment_ptr(seg).add(offset), len)
    }

    pub(crate) fn sync_lock(&self, loc: NodeLocation) -> &SyncLock {
        &self.sync_locks[loc.segment(self.segment_size) as usize]
    }

    /// Unmap vacated segments and return them to the free list.
    pub(crate) fn recycle(&self, segments: Vec<u32>) {
        for seg in segments {
            self.segments[seg as usize].store(ptr::null_mut(), Ordering::Release);
            if let Some(sf) = self.files[seg as usize].lock().take() {
                drop(sf.map);
                if let Err(e) = sf.file.set_len(0) {
                    tracing::warn!(segment = seg, "failed to truncate recycled segment: {e}");
                }
            }
            self.reset_meta(seg);
            self.free_segments.lock().push(seg);
            self.metrics.count(Metric::RecycledSegments);
            tracing::debug!(segment = seg, "recycled segment");
        }
    }

    /// Recycle every vacated segment no session can observe anymore. Returns how many.
    pub fn reclaim(&self) -> usize {
        let ready = self.gc.poll();
        let n = ready.len();
        self.recycle(ready);
        n
    }

    /// Pick the sealed segment most worth compacting and claim it. Segments qualify once their
    /// freed bytes reach the configured share of the segment; among those the one with the most
    /// freed bytes wins, and on a tie the one read least recently.
    pub(crate) fn claim_compaction_candidate(&self) -> Option<u32> {
        let threshold = self.segment_size * self.compact_threshold_percent as u64 / 100;
        loop {
            let mut best: Option<(u32, u64, u64)> = None;
            for seg in 0..self.num_segments() {
                let meta = self.meta(seg);
                if meta.state() != SegmentState::Sealed {
                    continue;
                }
                let freed = meta.freed_bytes.load(Ordering::Acquire);
                if freed < threshold.max(1) {
                    continue;
                }
                let read_time = meta.read_time.load(Ordering::Relaxed);
                let better = match best {
                    None => true,
                    Some((_, f, t)) => freed > f || (freed == f && read_time < t),
                };
                if better {
                    best = Some((seg, freed, read_time));
                }
            }
            let (seg, _, _) = best?;
            if self
                .meta(seg)
                .claim(SegmentState::Sealed, SegmentState::Compacting)
            {
                return Some(seg);
            }
        }
    }

    /// Take a session slot.
    pub(crate) fn acquire_session(&self) -> Result<usize, Error> {
        let mut current = self.sessions.load(Ordering::Acquire);
        loop {
            let slot = (!current).trailing_zeros() as usize;
            if slot >= MAX_SESSIONS {
                return Err(Error::TooManySessions);
            }
            match self.sessions.compare_exchange_weak(
                current,
                current | (1 << slot),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(slot),
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn release_session(&self, slot: usize) {
        self.sessions.fetch_and(!(1u64 << slot), Ordering::AcqRel);
    }

    pub fn active_sessions(&self) -> u32 {
        self.sessions.load(Ordering::Acquire).count_ones()
    }

    pub(crate) fn record_read(&self, session: usize, loc: NodeLocation, bytes: usize) {
        self.reads[session].record(loc.segment(self.segment_size), bytes as u64);
        self.metrics.count(Metric::ReadSamples);
    }

    /// Fold the sampled reads of every session into the per-segment read statistics.
    pub(crate) fn aggregate_reads(&self) {
        let now = self.now_ms();
        for seg in 0..self.num_segments() {
            let bytes: u64 = self.reads.iter().map(|r| r.take(seg)).sum();
            if bytes == 0 {
                continue;
            }
            let meta = self.meta(seg);
            let old_bytes = meta.read_bytes.load(Ordering::Relaxed);
            let old_time = meta.read_time.load(Ordering::Relaxed);
            meta.read_time.store(
                weighted_read_time(old_bytes, old_time, bytes, now),
                Ordering::Relaxed,
            );
            meta.read_bytes
                .store(old_bytes.saturating_add(bytes), Ordering::Relaxed);
        }
    }

    fn now_ms(&self) -> u64 {
        self.opened_at.elapsed().as_millis() as u64
    }

    /// Whether the modification about to happen is the one configured to panic.
    pub(crate) fn take_modify_panic(&self) -> bool {
        self.modify_countdown
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c != u64::MAX && c != 0).then(|| c - 1)
            })
            .map_or(false, |prev| prev == 1)
    }

    /// Record that an in-place modification was abandoned by a panic. The store must then not be
    /// marked as cleanly shut down.
    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub fn segment_stats(&self) -> Vec<SegmentStats> {
        (0..self.num_segments())
            .map(|seg| {
                let meta = self.meta(seg);
                SegmentStats {
                    segment: seg,
                    state: meta.state(),
                    freed_bytes: meta.freed_bytes.load(Ordering::Relaxed),
                    alloc_end: meta.alloc_end.load(Ordering::Relaxed),
                    read_bytes: meta.read_bytes.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Call `f` with the location and bytes of every node header in the allocated part of `seg`,
    /// in address order. Stops early at a zero-sized header.
    ///
    /// Nothing may be allocating in the segment meanwhile.
    pub(crate) fn scan_segment(&self, seg: u32, mut f: impl FnMut(NodeLocation, &[u8])) {
        let meta = self.meta(seg);
        if meta.state() == SegmentState::Free {
            return;
        }
        let end = (meta.alloc_end.load(Ordering::Acquire) as u64).min(self.segment_size);
        let mut pos = SEGMENT_HEADER_SIZE as u64;
        while pos + HEADER_SIZE as u64 <= end {
            let loc = NodeLocation::from_segment(seg, pos as u32, self.segment_size);
            // SAFETY: the segment is mapped (it is not free) and the header lies within it.
            let header = unsafe {
                std::slice::from_raw_parts(self.segment_ptr(seg).add(pos as usize), HEADER_SIZE)
            };
            let size = NodeHeader::new(header).size();
            if size == 0 {
                break;
            }
            let capacity = segtrie_core::location::object_capacity(size.max(HEADER_SIZE)) as u64;
            if pos + capacity > end {
                tracing::warn!(segment = seg, pos, size, "node header runs past segment end");
                break;
            }
            f(loc, self.node_bytes(loc));
            pos += capacity;
        }
    }

    /// Flush all segments, the id table and the segment header.
    pub fn flush(&self, mode: SyncMode) -> std::io::Result<()> {
        if mode == SyncMode::None {
            return Ok(());
        }
        for seg in 0..self.num_segments() {
            let files = self.files[seg as usize].lock();
            if let Some(sf) = files.as_ref() {
                let _guard = self.sync_locks[seg as usize].start_sync();
                sf.map.flush(mode)?;
            }
        }
        self.ids.flush(mode)?;
        self.header.map.flush(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn options(dir: &Path) -> Options {
        let mut o = Options::new();
        o.path(dir);
        o.segment_size(1 << 20);
        o.max_segments(4);
        o
    }

    #[test]
    fn segments_are_created_then_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = SegAllocator::open(&options(dir.path()), Metrics::new(false)).unwrap();
        for expected in 0..4 {
            assert_eq!(alloc.new_segment().unwrap(), expected);
            assert_eq!(alloc.meta(expected).state(), SegmentState::Active);
        }
        assert!(matches!(
            alloc.new_segment(),
            Err(Error::SegmentSpaceExhausted { max_segments: 4 })
        ));
    }

    #[test]
    fn sealing_counts_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = SegAllocator::open(&options(dir.path()), Metrics::new(false)).unwrap();
        let seg = alloc.new_segment().unwrap();
        alloc.seal_segment(seg, 1024);
        let meta = alloc.meta(seg);
        assert_eq!(meta.state(), SegmentState::Sealed);
        assert_eq!(meta.freed_bytes.load(Ordering::Relaxed), (1 << 20) - 1024);
    }

    #[test]
    fn candidates_need_enough_free_space() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = SegAllocator::open(&options(dir.path()), Metrics::new(false)).unwrap();
        let a = alloc.new_segment().unwrap();
        let b = alloc.new_segment().unwrap();
        // a keeps 90% of its space in use, b only half.
        alloc.seal_segment(a, ((1 << 20) * 9 / 10) as u32 & !15);
        alloc.seal_segment(b, 1 << 19);

        assert_eq!(alloc.claim_compaction_candidate(), Some(b));
        assert_eq!(alloc.meta(b).state(), SegmentState::Compacting);
        assert_eq!(alloc.claim_compaction_candidate(), None);
    }

    #[test]
    fn recycled_segments_are_truncated_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = SegAllocator::open(&options(dir.path()), Metrics::new(false)).unwrap();
        let seg = alloc.new_segment().unwrap();
        alloc.seal_segment(seg, SEGMENT_HEADER_SIZE);
        alloc.meta(seg).set_state(SegmentState::Pending);
        assert!(alloc.gc.push(seg).is_empty());
        assert_eq!(alloc.reclaim(), 1);

        assert_eq!(alloc.meta(seg).state(), SegmentState::Free);
        let len = std::fs::metadata(alloc.segment_path(seg)).unwrap().len();
        assert_eq!(len, 0);
        assert_eq!(alloc.new_segment().unwrap(), seg);
    }

    #[test]
    fn session_slots_run_out() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = SegAllocator::open(&options(dir.path()), Metrics::new(false)).unwrap();
        let slots: Vec<_> = (0..MAX_SESSIONS)
            .map(|_| alloc.acquire_session().unwrap())
            .collect();
        assert!(matches!(alloc.acquire_session(), Err(Error::TooManySessions)));
        alloc.release_session(slots[10]);
        assert_eq!(alloc.acquire_session().unwrap(), 10);
    }

    #[test]
    fn modify_panic_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut o = options(dir.path());
        o.panic_on_modify(3);
        let alloc = SegAllocator::open(&o, Metrics::new(false)).unwrap();
        let fired: Vec<bool> = (0..6).map(|_| alloc.take_modify_panic()).collect();
        assert_eq!(fired, vec![false, false, true, false, false, false]);
    }
}
