//! Allocation sessions, read locks and object references.
//!
//! A session is the per-thread handle on the allocator: it owns an epoch slot, an active segment
//! to bump-allocate from, and a read sampler. While a [`ReadLock`] is held the session's epoch slot
//! is published, so no segment the session may be looking at is recycled.

use std::{
    cell::{Cell, RefCell, RefMut},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam::utils::Backoff;
use segtrie_core::{
    location::object_capacity,
    meta::{COPY_MASK, MAX_REF_COUNT, MODIFY_MASK, READ_MASK},
    node::{checksum, NodeHeader, NodeView},
    IdAddress, IdRegion, MetaWord, NodeLocation, NodeType,
};

use super::{read_stats::ReadSampler, SegAllocator, SEGMENT_HEADER_SIZE};
use crate::{error::Error, metrics::Metric};

/// Allocations made from one region before a session moves on to the next.
const REGION_BATCH: u32 = 64;

/// A bump allocator over one active segment at a time.
pub(crate) struct AllocCursor {
    segment: Option<u32>,
    pos: u32,
}

impl AllocCursor {
    pub fn new() -> Self {
        AllocCursor {
            segment: None,
            pos: 0,
        }
    }

    /// Allocate `capacity` bytes, sealing the current segment and taking a new one if needed.
    pub fn alloc(&mut self, alloc: &SegAllocator, capacity: usize) -> Result<NodeLocation, Error> {
        let segment_size = alloc.segment_size();
        let max = (segment_size - SEGMENT_HEADER_SIZE as u64) as usize;
        if capacity > max {
            return Err(Error::ValueTooLarge {
                len: capacity,
                max,
            });
        }
        loop {
            if let Some(seg) = self.segment {
                if self.pos as u64 + capacity as u64 <= segment_size {
                    let loc = NodeLocation::from_segment(seg, self.pos, segment_size);
                    self.pos += capacity as u32;
                    alloc.meta(seg).alloc_end.store(self.pos, Ordering::Release);
                    return Ok(loc);
                }
                alloc.seal_segment(seg, self.pos);
                self.segment = None;
            }
            self.segment = Some(alloc.new_segment()?);
            self.pos = SEGMENT_HEADER_SIZE;
        }
    }

    /// Give back an allocation nobody else has seen. The most recent one is simply rolled back;
    /// anything older is accounted as freed.
    pub fn unalloc(&mut self, alloc: &SegAllocator, loc: NodeLocation, capacity: usize) {
        let segment_size = alloc.segment_size();
        let seg = loc.segment(segment_size);
        let end = loc.offset_in_segment(segment_size) + capacity as u32;
        if self.segment == Some(seg) && end == self.pos {
            self.pos -= capacity as u32;
            alloc.meta(seg).alloc_end.store(self.pos, Ordering::Release);
        } else {
            alloc.free_object(loc, capacity);
        }
    }

    pub fn seal(&mut self, alloc: &SegAllocator) {
        if let Some(seg) = self.segment.take() {
            alloc.seal_segment(seg, self.pos);
        }
    }
}

/// A thread's handle on the allocator. Not `Sync`: one thread uses it at a time.
pub struct AllocSession {
    alloc: Arc<SegAllocator>,
    slot: usize,
    nested: Cell<u32>,
    cursor: RefCell<AllocCursor>,
    sampler: RefCell<ReadSampler>,
    region: Cell<IdRegion>,
    region_left: Cell<u32>,
}

impl AllocSession {
    /// Take a session slot. Fails with [`Error::TooManySessions`] when none is free.
    pub fn new(alloc: Arc<SegAllocator>) -> Result<Self, Error> {
        let slot = alloc.acquire_session()?;
        let sampler = ReadSampler::new(alloc.read_sample_difficulty);
        Ok(AllocSession {
            alloc,
            slot,
            nested: Cell::new(0),
            cursor: RefCell::new(AllocCursor::new()),
            sampler: RefCell::new(sampler),
            region: Cell::new(IdRegion(0)),
            region_left: Cell::new(0),
        })
    }

    pub fn allocator(&self) -> &Arc<SegAllocator> {
        &self.alloc
    }

    /// Enter the session's epoch. Read locks nest; only the outermost one publishes the epoch.
    pub fn lock(&self) -> ReadLock<'_> {
        let nested = self.nested.get();
        if nested == 0 {
            self.alloc.gc.enter(self.slot);
        }
        self.nested.set(nested + 1);
        ReadLock { session: self }
    }

    /// Seal the session's active segment, if any.
    pub fn seal(&self) {
        self.cursor.borrow_mut().seal(&self.alloc);
    }

    pub(crate) fn cursor(&self) -> RefMut<'_, AllocCursor> {
        self.cursor.borrow_mut()
    }

    fn next_region(&self) -> IdRegion {
        let left = self.region_left.get();
        if left == 0 {
            self.region.set(self.alloc.ids.next_region());
            self.region_left.set(REGION_BATCH - 1);
        } else {
            self.region_left.set(left - 1);
        }
        self.region.get()
    }
}

impl Drop for AllocSession {
    fn drop(&mut self) {
        self.seal();
        self.alloc.release_session(self.slot);
    }
}

/// Proof that the owning session's epoch is published. Node bytes obtained through it stay valid
/// until it is dropped.
pub struct ReadLock<'s> {
    session: &'s AllocSession,
}

impl Drop for ReadLock<'_> {
    fn drop(&mut self) {
        let nested = self.session.nested.get() - 1;
        self.session.nested.set(nested);
        if nested == 0 {
            self.session.alloc.gc.exit(self.session.slot);
        }
    }
}

impl<'s> ReadLock<'s> {
    pub fn allocator(&self) -> &'s SegAllocator {
        &self.session.alloc
    }

    pub(crate) fn session(&self) -> &'s AllocSession {
        self.session
    }

    /// A reference to the object `id`. Panics if the id lies outside of the id table.
    pub fn get(&self, id: IdAddress) -> ObjectRef<'_> {
        ObjectRef {
            session: self.session,
            id,
            meta: self.session.alloc.ids.get(id),
        }
    }

    pub fn retain(&self, id: IdAddress) -> Result<(), Error> {
        self.get(id).retain()
    }

    /// Allocate a new object of `size` bytes and write it with `write`, which receives exactly
    /// `size` bytes and the new id. The object starts with one reference.
    pub fn alloc_node(
        &self,
        size: usize,
        node_type: NodeType,
        write: impl FnOnce(&mut [u8], IdAddress),
    ) -> Result<IdAddress, Error> {
        let alloc = &*self.session.alloc;
        let region = self.session.next_region();
        let (id, meta) = alloc.ids.alloc(region)?;
        let loc = match self.write_object(size, id, write) {
            Ok(loc) => loc,
            Err(e) => {
                alloc.ids.free(id);
                return Err(e);
            }
        };
        meta.store(MetaWord::new(node_type, loc).0, Ordering::Release);
        Ok(id)
    }

    /// Replace the contents of `id` with a new object written at a fresh location. The old
    /// location is accounted as freed. Only valid while the caller is the object's sole owner.
    pub fn realloc_node(
        &self,
        id: IdAddress,
        size: usize,
        node_type: NodeType,
        write: impl FnOnce(&mut [u8], IdAddress),
    ) -> Result<(), Error> {
        let alloc = &*self.session.alloc;
        let _guard = alloc.location_mutex.lock(id.to_u64());
        let meta = alloc.ids.get(id);
        let loc = self.write_object(size, id, write)?;

        let mut prior = MetaWord(meta.load(Ordering::Acquire));
        loop {
            let next = prior
                .with_location(loc)
                .with_type(node_type)
                .with_copying(false);
            match meta.compare_exchange_weak(prior.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => prior = MetaWord(actual),
            }
        }
        let old_capacity = object_capacity(alloc.node_bytes(prior.location()).len());
        alloc.free_object(prior.location(), old_capacity);
        Ok(())
    }

    fn write_object(
        &self,
        size: usize,
        id: IdAddress,
        write: impl FnOnce(&mut [u8], IdAddress),
    ) -> Result<NodeLocation, Error> {
        let alloc = &*self.session.alloc;
        let capacity = object_capacity(size);
        let loc = self.session.cursor().alloc(alloc, capacity)?;
        // SAFETY: the range was just allocated and is not reachable from any meta word yet.
        let out = unsafe { alloc.object_bytes_mut(loc, capacity) };
        let (node, padding) = out.split_at_mut(size);
        write(node, id);
        padding.fill(0);
        debug_assert_eq!(NodeHeader::new(node).size(), size);
        debug_assert_eq!(NodeHeader::new(node).id(), id);
        if alloc.update_checksums {
            checksum::update(node);
        }
        alloc.metrics.count(Metric::NodeAllocations);
        Ok(loc)
    }

    /// Drop one reference to `id`, tearing down every object that loses its last reference.
    pub fn release_node(&self, id: IdAddress) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if let Some(view) = self.get(id).release() {
                view.visit_branches(|child| stack.push(child));
            }
        }
    }
}

/// The outcome of [`ObjectRef::try_move`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveResult {
    Success,
    /// The object was relocated by somebody else in the meantime.
    Moved,
    /// The object lost its last reference in the meantime.
    Freed,
}

/// A handle on one object's meta word, valid for the duration of a read lock.
pub struct ObjectRef<'l> {
    session: &'l AllocSession,
    id: IdAddress,
    meta: &'l AtomicU64,
}

impl<'l> ObjectRef<'l> {
    /// A fresh snapshot of the meta word.
    pub fn meta(&self) -> MetaWord {
        MetaWord(self.meta.load(Ordering::Acquire))
    }

    pub fn ref_count(&self) -> u64 {
        self.meta().ref_count()
    }

    fn allocator(&self) -> &'l SegAllocator {
        &self.session.alloc
    }

    /// Add a reference. Fails, leaving the count unchanged, if it is already at the maximum.
    pub fn retain(&self) -> Result<(), Error> {
        let prior = MetaWord(self.meta.fetch_add(1, Ordering::Relaxed));
        if prior.ref_count() >= MAX_REF_COUNT {
            self.meta.fetch_sub(1, Ordering::Relaxed);
            self.allocator().metrics.count(Metric::RetainOverflows);
            return Err(Error::RefCountOverflow(self.id));
        }
        if prior.ref_count() == 0 {
            panic!("corrupt reference: retained freed object {}", self.id);
        }
        Ok(())
    }

    /// Drop a reference. If it was the last one, the object's space and id are freed and its
    /// former contents returned so the caller can release what it referenced.
    pub fn release(&self) -> Option<NodeView<'l>> {
        let prior = MetaWord(self.meta.fetch_sub(1, Ordering::AcqRel));
        match prior.ref_count() {
            0 => panic!("corrupt reference: released freed object {}", self.id),
            1 => {
                let alloc = self.allocator();
                let bytes = alloc.node_bytes(prior.location());
                alloc.free_object(prior.location(), object_capacity(bytes.len()));
                alloc.ids.free(self.id);
                alloc.metrics.count(Metric::NodeFrees);
                Some(NodeView::new(bytes))
            }
            _ => None,
        }
    }

    /// The object's node, resolved through its current location.
    pub fn view(&self) -> NodeView<'l> {
        let word = self.meta();
        if word.ref_count() == 0 {
            panic!("corrupt reference: read freed object {}", self.id);
        }
        let alloc = self.allocator();
        let bytes = alloc.node_bytes(word.location());
        let header = NodeHeader::new(bytes);
        if header.id() != self.id {
            panic!(
                "corrupt node: object {} resolves to a node of {}",
                self.id,
                header.id()
            );
        }
        if alloc.validate_checksums && !word.is_changing() && !checksum::verify(bytes) {
            tracing::error!(id = %self.id, location = ?word.location(), "checksum mismatch");
            panic!("corrupt node: checksum mismatch for object {}", self.id);
        }
        if self.session.sampler.borrow_mut().sample() {
            self.meta.fetch_or(READ_MASK, Ordering::Relaxed);
            alloc.record_read(self.session.slot, word.location(), bytes.len());
        }
        NodeView::new(bytes)
    }

    /// Claim the object for relocation from `expected`. Fails if it was freed, moved, or is being
    /// modified or moved already.
    pub fn try_start_move(&self, expected: NodeLocation) -> bool {
        let mut current = self.meta();
        loop {
            if current.ref_count() == 0
                || current.location() != expected
                || current.is_changing()
                || current.is_copying()
            {
                return false;
            }
            match self.meta.compare_exchange_weak(
                current.0,
                current.with_copying(true).0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = MetaWord(actual),
            }
        }
    }

    /// Give up a relocation claimed with [`Self::try_start_move`].
    pub fn end_move(&self) {
        self.meta.fetch_and(!COPY_MASK, Ordering::AcqRel);
    }

    /// Point the object at `to` if it is still at `from` and claimed for relocation.
    pub fn try_move(&self, from: NodeLocation, to: NodeLocation) -> MoveResult {
        let mut current = self.meta();
        loop {
            if current.ref_count() == 0 {
                return MoveResult::Freed;
            }
            if current.location() != from || !current.is_copying() {
                return MoveResult::Moved;
            }
            let next = current
                .with_location(to)
                .with_copying(false)
                .with_read(false);
            match self.meta.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return MoveResult::Success,
                Err(actual) => current = MetaWord(actual),
            }
        }
    }

    /// Lock the object for in-place modification.
    pub fn modify(&self) -> ModifyLock<'l> {
        ModifyLock::new(self.allocator(), self.id, self.meta)
    }
}

/// Exclusive in-place access to an object's bytes.
///
/// While held, the object's modify bit is set, which keeps the compactor from relocating it and
/// tells recovery the node may be torn. On drop the checksum is brought up to date and the bit is
/// cleared, except while unwinding: a panic mid-modification leaves the bit set.
pub struct ModifyLock<'l> {
    alloc: &'l SegAllocator,
    id: IdAddress,
    meta: &'l AtomicU64,
    loc: NodeLocation,
    capacity: usize,
}

impl<'l> ModifyLock<'l> {
    fn new(alloc: &'l SegAllocator, id: IdAddress, meta: &'l AtomicU64) -> Self {
        meta.fetch_or(MODIFY_MASK, Ordering::AcqRel);
        let backoff = Backoff::new();
        let mut word = MetaWord(meta.load(Ordering::Acquire));
        while word.is_copying() {
            backoff.snooze();
            word = MetaWord(meta.load(Ordering::Acquire));
        }
        let loc = word.location();
        let capacity = object_capacity(alloc.node_bytes(loc).len());
        alloc.sync_lock(loc).start_modify();
        ModifyLock {
            alloc,
            id,
            meta,
            loc,
            capacity,
        }
    }

    /// The whole allocated object, which may extend past the node's current size.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the modify bit gives exclusive access, and the object cannot move while set.
        unsafe { self.alloc.object_bytes_mut(self.loc, self.capacity) }
    }
}

impl Drop for ModifyLock<'_> {
    fn drop(&mut self) {
        let alloc = self.alloc;
        let sync = alloc.sync_lock(self.loc);
        if std::thread::panicking() {
            alloc.poison();
            sync.end_modify();
            return;
        }
        if alloc.take_modify_panic() {
            alloc.poison();
            sync.end_modify();
            panic!("simulated crash while modifying object {}", self.id);
        }
        let update = alloc.update_checksums;
        let bytes = self.bytes_mut();
        let size = NodeHeader::new(bytes).size();
        if update {
            checksum::update(&mut bytes[..size]);
        } else {
            checksum::clear(&mut bytes[..size]);
        }
        self.meta.fetch_and(!MODIFY_MASK, Ordering::Release);
        sync.end_modify();
    }
}
