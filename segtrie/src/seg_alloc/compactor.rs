//! Relocation of live objects out of sparse segments.
//!
//! The compactor walks the node headers of a claimed segment and moves every object whose meta
//! word still points there. Objects recently sampled by readers go to a separate "hot" segment so
//! that frequently read data ends up packed together. A move only succeeds if the object was not
//! modified, relocated or freed while it was copied; a segment with objects left behind goes back
//! to the sealed pool to be retried later.

use std::sync::Arc;

use segtrie_core::{
    location::object_capacity,
    node::{checksum, NodeHeader},
    IdAddress, MetaWord, NodeLocation, NodeType,
};

use super::{
    session::{AllocCursor, AllocSession, MoveResult, ReadLock},
    SegAllocator, SegmentState,
};
use crate::{error::Error, metrics::Metric};

pub struct Compactor {
    session: AllocSession,
    hot: AllocCursor,
}

enum Relocation {
    /// The object no longer lives at the scanned location.
    Gone,
    Moved,
    /// The object is busy; it stays where it is for now.
    Skipped,
}

impl Compactor {
    pub fn new(alloc: Arc<SegAllocator>) -> Result<Self, Error> {
        Ok(Compactor {
            session: AllocSession::new(alloc)?,
            hot: AllocCursor::new(),
        })
    }

    fn allocator(&self) -> Arc<SegAllocator> {
        self.session.allocator().clone()
    }

    /// Compact the segment most worth compacting, if any qualifies. Returns whether a segment was
    /// fully vacated.
    pub fn compact_next_segment(&mut self) -> Result<bool, Error> {
        let alloc = self.allocator();
        alloc.aggregate_reads();
        let Some(seg) = alloc.claim_compaction_candidate() else {
            return Ok(false);
        };

        let _timer = alloc.metrics.record(Metric::CompactionTime);
        match self.compact_segment(&alloc, seg) {
            Ok(0) => {
                alloc.meta(seg).set_state(SegmentState::Pending);
                // the read lock is gone, so waiting on a full queue cannot wait on ourselves.
                let ready = alloc.gc.push(seg);
                alloc.recycle(ready);
                alloc.metrics.count(Metric::CompactedSegments);
                tracing::debug!(segment = seg, "vacated segment");
                Ok(true)
            }
            Ok(skipped) => {
                alloc.meta(seg).set_state(SegmentState::Sealed);
                tracing::debug!(segment = seg, skipped, "compaction left objects behind");
                Ok(false)
            }
            Err(e) => {
                alloc.meta(seg).set_state(SegmentState::Sealed);
                Err(e)
            }
        }
    }

    /// Move every live object out of `seg`. Returns the number of objects left behind.
    fn compact_segment(&mut self, alloc: &SegAllocator, seg: u32) -> Result<usize, Error> {
        let Compactor { session, hot } = self;
        let lock = session.lock();

        let mut objects: Vec<(NodeLocation, IdAddress, usize)> = Vec::new();
        alloc.scan_segment(seg, |loc, bytes| {
            objects.push((loc, NodeHeader::new(bytes).id(), object_capacity(bytes.len())));
        });

        let mut skipped = 0;
        for (loc, id, capacity) in objects {
            let Some(meta) = alloc.ids.try_get(id) else {
                continue;
            };
            let word = MetaWord(meta.load(std::sync::atomic::Ordering::Acquire));
            if word.ref_count() == 0
                || word.node_type() == NodeType::Freelist
                || word.location() != loc
            {
                continue;
            }
            let mut cold;
            let cursor = if word.is_read() {
                &mut *hot
            } else {
                cold = session.cursor();
                &mut *cold
            };
            match relocate(&lock, cursor, id, loc, capacity)? {
                Relocation::Skipped => skipped += 1,
                Relocation::Moved | Relocation::Gone => {}
            }
        }
        Ok(skipped)
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        let alloc = self.allocator();
        self.hot.seal(&alloc);
    }
}

fn relocate(
    lock: &ReadLock,
    cursor: &mut AllocCursor,
    id: IdAddress,
    from: NodeLocation,
    capacity: usize,
) -> Result<Relocation, Error> {
    let alloc = lock.allocator();
    let Some(_guard) = alloc.location_mutex.try_lock(id.to_u64()) else {
        alloc.metrics.count(Metric::MoveConflicts);
        return Ok(Relocation::Skipped);
    };
    let obj = lock.get(id);
    if !obj.try_start_move(from) {
        let word = obj.meta();
        if word.ref_count() > 0 && word.location() == from {
            alloc.metrics.count(Metric::MoveConflicts);
            return Ok(Relocation::Skipped);
        }
        return Ok(Relocation::Gone);
    }

    let to = match cursor.alloc(alloc, capacity) {
        Ok(to) => to,
        Err(e) => {
            obj.end_move();
            return Err(e);
        }
    };
    let src = alloc.node_bytes(from);
    if !checksum::verify(src) {
        tracing::error!(%id, location = ?from, "checksum mismatch during compaction");
        panic!("corrupt node: checksum mismatch for object {id} during compaction");
    }
    // SAFETY: `to` was just allocated and is not reachable from any meta word yet.
    let dst = unsafe { alloc.object_bytes_mut(to, capacity) };
    dst[..src.len()].copy_from_slice(src);
    dst[src.len()..].fill(0);

    match obj.try_move(from, to) {
        MoveResult::Success => {
            alloc.free_object(from, capacity);
            alloc.metrics.count(Metric::MovedObjects);
            alloc.metrics.count(Metric::NodeAllocations);
            Ok(Relocation::Moved)
        }
        MoveResult::Moved | MoveResult::Freed => {
            cursor.unalloc(alloc, to, capacity);
            Ok(Relocation::Gone)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metrics::Metrics, options::Options};
    use segtrie_core::node::value::{value_node_size, write_value_node};
    use std::sync::atomic::Ordering;

    fn open(dir: &std::path::Path) -> Arc<SegAllocator> {
        let mut o = Options::new();
        o.path(dir);
        o.segment_size(1 << 20);
        o.max_segments(8);
        o.read_sample_difficulty(0);
        Arc::new(SegAllocator::open(&o, Metrics::new(true)).unwrap())
    }

    fn value(session: &AllocSession, bytes: &[u8]) -> IdAddress {
        let lock = session.lock();
        lock.alloc_node(value_node_size(bytes.len()), NodeType::Value, |out, id| {
            write_value_node(out, id, bytes)
        })
        .unwrap()
    }

    fn read(session: &AllocSession, id: IdAddress) -> Vec<u8> {
        let lock = session.lock();
        let value = match lock.get(id).view() {
            segtrie_core::node::NodeView::Value(v) => v.value().to_vec(),
            _ => panic!("expected a value node"),
        };
        value
    }

    #[test]
    fn moves_live_objects_and_vacates() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = open(dir.path());
        let session = AllocSession::new(alloc.clone()).unwrap();

        let ids: Vec<IdAddress> = (0..100u32)
            .map(|i| value(&session, &i.to_le_bytes().repeat(100)))
            .collect();
        // free most of them so the segment qualifies.
        for id in &ids[10..] {
            session.lock().release_node(*id);
        }
        session.seal();
        let seg = MetaWord(alloc.ids.get(ids[0]).load(Ordering::Acquire))
            .location()
            .segment(alloc.segment_size());

        let mut compactor = Compactor::new(alloc.clone()).unwrap();
        assert!(compactor.compact_next_segment().unwrap());
        assert_eq!(alloc.metrics.count_of(Metric::MovedObjects), 10);
        assert_ne!(alloc.meta(seg).state(), SegmentState::Sealed);

        for (i, id) in ids[..10].iter().enumerate() {
            assert_eq!(read(&session, *id), (i as u32).to_le_bytes().repeat(100));
            let loc = MetaWord(alloc.ids.get(*id).load(Ordering::Acquire)).location();
            assert_ne!(loc.segment(alloc.segment_size()), seg);
        }

        // nothing observes the old segment, so it can be recycled.
        alloc.reclaim();
        assert_eq!(alloc.meta(seg).state(), SegmentState::Free);
        assert_eq!(std::fs::metadata(alloc.segment_path(seg)).unwrap().len(), 0);
    }

    #[test]
    fn modified_objects_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = open(dir.path());
        let session = AllocSession::new(alloc.clone()).unwrap();
        let keep = value(&session, b"held");
        let gone = value(&session, &[0; 1000]);
        session.lock().release_node(gone);
        session.seal();

        let mut compactor = Compactor::new(alloc.clone()).unwrap();
        {
            let lock = session.lock();
            let obj = lock.get(keep);
            let _modify = obj.modify();
            assert!(!compactor.compact_next_segment().unwrap());
        }
        assert!(compactor.compact_next_segment().unwrap());
        assert_eq!(read(&session, keep), b"held");
    }

    #[test]
    fn readers_delay_recycling() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = open(dir.path());
        let session = AllocSession::new(alloc.clone()).unwrap();
        let reader = AllocSession::new(alloc.clone()).unwrap();
        let id = value(&session, b"v");
        let junk = value(&session, &[1; 4000]);
        session.lock().release_node(junk);
        session.seal();

        let held = reader.lock();
        let before = held.get(id).view().bytes().as_ptr();
        let mut compactor = Compactor::new(alloc.clone()).unwrap();
        assert!(compactor.compact_next_segment().unwrap());
        assert_eq!(alloc.reclaim(), 0);
        // the old copy is still mapped for the reader.
        // SAFETY: the reader's lock keeps the segment mapped.
        assert_eq!(unsafe { *before.add(16) }, b'v');
        drop(held);
        assert_eq!(alloc.reclaim(), 1);
    }
}
