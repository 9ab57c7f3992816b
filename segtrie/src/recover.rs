//! Startup repair after an unclean shutdown.
//!
//! A process that stops without shutting down cleanly can leave behind:
//!
//! - objects whose modify bit is still set, possibly torn halfway through an in-place edit;
//! - stale copy bits from relocations that never finished;
//! - reference counts that are too high, held by roots that only lived in memory;
//! - ids and segment space nobody refers to anymore.
//!
//! Recovery runs before any session exists. Changing objects that still verify or at least parse
//! are kept; torn ones are unlinked from every node that refers to them. Reference counts are then
//! recounted from the top roots, unreachable ids are freed and the freed bytes of every segment
//! are recomputed from the objects that survive.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use fxhash::{FxHashMap, FxHashSet};
use segtrie_core::{
    location::object_capacity,
    meta::{COPY_MASK, MODIFY_MASK},
    node::{
        binary::{binary_size, write_binary},
        checksum, InnerBuilder, InnerNodeMut, NodeHeader, NodeView,
    },
    IdAddress, MetaWord, NodeType,
};

use crate::seg_alloc::{AllocSession, ReadLock, SegAllocator, SegmentState, SEGMENT_HEADER_SIZE};

/// What recovery found and did.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Relocations that were in flight. The copies are discarded.
    pub abandoned_moves: u64,
    /// Objects marked as changing whose contents turned out complete.
    pub intact: Vec<IdAddress>,
    /// Objects marked as changing that were structurally sound. Their checksum was recomputed.
    pub repaired: Vec<IdAddress>,
    /// Torn objects, removed from every node referring to them along with what they held.
    pub unlinked: Vec<IdAddress>,
    /// Nodes rewritten to drop references to unlinked objects or to correct their key count.
    pub rewritten: u64,
    /// Top root slots cleared because their tree was lost.
    pub cleared_top_roots: u64,
    /// Objects whose reference count was corrected.
    pub recounted: u64,
    /// Ids freed because nothing referred to them.
    pub freed_ids: u64,
    pub live_ids: u64,
}

impl RecoveryReport {
    /// Whether recovery found nothing that was being modified.
    pub fn is_clean(&self) -> bool {
        self.intact.is_empty() && self.repaired.is_empty() && self.unlinked.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Lost, along with every reference to it.
    Gone,
    /// Kept, holding this many keys.
    Live(u64),
}

/// Repair the store behind `alloc`, whose trees are rooted at `top_roots`.
pub(crate) fn recover(
    alloc: &Arc<SegAllocator>,
    top_roots: &[&AtomicU64],
) -> anyhow::Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let broken = check_changing(alloc, &mut report);

    {
        let session = AllocSession::new(alloc.clone())?;
        let lock = session.lock();
        let mut walk = Settle {
            lock: &lock,
            broken: &broken,
            status: FxHashMap::default(),
            rewritten: 0,
        };
        for slot in top_roots {
            let root = IdAddress::from_u64(slot.load(Ordering::Acquire));
            if root.is_valid() && walk.settle(root)? == Status::Gone {
                slot.store(IdAddress::NULL.to_u64(), Ordering::Release);
                report.cleared_top_roots += 1;
            }
        }
        report.rewritten = walk.rewritten;
    }

    let refs = count_references(alloc, top_roots);
    let mut recounted = 0;
    let mut freed = 0;
    alloc.ids.for_each_id(|id, meta| {
        let word = MetaWord(meta.load(Ordering::Acquire));
        match refs.get(&id) {
            Some(&count) => {
                if word.ref_count() != count {
                    recounted += 1;
                    meta.store(word.with_ref_count(count).0, Ordering::Release);
                }
            }
            None if word.ref_count() > 0 => freed += 1,
            None => {}
        }
    });
    alloc.ids.rebuild_freelists(|id, _| refs.contains_key(&id));
    report.recounted = recounted;
    report.freed_ids = freed;
    report.live_ids = refs.len() as u64;

    recompute_freed_bytes(alloc, &refs);

    if report.is_clean() && report.freed_ids == 0 {
        tracing::info!(live_ids = report.live_ids, "recovery found nothing to repair");
    } else {
        tracing::warn!(
            intact = report.intact.len(),
            repaired = report.repaired.len(),
            unlinked = report.unlinked.len(),
            rewritten = report.rewritten,
            recounted = report.recounted,
            freed_ids = report.freed_ids,
            "recovered from unclean shutdown"
        );
    }
    Ok(report)
}

/// Clear copy bits and sort out every object left marked as changing. Returns the torn ones.
fn check_changing(alloc: &SegAllocator, report: &mut RecoveryReport) -> FxHashSet<IdAddress> {
    let mut broken = FxHashSet::default();
    alloc.ids.for_each_id(|id, meta| {
        let word = MetaWord(meta.load(Ordering::Acquire));
        if word.ref_count() == 0 {
            return;
        }
        if word.is_copying() {
            meta.fetch_and(!COPY_MASK, Ordering::AcqRel);
            report.abandoned_moves += 1;
        }
        if !word.is_changing() {
            return;
        }
        meta.fetch_and(!MODIFY_MASK, Ordering::AcqRel);

        let bytes = alloc
            .try_node_bytes(word.location())
            .filter(|bytes| NodeHeader::new(bytes).id() == id);
        match bytes {
            Some(bytes) if checksum::verify(bytes) && NodeView::is_well_formed(bytes) => {
                report.intact.push(id);
            }
            Some(bytes) if NodeView::is_well_formed(bytes) => {
                // SAFETY: no session exists yet, so nothing else can access the object.
                reseal(alloc, unsafe { alloc.object_bytes_mut(word.location(), bytes.len()) });
                tracing::warn!(%id, "repaired object left changing");
                report.repaired.push(id);
            }
            _ => {
                tracing::warn!(%id, location = ?word.location(), "unlinking torn object");
                report.unlinked.push(id);
                broken.insert(id);
            }
        }
    });
    broken
}

/// Drops references to torn objects, bottom up, and brings key counts in line.
struct Settle<'a, 'l> {
    lock: &'a ReadLock<'l>,
    broken: &'a FxHashSet<IdAddress>,
    status: FxHashMap<IdAddress, Status>,
    rewritten: u64,
}

impl Settle<'_, '_> {
    fn settle(&mut self, root: IdAddress) -> anyhow::Result<Status> {
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if self.status.contains_key(&id) {
                continue;
            }
            if self.broken.contains(&id) {
                self.status.insert(id, Status::Gone);
                continue;
            }
            if !expanded {
                stack.push((id, true));
                self.lock.get(id).view().visit_branches(|child| {
                    if !self.status.contains_key(&child) {
                        stack.push((child, false));
                    }
                });
                continue;
            }
            let status = self.settle_node(id)?;
            self.status.insert(id, status);
        }
        Ok(self.status[&root])
    }

    fn child(&self, id: IdAddress) -> Status {
        if !id.is_valid() {
            return Status::Live(0);
        }
        self.status.get(&id).copied().unwrap_or(Status::Gone)
    }

    /// Settle a node whose children are all settled.
    fn settle_node(&mut self, id: IdAddress) -> anyhow::Result<Status> {
        let lock = self.lock;
        match lock.get(id).view() {
            NodeView::Value(_) => Ok(Status::Live(0)),
            NodeView::Binary(node) => {
                let mut entries = node.entries();
                entries.retain(|e| e.value.child_id().map_or(true, |c| self.child(c) != Status::Gone));
                if entries.len() == node.num_entries() {
                    return Ok(Status::Live(entries.len() as u64));
                }
                if entries.is_empty() {
                    return Ok(Status::Gone);
                }
                lock.realloc_node(id, binary_size(&entries), NodeType::Binary, |out, id| {
                    write_binary(out, id, &entries)
                })?;
                self.rewritten += 1;
                Ok(Status::Live(entries.len() as u64))
            }
            NodeView::Inner(node) => {
                let mut builder = InnerBuilder::from_node(&node);
                let mut changed = false;
                if let Some(eof) = node.eof().and_then(|eof| eof.child_id()) {
                    if self.child(eof) == Status::Gone {
                        builder.eof = None;
                        changed = true;
                    }
                }
                let mut descendants = builder.eof.is_some() as u64;
                for (byte, child) in node.branches() {
                    match self.child(child) {
                        Status::Gone => {
                            builder.remove_branch(byte);
                            changed = true;
                        }
                        Status::Live(n) => descendants += n,
                    }
                }
                if builder.eof.is_none() && builder.num_branches() == 0 {
                    return Ok(Status::Gone);
                }
                if changed {
                    builder.descendants = descendants;
                    lock.realloc_node(id, builder.size(), builder.node_type(), |out, id| {
                        builder.write(out, id)
                    })?;
                    self.rewritten += 1;
                } else if descendants != node.descendants() {
                    let loc = lock.get(id).meta().location();
                    let size = node.bytes().len();
                    // SAFETY: recovery runs before any other session exists.
                    let out = unsafe { lock.allocator().object_bytes_mut(loc, size) };
                    InnerNodeMut::new(out)
                        .add_descendants(descendants as i64 - node.descendants() as i64);
                    reseal(lock.allocator(), out);
                    self.rewritten += 1;
                }
                Ok(Status::Live(descendants))
            }
        }
    }
}

fn reseal(alloc: &SegAllocator, node: &mut [u8]) {
    if alloc.update_checksums {
        checksum::update(node);
    } else {
        checksum::clear(node);
    }
}

/// Count the references to every object reachable from the top roots.
fn count_references(alloc: &SegAllocator, top_roots: &[&AtomicU64]) -> FxHashMap<IdAddress, u64> {
    let mut refs: FxHashMap<IdAddress, u64> = FxHashMap::default();
    let mut stack: Vec<IdAddress> = top_roots
        .iter()
        .map(|slot| IdAddress::from_u64(slot.load(Ordering::Acquire)))
        .filter(|id| id.is_valid())
        .collect();
    while let Some(id) = stack.pop() {
        let count = refs.entry(id).or_insert(0);
        *count += 1;
        if *count > 1 {
            continue;
        }
        let word = MetaWord(alloc.ids.get(id).load(Ordering::Acquire));
        NodeView::new(alloc.node_bytes(word.location())).visit_branches(|child| stack.push(child));
    }
    refs
}

/// Recompute the freed bytes of every segment in use from the surviving objects, and seal
/// segments that were active when the process stopped.
fn recompute_freed_bytes(alloc: &SegAllocator, live: &FxHashMap<IdAddress, u64>) {
    let segment_size = alloc.segment_size();
    let mut used = vec![0u64; alloc.num_segments() as usize];
    for id in live.keys() {
        let word = MetaWord(alloc.ids.get(*id).load(Ordering::Acquire));
        let size = alloc.node_bytes(word.location()).len();
        used[word.location().segment(segment_size) as usize] += object_capacity(size) as u64;
    }
    for (seg, used) in used.into_iter().enumerate() {
        let meta = alloc.meta(seg as u32);
        match meta.state() {
            SegmentState::Free => continue,
            SegmentState::Active => meta.set_state(SegmentState::Sealed),
            _ => {}
        }
        let freed = segment_size - SEGMENT_HEADER_SIZE as u64 - used;
        meta.freed_bytes.store(freed, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metrics::Metrics, options::Options};
    use segtrie_core::node::{value::value_node_size, BinaryEntry, ValueRef};

    fn open(dir: &std::path::Path) -> Arc<SegAllocator> {
        let mut o = Options::new();
        o.path(dir);
        o.segment_size(1 << 20);
        o.max_segments(8);
        Arc::new(SegAllocator::open(&o, Metrics::new(false)).unwrap())
    }

    fn binary(lock: &ReadLock, entries: &[BinaryEntry]) -> IdAddress {
        lock.alloc_node(binary_size(entries), NodeType::Binary, |out, id| {
            write_binary(out, id, entries)
        })
        .unwrap()
    }

    #[test]
    fn unreachable_objects_are_freed() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = open(dir.path());
        let slot = AtomicU64::new(0);
        {
            let session = AllocSession::new(alloc.clone()).unwrap();
            let lock = session.lock();
            let kept = binary(&lock, &[BinaryEntry { key: b"k", value: ValueRef::Inline(b"v") }]);
            // an extra reference held by a root that no longer exists.
            lock.retain(kept).unwrap();
            binary(&lock, &[BinaryEntry { key: b"lost", value: ValueRef::Inline(b"x") }]);
            slot.store(kept.to_u64(), Ordering::Release);
        }

        let report = recover(&alloc, &[&slot]).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.freed_ids, 1);
        assert_eq!(report.recounted, 1);
        assert_eq!(report.live_ids, 1);
        assert_eq!(alloc.ids.live_ids(), 1);
        let kept = IdAddress::from_u64(slot.load(Ordering::Acquire));
        assert_eq!(MetaWord(alloc.ids.get(kept).load(Ordering::Acquire)).ref_count(), 1);
    }

    #[test]
    fn torn_objects_are_unlinked() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = open(dir.path());
        let slot = AtomicU64::new(0);
        let value;
        {
            let session = AllocSession::new(alloc.clone()).unwrap();
            let lock = session.lock();
            value = lock
                .alloc_node(value_node_size(100), NodeType::Value, |out, id| {
                    segtrie_core::node::value::write_value_node(out, id, &[1; 100])
                })
                .unwrap();
            let root = binary(
                &lock,
                &[
                    BinaryEntry { key: b"a", value: ValueRef::Inline(b"1") },
                    BinaryEntry { key: b"b", value: ValueRef::Node(value) },
                ],
            );
            slot.store(root.to_u64(), Ordering::Release);

            // tear the value node: mark it changing and break its header.
            let word = MetaWord(alloc.ids.get(value).load(Ordering::Acquire));
            alloc.ids.get(value).fetch_or(MODIFY_MASK, Ordering::AcqRel);
            // SAFETY: nothing else accesses the object.
            let out = unsafe { alloc.object_bytes_mut(word.location(), 16) };
            out[8..16].fill(0xff);
        }

        let report = recover(&alloc, &[&slot]).unwrap();
        assert_eq!(report.unlinked, vec![value]);
        assert_eq!(report.rewritten, 1);
        assert_eq!(report.live_ids, 1);

        let root = IdAddress::from_u64(slot.load(Ordering::Acquire));
        let session = AllocSession::new(alloc.clone()).unwrap();
        let lock = session.lock();
        match lock.get(root).view() {
            NodeView::Binary(node) => {
                assert_eq!(node.num_entries(), 1);
                assert_eq!(node.key(0), b"a");
            }
            _ => panic!("expected a binary root"),
        }
    }

    #[test]
    fn stale_checksums_are_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = open(dir.path());
        let slot = AtomicU64::new(0);
        let root;
        {
            let session = AllocSession::new(alloc.clone()).unwrap();
            let lock = session.lock();
            root = binary(&lock, &[BinaryEntry { key: b"k", value: ValueRef::Inline(b"old") }]);
            slot.store(root.to_u64(), Ordering::Release);

            let word = MetaWord(alloc.ids.get(root).load(Ordering::Acquire));
            alloc.ids.get(root).fetch_or(MODIFY_MASK, Ordering::AcqRel);
            let size = alloc.node_bytes(word.location()).len();
            // SAFETY: nothing else accesses the object.
            let out = unsafe { alloc.object_bytes_mut(word.location(), size) };
            assert!(segtrie_core::node::binary::set_inline_value_in_place(out, 0, b"new"));
        }

        let report = recover(&alloc, &[&slot]).unwrap();
        assert_eq!(report.repaired, vec![root]);
        assert!(report.unlinked.is_empty());
        let word = MetaWord(alloc.ids.get(root).load(Ordering::Acquire));
        assert!(!word.is_changing());
        assert!(checksum::verify(alloc.node_bytes(word.location())));
    }
}
