//! Opening, sharing and shutting down a store.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use segtrie_core::IdAddress;

use crate::{
    error::Error,
    flock::Flock,
    mapping::MappedFile,
    metrics::Metrics,
    options::{Options, SyncMode},
    recover::{recover, RecoveryReport},
    seg_alloc::{AllocSession, Compactor, ReadLock, SegAllocator, SegmentState},
    session::{ReadSession, WriteSession},
};

/// The number of persistent top root slots.
pub const NUM_TOP_ROOTS: usize = 488;

const HEADER_MAGIC: u64 = u64::from_le_bytes(*b"SGTRIEDB");
const HEADER_VERSION: u32 = 1;
const HEADER_LEN: usize = 4096;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 8;
const CLEAN_OFFSET: usize = 12;
const TOP_ROOTS_OFFSET: usize = 64;

/// How long the compactor thread sleeps when there is nothing to do.
const COMPACT_IDLE: Duration = Duration::from_millis(50);

/// State shared by the database, its sessions and every root.
pub(crate) struct Shared {
    pub(crate) alloc: Arc<SegAllocator>,
    header: MappedFile,
    /// Serializes transactions per top root.
    transaction_locks: Box<[Arc<Mutex<()>>]>,
    /// Serializes reads and swaps of a top root slot against each other.
    slot_locks: Box<[Mutex<()>]>,
    /// Releases references held by roots, which may be dropped on any thread.
    release: Mutex<Option<AllocSession>>,
    compactor: Mutex<Option<Compactor>>,
    sync_mode: SyncMode,
    recovery: Option<RecoveryReport>,
    _flock: Flock,
}

impl Shared {
    fn top_root(&self, index: usize) -> &AtomicU64 {
        top_root_slot(&self.header, index)
    }

    pub(crate) fn transaction_lock(&self, index: usize) -> Arc<Mutex<()>> {
        self.transaction_locks[index].clone()
    }

    /// Take a reference to the tree in slot `index` and return its id.
    pub(crate) fn load_top_root(&self, lock: &ReadLock, index: usize) -> Result<IdAddress, Error> {
        let _guard = self.slot_locks[index].lock();
        let id = IdAddress::from_u64(self.top_root(index).load(Ordering::Acquire));
        if id.is_valid() {
            lock.retain(id)?;
        }
        Ok(id)
    }

    /// Store `id`, whose reference the caller hands over, in slot `index`. Returns the previous
    /// id, whose reference passes to the caller.
    pub(crate) fn swap_top_root(&self, index: usize, id: IdAddress) -> IdAddress {
        let _guard = self.slot_locks[index].lock();
        let old = self.top_root(index).swap(id.to_u64(), Ordering::AcqRel);
        IdAddress::from_u64(old)
    }

    /// Release a reference owned by a root that is going away.
    ///
    /// Once an in-place modification was abandoned nothing is released anymore: the store is
    /// recovered on the next open, which recounts every reference.
    pub(crate) fn release_detached(&self, id: IdAddress) {
        if self.alloc.is_poisoned() {
            return;
        }
        let release = self.release.lock();
        match release.as_ref() {
            Some(session) => session.lock().release_node(id),
            None => tracing::error!(%id, "root released after shutdown"),
        }
    }

    fn flush(&self) -> std::io::Result<()> {
        self.alloc.flush(self.sync_mode)?;
        self.header.map.flush(self.sync_mode)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.compactor.get_mut().take();
        self.release.get_mut().take();
        if std::thread::panicking() || self.alloc.is_poisoned() {
            tracing::warn!("store left marked as unclean");
            return;
        }
        self.alloc.reclaim();

        // the clean mark must not reach the disk before the data it vouches for.
        let mode = match self.sync_mode {
            SyncMode::None => SyncMode::None,
            _ => SyncMode::Sync,
        };
        if let Err(e) = self.alloc.flush(mode) {
            tracing::warn!("failed to flush on shutdown: {e}");
            return;
        }
        self.header
            .map
            .atomic_u32(CLEAN_OFFSET)
            .store(1, Ordering::Release);
        if let Err(e) = self.header.map.flush(mode) {
            tracing::warn!("failed to flush header on shutdown: {e}");
        }
        tracing::debug!("closed store");
    }
}

fn top_root_slot(header: &MappedFile, index: usize) -> &AtomicU64 {
    assert!(index < NUM_TOP_ROOTS, "top root index {index} out of range");
    header.map.atomic_u64(TOP_ROOTS_OFFSET + index * 8)
}

/// Statistics about the space used by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbStats {
    pub total_segments: u32,
    pub free_segments: u32,
    pub sealed_segments: u32,
    pub live_ids: u64,
    /// Bytes freed in segments that are not free, waiting to be compacted.
    pub freed_bytes: u64,
    pub active_sessions: u32,
}

/// A handle on an open store.
///
/// Sessions and roots keep the store's state alive; it is shut down cleanly once the database
/// and all of them are dropped.
pub struct Database {
    shared: Arc<Shared>,
    compactor_thread: Option<(Sender<()>, JoinHandle<()>)>,
}

impl Database {
    /// Open the store at `o.path`, creating it if needed. A store that was not shut down cleanly
    /// is recovered first.
    pub fn open(o: Options) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&o.path)?;
        let flock = Flock::lock(&o.path, "LOCK")?;
        let metrics = Metrics::new(o.metrics);
        let alloc = Arc::new(SegAllocator::open(&o, metrics)?);

        let (header, created) = MappedFile::open(&o.path.join("db.header"), HEADER_LEN)?;
        let map = &header.map;
        if created || map.atomic_u64(MAGIC_OFFSET).load(Ordering::Acquire) == 0 {
            map.atomic_u32(VERSION_OFFSET)
                .store(HEADER_VERSION, Ordering::Relaxed);
            map.atomic_u32(CLEAN_OFFSET).store(1, Ordering::Relaxed);
            map.atomic_u64(MAGIC_OFFSET)
                .store(HEADER_MAGIC, Ordering::Release);
        } else {
            if map.atomic_u64(MAGIC_OFFSET).load(Ordering::Acquire) != HEADER_MAGIC {
                anyhow::bail!("db.header is not a store header");
            }
            let version = map.atomic_u32(VERSION_OFFSET).load(Ordering::Relaxed);
            if version != HEADER_VERSION {
                anyhow::bail!("unsupported store version {version}");
            }
        }

        let clean = map.atomic_u32(CLEAN_OFFSET).load(Ordering::Acquire) == 1;
        let recovery = if clean {
            alloc.seal_orphans();
            None
        } else {
            tracing::warn!(path = %o.path.display(), "store was not shut down cleanly, recovering");
            let slots: Vec<&AtomicU64> = (0..NUM_TOP_ROOTS)
                .map(|i| top_root_slot(&header, i))
                .collect();
            let report = recover(&alloc, &slots)?;
            alloc.flush(SyncMode::Sync)?;
            Some(report)
        };
        map.atomic_u32(CLEAN_OFFSET).store(0, Ordering::Release);
        map.flush(SyncMode::Sync)?;

        let release = AllocSession::new(alloc.clone())?;
        let compactor_thread = if o.compact_thread {
            Some(spawn_compactor(alloc.clone())?)
        } else {
            None
        };

        tracing::info!(
            path = %o.path.display(),
            segments = alloc.num_segments(),
            live_ids = alloc.ids.live_ids(),
            recovered = recovery.is_some(),
            "opened store"
        );

        Ok(Database {
            shared: Arc::new(Shared {
                alloc,
                header,
                transaction_locks: (0..NUM_TOP_ROOTS)
                    .map(|_| Arc::new(Mutex::new(())))
                    .collect(),
                slot_locks: (0..NUM_TOP_ROOTS).map(|_| Mutex::new(())).collect(),
                release: Mutex::new(Some(release)),
                compactor: Mutex::new(None),
                sync_mode: o.sync_mode,
                recovery,
                _flock: flock,
            }),
            compactor_thread,
        })
    }

    pub fn start_read_session(&self) -> Result<ReadSession, Error> {
        ReadSession::new(self.shared.clone())
    }

    pub fn start_write_session(&self) -> Result<WriteSession, Error> {
        WriteSession::new(self.shared.clone())
    }

    /// Compact the segment most worth compacting, if any. Returns whether a segment was vacated.
    ///
    /// Vacated segments are reused once no session can observe them anymore; see
    /// [`Self::reclaim`].
    pub fn compact_next_segment(&self) -> anyhow::Result<bool> {
        let mut compactor = self.shared.compactor.lock();
        if compactor.is_none() {
            *compactor = Some(Compactor::new(self.shared.alloc.clone())?);
        }
        // UNWRAP: set above.
        let vacated = compactor.as_mut().unwrap().compact_next_segment()?;
        if vacated {
            tracing::info!("compacted a segment");
        }
        Ok(vacated)
    }

    /// Return vacated segments no session can observe anymore to the free list. Returns how
    /// many were reclaimed.
    pub fn reclaim(&self) -> usize {
        self.shared.alloc.reclaim()
    }

    /// Flush segments and headers according to the configured sync mode.
    pub fn sync(&self) -> anyhow::Result<()> {
        self.shared.flush()?;
        Ok(())
    }

    pub fn stats(&self) -> DbStats {
        let alloc = &self.shared.alloc;
        let segments = alloc.segment_stats();
        let count = |state| segments.iter().filter(|s| s.state == state).count() as u32;
        DbStats {
            total_segments: segments.len() as u32,
            free_segments: count(SegmentState::Free),
            sealed_segments: count(SegmentState::Sealed),
            live_ids: alloc.ids.live_ids(),
            freed_bytes: segments
                .iter()
                .filter(|s| s.state != SegmentState::Free)
                .map(|s| s.freed_bytes)
                .sum(),
            active_sessions: alloc.active_sessions(),
        }
    }

    /// Per-segment statistics.
    pub fn segment_stats(&self) -> Vec<crate::SegmentStats> {
        self.shared.alloc.segment_stats()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.alloc.metrics
    }

    /// What recovery did when the store was opened, if it was not shut down cleanly.
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.shared.recovery.as_ref()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some((stop, handle)) = self.compactor_thread.take() {
            drop(stop);
            if handle.join().is_err() {
                tracing::error!("compactor thread panicked");
            }
        }
    }
}

fn spawn_compactor(alloc: Arc<SegAllocator>) -> anyhow::Result<(Sender<()>, JoinHandle<()>)> {
    let mut compactor = Compactor::new(alloc.clone())?;
    let (stop_tx, stop_rx) = channel::bounded::<()>(1);
    let handle = std::thread::Builder::new()
        .name("segtrie-compactor".to_string())
        .spawn(move || loop {
            let vacated = match compactor.compact_next_segment() {
                Ok(vacated) => vacated,
                Err(e) => {
                    tracing::warn!("background compaction failed: {e}");
                    false
                }
            };
            let reclaimed = alloc.reclaim();
            let idle = if vacated || reclaimed > 0 {
                Duration::ZERO
            } else {
                COMPACT_IDLE
            };
            channel::select! {
                recv(stop_rx) -> _ => break,
                default(idle) => {}
            }
        })?;
    Ok((stop_tx, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn options(dir: &std::path::Path) -> Options {
        let mut o = Options::new();
        o.path(dir);
        o.segment_size(1 << 20);
        o.max_segments(16);
        o.compact_thread(false);
        o
    }

    #[test]
    fn reopen_after_clean_shutdown_skips_recovery() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(options(dir.path())).unwrap();
            assert!(db.recovery_report().is_none());
        }
        let db = Database::open(options(dir.path())).unwrap();
        assert!(db.recovery_report().is_none());
    }

    #[test]
    fn header_layout() {
        let dir = tempfile::tempdir().unwrap();
        let read_header = || std::fs::read(dir.path().join("db.header")).unwrap();
        {
            let _db = Database::open(options(dir.path())).unwrap();
            let header = read_header();
            assert_eq!(header.len(), HEADER_LEN);
            assert_eq!(header[0..8], hex!("5347545249454442"));
            assert_eq!(header[8..12], hex!("01000000"));
            // marked unclean while open.
            assert_eq!(header[12..16], hex!("00000000"));
        }
        assert_eq!(read_header()[12..16], hex!("01000000"));
    }

    #[test]
    fn second_open_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let _db = Database::open(options(dir.path())).unwrap();
        assert!(Database::open(options(dir.path())).is_err());
    }

    #[test]
    fn top_roots_persist() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(options(dir.path())).unwrap();
            let ws = db.start_write_session().unwrap();
            let mut root = ws.create_root();
            ws.upsert(&mut root, b"key", b"value").unwrap();
            let old = ws.set_top_root(7, &root).unwrap();
            assert!(old.is_empty());
        }
        let db = Database::open(options(dir.path())).unwrap();
        let rs = db.start_read_session().unwrap();
        let root = rs.get_top_root(7).unwrap();
        assert_eq!(rs.get(&root, b"key"), Some(b"value".to_vec()));
        assert!(rs.get_top_root(8).unwrap().is_empty());
    }

    #[test]
    fn stats_count_live_ids() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(options(dir.path())).unwrap();
        assert_eq!(db.stats().live_ids, 0);
        let ws = db.start_write_session().unwrap();
        let mut root = ws.create_root();
        ws.upsert(&mut root, b"a", b"1").unwrap();
        let stats = db.stats();
        assert_eq!(stats.live_ids, 1);
        assert!(stats.total_segments >= 1);
        drop(root);
        assert_eq!(db.stats().live_ids, 0);
    }
}
