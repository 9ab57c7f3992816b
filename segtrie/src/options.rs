use std::path::PathBuf;

/// Options when opening a [`crate::Database`] instance.
#[derive(Clone)]
pub struct Options {
    /// The path to the directory where the store is kept.
    pub(crate) path: PathBuf,
    /// The size of every segment file. A power of two.
    pub(crate) segment_size: u64,
    /// The maximum number of segment files.
    pub(crate) max_segments: u32,
    /// Whether a background thread compacts sparse segments.
    pub(crate) compact_thread: bool,
    pub(crate) compact_threshold_percent: u8,
    /// A node access is sampled for read statistics with probability `1 / read_sample_difficulty`.
    pub(crate) read_sample_difficulty: u32,
    pub(crate) sync_mode: SyncMode,
    pub(crate) validate_checksums: bool,
    pub(crate) update_checksums: bool,
    pub(crate) gc_queue_capacity: usize,
    /// Enable or disable metrics collection.
    pub(crate) metrics: bool,
    pub(crate) panic_on_modify: Option<u64>,
}

impl Options {
    /// Create a new `Options` instance with the default values.
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("segtrie_db"),
            segment_size: 64 * 1024 * 1024,
            max_segments: 4096,
            compact_thread: true,
            compact_threshold_percent: 20,
            read_sample_difficulty: 16,
            sync_mode: SyncMode::None,
            validate_checksums: cfg!(debug_assertions),
            update_checksums: true,
            gc_queue_capacity: 1024,
            metrics: false,
            panic_on_modify: None,
        }
    }

    /// Set the path to the directory where the store is kept.
    pub fn path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    /// Set the size of each segment file in bytes.
    ///
    /// Must be a power of two, at least 1 MiB. Only applies when the store is created; an existing
    /// store keeps the size it was created with.
    ///
    /// Default: 64MiB.
    pub fn segment_size(&mut self, segment_size: u64) {
        assert!(segment_size.is_power_of_two());
        assert!(segment_size >= 1024 * 1024);
        self.segment_size = segment_size;
    }

    /// Set the maximum number of segments. Allocations fail with
    /// [`crate::Error::SegmentSpaceExhausted`] once every segment is in use.
    ///
    /// Only applies when the store is created.
    ///
    /// Default: 4096.
    pub fn max_segments(&mut self, max_segments: u32) {
        assert!(max_segments > 0);
        self.max_segments = max_segments;
    }

    /// Run compaction on a background thread.
    ///
    /// When off, compaction only happens through [`crate::Database::compact_next_segment`].
    ///
    /// Default: on.
    pub fn compact_thread(&mut self, compact_thread: bool) {
        self.compact_thread = compact_thread;
    }

    /// A sealed segment becomes eligible for compaction once at least this percentage of its
    /// bytes has been freed.
    ///
    /// Default: 20.
    pub fn compact_threshold_percent(&mut self, percent: u8) {
        assert!(percent <= 100);
        self.compact_threshold_percent = percent;
    }

    /// Sample roughly one in `difficulty` node accesses for read statistics. 0 turns sampling
    /// off, which also keeps the compactor from telling hot objects from cold ones.
    ///
    /// Default: 16.
    pub fn read_sample_difficulty(&mut self, difficulty: u32) {
        self.read_sample_difficulty = difficulty;
    }

    /// How writes are flushed to disk by [`crate::Database::sync`] and on shutdown.
    ///
    /// Default: [`SyncMode::None`].
    pub fn sync_mode(&mut self, sync_mode: SyncMode) {
        self.sync_mode = sync_mode;
    }

    /// Verify node checksums on every access, panicking on mismatch.
    ///
    /// Default: on in debug builds, off in release builds.
    pub fn validate_checksums(&mut self, validate: bool) {
        self.validate_checksums = validate;
    }

    /// Compute checksums for new and modified nodes.
    ///
    /// Turning this off makes recovery unable to tell intact objects from torn ones.
    ///
    /// Default: on.
    pub fn update_checksums(&mut self, update: bool) {
        self.update_checksums = update;
    }

    /// The number of vacated segments that may wait for reclamation before compaction blocks.
    ///
    /// Default: 1024.
    pub fn gc_queue_capacity(&mut self, capacity: usize) {
        assert!(capacity > 0);
        self.gc_queue_capacity = capacity;
    }

    /// Set metrics collection on or off.
    ///
    /// Default: off.
    pub fn metrics(&mut self, metrics: bool) {
        self.metrics = metrics;
    }

    /// Panic in the middle of the `n`-th in-place node modification, after the node is marked
    /// as changing and before the mark is cleared.
    ///
    /// Useful to test recovery and will just cause your store to need repair otherwise.
    pub fn panic_on_modify(&mut self, n: u64) {
        assert!(n > 0);
        self.panic_on_modify = Some(n);
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

/// How data is flushed to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Leave flushing to the operating system.
    None,
    /// Schedule dirty pages for writeback without waiting.
    Async,
    /// Write dirty pages back and wait for completion.
    Sync,
}
