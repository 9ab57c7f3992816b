//! A concurrent, memory-mapped radix trie store.
//!
//! Nodes live in segment files mapped into memory and are addressed through a table of atomic
//! meta words, one per object id. Trees are versioned by reference counting: writers update
//! nodes in place when they are the only ones who can see them and copy them otherwise, so any
//! number of readers keep consistent snapshots while a writer works. A background compactor
//! moves live objects out of sparse segments without blocking either.
//!
//! ```no_run
//! let mut o = segtrie::Options::new();
//! o.path("my_store");
//! let db = segtrie::Database::open(o)?;
//! let ws = db.start_write_session()?;
//! let mut root = ws.get_top_root(0)?;
//! ws.upsert(&mut root, b"hello", b"world")?;
//! ws.set_top_root(0, &root)?;
//! assert_eq!(ws.get(&root, b"hello"), Some(b"world".to_vec()));
//! # Ok::<(), anyhow::Error>(())
//! ```

pub use database::{Database, DbStats, NUM_TOP_ROOTS};
pub use error::Error;
pub use metrics::{Metric, Metrics};
pub use node_handle::NodeHandle;
pub use options::{Options, SyncMode};
pub use recover::RecoveryReport;
pub use root::Root;
pub use seg_alloc::{SegmentState, SegmentStats};
pub use session::{ReadSession, WriteSession, WriteTransaction};
pub use trie::{iter::TrieIterator, Value};

pub use segtrie_core::{IdAddress, MAX_KEY_SIZE};

#[cfg(feature = "benchmarks")]
pub mod benches;

mod database;
mod error;
mod flock;
mod gc_queue;
mod id_alloc;
mod location_mutex;
mod mapping;
mod metrics;
mod node_handle;
mod options;
mod recover;
mod root;
mod seg_alloc;
mod session;
mod sys;
mod trie;
