#![no_main]

use std::collections::BTreeMap;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use segtrie::{Database, Options, Root, SyncMode, WriteSession};

fuzz_target!(|run: Run| {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Some(open_db(dir.path(), run.segment_size_shift));
    let mut cx = Context::default();

    for call in run.calls {
        let session = db.as_ref().unwrap().start_write_session().unwrap();
        let mut root = session.get_top_root(0).unwrap();
        match call {
            Call::Session { calls } => {
                let mut model = cx.committed.clone();
                for call in calls {
                    apply(&session, &mut root, &mut model, &mut cx.snapshots, call);
                }
                session.set_top_root(0, &root).unwrap();
                cx.committed = model;
            }
            Call::Transaction { calls, commit } => {
                drop(root);
                let mut tx = session.start_transaction(0).unwrap();
                let mut model = cx.committed.clone();
                for call in calls {
                    let SessionCall::Upsert { key, value } = call else {
                        continue;
                    };
                    tx.upsert(&key, &value).unwrap();
                    model.insert(key, value);
                }
                if commit {
                    tx.commit().unwrap();
                    cx.committed = model;
                } else {
                    tx.abort();
                }
            }
            Call::Reopen => {
                drop(root);
                drop(session);
                cx.snapshots.clear();
                db.take();
                db = Some(open_db(dir.path(), run.segment_size_shift));
                continue;
            }
        }

        let published = session.get_top_root(0).unwrap();
        check(&session, &published, &cx.committed);
        for (snapshot, expected) in &cx.snapshots {
            check(&session, snapshot, expected);
        }
    }
});

fn apply(
    session: &WriteSession,
    root: &mut Root,
    model: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    snapshots: &mut Vec<(Root, BTreeMap<Vec<u8>, Vec<u8>>)>,
    call: SessionCall,
) {
    match call {
        SessionCall::Upsert { key, value } => {
            let prior = session.upsert(root, &key, &value).unwrap();
            assert_eq!(prior, model.insert(key, value).map(|v| v.len()));
        }
        SessionCall::Remove { key } => {
            let removed = session.remove(root, &key).unwrap();
            assert_eq!(removed, model.remove(&key).is_some());
        }
        SessionCall::Read { key } => {
            assert_eq!(session.get(root, &key).as_ref(), model.get(&key));
        }
        SessionCall::Snapshot => {
            // keep memory bounded.
            if snapshots.len() >= 4 {
                snapshots.remove(0);
            }
            snapshots.push((root.clone(), model.clone()));
        }
    }
}

fn check(session: &WriteSession, root: &Root, expected: &BTreeMap<Vec<u8>, Vec<u8>>) {
    assert_eq!(session.count_keys(root), expected.len() as u64);
    let mut iter = session.iter(root);
    for (key, value) in expected {
        let (k, v) = iter.next().expect("iterator ended early");
        assert_eq!(&k, key);
        assert_eq!(v.as_data(), Some(&value[..]));
    }
    assert!(iter.next().is_none());
}

fn open_db(path: &std::path::Path, segment_size_shift: u8) -> Database {
    let mut options = Options::new();
    options.path(path.join("db"));
    options.segment_size(1 << segment_size_shift);
    options.max_segments(64);
    options.sync_mode(SyncMode::None);
    options.compact_thread(false);
    options.validate_checksums(true);
    Database::open(options).unwrap()
}

#[derive(Default)]
struct Context {
    /// What top root 0 holds.
    committed: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Older versions and what they held when taken. Lost on reopen.
    snapshots: Vec<(Root, BTreeMap<Vec<u8>, Vec<u8>>)>,
}

#[derive(Debug)]
struct Run {
    segment_size_shift: u8,
    calls: Vec<Call>,
}

impl<'a> Arbitrary<'a> for Run {
    fn arbitrary(input: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let run = Run {
            segment_size_shift: input.int_in_range(20..=22)?,
            calls: input.arbitrary_iter()?.take(16).collect::<Result<_, _>>()?,
        };
        Ok(run)
    }
}

#[derive(Debug, Arbitrary)]
enum Call {
    /// Apply calls to a working copy of top root 0 and publish it.
    Session { calls: Vec<SessionCall> },
    /// Run upserts in a transaction on top root 0.
    Transaction {
        calls: Vec<SessionCall>,
        commit: bool,
    },
    Reopen,
}

#[derive(Debug)]
enum SessionCall {
    Upsert { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
    Read { key: Vec<u8> },
    Snapshot,
}

// keys over a tiny alphabet collide and share prefixes, which is where the trie does its work.
fn key(input: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Vec<u8>> {
    let len = input.int_in_range(0..=8)?;
    (0..len)
        .map(|_| input.choose(&[0u8, 1, b'a', b'b', 0xff]).copied())
        .collect()
}

impl<'a> Arbitrary<'a> for SessionCall {
    fn arbitrary(input: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(match input.int_in_range(0..=9)? {
            0..=4 => {
                let key = key(input)?;
                let len = *input.choose(&[0, 1, 7, 40, 300, 5000])?;
                let mut value = vec![0; len];
                input.fill_buffer(&mut value)?;
                SessionCall::Upsert { key, value }
            }
            5 | 6 => SessionCall::Remove { key: key(input)? },
            7 | 8 => SessionCall::Read { key: key(input)? },
            _ => SessionCall::Snapshot,
        })
    }
}
