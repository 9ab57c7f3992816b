#![cfg(feature = "benchmarks")]

use crate::{Database, Options, SyncMode};
use criterion::{BenchmarkId, Criterion};
use rand::{Rng, RngCore, SeedableRng};
use segtrie_core::{
    node::{InnerBuilder, NodeView},
    IdAddress, IdIndex, IdRegion,
};

pub fn trie_benchmark(c: &mut Criterion) {
    branch_lookup_benchmark(c);
    upsert_benchmark(c);
    get_benchmark(c);
}

/// Ordered scans, seeks and bounded ranges from both ends.
pub fn iteration_benchmark(c: &mut Criterion) {
    scan_benchmark(c);
    seek_benchmark(c);
}

fn rng() -> rand::rngs::SmallRng {
    rand::rngs::SmallRng::seed_from_u64(0x5e67)
}

fn rand_key(rng: &mut impl RngCore) -> [u8; 16] {
    let mut key = [0; 16];
    rng.fill_bytes(&mut key);
    key
}

fn open_db(name: &str) -> Database {
    let path = std::env::temp_dir().join(format!("segtrie-bench-{name}"));
    let _ = std::fs::remove_dir_all(&path);
    let mut o = Options::new();
    o.path(path);
    o.sync_mode(SyncMode::None);
    o.compact_thread(false);
    // UNWRAP: benchmarks have nowhere to report a failed open.
    Database::open(o).unwrap()
}

// one node of every representation, looked up at a present and an absent byte.
fn branch_lookup_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("branch_lookup");

    for branches in [8, 32, 64, 128, 255] {
        let mut builder = InnerBuilder::new(&[]);
        for b in 0..branches {
            let id = IdAddress::new(IdRegion(0), IdIndex::new(b as u32 + 1).unwrap());
            builder.set_branch(b as u8, id);
        }
        let mut bytes = vec![0; builder.size()];
        builder.write(&mut bytes, IdAddress::new(IdRegion(0), IdIndex::new(1000).unwrap()));
        let NodeView::Inner(node) = NodeView::new(&bytes) else {
            unreachable!()
        };

        group.bench_function(BenchmarkId::new("branches", branches), |b| {
            b.iter(|| {
                (
                    node.get_branch((branches / 2) as u8),
                    node.get_branch(255),
                )
            });
        });
    }

    group.finish();
}

fn upsert_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("upsert");
    let db = open_db("upsert");
    let ws = db.start_write_session().unwrap();

    for value_len in [8, 64, 512] {
        let mut rng = rng();
        let value = vec![0x55; value_len];
        let mut root = ws.create_root();
        group.bench_function(BenchmarkId::new("value_len", value_len), |b| {
            b.iter(|| ws.upsert(&mut root, &rand_key(&mut rng), &value).unwrap());
        });
    }

    // every write lands on a tree shared with a snapshot and copies its path.
    let mut rng = rng();
    let mut root = ws.create_root();
    for _ in 0..10_000 {
        ws.upsert(&mut root, &rand_key(&mut rng), b"base").unwrap();
    }
    group.bench_function("copy_on_write", |b| {
        b.iter_batched(
            || root.clone(),
            |mut copy| {
                ws.upsert(&mut copy, &rand_key(&mut rng), b"cow").unwrap();
                copy
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn get_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    let db = open_db("get");
    let ws = db.start_write_session().unwrap();

    for n in [1_000u32, 100_000] {
        let mut rng = rng();
        let mut root = ws.create_root();
        let keys: Vec<[u8; 16]> = (0..n).map(|_| rand_key(&mut rng)).collect();
        for key in &keys {
            ws.upsert(&mut root, key, &key[..8]).unwrap();
        }

        group.bench_function(BenchmarkId::new("present", n), |b| {
            b.iter(|| ws.get(&root, &keys[rng.gen_range(0..keys.len())]))
        });
        group.bench_function(BenchmarkId::new("absent", n), |b| {
            b.iter(|| ws.get(&root, &rand_key(&mut rng)))
        });
        group.bench_function(BenchmarkId::new("borrowed", n), |b| {
            b.iter(|| {
                ws.get_with(&root, &keys[rng.gen_range(0..keys.len())], |v| {
                    v.map_or(0, |v| v.len())
                })
            })
        });
    }

    group.finish();
}

// a tree of 16-byte random keys, plus the keys themselves in order.
fn filled_tree(ws: &crate::WriteSession, n: usize) -> (crate::Root, Vec<[u8; 16]>) {
    let mut rng = rng();
    let mut root = ws.create_root();
    let mut keys: Vec<[u8; 16]> = (0..n).map(|_| rand_key(&mut rng)).collect();
    for key in &keys {
        ws.upsert(&mut root, key, b"value").unwrap();
    }
    keys.sort();
    (root, keys)
}

fn scan_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    // full scans of large trees are slow.
    group.sample_size(20);
    let db = open_db("scan");
    let ws = db.start_write_session().unwrap();

    for n in [10_000, 100_000] {
        let (root, _) = filled_tree(&ws, n);
        group.throughput(criterion::Throughput::Elements(n as u64));
        group.bench_function(BenchmarkId::new("forward", n), |b| {
            b.iter(|| ws.iter(&root).count())
        });
        group.bench_function(BenchmarkId::new("backward", n), |b| {
            b.iter(|| ws.iter(&root).rev().count())
        });
        // both ends at once, meeting in the middle.
        group.bench_function(BenchmarkId::new("both_ends", n), |b| {
            b.iter(|| {
                let mut iter = ws.iter(&root);
                let mut count = 0;
                while iter.next().is_some() {
                    count += 1;
                    if iter.next_back().is_none() {
                        break;
                    }
                    count += 1;
                }
                count
            })
        });
    }

    group.finish();
}

fn seek_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("seek");
    let db = open_db("seek");
    let ws = db.start_write_session().unwrap();
    let mut rng = rng();
    let (root, keys) = filled_tree(&ws, 100_000);

    group.bench_function("range_take_16", |b| {
        b.iter(|| ws.range(&root, &rand_key(&mut rng), None).take(16).count())
    });
    group.bench_function("range_rev_take_16", |b| {
        b.iter(|| {
            let end = rand_key(&mut rng);
            ws.range(&root, &[], Some(&end[..])).rev().take(16).count()
        })
    });
    // about 1/256 of the keys share a one byte prefix.
    group.bench_function("prefix_1_byte", |b| {
        b.iter(|| ws.prefix(&root, &[rng.gen::<u8>()]).count())
    });
    group.bench_function("prefix_last_of_2_bytes", |b| {
        b.iter(|| ws.prefix(&root, &rng.gen::<[u8; 2]>()).next_back())
    });
    // repositioning one iterator instead of creating one per lookup.
    let mut iter = ws.iter(&root);
    group.bench_function("reseek_present", |b| {
        b.iter(|| {
            iter.seek(&keys[rng.gen_range(0..keys.len())]);
            iter.next()
        })
    });
    group.bench_function("reseek_back_absent", |b| {
        b.iter(|| {
            iter.seek_back(&rand_key(&mut rng));
            iter.next_back()
        })
    });

    group.finish();
}
