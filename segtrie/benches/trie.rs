#[cfg(feature = "benchmarks")]
use criterion::{criterion_group, criterion_main};
#[cfg(feature = "benchmarks")]
use segtrie::benches::{iteration_benchmark, trie_benchmark};

#[cfg(feature = "benchmarks")]
criterion_group!(point, trie_benchmark);
#[cfg(feature = "benchmarks")]
criterion_group!(iteration, iteration_benchmark);
#[cfg(feature = "benchmarks")]
criterion_main!(point, iteration);

#[cfg(not(feature = "benchmarks"))]
fn main() {}
