//! A small fixed table of mutexes, picked by hashing a key.
//!
//! Two keys may share a bucket, which only costs some contention.

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

const BUCKETS: usize = 64;

pub struct LocationMutex {
    locks: Box<[CachePadded<Mutex<()>>]>,
}

impl LocationMutex {
    pub fn new() -> Self {
        LocationMutex {
            locks: (0..BUCKETS).map(|_| CachePadded::new(Mutex::new(()))).collect(),
        }
    }

    fn bucket(&self, key: u64) -> &Mutex<()> {
        &self.locks[fxhash::hash64(&key) as usize % BUCKETS]
    }

    /// Lock the bucket of `key`, waiting if needed.
    pub fn lock(&self, key: u64) -> MutexGuard<'_, ()> {
        self.bucket(key).lock()
    }

    /// Lock the bucket of `key` if it is free.
    pub fn try_lock(&self, key: u64) -> Option<MutexGuard<'_, ()>> {
        self.bucket(key).try_lock()
    }
}

#[cfg(test)]
mod tests {
    use super::LocationMutex;

    #[test]
    fn same_key_contends() {
        let m = LocationMutex::new();
        let g = m.lock(42);
        assert!(m.try_lock(42).is_none());
        drop(g);
        assert!(m.try_lock(42).is_some());
    }

    #[test]
    fn waits_for_holder() {
        let m = std::sync::Arc::new(LocationMutex::new());
        let g = m.lock(7);
        let m2 = m.clone();
        let t = std::thread::spawn(move || {
            let _g = m2.lock(7);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!t.is_finished());
        drop(g);
        t.join().unwrap();
    }
}
