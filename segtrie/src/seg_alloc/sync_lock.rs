//! Coordination between in-place modification of a segment and flushing it to disk.
//!
//! Any number of modifiers may work on a segment at once, but a flush waits for them to drain
//! and keeps new ones out until it is done, so a synced segment never captures a half-written
//! node.

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct SyncState {
    syncing: bool,
    modifying: u32,
}

#[derive(Default)]
pub struct SyncLock {
    state: Mutex<SyncState>,
    cond: Condvar,
}

impl SyncLock {
    /// Register a modifier, waiting for an ongoing sync.
    pub fn start_modify(&self) {
        let mut state = self.state.lock();
        while state.syncing {
            self.cond.wait(&mut state);
        }
        state.modifying += 1;
    }

    pub fn end_modify(&self) {
        let mut state = self.state.lock();
        state.modifying -= 1;
        if state.modifying == 0 {
            self.cond.notify_all();
        }
    }

    /// Wait until no modifier or other sync is active and keep new ones out until the guard is
    /// dropped.
    pub fn start_sync(&self) -> SyncGuard<'_> {
        let mut state = self.state.lock();
        while state.syncing || state.modifying > 0 {
            self.cond.wait(&mut state);
        }
        state.syncing = true;
        SyncGuard { lock: self }
    }
}

pub struct SyncGuard<'a> {
    lock: &'a SyncLock,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.lock().syncing = false;
        self.lock.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::SyncLock;
    use std::{sync::Arc, time::Duration};

    #[test]
    fn sync_waits_for_modifiers() {
        let lock = Arc::new(SyncLock::default());
        lock.start_modify();

        let l2 = lock.clone();
        let syncer = std::thread::spawn(move || {
            let _guard = l2.start_sync();
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!syncer.is_finished());

        lock.end_modify();
        syncer.join().unwrap();
    }

    #[test]
    fn modifiers_wait_for_sync() {
        let lock = Arc::new(SyncLock::default());
        let guard = lock.start_sync();

        let l2 = lock.clone();
        let modifier = std::thread::spawn(move || {
            l2.start_modify();
            l2.end_modify();
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!modifier.is_finished());

        drop(guard);
        modifier.join().unwrap();
    }
}
