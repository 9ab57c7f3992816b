//! Epoch based deferred reclamation.
//!
//! Every session owns an epoch slot. While a session may be looking at shared memory its slot
//! holds the global epoch observed when it started looking; otherwise it holds `u64::MAX`.
//!
//! [`GcQueue::push`] tags garbage with the current epoch and then advances the epoch. An item
//! tagged `e` may be reclaimed once every slot holds a value greater than `e`: any session that
//! started looking before the item was pushed still holds an epoch `<= e`.

use std::{
    collections::VecDeque,
    sync::atomic::{fence, AtomicU64, Ordering},
    time::Duration,
};

use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::Mutex;

const IDLE: u64 = u64::MAX;

pub struct GcQueue<T> {
    epoch: AtomicU64,
    sessions: Box<[CachePadded<AtomicU64>]>,
    pending: Mutex<VecDeque<(u64, T)>>,
    capacity: usize,
}

impl<T> GcQueue<T> {
    pub fn new(capacity: usize, sessions: usize) -> Self {
        GcQueue {
            epoch: AtomicU64::new(0),
            sessions: (0..sessions)
                .map(|_| CachePadded::new(AtomicU64::new(IDLE)))
                .collect(),
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Publish that `session` is about to look at shared memory.
    pub fn enter(&self, session: usize) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.sessions[session].store(epoch, Ordering::SeqCst);
        // the slot store must be visible before any load of shared memory that follows.
        fence(Ordering::SeqCst);
    }

    /// Publish that `session` no longer looks at shared memory.
    pub fn exit(&self, session: usize) {
        self.sessions[session].store(IDLE, Ordering::Release);
    }

    /// The smallest epoch any session is observing, `u64::MAX` if none is.
    pub fn min_active(&self) -> u64 {
        // pairs with the fence in `enter`: either the session's slot is seen here, or the session
        // sees every unlink made before this call.
        fence(Ordering::SeqCst);
        self.sessions
            .iter()
            .map(|s| s.load(Ordering::SeqCst))
            .min()
            .unwrap_or(IDLE)
    }

    /// Enqueue `item`. Returns the items that became reclaimable, possibly including older ones.
    ///
    /// If the queue is full this waits until the oldest entry can be reclaimed. The calling thread
    /// must not itself be inside an epoch, or it could wait forever.
    pub fn push(&self, item: T) -> Vec<T> {
        let mut ready = self.poll();
        if self.pending.lock().len() >= self.capacity {
            ready.extend(self.wait());
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push_back((epoch, item));
        ready
    }

    /// Take every item that no session can still observe, without blocking.
    pub fn poll(&self) -> Vec<T> {
        let min = self.min_active();
        let mut pending = self.pending.lock();
        let mut ready = Vec::new();
        while pending.front().map_or(false, |(epoch, _)| *epoch < min) {
            // UNWRAP: front was just checked.
            ready.push(pending.pop_front().unwrap().1);
        }
        ready
    }

    /// Wait until at least the oldest pending item is reclaimable and take all that are.
    pub fn wait(&self) -> Vec<T> {
        let backoff = Backoff::new();
        loop {
            let ready = self.poll();
            if !ready.is_empty() || self.pending.lock().is_empty() {
                return ready;
            }
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::GcQueue;
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    #[test]
    fn idle_sessions_do_not_block() {
        let q = GcQueue::new(4, 2);
        assert_eq!(q.push(1), Vec::<i32>::new());
        assert_eq!(q.poll(), vec![1]);
        assert!(q.poll().is_empty());
    }

    #[test]
    fn active_session_defers_until_exit() {
        let q = GcQueue::new(4, 2);
        q.enter(0);
        assert!(q.push("a").is_empty());
        assert!(q.poll().is_empty());

        // a session entering after the push does not hold the item back.
        q.enter(1);
        q.exit(0);
        assert_eq!(q.poll(), vec!["a"]);
        q.exit(1);
    }

    #[test]
    fn later_entries_wait_for_their_own_observers() {
        let q = GcQueue::new(8, 2);
        q.push(1);
        q.enter(0);
        q.push(2);
        assert_eq!(q.poll(), vec![1]);
        q.exit(0);
        assert_eq!(q.poll(), vec![2]);
    }

    #[test]
    fn full_queue_waits_for_slowest_session() {
        let q = Arc::new(GcQueue::new(1, 2));
        q.enter(0);
        assert!(q.push(1).is_empty());

        let q2 = q.clone();
        let pusher = std::thread::spawn(move || q2.push(2));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!pusher.is_finished());

        q.exit(0);
        assert_eq!(pusher.join().unwrap(), vec![1]);
        assert_eq!(q.poll(), vec![2]);
    }

    #[test]
    fn readers_never_see_reclaimed_items() {
        const ITEMS: usize = 20_000;
        let q = Arc::new(GcQueue::new(64, 4));
        let current = Arc::new(AtomicUsize::new(0));
        let freed: Arc<Vec<AtomicBool>> =
            Arc::new((0..ITEMS).map(|_| AtomicBool::new(false)).collect());
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|session| {
                let (q, current, freed, stop) =
                    (q.clone(), current.clone(), freed.clone(), stop.clone());
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        q.enter(session);
                        let item = current.load(Ordering::Acquire);
                        for _ in 0..8 {
                            assert!(!freed[item].load(Ordering::Acquire), "{item} freed early");
                            std::hint::spin_loop();
                        }
                        q.exit(session);
                    }
                })
            })
            .collect();

        for next in 1..ITEMS {
            let old = current.swap(next, Ordering::AcqRel);
            for item in q.push(old) {
                freed[item].store(true, Ordering::Release);
            }
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
