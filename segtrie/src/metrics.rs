use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Metrics collector, if active, it provides Counters and Timers
#[derive(Clone)]
pub struct Metrics {
    metrics: Option<Arc<ActiveMetrics>>,
}

/// Metrics that can be collected during execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Counter of nodes written to a segment, including copies made by the compactor
    NodeAllocations,
    /// Counter of nodes whose last reference was released
    NodeFrees,
    /// Counter of retains refused because the reference count was saturated
    RetainOverflows,
    /// Counter of objects relocated by the compactor
    MovedObjects,
    /// Counter of relocations abandoned because the object changed concurrently
    MoveConflicts,
    /// Counter of segments fully vacated by the compactor
    CompactedSegments,
    /// Counter of vacated segments returned to the free list
    RecycledSegments,
    /// Counter of node accesses sampled for read statistics
    ReadSamples,
    /// Timer used to record the time spent compacting one segment
    CompactionTime,
}

struct ActiveMetrics {
    node_allocations: AtomicU64,
    node_frees: AtomicU64,
    retain_overflows: AtomicU64,
    moved_objects: AtomicU64,
    move_conflicts: AtomicU64,
    compacted_segments: AtomicU64,
    recycled_segments: AtomicU64,
    read_samples: AtomicU64,
    compaction_time: Timer,
}

impl ActiveMetrics {
    fn counter(&self, metric: Metric) -> &AtomicU64 {
        match metric {
            Metric::NodeAllocations => &self.node_allocations,
            Metric::NodeFrees => &self.node_frees,
            Metric::RetainOverflows => &self.retain_overflows,
            Metric::MovedObjects => &self.moved_objects,
            Metric::MoveConflicts => &self.move_conflicts,
            Metric::CompactedSegments => &self.compacted_segments,
            Metric::RecycledSegments => &self.recycled_segments,
            Metric::ReadSamples => &self.read_samples,
            _ => panic!("Specified metric is not a Counter"),
        }
    }
}

impl Metrics {
    /// Returns the Metrics object, active or not based on the specified input
    pub fn new(active: bool) -> Self {
        Self {
            metrics: if active {
                Some(Arc::new(ActiveMetrics {
                    node_allocations: AtomicU64::new(0),
                    node_frees: AtomicU64::new(0),
                    retain_overflows: AtomicU64::new(0),
                    moved_objects: AtomicU64::new(0),
                    move_conflicts: AtomicU64::new(0),
                    compacted_segments: AtomicU64::new(0),
                    recycled_segments: AtomicU64::new(0),
                    read_samples: AtomicU64::new(0),
                    compaction_time: Timer::new(),
                }))
            } else {
                None
            },
        }
    }

    /// Increase the Counter specified by the input
    ///
    /// panics if the specified [`Metric`] is not a Counter
    pub fn count(&self, metric: Metric) {
        if let Some(ref metrics) = self.metrics {
            metrics.counter(metric).fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The current value of a Counter. Always 0 when collection is off.
    ///
    /// panics if the specified [`Metric`] is not a Counter
    pub fn count_of(&self, metric: Metric) -> u64 {
        self.metrics
            .as_ref()
            .map_or(0, |metrics| metrics.counter(metric).load(Ordering::Relaxed))
    }

    /// Returns a guard that, when dropped, will record the time passed since creation
    ///
    /// panics if the specified [`Metric`] is not a Timer
    pub fn record<'a>(&'a self, metric: Metric) -> Option<impl Drop + 'a> {
        self.metrics.as_ref().map(|metrics| {
            let timer = match metric {
                Metric::CompactionTime => &metrics.compaction_time,
                _ => panic!("Specified metric is not a Timer"),
            };

            timer.record()
        })
    }

    /// Print collected metrics to stdout
    pub fn print(&self) {
        if let Some(ref metrics) = self.metrics {
            println!("metrics");

            let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
            println!("  node allocations      {}", load(&metrics.node_allocations));
            println!("  node frees            {}", load(&metrics.node_frees));
            println!("  retain overflows      {}", load(&metrics.retain_overflows));

            let moved = load(&metrics.moved_objects);
            let conflicts = load(&metrics.move_conflicts);
            println!("  moved objects         {}", moved);
            if moved + conflicts != 0 {
                let percentage = (conflicts as f64 / (moved + conflicts) as f64) * 100.0;
                println!(
                    "  move conflicts        {} - {:.2}% of move attempts",
                    conflicts, percentage
                );
            }

            println!("  compacted segments    {}", load(&metrics.compacted_segments));
            println!("  recycled segments     {}", load(&metrics.recycled_segments));
            println!("  read samples          {}", load(&metrics.read_samples));

            if let Some(mean) = metrics.compaction_time.mean() {
                println!("  compaction mean       {}", pretty_display_ns(mean));
            }
        } else {
            println!("Metrics collection was not activated")
        }
    }
}

fn pretty_display_ns(ns: u64) -> String {
    // preserve 3 sig figs at minimum.
    let (val, unit) = if ns > 100 * 1_000_000_000 {
        (ns / 1_000_000_000, "s")
    } else if ns > 100 * 1_000_000 {
        (ns / 1_000_000, "ms")
    } else if ns > 100 * 1_000 {
        (ns / 1_000, "us")
    } else {
        (ns, "ns")
    };

    format!("{val} {unit}")
}

struct Timer {
    number_of_records: AtomicU64,
    sum: AtomicU64,
}

impl Timer {
    fn new() -> Self {
        Timer {
            number_of_records: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    fn mean(&self) -> Option<u64> {
        let n = self.number_of_records.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        sum.checked_div(n)
    }

    fn record<'a>(&'a self) -> impl Drop + 'a {
        struct TimerGuard<'a> {
            start: std::time::Instant,
            n: &'a AtomicU64,
            sum: &'a AtomicU64,
        }

        impl Drop for TimerGuard<'_> {
            fn drop(&mut self) {
                let elapsed = self.start.elapsed().as_nanos() as u64;
                self.n.fetch_add(1, Ordering::Relaxed);
                self.sum.fetch_add(elapsed, Ordering::Relaxed);
            }
        }

        TimerGuard {
            start: std::time::Instant::now(),
            n: &self.number_of_records,
            sum: &self.sum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Metric, Metrics};

    #[test]
    fn inactive_counts_nothing() {
        let m = Metrics::new(false);
        m.count(Metric::MovedObjects);
        assert_eq!(m.count_of(Metric::MovedObjects), 0);
        assert!(m.record(Metric::CompactionTime).is_none());
    }

    #[test]
    fn active_counts() {
        let m = Metrics::new(true);
        m.count(Metric::MovedObjects);
        m.count(Metric::MovedObjects);
        m.count(Metric::NodeFrees);
        assert_eq!(m.count_of(Metric::MovedObjects), 2);
        assert_eq!(m.count_of(Metric::NodeFrees), 1);
        drop(m.record(Metric::CompactionTime));
    }

    #[test]
    #[should_panic(expected = "not a Counter")]
    fn timer_is_not_a_counter() {
        Metrics::new(true).count(Metric::CompactionTime);
    }
}
