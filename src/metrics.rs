use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Scheduler counters, updated with relaxed atomics from every worker.
#[derive(Debug)]
pub(crate) struct Metrics {
    /// Tears whose procedure returned.
    pub tears_executed: AtomicU64,
    /// Fibers handed a fresh tear.
    pub fibers_started: AtomicU64,
    /// Fibers taken from the ready ring after a chain completed.
    pub fibers_resumed: AtomicU64,
    /// Fibers switched out inside `unchain`.
    pub fibers_suspended: AtomicU64,
    /// Tears run directly on the fiber waiting for their chain.
    pub tears_inlined: AtomicU64,
    /// Tears pushed to a worker's local deque.
    pub local_pushes: AtomicU64,
    /// Tears pushed to the global injector.
    pub injector_pushes: AtomicU64,
    /// Tears taken from another worker's deque.
    pub steals: AtomicU64,
    /// Times a worker went to sleep on the idle condition variable.
    pub parks: AtomicU64,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            tears_executed: AtomicU64::new(0),
            fibers_started: AtomicU64::new(0),
            fibers_resumed: AtomicU64::new(0),
            fibers_suspended: AtomicU64::new(0),
            tears_inlined: AtomicU64::new(0),
            local_pushes: AtomicU64::new(0),
            injector_pushes: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            parks: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tears_executed: self.tears_executed.load(Ordering::Relaxed),
            fibers_started: self.fibers_started.load(Ordering::Relaxed),
            fibers_resumed: self.fibers_resumed.load(Ordering::Relaxed),
            fibers_suspended: self.fibers_suspended.load(Ordering::Relaxed),
            tears_inlined: self.tears_inlined.load(Ordering::Relaxed),
            local_pushes: self.local_pushes.load(Ordering::Relaxed),
            injector_pushes: self.injector_pushes.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            parks: self.parks.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Point-in-time copy of the scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub tears_executed: u64,
    pub fibers_started: u64,
    pub fibers_resumed: u64,
    pub fibers_suspended: u64,
    pub tears_inlined: u64,
    pub local_pushes: u64,
    pub injector_pushes: u64,
    pub steals: u64,
    pub parks: u64,
    pub elapsed_seconds: f64,
}

impl StatsSnapshot {
    pub fn tears_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.tears_executed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Fraction of tears that ran on a worker other than the one that split them.
    pub fn steal_ratio(&self) -> f64 {
        if self.tears_executed == 0 {
            0.0
        } else {
            self.steals as f64 / self.tears_executed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tears_executed, 0);
        assert_eq!(snapshot.steals, 0);
        assert!(snapshot.elapsed_seconds >= 0.0);
        assert_eq!(snapshot.steal_ratio(), 0.0);
    }

    #[test]
    fn test_metrics_updates() {
        let metrics = Metrics::new();
        metrics.tears_executed.fetch_add(10, Ordering::Relaxed);
        metrics.steals.fetch_add(4, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tears_executed, 10);
        assert!((snapshot.steal_ratio() - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = StatsSnapshot {
            tears_executed: 3,
            ..Default::default()
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"tears_executed\":3"));
        let back: StatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
