//! Engine Statistics
//!
//! Lock-free counters for cache health.

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine counters
#[derive(Debug, Default)]
pub struct EngineStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    validations: AtomicU64,
    out_of_date: AtomicU64,
    bypassed: AtomicU64,
    transient_errors: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation(&self, out_of_date: bool) {
        self.validations.fetch_add(1, Ordering::Relaxed);
        if out_of_date {
            self.out_of_date.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_bypass(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_error(&self) {
        self.transient_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            validations: self.validations.load(Ordering::Relaxed),
            out_of_date: self.out_of_date.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            bumps_applied: 0,
            bumps_requeued: 0,
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub validations: u64,
    pub out_of_date: u64,
    /// Calls computed without the cache (failure budget spent)
    pub bypassed: u64,
    pub transient_errors: u64,
    pub bumps_applied: u64,
    pub bumps_requeued: u64,
}

impl StatsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = EngineStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_validation(false);
        stats.record_validation(true);

        let snap = stats.snapshot();
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.validations, 2);
        assert_eq!(snap.out_of_date, 1);
        assert!((snap.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_hit_ratio() {
        assert_eq!(StatsSnapshot::default().hit_ratio(), 0.0);
    }
}
