use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::scope::CacheStats;

/// Process-wide evaluation counters.
#[derive(Debug, Default)]
pub struct Metrics {
    evaluations: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    filtered: AtomicU64,
    deferred: AtomicU64,
    timeouts: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_evaluation(&self) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds a finished scope's cache counters into the totals.
    pub fn record_cache_stats(&self, stats: CacheStats) {
        self.cache_hits.fetch_add(stats.hits, Ordering::Relaxed);
        self.cache_misses.fetch_add(stats.misses, Ordering::Relaxed);
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub fn allowed(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    pub fn deferred(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        let counters = [
            ("evaluations", "Permission evaluations started.", self.evaluations()),
            ("allowed", "Evaluations that allowed.", self.allowed()),
            ("denied", "Evaluations that denied.", self.denied()),
            ("fields_filtered", "Fields omitted from reads.", self.filtered()),
            ("deferred", "Checks deferred until commit.", self.deferred()),
            ("timeouts", "Evaluations that hit the caller deadline.", self.timeouts()),
            ("check_cache_hits", "Check cache hits.", self.cache_hits()),
            ("check_cache_misses", "Check cache misses.", self.cache_misses()),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP warden_{name}_total {help}");
            let _ = writeln!(output, "# TYPE warden_{name}_total counter");
            let _ = writeln!(output, "warden_{name}_total {value}");
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = Metrics::new();
        assert_eq!(metrics.evaluations(), 0);
        assert_eq!(metrics.denied(), 0);
        assert_eq!(metrics.cache_hits(), 0);
    }

    #[test]
    fn cache_stats_accumulate() {
        let metrics = Metrics::new();
        metrics.record_cache_stats(CacheStats { hits: 3, misses: 1 });
        metrics.record_cache_stats(CacheStats { hits: 2, misses: 4 });

        assert_eq!(metrics.cache_hits(), 5);
        assert_eq!(metrics.cache_misses(), 5);
    }

    #[test]
    fn render_prometheus_emits_every_counter() {
        let metrics = Metrics::new();
        metrics.record_evaluation();
        metrics.record_evaluation();
        metrics.record_denied();
        metrics.record_filtered();

        let output = metrics.render_prometheus();

        assert!(output.contains("warden_evaluations_total 2"));
        assert!(output.contains("warden_denied_total 1"));
        assert!(output.contains("warden_fields_filtered_total 1"));
        assert!(output.contains("warden_timeouts_total 0"));
        assert!(output.contains("# TYPE warden_check_cache_misses_total counter"));
    }
}
