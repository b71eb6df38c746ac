use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

/// Latency samples kept per operation.
pub const MAX_SAMPLES: usize = 1024;

#[derive(Default)]
struct OperationStats {
    count: u64,
    errors: u64,
    samples: VecDeque<f64>,
}

/// Thread-safe per-operation counters and latency samples for the registry.
#[derive(Default)]
pub struct MetricsCollector {
    ops: Mutex<HashMap<&'static str, OperationStats>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished operation.
    pub fn record(&self, operation: &'static str, duration_ms: f64, ok: bool) {
        tracing::debug!("Metric {}: {:.2}ms ok={}", operation, duration_ms, ok);

        let mut ops = self.ops.lock();
        let stats = ops.entry(operation).or_default();
        stats.count += 1;
        if !ok {
            stats.errors += 1;
        }
        if stats.samples.len() == MAX_SAMPLES {
            stats.samples.pop_front();
        }
        stats.samples.push_back(duration_ms);
    }

    /// Summary per operation name.
    pub fn summary(&self) -> BTreeMap<String, MetricsSummary> {
        let ops = self.ops.lock();
        ops.iter()
            .map(|(name, stats)| (name.to_string(), Self::summarize(stats)))
            .collect()
    }

    fn summarize(stats: &OperationStats) -> MetricsSummary {
        let durations: Vec<f64> = stats.samples.iter().copied().collect();
        if durations.is_empty() {
            return MetricsSummary::default();
        }

        MetricsSummary {
            operation_count: stats.count,
            error_count: stats.errors,
            avg_duration_ms: durations.iter().sum::<f64>() / durations.len() as f64,
            min_duration_ms: durations.iter().fold(f64::INFINITY, |a, &b| a.min(b)),
            max_duration_ms: durations.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b)),
            p50_duration_ms: Self::percentile(&durations, 50.0),
            p95_duration_ms: Self::percentile(&durations, 95.0),
            p99_duration_ms: Self::percentile(&durations, 99.0),
        }
    }

    fn percentile(data: &[f64], percentile: f64) -> f64 {
        if data.is_empty() {
            return 0.0;
        }

        let mut sorted = data.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let index = (percentile / 100.0 * (sorted.len() - 1) as f64).round() as usize;
        sorted[index.min(sorted.len() - 1)]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MetricsSummary {
    pub operation_count: u64,
    pub error_count: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
}

/// Records the elapsed time of an operation when dropped.
///
/// Counts as an error unless [`OperationTimer::finish`] is called with `true`,
/// so a cancelled operation shows up as failed.
pub struct OperationTimer<'a> {
    collector: &'a MetricsCollector,
    name: &'static str,
    start: Instant,
    ok: bool,
}

impl<'a> OperationTimer<'a> {
    pub fn start(collector: &'a MetricsCollector, name: &'static str) -> Self {
        Self {
            collector,
            name,
            start: Instant::now(),
            ok: false,
        }
    }

    pub fn finish(mut self, ok: bool) {
        self.ok = ok;
    }
}

impl Drop for OperationTimer<'_> {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64() * 1000.0;
        self.collector.record(self.name, duration, self.ok);
    }
}

/// Start timing an operation against a collector.
#[macro_export]
macro_rules! measure_operation {
    ($collector:expr, $operation_name:expr) => {
        $crate::metrics::OperationTimer::start(&$collector, $operation_name)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_summarize() {
        let m = MetricsCollector::new();
        for i in 1..=100 {
            m.record("recognize", i as f64, i % 10 != 0);
        }
        let summary = &m.summary()["recognize"];
        assert_eq!(summary.operation_count, 100);
        assert_eq!(summary.error_count, 10);
        assert_eq!(summary.min_duration_ms, 1.0);
        assert_eq!(summary.max_duration_ms, 100.0);
        assert!((summary.avg_duration_ms - 50.5).abs() < 1e-9);
        assert!(summary.p50_duration_ms >= 50.0 && summary.p50_duration_ms <= 51.0);
    }

    #[test]
    fn test_samples_are_bounded() {
        let m = MetricsCollector::new();
        for i in 0..(MAX_SAMPLES + 10) {
            m.record("register", i as f64, true);
        }
        let summary = &m.summary()["register"];
        assert_eq!(summary.operation_count, (MAX_SAMPLES + 10) as u64);
        assert_eq!(summary.min_duration_ms, 10.0);
    }

    #[test]
    fn test_timer_counts_dropped_operation_as_error() {
        let m = MetricsCollector::new();
        {
            let _timer = measure_operation!(m, "delete");
        }
        measure_operation!(m, "delete").finish(true);

        let summary = &m.summary()["delete"];
        assert_eq!(summary.operation_count, 2);
        assert_eq!(summary.error_count, 1);
    }
}
