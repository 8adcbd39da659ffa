// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Aggregation of client samples into one benchmark record.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use super::client::Sample;

/// Everything one (engine, scenario) run produced.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub engine: String,
    pub scenario: String,
    pub total: u64,
    pub success: u64,
    pub errors: u64,
    /// In percent, 0..100.
    pub success_rate: f64,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub duration_ms: f64,
    /// Successes per second of wall-clock run time.
    pub tps: f64,
    /// Failed requests keyed by error bucket; non-2xx/3xx statuses
    /// appear as `http_<code>`.
    pub error_buckets: BTreeMap<String, u64>,
    /// True if any virtual client hit its per-request budget.
    pub any_client_timed_out: bool,
}

impl TestResult {
    pub fn from_samples(engine: &str, scenario: &str, samples: &[Sample],
                        duration: Duration) -> TestResult
    {
        let total = samples.len() as u64;
        let success = samples.iter().filter(|sample| sample.is_success()).count() as u64;

        let mut error_buckets = BTreeMap::new();
        for sample in samples {
            if let Some(label) = sample.error_label() {
                *error_buckets.entry(label).or_insert(0) += 1;
            }
        }

        let mut latencies_us: Vec<u64> = samples
            .iter()
            .map(|sample| sample.latency.as_micros() as u64)
            .collect();
        latencies_us.sort_unstable();

        let to_ms = |us: u64| us as f64 / 1_000.0;
        let duration_secs = duration.as_secs_f64();

        TestResult {
            engine: engine.to_owned(),
            scenario: scenario.to_owned(),
            total,
            success,
            errors: total - success,
            success_rate: if total == 0 { 0.0 } else { success as f64 * 100.0 / total as f64 },
            min_ms: latencies_us.first().copied().map_or(0.0, to_ms),
            avg_ms: if latencies_us.is_empty() {
                0.0
            } else {
                to_ms(latencies_us.iter().sum::<u64>() / latencies_us.len() as u64)
            },
            median_ms: to_ms(nearest_rank(&latencies_us, 0.50)),
            p95_ms: to_ms(nearest_rank(&latencies_us, 0.95)),
            p99_ms: to_ms(nearest_rank(&latencies_us, 0.99)),
            max_ms: latencies_us.last().copied().map_or(0.0, to_ms),
            duration_ms: duration_secs * 1_000.0,
            tps: if duration_secs > 0.0 { success as f64 / duration_secs } else { 0.0 },
            error_buckets,
            any_client_timed_out: samples.iter().any(|sample| sample.timed_out()),
        }
    }

    /// Fraction of requests that failed, in percent.
    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.errors as f64 * 100.0 / self.total as f64
        }
    }
}

// Nearest-rank percentile over an already-sorted slice.
fn nearest_rank(sorted: &[u64], quantile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.max(1) - 1]
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::client::{ErrorBucket, Sample};
    use super::*;

    fn ok_sample(ms: u64) -> Sample {
        Sample { latency: Duration::from_millis(ms), result: Ok(200) }
    }

    #[test]
    fn nearest_rank_percentiles() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(nearest_rank(&sorted, 0.50), 50);
        assert_eq!(nearest_rank(&sorted, 0.95), 95);
        assert_eq!(nearest_rank(&sorted, 0.99), 99);
        assert_eq!(nearest_rank(&sorted, 1.0), 100);
        assert_eq!(nearest_rank(&[42], 0.5), 42);
        assert_eq!(nearest_rank(&[], 0.5), 0);
    }

    #[test]
    fn aggregates_counts_and_buckets() {
        let samples = vec![
            ok_sample(10),
            ok_sample(20),
            Sample { latency: Duration::from_millis(5), result: Ok(503) },
            Sample { latency: Duration::from_millis(1), result: Err(ErrorBucket::Timeout) },
        ];
        let result = TestResult::from_samples("threaded", "basic", &samples,
                                              Duration::from_secs(2));
        assert_eq!(result.total, 4);
        assert_eq!(result.success, 2);
        assert_eq!(result.errors, 2);
        assert_eq!(result.success_rate, 50.0);
        assert_eq!(result.tps, 1.0);
        assert_eq!(result.error_buckets["http_503"], 1);
        assert_eq!(result.error_buckets["timeout"], 1);
        assert!(result.any_client_timed_out);
        assert_eq!(result.error_rate(), 50.0);
    }

    #[test]
    fn latency_summary_is_ordered() {
        let samples: Vec<Sample> = (1..=50).map(ok_sample).collect();
        let result = TestResult::from_samples("hybrid", "basic", &samples,
                                              Duration::from_secs(1));
        assert!(result.min_ms <= result.median_ms);
        assert!(result.median_ms <= result.p95_ms);
        assert!(result.p95_ms <= result.p99_ms);
        assert!(result.p99_ms <= result.max_ms);
        assert_eq!(result.min_ms, 1.0);
        assert_eq!(result.max_ms, 50.0);
    }
}
