// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Composite scoring: 40% throughput, 30% latency, 30% stability.

use serde::Serialize;

use super::stats::TestResult;

/// Sub-scores and the weighted overall, each on 0..100.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Scores {
    pub throughput: f64,
    pub latency: f64,
    pub stability: f64,
    pub overall: f64,
}

/// Computes the composite score for one run against the scenario's
/// reference throughput and latency.
pub fn composite(result: &TestResult, reference_tps: f64, reference_latency_ms: f64)
                 -> Scores
{
    let throughput = if reference_tps > 0.0 {
        (100.0 * result.tps / reference_tps).min(100.0)
    } else {
        0.0
    };

    let latency = if result.avg_ms > 0.0 {
        (100.0 * reference_latency_ms / result.avg_ms).min(100.0)
    } else {
        100.0
    };

    let stability = stability_score(result);

    Scores {
        throughput,
        latency,
        stability,
        overall: 0.4 * throughput + 0.3 * latency + 0.3 * stability,
    }
}

fn stability_score(result: &TestResult) -> f64 {
    let rate = result.success_rate;
    let mut score: f64 = if rate >= 100.0 {
        100.0
    } else if rate >= 95.0 {
        90.0
    } else if rate >= 90.0 {
        80.0
    } else if rate >= 85.0 {
        70.0
    } else if rate >= 80.0 {
        60.0
    } else {
        50.0
    };

    if result.p95_ms > 3.0 * result.median_ms {
        score -= 10.0;
    }
    if result.p99_ms > 2.0 * result.p95_ms {
        score -= 10.0;
    }
    score -= 5.0 * result.error_rate();
    if result.any_client_timed_out {
        score -= 15.0;
    }
    score.max(0.0)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::super::stats::TestResult;
    use super::composite;

    fn result(tps: f64, avg_ms: f64, success_rate: f64, median_ms: f64,
              p95_ms: f64, p99_ms: f64, errors: u64, total: u64,
              timed_out: bool) -> TestResult
    {
        TestResult {
            engine: "x".into(),
            scenario: "y".into(),
            total,
            success: total - errors,
            errors,
            success_rate,
            min_ms: median_ms / 2.0,
            avg_ms,
            median_ms,
            p95_ms,
            p99_ms,
            max_ms: p99_ms * 2.0,
            duration_ms: 1_000.0,
            tps,
            error_buckets: BTreeMap::new(),
            any_client_timed_out: timed_out,
        }
    }

    #[test]
    fn perfect_run_scores_one_hundred() {
        // TPS at reference, latency at reference, no errors, tight tail.
        let run = result(500.0, 20.0, 100.0, 18.0, 20.0, 22.0, 0, 500, false);
        let scores = composite(&run, 500.0, 20.0);
        assert_eq!(scores.throughput, 100.0);
        assert_eq!(scores.latency, 100.0);
        assert_eq!(scores.stability, 100.0);
        assert_eq!(scores.overall, 100.0);
    }

    #[test]
    fn throughput_and_latency_are_capped() {
        let run = result(5_000.0, 1.0, 100.0, 1.0, 1.5, 1.8, 0, 100, false);
        let scores = composite(&run, 500.0, 20.0);
        assert_eq!(scores.throughput, 100.0);
        assert_eq!(scores.latency, 100.0);
    }

    #[test]
    fn sub_reference_runs_scale_linearly() {
        let run = result(250.0, 40.0, 100.0, 38.0, 40.0, 42.0, 0, 100, false);
        let scores = composite(&run, 500.0, 20.0);
        assert_eq!(scores.throughput, 50.0);
        assert_eq!(scores.latency, 50.0);
    }

    #[test]
    fn stability_tiers() {
        let mut run = result(1.0, 1.0, 96.0, 1.0, 1.0, 1.0, 0, 100, false);
        // Keep penalties out of the way: zero errors recorded although
        // the rate field drives the tier.
        assert_eq!(super::stability_score(&run), 90.0);
        run.success_rate = 92.0;
        assert_eq!(super::stability_score(&run), 80.0);
        run.success_rate = 86.0;
        assert_eq!(super::stability_score(&run), 70.0);
        run.success_rate = 81.0;
        assert_eq!(super::stability_score(&run), 60.0);
        run.success_rate = 60.0;
        assert_eq!(super::stability_score(&run), 50.0);
    }

    #[test]
    fn tail_and_timeout_penalties() {
        // p95 > 3x median.
        let run = result(1.0, 1.0, 100.0, 10.0, 40.0, 50.0, 0, 100, false);
        assert_eq!(super::stability_score(&run), 90.0);

        // p99 > 2x p95 as well.
        let run = result(1.0, 1.0, 100.0, 10.0, 40.0, 100.0, 0, 100, false);
        assert_eq!(super::stability_score(&run), 80.0);

        // A timed-out client costs 15 more.
        let run = result(1.0, 1.0, 100.0, 10.0, 10.0, 10.0, 0, 100, true);
        assert_eq!(super::stability_score(&run), 85.0);
    }

    #[test]
    fn error_penalty_and_floor() {
        // 10% errors: tier 80 (rate 90) minus 50 = 30.
        let run = result(1.0, 1.0, 90.0, 10.0, 10.0, 10.0, 10, 100, false);
        assert_eq!(super::stability_score(&run), 30.0);

        // Catastrophic runs floor at zero.
        let run = result(1.0, 1.0, 10.0, 10.0, 10.0, 10.0, 90, 100, true);
        assert_eq!(super::stability_score(&run), 0.0);
    }
}
