// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Per-engine counters and a bucketed latency histogram.
//!
//! Everything on the request path is an atomic add; snapshots for the
//! management endpoints read the atomics without stopping writers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

// Upper bounds of the latency buckets, in microseconds. The last bucket
// is open-ended.
const BUCKET_BOUNDS_US: [u64; 16] = [
    100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000,
    250_000, 500_000, 1_000_000, 2_500_000, 5_000_000, 10_000_000,
];

/// Lock-free sampled latency histogram.
pub struct LatencyHistogram {
    buckets: [AtomicU64; 17],
    count: AtomicU64,
    sum_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> LatencyHistogram {
        LatencyHistogram {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency: Duration) {
        let us = latency.as_micros() as u64;
        let index = BUCKET_BOUNDS_US
            .iter()
            .position(|&bound| us <= bound)
            .unwrap_or(BUCKET_BOUNDS_US.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Estimated quantile, reported as the upper bound of the bucket the
    /// target sample falls in. The open-ended bucket reports the true
    /// maximum.
    pub fn quantile(&self, q: f64) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        let target = ((q * count as f64).ceil() as u64).max(1);
        let mut cumulative = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return if index < BUCKET_BOUNDS_US.len() {
                    BUCKET_BOUNDS_US[index]
                } else {
                    self.max_us.load(Ordering::Relaxed)
                };
            }
        }
        self.max_us.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_us.load(Ordering::Relaxed);
        HistogramSnapshot {
            count,
            min_us: if count == 0 { 0 } else { self.min_us.load(Ordering::Relaxed) },
            avg_us: if count == 0 { 0 } else { sum / count },
            p50_us: self.quantile(0.50),
            p95_us: self.quantile(0.95),
            p99_us: self.quantile(0.99),
            max_us: self.max_us.load(Ordering::Relaxed),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> LatencyHistogram {
        LatencyHistogram::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub min_us: u64,
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Counters one engine instance maintains for its whole lifetime.
pub struct ServerMetrics {
    started: Instant,
    total_requests: AtomicU64,
    responses_success: AtomicU64,
    responses_client_error: AtomicU64,
    responses_server_error: AtomicU64,
    parse_failures: AtomicU64,
    handler_failures: AtomicU64,
    deadline_timeouts: AtomicU64,
    overloads: AtomicU64,
    peer_disconnects: AtomicU64,
    rejected_submissions: AtomicU64,
    active_connections: AtomicUsize,
    total_connections: AtomicU64,
    latency: LatencyHistogram,
}

impl ServerMetrics {
    pub fn new() -> ServerMetrics {
        ServerMetrics {
            started: Instant::now(),
            total_requests: AtomicU64::new(0),
            responses_success: AtomicU64::new(0),
            responses_client_error: AtomicU64::new(0),
            responses_server_error: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            deadline_timeouts: AtomicU64::new(0),
            overloads: AtomicU64::new(0),
            peer_disconnects: AtomicU64::new(0),
            rejected_submissions: AtomicU64::new(0),
            active_connections: AtomicUsize::new(0),
            total_connections: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    /// A response went out; classify it and sample its latency.
    pub fn record_response(&self, status_code: u16, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if status_code < 400 {
            self.responses_success.fetch_add(1, Ordering::Relaxed);
        } else if status_code < 500 {
            self.responses_client_error.fetch_add(1, Ordering::Relaxed);
        } else {
            self.responses_server_error.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.record(latency);
    }

    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deadline_timeout(&self) {
        self.deadline_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overload(&self) {
        self.overloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peer_disconnect(&self) {
        self.peer_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_submission(&self) {
        self.rejected_submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            uptime_ms: self.started.elapsed().as_millis() as u64,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            responses_success: self.responses_success.load(Ordering::Relaxed),
            responses_client_error: self.responses_client_error.load(Ordering::Relaxed),
            responses_server_error: self.responses_server_error.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            deadline_timeouts: self.deadline_timeouts.load(Ordering::Relaxed),
            overloads: self.overloads.load(Ordering::Relaxed),
            peer_disconnects: self.peer_disconnects.load(Ordering::Relaxed),
            rejected_submissions: self.rejected_submissions.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::SeqCst),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> ServerMetrics {
        ServerMetrics::new()
    }
}

/// Serialisable aggregate for `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp_ms: u64,
    pub uptime_ms: u64,
    pub total_requests: u64,
    pub responses_success: u64,
    pub responses_client_error: u64,
    pub responses_server_error: u64,
    pub parse_failures: u64,
    pub handler_failures: u64,
    pub deadline_timeouts: u64,
    pub overloads: u64,
    pub peer_disconnects: u64,
    pub rejected_submissions: u64,
    pub active_connections: usize,
    pub total_connections: u64,
    pub latency: HistogramSnapshot,
}
