// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The benchmarking harness.
//!
//! A scenario names an endpoint, a concurrency level, a workload size
//! and the reference numbers its scores are normalised against. The
//! driver spawns that many virtual clients, lines them up on a barrier
//! so the measurement window starts together, and funnels every sample
//! into one [`TestResult`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use log::info;

pub mod client;
pub mod compare;
pub mod score;
pub mod stats;

pub use self::client::{ErrorBucket, Sample};
pub use self::compare::{compare, Comparison, EngineRun};
pub use self::score::{composite, Scores};
pub use self::stats::TestResult;

/// The five canonical workload shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioKind {
    Basic,
    Concurrency,
    CpuIntensive,
    IoIntensive,
    MemoryPressure,
}

/// A runnable workload description.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub kind: ScenarioKind,
    pub name: &'static str,
    /// The endpoint the engines mount for this scenario.
    pub path: &'static str,
    pub concurrency: usize,
    /// Stop after this many requests in total, or...
    pub total_requests: Option<u64>,
    /// ...after this much wall-clock time, whichever is configured.
    pub duration: Option<Duration>,
    pub request_timeout: Duration,
    pub reference_tps: f64,
    pub reference_latency_ms: f64,
}

impl Scenario {
    /// Light traffic at low concurrency; the baseline.
    pub fn basic() -> Scenario {
        Scenario {
            kind: ScenarioKind::Basic,
            name: "BASIC",
            path: "/bench/basic",
            concurrency: 25,
            total_requests: Some(1_000),
            duration: None,
            request_timeout: Duration::from_secs(5),
            reference_tps: 2_000.0,
            reference_latency_ms: 5.0,
        }
    }

    /// Hundreds of clients hammering a trivial endpoint; exercises the
    /// accept path and pipeline throughput.
    pub fn concurrency() -> Scenario {
        Scenario {
            kind: ScenarioKind::Concurrency,
            name: "CONCURRENCY",
            path: "/bench/basic",
            concurrency: 400,
            total_requests: None,
            duration: Some(Duration::from_secs(8)),
            request_timeout: Duration::from_secs(10),
            reference_tps: 5_000.0,
            reference_latency_ms: 20.0,
        }
    }

    /// A deterministic compute loop per request.
    pub fn cpu_intensive() -> Scenario {
        Scenario {
            kind: ScenarioKind::CpuIntensive,
            name: "CPU_INTENSIVE",
            path: "/bench/cpu",
            concurrency: 50,
            total_requests: Some(500),
            duration: None,
            request_timeout: Duration::from_secs(30),
            reference_tps: 300.0,
            reference_latency_ms: 60.0,
        }
    }

    /// Every request waits on a simulated 100 ms downstream call.
    pub fn io_intensive() -> Scenario {
        Scenario {
            kind: ScenarioKind::IoIntensive,
            name: "IO_INTENSIVE",
            path: "/bench/io",
            concurrency: 400,
            total_requests: None,
            duration: Some(Duration::from_secs(10)),
            request_timeout: Duration::from_secs(10),
            reference_tps: 2_000.0,
            reference_latency_ms: 150.0,
        }
    }

    /// Large bodies allocated per request; stresses the allocator and
    /// the write-side back-pressure.
    pub fn memory_pressure() -> Scenario {
        Scenario {
            kind: ScenarioKind::MemoryPressure,
            name: "MEMORY_PRESSURE",
            path: "/bench/memory",
            concurrency: 50,
            total_requests: None,
            duration: Some(Duration::from_secs(6)),
            request_timeout: Duration::from_secs(15),
            reference_tps: 400.0,
            reference_latency_ms: 60.0,
        }
    }

    /// All five, in their canonical order.
    pub fn all() -> Vec<Scenario> {
        vec![
            Scenario::basic(),
            Scenario::concurrency(),
            Scenario::cpu_intensive(),
            Scenario::io_intensive(),
            Scenario::memory_pressure(),
        ]
    }

    /// Shrinks the workload; used by tests and smoke runs.
    pub fn scaled(mut self, concurrency: usize, total_requests: u64) -> Scenario {
        self.concurrency = concurrency;
        self.total_requests = Some(total_requests);
        self.duration = None;
        self
    }
}

/// Drives one scenario against one engine and aggregates the samples.
///
/// Clients do not reuse connections, matching the `Connection: close`
/// policy the engines emit, and all start from a barrier so the window
/// is uniform.
pub fn run(engine_name: &str, scenario: &Scenario, target: SocketAddr) -> TestResult {
    info!("benchmark: {} / {} at concurrency {}",
          engine_name, scenario.name, scenario.concurrency);

    let barrier = Arc::new(Barrier::new(scenario.concurrency + 1));
    let stop = Arc::new(AtomicBool::new(false));
    // In request-count mode each worker reserves requests off this
    // budget; in duration mode the budget is effectively infinite and
    // the stop flag ends the run.
    let budget = Arc::new(AtomicI64::new(
        scenario.total_requests.map_or(i64::MAX, |n| n as i64),
    ));

    let mut workers = Vec::with_capacity(scenario.concurrency);
    for _ in 0..scenario.concurrency {
        let barrier = barrier.clone();
        let stop = stop.clone();
        let budget = budget.clone();
        let path = scenario.path;
        let timeout = scenario.request_timeout;
        workers.push(thread::spawn(move || {
            let mut samples = Vec::new();
            barrier.wait();
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if budget.fetch_sub(1, Ordering::Relaxed) <= 0 {
                    break;
                }
                samples.push(client::fetch(target, path, timeout));
            }
            samples
        }));
    }

    barrier.wait();
    let started = Instant::now();

    if let Some(duration) = scenario.duration {
        thread::sleep(duration);
        stop.store(true, Ordering::Relaxed);
    }

    let mut samples = Vec::new();
    for worker in workers {
        if let Ok(mut collected) = worker.join() {
            samples.append(&mut collected);
        }
    }
    let elapsed = started.elapsed();

    TestResult::from_samples(engine_name, scenario.name, &samples, elapsed)
}

#[cfg(test)]
mod tests {
    use super::{Scenario, ScenarioKind};

    #[test]
    fn canonical_scenarios_are_complete() {
        let all = Scenario::all();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].kind, ScenarioKind::Basic);
        assert!(all[0].concurrency <= 50);
        for scenario in &all {
            assert!(scenario.concurrency >= 1);
            assert!(scenario.total_requests.is_some() || scenario.duration.is_some());
            assert!(scenario.reference_tps > 0.0);
            assert!(scenario.reference_latency_ms > 0.0);
            assert!(scenario.path.starts_with('/'));
        }
    }

    #[test]
    fn scaling_swaps_to_request_count_mode() {
        let scenario = Scenario::io_intensive().scaled(4, 40);
        assert_eq!(scenario.concurrency, 4);
        assert_eq!(scenario.total_requests, Some(40));
        assert!(scenario.duration.is_none());
    }
}
