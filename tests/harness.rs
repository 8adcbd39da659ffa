// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Benchmark-harness runs against live engines.

use std::net::SocketAddr;
use std::time::Duration;

use triptych::bench::{self, EngineRun, Scenario};
use triptych::engine::{Engine, EventLoopServer, HybridServer, ThreadedServer};
use triptych::mgmt;
use triptych::{Config, Router};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn bench_router() -> Router {
    let mut router = Router::new();
    mgmt::mount_benchmark_endpoints(&mut router);
    router
}

fn small_config() -> Config {
    Config {
        port: 0,
        thread_pool_size: 16,
        offload_workers: 4,
        ..Config::default()
    }
}

fn target_of(engine: &dyn Engine) -> SocketAddr {
    ([127, 0, 0, 1], engine.local_addr().port()).into()
}

#[test]
fn the_basic_scenario_completes_cleanly_on_every_engine() {
    init_logging();
    let scenario = Scenario::basic().scaled(8, 160);

    let mut runs = Vec::new();
    {
        let mut server = ThreadedServer::start(small_config(), bench_router()).unwrap();
        runs.push(bench::run(server.name(), &scenario, target_of(&server)));
        server.stop();
    }
    {
        let mut server = HybridServer::start(small_config(), bench_router()).unwrap();
        runs.push(bench::run(server.name(), &scenario, target_of(&server)));
        server.stop();
    }
    {
        let mut server = EventLoopServer::start(small_config(), bench_router()).unwrap();
        runs.push(bench::run(server.name(), &scenario, target_of(&server)));
        server.stop();
    }

    for result in &runs {
        assert_eq!(result.total, 160, "{}: {:?}", result.engine, result.error_buckets);
        assert_eq!(result.success, 160, "{}: {:?}", result.engine, result.error_buckets);
        assert_eq!(result.success_rate, 100.0);
        assert!(result.tps > 0.0);
        assert!(result.min_ms <= result.p99_ms);
        assert!(!result.any_client_timed_out);
    }
}

#[test]
fn scoring_and_comparison_compose_over_a_real_run() {
    init_logging();
    let scenario = Scenario::basic().scaled(4, 80);

    let mut engine_runs = Vec::new();
    {
        let mut server = ThreadedServer::start(small_config(), bench_router()).unwrap();
        let result = bench::run(server.name(), &scenario, target_of(&server));
        let scores = bench::composite(&result, scenario.reference_tps,
                                      scenario.reference_latency_ms);
        engine_runs.push(EngineRun { result, scores });
        server.stop();
    }
    {
        let mut server = EventLoopServer::start(small_config(), bench_router()).unwrap();
        let result = bench::run(server.name(), &scenario, target_of(&server));
        let scores = bench::composite(&result, scenario.reference_tps,
                                      scenario.reference_latency_ms);
        engine_runs.push(EngineRun { result, scores });
        server.stop();
    }

    for run in &engine_runs {
        assert!(run.scores.overall > 0.0 && run.scores.overall <= 100.0);
        assert!(run.scores.stability >= 50.0, "stability {:?}", run.scores);
    }

    let comparison = bench::compare(scenario.name, &engine_runs);
    let names: Vec<&str> = engine_runs.iter().map(|r| r.result.engine.as_str()).collect();
    assert!(names.contains(&comparison.champion.as_str()));
    assert!(comparison.analysis.len() >= 4);

    // The records serialise for the reporting layer.
    let serialised = serde_json::to_string(&engine_runs).unwrap();
    assert!(serialised.contains("\"tps\""));
    let serialised = serde_json::to_string(&comparison).unwrap();
    assert!(serialised.contains("champion"));
}

#[test]
fn the_io_scenario_holds_no_reactor_thread_on_the_event_loop() {
    init_logging();
    // 12 concurrent 100 ms waits on a 2-thread offload pool finish in
    // ~one wait, not six, because the waits are timer events.
    let config = Config {
        port: 0,
        offload_workers: 2,
        ..Config::default()
    };
    let mut server = EventLoopServer::start(config, bench_router()).unwrap();
    let scenario = Scenario::io_intensive().scaled(12, 12);

    let started = std::time::Instant::now();
    let result = bench::run(server.name(), &scenario, target_of(&server));
    let elapsed = started.elapsed();

    assert_eq!(result.success, 12, "buckets: {:?}", result.error_buckets);
    assert!(
        elapsed < Duration::from_millis(450),
        "twelve 100 ms waits took {:?}", elapsed,
    );
    server.stop();
}

// Machine-dependent throughput ratio; run explicitly with --ignored.
#[test]
#[ignore]
fn event_loop_outpaces_threaded_on_waiting_workloads() {
    init_logging();
    let scenario = Scenario {
        concurrency: 400,
        duration: Some(Duration::from_secs(6)),
        total_requests: None,
        ..Scenario::io_intensive()
    };

    let threaded_result = {
        let config = Config { port: 0, thread_pool_size: 200, ..Config::default() };
        let mut server = ThreadedServer::start(config, bench_router()).unwrap();
        let result = bench::run(server.name(), &scenario, target_of(&server));
        server.stop();
        result
    };

    let event_loop_result = {
        let config = Config { port: 0, ..Config::default() };
        let mut server = EventLoopServer::start(config, bench_router()).unwrap();
        let result = bench::run(server.name(), &scenario, target_of(&server));
        server.stop();
        result
    };

    assert!(
        event_loop_result.tps > threaded_result.tps,
        "event loop {:.1} tps vs threaded {:.1} tps",
        event_loop_result.tps, threaded_result.tps,
    );
}
