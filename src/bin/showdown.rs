// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Runs the three engines through the five canonical scenarios and
//! prints the comparison.
//!
//! Engine-agnostic flags are the usual configuration options
//! (`--port`, `--thread-pool-size`, ...); the runner itself understands
//! `--properties <file>`, `--quick` (a scaled-down workload) and
//! `--json` (dump every record as JSON at the end).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use triptych::bench::{self, EngineRun, Scenario};
use triptych::engine::{Engine, EventLoopServer, HybridServer, ThreadedServer};
use triptych::mgmt;
use triptych::{Config, Router};

struct RunnerArgs {
    config_args: Vec<String>,
    properties: Option<PathBuf>,
    quick: bool,
    json: bool,
}

fn parse_runner_args() -> RunnerArgs {
    let mut args = RunnerArgs {
        config_args: Vec::new(),
        properties: None,
        quick: false,
        json: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--quick" => args.quick = true,
            "--json" => args.json = true,
            "--properties" => {
                match iter.next() {
                    Some(path) => args.properties = Some(PathBuf::from(path)),
                    None => {
                        eprintln!("--properties needs a file path");
                        process::exit(2);
                    }
                }
            }
            _ => args.config_args.push(arg),
        }
    }
    args
}

fn benchmark_router() -> Router {
    let mut router = Router::new();
    mgmt::mount_benchmark_endpoints(&mut router);
    router
}

fn start_engine(name: &str, config: &Config) -> std::io::Result<Box<dyn Engine>> {
    // Port 0 gives each engine its own ephemeral listener, so the runs
    // cannot collide even when shutdown lingers.
    let config = Config { port: 0, ..config.clone() };
    Ok(match name {
        "threaded" => Box::new(ThreadedServer::start(config, benchmark_router())?),
        "hybrid" => Box::new(HybridServer::start(config, benchmark_router())?),
        "event-loop" => Box::new(EventLoopServer::start(config, benchmark_router())?),
        other => unreachable!("unknown engine {}", other),
    })
}

fn main() {
    env_logger::init();
    let runner = parse_runner_args();

    let config = match Config::load(&runner.config_args, runner.properties.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            process::exit(2);
        }
    };

    let scenarios: Vec<Scenario> = if runner.quick {
        Scenario::all().into_iter().map(|s| s.scaled(8, 200)).collect()
    } else {
        Scenario::all()
    };

    let engine_names = ["threaded", "hybrid", "event-loop"];
    let mut per_scenario: Vec<Vec<EngineRun>> = vec![Vec::new(); scenarios.len()];

    for engine_name in &engine_names {
        let mut engine = match start_engine(engine_name, &config) {
            Ok(engine) => engine,
            Err(err) => {
                eprintln!("failed to start {} engine: {}", engine_name, err);
                process::exit(1);
            }
        };
        let target: SocketAddr = ([127, 0, 0, 1], engine.local_addr().port()).into();
        println!("== {} on {} ==", engine.name(), target);

        for (index, scenario) in scenarios.iter().enumerate() {
            let result = bench::run(engine.name(), scenario, target);
            let scores = bench::composite(
                &result,
                scenario.reference_tps,
                scenario.reference_latency_ms,
            );
            println!(
                "  {:<16} {:>8.1} tps  avg {:>8.2} ms  p99 {:>8.2} ms  {:>5.1}% ok  score {:>5.1}",
                scenario.name, result.tps, result.avg_ms, result.p99_ms,
                result.success_rate, scores.overall,
            );
            per_scenario[index].push(EngineRun { result, scores });
        }

        engine.shutdown();
    }

    println!();
    let mut comparisons = Vec::new();
    let mut champion_tally: std::collections::HashMap<String, usize> =
        std::collections::HashMap::new();
    for (index, scenario) in scenarios.iter().enumerate() {
        let comparison = bench::compare(scenario.name, &per_scenario[index]);
        for line in &comparison.analysis {
            println!("{}", line);
        }
        println!();
        *champion_tally.entry(comparison.champion.clone()).or_insert(0) += 1;
        comparisons.push(comparison);
    }

    if let Some((name, wins)) = champion_tally.iter().max_by_key(|&(_, wins)| *wins) {
        println!("overall champion: {} ({} of {} scenarios)", name, wins, scenarios.len());
    }

    if runner.json {
        let report = serde_json::json!({
            "runs": per_scenario,
            "comparisons": comparisons,
        });
        match serde_json::to_string(&report) {
            Ok(serialised) => println!("{}", serialised),
            Err(err) => eprintln!("failed to serialise report: {}", err),
        }
    }
}
