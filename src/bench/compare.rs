// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Cross-engine comparison for one scenario: per-metric winners and a
//! champion by majority vote.

use std::collections::HashMap;

use serde::Serialize;

use super::score::Scores;
use super::stats::TestResult;

/// One engine's scored run of a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct EngineRun {
    pub result: TestResult,
    pub scores: Scores,
}

/// The comparison record for one scenario across engines.
#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub scenario: String,
    pub throughput_winner: String,
    pub latency_winner: String,
    pub stability_winner: String,
    pub overall_winner: String,
    /// Majority vote across the four winners above; ties go to the
    /// higher overall score, then to registration order.
    pub champion: String,
    pub analysis: Vec<String>,
}

/// Compares at least one run. Winners are by achieved TPS, lowest
/// average latency, stability sub-score and overall composite.
pub fn compare(scenario: &str, runs: &[EngineRun]) -> Comparison {
    assert!(!runs.is_empty(), "nothing to compare");

    let throughput = best(runs, |a, b| a.result.tps > b.result.tps);
    let latency = best(runs, |a, b| a.result.avg_ms < b.result.avg_ms);
    let stability = best(runs, |a, b| a.scores.stability > b.scores.stability);
    let overall = best(runs, |a, b| a.scores.overall > b.scores.overall);

    let winners = [
        throughput.result.engine.clone(),
        latency.result.engine.clone(),
        stability.result.engine.clone(),
        overall.result.engine.clone(),
    ];

    let mut votes: HashMap<&str, usize> = HashMap::new();
    for name in &winners {
        *votes.entry(name).or_insert(0) += 1;
    }
    let top_votes = votes.values().copied().max().unwrap_or(0);
    let champion = runs
        .iter()
        .filter(|run| votes.get(run.result.engine.as_str()) == Some(&top_votes))
        .max_by(|a, b| {
            a.scores.overall
                .partial_cmp(&b.scores.overall)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|run| run.result.engine.clone())
        .unwrap_or_else(|| overall.result.engine.clone());

    let mut analysis = Vec::new();
    analysis.push(format!(
        "{}: {} leads throughput at {:.1} requests/s",
        scenario, throughput.result.engine, throughput.result.tps,
    ));
    analysis.push(format!(
        "{}: {} has the lowest average latency at {:.2} ms",
        scenario, latency.result.engine, latency.result.avg_ms,
    ));
    analysis.push(format!(
        "{}: {} is the most stable (score {:.0}, {:.1}% success)",
        scenario, stability.result.engine, stability.scores.stability,
        stability.result.success_rate,
    ));
    for run in runs {
        analysis.push(format!(
            "{}: {} composite {:.1} ({:.1} tps, avg {:.2} ms, {:.1}% ok)",
            scenario, run.result.engine, run.scores.overall, run.result.tps,
            run.result.avg_ms, run.result.success_rate,
        ));
    }
    analysis.push(format!("{}: champion by majority vote: {}", scenario, champion));

    Comparison {
        scenario: scenario.to_owned(),
        throughput_winner: winners[0].clone(),
        latency_winner: winners[1].clone(),
        stability_winner: winners[2].clone(),
        overall_winner: winners[3].clone(),
        champion,
        analysis,
    }
}

fn best<F>(runs: &[EngineRun], better: F) -> &EngineRun
    where F: Fn(&EngineRun, &EngineRun) -> bool
{
    let mut winner = &runs[0];
    for run in &runs[1..] {
        if better(run, winner) {
            winner = run;
        }
    }
    winner
}
