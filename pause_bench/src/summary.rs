//! Aggregates the results files of a destination directory.

use anyhow::Context;
use camino::Utf8Path;
use tracing::info;

use crate::scenario::Scenario;
use crate::timing::{RunRecord, read_records};

/// Order statistics of one metric, in milliseconds. Percentiles use the
/// nearest-rank method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub min: i64,
    pub median: i64,
    pub p90: i64,
    pub max: i64,
}

impl Stats {
    pub fn of(values: impl IntoIterator<Item = i64>) -> Option<Self> {
        let mut sorted: Vec<i64> = values.into_iter().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();
        Some(Self {
            min: sorted[0],
            median: nearest_rank(&sorted, 50),
            p90: nearest_rank(&sorted, 90),
            max: sorted[sorted.len() - 1],
        })
    }
}

fn nearest_rank(sorted: &[i64], percentile: usize) -> i64 {
    let rank = (percentile * sorted.len()).div_ceil(100).max(1);
    sorted[rank - 1]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioSummary {
    pub scenario: Scenario,
    pub runs: usize,
    pub negative_overhead_runs: usize,
    /// `elapsed`, then `application` and `overhead` if the runs were decomposed.
    pub metrics: Vec<(&'static str, Stats)>,
}

impl ScenarioSummary {
    pub fn of(scenario: Scenario, records: &[RunRecord]) -> Option<Self> {
        let mut metrics = vec![(
            "elapsed",
            Stats::of(records.iter().map(RunRecord::elapsed_time_ms))?,
        )];
        let decomposed: Vec<_> = records.iter().filter_map(RunRecord::decomposed).collect();
        if let Some(application) = Stats::of(decomposed.iter().map(|r| r.application_time_ms)) {
            metrics.push(("application", application));
        }
        if let Some(overhead) = Stats::of(decomposed.iter().map(|r| r.overhead_time_ms)) {
            metrics.push(("overhead", overhead));
        }
        Some(Self {
            scenario,
            runs: records.len(),
            negative_overhead_runs: decomposed.iter().filter(|r| r.negative_overhead).count(),
            metrics,
        })
    }

    pub fn metric(&self, name: &str) -> Option<Stats> {
        self.metrics
            .iter()
            .find(|(metric, _)| *metric == name)
            .map(|(_, stats)| *stats)
    }
}

/// Summaries of the `scenarios` that have results in `dest_dir`.
pub fn load(dest_dir: &Utf8Path, scenarios: &[Scenario]) -> anyhow::Result<Vec<ScenarioSummary>> {
    let mut summaries = Vec::new();
    for &scenario in scenarios {
        let path = scenario.results_path(dest_dir);
        if !path.try_exists().with_context(|| format!("stat {path}"))? {
            info!(%scenario, "no results at {path}");
            continue;
        }
        let records = read_records(&path)?;
        if let Some(summary) = ScenarioSummary::of(scenario, &records) {
            summaries.push(summary);
        }
    }
    Ok(summaries)
}

pub fn render(summaries: &[ScenarioSummary]) -> comfy_table::Table {
    let mut table = comfy_table::Table::new();
    table.set_header([
        "Scenario",
        "Runs",
        "Metric",
        "Min [ms]",
        "Median [ms]",
        "P90 [ms]",
        "Max [ms]",
    ]);
    for summary in summaries {
        let runs = if summary.negative_overhead_runs > 0 {
            format!(
                "{} ({} negative overhead)",
                summary.runs, summary.negative_overhead_runs
            )
        } else {
            summary.runs.to_string()
        };
        for (metric, stats) in &summary.metrics {
            table.add_row([
                summary.scenario.to_string(),
                runs.clone(),
                metric.to_string(),
                stats.min.to_string(),
                stats.median.to_string(),
                stats.p90.to_string(),
                stats.max.to_string(),
            ]);
        }
    }
    table
}
