//! End-of-run summary: printed to stdout and optionally exported as JSON.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use yansi::Paint;

use crate::executor::RunResult;
use crate::metrics::{CheckCounts, MetricSummary};
use crate::options::RunOptions;
use crate::threshold::{self, ThresholdOutcome};

/// The outcome of a complete run.
#[derive(Clone, Debug, Serialize)]
pub struct Summary {
    /// Run time in seconds.
    pub duration: f64,
    /// `true` if the run was stopped before all stages elapsed.
    pub aborted: bool,
    /// Pass and fail counts per check.
    pub checks: Vec<CheckCounts>,
    /// All built-in metrics.
    pub metrics: BTreeMap<&'static str, MetricSummary>,
    /// Results of all thresholds.
    pub thresholds: Vec<ThresholdOutcome>,
}

impl Summary {
    /// Summarizes the run and evaluates its thresholds.
    pub fn new(options: &RunOptions, result: &RunResult) -> Self {
        Self {
            duration: result.elapsed.as_secs_f64(),
            aborted: result.aborted,
            checks: result.metrics.checks().to_vec(),
            metrics: result.metrics.summarize(result.elapsed),
            thresholds: threshold::evaluate(options, &result.metrics, result.elapsed),
        }
    }

    /// Returns `true` if no threshold was crossed.
    pub fn passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.ok)
    }

    /// Writes the summary as pretty-printed JSON.
    pub fn export_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create `{}`", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .context("failed to serialize summary")?;
        Ok(())
    }
}

/// Prints the summary to stdout.
pub fn print_summary(summary: &Summary) {
    println!();
    print!("{}", "## SUMMARY".bold());
    print!(" ({:.2?}", Duration::from_secs_f64(summary.duration));
    if summary.aborted {
        print!(", {}", "ABORTED".bold().yellow());
    }
    println!(")");

    if !summary.checks.is_empty() {
        println!();
        println!("{}", "CHECKS:".bold());
        for check in &summary.checks {
            print_check(check);
        }
    }

    println!();
    println!("{}", "METRICS:".bold());
    for (name, metric) in &summary.metrics {
        print_metric(name, metric);
    }

    if !summary.thresholds.is_empty() {
        println!();
        println!("{}", "THRESHOLDS:".bold());
        for outcome in &summary.thresholds {
            print_threshold(outcome);
        }
    }

    println!();
    if summary.passed() {
        println!("{}", "PASSED".bold().green());
    } else {
        println!("{}", "THRESHOLDS CROSSED".bold().red());
    }
}

fn print_check(check: &CheckCounts) {
    let total = check.passes + check.fails;
    let percent = if total > 0 {
        check.passes as f64 * 100.0 / total as f64
    } else {
        100.0
    };

    if check.fails == 0 {
        println!("  {} {}", "✓".green(), check.name);
    } else {
        println!("  {} {}", "✗".red(), check.name);
    }
    println!(
        "    {:.2}% ({} passed, {} failed)",
        percent.bold(),
        check.passes,
        check.fails
    );
}

fn print_metric(name: &str, metric: &MetricSummary) {
    match *metric {
        MetricSummary::Counter { count, rate } => {
            println!("  {name:.<24} {} {:.2}/s", count.bold(), rate);
        }
        MetricSummary::Rate {
            rate,
            passes,
            fails,
        } => {
            println!(
                "  {name:.<24} {:.2}% ({passes} of {})",
                (rate * 100.0).bold(),
                passes + fails
            );
        }
        MetricSummary::Trend {
            count,
            avg,
            min,
            med,
            max,
            p90,
            p95,
            p99,
        } => {
            if count == 0 {
                println!("  {name:.<24} {}", "no samples".dim());
                return;
            }
            let ms = |value: Option<f64>| {
                value
                    .map(|ms| format!("{:.2?}", Duration::from_secs_f64(ms / 1000.0)))
                    .unwrap_or_else(|| "-".to_owned())
            };
            println!(
                "  {name:.<24} avg: {}; min: {}; med: {}; max: {}; p90: {}; p95: {}; p99: {}",
                ms(avg).bold(),
                ms(min),
                ms(med),
                ms(max),
                ms(p90),
                ms(p95),
                ms(p99),
            );
        }
        MetricSummary::Gauge { value, max } => {
            println!("  {name:.<24} {} (max {max})", value.bold());
        }
    }
}

fn print_threshold(outcome: &ThresholdOutcome) {
    let observed = match outcome.observed {
        Some(value) => format!("{value:.2}"),
        None => "no samples".to_owned(),
    };

    if outcome.ok {
        println!(
            "  {} {}: {} (observed {observed})",
            "✓".green(),
            outcome.metric,
            outcome.threshold
        );
    } else {
        println!(
            "  {} {}: {} (observed {})",
            "✗".red(),
            outcome.metric,
            outcome.threshold.bold(),
            observed.red()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CHECKS, HTTP_REQ_DURATION, Metrics};
    use crate::scenario::{BODY_CHECK, STATUS_CHECK};

    fn run_result(latencies_ms: &[u64]) -> RunResult {
        let mut metrics = Metrics::with_checks(&[STATUS_CHECK, BODY_CHECK]);
        for &ms in latencies_ms {
            metrics.record_request(Duration::from_millis(ms), Some(200), 4);
            metrics.record_check(STATUS_CHECK, true);
            metrics.record_check(BODY_CHECK, ms < 1000);
        }

        RunResult {
            metrics,
            elapsed: Duration::from_secs(15),
            aborted: false,
        }
    }

    #[test]
    fn fast_run_passes() {
        let summary = Summary::new(&RunOptions::default(), &run_result(&[10, 20, 30]));
        assert!(summary.passed());
        assert_eq!(summary.checks.len(), 2);
        assert_eq!(summary.thresholds.len(), 1);
        assert!(summary.metrics.contains_key(HTTP_REQ_DURATION));
        print_summary(&summary);
    }

    #[test]
    fn slow_run_crosses_threshold() {
        let mut latencies = vec![10; 95];
        latencies.extend([5000; 5]);

        let summary = Summary::new(&RunOptions::default(), &run_result(&latencies));
        assert!(!summary.passed());
        assert_eq!(summary.checks[1].fails, 5);
        print_summary(&summary);
    }

    #[test]
    fn exports_json() {
        let summary = Summary::new(&RunOptions::default(), &run_result(&[10]));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        summary.export_json(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(json["metrics"][CHECKS]["type"], "rate");
        assert_eq!(json["metrics"][CHECKS]["rate"], 1.0);
        assert_eq!(json["thresholds"][0]["threshold"], "p(99) < 3000");
        assert_eq!(json["thresholds"][0]["ok"], true);
    }
}
