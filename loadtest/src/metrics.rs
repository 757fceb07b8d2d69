//! Built-in metrics collected while a load test runs.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use sketches_ddsketch::DDSketch;

use crate::scenario::IterationOutcome;
use crate::threshold::Aggregation;

/// Total number of HTTP requests issued.
pub const HTTP_REQS: &str = "http_reqs";
/// Fraction of HTTP requests that failed at the transport level or with status >= 400.
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
/// Time from sending a request until its body was fully received, in milliseconds.
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
/// Number of completed iterations.
pub const ITERATIONS: &str = "iterations";
/// Wall-clock duration of one full iteration including the think time, in milliseconds.
pub const ITERATION_DURATION: &str = "iteration_duration";
/// Iterations aborted because the graceful stop period ran out.
pub const INTERRUPTED_ITERATIONS: &str = "interrupted_iterations";
/// Fraction of passed checks.
pub const CHECKS: &str = "checks";
/// Number of currently active virtual users.
pub const VUS: &str = "vus";
/// Highest number of concurrently active virtual users.
pub const VUS_MAX: &str = "vus_max";
/// Response body bytes received.
pub const DATA_RECEIVED: &str = "data_received";

/// How samples of a metric are accumulated.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// A monotonically increasing count.
    Counter,
    /// A fraction of non-zero samples.
    Rate,
    /// A distribution of values.
    Trend,
    /// The most recent value.
    Gauge,
}

impl MetricKind {
    /// Returns the kind of a built-in metric, or `None` for unknown names.
    pub fn of(metric: &str) -> Option<Self> {
        let kind = match metric {
            HTTP_REQS | ITERATIONS | INTERRUPTED_ITERATIONS | DATA_RECEIVED => Self::Counter,
            HTTP_REQ_FAILED | CHECKS => Self::Rate,
            HTTP_REQ_DURATION | ITERATION_DURATION => Self::Trend,
            VUS | VUS_MAX => Self::Gauge,
            _ => return None,
        };
        Some(kind)
    }
}

/// Pass and fail counts of a single named check.
#[derive(Clone, Debug, Serialize)]
pub struct CheckCounts {
    /// Name of the check.
    pub name: &'static str,
    /// Number of iterations in which the check held.
    pub passes: u64,
    /// Number of iterations in which the check did not hold.
    pub fails: u64,
}

/// Summary of a single metric, as reported at the end of a run.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSummary {
    /// See [`MetricKind::Counter`].
    Counter {
        /// Total count.
        count: u64,
        /// Count per second of run time.
        rate: f64,
    },
    /// See [`MetricKind::Rate`].
    Rate {
        /// Fraction of non-zero samples.
        rate: f64,
        /// Non-zero samples.
        passes: u64,
        /// Zero samples.
        fails: u64,
    },
    /// See [`MetricKind::Trend`].
    Trend {
        /// Number of samples.
        count: usize,
        /// Mean value.
        avg: Option<f64>,
        /// Minimum value.
        min: Option<f64>,
        /// Median.
        med: Option<f64>,
        /// Maximum value.
        max: Option<f64>,
        /// 90th percentile.
        p90: Option<f64>,
        /// 95th percentile.
        p95: Option<f64>,
        /// 99th percentile.
        p99: Option<f64>,
    },
    /// See [`MetricKind::Gauge`].
    Gauge {
        /// Last value.
        value: u64,
        /// Maximum value.
        max: u64,
    },
}

/// All metrics of a single run.
///
/// Trends are stored in [`DDSketch`]es, which bound the relative error of every quantile.
#[derive(Default)]
pub struct Metrics {
    http_reqs: u64,
    http_req_failures: u64,
    http_req_duration: DDSketch,

    iterations: u64,
    interrupted_iterations: u64,
    iteration_duration: DDSketch,

    checks: Vec<CheckCounts>,

    data_received: u64,

    vus: u64,
    vus_max: u64,
}

impl Metrics {
    /// Creates metrics with the given checks pre-registered in declaration order.
    pub fn with_checks(names: &[&'static str]) -> Self {
        let checks = names
            .iter()
            .map(|&name| CheckCounts {
                name,
                passes: 0,
                fails: 0,
            })
            .collect();

        Self {
            checks,
            ..Default::default()
        }
    }

    /// Records a single HTTP request.
    ///
    /// `status` is `None` if the request failed at the transport level. Such requests count as
    /// failed but contribute no sample to [`HTTP_REQ_DURATION`].
    pub fn record_request(&mut self, duration: Duration, status: Option<u16>, bytes: u64) {
        self.http_reqs += 1;
        match status {
            Some(status) => {
                if status >= 400 {
                    self.http_req_failures += 1;
                }
                self.http_req_duration.add(as_millis(duration));
            }
            None => self.http_req_failures += 1,
        }
        self.data_received += bytes;
    }

    /// Records the outcome of a named check.
    pub fn record_check(&mut self, name: &'static str, passed: bool) {
        let index = match self.checks.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                self.checks.push(CheckCounts {
                    name,
                    passes: 0,
                    fails: 0,
                });
                self.checks.len() - 1
            }
        };

        let counts = &mut self.checks[index];
        if passed {
            counts.passes += 1;
        } else {
            counts.fails += 1;
        }
    }

    /// Records the request and checks of an iteration as soon as the response is in.
    pub fn record_outcome(&mut self, outcome: &IterationOutcome) {
        self.record_request(
            outcome.request_duration,
            outcome.status,
            outcome.bytes_received,
        );
        for (name, passed) in outcome.checks {
            self.record_check(name, passed);
        }
    }

    /// Records a completed iteration, including its think time.
    pub fn record_iteration(&mut self, duration: Duration) {
        self.iterations += 1;
        self.iteration_duration.add(as_millis(duration));
    }

    /// Records iterations that were aborted before they could complete.
    pub fn record_interrupted(&mut self, count: u64) {
        self.interrupted_iterations += count;
    }

    /// Updates the number of active virtual users.
    pub fn set_vus(&mut self, vus: u64) {
        self.vus = vus;
        self.vus_max = self.vus_max.max(vus);
    }

    /// Number of completed iterations.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Number of issued HTTP requests.
    pub fn http_reqs(&self) -> u64 {
        self.http_reqs
    }

    /// Pass and fail counts per check, in declaration order.
    pub fn checks(&self) -> &[CheckCounts] {
        &self.checks
    }

    /// Reduces a metric to a single value.
    ///
    /// Returns `None` for unknown metrics, aggregations that do not apply to the metric, and
    /// metrics without any samples.
    pub fn aggregate(
        &self,
        metric: &str,
        aggregation: Aggregation,
        elapsed: Duration,
    ) -> Option<f64> {
        let kind = MetricKind::of(metric)?;
        if !aggregation.applies_to(kind) {
            return None;
        }

        match kind {
            MetricKind::Trend => {
                let sketch = match metric {
                    HTTP_REQ_DURATION => &self.http_req_duration,
                    _ => &self.iteration_duration,
                };
                trend_aggregate(sketch, aggregation)
            }
            MetricKind::Counter => {
                let count = match metric {
                    HTTP_REQS => self.http_reqs,
                    ITERATIONS => self.iterations,
                    INTERRUPTED_ITERATIONS => self.interrupted_iterations,
                    _ => self.data_received,
                };
                match aggregation {
                    Aggregation::Count => Some(count as f64),
                    _ if elapsed.is_zero() => None,
                    _ => Some(count as f64 / elapsed.as_secs_f64()),
                }
            }
            MetricKind::Rate => {
                let (passes, total) = match metric {
                    HTTP_REQ_FAILED => (self.http_req_failures, self.http_reqs),
                    _ => self.check_totals(),
                };
                (total > 0).then(|| passes as f64 / total as f64)
            }
            MetricKind::Gauge => {
                let value = match (metric, aggregation) {
                    (VUS, Aggregation::Value) => self.vus,
                    (VUS, Aggregation::Max) | (VUS_MAX, _) => self.vus_max,
                    (VUS, _) => 0,
                    _ => self.vus_max,
                };
                Some(value as f64)
            }
        }
    }

    fn check_totals(&self) -> (u64, u64) {
        self.checks.iter().fold((0, 0), |(passes, total), c| {
            (passes + c.passes, total + c.passes + c.fails)
        })
    }

    /// Summarizes all built-in metrics for reporting.
    pub fn summarize(&self, elapsed: Duration) -> BTreeMap<&'static str, MetricSummary> {
        let secs = elapsed.as_secs_f64();
        let counter = |count: u64| MetricSummary::Counter {
            count,
            rate: if secs > 0.0 { count as f64 / secs } else { 0.0 },
        };
        let rate = |passes: u64, total: u64| MetricSummary::Rate {
            rate: if total > 0 {
                passes as f64 / total as f64
            } else {
                0.0
            },
            passes,
            fails: total - passes,
        };
        let (check_passes, check_total) = self.check_totals();

        BTreeMap::from([
            (HTTP_REQS, counter(self.http_reqs)),
            (HTTP_REQ_FAILED, rate(self.http_req_failures, self.http_reqs)),
            (HTTP_REQ_DURATION, trend_summary(&self.http_req_duration)),
            (ITERATIONS, counter(self.iterations)),
            (INTERRUPTED_ITERATIONS, counter(self.interrupted_iterations)),
            (ITERATION_DURATION, trend_summary(&self.iteration_duration)),
            (CHECKS, rate(check_passes, check_total)),
            (DATA_RECEIVED, counter(self.data_received)),
            (
                VUS,
                MetricSummary::Gauge {
                    value: self.vus,
                    max: self.vus_max,
                },
            ),
            (
                VUS_MAX,
                MetricSummary::Gauge {
                    value: self.vus_max,
                    max: self.vus_max,
                },
            ),
        ])
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("http_reqs", &self.http_reqs)
            .field("http_req_failures", &self.http_req_failures)
            .field("iterations", &self.iterations)
            .field("interrupted_iterations", &self.interrupted_iterations)
            .field("checks", &self.checks)
            .field("data_received", &self.data_received)
            .field("vus", &self.vus)
            .field("vus_max", &self.vus_max)
            .finish_non_exhaustive()
    }
}

fn as_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn quantile(sketch: &DDSketch, q: f64) -> Option<f64> {
    sketch.quantile(q).ok().flatten()
}

fn trend_aggregate(sketch: &DDSketch, aggregation: Aggregation) -> Option<f64> {
    if sketch.count() == 0 {
        return None;
    }

    match aggregation {
        Aggregation::Avg => sketch.sum().map(|sum| sum / sketch.count() as f64),
        Aggregation::Min => sketch.min(),
        Aggregation::Max => sketch.max(),
        Aggregation::Med => quantile(sketch, 0.5),
        Aggregation::Percentile(p) => quantile(sketch, p / 100.0),
        _ => None,
    }
}

fn trend_summary(sketch: &DDSketch) -> MetricSummary {
    MetricSummary::Trend {
        count: sketch.count(),
        avg: trend_aggregate(sketch, Aggregation::Avg),
        min: trend_aggregate(sketch, Aggregation::Min),
        med: trend_aggregate(sketch, Aggregation::Med),
        max: trend_aggregate(sketch, Aggregation::Max),
        p90: trend_aggregate(sketch, Aggregation::Percentile(90.0)),
        p95: trend_aggregate(sketch, Aggregation::Percentile(95.0)),
        p99: trend_aggregate(sketch, Aggregation::Percentile(99.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: Option<f64>, expected: f64) {
        let actual = actual.unwrap();
        // DDSketch guarantees a relative error of 1% by default.
        assert!(
            (actual - expected).abs() <= expected * 0.02,
            "{actual} is not close to {expected}"
        );
    }

    #[test]
    fn trend_aggregations() {
        let mut metrics = Metrics::default();
        for ms in 1..=100 {
            metrics.record_request(Duration::from_millis(ms), Some(200), 2);
        }

        let elapsed = Duration::from_secs(10);
        assert_close(metrics.aggregate(HTTP_REQ_DURATION, Aggregation::Avg, elapsed), 50.5);
        assert_close(metrics.aggregate(HTTP_REQ_DURATION, Aggregation::Min, elapsed), 1.0);
        assert_close(metrics.aggregate(HTTP_REQ_DURATION, Aggregation::Max, elapsed), 100.0);
        assert_close(metrics.aggregate(HTTP_REQ_DURATION, Aggregation::Med, elapsed), 50.0);
        assert_close(
            metrics.aggregate(HTTP_REQ_DURATION, Aggregation::Percentile(99.0), elapsed),
            99.0,
        );

        assert_eq!(metrics.aggregate(HTTP_REQS, Aggregation::Count, elapsed), Some(100.0));
        assert_eq!(metrics.aggregate(HTTP_REQS, Aggregation::Rate, elapsed), Some(10.0));
        assert_eq!(metrics.aggregate(DATA_RECEIVED, Aggregation::Count, elapsed), Some(200.0));
    }

    #[test]
    fn failed_requests_rate() {
        let mut metrics = Metrics::default();
        metrics.record_request(Duration::from_millis(1), Some(200), 0);
        metrics.record_request(Duration::from_millis(1), Some(404), 0);
        metrics.record_request(Duration::from_millis(1), Some(500), 0);
        metrics.record_request(Duration::from_millis(1), None, 0);

        let rate = metrics.aggregate(HTTP_REQ_FAILED, Aggregation::Rate, Duration::from_secs(1));
        assert_eq!(rate, Some(0.75));
    }

    #[test]
    fn transport_failures_have_no_duration() {
        let mut metrics = Metrics::default();
        metrics.record_request(Duration::from_secs(60), None, 0);
        metrics.record_request(Duration::from_secs(60), None, 0);

        let elapsed = Duration::from_secs(60);
        assert_eq!(metrics.http_reqs(), 2);
        assert_eq!(metrics.aggregate(HTTP_REQ_FAILED, Aggregation::Rate, elapsed), Some(1.0));
        assert_eq!(
            metrics.aggregate(HTTP_REQ_DURATION, Aggregation::Percentile(99.0), elapsed),
            None
        );

        // Error statuses still got a response and are timed.
        metrics.record_request(Duration::from_millis(20), Some(503), 0);
        assert_close(metrics.aggregate(HTTP_REQ_DURATION, Aggregation::Max, elapsed), 20.0);
    }

    #[test]
    fn outcome_is_recorded_before_iteration_completes() {
        let mut metrics = Metrics::with_checks(&crate::scenario::CHECKS);
        metrics.record_outcome(&IterationOutcome {
            id: 7,
            request_duration: Duration::from_millis(5),
            status: Some(200),
            bytes_received: 1,
            checks: [
                (crate::scenario::STATUS_CHECK, true),
                (crate::scenario::BODY_CHECK, false),
            ],
        });

        assert_eq!(metrics.http_reqs(), 1);
        assert_eq!(metrics.iterations(), 0);
        assert_eq!(metrics.checks()[0].passes, 1);
        assert_eq!(metrics.checks()[1].fails, 1);

        metrics.record_iteration(Duration::from_millis(1005));
        assert_eq!(metrics.iterations(), 1);
    }

    #[test]
    fn checks_keep_declaration_order() {
        let mut metrics = Metrics::with_checks(&["first", "second"]);
        metrics.record_check("second", false);
        metrics.record_check("first", true);
        metrics.record_check("third", true);

        let names: Vec<_> = metrics.checks().iter().map(|c| c.name).collect();
        assert_eq!(names, ["first", "second", "third"]);

        let rate = metrics.aggregate(CHECKS, Aggregation::Rate, Duration::from_secs(1));
        assert_eq!(rate, Some(2.0 / 3.0));
    }

    #[test]
    fn empty_and_incompatible_aggregations() {
        let metrics = Metrics::default();
        let elapsed = Duration::from_secs(1);

        assert_eq!(metrics.aggregate(HTTP_REQ_DURATION, Aggregation::Avg, elapsed), None);
        assert_eq!(metrics.aggregate(CHECKS, Aggregation::Rate, elapsed), None);
        assert_eq!(metrics.aggregate(HTTP_REQ_DURATION, Aggregation::Count, elapsed), None);
        assert_eq!(metrics.aggregate("unknown", Aggregation::Count, elapsed), None);
    }

    #[test]
    fn vus_gauge_tracks_peak() {
        let mut metrics = Metrics::default();
        metrics.set_vus(10);
        metrics.set_vus(300);
        metrics.set_vus(0);

        let elapsed = Duration::from_secs(1);
        assert_eq!(metrics.aggregate(VUS, Aggregation::Value, elapsed), Some(0.0));
        assert_eq!(metrics.aggregate(VUS_MAX, Aggregation::Value, elapsed), Some(300.0));
    }
}
