//! Run-level pass/fail assertions over aggregated metrics.
//!
//! A [`Threshold`] is written as `<aggregation> <operator> <value>`, for example `p(99) < 3000`
//! or `rate >= 0.95`. Thresholds are evaluated once over the whole run, after the last virtual
//! user has stopped. Crossing a threshold marks the run as failed, but never stops it early.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::{MetricKind, Metrics};
use crate::options::RunOptions;

/// Errors produced while parsing a threshold expression.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ThresholdError {
    /// The expression does not contain a comparison operator.
    #[error("threshold `{0}` is missing a comparison operator")]
    MissingOperator(String),

    /// The left-hand side is not a known aggregation.
    #[error("unknown aggregation `{0}`, expected one of avg, min, max, med, count, rate, value, p(N)")]
    UnknownAggregation(String),

    /// The percentile in `p(N)` is not a number in `(0, 100]`.
    #[error("invalid percentile `{0}`, expected a number in (0, 100]")]
    InvalidPercentile(String),

    /// The right-hand side is not a number.
    #[error("invalid threshold value `{0}`")]
    InvalidValue(String),
}

/// How samples of a metric are reduced to a single number.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Aggregation {
    /// Arithmetic mean of a trend.
    Avg,
    /// Smallest sample of a trend.
    Min,
    /// Largest sample of a trend.
    Max,
    /// Median of a trend, same as `p(50)`.
    Med,
    /// Percentile of a trend, stored in percent (`99.0` for `p(99)`).
    Percentile(f64),
    /// Total number of events of a counter.
    Count,
    /// Events per second for counters, or fraction of non-zero samples for rates.
    Rate,
    /// Last observed value of a gauge.
    Value,
}

impl Aggregation {
    /// Returns `true` if this aggregation can be computed for metrics of the given kind.
    pub fn applies_to(self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Trend => matches!(
                self,
                Self::Avg | Self::Min | Self::Max | Self::Med | Self::Percentile(_)
            ),
            MetricKind::Counter => matches!(self, Self::Count | Self::Rate),
            MetricKind::Rate => matches!(self, Self::Rate),
            MetricKind::Gauge => matches!(self, Self::Value | Self::Min | Self::Max),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Percentile(p) => write!(f, "p({p})"),
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
            Self::Value => f.write_str("value"),
        }
    }
}

impl FromStr for Aggregation {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let aggregation = match s {
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            "med" => Self::Med,
            "count" => Self::Count,
            "rate" => Self::Rate,
            "value" => Self::Value,
            s => {
                let Some(inner) = s.strip_prefix("p(").and_then(|s| s.strip_suffix(')')) else {
                    return Err(ThresholdError::UnknownAggregation(s.to_owned()));
                };
                let percentile: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| ThresholdError::InvalidPercentile(inner.to_owned()))?;
                if !(percentile > 0.0 && percentile <= 100.0) {
                    return Err(ThresholdError::InvalidPercentile(inner.to_owned()));
                }
                Self::Percentile(percentile)
            }
        };

        Ok(aggregation)
    }
}

/// Comparison operator of a threshold.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Comparison {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
}

impl Comparison {
    // Two-character operators come first so `<=` is not read as `<`.
    const ALL: [(&'static str, Comparison); 6] = [
        ("<=", Self::Le),
        (">=", Self::Ge),
        ("==", Self::Eq),
        ("!=", Self::Ne),
        ("<", Self::Lt),
        (">", Self::Gt),
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }

    fn holds(self, observed: f64, expected: f64) -> bool {
        match self {
            Self::Lt => observed < expected,
            Self::Le => observed <= expected,
            Self::Gt => observed > expected,
            Self::Ge => observed >= expected,
            Self::Eq => observed == expected,
            Self::Ne => observed != expected,
        }
    }
}

/// A run-level assertion such as `p(99) < 3000`.
///
/// Thresholds serialize as their expression string.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Threshold {
    /// How the metric's samples are reduced.
    pub aggregation: Aggregation,
    /// How the aggregated value is compared against [`value`](Self::value).
    pub comparison: Comparison,
    /// The bound the aggregated value is compared against.
    pub value: f64,
}

impl Threshold {
    /// Returns `true` if the observed aggregate satisfies this threshold.
    pub fn holds(&self, observed: f64) -> bool {
        self.comparison.holds(observed, self.value)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.aggregation,
            self.comparison.as_str(),
            self.value
        )
    }
}

impl FromStr for Threshold {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (position, (operator, comparison)) = s
            .char_indices()
            .filter(|(_, c)| matches!(c, '<' | '>' | '=' | '!'))
            .find_map(|(i, _)| {
                Comparison::ALL
                    .into_iter()
                    .find(|(op, _)| s[i..].starts_with(op))
                    .map(|found| (i, found))
            })
            .ok_or_else(|| ThresholdError::MissingOperator(s.to_owned()))?;

        let aggregation = s[..position].trim().parse()?;
        let rhs = s[position + operator.len()..].trim();
        let value = rhs
            .parse()
            .map_err(|_| ThresholdError::InvalidValue(rhs.to_owned()))?;

        Ok(Self {
            aggregation,
            comparison,
            value,
        })
    }
}

impl Serialize for Threshold {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Threshold {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The result of evaluating a single threshold at the end of a run.
#[derive(Clone, Debug, Serialize)]
pub struct ThresholdOutcome {
    /// Name of the metric the threshold applies to.
    pub metric: String,
    /// The threshold expression.
    pub threshold: Threshold,
    /// The aggregated value, or `None` if the metric has no samples.
    pub observed: Option<f64>,
    /// Whether the threshold held.
    pub ok: bool,
}

/// Evaluates all thresholds of the run options against the collected metrics.
///
/// A metric without samples cannot violate its thresholds, so those pass.
pub fn evaluate(
    options: &RunOptions,
    metrics: &Metrics,
    elapsed: Duration,
) -> Vec<ThresholdOutcome> {
    let mut outcomes = Vec::new();

    for (metric, thresholds) in &options.thresholds {
        for threshold in thresholds {
            let observed = metrics.aggregate(metric, threshold.aggregation, elapsed);
            let ok = observed.is_none_or(|value| threshold.holds(value));

            if !ok {
                tracing::debug!(%metric, %threshold, ?observed, "threshold crossed");
            }

            outcomes.push(ThresholdOutcome {
                metric: metric.clone(),
                threshold: *threshold,
                observed,
                ok,
            });
        }
    }

    outcomes
}
