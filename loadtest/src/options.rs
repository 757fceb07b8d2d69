//! Run options: the ramp stages and thresholds a load test executes with.
//!
//! Two profiles are predefined. [`Profile::Spike`] is the default and ramps straight to 300
//! virtual users. [`Profile::Gradual`] is a gentler alternative that ramps up, holds, and ramps
//! back down. Explicit `stages` or `thresholds` in the configuration replace those of the
//! profile.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::{HTTP_REQ_DURATION, MetricKind};
use crate::threshold::{Aggregation, Comparison, Threshold};

/// Errors produced when validating [`RunOptions`].
#[derive(Debug, Error, PartialEq)]
pub enum OptionsError {
    /// No ramp stages were declared.
    #[error("at least one stage is required")]
    NoStages,

    /// A threshold references a metric that is not collected.
    #[error("threshold on unknown metric `{0}`")]
    UnknownMetric(String),

    /// A threshold uses an aggregation that the metric does not support.
    #[error("threshold `{threshold}` cannot be applied to {kind:?} metric `{metric}`")]
    IncompatibleThreshold {
        /// Name of the metric.
        metric: String,
        /// The offending threshold.
        threshold: Threshold,
        /// Kind of the metric.
        kind: MetricKind,
    },
}

/// A time window during which the number of virtual users is linearly driven towards `target`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Stage {
    /// Length of the stage, for example `15s` or `1m`.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Number of virtual users at the end of the stage.
    pub target: u32,
}

impl Stage {
    /// Creates a new stage.
    pub const fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Predefined run options.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Ramp from 0 to 300 virtual users over 15 seconds, then stop.
    #[default]
    Spike,
    /// Ramp to 15 virtual users over 30 seconds, hold for a minute, ramp down over 20 seconds.
    Gradual,
}

/// The static options of a run.
///
/// Loaded once before the first virtual user starts and never modified afterwards.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RunOptions {
    /// Assertions per metric name, evaluated at the end of the run.
    pub thresholds: BTreeMap<String, Vec<Threshold>>,
    /// Ordered ramp stages. The run starts with zero virtual users.
    pub stages: Vec<Stage>,
}

impl RunOptions {
    /// Returns the run options of the given profile.
    pub fn from_profile(profile: Profile) -> Self {
        let stages = match profile {
            Profile::Spike => vec![Stage::new(Duration::from_secs(15), 300)],
            Profile::Gradual => vec![
                Stage::new(Duration::from_secs(30), 15),
                Stage::new(Duration::from_secs(60), 15),
                Stage::new(Duration::from_secs(20), 0),
            ],
        };

        Self {
            thresholds: default_thresholds(),
            stages,
        }
    }

    /// Checks that the stages are non-empty and all thresholds can be evaluated.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.stages.is_empty() {
            return Err(OptionsError::NoStages);
        }

        for (metric, thresholds) in &self.thresholds {
            let kind = MetricKind::of(metric)
                .ok_or_else(|| OptionsError::UnknownMetric(metric.clone()))?;

            if let Some(threshold) = thresholds
                .iter()
                .find(|t| !t.aggregation.applies_to(kind))
            {
                return Err(OptionsError::IncompatibleThreshold {
                    metric: metric.clone(),
                    threshold: *threshold,
                    kind,
                });
            }
        }

        Ok(())
    }

    /// Total duration of all stages.
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// The highest virtual user target of any stage.
    pub fn max_target(&self) -> u32 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Returns the index of the stage that is active `elapsed` into the run.
    ///
    /// Returns `None` once all stages have elapsed.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let mut end = Duration::ZERO;
        self.stages.iter().position(|stage| {
            end += stage.duration;
            elapsed < end
        })
    }

    /// Returns the number of virtual users that should be active `elapsed` into the run.
    ///
    /// Within a stage, the count moves linearly from the previous stage's target (zero for the
    /// first stage) to this stage's target. Partial steps are truncated towards the previous
    /// target. After the last stage, its target is returned.
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        let mut start = Duration::ZERO;
        let mut from = 0;

        for stage in &self.stages {
            let end = start + stage.duration;
            if elapsed < end {
                let span = (i64::from(stage.target) - i64::from(from)) as f64;
                let delta = span * (elapsed - start).as_secs_f64() / stage.duration.as_secs_f64();
                return (i64::from(from) + delta.trunc() as i64) as u32;
            }
            start = end;
            from = stage.target;
        }

        from
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_profile(Profile::default())
    }
}

/// 99% of requests must finish within three seconds.
fn default_thresholds() -> BTreeMap<String, Vec<Threshold>> {
    let p99 = Threshold {
        aggregation: Aggregation::Percentile(99.0),
        comparison: Comparison::Lt,
        value: 3000.0,
    };
    BTreeMap::from([(HTTP_REQ_DURATION.to_owned(), vec![p99])])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(secs: f64) -> Duration {
        Duration::from_secs_f64(secs)
    }

    #[test]
    fn spike_profile() {
        let options = RunOptions::from_profile(Profile::Spike);
        assert_eq!(options.total_duration(), secs(15.0));
        assert_eq!(options.max_target(), 300);
        assert_eq!(
            options.thresholds[HTTP_REQ_DURATION][0].to_string(),
            "p(99) < 3000"
        );
        assert_eq!(options.validate(), Ok(()));
    }

    #[test]
    fn spike_ramps_linearly() {
        let options = RunOptions::from_profile(Profile::Spike);
        assert_eq!(options.target_at(secs(0.0)), 0);
        assert_eq!(options.target_at(secs(1.0)), 20);
        assert_eq!(options.target_at(secs(7.5)), 150);
        assert_eq!(options.target_at(secs(14.99)), 299);
        assert_eq!(options.target_at(secs(15.0)), 300);
        assert_eq!(options.target_at(secs(60.0)), 300);
    }

    #[test]
    fn gradual_ramps_up_holds_and_down() {
        let options = RunOptions::from_profile(Profile::Gradual);
        assert_eq!(options.total_duration(), secs(110.0));
        assert_eq!(options.target_at(secs(15.0)), 7);
        assert_eq!(options.target_at(secs(30.0)), 15);
        assert_eq!(options.target_at(secs(75.0)), 15);
        // Ramping down truncates towards the previous target.
        assert_eq!(options.target_at(secs(91.0)), 15);
        assert_eq!(options.target_at(secs(100.0)), 8);
        assert_eq!(options.target_at(secs(110.0)), 0);
    }

    #[test]
    fn stage_lookup() {
        let options = RunOptions::from_profile(Profile::Gradual);
        assert_eq!(options.stage_at(secs(0.0)), Some(0));
        assert_eq!(options.stage_at(secs(30.0)), Some(1));
        assert_eq!(options.stage_at(secs(109.0)), Some(2));
        assert_eq!(options.stage_at(secs(110.0)), None);
    }

    #[test]
    fn zero_length_stage_jumps_to_target() {
        let options = RunOptions {
            thresholds: BTreeMap::new(),
            stages: vec![
                Stage::new(Duration::ZERO, 10),
                Stage::new(secs(10.0), 10),
            ],
        };
        assert_eq!(options.target_at(secs(0.0)), 10);
        assert_eq!(options.target_at(secs(5.0)), 10);
    }

    #[test]
    fn validation() {
        let mut options = RunOptions::default();
        options.stages.clear();
        assert_eq!(options.validate(), Err(OptionsError::NoStages));

        let mut options = RunOptions::default();
        options
            .thresholds
            .insert("latency".into(), vec!["avg < 1".parse().unwrap()]);
        assert_eq!(
            options.validate(),
            Err(OptionsError::UnknownMetric("latency".into()))
        );

        let mut options = RunOptions::default();
        options
            .thresholds
            .insert("checks".into(), vec!["p(95) > 0.9".parse().unwrap()]);
        assert!(matches!(
            options.validate(),
            Err(OptionsError::IncompatibleThreshold { .. })
        ));
    }

    #[test]
    fn stages_in_yaml() {
        let options: RunOptions = serde_yaml::from_str(
            r#"
            thresholds:
              http_req_duration: ["p(99) < 3000"]
            stages:
              - duration: 30s
                target: 15
              - duration: 1m
                target: 15
              - duration: 20s
                target: 0
            "#,
        )
        .unwrap();

        assert_eq!(options, RunOptions::from_profile(Profile::Gradual));
    }
}
