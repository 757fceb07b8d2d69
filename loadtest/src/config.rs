//! Configuration for the load test.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. The `MY_APP_URL` environment variable, which sets [`Config::app_url`]
//! 2. Environment variables prefixed with `LOADTEST__`
//! 3. YAML configuration file (specified via `-c` or `--config` flag)
//! 4. Defaults
//!
//! # Environment Variables
//!
//! Environment variables use `LOADTEST__` as a prefix and double underscores (`__`) to denote
//! nested configuration structures. For example:
//!
//! - `LOADTEST__PROFILE=gradual` selects the gradual ramp profile
//! - `LOADTEST__SLEEP=500ms` shortens the pause between iterations
//! - `LOADTEST__LOGGING__FORMAT=json` switches to JSON logs
//!
//! # YAML Configuration File
//!
//! ```yaml
//! app_url: http://localhost:8080/items/
//! sleep: 1s
//! stages:
//!   - duration: 15s
//!     target: 300
//! thresholds:
//!   http_req_duration: ["p(99) < 3000"]
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::options::{OptionsError, Profile, RunOptions, Stage};
use crate::threshold::Threshold;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "LOADTEST__";

/// Environment variable holding the base URL of the service under test.
pub const APP_URL_ENV: &str = "MY_APP_URL";

/// Errors produced while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No target URL was configured, or it was empty.
    #[error("Please provide an app url ({APP_URL_ENV})")]
    MissingAppUrl,

    /// The run options are invalid.
    #[error("invalid run options: {0}")]
    Options(#[from] OptionsError),

    /// A configuration source could not be read or parsed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// The logging format.
///
/// Used in: [`Logging::format`]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty printing for terminals, simplified output otherwise.
    #[default]
    Auto,

    /// Compact output with colors.
    Pretty,

    /// Plain text output without colors.
    Simplified,

    /// One JSON object per line.
    Json,
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <super::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr, the end-of-run summary goes to stdout.
#[derive(Debug, Deserialize, Serialize)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// The `RUST_LOG` environment variable takes precedence if it is set.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `LOADTEST__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// # Default
    ///
    /// `auto`
    ///
    /// # Environment Variable
    ///
    /// `LOADTEST__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct for the load test.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the service under test.
    ///
    /// Identifiers are appended to this URL without a separator, so it should end with `/` or
    /// whatever the service expects in front of the identifier. There is no default: a missing
    /// or empty URL aborts the run before any request is made.
    ///
    /// # Environment Variables
    ///
    /// `MY_APP_URL`, or `LOADTEST__APP_URL`
    pub app_url: Option<String>,

    /// Predefined stages and thresholds.
    ///
    /// # Default
    ///
    /// `spike`
    pub profile: Profile,

    /// Ramp stages replacing those of the [`profile`](Self::profile).
    pub stages: Option<Vec<Stage>>,

    /// Thresholds replacing those of the [`profile`](Self::profile).
    pub thresholds: Option<BTreeMap<String, Vec<Threshold>>>,

    /// Pause after every iteration.
    ///
    /// # Default
    ///
    /// `1s`
    #[serde(with = "humantime_serde")]
    pub sleep: Duration,

    /// Timeout of a single request, including reading the body.
    ///
    /// # Default
    ///
    /// `60s`
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How long virtual users may take to finish their current iteration once the last stage
    /// has elapsed. Iterations still running afterwards are interrupted.
    ///
    /// # Default
    ///
    /// `30s`
    #[serde(with = "humantime_serde")]
    pub graceful_stop: Duration,

    /// Interval at which the number of virtual users is adjusted.
    ///
    /// # Default
    ///
    /// `100ms`
    #[serde(with = "humantime_serde")]
    pub tick: Duration,

    /// Seed for the identifier generators.
    ///
    /// Virtual user `n` is seeded with `seed + n`. Without a seed, every virtual user is seeded
    /// from the operating system.
    pub seed: Option<u64>,

    /// Logging configuration.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_url: None,
            profile: Profile::default(),
            stages: None,
            thresholds: None,
            sleep: Duration::from_secs(1),
            request_timeout: Duration::from_secs(60),
            graceful_stop: Duration::from_secs(30),
            tick: Duration::from_millis(100),
            seed: None,
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided in `path`)
    /// 3. Environment variables (prefixed with `LOADTEST__`)
    /// 4. `MY_APP_URL`
    ///
    /// The target URL is not validated here, see [`Config::app_url`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Env::raw().only(&[APP_URL_ENV]).map(|_| "app_url".into()))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Returns the configured target URL.
    ///
    /// Fails if the URL is missing, empty, or consists only of whitespace.
    pub fn app_url(&self) -> Result<&str, ConfigError> {
        match self.app_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Ok(url),
            _ => Err(ConfigError::MissingAppUrl),
        }
    }

    /// Resolves the run options from the profile and explicit overrides, and validates them.
    pub fn run_options(&self) -> Result<RunOptions, ConfigError> {
        let mut options = RunOptions::from_profile(self.profile);
        if let Some(ref stages) = self.stages {
            options.stages = stages.clone();
        }
        if let Some(ref thresholds) = self.thresholds {
            options.thresholds = thresholds.clone();
        }

        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::metrics::{CHECKS, HTTP_REQ_DURATION};

    #[test]
    fn app_url_is_required() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();

            let config = Config::load(None).unwrap();
            assert!(matches!(config.app_url(), Err(ConfigError::MissingAppUrl)));

            Ok(())
        });
    }

    #[test]
    fn empty_app_url_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(APP_URL_ENV, "   ");

            let config = Config::load(None).unwrap();
            let err = config.app_url().unwrap_err();
            assert!(err.to_string().contains("app url"));
            assert!(err.to_string().contains(APP_URL_ENV));

            Ok(())
        });
    }

    #[test]
    fn app_url_from_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(APP_URL_ENV, "http://svc/items/");

            let config = Config::load(None).unwrap();
            assert_eq!(config.app_url().unwrap(), "http://svc/items/");

            Ok(())
        });
    }

    #[test]
    fn defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();

            let config = Config::load(None).unwrap();
            assert_eq!(config.sleep, Duration::from_secs(1));
            assert_eq!(config.profile, Profile::Spike);
            assert_eq!(config.seed, None);
            assert_eq!(config.run_options().unwrap(), RunOptions::default());

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("LOADTEST__APP_URL", "http://other/");
            jail.set_env("LOADTEST__PROFILE", "gradual");
            jail.set_env("LOADTEST__SLEEP", "250ms");
            jail.set_env("LOADTEST__SEED", "42");
            jail.set_env("LOADTEST__LOGGING__LEVEL", "debug");
            jail.set_env("LOADTEST__LOGGING__FORMAT", "json");

            let config = Config::load(None).unwrap();
            assert_eq!(config.app_url().unwrap(), "http://other/");
            assert_eq!(config.profile, Profile::Gradual);
            assert_eq!(config.sleep, Duration::from_millis(250));
            assert_eq!(config.seed, Some(42));
            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert_eq!(config.logging.format, LogFormat::Json);
            assert_eq!(config.run_options().unwrap().stages.len(), 3);

            Ok(())
        });
    }

    #[test]
    fn my_app_url_overrides_prefixed_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("LOADTEST__APP_URL", "http://other/");
            jail.set_env(APP_URL_ENV, "http://svc/items/");

            let config = Config::load(None).unwrap();
            assert_eq!(config.app_url().unwrap(), "http://svc/items/");

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            app_url: http://localhost:8080/items/
            sleep: 2s
            graceful_stop: 5s
            stages:
              - duration: 10s
                target: 50
              - duration: 5s
                target: 0
            thresholds:
              http_req_duration: ["p(95) < 500", "avg < 200"]
              checks: ["rate > 0.99"]
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("LOADTEST__SLEEP", "3s");

            let config = Config::load(Some(tempfile.path())).unwrap();
            assert_eq!(config.app_url().unwrap(), "http://localhost:8080/items/");
            assert_eq!(config.sleep, Duration::from_secs(3));
            assert_eq!(config.graceful_stop, Duration::from_secs(5));

            let options = config.run_options().unwrap();
            assert_eq!(
                options.stages,
                [
                    Stage::new(Duration::from_secs(10), 50),
                    Stage::new(Duration::from_secs(5), 0),
                ]
            );
            assert_eq!(options.thresholds[HTTP_REQ_DURATION].len(), 2);
            assert_eq!(options.thresholds[CHECKS][0].to_string(), "rate > 0.99");

            Ok(())
        });
    }

    #[test]
    fn shipped_profiles_match_builtin() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("config");

        figment::Jail::expect_with(|jail| {
            jail.clear_env();

            let spike = Config::load(Some(&dir.join("spike.yaml"))).unwrap();
            assert_eq!(
                spike.run_options().unwrap(),
                RunOptions::from_profile(Profile::Spike)
            );

            let gradual = Config::load(Some(&dir.join("gradual.yaml"))).unwrap();
            assert_eq!(
                gradual.run_options().unwrap(),
                RunOptions::from_profile(Profile::Gradual)
            );

            Ok(())
        });
    }

    #[test]
    fn invalid_threshold_fails_to_load() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            thresholds:
              http_req_duration: ["p99 under 3000"]
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let result = Config::load(Some(tempfile.path()));
            assert!(matches!(result, Err(ConfigError::Load(_))));

            Ok(())
        });
    }

    #[test]
    fn empty_stages_are_rejected() {
        let config = Config {
            stages: Some(vec![]),
            ..Default::default()
        };
        assert!(matches!(
            config.run_options(),
            Err(ConfigError::Options(OptionsError::NoStages))
        ));
    }
}
