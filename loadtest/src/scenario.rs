//! The behavior of a single virtual user.
//!
//! Every iteration picks a random identifier, requests `<app_url><id>` and checks that the service
//! answered with status 200 and echoed the identifier back. Both checks are always evaluated and
//! recorded; a failing check never aborts the iteration. The virtual user then sleeps before the
//! next iteration starts.

use std::error::Error;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::{Config, ConfigError};
use crate::http::{HttpRemote, Response};
use crate::metrics::Metrics;

/// Identifiers are drawn uniformly from `0..ID_UPPER_BOUND`.
pub const ID_UPPER_BOUND: u32 = 10_000_000;

/// Name of the check asserting a `200 OK` status.
pub const STATUS_CHECK: &str = "status was 200";
/// Name of the check asserting that the body equals the requested identifier.
pub const BODY_CHECK: &str = "returned same id";
/// All checks in the order they are evaluated.
pub const CHECKS: [&str; 2] = [STATUS_CHECK, BODY_CHECK];

/// Draws a fresh identifier in `0..ID_UPPER_BOUND`.
pub fn random_id<R: Rng>(rng: &mut R) -> u32 {
    rng.random_range(0..ID_UPPER_BOUND)
}

/// Appends the decimal identifier to the base URL.
///
/// No separator is inserted, the base URL is expected to end appropriately.
pub fn request_url(base_url: &str, id: u32) -> String {
    format!("{base_url}{id}")
}

/// Checks that the response has status `200`.
pub fn check_status(response: &Response) -> bool {
    response.status == 200
}

/// Checks that the response body is exactly the decimal form of `id`.
pub fn check_body(response: &Response, id: u32) -> bool {
    response.body == id.to_string()
}

/// Everything observed during one iteration.
#[derive(Clone, Debug)]
pub struct IterationOutcome {
    /// The requested identifier.
    pub id: u32,
    /// Time until the response body was received, or until the request failed.
    pub request_duration: Duration,
    /// Response status, or `None` if the request failed at the transport level.
    pub status: Option<u16>,
    /// Size of the response body.
    pub bytes_received: u64,
    /// Name and result of every check, in [`CHECKS`] order.
    pub checks: [(&'static str, bool); 2],
}

impl IterationOutcome {
    /// Returns `true` if all checks passed.
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|(_, passed)| *passed)
    }
}

/// The per-iteration behavior executed by every virtual user.
#[derive(Clone, Debug)]
pub struct Scenario {
    base_url: String,
    sleep: Duration,
}

impl Scenario {
    /// Creates a scenario against `base_url` that sleeps for `sleep` after every request.
    pub fn new(base_url: impl Into<String>, sleep: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            sleep,
        }
    }

    /// Creates the scenario from the configuration.
    ///
    /// Fails if no target URL was configured.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(config.app_url()?, config.sleep))
    }

    /// The base URL identifiers are appended to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Runs a single iteration: one request, two checks, one sleep.
    ///
    /// The request and checks are recorded into `metrics` before sleeping, so they are kept even
    /// if the iteration is aborted during its think time.
    pub async fn iteration<R: Rng>(
        &self,
        remote: &HttpRemote,
        rng: &mut R,
        metrics: &Mutex<Metrics>,
    ) -> IterationOutcome {
        let id = random_id(rng);
        let url = request_url(&self.base_url, id);

        let start = Instant::now();
        let result = remote.get(&url).await;
        let request_duration = start.elapsed();

        let outcome = match result {
            Ok(response) => IterationOutcome {
                id,
                request_duration,
                status: Some(response.status),
                bytes_received: response.body.len() as u64,
                checks: [
                    (STATUS_CHECK, check_status(&response)),
                    (BODY_CHECK, check_body(&response, id)),
                ],
            },
            Err(error) => {
                tracing::debug!(error = &error as &dyn Error, %url, "request failed");
                IterationOutcome {
                    id,
                    request_duration,
                    status: None,
                    bytes_received: 0,
                    checks: [(STATUS_CHECK, false), (BODY_CHECK, false)],
                }
            }
        };

        if !outcome.passed() {
            tracing::debug!(id, status = ?outcome.status, checks = ?outcome.checks, "check failed");
        }

        metrics.lock().unwrap().record_outcome(&outcome);

        tokio::time::sleep(self.sleep).await;
        outcome
    }
}
