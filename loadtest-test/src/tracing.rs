//! Logging for tests.

use tracing_subscriber::EnvFilter;

/// Crates whose logs are captured at `TRACE`, the load test itself and this test utility crate.
const CRATE_NAMES: &[&str] = &["loadtest", "loadtest_test"];

/// Initialize the logger for testing.
///
/// This logs to the stdout registered by the Rust test runner. Only errors are captured from
/// dependencies like `reqwest`, `hyper` or `axum`, while both the `loadtest` and `loadtest_test`
/// crates log at all levels. Calling this more than once is a no-op.
///
/// # Example
///
/// ```
/// loadtest_test::tracing::init();
/// ```
pub fn init() {
    let env_filter = CRATE_NAMES
        .iter()
        .filter_map(|name| format!("{name}=TRACE").parse().ok())
        .fold(EnvFilter::new("ERROR"), EnvFilter::add_directive);

    tracing_subscriber::fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}
