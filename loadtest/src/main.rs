//! Load test binary for services that echo back the requested identifier.
//!
//! Virtual users repeatedly request `<MY_APP_URL><id>` with a random identifier and check that the
//! service answers `200 OK` with the identifier as body. The number of virtual users follows
//! linear ramp stages, and thresholds over the collected metrics decide whether the run passed.
//!
//! The process exits with code `99` if a threshold was crossed.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

use std::process::ExitCode;

use anyhow::Result;

fn main() -> Result<ExitCode> {
    loadtest::cli::execute()
}
