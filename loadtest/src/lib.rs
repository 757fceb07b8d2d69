//! This is a load testing library which runs an identifier echo [`Scenario`] against an HTTP
//! service with a ramping number of virtual users.
//!
//! Every virtual user requests `<app_url><id>` for a random identifier, checks that the service
//! responded `200 OK` and echoed the identifier, then sleeps before the next iteration. The number
//! of virtual users follows the [`RunOptions`] stages; at the end of the run, the collected metrics
//! are checked against the configured thresholds.
//!
//! The default run ramps from zero to 300 virtual users over 15 seconds and requires the 99th
//! percentile of request durations to stay below three seconds.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod executor;
pub mod http;
pub mod metrics;
pub mod observability;
pub mod options;
pub mod report;
pub mod scenario;
pub mod threshold;

pub use crate::config::Config;
pub use crate::executor::{Executor, ExecutorSettings, RunResult};
pub use crate::options::RunOptions;
pub use crate::scenario::Scenario;
