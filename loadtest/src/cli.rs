//! Command line interface of the `loadtest` binary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::Config;
use crate::executor::{Executor, ExecutorSettings};
use crate::http::HttpRemote;
use crate::observability;
use crate::report::{self, Summary};
use crate::scenario::Scenario;

/// Exit code signalling that the run completed but crossed at least one threshold.
pub const THRESHOLDS_CROSSED: u8 = 99;

/// Load test for services echoing back the requested identifier.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Options(OptionsCommand),
    Version(VersionCommand),
}

/// run the load test against the configured app url
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {
    /// write the end-of-run summary as JSON to this file
    #[argh(option)]
    summary_export: Option<PathBuf>,
}

/// print the resolved stages and thresholds as YAML
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "options")]
struct OptionsCommand {}

/// print the loadtest version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Parse the command line and execute the command.
pub fn execute() -> Result<ExitCode> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load(args.config.as_deref())?;
    observability::init_tracing(&config.logging);
    tracing::debug!(?config);

    match args.command {
        Command::Run(command) => run(config, command),
        Command::Options(OptionsCommand {}) => {
            let options = config.run_options()?;
            print!("{}", serde_yaml::to_string(&options)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Version(VersionCommand {}) => unreachable!(),
    }
}

fn run(config: Config, command: RunCommand) -> Result<ExitCode> {
    // Fails before any virtual user starts or any request is sent.
    let scenario = Scenario::from_config(&config)?;
    let options = config.run_options()?;
    let remote =
        HttpRemote::new(config.request_timeout).context("failed to create HTTP client")?;

    let settings = ExecutorSettings {
        tick: config.tick,
        graceful_stop: config.graceful_stop,
        seed: config.seed,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("loadtest-rt")
        .enable_all()
        .build()?;

    let bar = ProgressBar::new_spinner()
        .with_style(ProgressStyle::with_template("{spinner} {msg} {elapsed}")?)
        .with_message("Running load test:");
    bar.enable_steady_tick(Duration::from_millis(100));

    let executor = Executor::new(options.clone(), scenario, remote, settings)
        .with_progress(bar.clone());
    let result = runtime.block_on(executor.run(interrupted()));
    bar.finish_and_clear();

    let summary = Summary::new(&options, &result);
    report::print_summary(&summary);

    if let Some(path) = command.summary_export {
        summary.export_json(&path)?;
    }

    if summary.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::error!("some thresholds have been crossed");
        Ok(ExitCode::from(THRESHOLDS_CROSSED))
    }
}

/// Resolves on Ctrl-C.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        // Without a signal handler the run can only end by completing its stages.
        std::future::pending::<()>().await;
    }
}
