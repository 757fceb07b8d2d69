//! Ramps virtual users up and down according to the run's stages.
//!
//! A controller wakes up every tick, computes the number of virtual users the current stage
//! calls for and starts or stops virtual users to match. Each virtual user runs the
//! [`Scenario`] in a loop on its own task. A stopped virtual user finishes its current iteration
//! before it exits, and counts as active until then.
//!
//! Once all stages have elapsed, every virtual user is stopped and gets the graceful stop period
//! to finish. Iterations still running afterwards are aborted and counted as interrupted.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::http::HttpRemote;
use crate::metrics::Metrics;
use crate::options::RunOptions;
use crate::scenario::{CHECKS, Scenario};

/// Tuning knobs of the [`Executor`] that are not part of the run options.
#[derive(Clone, Copy, Debug)]
pub struct ExecutorSettings {
    /// Interval at which the number of virtual users is adjusted.
    pub tick: Duration,
    /// Time given to virtual users to finish their iteration after the last stage.
    pub graceful_stop: Duration,
    /// Base seed of the per-virtual-user generators.
    pub seed: Option<u64>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            graceful_stop: Duration::from_secs(30),
            seed: None,
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunResult {
    /// Metrics collected over the whole run.
    pub metrics: Metrics,
    /// Time from the start of the first stage until all virtual users stopped.
    pub elapsed: Duration,
    /// `true` if the run was stopped before all stages elapsed.
    pub aborted: bool,
}

/// Executes a [`Scenario`] with a ramping number of virtual users.
#[derive(Debug)]
pub struct Executor {
    options: Arc<RunOptions>,
    scenario: Arc<Scenario>,
    remote: Arc<HttpRemote>,
    settings: ExecutorSettings,
    progress: Option<ProgressBar>,
}

impl Executor {
    /// Creates a new executor.
    pub fn new(
        options: RunOptions,
        scenario: Scenario,
        remote: HttpRemote,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            options: Arc::new(options),
            scenario: Arc::new(scenario),
            remote: Arc::new(remote),
            settings,
            progress: None,
        }
    }

    /// Reports the number of active virtual users and iterations on the given progress bar.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Runs all stages to completion, or until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> RunResult {
        let metrics = Arc::new(Mutex::new(Metrics::with_checks(&CHECKS)));
        let total_duration = self.options.total_duration();

        let mut vus = JoinSet::new();
        let mut active: Vec<CancellationToken> = Vec::new();
        let mut next_index: u64 = 0;
        let mut current_stage = None;
        let mut aborted = false;

        tracing::info!(
            url = self.scenario.base_url(),
            stages = self.options.stages.len(),
            max_vus = self.options.max_target(),
            duration = ?total_duration,
            "starting load test"
        );

        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        let start = Instant::now();
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut shutdown => {
                    tracing::warn!("stopping load test before all stages elapsed");
                    aborted = true;
                    break;
                }
            }

            let elapsed = start.elapsed();
            let Some(stage) = self.options.stage_at(elapsed) else {
                break;
            };
            if current_stage != Some(stage) {
                let target = self.options.stages[stage].target;
                tracing::info!(stage, target, "entering stage");
                current_stage = Some(stage);
            }

            // Reap virtual users that completed their ramp-down.
            while vus.try_join_next().is_some() {}

            // Stopped virtual users count until their last iteration is done, so the target is
            // never exceeded while they drain.
            let desired = self.options.target_at(elapsed) as usize;
            while vus.len() < desired {
                let token = CancellationToken::new();
                vus.spawn(run_vu(
                    next_index,
                    Arc::clone(&self.scenario),
                    Arc::clone(&self.remote),
                    Arc::clone(&metrics),
                    token.clone(),
                    self.rng(next_index),
                ));
                active.push(token);
                next_index += 1;
            }
            // The most recently started virtual users are stopped first.
            while active.len() > desired {
                if let Some(token) = active.pop() {
                    token.cancel();
                }
            }

            let iterations = {
                let mut metrics = metrics.lock().unwrap();
                metrics.set_vus(vus.len() as u64);
                metrics.iterations()
            };
            if let Some(ref progress) = self.progress {
                progress.set_message(format!("{} VUs, {iterations} iterations", vus.len()));
            }
        }

        for token in active.drain(..) {
            token.cancel();
        }
        if let Some(ref progress) = self.progress {
            progress.set_message(format!("stopping {} VUs", vus.len()));
        }

        let graceful = tokio::time::timeout(self.settings.graceful_stop, async {
            while vus.join_next().await.is_some() {}
        })
        .await;

        if graceful.is_err() {
            let interrupted = vus.len() as u64;
            tracing::warn!(interrupted, "graceful stop period elapsed, aborting iterations");
            vus.shutdown().await;
            metrics.lock().unwrap().record_interrupted(interrupted);
        }

        let elapsed = start.elapsed();
        let metrics = std::mem::take(&mut *metrics.lock().unwrap());

        tracing::info!(
            elapsed = ?elapsed,
            iterations = metrics.iterations(),
            "load test finished"
        );

        RunResult {
            metrics,
            elapsed,
            aborted,
        }
    }

    fn rng(&self, index: u64) -> SmallRng {
        match self.settings.seed {
            Some(seed) => SmallRng::seed_from_u64(seed.wrapping_add(index)),
            None => SmallRng::from_os_rng(),
        }
    }
}

async fn run_vu(
    index: u64,
    scenario: Arc<Scenario>,
    remote: Arc<HttpRemote>,
    metrics: Arc<Mutex<Metrics>>,
    stop: CancellationToken,
    mut rng: SmallRng,
) {
    tracing::trace!(vu = index, "virtual user started");

    while !stop.is_cancelled() {
        let start = Instant::now();
        scenario.iteration(&remote, &mut rng, &metrics).await;
        metrics.lock().unwrap().record_iteration(start.elapsed());
    }

    tracing::trace!(vu = index, "virtual user stopped");
}
