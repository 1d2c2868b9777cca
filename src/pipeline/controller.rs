//! The stage loop.
//!
//! Each iteration asks discovery for exactly the number of items still
//! missing, verifies at most that many, annotates the survivors straight
//! into the capped dataset and repeats until the target is reached or a
//! stop condition fires:
//!
//! - target reached: `DONE`
//! - two consecutive empty discoveries, a non-fatal discovery error, or the
//!   iteration bound: `PARTIAL` or `FAILED_EMPTY` depending on what was
//!   collected
//! - a fatal error from any stage: `FAILED`
//! - the cancellation token: `CANCELLED`

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::MetricsCollector;
use crate::pipeline::progress::ProgressCounters;
use crate::pipeline::stages::{AnnotationStage, DiscoveryStage, VerificationStage};
use crate::pipeline::state::{Phase, PipelineOutcome, PipelineState, RunStatus};
use crate::resilience::{Stage, StructuredError};

/// Empty discoveries in a row that end the run.
pub const MAX_EMPTY_DISCOVERIES: u32 = 2;

/// Loop bounds.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Exact number of items wanted.
    pub target: usize,
    /// Hard bound on iterations.
    pub max_iterations: u32,
    /// Wait after an empty discovery, multiplied by the streak length.
    pub empty_backoff: Duration,
}

impl ControllerSettings {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            max_iterations: 5,
            empty_backoff: Duration::from_secs(2),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_empty_backoff(mut self, backoff: Duration) -> Self {
        self.empty_backoff = backoff;
        self
    }
}

/// How one iteration ended.
enum Step {
    Continue,
    Stop(RunStatus, Option<StructuredError>),
}

/// Drives discovery, verification and annotation until the target is met.
pub struct PipelineController {
    settings: ControllerSettings,
    discovery: Box<dyn DiscoveryStage>,
    verification: Box<dyn VerificationStage>,
    annotation: Box<dyn AnnotationStage>,
    metrics: Option<Arc<MetricsCollector>>,
    progress: Option<ProgressCounters>,
}

impl PipelineController {
    pub fn new(
        settings: ControllerSettings,
        discovery: Box<dyn DiscoveryStage>,
        verification: Box<dyn VerificationStage>,
        annotation: Box<dyn AnnotationStage>,
    ) -> Self {
        Self {
            settings,
            discovery,
            verification,
            annotation,
            metrics: None,
            progress: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCounters) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Runs the loop to completion.
    ///
    /// Never fails: errors end up in [`PipelineOutcome::error`] and the
    /// dataset collected so far is always returned.
    pub async fn run(&mut self, cancel: &CancellationToken) -> PipelineOutcome {
        let started = Instant::now();
        let mut state = PipelineState::new(self.settings.target);

        info!(
            target = self.settings.target,
            max_iterations = self.settings.max_iterations,
            "Pipeline started"
        );

        let (status, error) = loop {
            if state.dataset.is_full() {
                break (RunStatus::Done, None);
            }
            if cancel.is_cancelled() {
                break (RunStatus::Cancelled, None);
            }
            if state.iteration >= self.settings.max_iterations {
                warn!(
                    iterations = state.iteration,
                    collected = state.collected(),
                    target = state.target(),
                    "Iteration bound reached"
                );
                break (RunStatus::stopped(state.collected(), state.target()), None);
            }

            state.iteration += 1;
            match self.iterate(&mut state, cancel).await {
                Step::Continue => {}
                Step::Stop(status, error) => break (status, error),
            }
        };

        state.enter(Phase::Finished);
        let outcome = PipelineOutcome::from_state(state, status, error, started.elapsed());
        if let Some(metrics) = &self.metrics {
            metrics.record_stage(Stage::Pipeline, outcome.elapsed);
        }
        info!(
            status = %outcome.status,
            collected = outcome.collected,
            target = outcome.target,
            iterations = outcome.iterations,
            "Pipeline finished"
        );
        outcome
    }

    async fn iterate(&mut self, state: &mut PipelineState, cancel: &CancellationToken) -> Step {
        let needed = state.needed();
        info!(
            iteration = state.iteration,
            needed,
            collected = state.collected(),
            "Starting iteration"
        );

        // Mining
        state.enter(Phase::Mining);
        let timer = Instant::now();
        let discovered = self.discovery.discover(needed, cancel).await;
        self.record_stage(Stage::Discovery, timer);

        let mined = match discovered {
            Ok(mined) => mined,
            Err(err) if err.is_cancelled() => return Step::Stop(RunStatus::Cancelled, None),
            Err(err) if err.is_fatal() => return Step::Stop(RunStatus::Failed, Some(err)),
            Err(err) => {
                warn!(error = %err, "Discovery cannot continue, stopping");
                return Step::Stop(
                    RunStatus::stopped(state.collected(), state.target()),
                    Some(err),
                );
            }
        };
        state.totals.mined += mined.len();

        if mined.is_empty() {
            state.empty_streak += 1;
            warn!(streak = state.empty_streak, "Discovery returned no items");
            if state.empty_streak >= MAX_EMPTY_DISCOVERIES {
                return Step::Stop(RunStatus::stopped(state.collected(), state.target()), None);
            }
            let wait = self.settings.empty_backoff * state.empty_streak;
            if !wait.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Step::Stop(RunStatus::Cancelled, None),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            return Step::Continue;
        }
        state.empty_streak = 0;

        // Curating
        state.enter(Phase::Curating);
        let timer = Instant::now();
        let verified = self.verification.verify(mined, needed, cancel).await;
        self.record_stage(Stage::Verification, timer);

        let verified = match verified {
            Ok(verified) => verified,
            Err(err) if err.is_cancelled() => return Step::Stop(RunStatus::Cancelled, None),
            Err(err) => return Step::Stop(RunStatus::Failed, Some(err)),
        };
        state.totals.curated += verified.len();

        if verified.is_empty() {
            info!(iteration = state.iteration, "No candidate passed verification");
            return Step::Continue;
        }

        // Annotating
        state.enter(Phase::Annotating);
        let timer = Instant::now();
        let outcome = self
            .annotation
            .annotate(verified, &mut state.dataset, cancel)
            .await;
        self.record_stage(Stage::Annotation, timer);

        state.totals.annotated += outcome.merged;
        state.totals.failed += outcome.failed.len();
        state.totals.discarded += outcome.discarded;
        if let Some(progress) = &self.progress {
            progress.set_accepted(state.collected());
        }

        if let Some(fatal) = outcome.fatal {
            return Step::Stop(RunStatus::Failed, Some(fatal));
        }
        if outcome.cancelled {
            return Step::Stop(RunStatus::Cancelled, None);
        }

        info!(
            iteration = state.iteration,
            merged = outcome.merged,
            collected = state.collected(),
            target = state.target(),
            "Iteration finished"
        );
        Step::Continue
    }

    fn record_stage(&self, stage: Stage, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_stage(stage, started.elapsed());
        }
    }
}
