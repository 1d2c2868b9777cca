//! Controller state: phases, running totals and terminal statuses.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::dataset::Dataset;
use crate::resilience::StructuredError;

/// Where the controller is within one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    Mining,
    Curating,
    Annotating,
    Finished,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Mining => "MINING",
            Phase::Curating => "CURATING",
            Phase::Annotating => "ANNOTATING",
            Phase::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Target reached.
    Done,
    /// Stopped with some but not all items.
    Partial,
    /// Stopped with nothing collected.
    FailedEmpty,
    /// A fatal error ended the run.
    Failed,
    /// The run's token fired.
    Cancelled,
}

impl RunStatus {
    /// Status of a run that stopped without a fatal error or cancellation.
    pub fn stopped(collected: usize, target: usize) -> Self {
        if collected >= target {
            RunStatus::Done
        } else if collected == 0 {
            RunStatus::FailedEmpty
        } else {
            RunStatus::Partial
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Done => "DONE",
            RunStatus::Partial => "PARTIAL",
            RunStatus::FailedEmpty => "FAILED_EMPTY",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    /// DONE and PARTIAL both carry a usable dataset.
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Partial)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stage running totals across iterations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTotals {
    pub mined: usize,
    pub curated: usize,
    pub annotated: usize,
    pub failed: usize,
    pub discarded: usize,
}

/// Mutable state of one run, owned by the controller.
#[derive(Debug)]
pub struct PipelineState {
    pub dataset: Dataset,
    pub iteration: u32,
    pub phase: Phase,
    pub totals: StageTotals,
    /// Consecutive iterations whose discovery returned nothing.
    pub empty_streak: u32,
}

impl PipelineState {
    pub fn new(target: usize) -> Self {
        Self {
            dataset: Dataset::new(target),
            iteration: 0,
            phase: Phase::Idle,
            totals: StageTotals::default(),
            empty_streak: 0,
        }
    }

    pub fn target(&self) -> usize {
        self.dataset.target()
    }

    pub fn collected(&self) -> usize {
        self.dataset.len()
    }

    /// Items still missing.
    pub fn needed(&self) -> usize {
        self.dataset.remaining()
    }

    pub fn enter(&mut self, phase: Phase) {
        tracing::debug!(iteration = self.iteration, from = %self.phase, to = %phase, "Phase change");
        self.phase = phase;
    }
}

/// Result of a run. Always returned, never raised.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub status: RunStatus,
    pub collected: usize,
    pub target: usize,
    pub iterations: u32,
    pub totals: StageTotals,
    pub dataset: Dataset,
    /// The error that ended the run, if one did.
    pub error: Option<StructuredError>,
    pub elapsed: Duration,
}

impl PipelineOutcome {
    pub fn from_state(
        state: PipelineState,
        status: RunStatus,
        error: Option<StructuredError>,
        elapsed: Duration,
    ) -> Self {
        Self {
            status,
            collected: state.collected(),
            target: state.target(),
            iterations: state.iteration,
            totals: state.totals,
            dataset: state.dataset,
            error,
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// One-line description for logs and the CLI.
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{}: {}/{} items in {} iteration(s), {:.1}s",
            self.status,
            self.collected,
            self.target,
            self.iterations,
            self.elapsed.as_secs_f64()
        );
        if let Some(err) = &self.error {
            line.push_str(&format!(" ({})", err));
        }
        line
    }
}
