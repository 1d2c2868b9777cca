//! Iterative annotate-then-review loop.
//!
//! Each round asks for annotations (with the previous round's feedback from
//! round two on), reviews the candidate and stops at the first approval or
//! after `max_iterations` rounds. Which round's candidate is returned is set
//! by the [`RetentionPolicy`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::annotation::{parse_regions, AnnotationResult, AnnotationTask, ItemAnnotator};
use crate::error::AnnotationError;
use crate::llm::{InferenceRequest, VisionModel};
use crate::metrics::MetricsCollector;
use crate::prompts::build_refinement_prompt;

use super::validator::{aborts_run, QualityValidator, ValidationReport, Verdict};

/// Which round's candidate the loop returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// The most recent candidate, whether or not it improved.
    #[default]
    Latest,
    /// The best reviewed candidate: higher verdict, then fewer issues, then
    /// the later round.
    BestVerdict,
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPolicy::Latest => f.write_str("latest"),
            RetentionPolicy::BestVerdict => f.write_str("best_verdict"),
        }
    }
}

impl FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "latest" => Ok(RetentionPolicy::Latest),
            "best_verdict" | "best" => Ok(RetentionPolicy::BestVerdict),
            other => Err(format!(
                "unknown retention policy '{}', expected latest or best_verdict",
                other
            )),
        }
    }
}

/// One round of the loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    /// 1-based round number.
    pub iteration: u32,
    pub box_count: usize,
    pub verdict: Verdict,
    pub feedback: String,
    pub issues: Vec<String>,
}

/// Append-only record of every round for one item.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefinementTrace {
    entries: Vec<TraceEntry>,
}

impl RefinementTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&TraceEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Feedback to carry into the next round, if the last round left any.
    pub fn last_feedback(&self) -> Option<&str> {
        self.last()
            .map(|e| e.feedback.as_str())
            .filter(|f| !f.trim().is_empty())
    }

    /// Collapses the trace into what is kept with the result.
    pub fn summarize(&self, selected_iteration: Option<u32>) -> RefinementSummary {
        let last = self.last();
        RefinementSummary {
            rounds: self.entries.len() as u32,
            final_status: last.map(|e| e.verdict).unwrap_or(Verdict::Error),
            selected_iteration,
            approved: last.map(|e| e.verdict.is_approved()).unwrap_or(false),
            last_feedback: last.map(|e| e.feedback.clone()).unwrap_or_default(),
        }
    }
}

/// Kept with each refined result once the per-round detail is dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefinementSummary {
    pub rounds: u32,
    /// Verdict of the last round.
    pub final_status: Verdict,
    /// Round whose candidate was returned.
    pub selected_iteration: Option<u32>,
    pub approved: bool,
    pub last_feedback: String,
}

/// Loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefinementConfig {
    pub max_iterations: u32,
    pub retention: RetentionPolicy,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            retention: RetentionPolicy::Latest,
        }
    }
}

/// The returned candidate plus the full trace.
#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    pub result: AnnotationResult,
    pub trace: RefinementTrace,
}

struct Retained {
    iteration: u32,
    rank: (u8, std::cmp::Reverse<usize>),
    result: AnnotationResult,
}

/// Per-item refine/review loop.
pub struct QualityRefinementLoop {
    model: Arc<dyn VisionModel>,
    validator: QualityValidator,
    config: RefinementConfig,
    metrics: Option<Arc<MetricsCollector>>,
}

impl QualityRefinementLoop {
    pub fn new(
        model: Arc<dyn VisionModel>,
        validator: QualityValidator,
        config: RefinementConfig,
    ) -> Self {
        Self {
            model,
            validator,
            config: RefinementConfig {
                max_iterations: config.max_iterations.max(1),
                ..config
            },
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    /// Runs the loop for one item.
    ///
    /// # Errors
    ///
    /// `AnnotationError::NoCandidate` when no round produced a parsable
    /// candidate, or the capability error when it must end the run.
    pub async fn refine(&self, task: &AnnotationTask) -> Result<RefinementOutcome, AnnotationError> {
        let query = task.query();
        let key = &task.item.key;
        let mut trace = RefinementTrace::new();
        let mut retained: Option<Retained> = None;

        for iteration in 1..=self.config.max_iterations {
            let prompt = build_refinement_prompt(&query, trace.last_feedback());
            let request = InferenceRequest::new(prompt).with_image(task.item.image.clone());

            let text = match self.model.infer(request).await {
                Ok(text) => text,
                Err(e) if aborts_run(&e) => return Err(e.into()),
                Err(e) => {
                    self.record_round(
                        &mut trace,
                        TraceEntry {
                            iteration,
                            box_count: 0,
                            verdict: Verdict::Error,
                            feedback: String::new(),
                            issues: vec![e.to_string()],
                        },
                    );
                    continue;
                }
            };

            let parsed = match parse_regions(&text, task.default_label()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.record_round(
                        &mut trace,
                        TraceEntry {
                            iteration,
                            box_count: 0,
                            verdict: Verdict::Error,
                            feedback: String::new(),
                            issues: vec![e.to_string()],
                        },
                    );
                    continue;
                }
            };

            let candidate = AnnotationResult::new(
                key.clone(),
                parsed.regions,
                task.item.width,
                task.item.height,
            )
            .with_source(task.item.source.clone())
            .with_image(task.item.image.clone());

            let report: ValidationReport = self
                .validator
                .validate(&query, &candidate, &task.item.image)
                .await?;
            let verdict = report.verdict;
            let rank = (verdict.rank(), std::cmp::Reverse(report.issues.len()));

            tracing::debug!(
                item = %key,
                iteration = iteration,
                boxes = candidate.regions.len(),
                verdict = %verdict,
                "Refinement round reviewed"
            );

            self.record_round(
                &mut trace,
                TraceEntry {
                    iteration,
                    box_count: candidate.regions.len(),
                    verdict,
                    feedback: report.feedback,
                    issues: report.issues,
                },
            );

            let replace = match (&retained, self.config.retention) {
                (None, _) | (Some(_), RetentionPolicy::Latest) => true,
                (Some(best), RetentionPolicy::BestVerdict) => rank >= best.rank,
            };
            if replace {
                retained = Some(Retained {
                    iteration,
                    rank,
                    result: candidate,
                });
            }

            if verdict.is_approved() {
                break;
            }
        }

        let Some(retained) = retained else {
            if let Some(metrics) = &self.metrics {
                metrics.record_refined_item(false);
            }
            return Err(AnnotationError::NoCandidate {
                rounds: trace.len() as u32,
            });
        };

        let summary = trace.summarize(Some(retained.iteration));
        if let Some(metrics) = &self.metrics {
            metrics.record_refined_item(summary.approved);
        }
        tracing::info!(
            item = %key,
            rounds = summary.rounds,
            final_status = %summary.final_status,
            selected_iteration = retained.iteration,
            "Refinement finished"
        );

        Ok(RefinementOutcome {
            result: retained.result.with_refinement(summary),
            trace,
        })
    }

    fn record_round(&self, trace: &mut RefinementTrace, entry: TraceEntry) {
        if let Some(metrics) = &self.metrics {
            metrics.record_refinement_round(entry.verdict);
        }
        trace.push(entry);
    }
}

#[async_trait]
impl ItemAnnotator for QualityRefinementLoop {
    async fn annotate(
        &self,
        task: &AnnotationTask,
        _attempt: u32,
    ) -> Result<AnnotationResult, AnnotationError> {
        self.refine(task).await.map(|outcome| outcome.result)
    }
}
