//! Verification stage: keep candidates that show the target concept.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dataset::{CandidateItem, VerificationVerdict, VerifiedItem};
use crate::error::CapabilityError;
use crate::llm::{InferenceRequest, VisionModel};
use crate::metrics::MetricsCollector;
use crate::pipeline::progress::ProgressCounters;
use crate::pipeline::stages::VerificationStage;
use crate::prompts::{build_verification_prompt, CURATOR_SYSTEM_PROMPT};
use crate::quality::validator::aborts_run;
use crate::resilience::{ErrorClassifier, Stage, StructuredError};

/// Whether a yes/no answer counts as a match.
pub fn is_match(answer: &str) -> bool {
    answer.to_uppercase().contains("YES")
}

/// Asks the vision capability, one candidate at a time, whether the image
/// shows the query.
pub struct ConceptVerifier {
    model: Arc<dyn VisionModel>,
    query: String,
    metrics: Option<Arc<MetricsCollector>>,
    progress: Option<ProgressCounters>,
}

impl ConceptVerifier {
    pub fn new(model: Arc<dyn VisionModel>, query: impl Into<String>) -> Self {
        Self {
            model,
            query: query.into(),
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

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Classifies one candidate.
    pub async fn check(&self, item: &CandidateItem) -> Result<VerificationVerdict, CapabilityError> {
        let request = InferenceRequest::new(build_verification_prompt(&self.query))
            .with_system_instruction(CURATOR_SYSTEM_PROMPT)
            .with_image(item.image.clone());
        let answer = self.model.infer(request).await?;
        let answer = answer.trim().to_string();
        Ok(VerificationVerdict {
            matched: is_match(&answer),
            answer,
        })
    }

    fn report(&self, accepted: usize, rejected: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.record_verification(accepted, rejected);
        }
        if let Some(progress) = &self.progress {
            progress.add_curated(accepted);
        }
    }
}

#[async_trait]
impl VerificationStage for ConceptVerifier {
    async fn verify(
        &mut self,
        candidates: Vec<CandidateItem>,
        cap: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<VerifiedItem>, StructuredError> {
        let total = candidates.len();
        let mut verified = Vec::new();
        let mut rejected = 0usize;

        info!(query = %self.query, candidates = total, cap, "Verifying candidates");

        for item in candidates {
            if verified.len() >= cap {
                break;
            }
            if cancel.is_cancelled() {
                self.report(verified.len(), rejected);
                return Err(StructuredError::cancelled(Stage::Verification));
            }

            match self.check(&item).await {
                Ok(verdict) if verdict.matched => {
                    debug!(item = %item.key, "Candidate kept");
                    verified.push(VerifiedItem { item, verdict });
                }
                Ok(verdict) => {
                    rejected += 1;
                    debug!(item = %item.key, answer = %verdict.answer, "Candidate discarded");
                }
                Err(e) => {
                    let err = ErrorClassifier::classify(Stage::Verification, &e)
                        .with_detail("item", &item.key);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_error(&err);
                    }
                    if aborts_run(&e) {
                        err.log();
                        self.report(verified.len(), rejected);
                        return Err(err);
                    }
                    rejected += 1;
                    warn!(item = %item.key, error = %e, "Verification failed, skipping candidate");
                }
            }
        }

        info!(kept = verified.len(), rejected, "Verification finished");
        self.report(verified.len(), rejected);
        Ok(verified)
    }
}
