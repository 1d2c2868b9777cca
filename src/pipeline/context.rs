//! Per-run shared collaborators.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::annotation::{AnnotationWorkerPool, DetectionAnnotator, ItemAnnotator};
use crate::llm::{GuardedModel, VisionModel};
use crate::metrics::MetricsCollector;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::progress::ProgressCounters;
use crate::quality::{QualityRefinementLoop, QualityValidator};
use crate::resilience::RateLimiter;

/// Everything a run's stages share, built once and handed out by `Arc` or
/// clone.
///
/// `model` is already guarded: every call through it takes a token from
/// `limiter`, retries transient failures and stops when `cancel` fires.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<PipelineConfig>,
    pub model: Arc<dyn VisionModel>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsCollector>,
    pub cancel: CancellationToken,
    pub progress: ProgressCounters,
}

impl PipelineContext {
    /// Wraps `raw_model` with a limiter sized from the configured tier.
    pub fn new(
        config: PipelineConfig,
        raw_model: Arc<dyn VisionModel>,
        cancel: CancellationToken,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.requests_per_minute()));
        Self::with_limiter(config, raw_model, limiter, cancel)
    }

    /// Same as [`new`](Self::new) with a caller-supplied limiter, so several
    /// runs in one process can share a quota.
    pub fn with_limiter(
        config: PipelineConfig,
        raw_model: Arc<dyn VisionModel>,
        limiter: Arc<RateLimiter>,
        cancel: CancellationToken,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new(config.metrics.enabled));
        let model = GuardedModel::new(raw_model, Arc::clone(&limiter), cancel.clone())
            .with_metrics(Arc::clone(&metrics));

        tracing::debug!(
            requests_per_minute = config.rate_limit.requests_per_minute(),
            metrics = config.metrics.enabled,
            "Run context created"
        );

        Self {
            config: Arc::new(config),
            model: Arc::new(model),
            limiter,
            metrics,
            cancel,
            progress: ProgressCounters::new(),
        }
    }

    /// The per-item annotator: the refinement loop when enabled, otherwise a
    /// single detection call.
    pub fn annotator(&self) -> Arc<dyn ItemAnnotator> {
        let quality = &self.config.quality_loop;
        if quality.enabled {
            let validator = QualityValidator::new(Arc::clone(&self.model), quality.validation_method);
            let refinement = QualityRefinementLoop::new(
                Arc::clone(&self.model),
                validator,
                self.config.refinement_config(),
            )
            .with_metrics(Arc::clone(&self.metrics));
            Arc::new(refinement)
        } else {
            Arc::new(DetectionAnnotator::new(Arc::clone(&self.model)))
        }
    }

    /// A worker pool wired to this run's metrics and progress counters.
    pub fn annotation_pool(&self) -> AnnotationWorkerPool {
        AnnotationWorkerPool::new(self.config.pool_config(), self.annotator())
            .with_metrics(Arc::clone(&self.metrics))
            .with_progress(self.progress.clone())
    }
}
