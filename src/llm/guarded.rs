//! Rate limiting and retries in front of any [`VisionModel`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::CapabilityError;
use crate::llm::{InferenceRequest, VisionModel};
use crate::metrics::MetricsCollector;
use crate::resilience::{Classify, RateLimiter, RetryPolicy, Stage};

/// Wraps a model so every attempt first takes a token from the shared
/// [`RateLimiter`], transient failures are retried per a [`RetryPolicy`],
/// and a fired [`CancellationToken`] aborts both the wait and the call.
pub struct GuardedModel {
    inner: Arc<dyn VisionModel>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    metrics: Option<Arc<MetricsCollector>>,
}

impl GuardedModel {
    pub fn new(
        inner: Arc<dyn VisionModel>,
        limiter: Arc<RateLimiter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            limiter,
            retry: RetryPolicy::transient(),
            cancel,
            metrics: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl VisionModel for GuardedModel {
    async fn infer(&self, request: InferenceRequest) -> Result<String, CapabilityError> {
        let result = self
            .retry
            .run(Stage::Pipeline, &self.cancel, |_| {
                let request = request.clone();
                async move {
                    self.limiter.acquire(&self.cancel).await?;
                    let outcome = self.inner.infer(request).await;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_capability_call(outcome.as_ref().err().map(|e| e.category()));
                    }
                    outcome
                }
            })
            .await;

        if let Err(err) = &result {
            tracing::debug!(model = self.inner.name(), error = %err, "Capability call failed");
        }
        result
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
