//! Stage seams driven by the controller.
//!
//! Each stage is a trait so the controller can be exercised with scripted
//! stages in tests; production runs plug in [`ImageMiner`],
//! [`ConceptVerifier`] and [`AnnotationWorkerPool`].
//!
//! [`ImageMiner`]: crate::discovery::ImageMiner
//! [`ConceptVerifier`]: crate::curation::ConceptVerifier

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::annotation::{AnnotationWorkerPool, PoolOutcome};
use crate::dataset::{CandidateItem, Dataset, VerifiedItem};
use crate::resilience::StructuredError;

/// Produces unique candidates.
#[async_trait]
pub trait DiscoveryStage: Send {
    /// Returns at most `needed` candidates not seen before in this run.
    ///
    /// `Err` means discovery cannot continue for the rest of the run
    /// (missing credentials, exhausted quota, cancellation).
    async fn discover(
        &mut self,
        needed: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<CandidateItem>, StructuredError>;
}

/// Keeps the candidates that show the target concept.
#[async_trait]
pub trait VerificationStage: Send {
    /// Accepts at most `cap` candidates, stopping as soon as it has them.
    ///
    /// `Err` is reserved for fatal failures; per-item failures only skip
    /// the item.
    async fn verify(
        &mut self,
        candidates: Vec<CandidateItem>,
        cap: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<VerifiedItem>, StructuredError>;
}

/// Annotates verified items straight into the dataset.
#[async_trait]
pub trait AnnotationStage: Send {
    /// Merges results into `dataset` without ever exceeding its target.
    async fn annotate(
        &mut self,
        items: Vec<VerifiedItem>,
        dataset: &mut Dataset,
        cancel: &CancellationToken,
    ) -> PoolOutcome;
}

/// The worker pool bound to the objects it should find.
pub struct PoolAnnotationStage {
    pool: AnnotationWorkerPool,
    objects: Vec<String>,
}

impl PoolAnnotationStage {
    pub fn new(pool: AnnotationWorkerPool, objects: Vec<String>) -> Self {
        Self { pool, objects }
    }

    pub fn pool(&self) -> &AnnotationWorkerPool {
        &self.pool
    }
}

#[async_trait]
impl AnnotationStage for PoolAnnotationStage {
    async fn annotate(
        &mut self,
        items: Vec<VerifiedItem>,
        dataset: &mut Dataset,
        cancel: &CancellationToken,
    ) -> PoolOutcome {
        let items: Vec<CandidateItem> = items.into_iter().map(CandidateItem::from).collect();
        self.pool
            .annotate_into(items, &self.objects, dataset, cancel)
            .await
    }
}
