//! The per-item annotation seam and the single-call detector.

use std::sync::Arc;

use async_trait::async_trait;

use crate::annotation::parse::parse_regions;
use crate::annotation::types::AnnotationResult;
use crate::dataset::CandidateItem;
use crate::error::AnnotationError;
use crate::llm::{InferenceRequest, VisionModel};
use crate::prompts::build_detection_prompt;

/// Label used when neither the record nor the request names one.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Everything one worker needs to annotate one item.
///
/// Built by the pool before dispatch so workers never capture loop state.
#[derive(Debug, Clone)]
pub struct AnnotationTask {
    pub item: CandidateItem,
    /// Objects to find, already split and trimmed.
    pub objects: Arc<[String]>,
    /// Position of the item in the submitted batch.
    pub task_index: usize,
    /// Worker that picked the task up.
    pub worker_index: usize,
}

impl AnnotationTask {
    /// Label given to records that carry none.
    pub fn default_label(&self) -> &str {
        match &*self.objects {
            [single] => single.as_str(),
            _ => UNKNOWN_LABEL,
        }
    }

    /// The objects joined back into a query string.
    pub fn query(&self) -> String {
        self.objects.join(", ")
    }
}

/// Produces an [`AnnotationResult`] for one item.
///
/// `attempt` is zero-based; implementations may phrase retries differently.
#[async_trait]
pub trait ItemAnnotator: Send + Sync {
    async fn annotate(
        &self,
        task: &AnnotationTask,
        attempt: u32,
    ) -> Result<AnnotationResult, AnnotationError>;
}

/// One detection call per attempt, parsed with layered recovery.
pub struct DetectionAnnotator {
    model: Arc<dyn VisionModel>,
}

impl DetectionAnnotator {
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl ItemAnnotator for DetectionAnnotator {
    async fn annotate(
        &self,
        task: &AnnotationTask,
        attempt: u32,
    ) -> Result<AnnotationResult, AnnotationError> {
        let prompt = build_detection_prompt(&task.objects, attempt > 0);
        let request = InferenceRequest::new(prompt).with_image(task.item.image.clone());
        let text = self.model.infer(request).await?;

        let parsed = parse_regions(&text, task.default_label())?;
        if parsed.dropped > 0 {
            tracing::debug!(
                item = %task.item.key,
                kept = parsed.regions.len(),
                dropped = parsed.dropped,
                "Dropped invalid box records"
            );
        }

        Ok(AnnotationResult::new(
            task.item.key.clone(),
            parsed.regions,
            task.item.width,
            task.item.height,
        )
        .with_source(task.item.source.clone())
        .with_image(task.item.image.clone()))
    }
}

/// Splits a comma-separated query into distinct, trimmed object names.
///
/// An empty list falls back to the whole query.
pub fn parse_objects(query: &str) -> Vec<String> {
    let mut objects: Vec<String> = Vec::new();
    for part in query.split(',') {
        let name = part.trim();
        if name.is_empty() {
            continue;
        }
        if !objects.iter().any(|o| o.eq_ignore_ascii_case(name)) {
            objects.push(name.to_string());
        }
    }
    if objects.is_empty() && !query.trim().is_empty() {
        objects.push(query.trim().to_string());
    }
    objects
}
