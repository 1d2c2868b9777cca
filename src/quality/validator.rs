//! Review of candidate annotations by the vision capability.
//!
//! Three methods are supported:
//! - `coordinate`: the image plus the box list as JSON
//! - `visual`: the image with the boxes drawn on it
//! - `hybrid`: both, approved only when both approve

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::annotation::AnnotationResult;
use crate::error::CapabilityError;
use crate::llm::{ImagePayload, InferenceRequest, VisionModel};
use crate::prompts::{build_coordinate_prompt, build_visual_prompt, VALIDATOR_SYSTEM_PROMPT};
use crate::resilience::{Classify, ErrorCategory};
use crate::utils::parse_lenient;

use super::overlay::render_overlay;

/// How candidate annotations are reviewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMethod {
    #[default]
    Coordinate,
    Visual,
    Hybrid,
}

impl ValidationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationMethod::Coordinate => "coordinate",
            ValidationMethod::Visual => "visual",
            ValidationMethod::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for ValidationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "coordinate" | "coordinates" => Ok(ValidationMethod::Coordinate),
            "visual" => Ok(ValidationMethod::Visual),
            "hybrid" => Ok(ValidationMethod::Hybrid),
            other => Err(format!(
                "unknown validation method '{}', expected coordinate, visual or hybrid",
                other
            )),
        }
    }
}

/// Reviewer verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approved,
    NeedsImprovement,
    Error,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approved => "APPROVED",
            Verdict::NeedsImprovement => "NEEDS_IMPROVEMENT",
            Verdict::Error => "ERROR",
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Verdict::Approved)
    }

    /// Ordering used when retaining the best round.
    pub fn rank(&self) -> u8 {
        match self {
            Verdict::Approved => 2,
            Verdict::NeedsImprovement => 1,
            Verdict::Error => 0,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict plus the reviewer's explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub verdict: Verdict,
    pub feedback: String,
    pub issues: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawReport {
    status: String,
    #[serde(default)]
    feedback: Option<Value>,
    #[serde(default)]
    issues: Option<Value>,
}

impl ValidationReport {
    pub fn new(verdict: Verdict, feedback: impl Into<String>, issues: Vec<String>) -> Self {
        Self {
            verdict,
            feedback: feedback.into(),
            issues,
        }
    }

    pub fn approved() -> Self {
        Self::new(Verdict::Approved, "Quality check passed", Vec::new())
    }

    pub fn error(feedback: impl Into<String>) -> Self {
        Self::new(
            Verdict::Error,
            feedback,
            vec!["Validation failed".to_string()],
        )
    }

    /// Interprets reviewer text.
    ///
    /// A verdict object is used when one can be recovered. Otherwise the
    /// text is searched for a verdict keyword, and anything else is taken as
    /// improvement feedback.
    pub fn from_response(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Self::error("No response from validator");
        }

        if let Ok(raw) = parse_lenient::<RawReport>(trimmed) {
            return Self::from_raw(raw);
        }

        let upper = trimmed.to_uppercase();
        if upper.contains("NEEDS_IMPROVEMENT") {
            Self::new(
                Verdict::NeedsImprovement,
                trimmed,
                vec!["Review needed".to_string()],
            )
        } else if upper.contains("APPROVED") {
            Self::approved()
        } else {
            Self::new(
                Verdict::NeedsImprovement,
                trimmed,
                vec!["Review needed".to_string()],
            )
        }
    }

    fn from_raw(raw: RawReport) -> Self {
        let verdict = match raw.status.trim().to_uppercase().replace(' ', "_").as_str() {
            "APPROVED" => Verdict::Approved,
            "ERROR" => Verdict::Error,
            _ => Verdict::NeedsImprovement,
        };
        let feedback = match raw.feedback {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let issues = match raw.issues {
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .filter(|s| !s.trim().is_empty())
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => vec![s],
            _ => Vec::new(),
        };
        Self::new(verdict, feedback, issues)
    }

    /// Merges a coordinate and a visual report.
    pub fn combine(coordinate: ValidationReport, visual: ValidationReport) -> Self {
        if coordinate.verdict.is_approved() && visual.verdict.is_approved() {
            return Self::new(
                Verdict::Approved,
                "Both coordinate and visual validation passed",
                Vec::new(),
            );
        }

        let verdict = if coordinate.verdict == Verdict::Error && visual.verdict == Verdict::Error {
            Verdict::Error
        } else {
            Verdict::NeedsImprovement
        };

        let mut parts = Vec::new();
        if !coordinate.verdict.is_approved() {
            parts.push(format!("Coordinate check: {}", coordinate.feedback));
        }
        if !visual.verdict.is_approved() {
            parts.push(format!("Visual check: {}", visual.feedback));
        }

        let mut issues: Vec<String> = Vec::new();
        for issue in coordinate.issues.into_iter().chain(visual.issues) {
            if !issues.contains(&issue) {
                issues.push(issue);
            }
        }

        Self::new(verdict, parts.join(" | "), issues)
    }
}

/// Reviews candidate annotations with the configured method.
pub struct QualityValidator {
    model: Arc<dyn VisionModel>,
    method: ValidationMethod,
}

impl QualityValidator {
    pub fn new(model: Arc<dyn VisionModel>, method: ValidationMethod) -> Self {
        Self { model, method }
    }

    pub fn method(&self) -> ValidationMethod {
        self.method
    }

    /// Reviews `candidate` for `query`.
    ///
    /// Capability failures become an `ERROR` report, except authentication
    /// failures and cancellation, which are returned so the run can stop.
    pub async fn validate(
        &self,
        query: &str,
        candidate: &AnnotationResult,
        image: &ImagePayload,
    ) -> Result<ValidationReport, CapabilityError> {
        match self.method {
            ValidationMethod::Coordinate => self.validate_coordinates(query, candidate, image).await,
            ValidationMethod::Visual => self.validate_visual(query, candidate, image).await,
            ValidationMethod::Hybrid => {
                let coordinate = self.validate_coordinates(query, candidate, image).await?;
                let visual = self.validate_visual(query, candidate, image).await?;
                Ok(ValidationReport::combine(coordinate, visual))
            }
        }
    }

    async fn validate_coordinates(
        &self,
        query: &str,
        candidate: &AnnotationResult,
        image: &ImagePayload,
    ) -> Result<ValidationReport, CapabilityError> {
        let prompt =
            build_coordinate_prompt(query, candidate.regions.len(), &candidate.regions_json());
        self.ask(prompt, image.clone()).await
    }

    async fn validate_visual(
        &self,
        query: &str,
        candidate: &AnnotationResult,
        image: &ImagePayload,
    ) -> Result<ValidationReport, CapabilityError> {
        let overlay = match render_overlay(&image.bytes, &candidate.regions) {
            Ok(png) => ImagePayload::png(png),
            Err(e) => {
                tracing::warn!(item = %candidate.key, error = %e, "Could not render box overlay");
                return Ok(ValidationReport::error(format!(
                    "Could not render box overlay: {}",
                    e
                )));
            }
        };
        let prompt = build_visual_prompt(query, candidate.regions.len());
        self.ask(prompt, overlay).await
    }

    async fn ask(
        &self,
        prompt: String,
        image: ImagePayload,
    ) -> Result<ValidationReport, CapabilityError> {
        let request = InferenceRequest::new(prompt)
            .with_system_instruction(VALIDATOR_SYSTEM_PROMPT)
            .with_image(image);

        match self.model.infer(request).await {
            Ok(text) => Ok(ValidationReport::from_response(&text)),
            Err(e) if aborts_run(&e) => Err(e),
            Err(CapabilityError::EmptyResponse) => {
                Ok(ValidationReport::error("No response from validator"))
            }
            Err(e) => {
                tracing::debug!(error = %e, "Validator call failed");
                Ok(ValidationReport::error(format!("Validator call failed: {}", e)))
            }
        }
    }
}

/// Failures that must end the item instead of becoming an `ERROR` verdict.
pub(crate) fn aborts_run(error: &CapabilityError) -> bool {
    matches!(
        error.category(),
        ErrorCategory::Authentication | ErrorCategory::Cancelled | ErrorCategory::Configuration
    )
}
