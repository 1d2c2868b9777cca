//! Error types for foundry operations.
//!
//! Each external collaborator gets its own error enum so call sites can
//! match on the failure they actually care about:
//! - Vision model calls ([`CapabilityError`])
//! - Image search ([`SearchError`]) and download/decode ([`FetchError`])
//! - Per-item annotation failures ([`AnnotationError`])
//! - Dataset export ([`ExportError`])
//!
//! All of them map onto the shared taxonomy in [`crate::resilience`] through
//! the [`Classify`](crate::resilience::Classify) trait.

use thiserror::Error;

use crate::resilience::{Classify, ErrorCategory};

/// Errors returned by the vision/language capability.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("API key not configured")]
    MissingApiKey,

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication rejected: {0}")]
    Unauthorized(String),

    #[error("API error {code}: {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Model returned an empty response")]
    EmptyResponse,

    #[error("Call cancelled")]
    Cancelled,
}

impl Classify for CapabilityError {
    fn category(&self) -> ErrorCategory {
        match self {
            CapabilityError::MissingApiKey => ErrorCategory::Configuration,
            CapabilityError::RequestFailed(_) => ErrorCategory::Network,
            CapabilityError::Timeout(_) => ErrorCategory::Timeout,
            CapabilityError::RateLimited(_) => ErrorCategory::RateLimit,
            CapabilityError::Unauthorized(_) => ErrorCategory::Authentication,
            CapabilityError::ApiError { code, .. } if *code >= 500 => ErrorCategory::Network,
            CapabilityError::ApiError { code: 429, .. } => ErrorCategory::RateLimit,
            CapabilityError::ApiError { code: 401 | 403, .. } => ErrorCategory::Authentication,
            CapabilityError::ApiError { .. } => ErrorCategory::Api,
            CapabilityError::ParseError(_) | CapabilityError::EmptyResponse => {
                ErrorCategory::Parsing
            }
            CapabilityError::Cancelled => ErrorCategory::Cancelled,
        }
    }
}

/// Errors returned by the image search collaborator.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Search credentials not configured: {0}")]
    MissingCredentials(String),

    #[error("Search request failed: {0}")]
    RequestFailed(String),

    #[error("Search rate limited: {0}")]
    RateLimited(String),

    #[error("Search quota exhausted: {0}")]
    QuotaExceeded(String),

    #[error("Search authentication rejected: {0}")]
    Unauthorized(String),

    #[error("Search API error {code}: {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse search response: {0}")]
    ParseError(String),
}

impl SearchError {
    /// Hard errors end discovery for the whole run instead of one page.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            SearchError::MissingCredentials(_)
                | SearchError::QuotaExceeded(_)
                | SearchError::Unauthorized(_)
        )
    }
}

impl Classify for SearchError {
    fn category(&self) -> ErrorCategory {
        match self {
            SearchError::MissingCredentials(_) => ErrorCategory::Configuration,
            SearchError::RequestFailed(_) => ErrorCategory::Network,
            SearchError::RateLimited(_) | SearchError::QuotaExceeded(_) => {
                ErrorCategory::RateLimit
            }
            SearchError::Unauthorized(_) => ErrorCategory::Authentication,
            SearchError::ApiError { code, .. } if *code >= 500 => ErrorCategory::Network,
            SearchError::ApiError { .. } => ErrorCategory::Api,
            SearchError::ParseError(_) => ErrorCategory::Parsing,
        }
    }
}

/// Errors raised while downloading or decoding a single candidate image.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Download timed out for {0}")]
    Timeout(String),

    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Cannot decode image from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for FetchError {
    fn category(&self) -> ErrorCategory {
        match self {
            FetchError::Download { .. } | FetchError::Status { .. } => ErrorCategory::Network,
            FetchError::Timeout(_) => ErrorCategory::Timeout,
            FetchError::Decode { .. } => ErrorCategory::Validation,
            FetchError::Io(_) => ErrorCategory::Filesystem,
        }
    }
}

/// Why a single item could not be annotated.
#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("No parsable box records in response: {0}")]
    Unparsable(String),

    #[error("All {dropped} box records failed coordinate validation")]
    NoValidRegions { dropped: usize },

    #[error("Refinement produced no candidate after {rounds} rounds")]
    NoCandidate { rounds: u32 },
}

impl Classify for AnnotationError {
    fn category(&self) -> ErrorCategory {
        match self {
            AnnotationError::Capability(e) => e.category(),
            AnnotationError::Unparsable(_) => ErrorCategory::Parsing,
            AnnotationError::NoValidRegions { .. } | AnnotationError::NoCandidate { .. } => {
                ErrorCategory::Validation
            }
        }
    }
}

/// Errors that can occur during dataset export.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Nothing to export")]
    Empty,

    #[error("No annotations.json in {}", .0.display())]
    MissingAnnotations(std::path::PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Classify for ExportError {
    fn category(&self) -> ErrorCategory {
        match self {
            ExportError::Empty => ErrorCategory::Validation,
            ExportError::MissingAnnotations(_) => ErrorCategory::Filesystem,
            ExportError::Io(_) => ErrorCategory::Filesystem,
            ExportError::Json(_) => ErrorCategory::Parsing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_error_categories() {
        assert_eq!(
            CapabilityError::RateLimited("slow down".to_string()).category(),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            CapabilityError::ApiError {
                code: 503,
                message: "unavailable".to_string()
            }
            .category(),
            ErrorCategory::Network
        );
        assert_eq!(
            CapabilityError::ApiError {
                code: 403,
                message: "denied".to_string()
            }
            .category(),
            ErrorCategory::Authentication
        );
        assert_eq!(
            CapabilityError::EmptyResponse.category(),
            ErrorCategory::Parsing
        );
    }

    #[test]
    fn test_search_error_hardness() {
        assert!(SearchError::QuotaExceeded("daily limit".to_string()).is_hard());
        assert!(SearchError::Unauthorized("bad key".to_string()).is_hard());
        assert!(!SearchError::RequestFailed("reset".to_string()).is_hard());
    }

    #[test]
    fn test_annotation_error_inherits_capability_category() {
        let err = AnnotationError::from(CapabilityError::Timeout("30s".to_string()));
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn test_export_error_display() {
        assert_eq!(ExportError::Empty.to_string(), "Nothing to export");
        let io = ExportError::from(std::io::Error::other("disk full"));
        assert_eq!(io.category(), ErrorCategory::Filesystem);
    }
}
