//! Error taxonomy and classification.
//!
//! Every failure that crosses a stage boundary is converted into a
//! [`StructuredError`]. The category decides the severity and the
//! recoverable/retry flags through one policy table
//! ([`ErrorCategory::policy`]), so the retry and abort decisions made by the
//! controller and the worker pool never depend on ad hoc string checks.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Api,
    RateLimit,
    Authentication,
    Parsing,
    Validation,
    Filesystem,
    Timeout,
    Configuration,
    Cancelled,
    Unknown,
}

/// How bad a failure is for the run as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Fatal,
}

/// Pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Verification,
    Annotation,
    Refinement,
    Export,
    Planning,
    Pipeline,
}

/// Severity and flags assigned to a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryPolicy {
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub retry_suggested: bool,
}

impl ErrorCategory {
    /// Returns the snake_case name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Api => "api",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Parsing => "parsing",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Filesystem => "filesystem",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Transient categories clear up on their own and are always worth a retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimit | ErrorCategory::Timeout | ErrorCategory::Network
        )
    }

    /// The severity policy table.
    pub fn policy(&self) -> CategoryPolicy {
        let (severity, recoverable, retry_suggested) = match self {
            ErrorCategory::Authentication => (ErrorSeverity::Fatal, false, false),
            ErrorCategory::Filesystem => (ErrorSeverity::High, false, false),
            ErrorCategory::Configuration => (ErrorSeverity::High, false, false),
            ErrorCategory::Cancelled => (ErrorSeverity::High, false, false),
            ErrorCategory::RateLimit => (ErrorSeverity::Medium, true, true),
            ErrorCategory::Timeout => (ErrorSeverity::Medium, true, true),
            ErrorCategory::Network => (ErrorSeverity::Medium, true, true),
            ErrorCategory::Parsing => (ErrorSeverity::Medium, true, true),
            ErrorCategory::Api => (ErrorSeverity::Medium, true, false),
            ErrorCategory::Unknown => (ErrorSeverity::Medium, true, false),
            ErrorCategory::Validation => (ErrorSeverity::Low, true, false),
        };
        CategoryPolicy {
            severity,
            recoverable,
            retry_suggested,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Verification => "verification",
            Stage::Annotation => "annotation",
            Stage::Refinement => "refinement",
            Stage::Export => "export",
            Stage::Planning => "planning",
            Stage::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every error type that can be classified.
pub trait Classify {
    fn category(&self) -> ErrorCategory;
}

/// A classified failure, carried in results instead of raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("[{stage}/{category}] {message}")]
pub struct StructuredError {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    pub stage: Stage,
    pub recoverable: bool,
    pub retry_suggested: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl StructuredError {
    /// Builds an error with the policy-table flags for `category`.
    pub fn new(stage: Stage, category: ErrorCategory, message: impl Into<String>) -> Self {
        let message = message.into();
        let policy = category.policy();
        let severity = if category == ErrorCategory::Filesystem && is_exhaustion(&message) {
            ErrorSeverity::Fatal
        } else {
            policy.severity
        };
        Self {
            category,
            severity,
            message,
            stage,
            recoverable: policy.recoverable,
            retry_suggested: policy.retry_suggested,
            details: BTreeMap::new(),
        }
    }

    pub fn cancelled(stage: Stage) -> Self {
        Self::new(stage, ErrorCategory::Cancelled, "operation cancelled")
    }

    /// Attaches a key/value detail.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == ErrorSeverity::Fatal
    }

    pub fn is_cancelled(&self) -> bool {
        self.category == ErrorCategory::Cancelled
    }

    /// Whether one more attempt is warranted after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32, max_attempts: u32) -> bool {
        attempts_made < max_attempts
            && self.recoverable
            && !self.is_fatal()
            && (self.category.is_transient() || self.retry_suggested)
    }

    /// Emits the error at the log level matching its severity.
    pub fn log(&self) {
        match self.severity {
            ErrorSeverity::Low | ErrorSeverity::Medium => tracing::warn!(
                stage = %self.stage,
                category = %self.category,
                recoverable = self.recoverable,
                "{}",
                self.message
            ),
            ErrorSeverity::High => tracing::error!(
                stage = %self.stage,
                category = %self.category,
                recoverable = self.recoverable,
                "{}",
                self.message
            ),
            ErrorSeverity::Fatal => tracing::error!(
                stage = %self.stage,
                category = %self.category,
                fatal = true,
                "{}",
                self.message
            ),
        }
    }
}

impl Classify for StructuredError {
    fn category(&self) -> ErrorCategory {
        self.category
    }
}

/// Converts stage errors into [`StructuredError`] values.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classifies a typed error by its own category mapping.
    pub fn classify<E>(stage: Stage, error: &E) -> StructuredError
    where
        E: Classify + fmt::Display + ?Sized,
    {
        StructuredError::new(stage, error.category(), error.to_string())
    }

    /// Classifies a foreign error by its message alone.
    pub fn classify_foreign<E>(stage: Stage, error: &E) -> StructuredError
    where
        E: fmt::Display + ?Sized,
    {
        let message = error.to_string();
        StructuredError::new(stage, classify_message(&message), message)
    }
}

/// Keyword-based category for errors with no type information.
pub fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["timeout", "timed out"]) {
        ErrorCategory::Timeout
    } else if has(&["rate limit", "429", "too many requests", "quota"]) {
        ErrorCategory::RateLimit
    } else if has(&["api key", "authentication", "unauthorized", "401", "403"]) {
        ErrorCategory::Authentication
    } else if has(&["permission", "disk", "no space", "file not found"]) {
        ErrorCategory::Filesystem
    } else if has(&["json", "parse", "unexpected token"]) {
        ErrorCategory::Parsing
    } else if has(&["cannot identify image", "corrupt", "invalid image", "decode"]) {
        ErrorCategory::Validation
    } else if has(&["connection", "dns", "network", "reset by peer"]) {
        ErrorCategory::Network
    } else {
        ErrorCategory::Unknown
    }
}

fn is_exhaustion(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["no space", "disk full", "quota exceeded", "storage full"]
        .iter()
        .any(|n| lower.contains(n))
}
