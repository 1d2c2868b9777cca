//! Failure handling shared by every stage.
//!
//! - [`classify`]: error taxonomy (category, severity) and the classifier that
//!   turns stage errors into [`StructuredError`] values
//! - [`retry`]: explicit [`RetryPolicy`] value objects passed to call sites
//! - [`rate_limiter`]: the process-wide token bucket guarding the vision model

pub mod classify;
pub mod rate_limiter;
pub mod retry;

pub use classify::{
    classify_message, Classify, ErrorCategory, ErrorClassifier, ErrorSeverity, Stage,
    StructuredError,
};
pub use rate_limiter::{RateLimiter, RateTier};
pub use retry::{Backoff, Cancelled, RetryPolicy};
