//! foundry: labeled image datasets from a vision model.
//!
//! This library drives a discover, verify, annotate and export pipeline
//! until an exact number of annotated images has been collected, and
//! writes the result as a COCO dataset.

// Core modules
pub mod annotation;
pub mod cli;
pub mod curation;
pub mod dataset;
pub mod discovery;
pub mod diversity;
pub mod error;
pub mod export;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod prompts;
pub mod quality;
pub mod resilience;
pub mod utils;

// Re-export commonly used error types
pub use error::{AnnotationError, CapabilityError, ExportError, FetchError, SearchError};
pub use pipeline::ConfigError;
