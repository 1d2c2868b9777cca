//! Vision/language model integration.
//!
//! Stages never talk to a concrete model. They depend on the narrow
//! [`VisionModel`] trait (`infer(request) -> text`) and receive a
//! [`GuardedModel`] that adds the shared rate limiter and transient-error
//! retries in front of the real binding.
//!
//! ```ignore
//! use foundry::llm::{GeminiClient, GuardedModel, InferenceRequest, VisionModel};
//!
//! let client = GeminiClient::from_env()?;
//! let model = GuardedModel::new(Arc::new(client), limiter, cancel.clone());
//! let text = model
//!     .infer(InferenceRequest::new("Does this image contain a dog?").with_image(payload))
//!     .await?;
//! ```

pub mod gemini;
pub mod guarded;
pub mod vision;

pub use gemini::GeminiClient;
pub use guarded::GuardedModel;
pub use vision::{ImagePayload, InferenceRequest, VisionModel};
