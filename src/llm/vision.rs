//! The capability trait and its request types.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;

use crate::error::CapabilityError;

/// Encoded image bytes sent alongside a prompt.
///
/// Cloning is cheap: the bytes are shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Arc<Vec<u8>>,
    pub mime_type: String,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: Arc::new(bytes),
            mime_type: mime_type.into(),
        }
    }

    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self::new(bytes, "image/jpeg")
    }

    pub fn png(bytes: Vec<u8>) -> Self {
        Self::new(bytes, "image/png")
    }

    /// Guesses the MIME type from a file extension.
    pub fn mime_for_extension(ext: &str) -> &'static str {
        match ext.to_lowercase().as_str() {
            "png" => "image/png",
            "webp" => "image/webp",
            "gif" => "image/gif",
            _ => "image/jpeg",
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.bytes.as_slice())
    }
}

/// One call to the vision/language capability.
#[derive(Debug, Clone, Default)]
pub struct InferenceRequest {
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub image: Option<ImagePayload>,
    pub temperature: Option<f32>,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: ImagePayload) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// The narrow interface every stage depends on.
///
/// Implementations must return [`CapabilityError::EmptyResponse`] rather
/// than an empty string.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> Result<String, CapabilityError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "vision-model"
    }
}

#[async_trait]
impl<T: VisionModel + ?Sized> VisionModel for Arc<T> {
    async fn infer(&self, request: InferenceRequest) -> Result<String, CapabilityError> {
        (**self).infer(request).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = InferenceRequest::new("find dogs")
            .with_system_instruction("You label images")
            .with_temperature(0.2)
            .with_image(ImagePayload::png(vec![1, 2, 3]));

        assert_eq!(request.prompt, "find dogs");
        assert_eq!(request.system_instruction.as_deref(), Some("You label images"));
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(
            request.image.as_ref().map(|i| i.mime_type.as_str()),
            Some("image/png")
        );
    }

    #[test]
    fn test_payload_base64() {
        let payload = ImagePayload::jpeg(b"abc".to_vec());
        assert_eq!(payload.to_base64(), "YWJj");
        assert_eq!(payload.len(), 3);
        assert!(!payload.is_empty());
    }

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(ImagePayload::mime_for_extension("PNG"), "image/png");
        assert_eq!(ImagePayload::mime_for_extension("jpeg"), "image/jpeg");
        assert_eq!(ImagePayload::mime_for_extension("jpg"), "image/jpeg");
    }
}
