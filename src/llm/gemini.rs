//! Gemini `generateContent` binding for [`VisionModel`].
//!
//! A single HTTP call per [`infer`](VisionModel::infer); rate limiting and
//! retries live in [`GuardedModel`](super::GuardedModel) so they apply to any
//! binding.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CapabilityError;
use crate::llm::{InferenceRequest, VisionModel};

/// Default Gemini REST endpoint.
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default model to use if none specified.
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 90;

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Gemini client.
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiClient {
    /// Creates a client for the default model.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityError::MissingApiKey` for an empty key and
    /// `CapabilityError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(api_key: String) -> Result<Self, CapabilityError> {
        Self::with_custom_url(api_key, GEMINI_BASE_URL.to_string(), DEFAULT_MODEL.to_string())
    }

    /// Reads the key from `GEMINI_API_KEY`.
    pub fn from_env() -> Result<Self, CapabilityError> {
        let key = std::env::var(API_KEY_ENV).map_err(|_| CapabilityError::MissingApiKey)?;
        Self::new(key)
    }

    pub fn with_model(api_key: String, model: String) -> Result<Self, CapabilityError> {
        Self::with_custom_url(api_key, GEMINI_BASE_URL.to_string(), model)
    }

    pub fn with_custom_url(
        api_key: String,
        base_url: String,
        model: String,
    ) -> Result<Self, CapabilityError> {
        if api_key.trim().is_empty() {
            return Err(CapabilityError::MissingApiKey);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| CapabilityError::RequestFailed(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    /// Key with the middle masked, for logs.
    pub fn api_key_masked(&self) -> String {
        if self.api_key.len() <= 8 {
            return "***".to_string();
        }
        format!(
            "{}...{}",
            &self.api_key[..4],
            &self.api_key[self.api_key.len() - 4..]
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_body(request: &InferenceRequest) -> ApiRequest {
        let mut parts = Vec::with_capacity(2);
        if let Some(image) = &request.image {
            parts.push(ApiPart::InlineData {
                inline_data: ApiBlob {
                    mime_type: image.mime_type.clone(),
                    data: image.to_base64(),
                },
            });
        }
        parts.push(ApiPart::Text {
            text: request.prompt.clone(),
        });

        ApiRequest {
            system_instruction: request.system_instruction.as_ref().map(|text| ApiContent {
                role: None,
                parts: vec![ApiPart::Text { text: text.clone() }],
            }),
            contents: vec![ApiContent {
                role: Some("user".to_string()),
                parts,
            }],
            generation_config: request.temperature.map(|temperature| ApiGenerationConfig {
                temperature: Some(temperature),
            }),
        }
    }
}

#[async_trait]
impl VisionModel for GeminiClient {
    async fn infer(&self, request: InferenceRequest) -> Result<String, CapabilityError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = Self::build_body(&request);

        let http_response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CapabilityError::Timeout(e.to_string())
                } else {
                    CapabilityError::RequestFailed(e.to_string())
                }
            })?;

        let status = http_response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);

            return Err(match code {
                401 | 403 => CapabilityError::Unauthorized(message),
                429 => CapabilityError::RateLimited(message),
                408 | 504 => CapabilityError::Timeout(message),
                _ => CapabilityError::ApiError { code, message },
            });
        }

        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| CapabilityError::ParseError(format!("Failed to parse API response: {}", e)))?;

        let text = api_response.text();
        if text.trim().is_empty() {
            return Err(CapabilityError::EmptyResponse);
        }
        Ok(text)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ApiContent>,
    contents: Vec<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<ApiGenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiContent {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<ApiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum ApiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: ApiBlob,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiBlob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<ApiCandidate>,
}

impl ApiResponse {
    /// Concatenated text parts of the first candidate.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        ApiPart::Text { text } => Some(text.as_str()),
                        ApiPart::InlineData { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct ApiCandidate {
    content: Option<ApiContent>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}
