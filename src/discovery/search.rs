//! Image search collaborator.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;

use crate::error::SearchError;

/// Custom Search JSON API endpoint.
const SEARCH_URL: &str = "https://www.googleapis.com/customsearch/v1";

/// Results per request allowed by the API.
pub const PAGE_SIZE: usize = 10;

/// Highest 1-based start index the API serves (100-result window).
pub const MAX_START: u32 = 91;

const REQUEST_TIMEOUT_SECS: u64 = 30;

pub const API_KEY_ENV: &str = "GOOGLE_SEARCH_API_KEY";
pub const CX_ENV: &str = "GOOGLE_SEARCH_CX";

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    pub urls: Vec<String>,
    /// 1-based index to resume from on the next call.
    pub next_start: u32,
}

impl SearchPage {
    /// A page with no results that leaves the cursor at `start`.
    pub fn empty(start: u32) -> Self {
        Self {
            urls: Vec::new(),
            next_start: start,
        }
    }
}

/// Pages through image search results.
#[async_trait]
pub trait ImageSearch: Send + Sync {
    /// Returns up to `count` image URLs for `query` starting at the 1-based
    /// `start` index.
    async fn search(&self, query: &str, count: usize, start: u32)
        -> Result<SearchPage, SearchError>;
}

/// Google Custom Search in image mode.
pub struct GoogleImageSearch {
    client: Client,
    api_key: String,
    cx: String,
    endpoint: String,
}

impl GoogleImageSearch {
    pub fn new(api_key: String, cx: String) -> Result<Self, SearchError> {
        Self::with_endpoint(api_key, cx, SEARCH_URL.to_string())
    }

    /// Reads `GOOGLE_SEARCH_API_KEY` and `GOOGLE_SEARCH_CX`.
    pub fn from_env() -> Result<Self, SearchError> {
        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| SearchError::MissingCredentials(API_KEY_ENV.to_string()))?;
        let cx = std::env::var(CX_ENV)
            .map_err(|_| SearchError::MissingCredentials(CX_ENV.to_string()))?;
        Self::new(api_key, cx)
    }

    pub fn with_endpoint(api_key: String, cx: String, endpoint: String) -> Result<Self, SearchError> {
        if api_key.trim().is_empty() {
            return Err(SearchError::MissingCredentials(API_KEY_ENV.to_string()));
        }
        if cx.trim().is_empty() {
            return Err(SearchError::MissingCredentials(CX_ENV.to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| SearchError::RequestFailed(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            cx,
            endpoint,
        })
    }

    fn request_url(&self, query: &str, num: usize, start: u32) -> Result<Url, SearchError> {
        let num = num.to_string();
        let start = start.to_string();
        Url::parse_with_params(
            &self.endpoint,
            &[
                ("key", self.api_key.as_str()),
                ("cx", self.cx.as_str()),
                ("q", query),
                ("searchType", "image"),
                ("num", num.as_str()),
                ("start", start.as_str()),
                ("safe", "off"),
            ],
        )
        .map_err(|e| SearchError::RequestFailed(format!("Invalid search URL: {}", e)))
    }
}

#[async_trait]
impl ImageSearch for GoogleImageSearch {
    async fn search(
        &self,
        query: &str,
        count: usize,
        start: u32,
    ) -> Result<SearchPage, SearchError> {
        let start = start.max(1);
        if start > MAX_START || count == 0 {
            return Ok(SearchPage::empty(start));
        }

        let num = count.min(PAGE_SIZE);
        let url = self.request_url(query, num, start)?;
        tracing::debug!(query, start, num, "Searching images");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SearchError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(map_status(code, message));
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| SearchError::ParseError(e.to_string()))?;

        let urls: Vec<String> = body.items.into_iter().filter_map(|item| item.link).collect();
        let next_start = start + urls.len() as u32;
        tracing::debug!(found = urls.len(), next_start, "Search page received");

        Ok(SearchPage { urls, next_start })
    }
}

fn map_status(code: u16, message: String) -> SearchError {
    let lower = message.to_lowercase();
    match code {
        _ if lower.contains("quota") || lower.contains("limit exceeded") => {
            SearchError::QuotaExceeded(message)
        }
        401 | 403 => SearchError::Unauthorized(message),
        429 => SearchError::RateLimited(message),
        _ => SearchError::ApiError { code, message },
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    items: Vec<ApiItem>,
}

#[derive(Debug, Deserialize)]
struct ApiItem {
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GoogleImageSearch {
        GoogleImageSearch::new("key".to_string(), "engine".to_string()).expect("client")
    }

    #[test]
    fn test_missing_credentials() {
        let err = GoogleImageSearch::new(String::new(), "cx".to_string())
            .err()
            .expect("empty key rejected");
        assert!(err.is_hard());
        assert!(GoogleImageSearch::new("k".to_string(), " ".to_string()).is_err());
    }

    #[test]
    fn test_request_url_params() {
        let url = client().request_url("red fox", 10, 11).expect("url");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("q".to_string(), "red fox".to_string())));
        assert!(pairs.contains(&("searchType".to_string(), "image".to_string())));
        assert!(pairs.contains(&("start".to_string(), "11".to_string())));
        assert!(pairs.contains(&("num".to_string(), "10".to_string())));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(403, "Forbidden".to_string()),
            SearchError::Unauthorized(_)
        ));
        assert!(matches!(
            map_status(429, "Too many".to_string()),
            SearchError::RateLimited(_)
        ));
        assert!(matches!(
            map_status(429, "Quota exceeded for quota metric".to_string()),
            SearchError::QuotaExceeded(_)
        ));
        assert!(matches!(
            map_status(500, "boom".to_string()),
            SearchError::ApiError { code: 500, .. }
        ));
    }

    #[tokio::test]
    async fn test_window_exhausted_without_request() {
        let page = client().search("fox", 10, 95).await.expect("page");
        assert!(page.urls.is_empty());
        assert_eq!(page.next_start, 95);
    }
}
