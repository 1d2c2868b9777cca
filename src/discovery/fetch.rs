//! Candidate download and decoding.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use reqwest::Client;
use sha2::{Digest, Sha256};

use crate::dataset::CandidateItem;
use crate::diversity::Fingerprint;
use crate::error::FetchError;
use crate::llm::ImagePayload;

/// Per-download timeout.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Quality of the re-encoded JPEG.
pub const JPEG_QUALITY: u8 = 85;

/// Downloads one URL into a decoded, fingerprinted candidate.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<CandidateItem, FetchError>;
}

/// HTTP implementation of [`ImageFetcher`].
pub struct HttpImageFetcher {
    client: Client,
    raw_dir: Option<PathBuf>,
}

impl HttpImageFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(DOWNLOAD_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Download {
                url: String::new(),
                reason: format!("HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            raw_dir: None,
        })
    }

    /// Also writes every accepted download to `dir`.
    pub fn with_raw_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.raw_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<CandidateItem, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(url.to_string())
            } else {
                FetchError::Download {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| FetchError::Download {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let source = url.to_string();
        let bytes = bytes.to_vec();
        let mut item = tokio::task::spawn_blocking(move || decode_candidate(&bytes, &source))
            .await
            .map_err(|e| FetchError::Decode {
                url: url.to_string(),
                reason: e.to_string(),
            })??;

        if let Some(dir) = &self.raw_dir {
            item.path = Some(save_raw(dir, &item).await?);
        }
        Ok(item)
    }
}

/// Content key: first 16 hex chars of the SHA-256 digest plus `.jpg`.
pub fn content_key(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{}.jpg", &hex::encode(digest)[..16])
}

/// Decodes downloaded bytes, normalizes them to an RGB JPEG and computes the
/// fingerprint.
pub fn decode_candidate(bytes: &[u8], source: &str) -> Result<CandidateItem, FetchError> {
    let decode_err = |reason: String| FetchError::Decode {
        url: source.to_string(),
        reason,
    };

    let decoded = image::load_from_memory(bytes).map_err(|e| decode_err(e.to_string()))?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(decode_err("empty image".to_string()));
    }

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| decode_err(e.to_string()))?;

    Ok(CandidateItem {
        key: content_key(bytes),
        source: source.to_string(),
        fingerprint: Fingerprint::from_image(&decoded),
        image: ImagePayload::jpeg(jpeg),
        width,
        height,
        path: None,
    })
}

async fn save_raw(dir: &Path, item: &CandidateItem) -> Result<PathBuf, FetchError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(&item.key);
    tokio::fs::write(&path, item.image.bytes.as_slice()).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img = RgbaImage::from_fn(16, 8, |x, _| Rgba([(x * 16) as u8, 0, 0, 255]));
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .expect("encode");
        out
    }

    #[test]
    fn test_decode_candidate_normalizes_to_jpeg() {
        let bytes = png_bytes();
        let item = decode_candidate(&bytes, "http://example.com/a.png").expect("decode");

        assert_eq!((item.width, item.height), (16, 8));
        assert_eq!(item.image.mime_type, "image/jpeg");
        assert_eq!(item.key, content_key(&bytes));
        assert!(item.key.ends_with(".jpg"));
        assert_eq!(item.key.len(), 20);

        let reloaded = image::load_from_memory(&item.image.bytes).expect("jpeg decodes");
        assert_eq!(reloaded.color(), image::ColorType::Rgb8);
    }

    #[test]
    fn test_corrupt_bytes_are_rejected() {
        let err = decode_candidate(b"<html>not an image</html>", "http://x").unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[test]
    fn test_content_key_is_stable() {
        assert_eq!(content_key(b"abc"), content_key(b"abc"));
        assert_ne!(content_key(b"abc"), content_key(b"abd"));
    }

    #[tokio::test]
    async fn test_save_raw_writes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let item = decode_candidate(&png_bytes(), "local").expect("decode");
        let path = save_raw(&dir.path().join("raw"), &item).await.expect("save");
        assert_eq!(std::fs::read(path).expect("read"), *item.image.bytes);
    }
}
