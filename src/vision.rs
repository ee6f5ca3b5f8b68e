use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use urlencoding::encode;

use crate::http::build_client;
use crate::relevance::{ImageSource, LabelDetector};
use crate::retry::Transient;

pub static VISION_API_KEY: Lazy<Option<String>> = Lazy::new(|| {
    std::env::var("VISION_API_KEY")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
});

pub static VISION_ENDPOINT: Lazy<String> = Lazy::new(|| {
    std::env::var("VISION_ENDPOINT")
        .unwrap_or_else(|_| "https://vision.googleapis.com/v1/images:annotate".into())
});

const MAX_LABELS: u32 = 15;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("label detection is not configured")]
    NotConfigured,
    #[error("invalid image url: {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("{context} returned HTTP {status}")]
    Status {
        context: &'static str,
        status: u16,
    },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("label detection rejected the image: {0}")]
    Rejected(String),
    #[error("image is larger than {limit} bytes")]
    TooLarge { limit: usize },
}

impl Transient for VisionError {
    fn is_transient(&self) -> bool {
        match self {
            VisionError::Request(_) => true,
            VisionError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
                    || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || *status >= 500
            }
            VisionError::NotConfigured
            | VisionError::InvalidUrl(_)
            | VisionError::InvalidResponse(_)
            | VisionError::Rejected(_)
            | VisionError::TooLarge { .. } => false,
        }
    }
}

/// Downloads product photos over plain HTTP(S). Bodies over `max_bytes` are
/// refused without being buffered in full.
pub struct HttpImageSource {
    http: Client,
    timeout: Duration,
    max_bytes: usize,
}

impl HttpImageSource {
    pub fn new(timeout: Duration, max_bytes: usize) -> Self {
        Self {
            http: build_client(),
            timeout,
            max_bytes,
        }
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, VisionError> {
        let parsed =
            reqwest::Url::parse(url).map_err(|_| VisionError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(VisionError::InvalidUrl(url.to_string()));
        }

        let mut response = self
            .http
            .get(parsed)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| VisionError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(VisionError::Status {
                context: "image download",
                status: response.status().as_u16(),
            });
        }

        let limit = self.max_bytes;
        let declared = response.content_length().unwrap_or(0);
        if declared > limit as u64 {
            return Err(VisionError::TooLarge { limit });
        }

        let mut body = Vec::with_capacity(declared as usize);
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| VisionError::Request(err.to_string()))?
        {
            if body.len() + chunk.len() > limit {
                return Err(VisionError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Label detection against a Cloud Vision `images:annotate` endpoint.
pub struct VisionClient {
    http: Client,
    endpoint: String,
    api_key: String,
}

impl VisionClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: build_client(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    /// `None` when no API key is configured; the classifier then passes every item.
    pub fn from_env() -> Option<Self> {
        VISION_API_KEY
            .as_ref()
            .map(|key| Self::new(VISION_ENDPOINT.as_str(), key.as_str()))
    }
}

#[async_trait]
impl LabelDetector for VisionClient {
    async fn detect_labels(&self, image: &[u8]) -> Result<Vec<String>, VisionError> {
        if self.api_key.is_empty() {
            return Err(VisionError::NotConfigured);
        }

        let body = AnnotateRequest {
            requests: vec![AnnotateImageRequest {
                image: ImagePayload {
                    content: BASE64.encode(image),
                },
                features: vec![Feature {
                    r#type: "LABEL_DETECTION",
                    max_results: MAX_LABELS,
                }],
            }],
        };

        let url = format!("{}?key={}", self.endpoint, encode(&self.api_key));
        let mut response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| VisionError::Request(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(VisionError::NotConfigured);
        }
        if !status.is_success() {
            return Err(VisionError::Status {
                context: "label detection",
                status: status.as_u16(),
            });
        }

        let payload: AnnotateResponse = response
            .json()
            .await
            .map_err(|err| VisionError::InvalidResponse(err.to_string()))?;

        let first = payload
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| VisionError::InvalidResponse("empty responses".into()))?;
        if let Some(err) = first.error {
            return Err(VisionError::Rejected(err.message));
        }

        Ok(first
            .label_annotations
            .into_iter()
            .map(|label| label.description)
            .collect())
    }
}

#[derive(Debug, Serialize)]
struct AnnotateRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Debug, Serialize)]
struct AnnotateImageRequest {
    image: ImagePayload,
    features: Vec<Feature>,
}

#[derive(Debug, Serialize)]
struct ImagePayload {
    content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Feature {
    r#type: &'static str,
    max_results: u32,
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    label_annotations: Vec<LabelAnnotation>,
    #[serde(default)]
    error: Option<StatusPayload>,
}

#[derive(Debug, Deserialize)]
struct LabelAnnotation {
    description: String,
    #[allow(dead_code)]
    #[serde(default)]
    score: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    #[serde(default)]
    message: String,
}
