use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::expansion::expected_labels;
use super::text::significant_tokens;
use crate::models::{ImageVerdict, VerdictReason};
use crate::retry::{RetryPolicy, retry};
use crate::vision::VisionError;

/// Where product photos come from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, VisionError>;
}

/// A backend that names what is in a photo.
#[async_trait]
pub trait LabelDetector: Send + Sync {
    async fn detect_labels(&self, image: &[u8]) -> Result<Vec<String>, VisionError>;
}

/// Decides whether a product photo shows what the keyword asks for.
///
/// Infrastructure trouble never drops an item: a missing backend, or an error
/// that outlives the retry budget, yields a passing verdict.
#[derive(Clone)]
pub struct ImageClassifier {
    images: Arc<dyn ImageSource>,
    detector: Option<Arc<dyn LabelDetector>>,
    retry: RetryPolicy,
}

impl ImageClassifier {
    pub fn new(
        images: Arc<dyn ImageSource>,
        detector: Option<Arc<dyn LabelDetector>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            images,
            detector,
            retry,
        }
    }

    pub fn backend_configured(&self) -> bool {
        self.detector.is_some()
    }

    pub async fn classify(&self, image_url: Option<&str>, keyword: &str) -> ImageVerdict {
        let Some(detector) = self.detector.as_ref() else {
            return pass_through(VerdictReason::BackendUnavailable, 0);
        };
        let Some(url) = image_url.map(str::trim).filter(|url| !url.is_empty()) else {
            return pass_through(VerdictReason::NoImage, 0);
        };

        let outcome = retry(self.retry, "classify_image", move |_| async move {
            let bytes = self.images.fetch(url).await?;
            detector.detect_labels(&bytes).await
        })
        .await;

        match outcome.result {
            Ok(labels) => {
                let labels: Vec<String> = labels
                    .into_iter()
                    .map(|label| label.trim().to_lowercase())
                    .filter(|label| !label.is_empty())
                    .collect();
                let matched = labels_match(&labels, keyword);
                debug!(
                    target = "discovery.vision",
                    url,
                    labels = ?labels,
                    matched = ?matched,
                    "image_classified"
                );
                ImageVerdict {
                    passed: matched.is_some(),
                    reason: if matched.is_some() {
                        VerdictReason::Matched
                    } else {
                        VerdictReason::NoMatch
                    },
                    labels,
                    matched,
                    attempts: outcome.attempts,
                }
            }
            Err(VisionError::NotConfigured) => {
                pass_through(VerdictReason::BackendUnavailable, outcome.attempts)
            }
            Err(err) => {
                warn!(
                    target = "discovery.vision",
                    url,
                    attempts = outcome.attempts,
                    error = %err,
                    "image_classification_failed_open"
                );
                pass_through(VerdictReason::FailedOpen, outcome.attempts)
            }
        }
    }
}

fn pass_through(reason: VerdictReason, attempts: u32) -> ImageVerdict {
    ImageVerdict {
        passed: true,
        reason,
        labels: Vec::new(),
        matched: None,
        attempts,
    }
}

/// Returns the first detected label that fuzzily agrees with the keyword.
///
/// A label matches when it contains, or is contained in, an expected label, or
/// when a keyword token appears in it. Loose on purpose: recall matters more
/// than precision here.
pub fn labels_match(labels: &[String], keyword: &str) -> Option<String> {
    let expected = expected_labels(keyword);
    let tokens = significant_tokens(keyword);

    labels
        .iter()
        .map(|label| label.trim().to_lowercase())
        .filter(|label| !label.is_empty())
        .find(|label| {
            expected
                .iter()
                .any(|entry| label.contains(entry.as_str()) || entry.contains(label.as_str()))
                || tokens.iter().any(|token| label.contains(token.as_str()))
        })
}
