use std::{str::FromStr, time::Duration};

use crate::relevance::TextMode;
use crate::retry::RetryPolicy;

/// Pipeline tunables. Every field has a default and can be overridden through
/// the environment; unparsable or zero values fall back to the default.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub max_offset: u32,
    pub max_page_size: u32,
    pub default_page_size: u32,
    pub page_interval: Duration,
    pub batch_width: usize,
    pub batch_cooldown: Duration,
    pub max_image_items: usize,
    pub job_timeout: Duration,
    pub image_download_timeout: Duration,
    /// Largest image body downloaded for label detection. The base64 payload
    /// has to fit the detector's 10 MB request limit.
    pub max_image_bytes: usize,
    pub retry: RetryPolicy,
    pub text_mode: TextMode,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_offset: 6000,
            max_page_size: 200,
            default_page_size: 100,
            page_interval: Duration::from_millis(1100),
            batch_width: 5,
            batch_cooldown: Duration::from_millis(500),
            max_image_items: 500,
            job_timeout: Duration::from_secs(300),
            image_download_timeout: Duration::from_secs(10),
            max_image_bytes: 7 * 1024 * 1024,
            retry: RetryPolicy::default(),
            text_mode: TextMode::Relaxed,
        }
    }
}

impl DiscoveryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_page_size = positive_env("CATALOG_MAX_PAGE_SIZE").unwrap_or(defaults.max_page_size);
        Self {
            max_offset: positive_env("CATALOG_MAX_OFFSET").unwrap_or(defaults.max_offset),
            max_page_size,
            default_page_size: positive_env("CATALOG_DEFAULT_PAGE_SIZE")
                .unwrap_or(defaults.default_page_size)
                .min(max_page_size),
            page_interval: millis_env("CATALOG_PAGE_INTERVAL_MS")
                .unwrap_or(defaults.page_interval),
            batch_width: positive_env("CLASSIFY_BATCH_WIDTH").unwrap_or(defaults.batch_width),
            batch_cooldown: millis_env("CLASSIFY_COOLDOWN_MS").unwrap_or(defaults.batch_cooldown),
            max_image_items: positive_env("CLASSIFY_MAX_ITEMS")
                .unwrap_or(defaults.max_image_items),
            job_timeout: positive_env("JOB_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            image_download_timeout: positive_env("IMAGE_DOWNLOAD_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.image_download_timeout),
            max_image_bytes: positive_env("IMAGE_MAX_BYTES").unwrap_or(defaults.max_image_bytes),
            retry: RetryPolicy {
                max_attempts: positive_env("RETRY_MAX_ATTEMPTS")
                    .unwrap_or(defaults.retry.max_attempts),
                base_delay: millis_env("RETRY_BASE_DELAY_MS")
                    .unwrap_or(defaults.retry.base_delay),
            },
            text_mode: std::env::var("TEXT_FILTER_MODE")
                .ok()
                .and_then(|v| TextMode::from_str(&v).ok())
                .unwrap_or(defaults.text_mode),
        }
    }
}

fn positive_env<T>(key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| *v > T::default())
}

fn millis_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}
