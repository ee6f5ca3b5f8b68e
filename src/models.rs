use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use uuid::Uuid;

use crate::relevance::TextMode;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SearchRequest {
    pub keyword: String,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default = "default_true")]
    pub image_filter: bool,
    #[serde(default)]
    pub text_mode: Option<TextMode>,
    #[serde(default)]
    pub job_id: Option<Uuid>,
}

fn default_true() -> bool {
    true
}

impl SearchRequest {
    #[cfg(test)]
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            filters: SearchFilters::default(),
            page_size: None,
            image_filter: true,
            text_mode: None,
            job_id: None,
        }
    }
}

/// Every filter the catalog search accepts. Anything else in the payload is
/// rejected at deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SearchFilters {
    #[serde(default)]
    pub verified_warehouse: Option<WarehouseVerification>,
    #[serde(default)]
    pub min_inventory: Option<u32>,
    #[serde(default)]
    pub max_inventory: Option<u32>,
    #[serde(default)]
    pub category_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseVerification {
    Verified,
    Unverified,
}

impl WarehouseVerification {
    pub fn wire_code(&self) -> &'static str {
        match self {
            WarehouseVerification::Verified => "1",
            WarehouseVerification::Unverified => "2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub id: String,
    pub title: String,
    pub price: Option<String>,
    pub image_url: Option<String>,
    pub sku: Option<String>,
    pub category_id: Option<String>,
    pub listing_count: Option<u64>,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub sku: Option<String>,
    pub name: Option<String>,
    pub price: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct FilterOutcome {
    pub item: RawItem,
    pub passed_text: bool,
    pub passed_image: Option<bool>,
    pub image: Option<ImageVerdict>,
}

impl FilterOutcome {
    pub fn text_only(item: RawItem, passed_text: bool) -> Self {
        Self {
            item,
            passed_text,
            passed_image: None,
            image: None,
        }
    }

    pub fn with_image(item: RawItem, verdict: ImageVerdict) -> Self {
        Self {
            item,
            passed_text: true,
            passed_image: Some(verdict.passed),
            image: Some(verdict),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageVerdict {
    pub passed: bool,
    pub reason: VerdictReason,
    pub labels: Vec<String>,
    pub matched: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    Matched,
    NoMatch,
    BackendUnavailable,
    FailedOpen,
    NoImage,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultSet {
    pub job_id: Uuid,
    pub keyword: String,
    pub items: Vec<FilterOutcome>,
    pub stats: JobStats,
    pub stages: Vec<StageReport>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    /// Upstream-reported total, which can exceed what was retrievable.
    pub total_found: u64,
    pub actual_fetched: u64,
    pub pages_fetched: u32,
    pub total_pages: Option<u32>,
    pub fetch_stop: Option<FetchStop>,
    pub truncated_by_ceiling: bool,
    pub text_passed: u64,
    pub image_filter_enabled: bool,
    pub image_evaluated: u64,
    pub image_not_evaluated: u64,
    pub image_passed: u64,
    pub image_failed_open: u64,
    pub batches_completed: u32,
    pub final_count: u64,
    pub text_pass_rate: f64,
    pub image_pass_rate: f64,
    pub pass_rate: f64,
    pub partial: bool,
    pub cancelled: bool,
    pub timed_out: bool,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStop {
    LastPage,
    EmptyPage,
    OffsetCeiling,
    UpstreamOffsetError,
    PageError,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Percentage of `part` in `whole`, rounded to two decimals. Zero when `whole` is zero.
pub fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    ((part as f64 / whole as f64) * 10_000.0).round() / 100.0
}
