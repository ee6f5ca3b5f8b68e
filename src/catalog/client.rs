use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::config::{CATALOG_ACCESS_TOKEN, PRODUCT_LIST_URL};
use crate::http::build_client;
use crate::models::{RawItem, SearchFilters, Variant};
use crate::retry::Transient;

/// Envelope codes the catalog uses for throttling.
const RATE_LIMIT_CODES: &[i64] = &[429, 1_600_200];
/// Envelope codes the catalog uses when `(pageNum - 1) * pageSize` is past its ceiling.
const OFFSET_CEILING_CODES: &[i64] = &[1_600_101];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog access token is not configured")]
    NotConfigured,
    #[error("request failed: {0}")]
    Request(String),
    #[error("catalog returned HTTP {0}")]
    Status(u16),
    #[error("requested offset is past the catalog ceiling: {0}")]
    OffsetTooLarge(String),
    #[error("catalog error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl Transient for CatalogError {
    fn is_transient(&self) -> bool {
        match self {
            CatalogError::Request(_) => true,
            CatalogError::Status(status) => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
                    || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || *status >= 500
            }
            CatalogError::Api { code, .. } => RATE_LIMIT_CODES.contains(code),
            CatalogError::NotConfigured
            | CatalogError::OffsetTooLarge(_)
            | CatalogError::InvalidResponse(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageQuery<'a> {
    pub keyword: &'a str,
    pub page: u32,
    pub page_size: u32,
    pub filters: &'a SearchFilters,
}

/// One page as the catalog reported it. `page_size` is what the catalog says
/// it used, which may differ from what was asked for.
#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub items: Vec<RawItem>,
}

#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn search_page(&self, query: &PageQuery<'_>) -> Result<CatalogPage, CatalogError>;
}

pub struct HttpCatalog {
    http: Client,
    url: String,
    token: String,
}

impl HttpCatalog {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: build_client(),
            url: url.into(),
            token: token.into(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(PRODUCT_LIST_URL.as_str(), CATALOG_ACCESS_TOKEN.as_str())
    }
}

#[async_trait]
impl CatalogApi for HttpCatalog {
    async fn search_page(&self, query: &PageQuery<'_>) -> Result<CatalogPage, CatalogError> {
        if self.token.trim().is_empty() {
            return Err(CatalogError::NotConfigured);
        }

        let response = self
            .http
            .get(&self.url)
            .header("CJ-Access-Token", &self.token)
            .query(&query_params(query))
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;

        // Error envelopes sometimes arrive with a 4xx status; read them first so
        // the offset ceiling is recognised either way.
        let envelope = serde_json::from_str::<Envelope>(&body).ok();
        if !status.is_success() {
            if let Some(envelope) = &envelope
                && let Err(err @ CatalogError::OffsetTooLarge(_)) = envelope.check()
            {
                return Err(err);
            }
            return Err(CatalogError::Status(status.as_u16()));
        }

        let envelope = envelope.ok_or_else(|| {
            CatalogError::InvalidResponse(body.chars().take(200).collect::<String>())
        })?;
        envelope.check()?;
        let data = envelope.data.unwrap_or_default();

        Ok(CatalogPage {
            page: data.page_num.unwrap_or(query.page),
            page_size: data.page_size.unwrap_or(query.page_size),
            total: data.total.unwrap_or(0),
            items: data.list.into_iter().map(RawItem::from).collect(),
        })
    }
}

fn query_params(query: &PageQuery<'_>) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("productNameEn", query.keyword.to_string()),
        ("pageNum", query.page.to_string()),
        ("pageSize", query.page_size.to_string()),
    ];
    let filters = query.filters;
    if let Some(flag) = filters.verified_warehouse {
        params.push(("verifiedWarehouse", flag.wire_code().to_string()));
    }
    if let Some(min) = filters.min_inventory {
        params.push(("startInventory", min.to_string()));
    }
    if let Some(max) = filters.max_inventory {
        params.push(("endInventory", max.to_string()));
    }
    if let Some(category) = &filters.category_id {
        params.push(("categoryId", category.clone()));
    }
    params
}

fn is_offset_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("offset") || (message.contains("page") && message.contains("exceed"))
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    result: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<WireData>,
}

impl Envelope {
    fn check(&self) -> Result<(), CatalogError> {
        if self.result || self.code == 200 {
            return Ok(());
        }
        let message = self.message.clone().unwrap_or_default();
        if OFFSET_CEILING_CODES.contains(&self.code) || is_offset_message(&message) {
            return Err(CatalogError::OffsetTooLarge(message));
        }
        Err(CatalogError::Api {
            code: self.code,
            message,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireData {
    #[serde(default)]
    page_num: Option<u32>,
    #[serde(default)]
    page_size: Option<u32>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    list: Vec<WireProduct>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireProduct {
    pid: String,
    #[serde(default, alias = "productName")]
    product_name_en: Option<String>,
    #[serde(default)]
    sell_price: Option<Value>,
    #[serde(default)]
    product_image: Option<String>,
    #[serde(default)]
    product_sku: Option<String>,
    #[serde(default)]
    category_id: Option<String>,
    #[serde(default)]
    listed_num: Option<u64>,
    #[serde(default)]
    variants: Vec<WireVariant>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireVariant {
    vid: String,
    #[serde(default)]
    variant_sku: Option<String>,
    #[serde(default)]
    variant_name_en: Option<String>,
    #[serde(default)]
    variant_sell_price: Option<Value>,
}

fn price_string(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl From<WireProduct> for RawItem {
    fn from(wire: WireProduct) -> Self {
        RawItem {
            id: wire.pid,
            title: wire.product_name_en.unwrap_or_default(),
            price: price_string(wire.sell_price),
            image_url: wire.product_image.filter(|url| !url.trim().is_empty()),
            sku: wire.product_sku,
            category_id: wire.category_id,
            listing_count: wire.listed_num,
            variants: wire
                .variants
                .into_iter()
                .map(|v| Variant {
                    id: v.vid,
                    sku: v.variant_sku,
                    name: v.variant_name_en,
                    price: price_string(v.variant_sell_price),
                })
                .collect(),
        }
    }
}
