use std::{sync::Arc, time::Duration};

use serde_json::{Value, json};
use tokio::time::{Instant, sleep_until};
use tracing::{info, warn};

use super::client::{CatalogApi, CatalogError, PageQuery};
use crate::jobs::JobSession;
use crate::models::{FetchStop, RawItem, SearchFilters};
use crate::retry::{RetryPolicy, retry};

#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub page_size: u32,
    pub max_offset: u32,
    pub page_interval: Duration,
    pub retry: RetryPolicy,
    pub job_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FetchReport {
    pub items: Vec<RawItem>,
    pub total_found: u64,
    pub pages_fetched: u32,
    pub requested_pages: Vec<u32>,
    pub reported_page_size: Option<u32>,
    pub total_pages: Option<u32>,
    pub stop: FetchStop,
    pub truncated_by_ceiling: bool,
    /// Set when pagination ended on an error rather than on a natural boundary.
    pub partial: bool,
    pub error: Option<String>,
    /// Pages whose echoed page number differed from the one requested.
    pub page_mismatches: u32,
}

impl FetchReport {
    fn empty() -> Self {
        Self {
            items: Vec::new(),
            total_found: 0,
            pages_fetched: 0,
            requested_pages: Vec::new(),
            reported_page_size: None,
            total_pages: None,
            stop: FetchStop::LastPage,
            truncated_by_ceiling: false,
            partial: false,
            error: None,
            page_mismatches: 0,
        }
    }

    pub fn summary(&self) -> Value {
        json!({
            "total_found": self.total_found,
            "fetched": self.items.len(),
            "pages_fetched": self.pages_fetched,
            "total_pages": self.total_pages,
            "reported_page_size": self.reported_page_size,
            "stop": self.stop,
            "truncated_by_ceiling": self.truncated_by_ceiling,
            "error": self.error,
            "page_mismatches": self.page_mismatches,
        })
    }
}

/// Highest page number reachable under the offset ceiling for a given page size.
pub fn max_fetchable_pages(max_offset: u32, page_size: u32) -> u32 {
    if page_size == 0 {
        return 1;
    }
    (max_offset / page_size).max(1)
}

/// Walks catalog pages one at a time, in order, never asking for the same page
/// twice and never past the offset ceiling.
pub struct PaginatedFetcher {
    catalog: Arc<dyn CatalogApi>,
    settings: FetchSettings,
}

impl PaginatedFetcher {
    pub fn new(catalog: Arc<dyn CatalogApi>, settings: FetchSettings) -> Self {
        Self { catalog, settings }
    }

    /// Fetches until the catalog runs out, the ceiling is reached, or the job is
    /// stopped. Only a failure on the first page is an error; later failures
    /// keep what was already retrieved.
    pub async fn fetch(
        &self,
        keyword: &str,
        filters: &SearchFilters,
        session: &JobSession,
    ) -> Result<FetchReport, CatalogError> {
        let mut report = FetchReport::empty();
        let mut page_size = self.settings.page_size.max(1);
        let mut last_page = max_fetchable_pages(self.settings.max_offset, page_size);
        let mut page: u32 = 1;
        let mut last_request: Option<Instant> = None;

        report.stop = loop {
            if let Some(stop) = self.checkpoint(session) {
                break stop;
            }
            if let Some(previous) = last_request {
                if !self.pace(previous, session).await {
                    break FetchStop::Cancelled;
                }
                // The wait may have used up the rest of the budget.
                if let Some(stop) = self.checkpoint(session) {
                    break stop;
                }
            }

            last_request = Some(Instant::now());
            report.requested_pages.push(page);
            let query = PageQuery {
                keyword,
                page,
                page_size,
                filters,
            };
            let query = &query;
            let catalog = &self.catalog;
            let outcome = retry(self.settings.retry, "catalog_page", move |_| {
                catalog.search_page(query)
            })
            .await;

            let result = match outcome.result {
                Ok(result) => result,
                Err(CatalogError::OffsetTooLarge(message)) => {
                    warn!(
                        target = "discovery.catalog",
                        job_id = %session.id(),
                        page,
                        detail = %message,
                        "offset_ceiling_reported"
                    );
                    report.partial = true;
                    report.truncated_by_ceiling = true;
                    report.error = Some(message);
                    break FetchStop::UpstreamOffsetError;
                }
                Err(err) if page == 1 => return Err(err),
                Err(err) => {
                    warn!(
                        target = "discovery.catalog",
                        job_id = %session.id(),
                        page,
                        attempts = outcome.attempts,
                        error = %err,
                        "page_failed_keeping_partial"
                    );
                    report.partial = true;
                    report.error = Some(err.to_string());
                    break FetchStop::PageError;
                }
            };

            if result.page != page {
                warn!(
                    target = "discovery.catalog",
                    job_id = %session.id(),
                    requested = page,
                    echoed = result.page,
                    "page_number_mismatch"
                );
                report.page_mismatches += 1;
            }

            if page == 1 {
                // From here on paging follows the catalog's page size, not ours.
                if result.page_size > 0 {
                    page_size = result.page_size;
                }
                last_page = max_fetchable_pages(self.settings.max_offset, page_size);
                let upstream_pages = result.total.div_ceil(page_size as u64);
                let upstream_pages = u32::try_from(upstream_pages).unwrap_or(u32::MAX);
                report.total_found = result.total;
                report.reported_page_size = Some(page_size);
                report.truncated_by_ceiling = upstream_pages > last_page;
                report.total_pages = Some(upstream_pages.min(last_page));
            }

            if result.items.is_empty() {
                break FetchStop::EmptyPage;
            }

            session.record_page(result.items.len());
            report.pages_fetched += 1;
            report.items.extend(result.items);
            info!(
                target = "discovery.catalog",
                job_id = %session.id(),
                page,
                fetched = report.items.len(),
                "page_fetched"
            );

            let total_pages = report.total_pages.unwrap_or(1);
            if page >= total_pages {
                break if report.truncated_by_ceiling && page >= last_page {
                    FetchStop::OffsetCeiling
                } else {
                    FetchStop::LastPage
                };
            }
            page += 1;
        };

        Ok(report)
    }

    fn checkpoint(&self, session: &JobSession) -> Option<FetchStop> {
        if session.is_cancelled() {
            return Some(FetchStop::Cancelled);
        }
        if session.elapsed() >= self.settings.job_timeout {
            return Some(FetchStop::TimedOut);
        }
        None
    }

    /// Waits out the minimum gap since the previous request. Returns `false`
    /// when the job is cancelled while waiting.
    async fn pace(&self, previous: Instant, session: &JobSession) -> bool {
        tokio::select! {
            _ = session.cancelled() => false,
            _ = sleep_until(previous + self.settings.page_interval) => true,
        }
    }
}
