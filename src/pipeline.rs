use crate::catalog::{CatalogApi, CatalogError, FetchReport, FetchSettings, HttpCatalog, PaginatedFetcher};
use crate::config::DiscoveryConfig;
use crate::jobs::{JobRegistry, JobSession};
use crate::models::{
    FetchStop, FilterOutcome, JobStats, RawItem, ResultSet, SearchFilters, SearchRequest,
    StageReport, percent,
};
use crate::relevance::{ImageClassifier, LabelDetector, TextMode, relevant};
use crate::scheduler::{BatchReport, BatchScheduler, SchedulerSettings};
use crate::vision::{HttpImageSource, VisionClient};
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_KEYWORD_CHARS: usize = 200;
const MAX_CATEGORY_ID_CHARS: usize = 64;

/// One discovery job end to end: fetch, text filter, image filter, stats.
///
/// The registry is injected so that whoever owns the pipeline can also reach
/// running jobs to cancel or inspect them.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<DiscoveryConfig>,
    catalog: Arc<dyn CatalogApi>,
    classifier: ImageClassifier,
    registry: JobRegistry,
}

/// A request that passed validation, with defaults filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPlan {
    pub id: Uuid,
    pub keyword: String,
    pub filters: SearchFilters,
    pub page_size: u32,
    pub image_filter: bool,
    pub text_mode: TextMode,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("keyword must not be empty")]
    EmptyKeyword,
    #[error("keyword must be at most {0} characters")]
    KeywordTooLong(usize),
    #[error("page_size must be between 1 and {0}")]
    PageSize(u32),
    #[error("min_inventory ({min}) is greater than max_inventory ({max})")]
    InventoryRange { min: u32, max: u32 },
    #[error("category_id must be 1-64 letters, digits, '-' or '_'")]
    CategoryId,
}

impl Pipeline {
    pub fn new(
        config: DiscoveryConfig,
        catalog: Arc<dyn CatalogApi>,
        classifier: ImageClassifier,
        registry: JobRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            catalog,
            classifier,
            registry,
        }
    }

    pub fn from_env(registry: JobRegistry) -> Self {
        let config = DiscoveryConfig::from_env();
        let detector = VisionClient::from_env().map(|client| Arc::new(client) as Arc<dyn LabelDetector>);
        if detector.is_none() {
            warn!(
                target = "discovery.pipeline",
                "VISION_API_KEY is not set; image filtering will pass every item"
            );
        }
        let classifier = ImageClassifier::new(
            Arc::new(HttpImageSource::new(
                config.image_download_timeout,
                config.max_image_bytes,
            )),
            detector,
            config.retry,
        );
        Self::new(config, Arc::new(HttpCatalog::from_env()), classifier, registry)
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn validate(&self, request: &SearchRequest) -> Result<JobPlan, RequestError> {
        let keyword = request.keyword.trim();
        if keyword.is_empty() {
            return Err(RequestError::EmptyKeyword);
        }
        if keyword.chars().count() > MAX_KEYWORD_CHARS {
            return Err(RequestError::KeywordTooLong(MAX_KEYWORD_CHARS));
        }

        let page_size = request.page_size.unwrap_or(self.config.default_page_size);
        if page_size == 0 || page_size > self.config.max_page_size {
            return Err(RequestError::PageSize(self.config.max_page_size));
        }

        let filters = &request.filters;
        if let (Some(min), Some(max)) = (filters.min_inventory, filters.max_inventory)
            && min > max
        {
            return Err(RequestError::InventoryRange { min, max });
        }
        if let Some(category) = &filters.category_id
            && !valid_category_id(category)
        {
            return Err(RequestError::CategoryId);
        }

        Ok(JobPlan {
            id: request.job_id.unwrap_or_else(Uuid::new_v4),
            keyword: keyword.to_string(),
            filters: filters.clone(),
            page_size,
            image_filter: request.image_filter,
            text_mode: request.text_mode.unwrap_or(self.config.text_mode),
        })
    }

    /// Runs one job. The session is registered for the duration of the call
    /// and removed however it ends, including when this future is dropped.
    pub async fn run(&self, request: SearchRequest) -> Result<ResultSet, PipelineError> {
        let plan = self
            .validate(&request)
            .map_err(|err| PipelineError::invalid_input("validate", err.to_string()))?;
        let lease = self
            .registry
            .enter(plan.id, &plan.keyword)
            .await
            .map_err(|err| PipelineError::conflict("register", err.to_string()))?;

        info!(
            target = "discovery.pipeline",
            job_id = %plan.id,
            keyword = %plan.keyword,
            page_size = plan.page_size,
            image_filter = plan.image_filter,
            text_mode = ?plan.text_mode,
            "pipeline_started"
        );
        let result = self.execute(&plan, lease.session()).await;
        // A cancel that lands after the last checkpoint is not in the stats.
        let cancel_requested = self.registry.is_cancelled(plan.id).await;
        lease.finish().await;

        match &result {
            Ok(set) => info!(
                target = "discovery.pipeline",
                job_id = %plan.id,
                final_count = set.stats.final_count,
                partial = set.stats.partial,
                cancelled = set.stats.cancelled,
                cancel_requested,
                timed_out = set.stats.timed_out,
                elapsed_ms = set.stats.elapsed_ms as u64,
                "pipeline_finished"
            ),
            Err(err) => warn!(
                target = "discovery.pipeline",
                job_id = %plan.id,
                stage = err.stage(),
                cancel_requested,
                error = %err,
                "pipeline_failed"
            ),
        }
        result
    }

    async fn execute(&self, plan: &JobPlan, session: &JobSession) -> Result<ResultSet, PipelineError> {
        let mut stages = Vec::new();

        let fetched = self
            .capture_stage("fetch", &mut stages, async {
                let fetcher = PaginatedFetcher::new(
                    self.catalog.clone(),
                    FetchSettings {
                        page_size: plan.page_size,
                        max_offset: self.config.max_offset,
                        page_interval: self.config.page_interval,
                        retry: self.config.retry,
                        job_timeout: self.config.job_timeout,
                    },
                );
                let report = match fetcher.fetch(&plan.keyword, &plan.filters, session).await {
                    Ok(report) => report,
                    Err(err) => return Err(fetch_error(err)),
                };
                let output = report.summary();
                Ok(StageOutcome::new(report, output))
            })
            .await?;

        let survivors = self
            .capture_stage("text_filter", &mut stages, async {
                let survivors: Vec<RawItem> = fetched
                    .items
                    .iter()
                    .filter(|item| relevant(&item.title, &plan.keyword, plan.text_mode))
                    .cloned()
                    .collect();
                session.record_text_passed(survivors.len());
                let output = json!({
                    "mode": plan.text_mode,
                    "input": fetched.items.len(),
                    "passed": survivors.len(),
                });
                Ok(StageOutcome::new(survivors, output))
            })
            .await?;

        let images = self
            .capture_stage("image_filter", &mut stages, async {
                if !plan.image_filter {
                    return Ok(StageOutcome::new(None, json!({ "enabled": false })));
                }
                let scheduler = BatchScheduler::new(
                    self.classifier.clone(),
                    SchedulerSettings {
                        width: self.config.batch_width,
                        cooldown: self.config.batch_cooldown,
                        max_items: self.config.max_image_items,
                        job_timeout: self.config.job_timeout,
                    },
                );
                let report = scheduler.run(survivors.clone(), &plan.keyword, session).await;
                let mut output = report.summary();
                output["enabled"] = Value::Bool(true);
                output["backend_configured"] = Value::Bool(self.classifier.backend_configured());
                Ok(StageOutcome::new(Some(report), output))
            })
            .await?;

        let stats = assemble_stats(&fetched, survivors.len(), images.as_ref(), session);
        let items = match images {
            Some(report) => report.passed,
            None => survivors
                .into_iter()
                .map(|item| FilterOutcome::text_only(item, true))
                .collect(),
        };
        crate::metrics::items_counted("final", items.len());

        Ok(ResultSet {
            job_id: plan.id,
            keyword: plan.keyword.clone(),
            items,
            stats,
            stages,
        })
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

fn assemble_stats(
    fetched: &FetchReport,
    text_passed: usize,
    images: Option<&BatchReport>,
    session: &JobSession,
) -> JobStats {
    let actual_fetched = fetched.items.len() as u64;
    let text_passed = text_passed as u64;
    let fetch_cancelled = fetched.stop == FetchStop::Cancelled;
    let fetch_timed_out = fetched.stop == FetchStop::TimedOut;

    let mut stats = JobStats {
        total_found: fetched.total_found,
        actual_fetched,
        pages_fetched: fetched.pages_fetched,
        total_pages: fetched.total_pages,
        fetch_stop: Some(fetched.stop),
        truncated_by_ceiling: fetched.truncated_by_ceiling,
        text_passed,
        text_pass_rate: percent(text_passed, actual_fetched),
        cancelled: fetch_cancelled,
        timed_out: fetch_timed_out,
        partial: fetched.partial || fetch_cancelled || fetch_timed_out,
        final_count: text_passed,
        ..JobStats::default()
    };

    if let Some(report) = images {
        let image_passed = report.passed.len() as u64;
        stats.image_filter_enabled = true;
        stats.image_evaluated = report.evaluated;
        stats.image_not_evaluated = report.not_evaluated;
        stats.image_passed = image_passed;
        stats.image_failed_open = report.failed_open;
        stats.batches_completed = report.batches_completed;
        stats.image_pass_rate = percent(image_passed, report.evaluated);
        stats.final_count = image_passed;
        stats.cancelled |= report.cancelled;
        stats.timed_out |= report.timed_out;
        stats.partial |= report.cancelled || report.timed_out || report.not_evaluated > 0;
    }

    stats.pass_rate = percent(stats.final_count, actual_fetched);
    stats.elapsed_ms = session.elapsed().as_millis();
    stats
}

fn fetch_error(err: CatalogError) -> PipelineError {
    match err {
        CatalogError::NotConfigured => PipelineError::internal("fetch", err.to_string()),
        other => PipelineError::upstream("fetch", other.to_string()),
    }
}

fn valid_category_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_CATEGORY_ID_CHARS
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Conflict,
    Upstream,
    Internal,
}

impl PipelineError {
    fn with_kind(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn conflict(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Conflict)
    }

    pub fn upstream(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Upstream)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Internal)
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{VerdictReason, WarehouseVerification};
    use crate::retry::RetryPolicy;
    use crate::testing::{FakeCatalog, FakeImages, FakeLabels, PageScript};
    use std::time::Duration;

    fn config() -> DiscoveryConfig {
        DiscoveryConfig {
            page_interval: Duration::from_millis(1),
            batch_cooldown: Duration::from_millis(1),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
            ..DiscoveryConfig::default()
        }
    }

    fn pipeline_with(config: DiscoveryConfig, catalog: FakeCatalog, labels: Option<FakeLabels>) -> Pipeline {
        let classifier = ImageClassifier::new(
            Arc::new(FakeImages::ok()),
            labels.map(|labels| Arc::new(labels) as Arc<dyn LabelDetector>),
            config.retry,
        );
        Pipeline::new(config, Arc::new(catalog), classifier, JobRegistry::new())
    }

    fn assert_counts_nest(stats: &JobStats) {
        assert!(stats.image_passed <= stats.text_passed);
        assert!(stats.text_passed <= stats.actual_fetched);
        assert!(stats.final_count <= stats.actual_fetched);
    }

    #[test]
    fn validation_rules() {
        let pipeline = pipeline_with(config(), FakeCatalog::new(0, 100), None);

        let plan = pipeline
            .validate(&SearchRequest::new("  sherpa blanket "))
            .expect("valid");
        assert_eq!(plan.keyword, "sherpa blanket");
        assert_eq!(plan.page_size, 100);
        assert_eq!(plan.text_mode, TextMode::Relaxed);

        assert_eq!(
            pipeline.validate(&SearchRequest::new("   ")),
            Err(RequestError::EmptyKeyword)
        );
        assert_eq!(
            pipeline.validate(&SearchRequest::new("x".repeat(201))),
            Err(RequestError::KeywordTooLong(200))
        );

        let mut request = SearchRequest::new("blanket");
        request.page_size = Some(201);
        assert_eq!(pipeline.validate(&request), Err(RequestError::PageSize(200)));
        request.page_size = Some(0);
        assert_eq!(pipeline.validate(&request), Err(RequestError::PageSize(200)));

        let mut request = SearchRequest::new("blanket");
        request.filters.min_inventory = Some(10);
        request.filters.max_inventory = Some(5);
        assert_eq!(
            pipeline.validate(&request),
            Err(RequestError::InventoryRange { min: 10, max: 5 })
        );

        let mut request = SearchRequest::new("blanket");
        request.filters.category_id = Some("bad id!".into());
        assert_eq!(pipeline.validate(&request), Err(RequestError::CategoryId));
        request.filters.category_id = Some("2A8F-11_x".into());
        request.filters.verified_warehouse = Some(WarehouseVerification::Verified);
        request.text_mode = Some(TextMode::Strict);
        let plan = pipeline.validate(&request).expect("valid");
        assert_eq!(plan.text_mode, TextMode::Strict);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_before_registration() {
        let pipeline = pipeline_with(config(), FakeCatalog::new(10, 10), None);
        let err = pipeline
            .run(SearchRequest::new(""))
            .await
            .expect_err("invalid");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(err.stage(), "validate");
        assert_eq!(pipeline.registry().live().await, 0);
    }

    #[tokio::test]
    async fn ceiling_limits_a_large_catalog() {
        let pipeline = pipeline_with(
            DiscoveryConfig {
                default_page_size: 200,
                ..config()
            },
            FakeCatalog::new(50_000, 200),
            None,
        );
        let mut request = SearchRequest::new("sherpa blanket");
        request.image_filter = false;
        let result = pipeline.run(request).await.expect("run");

        let stats = &result.stats;
        assert_eq!(stats.total_found, 50_000);
        assert_eq!(stats.actual_fetched, 6000);
        assert_eq!(stats.pages_fetched, 30);
        assert!(stats.truncated_by_ceiling);
        assert_eq!(stats.fetch_stop, Some(FetchStop::OffsetCeiling));
        assert_eq!(stats.final_count, 6000);
        assert_eq!(stats.pass_rate, 100.0);
        assert!(!stats.image_filter_enabled);
        assert!(result.items.iter().all(|o| o.passed_image.is_none()));
    }

    #[tokio::test]
    async fn stage_transcript_in_order() {
        let pipeline = pipeline_with(
            config(),
            FakeCatalog::new(5, 100),
            Some(FakeLabels::always(&["Blanket"])),
        );
        let result = pipeline
            .run(SearchRequest::new("sherpa blanket"))
            .await
            .expect("run");
        let names: Vec<&str> = result.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["fetch", "text_filter", "image_filter"]);
        assert_eq!(result.stages[2].output["enabled"], json!(true));
    }

    #[tokio::test]
    async fn text_then_image_filtering() {
        let catalog = FakeCatalog::new(6, 100).titles(&[
            "Sherpa Fleece Throw Blanket Queen",
            "Pet Cooling Mat",
            "Sherpa Lined Hoodie",
        ]);
        // Titles repeat every three items: P0/P3 blankets, P1/P4 mats, P2/P5 hoodies.
        let labels = FakeLabels::by_url(&[
            ("https://img.example/0.jpg", &["Blanket"]),
            ("https://img.example/2.jpg", &["Sleeve", "Outerwear"]),
            ("https://img.example/3.jpg", &["Fleece"]),
            ("https://img.example/5.jpg", &["Sherpa jacket"]),
        ]);
        let pipeline = pipeline_with(config(), catalog, Some(labels));
        let result = pipeline
            .run(SearchRequest::new("sherpa blanket"))
            .await
            .expect("run");

        let ids: Vec<&str> = result.items.iter().map(|o| o.item.id.as_str()).collect();
        assert_eq!(ids, vec!["P0", "P3", "P5"]);
        let stats = &result.stats;
        assert_eq!(stats.actual_fetched, 6);
        assert_eq!(stats.text_passed, 4);
        assert_eq!(stats.image_evaluated, 4);
        assert_eq!(stats.image_passed, 3);
        assert_eq!(stats.final_count, 3);
        assert_eq!(stats.pass_rate, 50.0);
        assert_eq!(stats.image_pass_rate, 75.0);
        assert!(!stats.partial);
        assert_counts_nest(stats);
    }

    #[tokio::test]
    async fn unreachable_backend_keeps_every_text_survivor() {
        let catalog = FakeCatalog::new(12, 100)
            .titles(&["Sherpa Fleece Throw Blanket Queen", "Pet Cooling Mat"]);
        let pipeline = pipeline_with(config(), catalog, Some(FakeLabels::unreachable()));
        let result = pipeline
            .run(SearchRequest::new("sherpa blanket"))
            .await
            .expect("run");

        let stats = &result.stats;
        assert_eq!(stats.text_passed, 6);
        assert_eq!(stats.final_count, stats.text_passed);
        assert_eq!(stats.image_failed_open, 6);
        assert!(
            result
                .items
                .iter()
                .all(|o| o.image.as_ref().map(|v| v.reason) == Some(VerdictReason::FailedOpen))
        );
        assert_counts_nest(stats);
    }

    #[tokio::test]
    async fn first_page_failure_fails_the_job() {
        let catalog = FakeCatalog::new(500, 100).script(1, PageScript::Fail);
        let pipeline = pipeline_with(config(), catalog, None);
        let err = pipeline
            .run(SearchRequest::new("sherpa blanket"))
            .await
            .expect_err("fatal");
        assert_eq!(err.kind(), PipelineErrorKind::Upstream);
        assert_eq!(err.stage(), "fetch");
        assert_eq!(pipeline.registry().live().await, 0);
    }

    #[tokio::test]
    async fn later_page_failure_degrades_to_partial() {
        let catalog = FakeCatalog::new(500, 100).script(3, PageScript::Fail);
        let pipeline = pipeline_with(config(), catalog, Some(FakeLabels::always(&["Blanket"])));
        let result = pipeline
            .run(SearchRequest::new("sherpa blanket"))
            .await
            .expect("partial result");
        assert!(result.stats.partial);
        assert_eq!(result.stats.fetch_stop, Some(FetchStop::PageError));
        assert_eq!(result.stats.actual_fetched, 200);
        assert_eq!(result.stats.final_count, 200);
    }

    #[tokio::test]
    async fn duplicate_live_job_id_conflicts() {
        let pipeline = pipeline_with(config(), FakeCatalog::new(5, 100), None);
        let id = Uuid::new_v4();
        pipeline
            .registry()
            .start(id, "sherpa blanket")
            .await
            .expect("first");

        let mut request = SearchRequest::new("sherpa blanket");
        request.job_id = Some(id);
        let err = pipeline.run(request).await.expect_err("conflict");
        assert_eq!(err.kind(), PipelineErrorKind::Conflict);
        // the pre-existing session is left alone
        assert_eq!(pipeline.registry().live().await, 1);
    }

    #[tokio::test]
    async fn cancelling_a_running_job_returns_partial_counts() {
        let pipeline = pipeline_with(
            DiscoveryConfig {
                page_interval: Duration::from_millis(100),
                ..config()
            },
            FakeCatalog::new(2000, 100),
            Some(FakeLabels::always(&["Blanket"])),
        );
        let id = Uuid::new_v4();
        let mut request = SearchRequest::new("sherpa blanket");
        request.job_id = Some(id);

        let handle = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.run(request).await }
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(pipeline.registry().cancel(id).await);

        let result = handle.await.expect("join").expect("run");
        let stats = &result.stats;
        assert!(stats.cancelled);
        assert!(stats.partial);
        assert_eq!(stats.fetch_stop, Some(FetchStop::Cancelled));
        assert!(stats.pages_fetched >= 1 && stats.pages_fetched < 20);
        assert_eq!(stats.image_evaluated, 0);
        assert_eq!(stats.final_count, 0);
        assert_counts_nest(stats);
        assert_eq!(pipeline.registry().live().await, 0);
        assert!(!pipeline.registry().cancel(id).await);
    }

    #[tokio::test]
    async fn dropped_run_releases_its_session() {
        let pipeline = pipeline_with(
            DiscoveryConfig {
                page_interval: Duration::from_millis(200),
                ..config()
            },
            FakeCatalog::new(2000, 100),
            Some(FakeLabels::always(&["Blanket"])),
        );
        let id = Uuid::new_v4();
        let request = || {
            let mut request = SearchRequest::new("sherpa blanket");
            request.job_id = Some(id);
            request
        };

        let outcome = tokio::time::timeout(Duration::from_millis(50), pipeline.run(request())).await;
        assert!(outcome.is_err(), "run should still be paging");
        assert_eq!(pipeline.registry().live().await, 0);

        // the id can be reused straight away
        let outcome = tokio::time::timeout(Duration::from_millis(50), pipeline.run(request())).await;
        assert!(outcome.is_err(), "second run should be paging, not rejected");
        assert_eq!(pipeline.registry().live().await, 0);
    }
}
