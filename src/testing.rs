//! In-process stand-ins for the catalog and the vision backend.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::catalog::client::{CatalogApi, CatalogError, CatalogPage, PageQuery};
use crate::jobs::JobSession;
use crate::models::RawItem;
use crate::relevance::{ImageSource, LabelDetector};
use crate::vision::VisionError;

#[derive(Debug, Clone)]
pub enum PageScript {
    Empty,
    Fail,
    OffsetTooLarge,
    /// Fail with a throttling status this many times, then serve the page.
    Throttle(u32),
    /// Serve the page but report this page number.
    Echo(u32),
}

/// A catalog of `total` products served `page_size` at a time. Product `n`
/// has id `P{n}`; titles come from `titles` round-robin.
pub struct FakeCatalog {
    total: u64,
    page_size: u32,
    titles: Vec<String>,
    scripts: HashMap<u32, PageScript>,
    cancel_after: Option<(u32, Arc<JobSession>)>,
    calls: Mutex<Vec<u32>>,
}

impl FakeCatalog {
    pub fn new(total: u64, page_size: u32) -> Self {
        Self {
            total,
            page_size,
            titles: vec!["Sherpa Fleece Throw Blanket Queen".into()],
            scripts: HashMap::new(),
            cancel_after: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn titles(mut self, titles: &[&str]) -> Self {
        self.titles = titles.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn script(mut self, page: u32, script: PageScript) -> Self {
        self.scripts.insert(page, script);
        self
    }

    /// Cancels `session` right after serving `page`.
    pub fn cancel_after(mut self, page: u32, session: Arc<JobSession>) -> Self {
        self.cancel_after = Some((page, session));
        self
    }

    /// Page numbers in call order, retries included.
    pub fn requested_pages(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, page: u32) -> usize {
        self.calls.lock().unwrap().iter().filter(|p| **p == page).count()
    }

    fn item(&self, n: u64) -> RawItem {
        let title = &self.titles[(n as usize) % self.titles.len()];
        RawItem {
            id: format!("P{n}"),
            title: title.clone(),
            price: Some("9.99".into()),
            image_url: Some(format!("https://img.example/{n}.jpg")),
            sku: Some(format!("SKU{n}")),
            category_id: None,
            listing_count: Some(0),
            variants: Vec::new(),
        }
    }
}

#[async_trait]
impl CatalogApi for FakeCatalog {
    async fn search_page(&self, query: &PageQuery<'_>) -> Result<CatalogPage, CatalogError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(query.page);
            calls.iter().filter(|p| **p == query.page).count() as u32
        };

        match self.scripts.get(&query.page) {
            Some(PageScript::Fail) => {
                return Err(CatalogError::Api {
                    code: 1_600_001,
                    message: "internal catalog failure".into(),
                });
            }
            Some(PageScript::OffsetTooLarge) => {
                return Err(CatalogError::OffsetTooLarge("offset exceeds 6000".into()));
            }
            Some(PageScript::Throttle(times)) if attempt <= *times => {
                return Err(CatalogError::Status(429));
            }
            Some(PageScript::Empty) => {
                return Ok(CatalogPage {
                    page: query.page,
                    page_size: self.page_size,
                    total: self.total,
                    items: Vec::new(),
                });
            }
            _ => {}
        }

        let start = (query.page as u64 - 1) * self.page_size as u64;
        let end = (start + self.page_size as u64).min(self.total);
        let items = (start..end.max(start)).map(|n| self.item(n)).collect();

        if let Some((page, session)) = &self.cancel_after
            && *page == query.page
        {
            session.cancel();
        }

        let page = match self.scripts.get(&query.page) {
            Some(PageScript::Echo(echoed)) => *echoed,
            _ => query.page,
        };
        Ok(CatalogPage {
            page,
            page_size: self.page_size,
            total: self.total,
            items,
        })
    }
}

pub struct FakeImages {
    broken: bool,
    calls: AtomicU32,
}

impl FakeImages {
    pub fn ok() -> Self {
        Self {
            broken: false,
            calls: AtomicU32::new(0),
        }
    }

    /// Every URL is rejected as malformed.
    pub fn broken() -> Self {
        Self {
            broken: true,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageSource for FakeImages {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(VisionError::InvalidUrl(url.to_string()));
        }
        Ok(url.as_bytes().to_vec())
    }
}

enum LabelMode {
    Always(Vec<String>),
    Unreachable,
    Flaky { failures: u32, labels: Vec<String> },
    /// Labels chosen by the image URL; unknown URLs get no labels.
    ByUrl(HashMap<String, Vec<String>>),
}

pub struct FakeLabels {
    mode: LabelMode,
    delay: Duration,
    slow: Option<(String, Duration)>,
    calls: AtomicU32,
}

impl FakeLabels {
    fn with_mode(mode: LabelMode) -> Self {
        Self {
            mode,
            delay: Duration::ZERO,
            slow: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn always(labels: &[&str]) -> Self {
        Self::with_mode(LabelMode::Always(to_strings(labels)))
    }

    pub fn unreachable() -> Self {
        Self::with_mode(LabelMode::Unreachable)
    }

    pub fn flaky(failures: u32, labels: &[&str]) -> Self {
        Self::with_mode(LabelMode::Flaky {
            failures,
            labels: to_strings(labels),
        })
    }

    pub fn by_url(entries: &[(&str, &[&str])]) -> Self {
        Self::with_mode(LabelMode::ByUrl(
            entries
                .iter()
                .map(|(url, labels)| (url.to_string(), to_strings(labels)))
                .collect(),
        ))
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Delays only the image fetched from `url`.
    pub fn delayed_for(mut self, url: &str, delay: Duration) -> Self {
        self.slow = Some((url.to_string(), delay));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LabelDetector for FakeLabels {
    async fn detect_labels(&self, image: &[u8]) -> Result<Vec<String>, VisionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some((url, delay)) = &self.slow
            && image == url.as_bytes()
        {
            tokio::time::sleep(*delay).await;
        }
        match &self.mode {
            LabelMode::Always(labels) => Ok(labels.clone()),
            LabelMode::Unreachable => Err(VisionError::Request("connection refused".into())),
            LabelMode::Flaky { failures, labels } => {
                if call <= *failures {
                    Err(VisionError::Status {
                        context: "label detection",
                        status: 503,
                    })
                } else {
                    Ok(labels.clone())
                }
            }
            LabelMode::ByUrl(map) => {
                // FakeImages hands back the URL bytes as the image.
                let url = String::from_utf8_lossy(image).to_string();
                Ok(map.get(&url).cloned().unwrap_or_default())
            }
        }
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}
