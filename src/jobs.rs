use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};
use thiserror::Error;
use tokio::{runtime::Handle, sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Table of in-flight discovery jobs. Owned by whoever runs the pipeline and
/// handed to it, so tests and the HTTP surface can each have their own.
#[derive(Clone, Default)]
pub struct JobRegistry {
    sessions: Arc<Mutex<HashMap<Uuid, Arc<JobSession>>>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job {0} is already running")]
    AlreadyRunning(Uuid),
}

/// Keeps a job registered for as long as it is held. Dropping the lease
/// removes the session from the registry, so a job whose driving future is
/// dropped halfway (client disconnect, outer timeout) does not linger.
pub struct JobLease {
    registry: JobRegistry,
    session: Arc<JobSession>,
    finished: bool,
}

/// Shared state of one running job. Counters only go up and the cancellation
/// token only goes from live to cancelled.
#[derive(Debug)]
pub struct JobSession {
    id: Uuid,
    keyword: String,
    started_at: DateTime<Utc>,
    started: Instant,
    token: CancellationToken,
    fetched: AtomicU64,
    pages: AtomicU32,
    text_passed: AtomicU64,
    image_evaluated: AtomicU64,
    image_passed: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobProgress {
    pub id: String,
    pub keyword: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u128,
    pub cancelled: bool,
    pub pages_fetched: u32,
    pub fetched: u64,
    pub text_passed: u64,
    pub image_evaluated: u64,
    pub image_passed: u64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(&self, id: Uuid, keyword: &str) -> Result<Arc<JobSession>, JobError> {
        let mut guard = self.sessions.lock().await;
        if guard.contains_key(&id) {
            return Err(JobError::AlreadyRunning(id));
        }
        let session = Arc::new(JobSession::new(id, keyword));
        guard.insert(id, session.clone());
        info!(target = "discovery.jobs", job_id = %id, keyword, "job_started");
        Ok(session)
    }

    pub async fn enter(&self, id: Uuid, keyword: &str) -> Result<JobLease, JobError> {
        let session = self.start(id, keyword).await?;
        Ok(JobLease {
            registry: self.clone(),
            session,
            finished: false,
        })
    }

    /// Signals the job to stop at its next checkpoint. Returns whether a live
    /// job was found; unknown or finished ids are not an error.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let guard = self.sessions.lock().await;
        match guard.get(&id) {
            Some(session) => {
                session.cancel();
                info!(target = "discovery.jobs", job_id = %id, "job_cancel_requested");
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) -> usize {
        let guard = self.sessions.lock().await;
        for session in guard.values() {
            session.cancel();
        }
        if !guard.is_empty() {
            info!(target = "discovery.jobs", count = guard.len(), "all_jobs_cancel_requested");
        }
        guard.len()
    }

    pub async fn is_cancelled(&self, id: Uuid) -> bool {
        let guard = self.sessions.lock().await;
        guard.get(&id).is_some_and(|session| session.is_cancelled())
    }

    pub async fn end(&self, id: Uuid) -> Option<Arc<JobSession>> {
        let removed = self.sessions.lock().await.remove(&id);
        if let Some(session) = &removed {
            log_ended(session);
        }
        removed
    }

    /// Synchronous removal for `JobLease::drop`. Only removes the entry if it
    /// still belongs to `session`.
    fn release(&self, session: Arc<JobSession>) {
        match self.sessions.try_lock() {
            Ok(mut guard) => remove_owned(&mut guard, &session),
            Err(_) => match Handle::try_current() {
                Ok(handle) => {
                    let sessions = self.sessions.clone();
                    handle.spawn(async move {
                        remove_owned(&mut *sessions.lock().await, &session);
                    });
                }
                Err(_) => remove_owned(&mut self.sessions.blocking_lock(), &session),
            },
        }
    }

    pub async fn progress(&self, id: Uuid) -> Option<JobProgress> {
        let guard = self.sessions.lock().await;
        guard.get(&id).map(|session| session.progress())
    }

    pub async fn live(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

fn remove_owned(sessions: &mut HashMap<Uuid, Arc<JobSession>>, session: &Arc<JobSession>) {
    let id = session.id();
    if sessions.get(&id).is_some_and(|live| Arc::ptr_eq(live, session)) {
        sessions.remove(&id);
        log_ended(session);
    }
}

fn log_ended(session: &JobSession) {
    info!(
        target = "discovery.jobs",
        job_id = %session.id(),
        elapsed_ms = session.elapsed().as_millis() as u64,
        cancelled = session.is_cancelled(),
        "job_ended"
    );
}

impl JobLease {
    pub fn session(&self) -> &JobSession {
        &self.session
    }

    /// Ends the job normally.
    pub async fn finish(mut self) {
        self.registry.end(self.session.id()).await;
        self.finished = true;
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Nothing is driving the job any more; stop anything still holding
        // the session.
        self.session.cancel();
        warn!(target = "discovery.jobs", job_id = %self.session.id(), "job_abandoned");
        self.registry.release(self.session.clone());
    }
}

impl JobSession {
    pub fn new(id: Uuid, keyword: &str) -> Self {
        Self {
            id,
            keyword: keyword.to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
            token: CancellationToken::new(),
            fetched: AtomicU64::new(0),
            pages: AtomicU32::new(0),
            text_passed: AtomicU64::new(0),
            image_evaluated: AtomicU64::new(0),
            image_passed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the job has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn record_page(&self, items: usize) {
        self.pages.fetch_add(1, Ordering::Relaxed);
        self.fetched.fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn record_text_passed(&self, count: usize) {
        self.text_passed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_image_evaluated(&self, count: usize) {
        self.image_evaluated.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_image_passed(&self, count: usize) {
        self.image_passed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn progress(&self) -> JobProgress {
        JobProgress {
            id: self.id.to_string(),
            keyword: self.keyword.clone(),
            started_at: self.started_at,
            elapsed_ms: self.elapsed().as_millis(),
            cancelled: self.is_cancelled(),
            pages_fetched: self.pages.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            text_passed: self.text_passed.load(Ordering::Relaxed),
            image_evaluated: self.image_evaluated.load(Ordering::Relaxed),
            image_passed: self.image_passed.load(Ordering::Relaxed),
        }
    }
}
