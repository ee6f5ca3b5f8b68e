use std::time::Duration;

use futures::future::join_all;
use serde_json::{Value, json};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::jobs::JobSession;
use crate::models::{FilterOutcome, RawItem, VerdictReason};
use crate::relevance::ImageClassifier;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub width: usize,
    pub cooldown: Duration,
    pub max_items: usize,
    pub job_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub passed: Vec<FilterOutcome>,
    pub evaluated: u64,
    pub not_evaluated: u64,
    pub capped: u64,
    pub failed_open: u64,
    pub batches_completed: u32,
    pub cancelled: bool,
    pub timed_out: bool,
}

impl BatchReport {
    pub fn summary(&self) -> Value {
        json!({
            "evaluated": self.evaluated,
            "passed": self.passed.len(),
            "not_evaluated": self.not_evaluated,
            "capped": self.capped,
            "failed_open": self.failed_open,
            "batches_completed": self.batches_completed,
            "cancelled": self.cancelled,
            "timed_out": self.timed_out,
        })
    }
}

enum Checkpoint {
    Continue,
    Cancelled,
    TimedOut,
}

/// Runs the image classifier over text survivors a fixed-size group at a time.
///
/// Groups run one after another; members of a group run concurrently. A group
/// either lands in the report whole or not at all.
pub struct BatchScheduler {
    classifier: ImageClassifier,
    settings: SchedulerSettings,
}

impl BatchScheduler {
    pub fn new(classifier: ImageClassifier, settings: SchedulerSettings) -> Self {
        Self {
            classifier,
            settings,
        }
    }

    pub async fn run(&self, items: Vec<RawItem>, keyword: &str, session: &JobSession) -> BatchReport {
        let mut report = BatchReport::default();
        let total = items.len() as u64;
        let mut items = items;
        if items.len() > self.settings.max_items {
            report.capped = (items.len() - self.settings.max_items) as u64;
            warn!(
                target = "discovery.scheduler",
                job_id = %session.id(),
                cap = self.settings.max_items,
                dropped = report.capped,
                "image_stage_capped"
            );
            items.truncate(self.settings.max_items);
        }

        let width = self.settings.width.max(1);
        for (index, group) in items.chunks(width).enumerate() {
            // Pass-through verdicts never touch the backend, so there is nothing to pace.
            if index > 0 && self.classifier.backend_configured() {
                self.cooldown(session).await;
            }
            match self.checkpoint(session) {
                Checkpoint::Continue => {}
                Checkpoint::Cancelled => {
                    report.cancelled = true;
                    break;
                }
                Checkpoint::TimedOut => {
                    report.timed_out = true;
                    break;
                }
            }

            let remaining = self.settings.job_timeout.saturating_sub(session.elapsed());
            let verdicts = join_all(
                group
                    .iter()
                    .map(|item| self.classifier.classify(item.image_url.as_deref(), keyword)),
            );

            let Ok(verdicts) = timeout(remaining, verdicts).await else {
                warn!(
                    target = "discovery.scheduler",
                    job_id = %session.id(),
                    batch = index,
                    "batch_discarded_on_timeout"
                );
                report.timed_out = true;
                break;
            };

            let mut passed_in_group = 0;
            for (item, verdict) in group.iter().zip(verdicts) {
                report.evaluated += 1;
                if verdict.reason == VerdictReason::FailedOpen {
                    report.failed_open += 1;
                }
                if verdict.passed {
                    passed_in_group += 1;
                    report.passed.push(FilterOutcome::with_image(item.clone(), verdict));
                }
            }
            session.record_image_evaluated(group.len());
            session.record_image_passed(passed_in_group);
            report.batches_completed += 1;
            info!(
                target = "discovery.scheduler",
                job_id = %session.id(),
                batch = index,
                size = group.len(),
                passed = passed_in_group,
                "batch_completed"
            );
        }

        report.not_evaluated = total - report.evaluated;
        report
    }

    fn checkpoint(&self, session: &JobSession) -> Checkpoint {
        if session.is_cancelled() {
            Checkpoint::Cancelled
        } else if session.elapsed() >= self.settings.job_timeout {
            Checkpoint::TimedOut
        } else {
            Checkpoint::Continue
        }
    }

    /// Pause between groups to stay under the backend's rate limit. Cut short
    /// by cancellation.
    async fn cooldown(&self, session: &JobSession) {
        tokio::select! {
            _ = session.cancelled() => {}
            _ = sleep(self.settings.cooldown) => {}
        }
    }
}
