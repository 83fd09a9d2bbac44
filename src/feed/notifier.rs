use super::{ActivityStore, FeedEntry, JobError};
use crate::joblock::{JobLockService, LockStatus};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delivery channel for feed digests. Email and templating live behind it.
#[async_trait]
pub trait UserNotifier: Send + Sync {
    async fn notify(&self, user: &str, entries: &[FeedEntry]) -> Result<(), JobError>;
}

/// Id of the newest feed entry a user has already been notified about.
/// Entries above it go into the next digest.
#[async_trait]
pub trait FeedIdLookup: Send + Sync {
    async fn last_notified(&self, store: &dyn ActivityStore, user: &str) -> Result<u64, JobError>;
}

/// Reads the per-user watermark the notifier keeps in the activity store.
pub struct StoreWatermark;

#[async_trait]
impl FeedIdLookup for StoreWatermark {
    async fn last_notified(&self, store: &dyn ActivityStore, user: &str) -> Result<u64, JobError> {
        store.notified_watermark(user).await
    }
}

pub type SkipUser = Box<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifierReport {
    pub notified: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Sends each user the feed entries posted since their last notification.
pub struct FeedNotifier {
    locks: Arc<JobLockService>,
    store: Arc<dyn ActivityStore>,
    sender: Arc<dyn UserNotifier>,
    skip: SkipUser,
    lookup: Box<dyn FeedIdLookup>,
    lock_name: String,
    lock_ttl: Duration,
}

impl FeedNotifier {
    pub fn new(
        locks: Arc<JobLockService>,
        store: Arc<dyn ActivityStore>,
        sender: Arc<dyn UserNotifier>,
        lock_name: &str,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            locks,
            store,
            sender,
            skip: Box::new(|_| false),
            lookup: Box::new(StoreWatermark),
            lock_name: lock_name.to_string(),
            lock_ttl,
        }
    }

    pub fn with_skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.skip = Box::new(skip);
        self
    }

    pub fn with_feed_id_lookup<L>(mut self, lookup: L) -> Self
    where
        L: FeedIdLookup + 'static,
    {
        self.lookup = Box::new(lookup);
        self
    }

    pub async fn run_cycle(&self) -> Result<Option<NotifierReport>, JobError> {
        let outcome = self
            .locks
            .run_exclusive(&self.lock_name, self.lock_ttl, |status| self.notify_all(status))
            .await?;
        match outcome {
            None => Ok(None),
            Some(Ok(report)) => {
                info!(
                    "Feed notification done: {} notified, {} skipped, {} errors",
                    report.notified, report.skipped, report.errors
                );
                Ok(Some(report))
            }
            Some(Err(JobError::ShuttingDown)) => {
                info!("Feed notification stopped: job lock lost");
                Ok(None)
            }
            Some(Err(e)) => Err(e),
        }
    }

    async fn notify_all(&self, status: LockStatus) -> Result<NotifierReport, JobError> {
        let mut report = NotifierReport::default();
        for user in self.store.feed_users().await? {
            if !status.is_active() {
                return Err(JobError::ShuttingDown);
            }
            if (self.skip)(&user) {
                report.skipped += 1;
                continue;
            }

            let watermark = self.lookup.last_notified(self.store.as_ref(), &user).await?;
            let entries = self.store.feed_entries_after(&user, watermark).await?;
            let Some(last) = entries.iter().map(|e| e.id).max() else {
                continue;
            };

            match self.sender.notify(&user, &entries).await {
                Ok(()) => {
                    self.store.set_notified_watermark(&user, last).await?;
                    debug!("Notified {} of {} feed entries", user, entries.len());
                    report.notified += 1;
                }
                Err(e) => {
                    warn!("Failed to notify {}: {}", user, e);
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }
}
