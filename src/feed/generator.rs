use super::{ActivityPost, ActivityStore, FeedEntry, JobError, PostStatus};
use crate::joblock::{JobLockService, LockStatus};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratorReport {
    pub processed: usize,
    pub failed: usize,
    pub entries: usize,
}

/// Fans pending activity posts out into per-user feed entries.
pub struct FeedGenerator {
    locks: Arc<JobLockService>,
    store: Arc<dyn ActivityStore>,
    lock_name: String,
    lock_ttl: Duration,
    batch_size: usize,
}

impl FeedGenerator {
    pub fn new(
        locks: Arc<JobLockService>,
        store: Arc<dyn ActivityStore>,
        lock_name: &str,
        lock_ttl: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            locks,
            store,
            lock_name: lock_name.to_string(),
            lock_ttl,
            batch_size,
        }
    }

    /// One generation cycle. `Ok(None)` when another worker holds the lock.
    pub async fn run_cycle(&self) -> Result<Option<GeneratorReport>, JobError> {
        let outcome = self
            .locks
            .run_exclusive(&self.lock_name, self.lock_ttl, |status| self.generate(status))
            .await?;
        match outcome {
            None => Ok(None),
            Some(Ok(report)) => {
                info!(
                    "Feed generation done: {} posts, {} entries, {} failed",
                    report.processed, report.entries, report.failed
                );
                Ok(Some(report))
            }
            Some(Err(JobError::ShuttingDown)) => {
                info!("Feed generation stopped: job lock lost");
                Ok(None)
            }
            Some(Err(e)) => Err(e),
        }
    }

    async fn generate(&self, status: LockStatus) -> Result<GeneratorReport, JobError> {
        let mut report = GeneratorReport::default();
        let mut posts = self.store.pending_posts(self.batch_size).await?;
        posts.sort_by_key(|p| p.id);

        for post in posts {
            if !status.is_active() {
                return Err(JobError::ShuttingDown);
            }
            match self.fan_out(&post).await? {
                Some(count) => {
                    self.store
                        .set_post_status(post.id, PostStatus::Processed)
                        .await?;
                    report.processed += 1;
                    report.entries += count;
                }
                None => {
                    self.store.set_post_status(post.id, PostStatus::Failed).await?;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Entries written for `post`, or `None` if the post cannot be used.
    async fn fan_out(&self, post: &ActivityPost) -> Result<Option<usize>, JobError> {
        let summary: serde_json::Value = match serde_json::from_str(&post.summary) {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Dropping activity post {}: bad summary: {}", post.id, e);
                return Ok(None);
            }
        };

        let mut recipients = BTreeSet::from([post.user.clone()]);
        if let Some(site) = &post.site {
            match self.store.site_members(site).await? {
                Some(members) => recipients.extend(members),
                None => {
                    warn!("Dropping activity post {}: unknown site {}", post.id, site);
                    return Ok(None);
                }
            }
        }

        let entries: Vec<FeedEntry> = recipients
            .into_iter()
            .map(|feed_user| FeedEntry {
                id: 0,
                feed_user,
                post_id: post.id,
                activity_type: post.activity_type.clone(),
                site: post.site.clone(),
                summary: summary.clone(),
                posted_at: post.posted_at,
            })
            .collect();
        let count = entries.len();
        debug!("Activity post {} fans out to {} feeds", post.id, count);
        self.store.insert_feed_entries(entries).await?;
        Ok(Some(count))
    }
}
