//! Activity feed batch jobs. Each cycle runs under a cluster-wide
//! [`JobLockService`](crate::joblock::JobLockService) lock so at most one
//! worker generates or notifies at a time.

pub mod generator;
pub mod notifier;

pub use self::generator::{FeedGenerator, GeneratorReport};
pub use self::notifier::{FeedIdLookup, FeedNotifier, NotifierReport, StoreWatermark, UserNotifier};

use crate::joblock::LockError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum JobError {
    /// The job lock went away mid-cycle.
    #[error("job is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("activity store error: {0}")]
    Store(String),

    #[error("notification failed: {0}")]
    Notify(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Pending,
    Processed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityPost {
    pub id: u64,
    pub activity_type: String,
    pub site: Option<String>,
    pub user: String,
    /// JSON document as posted.
    pub summary: String,
    pub posted_at: DateTime<Utc>,
    pub status: PostStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub id: u64,
    pub feed_user: String,
    pub post_id: u64,
    pub activity_type: String,
    pub site: Option<String>,
    pub summary: serde_json::Value,
    pub posted_at: DateTime<Utc>,
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Oldest pending posts first.
    async fn pending_posts(&self, limit: usize) -> Result<Vec<ActivityPost>, JobError>;

    /// `None` for an unknown site.
    async fn site_members(&self, site: &str) -> Result<Option<BTreeSet<String>>, JobError>;

    /// Stores the entries, assigning ids. `id` on input is ignored.
    async fn insert_feed_entries(&self, entries: Vec<FeedEntry>) -> Result<(), JobError>;

    async fn set_post_status(&self, post_id: u64, status: PostStatus) -> Result<(), JobError>;

    async fn feed_entries_after(&self, user: &str, after: u64) -> Result<Vec<FeedEntry>, JobError>;

    /// Users that may have a feed, in a stable order.
    async fn feed_users(&self) -> Result<Vec<String>, JobError>;

    async fn notified_watermark(&self, user: &str) -> Result<u64, JobError>;

    async fn set_notified_watermark(&self, user: &str, entry_id: u64) -> Result<(), JobError>;
}

#[derive(Default)]
struct MemoryActivityState {
    next_post: u64,
    next_entry: u64,
    posts: BTreeMap<u64, ActivityPost>,
    sites: BTreeMap<String, BTreeSet<String>>,
    entries: Vec<FeedEntry>,
    watermarks: HashMap<String, u64>,
}

#[derive(Default)]
pub struct MemoryActivityStore {
    state: Mutex<MemoryActivityState>,
}

impl MemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_site(&self, site: &str, members: &[&str]) {
        let mut state = self.state.lock().await;
        state
            .sites
            .entry(site.to_string())
            .or_default()
            .extend(members.iter().map(|m| m.to_string()));
    }

    pub async fn post(
        &self,
        activity_type: &str,
        site: Option<&str>,
        user: &str,
        summary: &str,
    ) -> u64 {
        let mut state = self.state.lock().await;
        state.next_post += 1;
        let id = state.next_post;
        state.posts.insert(
            id,
            ActivityPost {
                id,
                activity_type: activity_type.to_string(),
                site: site.map(str::to_string),
                user: user.to_string(),
                summary: summary.to_string(),
                posted_at: Utc::now(),
                status: PostStatus::Pending,
            },
        );
        id
    }

    pub async fn post_status(&self, post_id: u64) -> Option<PostStatus> {
        self.state.lock().await.posts.get(&post_id).map(|p| p.status)
    }
}

#[async_trait]
impl ActivityStore for MemoryActivityStore {
    async fn pending_posts(&self, limit: usize) -> Result<Vec<ActivityPost>, JobError> {
        let state = self.state.lock().await;
        Ok(state
            .posts
            .values()
            .filter(|p| p.status == PostStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn site_members(&self, site: &str) -> Result<Option<BTreeSet<String>>, JobError> {
        Ok(self.state.lock().await.sites.get(site).cloned())
    }

    async fn insert_feed_entries(&self, entries: Vec<FeedEntry>) -> Result<(), JobError> {
        let mut state = self.state.lock().await;
        for mut entry in entries {
            state.next_entry += 1;
            entry.id = state.next_entry;
            state.entries.push(entry);
        }
        Ok(())
    }

    async fn set_post_status(&self, post_id: u64, status: PostStatus) -> Result<(), JobError> {
        let mut state = self.state.lock().await;
        let post = state
            .posts
            .get_mut(&post_id)
            .ok_or_else(|| JobError::Store(format!("no post {post_id}")))?;
        post.status = status;
        Ok(())
    }

    async fn feed_entries_after(&self, user: &str, after: u64) -> Result<Vec<FeedEntry>, JobError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.feed_user == user && e.id > after)
            .cloned()
            .collect())
    }

    async fn feed_users(&self) -> Result<Vec<String>, JobError> {
        let state = self.state.lock().await;
        let users: BTreeSet<String> = state
            .entries
            .iter()
            .map(|e| e.feed_user.clone())
            .chain(state.sites.values().flatten().cloned())
            .collect();
        Ok(users.into_iter().collect())
    }

    async fn notified_watermark(&self, user: &str) -> Result<u64, JobError> {
        Ok(self
            .state
            .lock()
            .await
            .watermarks
            .get(user)
            .copied()
            .unwrap_or(0))
    }

    async fn set_notified_watermark(&self, user: &str, entry_id: u64) -> Result<(), JobError> {
        self.state
            .lock()
            .await
            .watermarks
            .insert(user.to_string(), entry_id);
        Ok(())
    }
}
