//! Cluster-wide job lock backed by an object store.
//!
//! One object per lock name holds a JSON [`LockRecord`]. Every transition is
//! a conditional write (create-if-absent or update-if-etag-matches), so two
//! workers racing for the same lock cannot both win. The holder proves
//! ownership with the random token it wrote.

mod heartbeat;

pub use self::heartbeat::{LockStatus, RefreshHandle};

use chrono::{DateTime, Utc};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, UpdateVersion};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_LOCK_PREFIX: &str = "job-locks";

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock {0} is held by another worker")]
    AlreadyHeld(String),

    #[error("lock {0} is no longer held by this worker")]
    LockLost(String),

    #[error("lock store error: {0}")]
    Store(#[from] object_store::Error),

    #[error("malformed lock record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("failed to spawn lock heartbeat: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_name: String,
    pub token: String,
    pub held_by: String,
    pub expires_at: DateTime<Utc>,
    /// Bumped on every write, for fencing and diagnostics.
    pub version: u64,
    #[serde(default)]
    pub released: bool,
}

impl LockRecord {
    pub fn is_free(&self, now: DateTime<Utc>) -> bool {
        self.released || self.expires_at <= now
    }
}

/// Proof of holding a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    lock_name: String,
    token: String,
}

impl LockToken {
    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

pub struct JobLockService {
    store: Arc<dyn ObjectStore>,
    node_id: String,
    prefix: String,
}

impl JobLockService {
    pub fn new(store: Arc<dyn ObjectStore>, node_id: &str, prefix: &str) -> Self {
        Self {
            store,
            node_id: node_id.to_string(),
            prefix: prefix.to_string(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn path(&self, lock_name: &str) -> Path {
        Path::from(format!("{}/{}", self.prefix, lock_name))
    }

    fn ttl_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    async fn read(&self, path: &Path) -> Result<Option<(LockRecord, UpdateVersion)>, LockError> {
        match self.store.get(path).await {
            Ok(result) => {
                let version = UpdateVersion {
                    e_tag: result.meta.e_tag.clone(),
                    version: result.meta.version.clone(),
                };
                let bytes = result.bytes().await?;
                let record: LockRecord = serde_json::from_slice(&bytes)?;
                Ok(Some((record, version)))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Conditional write. `Ok(false)` means another writer got there first.
    async fn write(&self, path: &Path, record: &LockRecord, mode: PutMode) -> Result<bool, LockError> {
        if let PutMode::Update(UpdateVersion {
            e_tag: None,
            version: None,
        }) = &mode
        {
            return Err(LockError::Store(object_store::Error::NotImplemented));
        }
        let data = serde_json::to_vec(record)?;
        let put_opts = PutOptions {
            mode,
            ..Default::default()
        };
        match self.store.put_opts(path, data.into(), put_opts).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            Err(object_store::Error::Precondition { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Single attempt to take `lock_name` for `ttl`.
    pub async fn acquire(&self, lock_name: &str, ttl: Duration) -> Result<LockToken, LockError> {
        let path = self.path(lock_name);
        let now = Utc::now();
        let existing = self.read(&path).await?;

        let (mode, version) = match existing {
            None => (PutMode::Create, 1),
            Some((record, update)) if record.is_free(now) => {
                debug!(
                    "Job lock {} is free (held_by={}, released={})",
                    lock_name, record.held_by, record.released
                );
                (PutMode::Update(update), record.version + 1)
            }
            Some((record, _)) => {
                debug!(
                    "Job lock {} held by '{}' (expires in {} ms)",
                    lock_name,
                    record.held_by,
                    (record.expires_at - now).num_milliseconds()
                );
                return Err(LockError::AlreadyHeld(lock_name.to_string()));
            }
        };

        let record = LockRecord {
            lock_name: lock_name.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            held_by: self.node_id.clone(),
            expires_at: Self::ttl_from(now, ttl),
            version,
            released: false,
        };
        if !self.write(&path, &record, mode).await? {
            debug!("Failed to acquire job lock {} - lost the race", lock_name);
            return Err(LockError::AlreadyHeld(lock_name.to_string()));
        }

        info!(
            "Acquired job lock {} (version {}, node '{}')",
            lock_name, record.version, self.node_id
        );
        Ok(LockToken {
            lock_name: lock_name.to_string(),
            token: record.token,
        })
    }

    /// Extend the lock to `now + ttl` if `token` still holds it.
    pub async fn refresh(&self, token: &LockToken, ttl: Duration) -> Result<(), LockError> {
        let path = self.path(&token.lock_name);
        let lost = || LockError::LockLost(token.lock_name.clone());

        let (record, update) = self.read(&path).await?.ok_or_else(lost)?;
        if record.token != token.token || record.released {
            return Err(lost());
        }

        let renewed = LockRecord {
            expires_at: Self::ttl_from(Utc::now(), ttl),
            version: record.version + 1,
            ..record
        };
        if !self.write(&path, &renewed, PutMode::Update(update)).await? {
            return Err(lost());
        }
        debug!(
            "Refreshed job lock {} (version {})",
            token.lock_name, renewed.version
        );
        Ok(())
    }

    /// Give the lock up. A token that no longer holds the lock changes
    /// nothing.
    pub async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let path = self.path(&token.lock_name);
        let Some((record, update)) = self.read(&path).await? else {
            debug!("Job lock {} has no record, nothing to release", token.lock_name);
            return Ok(());
        };
        if record.token != token.token || record.released {
            debug!(
                "Job lock {} is not held by this token, nothing to release",
                token.lock_name
            );
            return Ok(());
        }

        let released = LockRecord {
            expires_at: Utc::now(),
            version: record.version + 1,
            released: true,
            ..record
        };
        if self.write(&path, &released, PutMode::Update(update)).await? {
            info!("Released job lock {}", token.lock_name);
        } else {
            warn!(
                "Job lock {} changed while releasing, leaving it alone",
                token.lock_name
            );
        }
        Ok(())
    }

    /// Current record for `lock_name`, if any.
    pub async fn current(&self, lock_name: &str) -> Result<Option<LockRecord>, LockError> {
        Ok(self.read(&self.path(lock_name)).await?.map(|(record, _)| record))
    }

    /// Acquire `lock_name`, keep it alive while `job` runs and release it
    /// afterwards. Returns `Ok(None)` when another worker holds the lock.
    /// Once the job has run its output is returned even if the release
    /// fails.
    pub async fn run_exclusive<F, Fut, T>(
        self: &Arc<Self>,
        lock_name: &str,
        ttl: Duration,
        job: F,
    ) -> Result<Option<T>, LockError>
    where
        F: FnOnce(LockStatus) -> Fut,
        Fut: Future<Output = T>,
    {
        let token = match self.acquire(lock_name, ttl).await {
            Ok(token) => token,
            Err(LockError::AlreadyHeld(_)) => {
                debug!("Skipping {} cycle, lock held elsewhere", lock_name);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let name = lock_name.to_string();
        let handle = match self.refresh_periodically(token.clone(), ttl, move || {
            warn!("Job lock {} lost while the job was running", name);
        }) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(release) = self.release(&token).await {
                    warn!("Failed to release job lock {}: {}", lock_name, release);
                }
                return Err(e);
            }
        };

        let output = job(handle.status()).await;
        // the job already ran; an unreleased lock just lapses at its expiry
        if let Err(e) = handle.release().await {
            warn!(
                "Failed to release job lock {} after the job finished: {}",
                lock_name, e
            );
        }
        Ok(Some(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use futures::stream::BoxStream;
    use object_store::memory::InMemory;
    use object_store::{
        GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, PutMultipartOpts,
        PutPayload, PutResult,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    const LOCK: &str = "feed-generator";

    /// In-memory store whose calls fail while `failing` is set.
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: InMemory,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> object_store::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(object_store::Error::Generic {
                    store: "flaky",
                    source: "store unavailable".into(),
                });
            }
            Ok(())
        }
    }

    impl std::fmt::Display for FlakyStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "FlakyStore({})", self.inner)
        }
    }

    #[async_trait::async_trait]
    impl ObjectStore for FlakyStore {
        async fn put_opts(
            &self,
            location: &Path,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            self.check()?;
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &Path,
            opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            self.check()?;
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(
            &self,
            location: &Path,
            options: GetOptions,
        ) -> object_store::Result<GetResult> {
            self.check()?;
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &Path) -> object_store::Result<()> {
            self.check()?;
            self.inner.delete(location).await
        }

        fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(
            &self,
            prefix: Option<&Path>,
        ) -> object_store::Result<ListResult> {
            self.check()?;
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.check()?;
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.check()?;
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    fn flaky_service() -> (Arc<JobLockService>, Arc<FlakyStore>) {
        let flaky = Arc::new(FlakyStore::default());
        let store: Arc<dyn ObjectStore> = flaky.clone();
        let service = Arc::new(JobLockService::new(store, "node-0", DEFAULT_LOCK_PREFIX));
        (service, flaky)
    }

    fn services(n: usize) -> Vec<Arc<JobLockService>> {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        (0..n)
            .map(|i| {
                Arc::new(JobLockService::new(
                    store.clone(),
                    &format!("node-{i}"),
                    DEFAULT_LOCK_PREFIX,
                ))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let nodes = services(8);
        let attempts = nodes
            .iter()
            .map(|node| node.acquire(LOCK, Duration::from_secs(30)));
        let results = join_all(attempts).await;

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, LockError::AlreadyHeld(_)))
        );
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let nodes = services(2);
        let stale = nodes[0].acquire(LOCK, Duration::from_millis(50)).await.unwrap();
        assert!(matches!(
            nodes[1].acquire(LOCK, Duration::from_secs(30)).await,
            Err(LockError::AlreadyHeld(_))
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let fresh = nodes[1].acquire(LOCK, Duration::from_secs(30)).await.unwrap();

        assert!(matches!(
            nodes[0].refresh(&stale, Duration::from_secs(30)).await,
            Err(LockError::LockLost(_))
        ));

        // releasing with the stale token leaves the new holder alone
        nodes[0].release(&stale).await.unwrap();
        let record = nodes[1].current(LOCK).await.unwrap().unwrap();
        assert_eq!(record.token, fresh.token());
        assert_eq!(record.held_by, "node-1");
        assert!(!record.released);
    }

    #[tokio::test]
    async fn test_release_frees_the_lock() {
        let nodes = services(2);
        let token = nodes[0].acquire(LOCK, Duration::from_secs(30)).await.unwrap();
        nodes[0].release(&token).await.unwrap();

        let record = nodes[0].current(LOCK).await.unwrap().unwrap();
        assert!(record.released);
        nodes[1].acquire(LOCK, Duration::from_secs(30)).await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_keeps_lock_alive() {
        let nodes = services(2);
        let ttl = Duration::from_millis(200);
        let token = nodes[0].acquire(LOCK, ttl).await.unwrap();
        let handle = nodes[0]
            .refresh_periodically(token, ttl, || {})
            .unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(handle.is_active());
        assert!(matches!(
            nodes[1].acquire(LOCK, ttl).await,
            Err(LockError::AlreadyHeld(_))
        ));

        handle.release().await.unwrap();
        nodes[1].acquire(LOCK, ttl).await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_lock_fires_callback() {
        let nodes = services(1);
        let ttl = Duration::from_millis(100);
        let token = nodes[0].acquire(LOCK, ttl).await.unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let handle = nodes[0]
            .refresh_periodically(token, ttl, move || flag.store(true, Ordering::SeqCst))
            .unwrap();

        // another worker's record replaces ours
        let hijacked = LockRecord {
            lock_name: LOCK.to_string(),
            token: "someone-else".to_string(),
            held_by: "node-9".to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(30),
            version: 99,
            released: false,
        };
        nodes[0]
            .store
            .put(
                &nodes[0].path(LOCK),
                serde_json::to_vec(&hijacked).unwrap().into(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_active());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_exclusive_skips_when_held() {
        let nodes = services(2);
        let _held = nodes[1].acquire(LOCK, Duration::from_secs(30)).await.unwrap();

        let ran = nodes[0]
            .run_exclusive(LOCK, Duration::from_secs(30), |_| async { 42 })
            .await
            .unwrap();
        assert_eq!(ran, None);
    }

    #[tokio::test]
    async fn test_run_exclusive_releases_after_job() {
        let nodes = services(2);
        let ran = nodes[0]
            .run_exclusive(LOCK, Duration::from_secs(30), |status| async move {
                status.is_active()
            })
            .await
            .unwrap();
        assert_eq!(ran, Some(true));
        nodes[1].acquire(LOCK, Duration::from_secs(30)).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_errors_do_not_drop_the_lock() {
        let (service, flaky) = flaky_service();
        let ttl = Duration::from_millis(600);
        let token = service.acquire(LOCK, ttl).await.unwrap();
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let handle = service
            .refresh_periodically(token, ttl, move || flag.store(true, Ordering::SeqCst))
            .unwrap();

        // the refresh at 300 ms fails, the one at 600 ms succeeds
        flaky.set_failing(true);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(handle.is_active());
        flaky.set_failing(false);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(handle.is_active());
        assert!(!released.load(Ordering::SeqCst));
        handle.release().await.unwrap();
        assert!(service.current(LOCK).await.unwrap().unwrap().released);
    }

    #[tokio::test]
    async fn test_store_errors_past_expiry_drop_the_lock() {
        let (service, flaky) = flaky_service();
        let ttl = Duration::from_millis(200);
        let token = service.acquire(LOCK, ttl).await.unwrap();
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let handle = service
            .refresh_periodically(token, ttl, move || flag.store(true, Ordering::SeqCst))
            .unwrap();

        flaky.set_failing(true);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!handle.is_active());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_exclusive_returns_output_when_release_fails() {
        let (service, flaky) = flaky_service();
        let outage = flaky.clone();
        let ran = service
            .run_exclusive(LOCK, Duration::from_secs(30), move |_| async move {
                outage.set_failing(true);
                7
            })
            .await
            .unwrap();
        assert_eq!(ran, Some(7));

        // the release never landed, so the record is still held
        flaky.set_failing(false);
        let record = service.current(LOCK).await.unwrap().unwrap();
        assert!(!record.released);
    }
}
