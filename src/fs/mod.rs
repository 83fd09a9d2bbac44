//! CIFS-style driver facade over a [`NodeStore`].
//!
//! Every mutating call runs under the write lock of the directories it
//! touches. The store change, the matcher update and any reconciliation the
//! operation completes are staged in one store transaction; windows and
//! open-file redirects are published only after that transaction commits.

pub mod errors;
pub mod handles;
pub mod lock_manager;
pub mod operations;
pub mod rules;
pub mod types;

pub use self::errors::FsError;
pub use self::handles::{HandleTable, OpenFileState};
pub use self::lock_manager::LockManager;
pub use self::rules::{AddAspectRule, InboundRule};
pub use self::types::{
    AccessMode, FileHandle, FileInfo, FileStatus, Session, SessionId, SetFileInfo,
};

use crate::path::RepoPath;
use crate::shuffle::matcher::Resolution;
use crate::shuffle::pattern::is_temp_name;
use crate::shuffle::{
    ContentSource, DirectoryWindow, FileOperationEvent, ReconciliationEngine, ShuffleMatcher,
};
use crate::store::{NodeId, NodeStore, NodeTransaction};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, error, info};

pub struct ShuffleDriver {
    store: Arc<dyn NodeStore>,
    lock_manager: LockManager,
    handles: HandleTable,
    windows: DashMap<String, DirectoryWindow>,
    /// Milliseconds timestamp of the last window sweep.
    swept_at: AtomicI64,
    matcher: ShuffleMatcher,
    engine: ReconciliationEngine,
    rules: Vec<Arc<dyn InboundRule>>,
}

/// Window updates and handle moves produced inside a transaction.
#[derive(Default)]
struct Staged {
    windows: Vec<(String, DirectoryWindow)>,
    redirects: Vec<(NodeId, NodeId)>,
}

impl Staged {
    fn take_window(&mut self, key: &str) -> Option<DirectoryWindow> {
        let index = self.windows.iter().position(|(k, _)| k == key)?;
        Some(self.windows.swap_remove(index).1)
    }
}

impl ShuffleDriver {
    pub fn new(store: Arc<dyn NodeStore>, matcher: ShuffleMatcher) -> Self {
        Self {
            store,
            lock_manager: LockManager::new(),
            handles: HandleTable::new(),
            windows: DashMap::new(),
            swept_at: AtomicI64::new(0),
            matcher,
            engine: ReconciliationEngine::new(),
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: Arc<dyn InboundRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn matcher(&self) -> &ShuffleMatcher {
        &self.matcher
    }

    /// Snapshot of the window for `dir`.
    pub fn window(&self, dir: &RepoPath) -> Option<DirectoryWindow> {
        self.windows.get(&dir.key()).map(|w| w.clone())
    }

    pub fn resolutions(&self, dir: &RepoPath) -> Vec<Resolution> {
        self.window(dir)
            .map(|w| w.resolutions().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of directories currently holding a window.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn open_handles(&self) -> usize {
        self.handles.open_count()
    }

    fn is_temp(&self, name: &str) -> bool {
        is_temp_name(name, &self.matcher.config().temp_suffixes)
    }

    /// Walk `dir` from the root, distinguishing a missing component from one
    /// that is a file.
    fn resolve_parent(&self, txn: &dyn NodeTransaction, dir: &RepoPath) -> Result<NodeId, FsError> {
        let mut current = RepoPath::root();
        let mut id = txn.root();
        for component in dir.components() {
            current = current.join(component);
            id = txn.resolve(&current)?.ok_or(FsError::PathNotFound)?;
            if !txn.node(id)?.is_folder() {
                return Err(FsError::NotADirectory);
            }
        }
        Ok(id)
    }

    fn current_path(&self, node: NodeId) -> Result<Option<RepoPath>, FsError> {
        let txn = self.store.begin()?;
        if !txn.exists(node) {
            return Ok(None);
        }
        Ok(Some(txn.path_of(node)?))
    }

    /// Feed `events` through their directory windows and reconcile every
    /// shuffle they complete inside `txn`.
    fn stage(
        &self,
        txn: &mut dyn NodeTransaction,
        events: &[FileOperationEvent],
    ) -> Result<Staged, FsError> {
        let mut staged = Staged::default();
        for event in events {
            let key = event.directory().key();
            let mut window = staged
                .take_window(&key)
                .or_else(|| self.windows.get(&key).map(|w| w.clone()))
                .unwrap_or_default();
            let found = self.matcher.observe(&mut window, event);
            staged.windows.push((key, window));

            let Some(found) = found else {
                continue;
            };
            let pending = self.handles.has_pending_write(found.incoming);
            let outcome = self.engine.plan(&found, txn, pending).map_err(|e| {
                error!("Failed to plan {} shuffle at {}: {}", found.pattern, found.final_path, e);
                FsError::from(e)
            })?;
            let survivor = self.engine.reconcile(&outcome, txn).map_err(|e| {
                error!(
                    "Failed to reconcile {} shuffle at {}: {}",
                    found.pattern, found.final_path, e
                );
                FsError::from(e)
            })?;
            if matches!(outcome.content_source, ContentSource::Node(_)) {
                rules::run_rules(&self.rules, txn, survivor)?;
            }
            info!(
                "{} save at {}: node {} kept, node {} displaced",
                outcome.pattern, outcome.final_path, survivor, outcome.source_node
            );
            if pending {
                staged.redirects.push((outcome.source_node, survivor));
            }
        }
        Ok(staged)
    }

    fn publish(&self, staged: Staged) {
        for (key, window) in staged.windows {
            if window.is_empty() {
                self.windows.remove(&key);
            } else {
                self.windows.insert(key, window);
            }
        }
        for (from, to) in staged.redirects {
            debug!("moving open state of node {} to node {}", from, to);
            self.handles.redirect(from, to);
        }
        self.sweep_windows(Utc::now());
    }

    /// Drop every window with no activity inside the rename timeout. Runs at
    /// most once per timeout period. A window that a concurrent operation
    /// publishes meanwhile is fresh and survives.
    fn sweep_windows(&self, now: DateTime<Utc>) {
        let last = self.swept_at.load(Ordering::Relaxed);
        if last > self.matcher.horizon(now).timestamp_millis() {
            return;
        }
        if self
            .swept_at
            .compare_exchange(last, now.timestamp_millis(), Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let before = self.windows.len();
        self.windows
            .retain(|_, window| !self.matcher.is_stale(window, now));
        let dropped = before.saturating_sub(self.windows.len());
        if dropped > 0 {
            debug!("dropped {} idle directory windows", dropped);
        }
    }

    /// Stage `events`, commit `txn`, then publish.
    fn commit(
        &self,
        mut txn: Box<dyn NodeTransaction + '_>,
        events: &[FileOperationEvent],
    ) -> Result<(), FsError> {
        let staged = self.stage(txn.as_mut(), events)?;
        txn.commit()?;
        self.publish(staged);
        Ok(())
    }

    /// Record an event that changed nothing in the store. Failed operations
    /// are still part of an application's save sequence.
    fn note(&self, event: FileOperationEvent) {
        {
            let mut window = self.windows.entry(event.directory().key()).or_default();
            if let Some(found) = self.matcher.observe(&mut window, &event) {
                debug!(
                    "ignoring {} match completed by {:?} {}",
                    found.pattern, event.kind, event.path
                );
            }
        }
        self.sweep_windows(Utc::now());
    }
}

/// Split a path into its directory and final name. The root has no name.
fn split(path: &RepoPath) -> Result<(RepoPath, &str), FsError> {
    match (path.parent(), path.name()) {
        (Some(dir), Some(name)) => Ok((dir, name)),
        _ => Err(FsError::InvalidArgument),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shuffle::{PatternTable, ShuffleConfig};
    use crate::store::MemoryNodeStore;
    use crate::store::node::ASPECT_UNDELETABLE;
    use std::time::Duration;

    fn driver_with(config: ShuffleConfig) -> (Arc<ShuffleDriver>, Arc<MemoryNodeStore>) {
        let store = Arc::new(MemoryNodeStore::new());
        let matcher = ShuffleMatcher::new(PatternTable::builtin(), config);
        (Arc::new(ShuffleDriver::new(store.clone(), matcher)), store)
    }

    fn dir(raw: &str) -> RepoPath {
        RepoPath::parse(raw).unwrap()
    }

    fn node_at(store: &MemoryNodeStore, path: &str) -> Option<NodeId> {
        store.begin().unwrap().resolve(&dir(path)).unwrap()
    }

    #[tokio::test]
    async fn test_idle_windows_are_dropped_after_rename_timeout() {
        let (driver, _) = driver_with(ShuffleConfig {
            rename_timeout: Duration::from_millis(300),
            ..ShuffleConfig::default()
        });
        let s = Session::new(1, "alice");

        for i in 0..20 {
            let folder = format!("\\d{i}");
            driver.create_directory(&s, &folder).await.unwrap();
            let handle = driver
                .create_file(&s, &format!("{folder}\\f.txt"), AccessMode::ReadWrite)
                .await
                .unwrap();
            driver.close_file(&s, handle).await.unwrap();
        }
        assert_eq!(driver.window_count(), 20);

        tokio::time::sleep(Duration::from_millis(450)).await;
        driver.create_directory(&s, "\\fresh").await.unwrap();
        let handle = driver
            .create_file(&s, "\\fresh\\f.txt", AccessMode::ReadWrite)
            .await
            .unwrap();

        assert_eq!(driver.window_count(), 1);
        assert!(driver.window(&dir("\\d0")).is_none());
        assert!(driver.window(&dir("\\fresh")).is_some());
        driver.close_file(&s, handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_windows_sweep_too() {
        let (driver, _) = driver_with(ShuffleConfig {
            rename_timeout: Duration::from_millis(300),
            ..ShuffleConfig::default()
        });
        let s = Session::new(1, "alice");
        driver.create_directory(&s, "\\a").await.unwrap();

        // failed operations still leave a window behind
        let missing = driver.rename_file(&s, "\\a\\nope.txt", "\\a\\x.txt").await;
        assert_eq!(missing, Err(FsError::FileNotFound));
        assert_eq!(driver.window_count(), 1);

        tokio::time::sleep(Duration::from_millis(450)).await;
        let missing = driver.delete_file(&s, "\\nope.txt").await;
        assert_eq!(missing, Err(FsError::FileNotFound));
        assert!(driver.window(&dir("\\a")).is_none());
    }

    #[tokio::test]
    async fn test_close_follows_file_moved_while_waiting_for_lock() {
        let (driver, store) = driver_with(ShuffleConfig::default());
        let s = Session::new(1, "alice");
        driver.create_directory(&s, "\\a").await.unwrap();
        driver.create_directory(&s, "\\b").await.unwrap();
        let handle = driver
            .create_file(&s, "\\a\\f.txt", AccessMode::ReadWrite)
            .await
            .unwrap();
        driver.write_file(&s, handle, 0, b"moved").await.unwrap();
        let node = node_at(&store, "\\a\\f.txt").unwrap();

        let guard_a = driver.lock_manager.acquire_write(&dir("\\a")).await;
        let closer = driver.clone();
        let session = s.clone();
        let task = tokio::spawn(async move { closer.close_file(&session, handle).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // move the file to \b behind the waiting close, then hold \b as well
        {
            let mut txn = store.begin().unwrap();
            let b = txn.resolve(&dir("\\b")).unwrap().unwrap();
            txn.move_node(node, b, "f.txt").unwrap();
            txn.commit().unwrap();
        }
        let guard_b = driver.lock_manager.acquire_write(&dir("\\b")).await;
        drop(guard_a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished(), "close must wait for the directory the file is in now");

        drop(guard_b);
        task.await.unwrap().unwrap();
        assert_eq!(driver.open_handles(), 0);
        let txn = store.begin().unwrap();
        assert_eq!(txn.read_content(node).unwrap().as_deref(), Some(&b"moved"[..]));
    }

    #[tokio::test]
    async fn test_failed_close_keeps_handle_open() {
        let (driver, store) = driver_with(ShuffleConfig::default());
        let s = Session::new(1, "alice");
        driver.create_directory(&s, "\\docs").await.unwrap();
        let handle = driver
            .create_file(&s, "\\docs\\keep.txt", AccessMode::ReadWrite)
            .await
            .unwrap();
        driver.write_file(&s, handle, 0, b"draft").await.unwrap();
        driver
            .set_file_information(&s, "\\docs\\keep.txt", SetFileInfo::delete_on_close())
            .await
            .unwrap();
        let node = node_at(&store, "\\docs\\keep.txt").unwrap();
        {
            let mut txn = store.begin().unwrap();
            txn.add_aspect(node, ASPECT_UNDELETABLE).unwrap();
            txn.commit().unwrap();
        }

        assert_eq!(driver.close_file(&s, handle).await, Err(FsError::AccessDenied));
        assert_eq!(driver.open_handles(), 1);
        assert_eq!(&driver.read_file(&s, handle, 0, 16).await.unwrap()[..], b"draft");

        {
            let mut txn = store.begin().unwrap();
            txn.remove_aspect(node, ASPECT_UNDELETABLE).unwrap();
            txn.commit().unwrap();
        }
        driver.close_file(&s, handle).await.unwrap();
        assert_eq!(driver.open_handles(), 0);
        assert_eq!(
            driver.file_exists(&s, "\\docs\\keep.txt").await.unwrap(),
            FileStatus::NotExist
        );
    }
}
