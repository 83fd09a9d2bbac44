use crate::path::RepoPath;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    /// Canonical key of a directory; guards its entries and its shuffle window.
    Directory(String),
}

impl LockKey {
    pub fn directory(path: &RepoPath) -> Self {
        LockKey::Directory(path.key())
    }
}

type LockTable = Arc<DashMap<LockKey, Arc<RwLock<()>>>>;

/// Per-directory reader/writer locks, created on first use and dropped from
/// the table once nobody holds or waits on them.
#[derive(Clone, Default)]
pub struct LockManager {
    locks: LockTable,
}

enum Held {
    Shared { _guard: OwnedRwLockReadGuard<()> },
    Exclusive { _guard: OwnedRwLockWriteGuard<()> },
}

/// One held directory lock.
pub struct DirLock {
    held: Held,
    key: LockKey,
    table: LockTable,
}

impl DirLock {
    pub fn is_exclusive(&self) -> bool {
        matches!(self.held, Held::Exclusive { .. })
    }
}

/// Exclusive locks on every directory a rename touches.
pub struct DirLockSet {
    held: Vec<DirLock>,
}

impl DirLockSet {
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &LockKey) -> Arc<RwLock<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn hold(&self, key: LockKey, held: Held) -> DirLock {
        DirLock {
            held,
            key,
            table: self.locks.clone(),
        }
    }

    /// Shared lock on a directory, for lookups.
    pub async fn acquire_read(&self, dir: &RepoPath) -> DirLock {
        let key = LockKey::directory(dir);
        let guard = self.lock_for(&key).read_owned().await;
        self.hold(key, Held::Shared { _guard: guard })
    }

    /// Exclusive lock on a directory, for anything that changes its entries
    /// or feeds its window.
    pub async fn acquire_write(&self, dir: &RepoPath) -> DirLock {
        let key = LockKey::directory(dir);
        let guard = self.lock_for(&key).write_owned().await;
        self.hold(key, Held::Exclusive { _guard: guard })
    }

    /// Exclusive locks on several directories, taken in key order. Paths that
    /// name the same directory are locked once.
    pub async fn acquire_multiple_write(&self, dirs: &[RepoPath]) -> DirLockSet {
        let mut keys: Vec<LockKey> = dirs.iter().map(LockKey::directory).collect();
        keys.sort();
        keys.dedup();

        let mut held = Vec::with_capacity(keys.len());
        for key in keys {
            let guard = self.lock_for(&key).write_owned().await;
            held.push(self.hold(key, Held::Exclusive { _guard: guard }));
        }
        DirLockSet { held }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // one reference in the table, one in our guard; more means waiters
        self.table
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn dir(raw: &str) -> RepoPath {
        RepoPath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_directory_lock_reacquired_after_drop() {
        let manager = LockManager::new();

        let first = manager.acquire_write(&dir("\\docs")).await;
        assert!(first.is_exclusive());
        drop(first);

        let second = manager.acquire_write(&dir("\\docs")).await;
        assert!(second.is_exclusive());
    }

    #[tokio::test]
    async fn test_directory_keys_are_case_insensitive() {
        let manager = Arc::new(LockManager::new());
        let held = manager.acquire_write(&dir("\\Docs")).await;

        let waiter = manager.clone();
        let entered = Arc::new(AtomicBool::new(false));
        let entered_flag = entered.clone();
        let task = tokio::spawn(async move {
            let _lock = waiter.acquire_write(&dir("\\DOCS")).await;
            entered_flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!entered.load(Ordering::SeqCst));

        drop(held);
        task.await.unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_rename_locks_collapse_duplicates() {
        let manager = LockManager::new();

        let set = manager
            .acquire_multiple_write(&[dir("\\c"), dir("\\a"), dir("\\b")])
            .await;
        assert_eq!(set.len(), 3);
        drop(set);

        let set = manager
            .acquire_multiple_write(&[dir("\\b"), dir("\\a"), dir("\\A")])
            .await;
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn test_other_directory_not_blocked() {
        let manager = Arc::new(LockManager::new());
        let _held = manager.acquire_write(&dir("\\one")).await;

        let other = manager.clone();
        let task = tokio::spawn(async move {
            let _lock = other.acquire_write(&dir("\\two")).await;
        });

        tokio::time::timeout(Duration::from_millis(200), task)
            .await
            .expect("\\two must not wait on \\one")
            .unwrap();
    }

    #[tokio::test]
    async fn test_readers_share() {
        let manager = LockManager::new();
        let first = manager.acquire_read(&dir("\\docs")).await;
        let second = manager.acquire_read(&dir("\\docs")).await;
        assert!(!first.is_exclusive() && !second.is_exclusive());
    }

    #[tokio::test]
    async fn test_idle_directories_leave_no_entries() {
        let manager = LockManager::new();

        {
            let _lock = manager.acquire_write(&dir("\\docs")).await;
            assert_eq!(manager.locks.len(), 1);
        }
        assert!(manager.locks.is_empty());

        {
            let _set = manager
                .acquire_multiple_write(&[dir("\\a"), dir("\\b")])
                .await;
            assert_eq!(manager.locks.len(), 2);
        }
        assert!(manager.locks.is_empty());
    }

    #[tokio::test]
    async fn test_racing_lookups_share_one_lock() {
        let manager = Arc::new(LockManager::new());
        let key = LockKey::directory(&dir("\\shared"));

        let lookups = (0..10).map(|_| {
            let manager = manager.clone();
            let key = key.clone();
            tokio::spawn(async move { manager.lock_for(&key) })
        });
        let locks: Vec<_> = futures::future::join_all(lookups)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert!(locks.iter().all(|lock| Arc::ptr_eq(lock, &locks[0])));
        assert_eq!(manager.locks.len(), 1);
    }
}
