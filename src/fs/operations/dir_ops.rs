use crate::fs::errors::FsError;
use crate::fs::types::{FileStatus, Session};
use crate::fs::{ShuffleDriver, split};
use crate::path::RepoPath;
use crate::store::NodeKind;
use tracing::debug;

impl ShuffleDriver {
    pub async fn create_directory(&self, session: &Session, path: &str) -> Result<(), FsError> {
        let path = RepoPath::parse(path)?;
        let (dir, name) = split(&path)?;
        debug!("create_directory: {} ({})", path, session.id);

        let _guard = self.lock_manager.acquire_write(&dir).await;
        let mut txn = self.store.begin()?;
        let parent = self.resolve_parent(txn.as_ref(), &dir)?;
        if txn.resolve(&path)?.is_some() {
            return Err(FsError::FileExists);
        }
        txn.create_node(parent, name, NodeKind::Folder)?;
        txn.commit()?;
        Ok(())
    }

    pub async fn delete_directory(&self, session: &Session, path: &str) -> Result<(), FsError> {
        let path = RepoPath::parse(path)?;
        let (dir, _) = split(&path)?;
        debug!("delete_directory: {} ({})", path, session.id);

        let _guards = self
            .lock_manager
            .acquire_multiple_write(&[dir.clone(), path.clone()])
            .await;
        let mut txn = self.store.begin()?;
        self.resolve_parent(txn.as_ref(), &dir)?;
        let node = txn.resolve(&path)?.ok_or(FsError::FileNotFound)?;
        if !txn.node(node)?.is_folder() {
            return Err(FsError::NotADirectory);
        }
        if !txn.children(node)?.is_empty() {
            return Err(FsError::DirectoryNotEmpty);
        }
        txn.delete_node(node)?;
        txn.commit()?;
        Ok(())
    }

    pub async fn file_exists(&self, _session: &Session, path: &str) -> Result<FileStatus, FsError> {
        let path = RepoPath::parse(path)?;
        let dir = path.parent().unwrap_or_else(RepoPath::root);

        let _guard = self.lock_manager.acquire_read(&dir).await;
        let txn = self.store.begin()?;
        let status = match txn.resolve(&path)? {
            None => FileStatus::NotExist,
            Some(node) if txn.node(node)?.is_folder() => FileStatus::DirectoryExists,
            Some(_) => FileStatus::FileExists,
        };
        Ok(status)
    }
}
