use crate::fs::errors::FsError;
use crate::fs::types::{FileInfo, Session, SetFileInfo};
use crate::fs::{ShuffleDriver, split};
use crate::path::RepoPath;
use crate::shuffle::{FileOperationEvent, OperationKind};
use crate::store::node::{PROP_CREATED, PROP_MODIFIED};
use tracing::debug;

impl ShuffleDriver {
    pub async fn get_file_information(
        &self,
        _session: &Session,
        path: &str,
    ) -> Result<FileInfo, FsError> {
        let path = RepoPath::parse(path)?;
        let dir = path.parent().unwrap_or_else(RepoPath::root);

        let _guard = self.lock_manager.acquire_read(&dir).await;
        let txn = self.store.begin()?;
        self.resolve_parent(txn.as_ref(), &dir)?;
        let node = txn.resolve(&path)?.ok_or(FsError::FileNotFound)?;
        let record = txn.node(node)?;

        Ok(FileInfo {
            node,
            name: record.name.clone(),
            size: self
                .handles
                .in_progress_len(node)
                .unwrap_or_else(|| record.size()),
            is_folder: record.is_folder(),
            created: record.created(),
            modified: record.modified(),
        })
    }

    pub async fn set_file_information(
        &self,
        session: &Session,
        path: &str,
        info: SetFileInfo,
    ) -> Result<(), FsError> {
        let path = RepoPath::parse(path)?;
        let (dir, _) = split(&path)?;
        debug!("set_file_information: {} {:?} ({})", path, info, session.id);

        let _guard = self.lock_manager.acquire_write(&dir).await;
        let mut txn = self.store.begin()?;
        self.resolve_parent(txn.as_ref(), &dir)?;
        let node = txn.resolve(&path)?.ok_or(FsError::FileNotFound)?;

        if let Some(delete) = info.delete_on_close {
            self.handles.set_delete_on_close(node, delete)?;
        }
        if let Some(created) = info.created {
            txn.set_property(node, PROP_CREATED, created.into())?;
        }
        if let Some(modified) = info.modified {
            txn.set_property(node, PROP_MODIFIED, modified.into())?;
        }

        let event =
            FileOperationEvent::new(OperationKind::SetInfo, path, session.id).with_node(node);
        self.commit(txn, &[event])
    }
}
