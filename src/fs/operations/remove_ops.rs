use crate::fs::errors::FsError;
use crate::fs::types::Session;
use crate::fs::{ShuffleDriver, split};
use crate::path::RepoPath;
use crate::shuffle::{FileOperationEvent, OperationKind, OperationOutcome};
use crate::store::StoreError;
use tracing::debug;

impl ShuffleDriver {
    pub async fn delete_file(&self, session: &Session, path: &str) -> Result<(), FsError> {
        let path = RepoPath::parse(path)?;
        let (dir, _) = split(&path)?;
        debug!("delete_file: {} ({})", path, session.id);

        let _guard = self.lock_manager.acquire_write(&dir).await;
        self.delete_file_locked(session, &path, &dir)
    }

    fn delete_file_locked(
        &self,
        session: &Session,
        path: &RepoPath,
        dir: &RepoPath,
    ) -> Result<(), FsError> {
        let event = FileOperationEvent::new(OperationKind::Delete, path.clone(), session.id);
        let mut txn = self.store.begin()?;
        self.resolve_parent(txn.as_ref(), dir)?;

        let Some(node) = txn.resolve(path)? else {
            self.note(event.with_outcome(OperationOutcome::NotFound));
            return Err(FsError::FileNotFound);
        };
        let event = event.with_node(node);
        if txn.node(node)?.is_folder() {
            return Err(FsError::AccessDenied);
        }

        match txn.delete_node(node) {
            Ok(()) => self.commit(txn, &[event]),
            Err(StoreError::AccessDenied(id)) => {
                debug!("delete_file: node {} may not be deleted", id);
                self.note(event.with_outcome(OperationOutcome::Denied));
                Err(FsError::AccessDenied)
            }
            Err(e) => Err(e.into()),
        }
    }
}
