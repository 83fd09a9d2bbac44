use crate::fs::errors::FsError;
use crate::fs::types::Session;
use crate::fs::{ShuffleDriver, split};
use crate::path::RepoPath;
use crate::shuffle::{FileOperationEvent, OperationKind, OperationOutcome};
use crate::store::node::ASPECT_TEMPORARY;
use tracing::debug;

impl ShuffleDriver {
    pub async fn rename_file(&self, session: &Session, from: &str, to: &str) -> Result<(), FsError> {
        let from = RepoPath::parse(from)?;
        let to = RepoPath::parse(to)?;
        let (from_dir, from_name) = split(&from)?;
        let (to_dir, to_name) = split(&to)?;

        if from_dir == to_dir && from_name == to_name {
            return Ok(());
        }

        debug!(
            "rename_file: from_dir={}, from_name={}, to_dir={}, to_name={} ({})",
            from_dir, from_name, to_dir, to_name, session.id
        );

        let _guards = self
            .lock_manager
            .acquire_multiple_write(&[from_dir.clone(), to_dir.clone()])
            .await;
        self.rename_file_locked(session, &from, &to, &to_dir)
    }

    fn rename_file_locked(
        &self,
        session: &Session,
        from: &RepoPath,
        to: &RepoPath,
        to_dir: &RepoPath,
    ) -> Result<(), FsError> {
        let event = FileOperationEvent::rename(from.clone(), to.clone(), session.id);
        let mut txn = self.store.begin()?;

        let Some(source) = txn.resolve(from)? else {
            self.note(event.with_outcome(OperationOutcome::NotFound));
            return Err(FsError::FileNotFound);
        };
        let event = event.with_node(source);
        let to_parent = self.resolve_parent(txn.as_ref(), to_dir)?;

        if let Some(existing) = txn.resolve(to)?
            && existing != source
        {
            debug!("rename_file: {} already exists (node {})", to, existing);
            self.note(event.with_outcome(OperationOutcome::NameCollision));
            return Err(FsError::FileExists);
        }

        let (_, from_name) = split(from)?;
        let (_, to_name) = split(to)?;
        txn.move_node(source, to_parent, to_name)?;

        if !txn.node(source)?.is_folder() {
            if self.is_temp(to_name) {
                txn.add_aspect(source, ASPECT_TEMPORARY)?;
            } else if self.is_temp(from_name) {
                txn.remove_aspect(source, ASPECT_TEMPORARY)?;
            }
        }

        let mut events = vec![event];
        if !from.same_dir(to) {
            // the destination directory sees the node arrive
            events.push(
                FileOperationEvent::new(OperationKind::Create, to.clone(), session.id)
                    .with_node(source),
            );
        }
        self.commit(txn, &events)
    }
}
