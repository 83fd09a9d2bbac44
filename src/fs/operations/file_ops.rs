use crate::fs::errors::FsError;
use crate::fs::handles::ClosedFile;
use crate::fs::types::{AccessMode, FileHandle, Session};
use crate::fs::{ShuffleDriver, rules, split};
use crate::path::RepoPath;
use crate::shuffle::{FileOperationEvent, OperationKind, OperationOutcome};
use crate::store::{NodeId, NodeKind};
use crate::store::node::{
    ASPECT_NO_CONTENT, ASPECT_TEMPORARY, ASPECT_VERSIONABLE, guess_mimetype,
};
use bytes::Bytes;
use tracing::debug;

impl ShuffleDriver {
    /// Create a new empty file and open it. The file counts as modified, so
    /// closing it without writes commits empty content.
    pub async fn create_file(
        &self,
        session: &Session,
        path: &str,
        access: AccessMode,
    ) -> Result<FileHandle, FsError> {
        let path = RepoPath::parse(path)?;
        let (dir, _) = split(&path)?;
        debug!("create_file: {} ({})", path, session.id);

        let _guard = self.lock_manager.acquire_write(&dir).await;
        self.create_file_locked(session, &path, &dir, access)
    }

    fn create_file_locked(
        &self,
        session: &Session,
        path: &RepoPath,
        dir: &RepoPath,
        access: AccessMode,
    ) -> Result<FileHandle, FsError> {
        let (_, name) = split(path)?;
        let mut txn = self.store.begin()?;
        let parent = self.resolve_parent(txn.as_ref(), dir)?;
        if txn.resolve(path)?.is_some() {
            self.note(
                FileOperationEvent::new(OperationKind::Create, path.clone(), session.id)
                    .with_access(access)
                    .with_outcome(OperationOutcome::NameCollision),
            );
            return Err(FsError::FileExists);
        }

        let node = txn.create_node(parent, name, NodeKind::File)?;
        txn.add_aspect(node, ASPECT_NO_CONTENT)?;
        if self.is_temp(name) {
            txn.add_aspect(node, ASPECT_TEMPORARY)?;
        }

        // registered before staging so a shuffle completed by this create
        // sees the pending write
        let handle = self
            .handles
            .open(node, access, session.id, || (Vec::new(), true));
        let event = FileOperationEvent::new(OperationKind::Create, path.clone(), session.id)
            .with_node(node)
            .with_access(access);
        if let Err(e) = self.commit(txn, &[event]) {
            let _ = self.handles.close(handle);
            return Err(e);
        }
        Ok(handle)
    }

    pub async fn open_file(
        &self,
        session: &Session,
        path: &str,
        access: AccessMode,
    ) -> Result<FileHandle, FsError> {
        let path = RepoPath::parse(path)?;
        let (dir, _) = split(&path)?;
        debug!("open_file: {} {:?} ({})", path, access, session.id);

        let _guard = self.lock_manager.acquire_write(&dir).await;
        self.open_file_locked(session, &path, &dir, access)
    }

    fn open_file_locked(
        &self,
        session: &Session,
        path: &RepoPath,
        dir: &RepoPath,
        access: AccessMode,
    ) -> Result<FileHandle, FsError> {
        let txn = self.store.begin()?;
        self.resolve_parent(txn.as_ref(), dir)?;
        let node = txn.resolve(path)?.ok_or(FsError::FileNotFound)?;
        if txn.node(node)?.is_folder() {
            return Err(FsError::InvalidArgument);
        }
        let content = txn.read_content(node)?;
        drop(txn);

        let handle = self.handles.open(node, access, session.id, || {
            (content.map(|b| b.to_vec()).unwrap_or_default(), false)
        });
        self.note(
            FileOperationEvent::new(OperationKind::Open, path.clone(), session.id)
                .with_node(node)
                .with_access(access),
        );
        Ok(handle)
    }

    /// Reads see the shared in-progress buffer and never wait on a writer.
    pub async fn read_file(
        &self,
        _session: &Session,
        handle: FileHandle,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, FsError> {
        self.handles.read(handle, offset, len)
    }

    pub async fn write_file(
        &self,
        session: &Session,
        handle: FileHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, FsError> {
        debug!(
            "write_file: {} bytes at offset {} via {:?} ({})",
            data.len(),
            offset,
            handle,
            session.id
        );
        self.handles.write(handle, offset, data)
    }

    pub async fn truncate_file(
        &self,
        session: &Session,
        handle: FileHandle,
        len: u64,
    ) -> Result<(), FsError> {
        debug!("truncate_file: {:?} to {} ({})", handle, len, session.id);
        self.handles.truncate(handle, len)
    }

    /// Close a handle. The last close of a node commits its buffer if it
    /// was modified, or deletes the node if delete-on-close was set.
    pub async fn close_file(&self, session: &Session, handle: FileHandle) -> Result<(), FsError> {
        loop {
            let node = self.handles.get(handle)?.node;
            let dir = self.parent_dir(node)?;
            debug!("close_file: {:?} on node {} ({})", handle, node, session.id);

            let _guard = self.lock_manager.acquire_write(&dir).await;
            // a rename or shuffle may have moved the file while we waited
            let now = self.handles.get(handle)?.node;
            if now == node && self.parent_dir(now)?.key() == dir.key() {
                return self.close_file_locked(session, handle);
            }
            debug!("close_file: node {} left {} before the lock was taken", node, dir);
        }
    }

    fn parent_dir(&self, node: NodeId) -> Result<RepoPath, FsError> {
        Ok(self
            .current_path(node)?
            .and_then(|p| p.parent())
            .unwrap_or_else(RepoPath::root))
    }

    /// The handle stays open until the transaction commits, so a failed
    /// close can be retried with the buffer intact.
    fn close_file_locked(&self, session: &Session, handle: FileHandle) -> Result<(), FsError> {
        let open = self.handles.get(handle)?;
        let closed = self.handles.closing(handle)?;

        let mut txn = self.store.begin()?;
        if !txn.exists(open.node) {
            debug!("close_file: node {} is gone", open.node);
            self.handles.close(handle)?;
            return Ok(());
        }
        let path = txn.path_of(open.node)?;
        let mut events = vec![
            FileOperationEvent::new(OperationKind::Close, path.clone(), session.id)
                .with_node(open.node)
                .with_access(open.access),
        ];

        match closed {
            None => {}
            Some(ClosedFile { node, state }) if state.delete_on_close => {
                debug!("close_file: delete-on-close of {} (node {})", path, node);
                txn.delete_node(node)?;
                events.push(
                    FileOperationEvent::new(OperationKind::Delete, path, session.id)
                        .with_node(node),
                );
            }
            Some(ClosedFile { node, state }) if state.modified => {
                let mimetype = guess_mimetype(path.name().unwrap_or_default());
                let size = state.buffer.len();
                txn.write_content(node, Bytes::from(state.buffer), mimetype)?;
                txn.remove_aspect(node, ASPECT_NO_CONTENT)?;
                rules::run_rules(&self.rules, txn.as_mut(), node)?;
                if txn.has_aspect(node, ASPECT_VERSIONABLE)?
                    && !txn.has_aspect(node, ASPECT_TEMPORARY)?
                {
                    let label = txn.create_version(node)?;
                    debug!("close_file: node {} versioned as {}", node, label);
                }
                debug!("close_file: committed {} bytes to {}", size, path);
            }
            Some(_) => {}
        }

        self.commit(txn, &events)?;
        self.handles.close(handle)?;
        Ok(())
    }
}
