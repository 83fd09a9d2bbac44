use super::errors::FsError;
use super::types::{AccessMode, FileHandle, SessionId};
use crate::store::NodeId;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Largest in-progress buffer a handle may grow to.
pub const MAX_FILE_SIZE: u64 = 4 << 30;

/// End offset of a write, refused when it would pass `MAX_FILE_SIZE`.
fn checked_end(offset: u64, len: usize) -> Result<usize, FsError> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(FsError::FileTooLarge)?;
    if end > MAX_FILE_SIZE {
        return Err(FsError::FileTooLarge);
    }
    usize::try_from(end).map_err(|_| FsError::FileTooLarge)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenHandle {
    pub node: NodeId,
    pub access: AccessMode,
    pub session: SessionId,
}

/// State shared by every handle open on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenFileState {
    pub buffer: Vec<u8>,
    pub modified: bool,
    pub open_count: usize,
    pub delete_on_close: bool,
}

/// What the last close of a node leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedFile {
    pub node: NodeId,
    pub state: OpenFileState,
}

pub struct HandleTable {
    next_handle: AtomicU64,
    handles: DashMap<FileHandle, OpenHandle>,
    open: DashMap<NodeId, OpenFileState>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            handles: DashMap::new(),
            open: DashMap::new(),
        }
    }

    /// Register a handle on `node`. `load` supplies the buffer when this is
    /// the first handle on the node.
    pub fn open<F>(&self, node: NodeId, access: AccessMode, session: SessionId, load: F) -> FileHandle
    where
        F: FnOnce() -> (Vec<u8>, bool),
    {
        let handle = FileHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut state = self.open.entry(node).or_insert_with(|| {
            let (buffer, modified) = load();
            OpenFileState {
                buffer,
                modified,
                ..Default::default()
            }
        });
        state.open_count += 1;
        drop(state);

        self.handles.insert(
            handle,
            OpenHandle {
                node,
                access,
                session,
            },
        );
        handle
    }

    pub fn get(&self, handle: FileHandle) -> Result<OpenHandle, FsError> {
        self.handles
            .get(&handle)
            .map(|h| *h)
            .ok_or(FsError::InvalidHandle)
    }

    pub fn read(&self, handle: FileHandle, offset: u64, len: usize) -> Result<Bytes, FsError> {
        let open = self.get(handle)?;
        let state = self.open.get(&open.node).ok_or(FsError::InvalidHandle)?;
        let start = (offset as usize).min(state.buffer.len());
        let end = start.saturating_add(len).min(state.buffer.len());
        Ok(Bytes::copy_from_slice(&state.buffer[start..end]))
    }

    /// Returns the in-progress length after the write.
    pub fn write(&self, handle: FileHandle, offset: u64, data: &[u8]) -> Result<u64, FsError> {
        let open = self.get(handle)?;
        if open.access == AccessMode::ReadOnly {
            return Err(FsError::AccessDenied);
        }
        let mut state = self
            .open
            .get_mut(&open.node)
            .ok_or(FsError::InvalidHandle)?;
        let end = checked_end(offset, data.len())?;
        let offset = end - data.len();
        if state.buffer.len() < end {
            state.buffer.resize(end, 0);
        }
        state.buffer[offset..end].copy_from_slice(data);
        state.modified = true;
        Ok(state.buffer.len() as u64)
    }

    pub fn truncate(&self, handle: FileHandle, len: u64) -> Result<(), FsError> {
        let open = self.get(handle)?;
        if open.access == AccessMode::ReadOnly {
            return Err(FsError::AccessDenied);
        }
        let mut state = self
            .open
            .get_mut(&open.node)
            .ok_or(FsError::InvalidHandle)?;
        let len = checked_end(len, 0)?;
        if state.buffer.len() != len {
            state.buffer.resize(len, 0);
            state.modified = true;
        }
        Ok(())
    }

    /// What `close` would hand back for `handle`, without closing it. The
    /// driver persists this first and only closes once the commit succeeded.
    pub fn closing(&self, handle: FileHandle) -> Result<Option<ClosedFile>, FsError> {
        let open = self.get(handle)?;
        Ok(self
            .open
            .get(&open.node)
            .filter(|state| state.open_count <= 1)
            .map(|state| ClosedFile {
                node: open.node,
                state: state.clone(),
            }))
    }

    /// Drop `handle`. Returns the node's state when this was its last handle.
    pub fn close(&self, handle: FileHandle) -> Result<Option<ClosedFile>, FsError> {
        let (_, open) = self.handles.remove(&handle).ok_or(FsError::InvalidHandle)?;
        let last = match self.open.get_mut(&open.node) {
            Some(mut state) => {
                state.open_count = state.open_count.saturating_sub(1);
                state.open_count == 0
            }
            None => return Ok(None),
        };
        if !last {
            return Ok(None);
        }
        Ok(self
            .open
            .remove_if(&open.node, |_, state| state.open_count == 0)
            .map(|(node, state)| ClosedFile { node, state }))
    }

    pub fn set_delete_on_close(&self, node: NodeId, delete: bool) -> Result<(), FsError> {
        let mut state = self.open.get_mut(&node).ok_or(FsError::InvalidArgument)?;
        state.delete_on_close = delete;
        Ok(())
    }

    /// Length of unflushed writes on `node`, if any.
    pub fn in_progress_len(&self, node: NodeId) -> Option<u64> {
        self.open
            .get(&node)
            .filter(|state| state.modified)
            .map(|state| state.buffer.len() as u64)
    }

    pub fn has_pending_write(&self, node: NodeId) -> bool {
        self.in_progress_len(node).is_some()
    }

    pub fn is_open(&self, node: NodeId) -> bool {
        self.open.contains_key(&node)
    }

    /// Point everything open on `from` at `to`. Used when a shuffle hands
    /// the identity of `from` over to `to`.
    pub fn redirect(&self, from: NodeId, to: NodeId) {
        if from == to {
            return;
        }
        let Some((_, moved)) = self.open.remove(&from) else {
            return;
        };
        match self.open.get_mut(&to) {
            Some(mut existing) => {
                existing.open_count += moved.open_count;
                if moved.modified {
                    existing.buffer = moved.buffer;
                    existing.modified = true;
                }
                existing.delete_on_close |= moved.delete_on_close;
            }
            None => {
                self.open.insert(to, moved);
            }
        }
        for mut handle in self.handles.iter_mut() {
            if handle.node == from {
                handle.node = to;
            }
        }
    }

    pub fn open_count(&self) -> usize {
        self.handles.len()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: SessionId = SessionId(7);

    #[test]
    fn test_shared_buffer_across_handles() {
        let table = HandleTable::new();
        let writer = table.open(10, AccessMode::ReadWrite, SESSION, || (b"old".to_vec(), false));
        let reader = table.open(10, AccessMode::ReadOnly, SESSION, || unreachable!());

        assert_eq!(table.in_progress_len(10), None);
        assert_eq!(table.write(writer, 0, b"hello world").unwrap(), 11);
        assert_eq!(table.in_progress_len(10), Some(11));
        assert_eq!(&table.read(reader, 6, 100).unwrap()[..], b"world");
    }

    #[test]
    fn test_read_only_handle_cannot_write() {
        let table = HandleTable::new();
        let handle = table.open(3, AccessMode::ReadOnly, SESSION, || (Vec::new(), false));
        assert_eq!(table.write(handle, 0, b"x"), Err(FsError::AccessDenied));
        assert_eq!(table.truncate(handle, 0), Err(FsError::AccessDenied));
    }

    #[test]
    fn test_last_close_returns_state() {
        let table = HandleTable::new();
        let a = table.open(5, AccessMode::ReadWrite, SESSION, || (Vec::new(), true));
        let b = table.open(5, AccessMode::ReadWrite, SESSION, || unreachable!());

        assert_eq!(table.close(a).unwrap(), None);
        let closed = table.close(b).unwrap().unwrap();
        assert_eq!(closed.node, 5);
        assert!(closed.state.modified);
        assert!(!table.is_open(5));
        assert_eq!(table.close(b), Err(FsError::InvalidHandle));
    }

    #[test]
    fn test_truncate_same_length_is_not_a_modification() {
        let table = HandleTable::new();
        let handle = table.open(8, AccessMode::ReadWrite, SESSION, || (b"abc".to_vec(), false));
        table.truncate(handle, 3).unwrap();
        assert!(!table.has_pending_write(8));
        table.truncate(handle, 0).unwrap();
        assert_eq!(table.in_progress_len(8), Some(0));
    }

    #[test]
    fn test_redirect_moves_handles_and_buffer() {
        let table = HandleTable::new();
        let handle = table.open(20, AccessMode::ReadWrite, SESSION, || (Vec::new(), true));
        table.write(handle, 0, b"new bytes").unwrap();

        table.redirect(20, 4);

        assert_eq!(table.get(handle).unwrap().node, 4);
        assert_eq!(table.in_progress_len(4), Some(9));
        assert!(!table.is_open(20));
        let closed = table.close(handle).unwrap().unwrap();
        assert_eq!(closed.node, 4);
        assert_eq!(closed.state.buffer, b"new bytes");
    }

    #[test]
    fn test_delete_on_close_requires_open_state() {
        let table = HandleTable::new();
        assert_eq!(table.set_delete_on_close(1, true), Err(FsError::InvalidArgument));
        let handle = table.open(1, AccessMode::ReadWrite, SESSION, || (Vec::new(), false));
        table.set_delete_on_close(1, true).unwrap();
        assert!(table.close(handle).unwrap().unwrap().state.delete_on_close);
    }

    #[test]
    fn test_write_past_size_limit_is_refused() {
        let table = HandleTable::new();
        let handle = table.open(9, AccessMode::ReadWrite, SESSION, || (b"keep".to_vec(), false));

        assert_eq!(table.write(handle, u64::MAX - 1, b"abc"), Err(FsError::FileTooLarge));
        assert_eq!(table.write(handle, MAX_FILE_SIZE, b"x"), Err(FsError::FileTooLarge));
        assert_eq!(table.truncate(handle, u64::MAX), Err(FsError::FileTooLarge));
        assert_eq!(table.truncate(handle, MAX_FILE_SIZE + 1), Err(FsError::FileTooLarge));

        assert!(!table.has_pending_write(9));
        assert_eq!(&table.read(handle, 0, 16).unwrap()[..], b"keep");
    }

    #[test]
    fn test_write_ending_at_size_limit_is_accepted_by_bounds_check() {
        assert_eq!(checked_end(MAX_FILE_SIZE - 3, 3), Ok(MAX_FILE_SIZE as usize));
        assert_eq!(checked_end(0, 0), Ok(0));
        assert_eq!(checked_end(MAX_FILE_SIZE, 1), Err(FsError::FileTooLarge));
    }

    #[test]
    fn test_closing_leaves_handle_open() {
        let table = HandleTable::new();
        let a = table.open(6, AccessMode::ReadWrite, SESSION, || (Vec::new(), false));
        let b = table.open(6, AccessMode::ReadWrite, SESSION, || unreachable!());

        assert_eq!(table.closing(a).unwrap(), None);
        table.close(a).unwrap();
        table.write(b, 0, b"data").unwrap();

        let snapshot = table.closing(b).unwrap().unwrap();
        assert_eq!(snapshot.state.buffer, b"data");
        assert!(table.is_open(6));
        assert_eq!(table.get(b).unwrap().node, 6);

        assert_eq!(table.close(b).unwrap(), Some(snapshot));
        assert_eq!(table.closing(b), Err(FsError::InvalidHandle));
    }
}
