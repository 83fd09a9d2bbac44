pub mod memory;
pub mod node;

pub use self::memory::MemoryNodeStore;
pub use self::node::{
    ContentData, NodeId, NodeKind, NodeRecord, Properties, PropertyValue, VersionRecord,
};

use crate::path::RepoPath;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("name already exists: {0}")]
    NameExists(String),

    #[error("parent {0} is not a folder")]
    ParentNotFolder(NodeId),

    #[error("access denied on node {0}")]
    AccessDenied(NodeId),

    #[error("node {0} is not archived")]
    NotArchived(NodeId),

    #[error("node store unavailable: {0}")]
    Unavailable(String),
}

/// The backing repository as seen by the driver.
///
/// Every read and mutation goes through a transaction. Dropping a
/// transaction without calling [`NodeTransaction::commit`] discards its
/// changes.
pub trait NodeStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn NodeTransaction + '_>, StoreError>;
}

pub trait NodeTransaction {
    fn root(&self) -> NodeId;

    /// Resolve a live (not archived) node by path.
    fn resolve(&self, path: &RepoPath) -> Result<Option<NodeId>, StoreError>;

    fn node(&self, id: NodeId) -> Result<NodeRecord, StoreError>;

    fn exists(&self, id: NodeId) -> bool;

    /// Current path of a live node.
    fn path_of(&self, id: NodeId) -> Result<RepoPath, StoreError>;

    fn children(&self, id: NodeId) -> Result<Vec<NodeId>, StoreError>;

    fn create_node(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
    ) -> Result<NodeId, StoreError>;

    fn set_property(
        &mut self,
        id: NodeId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), StoreError>;

    fn remove_property(&mut self, id: NodeId, key: &str) -> Result<(), StoreError>;

    /// Replace the full property map.
    fn set_properties(&mut self, id: NodeId, properties: Properties) -> Result<(), StoreError>;

    fn add_aspect(&mut self, id: NodeId, aspect: &str) -> Result<(), StoreError>;

    fn remove_aspect(&mut self, id: NodeId, aspect: &str) -> Result<(), StoreError>;

    fn has_aspect(&self, id: NodeId, aspect: &str) -> Result<bool, StoreError> {
        Ok(self.node(id)?.has_aspect(aspect))
    }

    /// Store bytes in the content store and point the node at them.
    fn write_content(
        &mut self,
        id: NodeId,
        data: Bytes,
        mimetype: &str,
    ) -> Result<ContentData, StoreError>;

    /// Point the node at existing content (or at none).
    fn set_content(&mut self, id: NodeId, content: Option<ContentData>)
    -> Result<(), StoreError>;

    fn read_content(&self, id: NodeId) -> Result<Option<Bytes>, StoreError>;

    fn move_node(&mut self, id: NodeId, parent: NodeId, name: &str) -> Result<(), StoreError>;

    /// Archive the node (and its subtree). Archived nodes keep their identity
    /// and can be restored.
    fn delete_node(&mut self, id: NodeId) -> Result<(), StoreError>;

    fn restore_node(&mut self, id: NodeId, parent: NodeId, name: &str) -> Result<(), StoreError>;

    fn is_archived(&self, id: NodeId) -> bool;

    /// Snapshot the current content as a new version. Returns the label.
    fn create_version(&mut self, id: NodeId) -> Result<String, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
