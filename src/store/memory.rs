use super::node::{
    ASPECT_UNDELETABLE, ContentData, NodeId, NodeKind, NodeRecord, PROP_CREATED, PROP_MODIFIED,
    PROP_VERSION_LABEL, Properties, PropertyValue, ROOT_NODE_ID, VersionRecord,
    next_version_label,
};
use super::{NodeStore, NodeTransaction, StoreError};
use crate::path::RepoPath;
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Clone)]
struct StoreState {
    next_id: NodeId,
    nodes: HashMap<NodeId, NodeRecord>,
    /// parent -> lower-cased name -> child
    children: HashMap<NodeId, BTreeMap<String, NodeId>>,
    archived: BTreeSet<NodeId>,
    content: HashMap<String, Bytes>,
}

impl StoreState {
    fn new() -> Self {
        let now = Utc::now();
        let mut properties = Properties::new();
        properties.insert(PROP_CREATED.to_string(), PropertyValue::DateTime(now));
        properties.insert(PROP_MODIFIED.to_string(), PropertyValue::DateTime(now));

        let root = NodeRecord {
            id: ROOT_NODE_ID,
            kind: NodeKind::Folder,
            parent: None,
            name: String::new(),
            properties,
            aspects: BTreeSet::new(),
            content: None,
            versions: Vec::new(),
        };

        let mut nodes = HashMap::new();
        nodes.insert(ROOT_NODE_ID, root);
        let mut children = HashMap::new();
        children.insert(ROOT_NODE_ID, BTreeMap::new());

        Self {
            next_id: ROOT_NODE_ID + 1,
            nodes,
            children,
            archived: BTreeSet::new(),
            content: HashMap::new(),
        }
    }

    fn live(&self, id: NodeId) -> Result<&NodeRecord, StoreError> {
        if self.archived.contains(&id) {
            return Err(StoreError::NodeNotFound(id));
        }
        self.nodes.get(&id).ok_or(StoreError::NodeNotFound(id))
    }

    fn live_mut(&mut self, id: NodeId) -> Result<&mut NodeRecord, StoreError> {
        if self.archived.contains(&id) {
            return Err(StoreError::NodeNotFound(id));
        }
        self.nodes.get_mut(&id).ok_or(StoreError::NodeNotFound(id))
    }

    fn folder(&self, id: NodeId) -> Result<&NodeRecord, StoreError> {
        let node = self.live(id)?;
        if !node.is_folder() {
            return Err(StoreError::ParentNotFolder(id));
        }
        Ok(node)
    }

    fn check_name_free(&self, parent: NodeId, name: &str) -> Result<(), StoreError> {
        let taken = self
            .children
            .get(&parent)
            .map(|entries| entries.contains_key(&name.to_lowercase()))
            .unwrap_or(false);
        if taken {
            return Err(StoreError::NameExists(name.to_string()));
        }
        Ok(())
    }

    fn detach(&mut self, id: NodeId) {
        let (parent, name) = match self.nodes.get(&id) {
            Some(node) => (node.parent, node.name.to_lowercase()),
            None => return,
        };
        if let Some(parent) = parent
            && let Some(entries) = self.children.get_mut(&parent)
            && entries.get(&name) == Some(&id)
        {
            entries.remove(&name);
        }
    }

    fn attach(&mut self, id: NodeId, parent: NodeId, name: &str) {
        self.children
            .entry(parent)
            .or_default()
            .insert(name.to_lowercase(), id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(parent);
            node.name = name.to_string();
        }
    }

    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            if let Some(entries) = self.children.get(&out[i]) {
                out.extend(entries.values().copied());
            }
            i += 1;
        }
        out
    }
}

/// In-process node store.
///
/// A transaction owns the store mutex for its whole lifetime and mutates a
/// private copy of the state, which replaces the shared state on commit.
/// This gives serializable, all-or-nothing transactions.
pub struct MemoryNodeStore {
    state: Mutex<StoreState>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::new()),
        }
    }

    /// Number of distinct content blobs held by the content store.
    pub fn content_blob_count(&self) -> usize {
        self.state.lock().map(|s| s.content.len()).unwrap_or(0)
    }
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore for MemoryNodeStore {
    fn begin(&self) -> Result<Box<dyn NodeTransaction + '_>, StoreError> {
        let guard = self
            .state
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("state lock poisoned: {e}")))?;
        let work = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, work }))
    }
}

struct MemoryTransaction<'a> {
    guard: MutexGuard<'a, StoreState>,
    work: StoreState,
}

fn content_url(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("store://{digest:x}")
}

impl NodeTransaction for MemoryTransaction<'_> {
    fn root(&self) -> NodeId {
        ROOT_NODE_ID
    }

    fn resolve(&self, path: &RepoPath) -> Result<Option<NodeId>, StoreError> {
        let mut current = ROOT_NODE_ID;
        for component in path.components() {
            let next = self
                .work
                .children
                .get(&current)
                .and_then(|entries| entries.get(&component.to_lowercase()))
                .copied();
            match next {
                Some(id) => current = id,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn node(&self, id: NodeId) -> Result<NodeRecord, StoreError> {
        self.work
            .nodes
            .get(&id)
            .cloned()
            .ok_or(StoreError::NodeNotFound(id))
    }

    fn exists(&self, id: NodeId) -> bool {
        self.work.live(id).is_ok()
    }

    fn path_of(&self, id: NodeId) -> Result<RepoPath, StoreError> {
        let mut names = Vec::new();
        let mut current = id;
        while current != ROOT_NODE_ID {
            let node = self.work.live(current)?;
            names.push(node.name.clone());
            current = node.parent.ok_or(StoreError::NodeNotFound(current))?;
        }
        let mut path = RepoPath::root();
        for name in names.iter().rev() {
            path = path.join(name);
        }
        Ok(path)
    }

    fn children(&self, id: NodeId) -> Result<Vec<NodeId>, StoreError> {
        self.work.folder(id)?;
        Ok(self
            .work
            .children
            .get(&id)
            .map(|entries| entries.values().copied().collect())
            .unwrap_or_default())
    }

    fn create_node(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
    ) -> Result<NodeId, StoreError> {
        self.work.folder(parent)?;
        self.work.check_name_free(parent, name)?;

        let id = self.work.next_id;
        self.work.next_id += 1;

        let now = Utc::now();
        let mut properties = Properties::new();
        properties.insert(PROP_CREATED.to_string(), PropertyValue::DateTime(now));
        properties.insert(PROP_MODIFIED.to_string(), PropertyValue::DateTime(now));

        self.work.nodes.insert(
            id,
            NodeRecord {
                id,
                kind,
                parent: Some(parent),
                name: name.to_string(),
                properties,
                aspects: BTreeSet::new(),
                content: None,
                versions: Vec::new(),
            },
        );
        if kind == NodeKind::Folder {
            self.work.children.insert(id, BTreeMap::new());
        }
        self.work.attach(id, parent, name);
        debug!("create_node: id={} parent={} name={}", id, parent, name);
        Ok(id)
    }

    fn set_property(
        &mut self,
        id: NodeId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), StoreError> {
        self.work
            .live_mut(id)?
            .properties
            .insert(key.to_string(), value);
        Ok(())
    }

    fn remove_property(&mut self, id: NodeId, key: &str) -> Result<(), StoreError> {
        self.work.live_mut(id)?.properties.remove(key);
        Ok(())
    }

    fn set_properties(&mut self, id: NodeId, properties: Properties) -> Result<(), StoreError> {
        self.work.live_mut(id)?.properties = properties;
        Ok(())
    }

    fn add_aspect(&mut self, id: NodeId, aspect: &str) -> Result<(), StoreError> {
        self.work.live_mut(id)?.aspects.insert(aspect.to_string());
        Ok(())
    }

    fn remove_aspect(&mut self, id: NodeId, aspect: &str) -> Result<(), StoreError> {
        self.work.live_mut(id)?.aspects.remove(aspect);
        Ok(())
    }

    fn write_content(
        &mut self,
        id: NodeId,
        data: Bytes,
        mimetype: &str,
    ) -> Result<ContentData, StoreError> {
        self.work.live(id)?;
        let url = content_url(&data);
        let content = ContentData {
            content_url: url.clone(),
            size: data.len() as u64,
            mimetype: mimetype.to_string(),
        };
        self.work.content.entry(url).or_insert(data);

        let node = self.work.live_mut(id)?;
        node.content = Some(content.clone());
        node.properties.insert(
            PROP_MODIFIED.to_string(),
            PropertyValue::DateTime(Utc::now()),
        );
        Ok(content)
    }

    fn set_content(
        &mut self,
        id: NodeId,
        content: Option<ContentData>,
    ) -> Result<(), StoreError> {
        self.work.live_mut(id)?.content = content;
        Ok(())
    }

    fn read_content(&self, id: NodeId) -> Result<Option<Bytes>, StoreError> {
        let node = self.work.live(id)?;
        Ok(node
            .content
            .as_ref()
            .and_then(|c| self.work.content.get(&c.content_url).cloned()))
    }

    fn move_node(&mut self, id: NodeId, parent: NodeId, name: &str) -> Result<(), StoreError> {
        self.work.live(id)?;
        self.work.folder(parent)?;

        let current = self
            .work
            .children
            .get(&parent)
            .and_then(|entries| entries.get(&name.to_lowercase()))
            .copied();
        match current {
            Some(existing) if existing != id => {
                return Err(StoreError::NameExists(name.to_string()));
            }
            _ => {}
        }

        self.work.detach(id);
        self.work.attach(id, parent, name);
        Ok(())
    }

    fn delete_node(&mut self, id: NodeId) -> Result<(), StoreError> {
        if id == ROOT_NODE_ID {
            return Err(StoreError::AccessDenied(id));
        }
        let subtree = self.work.subtree(id);
        for member in &subtree {
            if self.work.live(*member)?.has_aspect(ASPECT_UNDELETABLE) {
                return Err(StoreError::AccessDenied(*member));
            }
        }

        self.work.detach(id);
        for member in subtree {
            self.work.archived.insert(member);
        }
        debug!("delete_node: archived {}", id);
        Ok(())
    }

    fn restore_node(&mut self, id: NodeId, parent: NodeId, name: &str) -> Result<(), StoreError> {
        if !self.work.archived.contains(&id) {
            return Err(StoreError::NotArchived(id));
        }
        self.work.folder(parent)?;
        self.work.check_name_free(parent, name)?;

        for member in self.work.subtree(id) {
            self.work.archived.remove(&member);
        }
        self.work.attach(id, parent, name);
        debug!("restore_node: id={} parent={} name={}", id, parent, name);
        Ok(())
    }

    fn is_archived(&self, id: NodeId) -> bool {
        self.work.archived.contains(&id)
    }

    fn create_version(&mut self, id: NodeId) -> Result<String, StoreError> {
        let node = self.work.live_mut(id)?;
        let label = next_version_label(node.version_label());
        node.versions.push(VersionRecord {
            label: label.clone(),
            content: node.content.clone(),
            created_at: Utc::now(),
        });
        node.properties.insert(
            PROP_VERSION_LABEL.to_string(),
            PropertyValue::Text(label.clone()),
        );
        Ok(label)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::node::ASPECT_VERSIONABLE;

    fn path(raw: &str) -> RepoPath {
        RepoPath::parse(raw).unwrap()
    }

    #[test]
    fn test_create_and_resolve_case_insensitive() {
        let store = MemoryNodeStore::new();
        let mut txn = store.begin().unwrap();
        let dir = txn.create_node(ROOT_NODE_ID, "Docs", NodeKind::Folder).unwrap();
        let file = txn.create_node(dir, "Test.DOC", NodeKind::File).unwrap();
        txn.commit().unwrap();

        let txn = store.begin().unwrap();
        assert_eq!(txn.resolve(&path("\\docs\\test.doc")).unwrap(), Some(file));
        assert_eq!(txn.path_of(file).unwrap().to_string(), "\\Docs\\Test.DOC");
        assert!(txn.node(file).unwrap().content.is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let store = MemoryNodeStore::new();
        let mut txn = store.begin().unwrap();
        txn.create_node(ROOT_NODE_ID, "a.txt", NodeKind::File).unwrap();
        assert_eq!(
            txn.create_node(ROOT_NODE_ID, "A.TXT", NodeKind::File),
            Err(StoreError::NameExists("A.TXT".to_string()))
        );
    }

    #[test]
    fn test_rollback_on_drop() {
        let store = MemoryNodeStore::new();
        {
            let mut txn = store.begin().unwrap();
            txn.create_node(ROOT_NODE_ID, "lost.txt", NodeKind::File).unwrap();
        }
        let txn = store.begin().unwrap();
        assert_eq!(txn.resolve(&path("\\lost.txt")).unwrap(), None);
    }

    #[test]
    fn test_content_is_deduplicated() {
        let store = MemoryNodeStore::new();
        let mut txn = store.begin().unwrap();
        let a = txn.create_node(ROOT_NODE_ID, "a", NodeKind::File).unwrap();
        let b = txn.create_node(ROOT_NODE_ID, "b", NodeKind::File).unwrap();
        let ca = txn
            .write_content(a, Bytes::from_static(b"same"), "text/plain")
            .unwrap();
        let cb = txn
            .write_content(b, Bytes::from_static(b"same"), "text/plain")
            .unwrap();
        txn.commit().unwrap();

        assert_eq!(ca.content_url, cb.content_url);
        assert_eq!(store.content_blob_count(), 1);
    }

    #[test]
    fn test_empty_content_is_distinct_from_none() {
        let store = MemoryNodeStore::new();
        let mut txn = store.begin().unwrap();
        let a = txn.create_node(ROOT_NODE_ID, "zero", NodeKind::File).unwrap();
        assert_eq!(txn.read_content(a).unwrap(), None);
        txn.write_content(a, Bytes::new(), "text/plain").unwrap();
        assert_eq!(txn.read_content(a).unwrap(), Some(Bytes::new()));
        assert_eq!(txn.node(a).unwrap().content.unwrap().size, 0);
    }

    #[test]
    fn test_delete_archives_and_restore_keeps_identity() {
        let store = MemoryNodeStore::new();
        let mut txn = store.begin().unwrap();
        let a = txn.create_node(ROOT_NODE_ID, "a.doc", NodeKind::File).unwrap();
        txn.set_property(a, "cm:title", "T".into()).unwrap();
        txn.delete_node(a).unwrap();
        assert!(txn.is_archived(a));
        assert!(!txn.exists(a));
        assert_eq!(txn.resolve(&path("\\a.doc")).unwrap(), None);

        txn.restore_node(a, ROOT_NODE_ID, "b.doc").unwrap();
        assert_eq!(txn.resolve(&path("\\b.doc")).unwrap(), Some(a));
        assert_eq!(
            txn.node(a).unwrap().properties.get("cm:title"),
            Some(&PropertyValue::Text("T".to_string()))
        );
    }

    #[test]
    fn test_undeletable_node_denies_delete() {
        let store = MemoryNodeStore::new();
        let mut txn = store.begin().unwrap();
        let dir = txn.create_node(ROOT_NODE_ID, "d", NodeKind::Folder).unwrap();
        let child = txn.create_node(dir, "c", NodeKind::File).unwrap();
        txn.add_aspect(child, ASPECT_UNDELETABLE).unwrap();
        assert_eq!(txn.delete_node(dir), Err(StoreError::AccessDenied(child)));
        assert!(txn.exists(dir));
    }

    #[test]
    fn test_move_onto_existing_name_fails() {
        let store = MemoryNodeStore::new();
        let mut txn = store.begin().unwrap();
        let a = txn.create_node(ROOT_NODE_ID, "a", NodeKind::File).unwrap();
        txn.create_node(ROOT_NODE_ID, "b", NodeKind::File).unwrap();
        assert!(matches!(
            txn.move_node(a, ROOT_NODE_ID, "b"),
            Err(StoreError::NameExists(_))
        ));
        txn.move_node(a, ROOT_NODE_ID, "A").unwrap();
        assert_eq!(txn.node(a).unwrap().name, "A");
    }

    #[test]
    fn test_versions() {
        let store = MemoryNodeStore::new();
        let mut txn = store.begin().unwrap();
        let a = txn.create_node(ROOT_NODE_ID, "v.txt", NodeKind::File).unwrap();
        txn.add_aspect(a, ASPECT_VERSIONABLE).unwrap();
        assert_eq!(txn.create_version(a).unwrap(), "1.0");
        txn.write_content(a, Bytes::from_static(b"v2"), "text/plain")
            .unwrap();
        assert_eq!(txn.create_version(a).unwrap(), "1.1");
        let node = txn.node(a).unwrap();
        assert_eq!(node.versions.len(), 2);
        assert!(node.versions[0].content.is_none());
        assert_eq!(node.versions[1].content.as_ref().unwrap().size, 2);
    }
}
