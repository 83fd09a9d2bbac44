use crate::fs::types::{AccessMode, SessionId};
use crate::path::RepoPath;
use crate::store::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Rename,
    Delete,
    Open,
    Close,
    SetInfo,
    Write,
}

impl OperationKind {
    /// Kinds that never change which node owns a name.
    pub fn is_transparent(self) -> bool {
        matches!(
            self,
            OperationKind::Open | OperationKind::Close | OperationKind::SetInfo | OperationKind::Write
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationOutcome {
    Succeeded,
    NameCollision,
    NotFound,
    Denied,
}

/// One protocol-level operation as seen by the matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOperationEvent {
    pub kind: OperationKind,
    pub path: RepoPath,
    /// Destination of a rename.
    pub to_path: Option<RepoPath>,
    /// The node the operation acted on: the created node, the renamed
    /// source, the deleted node.
    pub node: Option<NodeId>,
    pub session: SessionId,
    pub access: Option<AccessMode>,
    pub outcome: OperationOutcome,
    pub at: DateTime<Utc>,
}

impl FileOperationEvent {
    pub fn new(kind: OperationKind, path: RepoPath, session: SessionId) -> Self {
        Self {
            kind,
            path,
            to_path: None,
            node: None,
            session,
            access: None,
            outcome: OperationOutcome::Succeeded,
            at: Utc::now(),
        }
    }

    pub fn rename(from: RepoPath, to: RepoPath, session: SessionId) -> Self {
        let mut event = Self::new(OperationKind::Rename, from, session);
        event.to_path = Some(to);
        event
    }

    pub fn with_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_access(mut self, access: AccessMode) -> Self {
        self.access = Some(access);
        self
    }

    pub fn with_outcome(mut self, outcome: OperationOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == OperationOutcome::Succeeded
    }

    pub fn name(&self) -> &str {
        self.path.name().unwrap_or("")
    }

    pub fn to_name(&self) -> Option<&str> {
        self.to_path.as_ref().and_then(|p| p.name())
    }

    /// Directory whose window receives this event.
    pub fn directory(&self) -> RepoPath {
        self.path.parent().unwrap_or_else(RepoPath::root)
    }

    /// A rename whose source and destination share a directory.
    pub fn is_local_rename(&self) -> bool {
        self.kind == OperationKind::Rename
            && self
                .to_path
                .as_ref()
                .map(|to| to.same_dir(&self.path))
                .unwrap_or(false)
    }

    /// Names in this event's directory that the event refers to.
    pub fn names(&self) -> Vec<&str> {
        let mut names = vec![self.name()];
        if let Some(to) = &self.to_path
            && to.same_dir(&self.path)
            && let Some(name) = to.name()
        {
            names.push(name);
        }
        names
    }
}
