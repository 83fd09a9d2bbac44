use crate::store::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub user: String,
}

impl Session {
    pub fn new(id: u64, user: &str) -> Self {
        Self {
            id: SessionId(id),
            user: user.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    NotExist,
    FileExists,
    DirectoryExists,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub node: NodeId,
    pub name: String,
    /// In-progress length while the file is open and modified.
    pub size: u64,
    pub is_folder: bool,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

/// Fields a client may change through set-file-information. `None` leaves a
/// field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetFileInfo {
    pub delete_on_close: Option<bool>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl SetFileInfo {
    pub fn delete_on_close() -> Self {
        Self {
            delete_on_close: Some(true),
            ..Default::default()
        }
    }
}
