use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub type NodeId = u64;

pub const ROOT_NODE_ID: NodeId = 1;

pub const PROP_CREATED: &str = "cm:created";
pub const PROP_MODIFIED: &str = "cm:modified";
pub const PROP_TITLE: &str = "cm:title";
pub const PROP_VERSION_LABEL: &str = "cm:versionLabel";

pub const ASPECT_VERSIONABLE: &str = "cm:versionable";
pub const ASPECT_TEMPORARY: &str = "sys:temporary";
pub const ASPECT_NO_CONTENT: &str = "sys:noContent";
pub const ASPECT_UNDELETABLE: &str = "sys:undeletable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    DateTime(DateTime<Utc>),
    Text(String),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        PropertyValue::DateTime(value)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            PropertyValue::Text(v) => write!(f, "{v}"),
        }
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

/// Reference to immutable bytes in the content-addressed store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentData {
    pub content_url: String,
    pub size: u64,
    pub mimetype: String,
}

impl ContentData {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub label: String,
    pub content: Option<ContentData>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub name: String,
    pub properties: Properties,
    pub aspects: BTreeSet<String>,
    /// `None` means no content has been written yet, which is not the same
    /// as empty content.
    pub content: Option<ContentData>,
    pub versions: Vec<VersionRecord>,
}

impl NodeRecord {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    pub fn has_aspect(&self, aspect: &str) -> bool {
        self.aspects.contains(aspect)
    }

    pub fn size(&self) -> u64 {
        self.content.as_ref().map(|c| c.size).unwrap_or(0)
    }

    pub fn version_label(&self) -> Option<&str> {
        self.versions.last().map(|v| v.label.as_str())
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        match self.properties.get(PROP_CREATED) {
            Some(PropertyValue::DateTime(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        match self.properties.get(PROP_MODIFIED) {
            Some(PropertyValue::DateTime(d)) => Some(*d),
            _ => None,
        }
    }
}

/// Next label in the `1.0`, `1.1`, ... sequence.
pub fn next_version_label(current: Option<&str>) -> String {
    let Some(current) = current else {
        return "1.0".to_string();
    };
    let mut parts = current.splitn(2, '.');
    let major = parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(1);
    let minor = parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);
    format!("{}.{}", major, minor + 1)
}

pub fn guess_mimetype(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match ext.as_str() {
        "txt" | "text" => "text/plain",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "key" => "application/vnd.apple.keynote",
        "rtf" => "application/rtf",
        "pdf" => "application/pdf",
        "fm" => "application/framemaker",
        "html" | "htm" => "text/html",
        "xml" => "text/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}
