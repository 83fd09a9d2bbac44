use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

pub const NAME_MAX: usize = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid path component: {0:?}")]
    InvalidComponent(String),

    #[error("path component too long: {0}")]
    NameTooLong(String),
}

/// A share-relative path as seen over CIFS.
///
/// Components are stored with their original case; equality, ordering and
/// hashing are case-insensitive, matching how the share resolves names.
#[derive(Clone, Debug)]
pub struct RepoPath {
    components: Vec<String>,
}

impl RepoPath {
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Parse a path using either `\` or `/` as separator. Empty components are
    /// skipped, so `\a\\b\` and `a/b` are the same path.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let mut components = Vec::new();
        for part in raw.split(['\\', '/']) {
            if part.is_empty() {
                continue;
            }
            if part == "." || part == ".." {
                return Err(PathError::InvalidComponent(part.to_string()));
            }
            if part.len() > NAME_MAX {
                return Err(PathError::NameTooLong(part.to_string()));
            }
            components.push(part.to_string());
        }
        Ok(Self { components })
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn name(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<RepoPath> {
        if self.components.is_empty() {
            return None;
        }
        Some(Self {
            components: self.components[..self.components.len() - 1].to_vec(),
        })
    }

    pub fn join(&self, name: &str) -> RepoPath {
        let mut components = self.components.clone();
        components.push(name.to_string());
        Self { components }
    }

    /// Same directory, different final component.
    pub fn sibling(&self, name: &str) -> RepoPath {
        match self.parent() {
            Some(parent) => parent.join(name),
            None => RepoPath::root().join(name),
        }
    }

    /// Lower-cased canonical form, used as a map key.
    pub fn key(&self) -> String {
        let mut key = String::new();
        for component in &self.components {
            key.push('\\');
            key.push_str(&component.to_lowercase());
        }
        if key.is_empty() {
            key.push('\\');
        }
        key
    }

    pub fn same_dir(&self, other: &RepoPath) -> bool {
        self.parent() == other.parent()
    }
}

impl PartialEq for RepoPath {
    fn eq(&self, other: &Self) -> bool {
        self.components.len() == other.components.len()
            && self
                .components
                .iter()
                .zip(other.components.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b) || a.to_lowercase() == b.to_lowercase())
    }
}

impl Eq for RepoPath {}

impl Hash for RepoPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for RepoPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RepoPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "\\");
        }
        for component in &self.components {
            write!(f, "\\{component}")?;
        }
        Ok(())
    }
}

impl Serialize for RepoPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RepoPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RepoPath::parse(&raw).map_err(serde::de::Error::custom)
    }
}
