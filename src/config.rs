use crate::fs::AddAspectRule;
use crate::joblock::DEFAULT_LOCK_PREFIX;
use crate::path::RepoPath;
use crate::shuffle::{DEFAULT_RENAME_TIMEOUT, DEFAULT_WINDOW_SIZE, ShuffleConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid rule {name}: {reason}")]
    Rule { name: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub shuffle: ShuffleSettings,
    pub job_lock: JobLockSettings,
    pub feed: FeedSettings,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShuffleSettings {
    pub window_size: usize,
    pub rename_timeout_ms: u64,
    pub temp_suffixes: Vec<String>,
}

impl Default for ShuffleSettings {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            rename_timeout_ms: DEFAULT_RENAME_TIMEOUT.as_millis() as u64,
            temp_suffixes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobLockSettings {
    pub node_id: Option<String>,
    pub prefix: String,
    pub ttl_secs: u64,
}

impl Default for JobLockSettings {
    fn default() -> Self {
        Self {
            node_id: None,
            prefix: DEFAULT_LOCK_PREFIX.to_string(),
            ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedSettings {
    pub generator_lock: String,
    pub notifier_lock: String,
    pub batch_size: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            generator_lock: "activity-feed-generator".to_string(),
            notifier_lock: "activity-feed-notifier".to_string(),
            batch_size: 500,
        }
    }
}

/// An inbound rule: files committed under `folder` get `aspect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSettings {
    pub name: String,
    pub folder: String,
    pub aspect: String,
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn shuffle_config(&self) -> ShuffleConfig {
        ShuffleConfig {
            window_size: self.shuffle.window_size.max(1),
            rename_timeout: Duration::from_millis(self.shuffle.rename_timeout_ms),
            temp_suffixes: self
                .shuffle
                .temp_suffixes
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.job_lock.ttl_secs.max(1))
    }

    pub fn node_id(&self) -> String {
        self.job_lock
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4()))
    }

    pub fn inbound_rules(&self) -> Result<Vec<AddAspectRule>, ConfigError> {
        self.rules
            .iter()
            .map(|rule| {
                let folder = RepoPath::parse(&rule.folder).map_err(|e| ConfigError::Rule {
                    name: rule.name.clone(),
                    reason: e.to_string(),
                })?;
                Ok(AddAspectRule::new(&rule.name, folder, &rule.aspect))
            })
            .collect()
    }
}

/// Commented default configuration written by `shufflefs init`.
pub fn default_config_toml() -> String {
    let defaults = Settings::default();
    format!(
        r#"# shufflefs configuration

[shuffle]
# Operations and in-flight sequences remembered per directory.
window_size = {window_size}
# How long an unfinished save sequence stays plausible.
rename_timeout_ms = {rename_timeout_ms}
# Extra name suffixes treated as temporary files, e.g. [".swp"].
temp_suffixes = []

[job_lock]
# Identity written into lock records. A random id is used when unset.
# node_id = "worker-1"
prefix = "{prefix}"
ttl_secs = {ttl_secs}

[feed]
generator_lock = "{generator_lock}"
notifier_lock = "{notifier_lock}"
batch_size = {batch_size}

# Files committed under `folder` get `aspect`.
# [[rules]]
# name = "versioning"
# folder = "\\Shared\\Documents"
# aspect = "cm:versionable"
"#,
        window_size = defaults.shuffle.window_size,
        rename_timeout_ms = defaults.shuffle.rename_timeout_ms,
        prefix = defaults.job_lock.prefix,
        ttl_secs = defaults.job_lock.ttl_secs,
        generator_lock = defaults.feed.generator_lock,
        notifier_lock = defaults.feed.notifier_lock,
        batch_size = defaults.feed.batch_size,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_parses_to_defaults() {
        let settings = Settings::from_toml(&default_config_toml()).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_from_file_with_rules() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[shuffle]
rename_timeout_ms = 250
temp_suffixes = [".SWP"]

[[rules]]
name = "versioning"
folder = '\Docs'
aspect = "cm:versionable"
"#
        )
        .unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        let shuffle = settings.shuffle_config();
        assert_eq!(shuffle.rename_timeout, Duration::from_millis(250));
        assert_eq!(shuffle.window_size, DEFAULT_WINDOW_SIZE);
        assert_eq!(shuffle.temp_suffixes, vec![".swp".to_string()]);
        assert_eq!(settings.inbound_rules().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(Settings::from_toml("[shuffle]\nwindow = 3\n").is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = Settings::from_file("/nonexistent/shufflefs.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/shufflefs.toml"));
    }
}
