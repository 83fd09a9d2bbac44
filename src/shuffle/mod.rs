//! Save-shuffle detection and reconciliation.
//!
//! Desktop applications rarely overwrite a file in place when saving over a
//! share. They write a temp file, move the original aside and rename the temp
//! file into place. [`matcher::ShuffleMatcher`] recognises those sequences in
//! a per-directory window of recent operations and
//! [`reconcile::ReconciliationEngine`] rewrites the store so that the
//! original node keeps its identity, metadata and history.

pub mod event;
pub mod matcher;
pub mod pattern;
pub mod reconcile;

pub use self::event::{FileOperationEvent, OperationKind, OperationOutcome};
pub use self::matcher::{DirectoryWindow, ShuffleMatch, ShuffleMatcher, WindowState};
pub use self::pattern::{PatternTable, ShufflePattern};
pub use self::reconcile::{ContentSource, ReconcileError, ReconciliationEngine, ReconciliationOutcome};

use std::time::Duration;

pub const DEFAULT_WINDOW_SIZE: usize = 32;
pub const DEFAULT_RENAME_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ShuffleConfig {
    /// Events and live candidates kept per directory.
    pub window_size: usize,
    /// How long an unfinished sequence stays plausible.
    pub rename_timeout: Duration,
    /// Extra suffixes treated as temporary names.
    pub temp_suffixes: Vec<String>,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            rename_timeout: DEFAULT_RENAME_TIMEOUT,
            temp_suffixes: Vec::new(),
        }
    }
}
