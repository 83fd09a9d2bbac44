use crate::path::RepoPath;
use crate::store::{NodeId, NodeRecord, NodeTransaction, StoreError};
use std::sync::Arc;
use tracing::debug;

/// Folder rule fired whenever content is committed to a file, including
/// zero-byte content and the surviving node of a save shuffle.
pub trait InboundRule: Send + Sync {
    fn name(&self) -> &str;

    fn applies(&self, path: &RepoPath, node: &NodeRecord) -> bool;

    fn apply(&self, txn: &mut dyn NodeTransaction, node: NodeId) -> Result<(), StoreError>;
}

/// Adds an aspect to every file committed under `folder`.
#[derive(Debug, Clone)]
pub struct AddAspectRule {
    name: String,
    folder: RepoPath,
    aspect: String,
}

impl AddAspectRule {
    pub fn new(name: &str, folder: RepoPath, aspect: &str) -> Self {
        Self {
            name: name.to_string(),
            folder,
            aspect: aspect.to_string(),
        }
    }
}

impl InboundRule for AddAspectRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies(&self, path: &RepoPath, node: &NodeRecord) -> bool {
        if node.is_folder() {
            return false;
        }
        let folder = self.folder.components();
        let parts = path.components();
        parts.len() > folder.len()
            && folder
                .iter()
                .zip(parts.iter())
                .all(|(a, b)| a.to_lowercase() == b.to_lowercase())
    }

    fn apply(&self, txn: &mut dyn NodeTransaction, node: NodeId) -> Result<(), StoreError> {
        txn.add_aspect(node, &self.aspect)
    }
}

/// Run every applicable rule against `node` at its current path.
pub fn run_rules(
    rules: &[Arc<dyn InboundRule>],
    txn: &mut dyn NodeTransaction,
    node: NodeId,
) -> Result<(), StoreError> {
    if rules.is_empty() {
        return Ok(());
    }
    let path = txn.path_of(node)?;
    let record = txn.node(node)?;
    for rule in rules {
        if rule.applies(&path, &record) {
            debug!("rule {} fired on {} (node {})", rule.name(), path, node);
            rule.apply(txn, node)?;
        }
    }
    Ok(())
}
