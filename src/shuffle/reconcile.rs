use super::matcher::ShuffleMatch;
use crate::path::RepoPath;
use crate::store::node::{ASPECT_NO_CONTENT, ASPECT_TEMPORARY, ASPECT_VERSIONABLE, PROP_MODIFIED};
use crate::store::{NodeId, NodeTransaction, StoreError};
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("original node {0} no longer exists")]
    OriginalMissing(NodeId),

    #[error("node {0} is no longer at {1}")]
    SourceMoved(NodeId, String),

    #[error("final path {0} has no parent folder")]
    NoParent(String),
}

/// Where the surviving node's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContentSource {
    /// Committed content of the incoming node.
    Node(NodeId),
    /// The incoming node is still open with unflushed writes; its handles
    /// are moved to the target and the close commits the bytes there.
    PendingWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationOutcome {
    pub pattern: String,
    /// Identity that survives at `final_path`.
    pub target_node: NodeId,
    /// Node created or renamed during the shuffle that currently sits at
    /// `final_path`.
    pub source_node: NodeId,
    pub final_path: RepoPath,
    pub content_source: ContentSource,
    /// Where the source node ends up. `None` archives it.
    pub displaced_path: Option<RepoPath>,
    pub properties_carried: BTreeSet<String>,
    pub aspects_carried: BTreeSet<String>,
    pub version: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconciliationEngine;

impl ReconciliationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Turn a match into a concrete outcome against the current store state.
    pub fn plan(
        &self,
        found: &ShuffleMatch,
        txn: &dyn NodeTransaction,
        pending_write: bool,
    ) -> Result<ReconciliationOutcome, ReconcileError> {
        let original = found.original;
        if !txn.exists(original) && !txn.is_archived(original) {
            return Err(ReconcileError::OriginalMissing(original));
        }
        let record = txn.node(original)?;

        if txn.resolve(&found.final_path)? != Some(found.incoming) {
            return Err(ReconcileError::SourceMoved(
                found.incoming,
                found.final_path.to_string(),
            ));
        }

        let displaced_path = if txn.exists(original) {
            Some(txn.path_of(original)?)
        } else {
            None
        };

        let properties_carried = record
            .properties
            .keys()
            .filter(|k| k.as_str() != PROP_MODIFIED && found.policy.carry_properties.includes(k))
            .cloned()
            .collect();
        let aspects_carried = record
            .aspects
            .iter()
            .filter(|a| {
                a.as_str() != ASPECT_TEMPORARY
                    && a.as_str() != ASPECT_NO_CONTENT
                    && found.policy.carry_aspects.includes(a)
            })
            .cloned()
            .collect();

        Ok(ReconciliationOutcome {
            pattern: found.pattern.clone(),
            target_node: original,
            source_node: found.incoming,
            final_path: found.final_path.clone(),
            content_source: if pending_write {
                ContentSource::PendingWrite
            } else {
                ContentSource::Node(found.incoming)
            },
            displaced_path,
            properties_carried,
            aspects_carried,
            version: found.policy.version,
        })
    }

    /// Whether `outcome` has already been applied.
    pub fn is_converged(
        &self,
        outcome: &ReconciliationOutcome,
        txn: &dyn NodeTransaction,
    ) -> Result<bool, ReconcileError> {
        if txn.resolve(&outcome.final_path)? != Some(outcome.target_node) {
            return Ok(false);
        }
        if !txn.exists(outcome.source_node) {
            return Ok(true);
        }
        match &outcome.displaced_path {
            Some(displaced) => Ok(txn.path_of(outcome.source_node)? == *displaced),
            None => Ok(false),
        }
    }

    /// Apply `outcome` inside the caller's transaction. Returns the surviving
    /// node. Running it again on converged state changes nothing.
    pub fn reconcile(
        &self,
        outcome: &ReconciliationOutcome,
        txn: &mut dyn NodeTransaction,
    ) -> Result<NodeId, ReconcileError> {
        if self.is_converged(outcome, txn)? {
            debug!(
                "reconcile: {} already converged at {}",
                outcome.pattern, outcome.final_path
            );
            return Ok(outcome.target_node);
        }

        let target = txn.node(outcome.target_node)?;
        let source = txn.node(outcome.source_node)?;
        if txn.resolve(&outcome.final_path)? != Some(source.id) {
            return Err(ReconcileError::SourceMoved(
                source.id,
                outcome.final_path.to_string(),
            ));
        }
        let (parent, name) = self.locate(&outcome.final_path, txn)?;

        debug!(
            "reconcile: {} keeps node {} at {} (source {})",
            outcome.pattern, target.id, outcome.final_path, source.id
        );

        // free the final name, then put the original there
        txn.delete_node(source.id)?;
        if txn.is_archived(target.id) {
            txn.restore_node(target.id, parent, &name)?;
        } else {
            txn.move_node(target.id, parent, &name)?;
        }

        if let Some(displaced) = &outcome.displaced_path {
            let (displaced_parent, displaced_name) = self.locate(displaced, txn)?;
            txn.restore_node(source.id, displaced_parent, &displaced_name)?;
            txn.set_content(source.id, target.content.clone())?;
            if target.content.is_some() {
                txn.remove_aspect(source.id, ASPECT_NO_CONTENT)?;
            }
        }

        let final_content = match outcome.content_source {
            ContentSource::Node(_) => {
                txn.set_content(target.id, source.content.clone())?;
                source.content.clone()
            }
            ContentSource::PendingWrite => target.content.clone(),
        };

        let mut properties = source.properties.clone();
        for key in &outcome.properties_carried {
            if let Some(value) = target.properties.get(key) {
                properties.insert(key.clone(), value.clone());
            }
        }
        txn.set_properties(target.id, properties)?;

        let mut aspects: BTreeSet<String> = source
            .aspects
            .iter()
            .chain(outcome.aspects_carried.iter())
            .cloned()
            .collect();
        aspects.remove(ASPECT_TEMPORARY);
        aspects.remove(ASPECT_NO_CONTENT);
        if final_content.is_none() {
            aspects.insert(ASPECT_NO_CONTENT.to_string());
        }
        for stale in target.aspects.difference(&aspects) {
            txn.remove_aspect(target.id, stale)?;
        }
        for aspect in &aspects {
            txn.add_aspect(target.id, aspect)?;
        }

        if outcome.version
            && matches!(outcome.content_source, ContentSource::Node(_))
            && aspects.contains(ASPECT_VERSIONABLE)
        {
            let label = txn.create_version(target.id)?;
            debug!("reconcile: node {} versioned as {}", target.id, label);
        }

        Ok(target.id)
    }

    fn locate(
        &self,
        path: &RepoPath,
        txn: &dyn NodeTransaction,
    ) -> Result<(NodeId, String), ReconcileError> {
        let no_parent = || ReconcileError::NoParent(path.to_string());
        let parent_path = path.parent().ok_or_else(no_parent)?;
        let name = path.name().ok_or_else(no_parent)?.to_string();
        let parent = txn.resolve(&parent_path)?.ok_or_else(no_parent)?;
        Ok((parent, name))
    }
}
