//! Save-shuffle aware CIFS driver core and cluster job lock.
//!
//! [`fs::ShuffleDriver`] accepts the operations a file-sharing client
//! issues while saving a document and makes sure the repository node the
//! user sees keeps its identity, properties and version history.
//! [`joblock::JobLockService`] gives batch jobs such as [`feed`] at most one
//! active worker across a cluster.

pub mod cli;
pub mod config;
pub mod feed;
pub mod fs;
pub mod joblock;
pub mod path;
pub mod shuffle;
pub mod store;
pub mod task;
