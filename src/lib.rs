//! The Hadron cluster members backend.
//!
//! The members backend is the reconciliation engine which reacts to cluster membership changes
//! (nodes joining, leaving, being decommissioned or recommissioned) by computing & driving the
//! partition replica moves needed for the cluster to converge on its new membership.

pub mod backend;
pub mod cluster;
pub mod config;
#[cfg(test)]
mod config_test;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod memory;
pub mod model;
#[cfg(test)]
mod model_test;
pub mod scenario;

pub use crate::backend::{BackendHandle, BacklogStatus, MembersBackend};
pub use crate::cluster::{Collaborators, LeaderState};
pub use crate::config::Config;
pub use crate::memory::InMemoryCluster;
