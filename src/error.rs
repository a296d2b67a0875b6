//! Members backend error abstractions.

use thiserror::Error;
use tokio::task::JoinError;

use crate::model::{NodeId, Ntp};

/// An error returned from a cluster collaborator which is expected to be transient.
#[derive(Clone, Debug, Error)]
pub enum CollaboratorError {
    /// The collaborator is temporarily unable to serve the request.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// An error returned from the placement solver.
#[derive(Clone, Debug, Error)]
pub enum SolverError {
    /// No valid replica set could be found for the partition under current constraints.
    #[error("no feasible placement for {ntp} excluding node {excluded}")]
    Infeasible { ntp: Ntp, excluded: NodeId },
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

/// An error returned from the topics frontend when requesting a partition move.
#[derive(Clone, Debug, Error)]
pub enum MoveError {
    /// Another operation is already in flight for the partition.
    #[error("conflicting operation in flight for {0}")]
    Conflict(Ntp),
    /// The partition is not known to the topics frontend.
    #[error("unknown partition {0}")]
    UnknownPartition(Ntp),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

/// An error which terminates a run of the members backend reconciler.
///
/// All other errors are absorbed by the reconciler and retried.
#[derive(Debug, Error)]
pub enum BackendError {
    /// This node is no longer authorized to drive reallocations.
    #[error("leadership lost, this node is no longer authorized to drive reallocations")]
    AuthorizationLost,
    /// The backend is shutting down.
    #[error("members backend is shutting down")]
    Shutdown,
    /// The reconciler task failed unexpectedly.
    #[error("members backend reconciler task failed: {0}")]
    TaskFailed(#[from] JoinError),
}
