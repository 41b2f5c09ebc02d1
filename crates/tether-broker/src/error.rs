//! Broker error types.
//!
//! The first five variants carry the user-facing message verbatim; the
//! API layer maps each to a status code.

use thiserror::Error;

use tether_core::ManifestError;

use crate::machine::MachineError;
use crate::remote::RemoteError;

pub(crate) const INSTANCE_NOT_FOUND: &str = "Instance not found";
pub(crate) const APP_NOT_FOUND: &str = "App not found";
pub(crate) const SERVICE_NOT_FOUND: &str = "Service not found";
pub(crate) const TEAM_NOT_FOUND: &str = "Team not found";
pub(crate) const NO_INSTANCE_ACCESS: &str = "This user does not have access to this instance";
pub(crate) const NO_APP_ACCESS: &str = "This user does not have access to this app";
pub(crate) const NO_SERVICE_ACCESS: &str = "This user does not have access to this service";

#[derive(Debug, Error)]
pub enum BrokerError {
    /// A referenced service, instance, team, or app is absent.
    #[error("{0}")]
    NotFound(String),

    /// The caller's teams do not intersect the resource ACL.
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("state store error: {0}")]
    State(#[from] tether_state::StateError),

    #[error("service API error: {0}")]
    Remote(#[from] RemoteError),

    #[error("{0}")]
    Machine(#[from] MachineError),
}

impl From<ManifestError> for BrokerError {
    fn from(e: ManifestError) -> Self {
        BrokerError::InvalidArgument(e.to_string())
    }
}

impl BrokerError {
    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        BrokerError::NotFound(msg.into())
    }

    pub(crate) fn forbidden(msg: impl Into<String>) -> Self {
        BrokerError::Forbidden(msg.into())
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> Self {
        BrokerError::Conflict(msg.into())
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        BrokerError::PreconditionFailed(msg.into())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
