//! Error types for the reconciliation engine.

use thiserror::Error;

use crate::directory::DirectoryError;

/// Errors that can occur while reconciling catalog items against the directory.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The embedded identity block of an asset is missing or invalid.
    #[error("malformed identity on asset {asset}: {msg}")]
    MalformedIdentity {
        /// Name of the asset whose metadata failed validation.
        asset: String,
        /// What was wrong with the metadata.
        msg: String,
    },

    /// The directory service could not be reached or refused the request.
    #[error("directory unavailable: {msg}")]
    DirectoryUnavailable {
        /// Error message describing the failure.
        msg: String,
    },

    /// The directory rejected a location expression supplied by the caller.
    #[error("invalid location expression {expr:?}: {msg}")]
    InvalidLocationExpression {
        /// The expression as supplied.
        expr: String,
        /// Why it was rejected.
        msg: String,
    },

    /// The directory refused a request for a reason other than availability.
    #[error("directory rejected request: {msg}")]
    DirectoryRejected {
        /// Error message from the directory.
        msg: String,
    },

    /// No alternate physical path is recorded for the requested location.
    #[error("asset {asset} has no alternate path for location {location}")]
    LocationNotResolved {
        /// The asset that was asked to be fetched.
        asset: String,
        /// The storage location without a recorded path.
        location: String,
    },

    /// Engine configuration is invalid.
    #[error("invalid configuration: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },

    /// The transfer subsystem rejected a request.
    #[error("transfer rejected: {msg}")]
    Transfer {
        /// Error message describing the rejection.
        msg: String,
    },

    /// Catalog document could not be (de)serialized.
    #[error("catalog serialization error")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl ReconcileError {
    pub(crate) fn malformed(asset: &str, msg: impl Into<String>) -> Self {
        ReconcileError::MalformedIdentity {
            asset: asset.to_string(),
            msg: msg.into(),
        }
    }

    /// Returns true if the error only concerns a single asset and a batch may continue.
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            ReconcileError::MalformedIdentity { .. } | ReconcileError::LocationNotResolved { .. }
        )
    }
}

impl From<DirectoryError> for ReconcileError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::Unavailable { msg } => ReconcileError::DirectoryUnavailable { msg },
            DirectoryError::InvalidExpression { expr, source } => {
                ReconcileError::InvalidLocationExpression {
                    expr,
                    msg: source.to_string(),
                }
            }
            other @ (DirectoryError::AlreadyExists { .. } | DirectoryError::NotFound { .. }) => {
                ReconcileError::DirectoryRejected {
                    msg: other.to_string(),
                }
            }
        }
    }
}

/// Outcome of an idempotent create-if-absent operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The object was created by this call.
    Created,
    /// The object was already visible; nothing was sent.
    AlreadyPresent,
    /// The object looked absent, but the directory reported it already
    /// existed on create. Another caller won the race.
    DuplicateCreateIgnored,
}

impl EnsureOutcome {
    /// Returns true if this call created the object.
    pub fn created(self) -> bool {
        self == EnsureOutcome::Created
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;
