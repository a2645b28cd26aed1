// ABOUTME: Error taxonomy for clone operations
// ABOUTME: Typed failures that travel inside anyhow::Error and stay downcastable

use thiserror::Error;

use crate::object::ObjectType;

/// Failures raised by the cloner itself, as opposed to errors surfaced by a
/// database driver.
///
/// All variants are fatal: the clone stops at the first one and nothing is
/// retried. They are returned wrapped in [`anyhow::Error`]; callers that need
/// to branch on the kind can use `err.downcast_ref::<CloneError>()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloneError {
    /// Either descriptor names an object kind other than a table
    #[error("Currently only tables are supported, got {0}")]
    UnsupportedObjectType(ObjectType),

    /// The object type string could not be parsed at all
    #[error("Unknown object type '{0}'")]
    InvalidObjectType(String),

    /// Source descriptor has no object name
    #[error("Specify object name for source object")]
    MissingSourceName,

    /// Source and target resolve to the same physical object
    #[error("Source and target are the same object: {object} at '{endpoint}'")]
    IdenticalSourceAndTarget { object: String, endpoint: String },

    /// Target object is absent and creation was not requested
    #[error("Create object {object} at '{endpoint}' or enable create_if_not_exists")]
    TargetObjectMissing { object: String, endpoint: String },

    /// The identifier rewrite did not match exactly once in the extracted DDL
    #[error("Unsupported DDL shape for {object}: expected exactly one '{pattern}', found {matches}")]
    UnsupportedDdlShape {
        object: String,
        pattern: String,
        matches: usize,
    },

    /// A cursor or prepared statement was used before it was established
    #[error("Endpoint '{0}' is not ready: {1}")]
    NotConnected(String, &'static str),
}

impl CloneError {
    /// Create an IdenticalSourceAndTarget error
    pub fn identical(object: impl Into<String>, endpoint: impl Into<String>) -> Self {
        CloneError::IdenticalSourceAndTarget {
            object: object.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Create a TargetObjectMissing error
    pub fn target_missing(object: impl Into<String>, endpoint: impl Into<String>) -> Self {
        CloneError::TargetObjectMissing {
            object: object.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Find the [`CloneError`] kind inside an error chain, if there is one.
pub fn clone_error_kind(err: &anyhow::Error) -> Option<&CloneError> {
    err.chain().find_map(|cause| cause.downcast_ref::<CloneError>())
}
