//! Error types for pipehook-state

use thiserror::Error;

/// Errors returned by the report store and build history backends
#[derive(Error, Debug)]
pub enum StorageError {
    /// No build is registered under the given id
    #[error("build not found: {build_id}")]
    BuildNotFound { build_id: String },

    /// A build lifecycle transition was attempted from the wrong state
    #[error("build {build_id} is {state}, expected {expected}")]
    InvalidBuildState {
        build_id: String,
        state: String,
        expected: String,
    },

    /// A build with this id is already registered
    #[error("build already registered: {build_id}")]
    DuplicateBuild { build_id: String },

    /// Payload could not be (de)serialized
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Backend failure (lock poisoning, I/O, ...)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
