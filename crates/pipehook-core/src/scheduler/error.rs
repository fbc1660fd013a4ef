//! Error types for the step-graph scheduler.

use pipehook_state::StorageError;
use thiserror::Error;

/// Errors produced by the step-graph scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A step with this id already exists in the build.
    #[error("duplicate step id: {id}")]
    DuplicateStep { id: String },

    /// No handler is registered under the step's name.
    #[error("no handler registered for step {id} (name {name:?})")]
    UnknownHandler { id: String, name: String },

    /// The referenced step is not in the step table.
    #[error("step not found: {id}")]
    StepNotFound { id: String },

    /// The step is not in a state that accepts this operation.
    #[error("step {id} is {status}, cannot {action}")]
    InvalidTransition {
        id: String,
        status: String,
        action: String,
    },

    /// A step builder was missing a required field.
    #[error("incomplete step definition: missing {field}")]
    IncompleteStep { field: &'static str },

    /// A step belongs to a different build than the scheduler.
    #[error("step {id} belongs to build {step_build}, scheduler runs {build}")]
    ForeignStep {
        id: String,
        step_build: String,
        build: String,
    },

    /// A handler task could not be joined.
    #[error("step task join error: {0}")]
    Join(String),

    /// Bubbled-up storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Convenience result alias.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_handler_displays_name() {
        let err = SchedulerError::UnknownHandler {
            id: "b1-testPackage-pkgA".to_string(),
            name: "mystery".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("b1-testPackage-pkgA"));
        assert!(msg.contains("mystery"));
    }
}
