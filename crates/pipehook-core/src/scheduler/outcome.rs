//! Handler-reported step outcomes.

use serde::{Deserialize, Serialize};

use crate::scheduler::step::StepStatus;

/// Terminal status chosen by a step handler.
///
/// A handler that returns `Err` instead is treated as an unhandled failure
/// and may be retried; an outcome is final and consumes no retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self {
            status: StepStatus::Success,
            error: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            error: None,
        }
    }

    /// Skipped, with the reason surfaced on the step.
    pub fn skipped_because(reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            error: Some(reason.into()),
        }
    }

    /// Failed without blocking downstream steps.
    pub fn non_fatal(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::NonFatalError,
            error: Some(error.into()),
        }
    }

    /// Failed and blocks steps reachable only through this one.
    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::FatalError,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// What the scheduler learned about a finished handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// The handler classified its own result.
    Completed(StepOutcome),
    /// The handler failed with an unhandled error (retryable).
    Failed(String),
}

impl From<StepOutcome> for StepResult {
    fn from(outcome: StepOutcome) -> Self {
        StepResult::Completed(outcome)
    }
}
