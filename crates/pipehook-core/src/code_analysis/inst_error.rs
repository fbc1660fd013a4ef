use async_trait::async_trait;

use super::input_keys;
use crate::scheduler::{Step, StepContext, StepHandler, StepOutcome};

/// Surfaces a failure to set up a code-analysis step.
///
/// Runs as its own step so the failure shows up next to the package without
/// overriding the package's test result.
pub struct InstErrorHandler;

#[async_trait]
impl StepHandler for InstErrorHandler {
    async fn run(&self, _ctx: &StepContext, step: &Step) -> anyhow::Result<StepOutcome> {
        let message = step
            .input
            .text(input_keys::ERROR_MESSAGE)
            .unwrap_or("code analysis could not be instantiated");
        Ok(StepOutcome::non_fatal(message))
    }
}
