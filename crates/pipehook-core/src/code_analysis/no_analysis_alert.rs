use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{input_keys, step_names};
use crate::aggregation::AggregationPipeline;
use crate::collab::{report_commit_error, SourceControl};
use crate::scheduler::{Step, StepContext, StepHandler, StepOutcome};

/// Flags packages that could not be analysed because they lack the analyzer
/// toolkit dependency.
pub struct NoAnalysisAlertHandler {
    source_control: Arc<dyn SourceControl>,
}

impl NoAnalysisAlertHandler {
    pub fn new(source_control: Arc<dyn SourceControl>) -> Self {
        Self { source_control }
    }

    async fn alert(&self, ctx: &StepContext, step: &Step) -> anyhow::Result<StepOutcome> {
        let packages: Vec<String> = step
            .input
            .decode(input_keys::NO_CODE_ANALYSIS_DEP_PKGS)?
            .unwrap_or_default();
        if packages.is_empty() {
            return Ok(StepOutcome::skipped_because(
                "Skipping step since no packages with missing code analysis dependencies were \
                 found.",
            ));
        }

        let status = format!(
            "Could not complete code analysis. See the {} step for details.",
            step_names::NO_CODE_ANALYSIS_ALERT
        );
        let pipeline = AggregationPipeline::new(ctx.reports(), &ctx.build().id);
        report_commit_error(
            &pipeline,
            self.source_control.as_ref(),
            &ctx.build().sha,
            &status,
        )
        .await?;

        Ok(StepOutcome::non_fatal(alert_message(&packages)))
    }
}

fn alert_message(packages: &[String]) -> String {
    let mut lines = vec![
        "The following packages that were built for this commit were not able to run code \
         analysis:"
            .to_string(),
    ];
    lines.extend(packages.iter().map(|p| format!("- {p}")));
    lines.push(String::new());
    lines.push(
        "To have these packages reviewed by the code analyzer, add an upstream dependency on \
         the analyzer toolkit to each of them."
            .to_string(),
    );
    lines.join("\n")
}

#[async_trait]
impl StepHandler for NoAnalysisAlertHandler {
    async fn run(&self, ctx: &StepContext, step: &Step) -> anyhow::Result<StepOutcome> {
        match self.alert(ctx, step).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "no-dependency alert failed");
                Ok(StepOutcome::skipped_because(format!("{e:#}")))
            }
        }
    }
}
