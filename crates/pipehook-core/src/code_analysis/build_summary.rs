use std::sync::Arc;

use async_trait::async_trait;
use pipehook_state::BuildHistory;
use serde_json::Value;
use tracing::{info, warn};

use super::{follow_on, input_keys, step_names, FOLLOW_ON_MAX_RETRIES};
use crate::aggregation::{resolve_baseline, AggregationPipeline, UnitStatus};
use crate::collab::{
    report_commit_error, BuildPlatform, SourceControl, StepDuration,
    CODE_ANALYZER_ERROR_STATUS_MSG,
};
use crate::config::keys;
use crate::scheduler::{Step, StepContext, StepHandler, StepOutcome};

/// Wraps the platform build summary and starts the code-analysis summary.
///
/// Every package step points its `next` at this step, so by the time it
/// runs every unit report has been filed.
pub struct BuildSummaryHandler {
    platform: Arc<dyn BuildPlatform>,
    source_control: Arc<dyn SourceControl>,
    history: Arc<dyn BuildHistory>,
}

impl BuildSummaryHandler {
    pub fn new(
        platform: Arc<dyn BuildPlatform>,
        source_control: Arc<dyn SourceControl>,
        history: Arc<dyn BuildHistory>,
    ) -> Self {
        Self {
            platform,
            source_control,
            history,
        }
    }

    async fn follow_ons(&self, ctx: &StepContext, step: &Step) -> anyhow::Result<Vec<Step>> {
        let build = ctx.build();
        let pipeline = AggregationPipeline::new(ctx.reports(), &build.id);
        let view = pipeline.aggregate().await?;

        let missing_toolkit = view.packages_with(UnitStatus::NoDependency);
        let durations = analysis_durations(ctx);
        let mut next_steps = Vec::new();

        if !missing_toolkit.is_empty() {
            next_steps.push(follow_on(
                step,
                step.id.derive(step_names::NO_CODE_ANALYSIS_ALERT),
                step_names::NO_CODE_ANALYSIS_ALERT,
                step.input
                    .with_json(input_keys::NO_CODE_ANALYSIS_DEP_PKGS, &missing_toolkit)?,
            )?);
        }

        // Without a root artifact no package could load the analyzer, so
        // there is nothing to summarise.
        let Some(artifact) = view.parent.and_then(|p| p.root_pkg_artifact) else {
            return Ok(next_steps);
        };

        let base_branch = pipeline.cached_base_branch().await?;
        let baseline = match &base_branch {
            Some(branch) => resolve_baseline(self.history.as_ref(), ctx.reports(), branch).await?,
            None => None,
        };
        if let Some(baseline) = &baseline {
            info!(build_id = %build.id, baseline_build = %baseline.build_id, "baseline found");
        }

        let input = step
            .input
            .with(input_keys::BASE_BRANCH, base_branch)
            .with(input_keys::BASE_BRANCH_RESULTS, baseline.map(|b| b.results))
            .with(input_keys::IS_CODE_ANALYSIS_COMPLETE, missing_toolkit.is_empty())
            .with_json(input_keys::STEP_DURATIONS, &durations)?
            .with_json(input_keys::ROOT_PKG_ARTIFACT, &artifact)?
            .with(input_keys::CUSTOM_PKG_NAME, artifact.name.clone())
            .with(input_keys::CUSTOM_PKG_VERSION, artifact.semantic_version.clone())
            .with(
                input_keys::REPORT_TO_CODE_ANALYTICS,
                ctx.config()
                    .get(keys::REPORT_TO_CODE_ANALYTICS)
                    .map_or(Value::Null, Value::String),
            );
        next_steps.push(follow_on(
            step,
            step.id.derive(step_names::CODE_ANALYSIS_SUMMARY),
            step_names::CODE_ANALYSIS_SUMMARY,
            input,
        )?);
        Ok(next_steps)
    }
}

/// Durations of the build's settled `codeAnalysis` steps.
fn analysis_durations(ctx: &StepContext) -> Vec<StepDuration> {
    ctx.steps_named(step_names::CODE_ANALYSIS)
        .filter_map(|record| {
            record.duration().map(|d| StepDuration {
                id: record.id().to_string(),
                duration_ms: d.num_milliseconds(),
            })
        })
        .collect()
}

#[async_trait]
impl StepHandler for BuildSummaryHandler {
    async fn run(&self, ctx: &StepContext, step: &Step) -> anyhow::Result<StepOutcome> {
        let outcome = self.platform.build_summary(ctx, step).await?;

        match self.follow_ons(ctx, step).await {
            Ok(next_steps) => ctx.add_steps(next_steps),
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "could not prepare code analysis summary");
                let pipeline = AggregationPipeline::new(ctx.reports(), &ctx.build().id);
                if let Err(status_err) = report_commit_error(
                    &pipeline,
                    self.source_control.as_ref(),
                    &ctx.build().sha,
                    CODE_ANALYZER_ERROR_STATUS_MSG,
                )
                .await
                {
                    warn!(error = %status_err, "could not post commit status");
                }

                let message = format!(
                    "Failed to instantiate the code analysis summary step because of the \
                     following error.\n{e:#}"
                );
                let error_step = Step::builder()
                    .id(format!("{}-codeAnalysisSummaryInstError", ctx.build().id))
                    .name(step_names::CODE_ANALYSIS_INST_ERROR)
                    .input(step.input.with(input_keys::ERROR_MESSAGE, message))
                    .build_id(step.build_id.clone())
                    .max_retries(FOLLOW_ON_MAX_RETRIES)
                    .build()?;
                ctx.add_steps(vec![error_step]);
            }
        }

        Ok(outcome)
    }
}
