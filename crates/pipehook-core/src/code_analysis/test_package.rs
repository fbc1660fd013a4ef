use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{follow_on, input_keys, step_names};
use crate::aggregation::{AggregateReport, AggregationPipeline, UnitReport};
use crate::collab::{BuildPlatform, PackageArtifact};
use crate::config::AnalysisConfig;
use crate::scheduler::{Step, StepContext, StepHandler, StepOutcome};

const NO_DEPENDENCY_MESSAGE: &str = "Code analysis cannot be run on this package since it has \
     no upstream dependency on the analyzer toolkit.";

/// Runs the package's tests, then queues its code analysis.
///
/// The test outcome is what the step reports; nothing about code analysis
/// can change it. Failures while preparing the analysis are filed as an
/// `error` unit report and surfaced through a `codeAnalysisInstError` step.
pub struct TestPackageHandler {
    platform: Arc<dyn BuildPlatform>,
}

impl TestPackageHandler {
    pub fn new(platform: Arc<dyn BuildPlatform>) -> Self {
        Self { platform }
    }

    async fn schedule_analysis(
        &self,
        ctx: &StepContext,
        step: &Step,
        package: &str,
        artifact: PackageArtifact,
    ) -> anyhow::Result<()> {
        let build = ctx.build();
        let analysis = AnalysisConfig::load(ctx.config())?;
        let pipeline = AggregationPipeline::new(ctx.reports(), &build.id);

        let skip = !build.has_pull_request()
            && !analysis.mandatory_analysis_branches.contains(&build.branch);

        // The top-level customer package always owns the aggregate so the
        // summary runs in its context.
        let existing = ctx.reports().get_by_id(&pipeline.aggregate_id()).await?;
        if existing.is_none() || analysis.top_level_customer_package.as_deref() == Some(package) {
            pipeline
                .file_aggregate(&AggregateReport {
                    root_pkg_artifact: Some(artifact.clone()),
                    skip_code_analysis: skip,
                })
                .await?;
        }

        if !self.platform.has_analyzer_dependency(step).await? {
            pipeline
                .on_unit_complete(&UnitReport::no_dependency(package, NO_DEPENDENCY_MESSAGE))
                .await?;
            return Ok(());
        }

        if skip {
            debug!(
                package = %package,
                branch = %build.branch,
                "no pull request, skipping code analysis"
            );
            pipeline.on_unit_complete(&UnitReport::skipped(package)).await?;
            return Ok(());
        }

        let input = step
            .input
            .with(input_keys::CUSTOM_PKG_NAME, package)
            .with(input_keys::CUSTOM_PKG_VERSION, artifact.semantic_version);
        let analysis_step = follow_on(
            step,
            step.id
                .replace_segment(step_names::TEST_PACKAGE, step_names::CODE_ANALYSIS),
            step_names::CODE_ANALYSIS,
            input,
        )?;
        ctx.add_steps(vec![analysis_step]);
        Ok(())
    }
}

#[async_trait]
impl StepHandler for TestPackageHandler {
    async fn run(&self, ctx: &StepContext, step: &Step) -> anyhow::Result<StepOutcome> {
        let package = step
            .input
            .text(input_keys::PKG_NAME)
            .with_context(|| format!("step {} has no {}", step.id, input_keys::PKG_NAME))?
            .to_string();

        // Resolved before the tests run; coverage runs swap in an
        // instrumented artifact afterwards.
        let artifact = self.platform.artifact_for(step).await?;
        let outcome = self.platform.test_package(ctx, step).await?;

        if let Err(e) = self.schedule_analysis(ctx, step, &package, artifact).await {
            let message = format!(
                "Failed to instantiate code analysis step for {package} because of the \
                 following error.\n{e:#}"
            );
            warn!(package = %package, error = %e, "code analysis instantiation failed");

            AggregationPipeline::new(ctx.reports(), &ctx.build().id)
                .on_unit_complete(&UnitReport::error(&package, &message))
                .await?;
            let error_step = follow_on(
                step,
                step.id.replace_segment(
                    step_names::TEST_PACKAGE,
                    step_names::CODE_ANALYSIS_INST_ERROR,
                ),
                step_names::CODE_ANALYSIS_INST_ERROR,
                step.input.with(input_keys::ERROR_MESSAGE, message),
            )?;
            ctx.add_steps(vec![error_step]);
        }

        Ok(outcome)
    }
}
