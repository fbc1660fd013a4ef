use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::input_keys;
use crate::aggregation::{AggregationPipeline, NotificationTarget, ProcessedResults};
use crate::collab::{
    report_commit_error, CodeAnalyzer, NotifyPullRequestSpec, ScmProvider, SourceControl,
    SourceControlSpec, StepDuration, CODE_ANALYZER_ERROR_STATUS_MSG,
};
use crate::config::AnalysisConfig;
use crate::scheduler::{Step, StepContext, StepHandler, StepOutcome};

/// Notifies the pull request with the build's analysis results and files
/// the processed results used as the next builds' baseline.
///
/// Any failure marks the commit status `error` and ends the step
/// `NON_FATAL_ERROR`, so the build can still complete.
pub struct CodeAnalysisSummaryHandler {
    source_control: Arc<dyn SourceControl>,
    analyzer: Arc<dyn CodeAnalyzer>,
}

impl CodeAnalysisSummaryHandler {
    pub fn new(source_control: Arc<dyn SourceControl>, analyzer: Arc<dyn CodeAnalyzer>) -> Self {
        Self {
            source_control,
            analyzer,
        }
    }

    async fn summarize(&self, ctx: &StepContext, step: &Step) -> anyhow::Result<StepOutcome> {
        let build = ctx.build();
        let pipeline = AggregationPipeline::new(ctx.reports(), &build.id);
        let view = pipeline.aggregate().await?;
        if view.skip_requested() {
            return Ok(StepOutcome::skipped());
        }

        let analysis = AnalysisConfig::load(ctx.config())?;
        let spec = SourceControlSpec::for_build(build, self.source_control.repository(), &analysis);
        let results = view.successful_results();
        let durations: Vec<StepDuration> = step
            .input
            .decode(input_keys::STEP_DURATIONS)?
            .unwrap_or_default();

        if !build.has_pull_request() {
            self.store(ctx, step, &pipeline, &analysis, &spec, &Value::Array(results), &durations)
                .await?;
            pipeline
                .notify_once(NotificationTarget::NonPullRequestCommit, || {
                    self.analyzer.notify_non_pull_request_commit(&spec)
                })
                .await?;
            return Ok(StepOutcome::success());
        }

        let notify = NotifyPullRequestSpec {
            source_control: spec.clone(),
            results: results.clone(),
            is_code_analysis_complete: step
                .input
                .flag(input_keys::IS_CODE_ANALYSIS_COMPLETE)
                .unwrap_or(true),
            base_branch_results: step.input.get(input_keys::BASE_BRANCH_RESULTS).cloned(),
            max_comment_count: analysis.max_comment_count,
        };
        let processed = pipeline
            .notify_once(NotificationTarget::PullRequestSummary, || {
                self.analyzer.notify_pull_request(&notify)
            })
            .await?
            .unwrap_or_else(|| {
                info!(build_id = %build.id, "pull request already notified");
                Value::Array(results)
            });
        self.store(ctx, step, &pipeline, &analysis, &spec, &processed, &durations)
            .await?;
        Ok(StepOutcome::success())
    }

    #[allow(clippy::too_many_arguments)]
    async fn store(
        &self,
        ctx: &StepContext,
        step: &Step,
        pipeline: &AggregationPipeline<'_>,
        analysis: &AnalysisConfig,
        spec: &SourceControlSpec,
        processed: &Value,
        durations: &[StepDuration],
    ) -> anyhow::Result<()> {
        let trimmed = self.analyzer.trimmed_results(processed);
        let package = step.input.text(input_keys::CUSTOM_PKG_NAME).unwrap_or_default();
        let customization = self.customization_results(analysis, package).await?;

        pipeline
            .file_processed_results(&ProcessedResults {
                code_analysis_results: trimmed.clone(),
                customization_results: customization.clone(),
            })
            .await?;

        let report_enabled = match step.input.text(input_keys::REPORT_TO_CODE_ANALYTICS) {
            Some(flag) => flag.trim() == "true",
            None => analysis.report_to_code_analytics,
        };
        if !report_enabled
            || self.source_control.provider() != ScmProvider::GitHub
            || !analysis.store_result_branches.contains(&ctx.build().branch)
        {
            return Ok(());
        }

        let analyzer = self.analyzer.as_ref();
        let trimmed = &trimmed;
        pipeline
            .notify_once(NotificationTarget::CodeAnalytics, || async move {
                match customization {
                    Some(customization) => {
                        analyzer
                            .store_customization_results(spec, trimmed, &customization, durations)
                            .await
                    }
                    None => {
                        analyzer
                            .store_processed_results(spec, trimmed, durations)
                            .await
                    }
                }
            })
            .await?;
        Ok(())
    }

    /// Customization analysis for the configured top-level customer package.
    ///
    /// `None` when no top-level package is configured. The step must run in
    /// the top-level package's context, and the customer package list must
    /// include it; otherwise nothing is computed.
    async fn customization_results(
        &self,
        analysis: &AnalysisConfig,
        package: &str,
    ) -> anyhow::Result<Option<Value>> {
        let Some(top_level) = analysis.top_level_customer_package.as_deref() else {
            return Ok(None);
        };
        if top_level != package {
            bail!(
                "Failed sanity check: the summary step was not started from the configured \
                 topLevelCustomerPackage ({top_level}) but from {package:?}. \
                 Make sure the package exists in this repository."
            );
        }
        if !analysis.customer_packages.iter().any(|p| p == top_level) {
            bail!(
                "Incomplete list of customer packages: customerPackages must list every customer \
                 package, including the top-level customer package {top_level}."
            );
        }
        Ok(Some(
            self.analyzer
                .analyze_customizations(&analysis.customer_packages)
                .await?,
        ))
    }
}

#[async_trait]
impl StepHandler for CodeAnalysisSummaryHandler {
    async fn run(&self, ctx: &StepContext, step: &Step) -> anyhow::Result<StepOutcome> {
        match self.summarize(ctx, step).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "code analysis summary failed");
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
                Ok(StepOutcome::non_fatal(format!("{e:#}")))
            }
        }
    }
}
