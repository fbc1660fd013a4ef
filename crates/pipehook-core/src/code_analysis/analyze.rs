use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::input_keys;
use crate::aggregation::{AggregationPipeline, UnitReport};
use crate::collab::{AnalyzeChangesSpec, CodeAnalyzer, SourceControl, SourceControlSpec};
use crate::config::AnalysisConfig;
use crate::scheduler::{Step, StepContext, StepHandler, StepOutcome};

/// Analyses one package's changes and files the result.
///
/// Analyzer failures end the step `SKIPPED` (not `NON_FATAL_ERROR`) and
/// leave an `error` unit report.
pub struct CodeAnalysisHandler {
    source_control: Arc<dyn SourceControl>,
    analyzer: Arc<dyn CodeAnalyzer>,
}

impl CodeAnalysisHandler {
    pub fn new(source_control: Arc<dyn SourceControl>, analyzer: Arc<dyn CodeAnalyzer>) -> Self {
        Self {
            source_control,
            analyzer,
        }
    }

    async fn analyze(
        &self,
        ctx: &StepContext,
        pipeline: &AggregationPipeline<'_>,
        package: &str,
    ) -> anyhow::Result<Value> {
        let analysis = AnalysisConfig::load(ctx.config())?;
        let spec =
            SourceControlSpec::for_build(ctx.build(), self.source_control.repository(), &analysis);

        pipeline
            .memoized_base_branch(|| self.source_control.base_branch_name(&spec))
            .await?;

        self.analyzer
            .analyze_changes(&AnalyzeChangesSpec {
                package_name: package.to_string(),
                source_control: spec,
            })
            .await
            .with_context(|| format!("analysing {package}"))
    }
}

#[async_trait]
impl StepHandler for CodeAnalysisHandler {
    async fn run(&self, ctx: &StepContext, step: &Step) -> anyhow::Result<StepOutcome> {
        let package = step
            .input
            .text(input_keys::CUSTOM_PKG_NAME)
            .with_context(|| format!("step {} has no {}", step.id, input_keys::CUSTOM_PKG_NAME))?;
        let pipeline = AggregationPipeline::new(ctx.reports(), &ctx.build().id);

        match self.analyze(ctx, &pipeline, package).await {
            Ok(result) => {
                pipeline
                    .on_unit_complete(&UnitReport::success(package, result))
                    .await?;
                Ok(StepOutcome::success())
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(package = %package, error = %message, "code analysis failed");
                pipeline
                    .on_unit_complete(&UnitReport::error(package, &message))
                    .await?;
                Ok(StepOutcome::skipped_because(message))
            }
        }
    }
}
