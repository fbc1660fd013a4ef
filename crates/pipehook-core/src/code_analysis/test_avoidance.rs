use std::sync::Arc;

use async_trait::async_trait;
use pipehook_state::Report;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::aggregation::report_ids;
use crate::collab::{ScmProvider, SourceControl};
use crate::config::keys;
use crate::dependency::{changed_packages, upstream_closure, DepthLimit, PackageCatalog};
use crate::scheduler::{Step, StepContext, StepHandler, StepOutcome};

/// Compare results at or above this size may be truncated, so every
/// package gets built.
pub const AVOIDANCE_FILE_LIMIT: usize = 300;

const AVOIDANCE_BRANCH_MARKERS: [&str; 2] = ["feature/", "task/"];
const DEFAULT_BASE_BRANCH: &str = "develop";

/// Narrows the build to the packages affected by the branch's changes.
///
/// Writes the affected set to the `packagesToInclude` config value as a JSON
/// array. Leaves it unset (build everything) whenever the affected set cannot
/// be determined. Always succeeds.
pub struct TestAvoidanceHandler {
    source_control: Arc<dyn SourceControl>,
    packages: Arc<dyn PackageCatalog>,
}

impl TestAvoidanceHandler {
    pub fn new(source_control: Arc<dyn SourceControl>, packages: Arc<dyn PackageCatalog>) -> Self {
        Self {
            source_control,
            packages,
        }
    }

    /// Affected package list, or `None` when every package must be built.
    async fn narrow(&self, ctx: &StepContext) -> anyhow::Result<Option<Vec<String>>> {
        let build = ctx.build();
        if !AVOIDANCE_BRANCH_MARKERS.iter().any(|m| build.branch.contains(m)) {
            debug!(branch = %build.branch, "test avoidance skipped for this branch");
            return Ok(None);
        }
        if self.source_control.provider() != ScmProvider::GitHub {
            return Ok(None);
        }

        let base = build
            .branch_group_base
            .as_deref()
            .unwrap_or(DEFAULT_BASE_BRANCH);
        let compare = self
            .source_control
            .compare(self.source_control.repository(), base, &build.sha)
            .await?;
        if compare.files.len() >= AVOIDANCE_FILE_LIMIT {
            info!(files = compare.files.len(), "diff too large, building every package");
            return Ok(None);
        }

        let modified = changed_packages(
            compare.files.iter().map(|f| f.filename.as_str()),
            &build.packages_path,
        );
        if modified.is_empty() {
            return Ok(None);
        }

        let decls = self.packages.declarations(build)?;
        let affected =
            upstream_closure(modified.iter().cloned(), &decls, DepthLimit::Unlimited).ordered();

        let report = Report::new(
            &build.id,
            report_ids::test_avoidance(&build.id),
            json!({
                "baseBranch": base,
                "changedPackages": modified,
                "affectedPackages": affected,
            }),
        )?;
        ctx.reports().put(report).await?;
        info!(
            build_id = %build.id,
            changed = modified.len(),
            affected = affected.len(),
            "test avoidance narrowed package set"
        );
        Ok(Some(affected))
    }
}

#[async_trait]
impl StepHandler for TestAvoidanceHandler {
    async fn run(&self, ctx: &StepContext, step: &Step) -> anyhow::Result<StepOutcome> {
        match self.narrow(ctx).await {
            Ok(Some(affected)) => match serde_json::to_string(&affected) {
                Ok(list) => ctx.config().set(keys::PACKAGES_TO_INCLUDE, list),
                Err(e) => {
                    warn!(step_id = %step.id, error = %e, "could not encode affected packages")
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(
                    step_id = %step.id,
                    error = %format!("{e:#}"),
                    "test avoidance failed, building every package"
                );
            }
        }
        Ok(StepOutcome::success())
    }
}
