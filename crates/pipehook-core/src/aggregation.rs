//! Fan-in of per-package results and once-per-build notifications.
//!
//! Package steps file [`UnitReport`]s as children of the build's aggregate
//! report. A single downstream step reads them back with
//! [`AggregationPipeline::aggregate`] once the scheduler's join barrier has
//! released it; the store itself knows nothing about expected child counts.

use std::future::Future;

use anyhow::Context;
use chrono::Utc;
use pipehook_state::{BuildHistory, Report, ReportStore, StorageResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::collab::PackageArtifact;
use crate::obs;

/// Number of recent base-branch builds searched for a baseline.
pub const BASELINE_CANDIDATES: usize = 5;

/// Well-known report ids, all scoped by build id.
pub mod report_ids {
    /// Aggregate parent of every package result.
    pub fn aggregate(build_id: &str) -> String {
        format!("{build_id}-code-analysis")
    }

    pub fn unit_result(build_id: &str, package: &str) -> String {
        format!("{build_id}-{package}-code-analysis-result")
    }

    pub fn base_branch(build_id: &str) -> String {
        format!("{build_id}-code-analysis-base-branch")
    }

    pub fn processed_results(build_id: &str) -> String {
        format!("{build_id}-code-analysis-processed-results")
    }

    pub fn test_avoidance(build_id: &str) -> String {
        format!("{build_id}-test-avoidance")
    }

    pub fn notified(build_id: &str, target: &str) -> String {
        format!("{build_id}-notified-{target}")
    }
}

/// Outcome of analysing one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitStatus {
    /// Analysis ran; findings may still exist.
    Success,
    /// The package cannot load the analysis toolkit.
    NoDependency,
    Skipped,
    Error,
}

/// Per-package child report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitReport {
    pub package_name: String,
    pub status: UnitStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
}

impl UnitReport {
    pub fn success(package: impl Into<String>, result: Value) -> Self {
        Self {
            package_name: package.into(),
            status: UnitStatus::Success,
            error_message: None,
            result: Some(result),
        }
    }

    pub fn no_dependency(package: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            package_name: package.into(),
            status: UnitStatus::NoDependency,
            error_message: Some(message.into()),
            result: None,
        }
    }

    pub fn skipped(package: impl Into<String>) -> Self {
        Self {
            package_name: package.into(),
            status: UnitStatus::Skipped,
            error_message: None,
            result: None,
        }
    }

    pub fn error(package: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            package_name: package.into(),
            status: UnitStatus::Error,
            error_message: Some(message.into()),
            result: None,
        }
    }
}

/// Payload of the aggregate parent report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateReport {
    #[serde(default)]
    pub root_pkg_artifact: Option<PackageArtifact>,
    #[serde(default)]
    pub skip_code_analysis: bool,
}

/// Payload of the processed-results report; the next builds' baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedResults {
    pub code_analysis_results: Value,
    #[serde(default)]
    pub customization_results: Option<Value>,
}

/// Everything filed under one aggregate, read in a single pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateView {
    pub parent: Option<AggregateReport>,
    pub units: Vec<UnitReport>,
}

impl AggregateView {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn with_status(&self, status: UnitStatus) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(move |u| u.status == status)
    }

    /// Package names that reported `status`, in filing order.
    pub fn packages_with(&self, status: UnitStatus) -> Vec<String> {
        self.with_status(status).map(|u| u.package_name.clone()).collect()
    }

    /// Results of the successfully analysed packages.
    pub fn successful_results(&self) -> Vec<Value> {
        self.with_status(UnitStatus::Success)
            .filter_map(|u| u.result.clone())
            .collect()
    }

    pub fn skip_requested(&self) -> bool {
        self.parent.as_ref().is_some_and(|p| p.skip_code_analysis)
    }
}

/// A logical notification delivered at most once per build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationTarget {
    PullRequestSummary,
    NonPullRequestCommit,
    CommitStatus,
    CodeAnalytics,
}

impl NotificationTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationTarget::PullRequestSummary => "pull-request-summary",
            NotificationTarget::NonPullRequestCommit => "non-pull-request-commit",
            NotificationTarget::CommitStatus => "commit-status",
            NotificationTarget::CodeAnalytics => "code-analytics",
        }
    }
}

/// Comparison baseline found on the base branch.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub build_id: String,
    pub results: Value,
}

/// Report-store view of one build's code-analysis fan-in.
pub struct AggregationPipeline<'a> {
    reports: &'a dyn ReportStore,
    build_id: &'a str,
}

impl<'a> AggregationPipeline<'a> {
    pub fn new(reports: &'a dyn ReportStore, build_id: &'a str) -> Self {
        Self { reports, build_id }
    }

    pub fn aggregate_id(&self) -> String {
        report_ids::aggregate(self.build_id)
    }

    /// File a package's result under the aggregate.
    pub async fn on_unit_complete(&self, unit: &UnitReport) -> StorageResult<()> {
        let report = Report::child(
            self.build_id,
            report_ids::unit_result(self.build_id, &unit.package_name),
            self.aggregate_id(),
            serde_json::to_value(unit)?,
        )?;
        debug!(
            build_id = %self.build_id,
            package = %unit.package_name,
            status = ?unit.status,
            "unit result filed"
        );
        self.reports.put(report).await
    }

    pub async fn file_aggregate(&self, aggregate: &AggregateReport) -> StorageResult<()> {
        let report = Report::from_payload(self.build_id, self.aggregate_id(), aggregate)?;
        self.reports.put(report).await
    }

    pub async fn aggregate_report(&self) -> StorageResult<Option<AggregateReport>> {
        match self.reports.get_by_id(&self.aggregate_id()).await? {
            Some(report) => Ok(Some(report.data_as()?)),
            None => Ok(None),
        }
    }

    /// Read the aggregate and every child filed under it.
    ///
    /// Zero children is a valid, empty view.
    pub async fn aggregate(&self) -> StorageResult<AggregateView> {
        let parent = self.aggregate_report().await?;
        let units = self
            .reports
            .get_children(&self.aggregate_id())
            .await?
            .iter()
            .map(Report::data_as::<UnitReport>)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(AggregateView { parent, units })
    }

    /// Run `send` unless `target` was already notified in this build.
    ///
    /// A marker report is filed after `send` succeeds; a failed send leaves
    /// no marker. Returns `None` when the notification had already gone out.
    pub async fn notify_once<T, F, Fut>(
        &self,
        target: NotificationTarget,
        send: F,
    ) -> anyhow::Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let marker_id = report_ids::notified(self.build_id, target.as_str());
        if self.reports.get_by_id(&marker_id).await?.is_some() {
            debug!(build_id = %self.build_id, target = target.as_str(), "already notified");
            return Ok(None);
        }
        let value = send().await?;
        let marker = Report::new(
            self.build_id,
            marker_id,
            json!({ "target": target.as_str(), "sentAt": Utc::now() }),
        )?;
        self.reports.put(marker).await?;
        obs::emit_notification_sent(self.build_id, target.as_str());
        Ok(Some(value))
    }

    /// Base branch of the build's pull request, computed at most once.
    pub async fn memoized_base_branch<F, Fut>(&self, compute: F) -> anyhow::Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<String>>,
    {
        let id = report_ids::base_branch(self.build_id);
        if let Some(report) = self.reports.get_by_id(&id).await? {
            if let Some(branch) = report.field("baseBranch").and_then(Value::as_str) {
                return Ok(branch.to_string());
            }
        }
        let branch = compute().await.context("resolving base branch")?;
        let report = Report::new(self.build_id, id, json!({ "baseBranch": branch }))?;
        self.reports.put(report).await?;
        Ok(branch)
    }

    /// Base branch cached for this build, if any step resolved it.
    pub async fn cached_base_branch(&self) -> StorageResult<Option<String>> {
        Ok(self
            .reports
            .get_by_id(&report_ids::base_branch(self.build_id))
            .await?
            .and_then(|r| r.field("baseBranch").and_then(Value::as_str).map(str::to_string)))
    }

    pub async fn file_processed_results(&self, results: &ProcessedResults) -> StorageResult<()> {
        let report = Report::from_payload(
            self.build_id,
            report_ids::processed_results(self.build_id),
            results,
        )?;
        self.reports.put(report).await
    }
}

/// Most recent processed results among the last [`BASELINE_CANDIDATES`]
/// finished builds of `base_branch`.
///
/// No such build is a normal outcome (`Ok(None)`).
pub async fn resolve_baseline(
    history: &dyn BuildHistory,
    reports: &dyn ReportStore,
    base_branch: &str,
) -> StorageResult<Option<Baseline>> {
    let builds = history.recent_builds(base_branch, BASELINE_CANDIDATES).await?;
    for build in builds.iter().filter(|b| b.state.is_terminal()) {
        let Some(report) = reports
            .get_by_id(&report_ids::processed_results(&build.id))
            .await?
        else {
            continue;
        };
        let processed: ProcessedResults = report.data_as()?;
        return Ok(Some(Baseline {
            build_id: build.id.clone(),
            results: processed.code_analysis_results,
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipehook_state::MemoryReportStore;

    #[test]
    fn test_report_ids() {
        assert_eq!(report_ids::aggregate("b1"), "b1-code-analysis");
        assert_eq!(report_ids::unit_result("b1", "pkgA"), "b1-pkgA-code-analysis-result");
        assert_eq!(report_ids::notified("b1", "commit-status"), "b1-notified-commit-status");
    }

    #[test]
    fn test_unit_report_wire_shape() {
        let json = serde_json::to_value(UnitReport::no_dependency("pkgA", "no toolkit")).unwrap();
        assert_eq!(json["status"], "no-dependency");
        assert_eq!(json["packageName"], "pkgA");
        assert_eq!(json["errorMessage"], "no toolkit");
    }

    #[tokio::test]
    async fn test_notify_once_runs_send_once() {
        let store = MemoryReportStore::new();
        let pipeline = AggregationPipeline::new(&store, "b1");
        let first = pipeline
            .notify_once(NotificationTarget::PullRequestSummary, || async { Ok(1) })
            .await
            .unwrap();
        let second = pipeline
            .notify_once(NotificationTarget::PullRequestSummary, || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(first, Some(1));
        assert_eq!(second, None);

        let other = pipeline
            .notify_once(NotificationTarget::CommitStatus, || async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(other, Some(3));
    }

    #[tokio::test]
    async fn test_failed_send_leaves_no_marker() {
        let store = MemoryReportStore::new();
        let pipeline = AggregationPipeline::new(&store, "b1");
        let err = pipeline
            .notify_once::<(), _, _>(NotificationTarget::CommitStatus, || async {
                anyhow::bail!("offline")
            })
            .await;
        assert!(err.is_err());
        let retried = pipeline
            .notify_once(NotificationTarget::CommitStatus, || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(retried, Some(()));
    }
}
