//! Narrow interfaces to the systems the pipeline talks to.
//!
//! - [`SourceControl`]: diffs, commit statuses and pull-request metadata
//! - [`CodeAnalyzer`]: the external analysis engine
//! - [`BuildPlatform`]: the stock step implementations being extended
//!
//! Analyzer results are opaque JSON; only the analyzer knows their shape.

use async_trait::async_trait;
use pipehook_state::Build;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregation::{AggregationPipeline, NotificationTarget};
use crate::config::AnalysisConfig;
use crate::scheduler::{Step, StepContext, StepOutcome};

/// Commit status context used for every code-analysis status.
pub const CODE_ANALYZER_STATUS_CONTEXT: &str = "Code Analyzer";

/// Description posted when reporting results failed.
pub const CODE_ANALYZER_ERROR_STATUS_MSG: &str =
    "There was an error in reporting your code analysis results.";

/// Source-control hosting flavour. Several features only work on GitHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScmProvider {
    GitHub,
    Other,
}

/// Commit status state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl std::fmt::Display for CommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub filename: String,
}

/// Files changed between two refs, truncated at the provider's page size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareResult {
    pub files: Vec<ChangedFile>,
}

impl CompareResult {
    pub fn from_filenames<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: names
                .into_iter()
                .map(|n| ChangedFile { filename: n.into() })
                .collect(),
        }
    }
}

/// Everything the analyzer needs to locate a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceControlSpec {
    /// `org/repo`.
    pub repository: String,
    pub commit_sha: String,
    /// Empty when the commit has no pull request.
    pub pr_url: String,
    pub packages_path: String,
    pub branch: String,
    pub backup_tokens: Vec<String>,
}

impl SourceControlSpec {
    pub fn for_build(build: &Build, repository: &str, analysis: &AnalysisConfig) -> Self {
        Self {
            repository: repository.to_string(),
            commit_sha: build.sha.clone(),
            pr_url: build.pr_url.clone().unwrap_or_default(),
            packages_path: build.packages_path.clone(),
            branch: build.branch.clone(),
            backup_tokens: analysis.backup_tokens.clone(),
        }
    }
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    fn provider(&self) -> ScmProvider;

    /// `org/repo` of the repository being built.
    fn repository(&self) -> &str;

    async fn compare(&self, repo: &str, base: &str, head: &str) -> anyhow::Result<CompareResult>;

    async fn create_commit_status(
        &self,
        repo: &str,
        sha: &str,
        state: CommitState,
        context: &str,
        description: &str,
    ) -> anyhow::Result<()>;

    /// Base branch of the pull request described by `spec`.
    async fn base_branch_name(&self, spec: &SourceControlSpec) -> anyhow::Result<String>;
}

/// Post an `error` commit status under the code-analyzer context.
///
/// Only GitHub supports commit statuses; elsewhere this does nothing. At most
/// one error status is posted per build, however many steps report one.
pub async fn report_commit_error(
    pipeline: &AggregationPipeline<'_>,
    scm: &dyn SourceControl,
    sha: &str,
    description: &str,
) -> anyhow::Result<()> {
    if scm.provider() != ScmProvider::GitHub {
        return Ok(());
    }
    pipeline
        .notify_once(NotificationTarget::CommitStatus, || {
            scm.create_commit_status(
                scm.repository(),
                sha,
                CommitState::Error,
                CODE_ANALYZER_STATUS_CONTEXT,
                description,
            )
        })
        .await?;
    Ok(())
}

/// Input of [`CodeAnalyzer::analyze_changes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeChangesSpec {
    pub package_name: String,
    pub source_control: SourceControlSpec,
}

/// Input of [`CodeAnalyzer::notify_pull_request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyPullRequestSpec {
    pub source_control: SourceControlSpec,
    /// Results of every package analysed successfully.
    pub results: Vec<Value>,
    /// False when some packages could not be analysed at all.
    pub is_code_analysis_complete: bool,
    pub base_branch_results: Option<Value>,
    pub max_comment_count: u32,
}

/// Wall time of one analysis step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDuration {
    pub id: String,
    pub duration_ms: i64,
}

#[async_trait]
pub trait CodeAnalyzer: Send + Sync {
    async fn analyze_changes(&self, spec: &AnalyzeChangesSpec) -> anyhow::Result<Value>;

    /// Post findings on the pull request, capped at `max_comment_count`
    /// comments. Returns the processed results.
    async fn notify_pull_request(&self, spec: &NotifyPullRequestSpec) -> anyhow::Result<Value>;

    async fn notify_non_pull_request_commit(&self, spec: &SourceControlSpec) -> anyhow::Result<()>;

    /// Lossy reduction of results for storage.
    fn trimmed_results(&self, results: &Value) -> Value;

    async fn store_processed_results(
        &self,
        spec: &SourceControlSpec,
        trimmed: &Value,
        durations: &[StepDuration],
    ) -> anyhow::Result<()>;

    async fn analyze_customizations(&self, customer_packages: &[String]) -> anyhow::Result<Value>;

    async fn store_customization_results(
        &self,
        spec: &SourceControlSpec,
        trimmed: &Value,
        customization: &Value,
        durations: &[StepDuration],
    ) -> anyhow::Result<()>;
}

/// A built package artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageArtifact {
    pub name: String,
    pub semantic_version: String,
}

/// Stock behaviour of the build platform that custom steps wrap.
#[async_trait]
pub trait BuildPlatform: Send + Sync {
    /// Run the package's tests.
    async fn test_package(&self, ctx: &StepContext, step: &Step) -> anyhow::Result<StepOutcome>;

    /// Produce the platform's own build summary.
    async fn build_summary(&self, ctx: &StepContext, step: &Step) -> anyhow::Result<StepOutcome>;

    /// Uninstrumented artifact of the package a step builds.
    async fn artifact_for(&self, step: &Step) -> anyhow::Result<PackageArtifact>;

    /// Whether the package can load the code-analysis toolkit.
    async fn has_analyzer_dependency(&self, step: &Step) -> anyhow::Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_for_build_without_pr() {
        let build = Build::new("develop", "abc123").with_packages_path("repo");
        let spec = SourceControlSpec::for_build(&build, "org/repo", &AnalysisConfig::default());
        assert_eq!(spec.pr_url, "");
        assert_eq!(spec.commit_sha, "abc123");
        assert_eq!(spec.packages_path, "repo");
    }

    #[test]
    fn test_commit_state_wire_names() {
        assert_eq!(serde_json::to_value(CommitState::Error).unwrap(), "error");
        assert_eq!(CommitState::Success.to_string(), "success");
    }

    #[test]
    fn test_artifact_uses_camel_case() {
        let artifact = PackageArtifact {
            name: "pkgA".into(),
            semantic_version: "1.0.0".into(),
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["semanticVersion"], "1.0.0");
    }
}
