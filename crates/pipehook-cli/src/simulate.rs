//! Offline pipeline simulation driven by a JSON manifest.
//!
//! The manifest describes a build, its packages and how each collaborator
//! should behave. Source control, the analyzer and the build platform are
//! replaced by in-process stand-ins that answer from the manifest, so the
//! real step handlers can be exercised without any network access.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use pipehook_core::collab::{
    AnalyzeChangesSpec, BuildPlatform, CodeAnalyzer, CommitState, CompareResult,
    NotifyPullRequestSpec, PackageArtifact, ScmProvider, SourceControl, SourceControlSpec,
    StepDuration,
};
use pipehook_core::config::keys;
use pipehook_core::dependency::StaticPackageCatalog;
use pipehook_core::{
    register_code_analysis_handlers, step_names, BuildRun, CodeAnalysisServices, ConfigProvider,
    HandlerRegistry, MemoryConfig, PackageDecl, SchedulerConfig, Step, StepContext, StepId,
    StepInput, StepOutcome, StepScheduler,
};
use pipehook_state::{Build, BuildHistory, MemoryBuildHistory, MemoryReportStore, ReportStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

/// Input of `pipehook simulate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub build: ManifestBuild,
    pub packages: Vec<PackageDecl>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    /// Packages whose analysis fails.
    #[serde(default)]
    pub failing_analysis: BTreeSet<String>,
    /// Packages without the analyzer toolkit dependency.
    #[serde(default)]
    pub without_toolkit: BTreeSet<String>,
    /// Packages whose tests fail.
    #[serde(default)]
    pub failing_tests: BTreeSet<String>,
    /// Build configuration values, as the platform stores them.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub test_avoidance: bool,
    #[serde(default)]
    pub github: Option<bool>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub max_parallel_steps: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestBuild {
    pub id: String,
    pub branch: String,
    pub sha: String,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub packages_path: String,
    #[serde(default)]
    pub branch_group_base: Option<String>,
}

impl ManifestBuild {
    fn to_build(&self) -> Build {
        let mut build = Build::new(&self.branch, &self.sha)
            .with_id(&self.id)
            .with_packages_path(&self.packages_path);
        if let Some(url) = &self.pr_url {
            build = build.with_pr_url(url);
        }
        if let Some(base) = &self.branch_group_base {
            build = build.with_branch_group_base(base);
        }
        build
    }
}

/// Everything a simulation observed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub run: BuildRun,
    pub packages_to_include: Option<Value>,
    pub reports: Vec<Value>,
    pub commit_statuses: Vec<Value>,
    pub notifications: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Stand-in collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Recorder {
    statuses: std::sync::Mutex<Vec<Value>>,
    notifications: std::sync::Mutex<Vec<Value>>,
}

impl Recorder {
    fn push(list: &std::sync::Mutex<Vec<Value>>, value: Value) {
        list.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(value);
    }

    fn take(list: &std::sync::Mutex<Vec<Value>>) -> Vec<Value> {
        std::mem::take(&mut *list.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }
}

struct ManifestScm {
    manifest: Arc<Manifest>,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl SourceControl for ManifestScm {
    fn provider(&self) -> ScmProvider {
        if self.manifest.github.unwrap_or(true) {
            ScmProvider::GitHub
        } else {
            ScmProvider::Other
        }
    }

    fn repository(&self) -> &str {
        "simulated/repository"
    }

    async fn compare(&self, _repo: &str, _base: &str, _head: &str) -> Result<CompareResult> {
        Ok(CompareResult::from_filenames(self.manifest.changed_files.clone()))
    }

    async fn create_commit_status(
        &self,
        _repo: &str,
        sha: &str,
        state: CommitState,
        context: &str,
        description: &str,
    ) -> Result<()> {
        Recorder::push(
            &self.recorder.statuses,
            json!({ "sha": sha, "state": state, "context": context, "description": description }),
        );
        Ok(())
    }

    async fn base_branch_name(&self, _spec: &SourceControlSpec) -> Result<String> {
        Ok(self
            .manifest
            .base_branch
            .clone()
            .unwrap_or_else(|| "develop".to_string()))
    }
}

struct ManifestAnalyzer {
    manifest: Arc<Manifest>,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl CodeAnalyzer for ManifestAnalyzer {
    async fn analyze_changes(&self, spec: &AnalyzeChangesSpec) -> Result<Value> {
        if self.manifest.failing_analysis.contains(&spec.package_name) {
            bail!("simulated analyzer failure for {}", spec.package_name);
        }
        Ok(json!({ "packageName": spec.package_name, "issues": [] }))
    }

    async fn notify_pull_request(&self, spec: &NotifyPullRequestSpec) -> Result<Value> {
        Recorder::push(
            &self.recorder.notifications,
            json!({
                "kind": "pullRequest",
                "results": spec.results.len(),
                "complete": spec.is_code_analysis_complete,
                "hasBaseline": spec.base_branch_results.is_some(),
            }),
        );
        Ok(Value::Array(spec.results.clone()))
    }

    async fn notify_non_pull_request_commit(&self, spec: &SourceControlSpec) -> Result<()> {
        Recorder::push(
            &self.recorder.notifications,
            json!({ "kind": "commit", "sha": spec.commit_sha }),
        );
        Ok(())
    }

    fn trimmed_results(&self, results: &Value) -> Value {
        results.clone()
    }

    async fn store_processed_results(
        &self,
        _spec: &SourceControlSpec,
        _trimmed: &Value,
        durations: &[StepDuration],
    ) -> Result<()> {
        Recorder::push(
            &self.recorder.notifications,
            json!({ "kind": "analytics", "steps": durations.len() }),
        );
        Ok(())
    }

    async fn analyze_customizations(&self, customer_packages: &[String]) -> Result<Value> {
        Ok(json!({ "customerPackages": customer_packages }))
    }

    async fn store_customization_results(
        &self,
        _spec: &SourceControlSpec,
        _trimmed: &Value,
        _customization: &Value,
        durations: &[StepDuration],
    ) -> Result<()> {
        Recorder::push(
            &self.recorder.notifications,
            json!({ "kind": "customizationAnalytics", "steps": durations.len() }),
        );
        Ok(())
    }
}

struct ManifestPlatform {
    manifest: Arc<Manifest>,
}

impl ManifestPlatform {
    fn package(step: &Step) -> &str {
        step.input.text("pkgName").unwrap_or_default()
    }
}

#[async_trait]
impl BuildPlatform for ManifestPlatform {
    async fn test_package(&self, _ctx: &StepContext, step: &Step) -> Result<StepOutcome> {
        if self.manifest.failing_tests.contains(Self::package(step)) {
            return Ok(StepOutcome::non_fatal("simulated test failures"));
        }
        Ok(StepOutcome::success())
    }

    async fn build_summary(&self, _ctx: &StepContext, _step: &Step) -> Result<StepOutcome> {
        Ok(StepOutcome::success())
    }

    async fn artifact_for(&self, step: &Step) -> Result<PackageArtifact> {
        Ok(PackageArtifact {
            name: Self::package(step).to_string(),
            semantic_version: "0.0.0-simulated".to_string(),
        })
    }

    async fn has_analyzer_dependency(&self, step: &Step) -> Result<bool> {
        Ok(!self.manifest.without_toolkit.contains(Self::package(step)))
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Steps of a package build: optional test avoidance, one test step per
/// package, and the build summary joining them.
pub fn pipeline_steps(manifest: &Manifest) -> Result<Vec<Step>> {
    let build_id = &manifest.build.id;
    let summary = StepId::new(format!("{build_id}-{}", step_names::BUILD_SUMMARY));
    let mut steps = Vec::with_capacity(manifest.packages.len() + 2);

    if manifest.test_avoidance {
        steps.push(
            Step::builder()
                .id(format!("{build_id}-{}", step_names::TEST_AVOIDANCE))
                .name(step_names::TEST_AVOIDANCE)
                .build_id(build_id)
                .build()?,
        );
    }
    for decl in &manifest.packages {
        steps.push(
            Step::builder()
                .id(format!("{build_id}-{}-{}", step_names::TEST_PACKAGE, decl.name))
                .name(step_names::TEST_PACKAGE)
                .input(StepInput::new().with("pkgName", decl.name.as_str()))
                .next(Some(summary.clone()))
                .build_id(build_id)
                .build()?,
        );
    }
    steps.push(
        Step::builder()
            .id(summary)
            .name(step_names::BUILD_SUMMARY)
            .build_id(build_id)
            .build()?,
    );
    Ok(steps)
}

pub async fn simulate(manifest: Manifest) -> Result<SimulationReport> {
    let manifest = Arc::new(manifest);
    let recorder = Arc::new(Recorder::default());
    let build = manifest.build.to_build();

    let reports = Arc::new(MemoryReportStore::new());
    let history = Arc::new(MemoryBuildHistory::new());
    let config = Arc::new(MemoryConfig::from_values(
        manifest.config.clone().into_iter().collect(),
    ));

    let services = CodeAnalysisServices {
        source_control: Arc::new(ManifestScm {
            manifest: Arc::clone(&manifest),
            recorder: Arc::clone(&recorder),
        }),
        analyzer: Arc::new(ManifestAnalyzer {
            manifest: Arc::clone(&manifest),
            recorder: Arc::clone(&recorder),
        }),
        platform: Arc::new(ManifestPlatform {
            manifest: Arc::clone(&manifest),
        }),
        packages: Arc::new(StaticPackageCatalog::new(manifest.packages.clone())),
        history: history.clone(),
    };
    let mut registry = HandlerRegistry::new();
    register_code_analysis_handlers(&mut registry, &services);

    history.register(build.clone()).await?;
    let mut settings = SchedulerConfig::default();
    if let Some(max) = manifest.max_parallel_steps {
        settings.max_parallel_steps = max;
    }
    let mut scheduler = StepScheduler::new(build, registry, reports.clone(), config.clone())
        .with_settings(settings)
        .with_history(history);
    let added = scheduler.add_steps(pipeline_steps(&manifest)?)?;
    info!(build_id = %manifest.build.id, steps = added.len(), "simulation started");

    let run = scheduler.run().await?;
    let packages_to_include = config
        .get(keys::PACKAGES_TO_INCLUDE)
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;
    let reports = reports
        .reports_for_build(&manifest.build.id)
        .await?
        .into_iter()
        .map(|r| json!({ "id": r.id, "parent": r.parent, "data": r.data }))
        .collect();

    Ok(SimulationReport {
        run,
        packages_to_include,
        reports,
        commit_statuses: Recorder::take(&recorder.statuses),
        notifications: Recorder::take(&recorder.notifications),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipehook_core::{BuildConclusion, StepStatus};

    fn manifest(raw: Value) -> Manifest {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_pipeline_steps_join_on_summary() {
        let m = manifest(json!({
            "build": { "id": "b1", "branch": "develop", "sha": "abc" },
            "packages": [{ "name": "a" }, { "name": "b", "dependencies": ["a"] }],
            "testAvoidance": true,
        }));
        let steps = pipeline_steps(&m).unwrap();
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].name, "testAvoidance");
        assert_eq!(steps[1].next.as_ref().unwrap().as_str(), "b1-buildSummary");
        assert!(steps[3].next.is_none());
    }

    #[tokio::test]
    async fn test_simulated_pull_request_build() {
        let m = manifest(json!({
            "build": {
                "id": "b1",
                "branch": "feature/x",
                "sha": "abc",
                "prUrl": "https://example.test/pr/1",
                "packagesPath": "pkgs"
            },
            "packages": [{ "name": "a" }, { "name": "b", "dependencies": ["a"] }],
            "changedFiles": ["pkgs/a/src/lib.js"],
            "failingAnalysis": ["b"],
            "testAvoidance": true,
        }));
        let report = simulate(m).await.unwrap();

        assert_eq!(report.run.conclusion, BuildConclusion::Passed);
        assert_eq!(report.run.step("b1-codeAnalysis-b").unwrap().status, StepStatus::Skipped);
        assert_eq!(report.packages_to_include, Some(json!(["a", "b"])));
        assert_eq!(report.notifications.len(), 1);
        assert_eq!(report.notifications[0]["results"], json!(1));
    }
}
