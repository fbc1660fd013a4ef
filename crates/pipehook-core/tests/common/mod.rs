//! Shared stubs for the pipeline integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use pipehook_core::collab::{
    AnalyzeChangesSpec, BuildPlatform, CodeAnalyzer, CommitState, CompareResult,
    NotifyPullRequestSpec, PackageArtifact, ScmProvider, SourceControl, SourceControlSpec,
    StepDuration,
};
use pipehook_core::dependency::{PackageDecl, StaticPackageCatalog};
use pipehook_core::{
    register_code_analysis_handlers, step_names, BuildRun, CodeAnalysisServices, HandlerRegistry,
    MemoryConfig, Step, StepContext, StepId, StepInput, StepOutcome, StepScheduler,
};
use pipehook_state::{Build, BuildHistory, MemoryBuildHistory, MemoryReportStore};
use serde_json::{json, Value};

// ---- Source control ----

pub struct StubScm {
    pub provider: ScmProvider,
    pub changed_files: Vec<String>,
    pub base_branch: String,
    pub statuses: Mutex<Vec<(CommitState, String, String)>>,
    pub base_branch_calls: AtomicUsize,
    pub compare_error: Option<String>,
}

impl StubScm {
    pub fn github() -> Self {
        Self {
            provider: ScmProvider::GitHub,
            changed_files: Vec::new(),
            base_branch: "develop".to_string(),
            statuses: Mutex::new(Vec::new()),
            base_branch_calls: AtomicUsize::new(0),
            compare_error: None,
        }
    }

    pub fn with_changed_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_compare_error(mut self, message: &str) -> Self {
        self.compare_error = Some(message.to_string());
        self
    }

    pub fn error_statuses(&self) -> usize {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(state, _, _)| *state == CommitState::Error)
            .count()
    }
}

#[async_trait]
impl SourceControl for StubScm {
    fn provider(&self) -> ScmProvider {
        self.provider
    }

    fn repository(&self) -> &str {
        "acme/monorepo"
    }

    async fn compare(
        &self,
        _repo: &str,
        _base: &str,
        _head: &str,
    ) -> anyhow::Result<CompareResult> {
        if let Some(message) = &self.compare_error {
            bail!("{message}");
        }
        Ok(CompareResult::from_filenames(self.changed_files.clone()))
    }

    async fn create_commit_status(
        &self,
        _repo: &str,
        _sha: &str,
        state: CommitState,
        context: &str,
        description: &str,
    ) -> anyhow::Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((state, context.to_string(), description.to_string()));
        Ok(())
    }

    async fn base_branch_name(&self, _spec: &SourceControlSpec) -> anyhow::Result<String> {
        self.base_branch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.base_branch.clone())
    }
}

// ---- Analyzer ----

#[derive(Default)]
pub struct StubAnalyzer {
    pub failing: HashSet<String>,
    pub analyzed: Mutex<Vec<String>>,
    pub pr_notifications: Mutex<Vec<NotifyPullRequestSpec>>,
    pub non_pr_notifications: AtomicUsize,
    pub stored_processed: AtomicUsize,
    pub stored_customization: AtomicUsize,
}

impl StubAnalyzer {
    pub fn failing_on<I: IntoIterator<Item = S>, S: Into<String>>(packages: I) -> Self {
        Self {
            failing: packages.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn last_pr_notification(&self) -> Option<NotifyPullRequestSpec> {
        self.pr_notifications.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl CodeAnalyzer for StubAnalyzer {
    async fn analyze_changes(&self, spec: &AnalyzeChangesSpec) -> anyhow::Result<Value> {
        if self.failing.contains(&spec.package_name) {
            bail!("analyzer crashed on {}", spec.package_name);
        }
        self.analyzed.lock().unwrap().push(spec.package_name.clone());
        Ok(json!({ "package": spec.package_name, "violations": 1 }))
    }

    async fn notify_pull_request(&self, spec: &NotifyPullRequestSpec) -> anyhow::Result<Value> {
        self.pr_notifications.lock().unwrap().push(spec.clone());
        Ok(json!({ "processed": spec.results.len() }))
    }

    async fn notify_non_pull_request_commit(
        &self,
        _spec: &SourceControlSpec,
    ) -> anyhow::Result<()> {
        self.non_pr_notifications.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn trimmed_results(&self, results: &Value) -> Value {
        json!({ "trimmed": results })
    }

    async fn store_processed_results(
        &self,
        _spec: &SourceControlSpec,
        _trimmed: &Value,
        _durations: &[StepDuration],
    ) -> anyhow::Result<()> {
        self.stored_processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn analyze_customizations(&self, customer_packages: &[String]) -> anyhow::Result<Value> {
        Ok(json!({ "customerPackages": customer_packages }))
    }

    async fn store_customization_results(
        &self,
        _spec: &SourceControlSpec,
        _trimmed: &Value,
        _customization: &Value,
        _durations: &[StepDuration],
    ) -> anyhow::Result<()> {
        self.stored_customization.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---- Platform ----

#[derive(Default)]
pub struct StubPlatform {
    /// Packages without the analyzer toolkit dependency.
    pub no_toolkit: HashSet<String>,
    /// Packages whose toolkit lookup errors out.
    pub broken_toolkit_lookup: HashSet<String>,
    /// Packages whose tests fail.
    pub failing_tests: HashSet<String>,
}

fn package_of(step: &Step) -> String {
    step.input.text("pkgName").unwrap_or_default().to_string()
}

#[async_trait]
impl BuildPlatform for StubPlatform {
    async fn test_package(&self, _ctx: &StepContext, step: &Step) -> anyhow::Result<StepOutcome> {
        if self.failing_tests.contains(&package_of(step)) {
            return Ok(StepOutcome::non_fatal("test failures"));
        }
        Ok(StepOutcome::success())
    }

    async fn build_summary(&self, _ctx: &StepContext, _step: &Step) -> anyhow::Result<StepOutcome> {
        Ok(StepOutcome::success())
    }

    async fn artifact_for(&self, step: &Step) -> anyhow::Result<PackageArtifact> {
        Ok(PackageArtifact {
            name: package_of(step),
            semantic_version: "1.0.0".to_string(),
        })
    }

    async fn has_analyzer_dependency(&self, step: &Step) -> anyhow::Result<bool> {
        let package = package_of(step);
        if self.broken_toolkit_lookup.contains(&package) {
            bail!("app for {package} failed to start");
        }
        Ok(!self.no_toolkit.contains(&package))
    }
}

// ---- Harness ----

pub struct Harness {
    pub reports: Arc<MemoryReportStore>,
    pub history: Arc<MemoryBuildHistory>,
    pub config: Arc<MemoryConfig>,
    pub scm: Arc<StubScm>,
    pub analyzer: Arc<StubAnalyzer>,
    pub platform: Arc<StubPlatform>,
    pub decls: Vec<PackageDecl>,
}

impl Harness {
    pub fn new(scm: StubScm, analyzer: StubAnalyzer, platform: StubPlatform) -> Self {
        Self {
            reports: Arc::new(MemoryReportStore::new()),
            history: Arc::new(MemoryBuildHistory::new()),
            config: Arc::new(MemoryConfig::new()),
            scm: Arc::new(scm),
            analyzer: Arc::new(analyzer),
            platform: Arc::new(platform),
            decls: chain_decls(),
        }
    }

    pub fn with_config(mut self, config: MemoryConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn registry(&self) -> HandlerRegistry {
        let services = CodeAnalysisServices {
            source_control: self.scm.clone(),
            analyzer: self.analyzer.clone(),
            platform: self.platform.clone(),
            packages: Arc::new(StaticPackageCatalog::new(self.decls.clone())),
            history: self.history.clone(),
        };
        let mut registry = HandlerRegistry::new();
        register_code_analysis_handlers(&mut registry, &services);
        registry
    }

    pub async fn run(&self, build: Build, steps: Vec<Step>) -> BuildRun {
        self.history.register(build.clone()).await.unwrap();
        let mut scheduler = StepScheduler::new(
            build,
            self.registry(),
            self.reports.clone(),
            self.config.clone(),
        )
        .with_history(self.history.clone());
        scheduler.add_steps(steps).unwrap();
        scheduler.run().await.unwrap()
    }
}

/// pkgA <- pkgB <- pkgC
pub fn chain_decls() -> Vec<PackageDecl> {
    vec![
        PackageDecl::new("pkgA", Vec::<String>::new()),
        PackageDecl::new("pkgB", ["pkgA"]),
        PackageDecl::new("pkgC", ["pkgB"]),
    ]
}

/// One `testPackage` step per package, all joining on `buildSummary`.
pub fn package_pipeline(build_id: &str, packages: &[&str]) -> Vec<Step> {
    let summary_id = StepId::new(format!("{build_id}-{}", step_names::BUILD_SUMMARY));
    let mut steps: Vec<Step> = packages
        .iter()
        .map(|pkg| {
            Step::builder()
                .id(format!("{build_id}-{}-{pkg}", step_names::TEST_PACKAGE))
                .name(step_names::TEST_PACKAGE)
                .input(StepInput::new().with("pkgName", *pkg))
                .next(Some(summary_id.clone()))
                .build_id(build_id)
                .build()
                .unwrap()
        })
        .collect();
    steps.push(
        Step::builder()
            .id(summary_id)
            .name(step_names::BUILD_SUMMARY)
            .build_id(build_id)
            .build()
            .unwrap(),
    );
    steps
}

pub fn pr_build(id: &str) -> Build {
    Build::new("feature/widgets", "cafebabe")
        .with_id(id)
        .with_pr_url("https://github.com/acme/monorepo/pull/7")
        .with_packages_path("repo")
}
