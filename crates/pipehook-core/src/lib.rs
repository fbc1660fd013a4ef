//! Pipehook Core Library
//!
//! Step-graph scheduling, dependency-aware test avoidance and code-analysis
//! result aggregation for package build pipelines.
//!
//! ## Layout
//!
//! - `scheduler`: dynamic step graph with join barriers, retries and
//!   partial-failure cancellation
//! - `dependency`: package declarations and upstream closure
//! - `aggregation`: per-package result fan-in and once-per-build notifications
//! - `code_analysis`: the step handlers wiring it all together
//! - `collab`: interfaces to source control, the analyzer and the platform

pub mod aggregation;
pub mod code_analysis;
pub mod collab;
pub mod config;
pub mod dependency;
pub mod obs;
pub mod scheduler;
pub mod telemetry;

pub use aggregation::{
    report_ids, resolve_baseline, AggregateReport, AggregateView, AggregationPipeline, Baseline,
    NotificationTarget, ProcessedResults, UnitReport, UnitStatus, BASELINE_CANDIDATES,
};

pub use code_analysis::{
    register_code_analysis_handlers, step_names, CodeAnalysisServices, FOLLOW_ON_MAX_RETRIES,
};

pub use collab::{
    BuildPlatform, CodeAnalyzer, CommitState, CompareResult, PackageArtifact, ScmProvider,
    SourceControl, SourceControlSpec,
};

pub use config::{AnalysisConfig, ConfigError, ConfigProvider, MemoryConfig, SchedulerConfig};

pub use telemetry::init_tracing;

pub use dependency::{
    changed_packages, upstream_closure, upstream_dependencies, DepthLimit, PackageCatalog,
    PackageDecl,
};

pub use scheduler::{
    BuildConclusion, BuildRun, HandlerRegistry, SchedulerError, Step, StepContext, StepHandler,
    StepId, StepInput, StepOutcome, StepScheduler, StepStatus,
};

pub use pipehook_state::{
    Build, BuildHistory, BuildState, MemoryBuildHistory, MemoryReportStore, Report, ReportStore,
};
