//! Code-analysis steps layered on top of the stock package pipeline.
//!
//! `testPackage` fans out one `codeAnalysis` step per package; every
//! package files a [`UnitReport`](crate::aggregation::UnitReport) under the
//! build's aggregate report. `buildSummary` is the join point: it adds
//! `codeAnalysisSummary` (which notifies the pull request once) and, when
//! packages lack the analyzer toolkit, `noCodeAnalysisAlert`.
//! `testAvoidance` runs earlier, narrowing the package set from the diff.

mod analyze;
mod build_summary;
mod inst_error;
mod no_analysis_alert;
mod summary;
mod test_avoidance;
mod test_package;

use std::sync::Arc;

use pipehook_state::BuildHistory;

use crate::collab::{BuildPlatform, CodeAnalyzer, SourceControl};
use crate::dependency::PackageCatalog;
use crate::scheduler::{HandlerRegistry, SchedulerResult, Step, StepId, StepInput};

pub use analyze::CodeAnalysisHandler;
pub use build_summary::BuildSummaryHandler;
pub use inst_error::InstErrorHandler;
pub use no_analysis_alert::NoAnalysisAlertHandler;
pub use summary::CodeAnalysisSummaryHandler;
pub use test_avoidance::{TestAvoidanceHandler, AVOIDANCE_FILE_LIMIT};
pub use test_package::TestPackageHandler;

/// Step names handled by this module.
pub mod step_names {
    pub const TEST_PACKAGE: &str = "testPackage";
    pub const CODE_ANALYSIS: &str = "codeAnalysis";
    pub const CODE_ANALYSIS_INST_ERROR: &str = "codeAnalysisInstError";
    pub const BUILD_SUMMARY: &str = "buildSummary";
    pub const NO_CODE_ANALYSIS_ALERT: &str = "noCodeAnalysisAlert";
    pub const CODE_ANALYSIS_SUMMARY: &str = "codeAnalysisSummary";
    pub const TEST_AVOIDANCE: &str = "testAvoidance";
}

/// Retry budget of every follow-on step added by these handlers.
pub const FOLLOW_ON_MAX_RETRIES: u32 = 3;

/// Input keys shared between the steps.
pub mod input_keys {
    pub const PKG_NAME: &str = "pkgName";
    pub const CUSTOM_PKG_NAME: &str = "customPkgName";
    pub const CUSTOM_PKG_VERSION: &str = "customPkgVersion";
    pub const ERROR_MESSAGE: &str = "errorMessage";
    pub const NO_CODE_ANALYSIS_DEP_PKGS: &str = "noCodeAnalysisDepPkgs";
    pub const BASE_BRANCH: &str = "baseBranch";
    pub const BASE_BRANCH_RESULTS: &str = "baseBranchResults";
    pub const IS_CODE_ANALYSIS_COMPLETE: &str = "isCodeAnalysisComplete";
    pub const STEP_DURATIONS: &str = "codeAnalysisStepsWithDuration";
    pub const ROOT_PKG_ARTIFACT: &str = "rootPkgArtifact";
    pub const REPORT_TO_CODE_ANALYTICS: &str = "reportResultsToCodeAnalytics";
}

/// Collaborators shared by the code-analysis handlers.
#[derive(Clone)]
pub struct CodeAnalysisServices {
    pub source_control: Arc<dyn SourceControl>,
    pub analyzer: Arc<dyn CodeAnalyzer>,
    pub platform: Arc<dyn BuildPlatform>,
    pub packages: Arc<dyn PackageCatalog>,
    pub history: Arc<dyn BuildHistory>,
}

/// Register every code-analysis handler under its step name.
pub fn register_code_analysis_handlers(
    registry: &mut HandlerRegistry,
    services: &CodeAnalysisServices,
) {
    registry
        .register(
            step_names::TEST_PACKAGE,
            Arc::new(TestPackageHandler::new(services.platform.clone())),
        )
        .register(
            step_names::CODE_ANALYSIS,
            Arc::new(CodeAnalysisHandler::new(
                services.source_control.clone(),
                services.analyzer.clone(),
            )),
        )
        .register(step_names::CODE_ANALYSIS_INST_ERROR, Arc::new(InstErrorHandler))
        .register(
            step_names::BUILD_SUMMARY,
            Arc::new(BuildSummaryHandler::new(
                services.platform.clone(),
                services.source_control.clone(),
                services.history.clone(),
            )),
        )
        .register(
            step_names::NO_CODE_ANALYSIS_ALERT,
            Arc::new(NoAnalysisAlertHandler::new(services.source_control.clone())),
        )
        .register(
            step_names::CODE_ANALYSIS_SUMMARY,
            Arc::new(CodeAnalysisSummaryHandler::new(
                services.source_control.clone(),
                services.analyzer.clone(),
            )),
        )
        .register(
            step_names::TEST_AVOIDANCE,
            Arc::new(TestAvoidanceHandler::new(
                services.source_control.clone(),
                services.packages.clone(),
            )),
        );
}

/// Follow-on step of `origin` that continues to `origin.next`.
fn follow_on(origin: &Step, id: StepId, name: &str, input: StepInput) -> SchedulerResult<Step> {
    Step::builder()
        .id(id)
        .name(name)
        .input(input)
        .next(origin.next.clone())
        .build_id(origin.build_id.clone())
        .max_retries(FOLLOW_ON_MAX_RETRIES)
        .build()
}
