//! End-to-end runs of the code-analysis pipeline through the scheduler.

mod common;

use std::sync::atomic::Ordering;

use common::{package_pipeline, pr_build, Harness, StubAnalyzer, StubPlatform, StubScm};
use pipehook_core::config::keys;
use pipehook_core::{
    report_ids, AggregationPipeline, BuildConclusion, ConfigProvider, MemoryConfig, StepStatus,
    UnitReport, UnitStatus,
};
use pipehook_state::{Build, BuildHistory, BuildState, ReportStore};
use serde_json::json;

fn status_of(run: &pipehook_core::BuildRun, id: &str) -> StepStatus {
    run.step(id)
        .unwrap_or_else(|| panic!("step {id} missing"))
        .status
}

// ---- Failure isolation ----

#[tokio::test]
async fn unit_failure_files_error_report_and_siblings_still_run() {
    let h = Harness::new(
        StubScm::github(),
        StubAnalyzer::failing_on(["pkgB"]),
        StubPlatform::default(),
    );
    let run = h
        .run(pr_build("b1"), package_pipeline("b1", &["pkgA", "pkgB", "pkgC"]))
        .await;

    let failed = h
        .reports
        .get_by_id(&report_ids::unit_result("b1", "pkgB"))
        .await
        .unwrap()
        .expect("error report filed");
    let failed: UnitReport = failed.data_as().unwrap();
    assert_eq!(failed.status, UnitStatus::Error);
    assert!(failed.error_message.unwrap().contains("analyzer crashed on pkgB"));

    assert_eq!(status_of(&run, "b1-codeAnalysis-pkgB"), StepStatus::Skipped);
    assert_eq!(status_of(&run, "b1-codeAnalysis-pkgA"), StepStatus::Success);
    assert_eq!(status_of(&run, "b1-codeAnalysis-pkgC"), StepStatus::Success);

    let mut analyzed = h.analyzer.analyzed.lock().unwrap().clone();
    analyzed.sort();
    assert_eq!(analyzed, vec!["pkgA", "pkgC"]);

    assert_eq!(status_of(&run, "b1-buildSummary-codeAnalysisSummary"), StepStatus::Success);
    assert_eq!(run.conclusion, BuildConclusion::Passed);

    let notified = h.analyzer.last_pr_notification().expect("pull request notified");
    assert_eq!(notified.results.len(), 2);
    assert!(notified.is_code_analysis_complete);
    assert_eq!(h.analyzer.pr_notifications.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_outcome_is_kept_when_analysis_setup_fails() {
    let platform = StubPlatform {
        broken_toolkit_lookup: ["pkgB".to_string()].into(),
        ..StubPlatform::default()
    };
    let h = Harness::new(StubScm::github(), StubAnalyzer::default(), platform);
    let run = h
        .run(pr_build("b2"), package_pipeline("b2", &["pkgA", "pkgB"]))
        .await;

    assert_eq!(status_of(&run, "b2-testPackage-pkgB"), StepStatus::Success);
    let inst = run.step("b2-codeAnalysisInstError-pkgB").expect("inst error step");
    assert_eq!(inst.status, StepStatus::NonFatalError);
    assert!(inst
        .error
        .as_deref()
        .unwrap()
        .starts_with("Failed to instantiate code analysis step for pkgB"));
    assert!(run.step("b2-codeAnalysis-pkgB").is_none());

    let view = AggregationPipeline::new(h.reports.as_ref(), "b2")
        .aggregate()
        .await
        .unwrap();
    assert_eq!(view.packages_with(UnitStatus::Error), vec!["pkgB"]);
    assert_eq!(view.packages_with(UnitStatus::Success), vec!["pkgA"]);
    assert_eq!(run.conclusion, BuildConclusion::PassedWithWarnings);
}

#[tokio::test]
async fn missing_toolkit_raises_alert_and_marks_analysis_incomplete() {
    let platform = StubPlatform {
        no_toolkit: ["pkgC".to_string()].into(),
        ..StubPlatform::default()
    };
    let h = Harness::new(StubScm::github(), StubAnalyzer::default(), platform);
    let run = h
        .run(pr_build("b3"), package_pipeline("b3", &["pkgA", "pkgC"]))
        .await;

    let alert = run
        .step("b3-buildSummary-noCodeAnalysisAlert")
        .expect("alert step added");
    assert_eq!(alert.status, StepStatus::NonFatalError);
    assert!(alert.error.as_deref().unwrap().contains("- pkgC"));
    assert_eq!(h.scm.error_statuses(), 1);

    let notified = h.analyzer.last_pr_notification().unwrap();
    assert!(!notified.is_code_analysis_complete);
    assert_eq!(run.conclusion, BuildConclusion::PassedWithWarnings);
}

// ---- Join ----

#[tokio::test]
async fn summary_sees_every_unit_when_children_settle_differently() {
    let platform = StubPlatform {
        no_toolkit: ["pkgC".to_string()].into(),
        ..StubPlatform::default()
    };
    let h = Harness::new(StubScm::github(), StubAnalyzer::failing_on(["pkgB"]), platform);
    let run = h
        .run(pr_build("b11"), package_pipeline("b11", &["pkgA", "pkgB", "pkgC"]))
        .await;

    let view = AggregationPipeline::new(h.reports.as_ref(), "b11")
        .aggregate()
        .await
        .unwrap();
    assert_eq!(view.len(), 3);
    assert_eq!(view.packages_with(UnitStatus::Success), vec!["pkgA"]);
    assert_eq!(view.packages_with(UnitStatus::Error), vec!["pkgB"]);
    assert_eq!(view.packages_with(UnitStatus::NoDependency), vec!["pkgC"]);

    assert_eq!(status_of(&run, "b11-buildSummary"), StepStatus::Success);
    assert_eq!(status_of(&run, "b11-buildSummary-codeAnalysisSummary"), StepStatus::Success);
    let notified = h.analyzer.last_pr_notification().unwrap();
    assert_eq!(notified.results.len(), 1);
    assert!(!notified.is_code_analysis_complete);
    assert_eq!(h.analyzer.pr_notifications.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn build_without_packages_completes_without_a_summary() {
    let h = Harness::new(StubScm::github(), StubAnalyzer::default(), StubPlatform::default());
    let run = h.run(pr_build("b12"), package_pipeline("b12", &[])).await;

    assert_eq!(status_of(&run, "b12-buildSummary"), StepStatus::Success);
    assert!(run.step("b12-buildSummary-codeAnalysisSummary").is_none());
    assert!(run.step("b12-buildSummary-noCodeAnalysisAlert").is_none());
    let view = AggregationPipeline::new(h.reports.as_ref(), "b12")
        .aggregate()
        .await
        .unwrap();
    assert!(view.is_empty());
    assert!(h.analyzer.last_pr_notification().is_none());
    assert_eq!(h.scm.error_statuses(), 0);
    assert_eq!(run.conclusion, BuildConclusion::Passed);
}

// ---- Skipping ----

#[tokio::test]
async fn feature_branch_without_pr_skips_analysis() {
    let h = Harness::new(StubScm::github(), StubAnalyzer::default(), StubPlatform::default());
    let build = Build::new("feature/no-pr", "abc").with_id("b4");
    let run = h.run(build, package_pipeline("b4", &["pkgA", "pkgB"])).await;

    assert!(run.step("b4-codeAnalysis-pkgA").is_none());
    let view = AggregationPipeline::new(h.reports.as_ref(), "b4")
        .aggregate()
        .await
        .unwrap();
    assert!(view.skip_requested());
    assert_eq!(view.packages_with(UnitStatus::Skipped), vec!["pkgA", "pkgB"]);
    assert_eq!(status_of(&run, "b4-buildSummary-codeAnalysisSummary"), StepStatus::Skipped);
    assert!(h.analyzer.last_pr_notification().is_none());
    assert_eq!(run.conclusion, BuildConclusion::Passed);
}

#[tokio::test]
async fn mainline_commit_without_pr_is_analysed_and_stored() {
    let config = MemoryConfig::new().with_value(keys::REPORT_TO_CODE_ANALYTICS, "true");
    let h = Harness::new(StubScm::github(), StubAnalyzer::default(), StubPlatform::default())
        .with_config(config);
    let build = Build::new("develop", "abc").with_id("b5");
    let run = h.run(build, package_pipeline("b5", &["pkgA"])).await;

    assert_eq!(status_of(&run, "b5-codeAnalysis-pkgA"), StepStatus::Success);
    assert_eq!(h.analyzer.non_pr_notifications.load(Ordering::SeqCst), 1);
    assert_eq!(h.analyzer.stored_processed.load(Ordering::SeqCst), 1);
    assert!(h.analyzer.last_pr_notification().is_none());

    let processed = h
        .reports
        .get_by_id(&report_ids::processed_results("b5"))
        .await
        .unwrap()
        .expect("processed results filed");
    assert_eq!(
        processed.data["codeAnalysisResults"]["trimmed"][0]["package"],
        json!("pkgA")
    );
    assert_eq!(h.history.get("b5").await.unwrap().state, BuildState::Done);
}

// ---- Customization analysis ----

#[tokio::test]
async fn customization_sanity_failure_is_non_fatal() {
    let config = MemoryConfig::new()
        .with_value(keys::TOP_LEVEL_CUSTOMER_PACKAGE, "pkgA")
        .with_value(keys::CUSTOMER_PACKAGES, r#"["pkgB"]"#);
    let h = Harness::new(StubScm::github(), StubAnalyzer::default(), StubPlatform::default())
        .with_config(config);
    let run = h.run(pr_build("b6"), package_pipeline("b6", &["pkgA"])).await;

    let summary = run.step("b6-buildSummary-codeAnalysisSummary").unwrap();
    assert_eq!(summary.status, StepStatus::NonFatalError);
    assert!(summary
        .error
        .as_deref()
        .unwrap()
        .contains("Incomplete list of customer packages"));
    assert_eq!(h.scm.error_statuses(), 1);
    assert_eq!(run.conclusion, BuildConclusion::PassedWithWarnings);
}

#[tokio::test]
async fn customization_results_are_stored_for_the_top_level_package() {
    let config = MemoryConfig::new()
        .with_value(keys::TOP_LEVEL_CUSTOMER_PACKAGE, "pkgB")
        .with_value(keys::CUSTOMER_PACKAGES, r#"["pkgA","pkgB"]"#)
        .with_value(keys::REPORT_TO_CODE_ANALYTICS, "true");
    let h = Harness::new(StubScm::github(), StubAnalyzer::default(), StubPlatform::default())
        .with_config(config);
    let build = Build::new("develop", "abc").with_id("b7");
    let run = h.run(build, package_pipeline("b7", &["pkgA", "pkgB"])).await;

    assert_eq!(status_of(&run, "b7-buildSummary-codeAnalysisSummary"), StepStatus::Success);
    assert_eq!(h.analyzer.stored_customization.load(Ordering::SeqCst), 1);
    assert_eq!(h.analyzer.stored_processed.load(Ordering::SeqCst), 0);

    let aggregate = AggregationPipeline::new(h.reports.as_ref(), "b7")
        .aggregate_report()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.root_pkg_artifact.unwrap().name, "pkgB");
}

#[tokio::test]
async fn error_commit_status_is_posted_once_per_build() {
    let config = MemoryConfig::new()
        .with_value(keys::TOP_LEVEL_CUSTOMER_PACKAGE, "pkgA")
        .with_value(keys::CUSTOMER_PACKAGES, r#"["pkgB"]"#);
    let platform = StubPlatform {
        no_toolkit: ["pkgC".to_string()].into(),
        ..StubPlatform::default()
    };
    let h = Harness::new(StubScm::github(), StubAnalyzer::default(), platform).with_config(config);
    let run = h
        .run(pr_build("b13"), package_pipeline("b13", &["pkgA", "pkgC"]))
        .await;

    assert_eq!(
        status_of(&run, "b13-buildSummary-noCodeAnalysisAlert"),
        StepStatus::NonFatalError
    );
    assert_eq!(
        status_of(&run, "b13-buildSummary-codeAnalysisSummary"),
        StepStatus::NonFatalError
    );
    assert_eq!(h.scm.error_statuses(), 1);
    assert!(h
        .reports
        .get_by_id(&report_ids::notified("b13", "commit-status"))
        .await
        .unwrap()
        .is_some());
}

// ---- Test avoidance ----

fn avoidance_step(build_id: &str) -> pipehook_core::Step {
    pipehook_core::Step::builder()
        .id(format!("{build_id}-testAvoidance"))
        .name("testAvoidance")
        .build_id(build_id)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_avoidance_narrows_to_upstream_closure() {
    let scm =
        StubScm::github().with_changed_files(["repo/pkgA/src/a.js", "README.md", "repo/top.json"]);
    let h = Harness::new(scm, StubAnalyzer::default(), StubPlatform::default());
    let run = h.run(pr_build("b8"), vec![avoidance_step("b8")]).await;

    assert_eq!(status_of(&run, "b8-testAvoidance"), StepStatus::Success);
    let include: Vec<String> =
        serde_json::from_str(&h.config.get(keys::PACKAGES_TO_INCLUDE).unwrap()).unwrap();
    assert_eq!(include, vec!["pkgA", "pkgB", "pkgC"]);

    let report = h
        .reports
        .get_by_id(&report_ids::test_avoidance("b8"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.data["changedPackages"], json!(["pkgA"]));
}

#[tokio::test]
async fn test_avoidance_builds_everything_for_large_diffs() {
    let files: Vec<String> = (0..300).map(|i| format!("repo/pkgA/f{i}.js")).collect();
    let h = Harness::new(
        StubScm::github().with_changed_files(files),
        StubAnalyzer::default(),
        StubPlatform::default(),
    );
    h.run(pr_build("b9"), vec![avoidance_step("b9")]).await;
    assert!(h.config.get(keys::PACKAGES_TO_INCLUDE).is_none());
}

#[tokio::test]
async fn test_avoidance_ignores_mainline_branches() {
    let h = Harness::new(
        StubScm::github().with_changed_files(["repo/pkgA/src/a.js"]),
        StubAnalyzer::default(),
        StubPlatform::default(),
    );
    let build = Build::new("develop", "abc").with_id("b10").with_packages_path("repo");
    h.run(build, vec![avoidance_step("b10")]).await;
    assert!(h.config.get(keys::PACKAGES_TO_INCLUDE).is_none());
}

#[tokio::test]
async fn test_avoidance_failure_still_builds_everything() {
    let h = Harness::new(
        StubScm::github().with_compare_error("compare API rate limited"),
        StubAnalyzer::default(),
        StubPlatform::default(),
    );
    let mut steps = package_pipeline("b14", &["pkgA"]);
    let first = steps[0].id.clone();
    let avoidance = pipehook_core::Step::builder()
        .id("b14-testAvoidance")
        .name("testAvoidance")
        .next(Some(first))
        .build_id("b14")
        .build()
        .unwrap();
    steps.insert(0, avoidance);
    let run = h.run(pr_build("b14"), steps).await;

    assert_eq!(status_of(&run, "b14-testAvoidance"), StepStatus::Success);
    assert!(h.config.get(keys::PACKAGES_TO_INCLUDE).is_none());
    assert!(h
        .reports
        .get_by_id(&report_ids::test_avoidance("b14"))
        .await
        .unwrap()
        .is_none());
    assert_eq!(status_of(&run, "b14-testPackage-pkgA"), StepStatus::Success);
    assert_eq!(run.conclusion, BuildConclusion::Passed);
}
