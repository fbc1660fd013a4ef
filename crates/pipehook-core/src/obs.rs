//! Structured observability hooks for pipeline builds.
//!
//! This module provides:
//! - A build-scoped tracing span ([`build_span`]) to `instrument` a run with
//! - Emission functions for step lifecycle events: started, finished,
//!   retried, cancelled, steps added, build finished
//!
//! Events are emitted at `info!` level unless noted. Filtering honours
//! `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::{info, warn};

use crate::scheduler::StepStatus;

/// Span tagged with the build id, for `Instrument::instrument`.
pub fn build_span(build_id: &str) -> tracing::Span {
    tracing::info_span!("pipehook.build", build_id = %build_id)
}

/// Emit event: a step handler started.
pub fn emit_step_started(build_id: &str, step_id: &str, name: &str, attempt: u32) {
    info!(
        event = "step.started",
        build_id = %build_id,
        step_id = %step_id,
        name = %name,
        attempt = attempt,
    );
}

/// Emit event: a step settled in a terminal status.
pub fn emit_step_finished(
    build_id: &str,
    step_id: &str,
    status: StepStatus,
    duration_ms: Option<i64>,
) {
    info!(
        event = "step.finished",
        build_id = %build_id,
        step_id = %step_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

/// Emit event: a step failed with an unhandled error and was resubmitted
/// (warning level).
pub fn emit_step_retried(build_id: &str, step_id: &str, attempt: u32, error: &str) {
    warn!(
        event = "step.retried",
        build_id = %build_id,
        step_id = %step_id,
        attempt = attempt,
        error = %error,
    );
}

/// Emit event: a step was cancelled because every path into it failed.
pub fn emit_step_cancelled(build_id: &str, step_id: &str) {
    info!(event = "step.cancelled", build_id = %build_id, step_id = %step_id);
}

/// Emit event: a handler appended follow-on steps.
pub fn emit_steps_added(build_id: &str, origin: &str, count: usize) {
    info!(
        event = "steps.added",
        build_id = %build_id,
        origin = %origin,
        count = count,
    );
}

/// Emit event: the build ran to completion.
pub fn emit_build_finished(build_id: &str, duration_ms: u64, total_steps: usize, conclusion: &str) {
    info!(
        event = "build.finished",
        build_id = %build_id,
        duration_ms = duration_ms,
        total_steps = total_steps,
        conclusion = %conclusion,
    );
}

/// Emit event: a notification was delivered for a target.
pub fn emit_notification_sent(build_id: &str, target: &str) {
    info!(event = "notification.sent", build_id = %build_id, target = %target);
}

/// Emit event: bookkeeping after a build failed (warning level).
pub fn emit_build_finalize_error(build_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "build.finalize_error", build_id = %build_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_span_create() {
        let _span = build_span("test-build-id").entered();
        emit_step_started("test-build-id", "s1", "testPackage", 1);
        emit_step_finished("test-build-id", "s1", StepStatus::Success, Some(3));
    }
}
