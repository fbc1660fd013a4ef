//! The step-graph scheduler.
//!
//! The step graph is data: an append-only table of [`StepRecord`]s keyed by
//! id plus a FIFO of steps ready to run. A step's `next` is an id, so the
//! whole table can be serialized between scheduling rounds.
//!
//! A step is *ready* once every step whose `next` names it has settled and at
//! least one of them allows continuation. When all of them ended in
//! `FATAL_ERROR` (or were themselves cancelled) the step is `CANCELLED`, and
//! the cancellation follows its own `next` link. Steps reachable through a
//! surviving predecessor are untouched.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use pipehook_state::{Build, BuildHistory, BuildState, ReportStore};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, warn, Instrument};

use crate::config::{ConfigProvider, SchedulerConfig};
use crate::obs;
use crate::scheduler::error::{SchedulerError, SchedulerResult};
use crate::scheduler::handler::{HandlerRegistry, StepContext};
use crate::scheduler::outcome::{StepOutcome, StepResult};
use crate::scheduler::step::{Step, StepId, StepRecord, StepStatus};

// ---------------------------------------------------------------------------
// Step table
// ---------------------------------------------------------------------------

/// Serializable scheduling state of one build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepTable {
    records: Vec<StepRecord>,
    index: HashMap<StepId, usize>,
    queue: VecDeque<StepId>,
}

impl StepTable {
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn get(&self, id: &StepId) -> Option<&StepRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    /// Ids waiting for a handler slot, in dispatch order.
    pub fn ready(&self) -> impl Iterator<Item = &StepId> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn get_mut(&mut self, id: &StepId) -> SchedulerResult<&mut StepRecord> {
        let idx = *self.index.get(id).ok_or_else(|| SchedulerError::StepNotFound {
            id: id.to_string(),
        })?;
        Ok(&mut self.records[idx])
    }

    fn predecessors<'a>(&'a self, id: &'a StepId) -> impl Iterator<Item = &'a StepRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.step.next.as_ref() == Some(id))
    }

    fn is_queued(&self, id: &StepId) -> bool {
        self.queue.contains(id)
    }

    /// Re-evaluate `start` and, through cancellation, everything after it.
    fn release(&mut self, start: StepId, released: &mut Vec<StepId>, cancelled: &mut Vec<StepId>) {
        let mut work = vec![start];
        while let Some(id) = work.pop() {
            let Some(&idx) = self.index.get(&id) else {
                continue;
            };
            if self.records[idx].status != StepStatus::Pending || self.is_queued(&id) {
                continue;
            }

            let mut any = false;
            let mut all_settled = true;
            let mut any_continues = false;
            for pred in self.predecessors(&id) {
                any = true;
                all_settled &= pred.status.is_terminal();
                any_continues |= pred.status.allows_continuation();
            }

            if !any || (all_settled && any_continues) {
                self.queue.push_back(id.clone());
                released.push(id);
            } else if all_settled {
                let record = &mut self.records[idx];
                record.transition(StepStatus::Cancelled);
                record.error = Some("every preceding step failed".to_string());
                if let Some(next) = record.step.next.clone() {
                    work.push(next);
                }
                cancelled.push(id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Advance / run results
// ---------------------------------------------------------------------------

/// Effect of recording a handler result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The step failed and was resubmitted; `attempt` is the failed attempt.
    Retried { attempt: u32 },
    /// The step reached a terminal status.
    Settled {
        status: StepStatus,
        /// Steps that became ready as a result.
        released: Vec<StepId>,
        /// Steps cancelled as a result.
        cancelled: Vec<StepId>,
    },
}

/// Overall result of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildConclusion {
    Passed,
    PassedWithWarnings,
    Failed,
}

impl BuildConclusion {
    fn from_records(records: &[StepRecord]) -> Self {
        let failed = records
            .iter()
            .any(|r| matches!(r.status, StepStatus::FatalError | StepStatus::Cancelled));
        let warned = records.iter().any(|r| r.status == StepStatus::NonFatalError);
        if failed {
            BuildConclusion::Failed
        } else if warned {
            BuildConclusion::PassedWithWarnings
        } else {
            BuildConclusion::Passed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildConclusion::Passed => "passed",
            BuildConclusion::PassedWithWarnings => "passed_with_warnings",
            BuildConclusion::Failed => "failed",
        }
    }
}

/// Summary returned by [`StepScheduler::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRun {
    pub build_id: String,
    pub conclusion: BuildConclusion,
    pub steps: Vec<StepRecord>,
    pub duration_ms: u64,
}

impl BuildRun {
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|r| r.status == status).count()
    }

    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.step.id.as_str() == id)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Runs the dynamic step graph of a single build.
pub struct StepScheduler {
    build: Build,
    registry: HandlerRegistry,
    reports: Arc<dyn ReportStore>,
    config: Arc<dyn ConfigProvider>,
    settings: SchedulerConfig,
    history: Option<Arc<dyn BuildHistory>>,
    table: StepTable,
}

impl StepScheduler {
    pub fn new(
        build: Build,
        registry: HandlerRegistry,
        reports: Arc<dyn ReportStore>,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self {
            build,
            registry,
            reports,
            config,
            settings: SchedulerConfig::default(),
            history: None,
            table: StepTable::default(),
        }
    }

    pub fn with_settings(mut self, settings: SchedulerConfig) -> Self {
        self.settings = settings;
        self
    }

    /// Record the build's terminal state in `history` when the run ends.
    pub fn with_history(mut self, history: Arc<dyn BuildHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn build(&self) -> &Build {
        &self.build
    }

    pub fn table(&self) -> &StepTable {
        &self.table
    }

    /// Append steps to the build.
    ///
    /// The batch is validated as a whole and rejected without side effects
    /// on a duplicate id, a step from another build, or an unregistered
    /// handler name. A pending step that is gaining a new predecessor is
    /// taken back out of the ready queue until that predecessor settles.
    pub fn add_steps(&mut self, steps: Vec<Step>) -> SchedulerResult<Vec<StepId>> {
        let mut incoming: HashSet<&StepId> = HashSet::new();
        for step in &steps {
            if step.build_id != self.build.id {
                return Err(SchedulerError::ForeignStep {
                    id: step.id.to_string(),
                    step_build: step.build_id.clone(),
                    build: self.build.id.clone(),
                });
            }
            if self.table.index.contains_key(&step.id) || !incoming.insert(&step.id) {
                return Err(SchedulerError::DuplicateStep {
                    id: step.id.to_string(),
                });
            }
            if !self.registry.contains(&step.name) {
                return Err(SchedulerError::UnknownHandler {
                    id: step.id.to_string(),
                    name: step.name.clone(),
                });
            }
        }

        let ids: Vec<StepId> = steps.iter().map(|s| s.id.clone()).collect();
        for step in steps {
            // A queued retry keeps its slot; only not-yet-started steps wait
            // for the new predecessor.
            if let Some(next) = &step.next {
                if self.table.get(next).map(|r| r.status) == Some(StepStatus::Pending) {
                    self.table.queue.retain(|queued| queued != next);
                }
            }
            self.table.index.insert(step.id.clone(), self.table.records.len());
            self.table.records.push(StepRecord::new(step));
        }

        let mut released = Vec::new();
        let mut cancelled = Vec::new();
        for id in &ids {
            self.table.release(id.clone(), &mut released, &mut cancelled);
        }
        for id in &cancelled {
            obs::emit_step_cancelled(&self.build.id, id.as_str());
        }
        debug!(build_id = %self.build.id, added = ids.len(), ready = released.len(), "steps added");
        Ok(ids)
    }

    /// Take the next ready step and mark it running.
    ///
    /// Returns the step and its 1-based attempt number.
    pub fn dispatch_next(&mut self) -> Option<(Step, u32)> {
        let id = self.table.queue.pop_front()?;
        let record = self.table.get_mut(&id).ok()?;
        record.attempts += 1;
        record.transition(StepStatus::Running);
        Some((record.step.clone(), record.attempts))
    }

    /// Record the result of a running step.
    pub fn advance(&mut self, id: &StepId, result: StepResult) -> SchedulerResult<Advance> {
        let build_id = self.build.id.clone();
        let record = self.table.get_mut(id)?;
        if record.status != StepStatus::Running {
            return Err(SchedulerError::InvalidTransition {
                id: id.to_string(),
                status: record.status.to_string(),
                action: "advance".to_string(),
            });
        }

        let outcome = match result {
            StepResult::Failed(error) if record.attempts <= record.step.max_retries => {
                obs::emit_step_retried(&build_id, id.as_str(), record.attempts, &error);
                record.error = Some(error);
                let attempt = record.attempts;
                self.table.queue.push_back(id.clone());
                return Ok(Advance::Retried { attempt });
            }
            StepResult::Failed(error) => StepOutcome::fatal(error),
            StepResult::Completed(outcome) if outcome.status.is_terminal() => outcome,
            StepResult::Completed(outcome) => StepOutcome::fatal(format!(
                "handler returned non-terminal status {}",
                outcome.status
            )),
        };

        record.error = outcome.error;
        record.transition(outcome.status);
        let duration_ms = record.duration().map(|d| d.num_milliseconds());
        obs::emit_step_finished(&build_id, id.as_str(), outcome.status, duration_ms);

        let mut released = Vec::new();
        let mut cancelled = Vec::new();
        if let Some(next) = record.step.next.clone() {
            self.table.release(next, &mut released, &mut cancelled);
        }
        for cancelled_id in &cancelled {
            obs::emit_step_cancelled(&build_id, cancelled_id.as_str());
        }
        Ok(Advance::Settled {
            status: outcome.status,
            released,
            cancelled,
        })
    }

    /// Run every step to a terminal status.
    ///
    /// Ready steps are dispatched concurrently, at most
    /// `max_parallel_steps` at a time. Steps a handler adds are committed
    /// before the handler's own step settles, so a join waiting on it also
    /// waits on them. Steps still pending when nothing can run any more
    /// (a `next` cycle) end up `CANCELLED`.
    pub async fn run(&mut self) -> SchedulerResult<BuildRun> {
        let span = obs::build_span(&self.build.id);
        self.run_to_completion().instrument(span).await
    }

    async fn run_to_completion(&mut self) -> SchedulerResult<BuildRun> {
        let started = Instant::now();
        let build_id = self.build.id.clone();
        let max_parallel = self.settings.max_parallel_steps.max(1);
        let mut tasks: JoinSet<(StepId, StepResult, Vec<Step>)> = JoinSet::new();

        loop {
            if tasks.len() < max_parallel && !self.table.queue.is_empty() {
                let snapshot = Arc::new(self.table.records.clone());
                while tasks.len() < max_parallel {
                    let Some((step, attempt)) = self.dispatch_next() else {
                        break;
                    };
                    self.spawn_step(&mut tasks, step, attempt, Arc::clone(&snapshot));
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (id, result, spawned) = joined.map_err(|e| SchedulerError::Join(e.to_string()))?;

            let result = match result {
                StepResult::Completed(outcome) if !spawned.is_empty() => {
                    let count = spawned.len();
                    match self.add_steps(spawned) {
                        Ok(_) => {
                            obs::emit_steps_added(&build_id, id.as_str(), count);
                            StepResult::Completed(outcome)
                        }
                        Err(e) => StepResult::Failed(format!("could not add follow-on steps: {e}")),
                    }
                }
                other => other,
            };
            self.advance(&id, result)?;
        }

        for record in &mut self.table.records {
            match record.status {
                StepStatus::Pending => {
                    record.transition(StepStatus::Cancelled);
                    record.error = Some("never became ready".to_string());
                    obs::emit_step_cancelled(&build_id, record.step.id.as_str());
                }
                StepStatus::Running => {
                    record.transition(StepStatus::FatalError);
                    record.error = Some("step never settled".to_string());
                    obs::emit_step_finished(
                        &build_id,
                        record.step.id.as_str(),
                        StepStatus::FatalError,
                        None,
                    );
                }
                _ => {}
            }
        }

        let conclusion = BuildConclusion::from_records(&self.table.records);
        let duration_ms = started.elapsed().as_millis() as u64;
        obs::emit_build_finished(&build_id, duration_ms, self.table.len(), conclusion.as_str());

        if let Some(history) = &self.history {
            let state = match conclusion {
                BuildConclusion::Failed => BuildState::Failed,
                _ => BuildState::Done,
            };
            if let Err(e) = history.finish(&build_id, state).await {
                obs::emit_build_finalize_error(&build_id, &e);
            }
        }

        Ok(BuildRun {
            build_id,
            conclusion,
            steps: self.table.records.clone(),
            duration_ms,
        })
    }

    fn spawn_step(
        &self,
        tasks: &mut JoinSet<(StepId, StepResult, Vec<Step>)>,
        step: Step,
        attempt: u32,
        snapshot: Arc<Vec<StepRecord>>,
    ) {
        obs::emit_step_started(&self.build.id, step.id.as_str(), &step.name, attempt);
        let span = tracing::info_span!(
            "pipehook.step",
            build_id = %self.build.id,
            step_id = %step.id,
            name = %step.name,
        );

        let Some(handler) = self.registry.get(&step.name) else {
            let error = SchedulerError::UnknownHandler {
                id: step.id.to_string(),
                name: step.name.clone(),
            };
            let outcome = StepOutcome::fatal(error.to_string());
            tasks.spawn(async move { (step.id, StepResult::Completed(outcome), Vec::new()) });
            return;
        };

        let ctx = StepContext::new(
            self.build.clone(),
            Arc::clone(&self.reports),
            Arc::clone(&self.config),
            snapshot,
            attempt,
        );
        tasks.spawn(
            async move {
                let caught = AssertUnwindSafe(handler.run(&ctx, &step)).catch_unwind().await;
                let result = match caught {
                    Ok(Ok(outcome)) => StepResult::Completed(outcome),
                    Ok(Err(e)) => StepResult::Failed(format!("{e:#}")),
                    Err(payload) => {
                        let message = panic_message(payload);
                        warn!(error = %message, "step handler panicked");
                        StepResult::Failed(message)
                    }
                };
                let spawned = match result {
                    StepResult::Completed(_) => ctx.into_spawned(),
                    StepResult::Failed(_) => Vec::new(),
                };
                (step.id, result, spawned)
            }
            .instrument(span),
        );
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
