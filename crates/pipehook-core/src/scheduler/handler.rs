//! Step handlers and the context they run in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use pipehook_state::{Build, ReportStore};

use crate::config::ConfigProvider;
use crate::scheduler::outcome::StepOutcome;
use crate::scheduler::step::{Step, StepRecord};

/// Runs steps of one name.
///
/// Return an [`StepOutcome`] to settle the step; return `Err` to report an
/// unhandled failure, which the scheduler retries up to `max_retries` times
/// before marking the step `FATAL_ERROR`.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: &StepContext, step: &Step) -> anyhow::Result<StepOutcome>;
}

/// Handlers keyed by step name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `name`, replacing any previous one.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

/// Everything a handler may read or produce while running one step.
///
/// Steps queued through [`StepContext::add_steps`] are committed to the
/// step graph only if the handler returns `Ok`.
pub struct StepContext {
    build: Build,
    reports: Arc<dyn ReportStore>,
    config: Arc<dyn ConfigProvider>,
    table: Arc<Vec<StepRecord>>,
    attempt: u32,
    spawned: Mutex<Vec<Step>>,
}

impl StepContext {
    pub fn new(
        build: Build,
        reports: Arc<dyn ReportStore>,
        config: Arc<dyn ConfigProvider>,
        table: Arc<Vec<StepRecord>>,
        attempt: u32,
    ) -> Self {
        Self {
            build,
            reports,
            config,
            table,
            attempt,
            spawned: Mutex::new(Vec::new()),
        }
    }

    pub fn build(&self) -> &Build {
        &self.build
    }

    pub fn reports(&self) -> &dyn ReportStore {
        self.reports.as_ref()
    }

    pub fn config(&self) -> &dyn ConfigProvider {
        self.config.as_ref()
    }

    /// 1-based attempt number of the current invocation.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Snapshot of the build's step table taken when this step was dispatched.
    pub fn steps(&self) -> &[StepRecord] {
        &self.table
    }

    /// Steps in the snapshot running handler `name`.
    pub fn steps_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a StepRecord> + 'a {
        self.table.iter().filter(move |r| r.step.name == name)
    }

    /// Append follow-on steps to the build.
    pub fn add_steps(&self, steps: Vec<Step>) {
        self.spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(steps);
    }

    pub(crate) fn into_spawned(self) -> Vec<Step> {
        self.spawned
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
