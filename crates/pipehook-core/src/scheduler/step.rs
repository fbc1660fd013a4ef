//! Step definitions, input bags and per-step state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scheduler::error::{SchedulerError, SchedulerResult};

/// Build-unique step identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        StepId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `"{self}-{suffix}"`, the id of a follow-on step spawned by this one.
    pub fn derive(&self, suffix: &str) -> StepId {
        StepId(format!("{}-{}", self.0, suffix))
    }

    /// Replace the first occurrence of `from` with `to`.
    ///
    /// `b1-testPackage-pkgA` → `b1-codeAnalysis-pkgA`.
    pub fn replace_segment(&self, from: &str, to: &str) -> StepId {
        StepId(self.0.replacen(from, to, 1))
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        StepId(s.to_string())
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        StepId(s)
    }
}

/// Immutable key-value input of a step.
///
/// Derived inputs are produced with [`StepInput::with`], which returns a new
/// bag and leaves the original untouched, so several follow-on steps can
/// share a parent snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepInput(BTreeMap<String, Value>);

impl StepInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of this bag with `key` set to `value`.
    #[must_use]
    pub fn with(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut values = self.0.clone();
        values.insert(key.to_string(), value.into());
        StepInput(values)
    }

    /// Copy of this bag with `key` set to the JSON encoding of `value`.
    pub fn with_json<T: Serialize>(&self, key: &str, value: &T) -> serde_json::Result<Self> {
        Ok(self.with(key, serde_json::to_value(value)?))
    }

    /// Raw value; JSON `null` counts as absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Decode a typed value; `Ok(None)` when absent.
    pub fn decode<T: DeserializeOwned>(&self, key: &str) -> serde_json::Result<Option<T>> {
        self.get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for StepInput {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        StepInput(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Lifecycle status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Skipped,
    NonFatalError,
    FatalError,
    /// Never ran because every path leading to it ended fatally.
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Terminal statuses that let `next` steps proceed.
    pub fn allows_continuation(self) -> bool {
        matches!(self, Self::Success | Self::Skipped | Self::NonFatalError)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Success => "SUCCESS",
            StepStatus::Skipped => "SKIPPED",
            StepStatus::NonFatalError => "NON_FATAL_ERROR",
            StepStatus::FatalError => "FATAL_ERROR",
            StepStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// A unit of pipeline work. `name` selects the handler that runs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub input: StepInput,
    /// Step that runs after this one (and after every other step pointing
    /// at the same target).
    pub next: Option<StepId>,
    pub build_id: String,
    /// Automatic resubmissions allowed after unhandled handler failures.
    pub max_retries: u32,
}

impl Step {
    pub fn builder() -> StepBuilder {
        StepBuilder::default()
    }
}

/// Builder for [`Step`].
#[derive(Debug, Default)]
pub struct StepBuilder {
    id: Option<StepId>,
    name: Option<String>,
    input: StepInput,
    next: Option<StepId>,
    build_id: Option<String>,
    max_retries: u32,
}

impl StepBuilder {
    pub fn id(mut self, id: impl Into<StepId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn input(mut self, input: StepInput) -> Self {
        self.input = input;
        self
    }

    pub fn next(mut self, next: Option<StepId>) -> Self {
        self.next = next;
        self
    }

    pub fn build_id(mut self, build_id: impl Into<String>) -> Self {
        self.build_id = Some(build_id.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn build(self) -> SchedulerResult<Step> {
        Ok(Step {
            id: self.id.ok_or(SchedulerError::IncompleteStep { field: "id" })?,
            name: self.name.ok_or(SchedulerError::IncompleteStep { field: "name" })?,
            input: self.input,
            next: self.next,
            build_id: self
                .build_id
                .ok_or(SchedulerError::IncompleteStep { field: "build_id" })?,
            max_retries: self.max_retries,
        })
    }
}

/// One entry of a step's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub status: StepStatus,
    pub at: DateTime<Utc>,
}

/// Scheduler-owned state of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub status: StepStatus,
    /// Number of times the handler has been started.
    pub attempts: u32,
    pub error: Option<String>,
    pub history: Vec<StateTransition>,
}

impl StepRecord {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            status: StepStatus::Pending,
            attempts: 0,
            error: None,
            history: vec![StateTransition {
                status: StepStatus::Pending,
                at: Utc::now(),
            }],
        }
    }

    pub fn id(&self) -> &StepId {
        &self.step.id
    }

    pub(crate) fn transition(&mut self, status: StepStatus) {
        self.status = status;
        self.history.push(StateTransition {
            status,
            at: Utc::now(),
        });
    }

    /// Time from the first start to settling; `None` until terminal or if
    /// the step never ran.
    pub fn duration(&self) -> Option<Duration> {
        let started = self
            .history
            .iter()
            .find(|t| t.status == StepStatus::Running)?;
        let finished = self.history.last().filter(|t| t.status.is_terminal())?;
        Some(finished.at - started.at)
    }
}
