//! In-memory backends for the storage traits
//!
//! Provides `MemoryReportStore` and `MemoryBuildHistory`, which satisfy the
//! trait contracts without any external dependencies. The orchestrator uses
//! them for single-process runs; tests use them as fakes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(mutex: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| StorageError::Backend(format!("lock poisoned: {e}")))
}

// ---------------------------------------------------------------------------
// MemoryReportStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ReportTable {
    reports: HashMap<String, Report>,
    /// `parent_id → [child_id, ...]` in first-filed order
    children: HashMap<String, Vec<String>>,
    /// `build_id → [report_id, ...]` in first-filed order
    by_build: HashMap<String, Vec<String>>,
}

/// In-memory report store backed by a single `Mutex`.
///
/// No I/O happens while the lock is held.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    table: Mutex<ReportTable>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct report ids filed so far.
    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.reports.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn put(&self, report: Report) -> StorageResult<()> {
        let mut table = lock(&self.table)?;
        let id = report.id.clone();
        let previous = table.reports.insert(id.clone(), report.clone());

        // A refiled report keeps its original slot.
        if previous.is_none() {
            table
                .by_build
                .entry(report.build_id.clone())
                .or_default()
                .push(id.clone());
        }

        let previous_parent = previous.and_then(|r| r.parent);
        if previous_parent != report.parent {
            if let Some(old) = previous_parent {
                if let Some(ids) = table.children.get_mut(&old) {
                    ids.retain(|c| c != &id);
                }
            }
            if let Some(parent) = report.parent {
                table.children.entry(parent).or_default().push(id);
            }
        }
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<Report>> {
        let table = lock(&self.table)?;
        Ok(table.reports.get(id).cloned())
    }

    async fn get_children(&self, parent_id: &str) -> StorageResult<Vec<Report>> {
        let table = lock(&self.table)?;
        Ok(table
            .children
            .get(parent_id)
            .into_iter()
            .flatten()
            .filter_map(|id| table.reports.get(id).cloned())
            .collect())
    }

    async fn reports_for_build(&self, build_id: &str) -> StorageResult<Vec<Report>> {
        let table = lock(&self.table)?;
        Ok(table
            .by_build
            .get(build_id)
            .into_iter()
            .flatten()
            .filter_map(|id| table.reports.get(id).cloned())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryBuildHistory
// ---------------------------------------------------------------------------

/// In-memory build history backed by a `HashMap<build_id, Build>`.
#[derive(Debug, Default)]
pub struct MemoryBuildHistory {
    builds: Mutex<HashMap<String, Build>>,
}

impl MemoryBuildHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildHistory for MemoryBuildHistory {
    async fn register(&self, build: Build) -> StorageResult<()> {
        let mut builds = lock(&self.builds)?;
        if builds.contains_key(&build.id) {
            return Err(StorageError::DuplicateBuild { build_id: build.id });
        }
        builds.insert(build.id.clone(), build);
        Ok(())
    }

    async fn get(&self, build_id: &str) -> StorageResult<Build> {
        let builds = lock(&self.builds)?;
        builds
            .get(build_id)
            .cloned()
            .ok_or_else(|| StorageError::BuildNotFound {
                build_id: build_id.to_string(),
            })
    }

    async fn finish(&self, build_id: &str, state: BuildState) -> StorageResult<Build> {
        let mut builds = lock(&self.builds)?;
        let build = builds
            .get_mut(build_id)
            .ok_or_else(|| StorageError::BuildNotFound {
                build_id: build_id.to_string(),
            })?;
        if build.state != BuildState::Running || !state.is_terminal() {
            return Err(StorageError::InvalidBuildState {
                build_id: build_id.to_string(),
                state: build.state.to_string(),
                expected: BuildState::Running.to_string(),
            });
        }
        build.state = state;
        debug!(build_id = %build_id, state = %state, "build finished");
        Ok(build.clone())
    }

    async fn recent_builds(&self, branch: &str, limit: usize) -> StorageResult<Vec<Build>> {
        let builds = lock(&self.builds)?;
        let mut matching: Vec<Build> = builds
            .values()
            .filter(|b| b.branch == branch && b.state.is_terminal())
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }
}
