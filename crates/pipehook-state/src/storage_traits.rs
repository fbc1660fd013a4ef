//! Storage trait definitions for pipehook
//!
//! These traits define the two persistence seams of the orchestrator core:
//! - `ReportStore`: hierarchical, build-scoped facts (put/get by id, fan-in by parent)
//! - `BuildHistory`: build records, lifecycle and "recent builds on a branch" queries
//!
//! All traits are async and backend-agnostic. In-memory backends are provided
//! via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private; digests only come from hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Digest of the canonical JSON encoding of `value`.
    ///
    /// `serde_json::Value` objects serialize with sorted keys, so two equal
    /// payloads always produce the same digest.
    pub fn of_json(value: &serde_json::Value) -> StorageResult<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ReportStore: build-scoped facts
// ---------------------------------------------------------------------------

/// A build-scoped fact filed by a step.
///
/// Reports with a `parent` are children of a logical aggregate; the parent
/// itself may or may not be filed as a report of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Unique report id (by convention prefixed with the build id).
    pub id: String,
    /// Build this report was filed in.
    pub build_id: String,
    /// Aggregate report id this report is filed under, if any.
    pub parent: Option<String>,
    /// Opaque payload.
    pub data: serde_json::Value,
    /// SHA-256 of the canonical JSON payload.
    pub digest: ContentDigest,
    /// When the report was created.
    pub filed_at: DateTime<Utc>,
}

impl Report {
    /// Create a top-level report.
    pub fn new(
        build_id: impl Into<String>,
        id: impl Into<String>,
        data: serde_json::Value,
    ) -> StorageResult<Self> {
        let digest = ContentDigest::of_json(&data)?;
        Ok(Self {
            id: id.into(),
            build_id: build_id.into(),
            parent: None,
            data,
            digest,
            filed_at: Utc::now(),
        })
    }

    /// Create a report filed under `parent`.
    pub fn child(
        build_id: impl Into<String>,
        id: impl Into<String>,
        parent: impl Into<String>,
        data: serde_json::Value,
    ) -> StorageResult<Self> {
        let mut report = Self::new(build_id, id, data)?;
        report.parent = Some(parent.into());
        Ok(report)
    }

    /// Create a report from a serializable payload.
    pub fn from_payload<T: Serialize>(
        build_id: impl Into<String>,
        id: impl Into<String>,
        payload: &T,
    ) -> StorageResult<Self> {
        Self::new(build_id, id, serde_json::to_value(payload)?)
    }

    /// Deserialize the payload into a typed view.
    pub fn data_as<T: DeserializeOwned>(&self) -> StorageResult<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Look up a top-level payload field.
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key).filter(|v| !v.is_null())
    }
}

/// Hierarchical report store.
///
/// Guarantees:
/// - `put` of an existing id replaces the stored report; a child keeps its
///   position in the parent's collection and never overwrites siblings.
/// - `get_children` returns children in first-filed order.
/// - Safe for many concurrent writers and a concurrent reader.
/// - No deletion.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// File a single report.
    async fn put(&self, report: Report) -> StorageResult<()>;

    /// File several reports in order.
    async fn file_reports(&self, reports: Vec<Report>) -> StorageResult<()> {
        for report in reports {
            self.put(report).await?;
        }
        Ok(())
    }

    /// Fetch a report by id.
    async fn get_by_id(&self, id: &str) -> StorageResult<Option<Report>>;

    /// Fetch every report filed under `parent_id`, in insertion order.
    async fn get_children(&self, parent_id: &str) -> StorageResult<Vec<Report>>;

    /// Fetch every report filed for a build, in insertion order.
    async fn reports_for_build(&self, build_id: &str) -> StorageResult<Vec<Report>>;
}

// ---------------------------------------------------------------------------
// BuildHistory: build records
// ---------------------------------------------------------------------------

/// Lifecycle state of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
    Running,
    Done,
    Failed,
    Cancelled,
}

impl BuildState {
    /// True when the build will not change state again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildState::Running => "RUNNING",
            BuildState::Done => "DONE",
            BuildState::Failed => "FAILED",
            BuildState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// A build triggered by a commit or pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    /// Source branch.
    pub branch: String,
    /// Head commit SHA.
    pub sha: String,
    /// Pull request URL, when the commit belongs to one.
    pub pr_url: Option<String>,
    /// Repository-relative root of the package set.
    pub packages_path: String,
    /// Base branch of the first configured branch group, if any.
    pub branch_group_base: Option<String>,
    pub state: BuildState,
    pub created_at: DateTime<Utc>,
}

impl Build {
    /// New running build with a random id.
    pub fn new(branch: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            branch: branch.into(),
            sha: sha.into(),
            pr_url: None,
            packages_path: String::new(),
            branch_group_base: None,
            state: BuildState::Running,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_pr_url(mut self, url: impl Into<String>) -> Self {
        self.pr_url = Some(url.into());
        self
    }

    pub fn with_packages_path(mut self, path: impl Into<String>) -> Self {
        self.packages_path = path.into();
        self
    }

    pub fn with_branch_group_base(mut self, base: impl Into<String>) -> Self {
        self.branch_group_base = Some(base.into());
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Whether the build has a pull request attached.
    pub fn has_pull_request(&self) -> bool {
        self.pr_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Build record store.
///
/// Semantics:
/// - A build transitions `Running → Done | Failed | Cancelled` exactly once.
/// - `recent_builds` returns terminal builds on a branch, newest first.
#[async_trait]
pub trait BuildHistory: Send + Sync {
    /// Register a new build. Fails if the id is taken.
    async fn register(&self, build: Build) -> StorageResult<()>;

    /// Retrieve a build by id.
    async fn get(&self, build_id: &str) -> StorageResult<Build>;

    /// Move a running build to a terminal state.
    async fn finish(&self, build_id: &str, state: BuildState) -> StorageResult<Build>;

    /// The `limit` most recently created terminal builds on `branch`.
    async fn recent_builds(&self, branch: &str, limit: usize) -> StorageResult<Vec<Build>>;
}
