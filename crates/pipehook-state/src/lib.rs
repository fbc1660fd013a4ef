//! Pipehook-State: persistence for build-scoped reports and build records
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: append-only facts filed by pipeline steps, parent/child fan-in,
//! and the build history used for baseline lookups.
//!
//! ## Key Components
//!
//! - `ReportStore`: hierarchical key-value store for build-scoped reports
//! - `BuildHistory`: build lifecycle records and recent-build queries
//! - `fakes`: in-memory implementations of both

mod error;
pub mod fakes;
pub mod storage_traits;

pub use error::StorageError;
pub use fakes::{MemoryBuildHistory, MemoryReportStore};
pub use storage_traits::{
    Build, BuildHistory, BuildState, ContentDigest, Report, ReportStore, StorageResult,
};
