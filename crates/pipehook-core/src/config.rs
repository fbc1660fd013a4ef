//! Build configuration lookup.
//!
//! The platform's build-config source is string-typed: structured values are
//! stored as JSON strings and parsed here. Handlers receive the provider
//! through their [`StepContext`](crate::scheduler::StepContext), never through
//! global state.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Well-known configuration keys.
pub mod keys {
    pub const MAX_COMMENT_COUNT: &str = "maxCodeAnalyzerCommentCount";
    pub const REPORT_TO_CODE_ANALYTICS: &str = "reportResultsToCodeAnalytics";
    pub const TOP_LEVEL_CUSTOMER_PACKAGE: &str = "topLevelCustomerPackage";
    pub const CUSTOMER_PACKAGES: &str = "customerPackages";
    pub const STORE_RESULT_BRANCHES: &str = "storeResultBranches";
    pub const MANDATORY_ANALYSIS_BRANCHES: &str = "mandatoryAnalysisBranches";
    pub const PACKAGES_TO_INCLUDE: &str = "packagesToInclude";

    /// Secret: JSON array of fallback source-control tokens.
    pub const BACKUP_SOURCE_CONTROL_TOKENS: &str = "backupSourceControlTokens";
}

pub const DEFAULT_MAX_COMMENT_COUNT: u32 = 10;

const MAINLINE_BRANCHES: [&str; 3] = ["develop", "release", "master"];

/// Errors raised while interpreting configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config value {name} is not valid JSON of the expected shape: {reason}")]
    Invalid { name: String, reason: String },
}

/// String-typed configuration and secret lookup.
pub trait ConfigProvider: Send + Sync {
    /// Build-config value, if set.
    fn get(&self, name: &str) -> Option<String>;

    /// Override a build-config value for the rest of the build.
    fn set(&self, name: &str, value: String);

    /// Secret value, if set.
    fn secret(&self, name: &str) -> Option<String>;
}

/// In-process configuration provider.
#[derive(Debug, Default)]
pub struct MemoryConfig {
    values: RwLock<HashMap<String, String>>,
    secrets: RwLock<HashMap<String, String>>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into());
        self
    }

    pub fn with_secret(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into());
        self
    }

    pub fn from_values(values: HashMap<String, String>) -> Self {
        Self {
            values: RwLock::new(values),
            secrets: RwLock::default(),
        }
    }
}

impl ConfigProvider for MemoryConfig {
    fn get(&self, name: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn set(&self, name: &str, value: String) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value);
    }

    fn secret(&self, name: &str) -> Option<String> {
        self.secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

fn parse_json<T: DeserializeOwned>(
    name: &str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() || raw.trim() == "null" => Ok(default),
        Some(raw) => serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid {
            name: name.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn mainline() -> Vec<String> {
    MAINLINE_BRANCHES.iter().map(|s| s.to_string()).collect()
}

/// Typed view of the code-analysis configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Maximum inline comments posted on a pull request.
    pub max_comment_count: u32,
    /// Push processed results to the central analytics store.
    pub report_to_code_analytics: bool,
    /// Top-level customer package, enabling customization analysis.
    pub top_level_customer_package: Option<String>,
    /// Every customer package, the top-level one included.
    pub customer_packages: Vec<String>,
    /// Branches whose results are stored centrally.
    pub store_result_branches: Vec<String>,
    /// Branches analysed on every commit, with or without a pull request.
    pub mandatory_analysis_branches: Vec<String>,
    /// Fallback source-control tokens.
    pub backup_tokens: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_comment_count: DEFAULT_MAX_COMMENT_COUNT,
            report_to_code_analytics: false,
            top_level_customer_package: None,
            customer_packages: Vec::new(),
            store_result_branches: mainline(),
            mandatory_analysis_branches: mainline(),
            backup_tokens: Vec::new(),
        }
    }
}

impl AnalysisConfig {
    pub fn load(config: &dyn ConfigProvider) -> Result<Self, ConfigError> {
        Ok(Self {
            max_comment_count: max_comment_count(config),
            report_to_code_analytics: config
                .get(keys::REPORT_TO_CODE_ANALYTICS)
                .is_some_and(|v| v.trim() == "true"),
            top_level_customer_package: top_level_customer_package(config),
            customer_packages: parse_json(
                keys::CUSTOMER_PACKAGES,
                config.get(keys::CUSTOMER_PACKAGES),
                Vec::new(),
            )?,
            store_result_branches: parse_json(
                keys::STORE_RESULT_BRANCHES,
                config.get(keys::STORE_RESULT_BRANCHES),
                mainline(),
            )?,
            mandatory_analysis_branches: parse_json(
                keys::MANDATORY_ANALYSIS_BRANCHES,
                config.get(keys::MANDATORY_ANALYSIS_BRANCHES),
                mainline(),
            )?,
            backup_tokens: parse_json(
                keys::BACKUP_SOURCE_CONTROL_TOKENS,
                config.secret(keys::BACKUP_SOURCE_CONTROL_TOKENS),
                Vec::new(),
            )?,
        })
    }
}

/// Comment cap for pull-request notifications.
///
/// Stored as a string by the platform; anything that is not a positive
/// integer falls back to the default.
pub fn max_comment_count(config: &dyn ConfigProvider) -> u32 {
    let Some(raw) = config.get(keys::MAX_COMMENT_COUNT) else {
        return DEFAULT_MAX_COMMENT_COUNT;
    };
    match raw.trim().trim_matches('"').parse::<u32>() {
        Ok(n) if n > 0 => n,
        _ => {
            warn!(value = %raw, "invalid {}, using default", keys::MAX_COMMENT_COUNT);
            DEFAULT_MAX_COMMENT_COUNT
        }
    }
}

/// Configured top-level customer package, if any.
pub fn top_level_customer_package(config: &dyn ConfigProvider) -> Option<String> {
    config
        .get(keys::TOP_LEVEL_CUSTOMER_PACKAGE)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != "null")
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on step handlers running at once.
    pub max_parallel_steps: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 8,
        }
    }
}
