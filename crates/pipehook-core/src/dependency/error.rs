//! Error types for package declaration loading.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while discovering or parsing package declarations.
#[derive(Debug, Error)]
pub enum DependencyError {
    /// A declaration file or the packages root could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A declaration file is not a valid `{name, dependencies}` document.
    #[error("invalid package declaration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A depth limit string could not be parsed.
    #[error("invalid depth limit: {0:?} (expected an integer or \"unlimited\")")]
    InvalidDepth(String),
}

/// Convenience result alias.
pub type DependencyResult<T> = std::result::Result<T, DependencyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_displays_path() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = DependencyError::Parse {
            path: PathBuf::from("pkgs/a/a.json"),
            source,
        };
        assert!(err.to_string().contains("pkgs/a/a.json"));
    }
}
