//! Package declaration discovery and changed-file mapping.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use pipehook_state::Build;

use crate::dependency::error::{DependencyError, DependencyResult};
use crate::dependency::resolver::PackageDecl;

/// Source of the package declarations for a build.
pub trait PackageCatalog: Send + Sync {
    fn declarations(&self, build: &Build) -> DependencyResult<Vec<PackageDecl>>;
}

/// Reads `<root>/<pkg>/<pkg>.json` declaration files from disk.
#[derive(Debug, Clone)]
pub struct FsPackageCatalog {
    root: PathBuf,
}

impl FsPackageCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PackageCatalog for FsPackageCatalog {
    fn declarations(&self, _build: &Build) -> DependencyResult<Vec<PackageDecl>> {
        read_package_decls(&discover_decl_paths(&self.root)?)
    }
}

/// A fixed declaration list.
#[derive(Debug, Clone, Default)]
pub struct StaticPackageCatalog {
    decls: Vec<PackageDecl>,
}

impl StaticPackageCatalog {
    pub fn new(decls: Vec<PackageDecl>) -> Self {
        Self { decls }
    }
}

impl PackageCatalog for StaticPackageCatalog {
    fn declarations(&self, _build: &Build) -> DependencyResult<Vec<PackageDecl>> {
        Ok(self.decls.clone())
    }
}

/// Declaration file paths under `root`, sorted by package directory name.
///
/// A package directory `<root>/<pkg>/` is recognised when it contains
/// `<pkg>.json`. Other entries are ignored.
pub fn discover_decl_paths(root: &Path) -> DependencyResult<Vec<PathBuf>> {
    let entries = fs::read_dir(root).map_err(|source| DependencyError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| DependencyError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let decl = dir.join(format!("{name}.json"));
        if decl.is_file() {
            paths.push(decl);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Parse each declaration file, preserving input order.
pub fn read_package_decls(paths: &[PathBuf]) -> DependencyResult<Vec<PackageDecl>> {
    paths
        .iter()
        .map(|path| {
            let raw = fs::read_to_string(path).map_err(|source| DependencyError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&raw).map_err(|source| DependencyError::Parse {
                path: path.clone(),
                source,
            })
        })
        .collect()
}

/// Names of the packages touched by `files`.
///
/// A file counts when it lives inside a package directory directly under
/// `packages_path`; files at the packages root or elsewhere in the
/// repository are ignored.
pub fn changed_packages<I, S>(files: I, packages_path: &str) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let prefix = packages_path.trim_end_matches('/');
    files
        .into_iter()
        .filter_map(|file| {
            let file = file.as_ref();
            let relative = if prefix.is_empty() {
                file
            } else {
                file.strip_prefix(prefix)?.strip_prefix('/')?
            };
            let (package, _rest) = relative.split_once('/')?;
            (!package.is_empty()).then(|| package.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_decl(root: &Path, name: &str, deps: &[&str]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        let decl = PackageDecl::new(name, deps.iter().copied());
        fs::write(
            dir.join(format!("{name}.json")),
            serde_json::to_string(&decl).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_discover_and_read_decls() {
        let tmp = tempfile::tempdir().unwrap();
        write_decl(tmp.path(), "pkgB", &["pkgA"]);
        write_decl(tmp.path(), "pkgA", &[]);
        fs::create_dir_all(tmp.path().join("notapkg")).unwrap();
        fs::write(tmp.path().join("README.md"), "hi").unwrap();

        let paths = discover_decl_paths(tmp.path()).unwrap();
        assert_eq!(paths.len(), 2);

        let decls = read_package_decls(&paths).unwrap();
        assert_eq!(decls[0].name, "pkgA");
        assert_eq!(decls[1], PackageDecl::new("pkgB", ["pkgA"]));
    }

    #[test]
    fn test_read_rejects_malformed_decl() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        fs::write(&path, "{\"dependencies\": []}").unwrap();
        let err = read_package_decls(&[path]).unwrap_err();
        assert!(matches!(err, DependencyError::Parse { .. }));
    }

    #[test]
    fn test_missing_dependencies_field_defaults_to_empty() {
        let decl: PackageDecl = serde_json::from_str("{\"name\": \"solo\"}").unwrap();
        assert!(decl.dependencies.is_empty());
    }

    #[test]
    fn test_changed_packages_maps_files_to_package_dirs() {
        let files = [
            "repo/pkgs/pkgA/src/a.js",
            "repo/pkgs/pkgA/test/a_test.js",
            "repo/pkgs/pkgB/pkgB.json",
            "repo/pkgs/top-level.md",
            "docs/readme.md",
            "repo/pkgsX/pkgC/c.js",
        ];
        let changed = changed_packages(files, "repo/pkgs");
        let expected: BTreeSet<String> = ["pkgA", "pkgB"].iter().map(|s| s.to_string()).collect();
        assert_eq!(changed, expected);
    }

    #[test]
    fn test_changed_packages_with_empty_root() {
        let changed = changed_packages(["pkgA/a.js", "root.txt"], "");
        assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec!["pkgA"]);
    }
}
