//! Package dependency resolution for change-impact analysis.
//!
//! Provides:
//! - [`resolver::upstream_dependencies`]: bounded reverse-dependency closure
//! - [`decl::PackageCatalog`]: where package declarations come from
//! - [`decl::changed_packages`]: map changed files to package names

pub mod decl;
pub mod error;
pub mod resolver;

pub use decl::{
    changed_packages, discover_decl_paths, read_package_decls, FsPackageCatalog, PackageCatalog,
    StaticPackageCatalog,
};
pub use error::{DependencyError, DependencyResult};
pub use resolver::{
    upstream_closure, upstream_dependencies, DepthLimit, PackageDecl, UpstreamClosure,
};
