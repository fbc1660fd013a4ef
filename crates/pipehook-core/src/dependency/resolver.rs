//! Upstream closure over package declarations.
//!
//! An edge `A → B` means "B declares a dependency on A". Starting from a set
//! of changed packages, the resolver walks these edges tier by tier to find
//! every package whose build or tests may be affected.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dependency::error::DependencyError;

/// A package and the names of the packages it depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDecl {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PackageDecl {
    pub fn new<I, S>(name: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether this package directly depends on `package`.
    pub fn depends_on(&self, package: &str) -> bool {
        self.dependencies.iter().any(|d| d == package)
    }
}

/// How many tiers of dependents to traverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthLimit {
    Bounded(usize),
    Unlimited,
}

impl DepthLimit {
    /// Interpret a signed tier count: any negative value means unlimited.
    pub fn from_tiers(tiers: i64) -> Self {
        usize::try_from(tiers)
            .map(DepthLimit::Bounded)
            .unwrap_or(DepthLimit::Unlimited)
    }

    fn allows(self, produced: usize) -> bool {
        match self {
            DepthLimit::Bounded(n) => produced < n,
            DepthLimit::Unlimited => true,
        }
    }
}

impl Default for DepthLimit {
    fn default() -> Self {
        DepthLimit::Unlimited
    }
}

impl fmt::Display for DepthLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepthLimit::Bounded(n) => write!(f, "{n}"),
            DepthLimit::Unlimited => write!(f, "unlimited"),
        }
    }
}

impl FromStr for DepthLimit {
    type Err = DependencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(DepthLimit::Unlimited);
        }
        s.parse::<i64>()
            .map(DepthLimit::from_tiers)
            .map_err(|_| DependencyError::InvalidDepth(s.to_string()))
    }
}

/// Result of an upstream traversal: the seeds plus each discovered tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamClosure {
    pub seeds: Vec<String>,
    /// `tiers[0]` holds direct dependents of the seeds, `tiers[1]` their
    /// dependents, and so on. Within a tier, names follow declaration order.
    pub tiers: Vec<Vec<String>>,
}

impl UpstreamClosure {
    /// Every package in the closure, seeds included.
    pub fn packages(&self) -> BTreeSet<String> {
        self.seeds
            .iter()
            .chain(self.tiers.iter().flatten())
            .cloned()
            .collect()
    }

    /// Packages in first-discovered order (seeds, then tier by tier).
    pub fn ordered(&self) -> Vec<String> {
        self.seeds
            .iter()
            .chain(self.tiers.iter().flatten())
            .cloned()
            .collect()
    }
}

/// Breadth-first expansion over reverse dependency edges.
///
/// A package joins the next tier when one of its declared dependencies is in
/// the current tier and it has not been placed in the seeds, an earlier tier,
/// the current tier or the next tier already. That visited check is also what
/// terminates traversal of cyclic graphs.
pub fn upstream_closure<I, S>(seeds: I, decls: &[PackageDecl], depth: DepthLimit) -> UpstreamClosure
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut closure = UpstreamClosure::default();
    for seed in seeds {
        let seed = seed.into();
        if seen.insert(seed.clone()) {
            closure.seeds.push(seed);
        }
    }

    let mut current: Vec<String> = closure.seeds.clone();
    while depth.allows(closure.tiers.len()) && !current.is_empty() {
        let mut next: Vec<String> = Vec::new();
        for decl in decls {
            if seen.contains(&decl.name) {
                continue;
            }
            if current.iter().any(|c| decl.depends_on(c)) {
                seen.insert(decl.name.clone());
                next.push(decl.name.clone());
            }
        }
        if next.is_empty() {
            break;
        }
        closure.tiers.push(next.clone());
        current = next;
    }

    closure
}

/// The seeds plus every package reachable through reverse dependency edges
/// within `depth` tiers.
pub fn upstream_dependencies<I, S>(
    seeds: I,
    decls: &[PackageDecl],
    depth: DepthLimit,
) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    upstream_closure(seeds, decls, depth).packages()
}
