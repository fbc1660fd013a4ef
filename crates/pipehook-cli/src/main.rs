//! Pipehook CLI
//!
//! The `pipehook` command exposes the dependency resolver and an offline
//! pipeline simulator.
//!
//! ## Commands
//!
//! - `affected`: packages affected by a set of changed packages
//! - `affected-files`: same, starting from changed file paths
//! - `simulate`: run the code-analysis pipeline against a JSON manifest

mod simulate;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipehook_core::dependency::{
    changed_packages, discover_decl_paths, read_package_decls, upstream_closure, DepthLimit,
};
use pipehook_core::PackageDecl;
use serde::Serialize;
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "pipehook")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Pipeline step hooks: test avoidance and code-analysis aggregation",
    long_about = None
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, env = "PIPEHOOK_VERBOSE")]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "PIPEHOOK_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the packages affected by changes to the given packages
    Affected {
        /// Directory holding one `<pkg>/<pkg>.json` declaration per package
        #[arg(short, long, env = "PIPEHOOK_PACKAGES_PATH")]
        packages_path: PathBuf,

        /// Changed package names
        #[arg(required = true)]
        changed: Vec<String>,

        /// Dependency tiers to follow: a count, or `unlimited` (negative
        /// counts mean unlimited too)
        #[arg(short, long, default_value = "unlimited", allow_negative_numbers = true)]
        depth: DepthLimit,
    },

    /// List the packages affected by the given changed files
    AffectedFiles {
        /// Directory holding one `<pkg>/<pkg>.json` declaration per package
        #[arg(short, long, env = "PIPEHOOK_PACKAGES_PATH")]
        packages_path: PathBuf,

        /// Changed file paths, relative to the repository root
        #[arg(required = true)]
        files: Vec<String>,

        /// Repository-relative packages root used to map files to packages;
        /// empty when packages sit at the repository root
        #[arg(long, default_value = "")]
        files_root: String,

        /// Dependency tiers to follow: a count, or `unlimited` (negative
        /// counts mean unlimited too)
        #[arg(short, long, default_value = "unlimited", allow_negative_numbers = true)]
        depth: DepthLimit,
    },

    /// Simulate a build of the code-analysis pipeline
    Simulate {
        /// Path to the simulation manifest (JSON)
        #[arg(short, long)]
        manifest: PathBuf,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AffectedOutput {
    changed: Vec<String>,
    affected: Vec<String>,
    tiers: Vec<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    pipehook_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Affected {
            packages_path,
            changed,
            depth,
        } => cmd_affected(&packages_path, changed, depth),
        Commands::AffectedFiles {
            packages_path,
            files,
            files_root,
            depth,
        } => {
            let changed = changed_packages(&files, &files_root);
            debug!(files = files.len(), packages = changed.len(), "mapped changed files");
            cmd_affected(&packages_path, changed.into_iter().collect(), depth)
        }
        Commands::Simulate { manifest } => cmd_simulate(&manifest).await,
    }
}

fn load_decls(packages_path: &Path) -> Result<Vec<PackageDecl>> {
    let paths = discover_decl_paths(packages_path)
        .with_context(|| format!("Failed to scan packages in {:?}", packages_path))?;
    read_package_decls(&paths).context("Failed to read package declarations")
}

fn affected_output(
    changed: Vec<String>,
    decls: &[PackageDecl],
    depth: DepthLimit,
) -> AffectedOutput {
    let closure = upstream_closure(changed.iter(), decls, depth);
    let changed: BTreeSet<String> = changed.into_iter().collect();
    AffectedOutput {
        changed: changed.into_iter().collect(),
        affected: closure.ordered(),
        tiers: closure.tiers,
    }
}

fn cmd_affected(packages_path: &Path, changed: Vec<String>, depth: DepthLimit) -> Result<()> {
    let decls = load_decls(packages_path)?;
    let output = affected_output(changed, &decls, depth);
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_simulate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {:?}", path))?;
    let manifest: simulate::Manifest = serde_json::from_str(&content)
        .with_context(|| format!("Invalid manifest in {:?}", path))?;
    let report = simulate::simulate(manifest).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
