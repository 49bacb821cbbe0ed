//! CLI Tooling
//!
//! Command-line access to a bundle directory: inspect the entry tree, read and
//! write single JSON or TOML files through the same coordinator path the
//! library uses, and print the effective configuration.

use crate::bundle::{BundleRoot, DynamicBundle, FileBundle};
use crate::config::AppConfig;
use crate::coordinator::FileProperty;
use crate::node::Node;
use crate::storage::EntryKind;
use anyhow::Context;
use clap::{Parser, Subcommand};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use std::path::{Path, PathBuf};
use tracing::info;

/// filebundle - typed file bundles on disk
#[derive(Parser)]
#[command(name = "filebundle")]
#[command(about = "Inspect and edit file bundle directories")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Bundle directory
    #[arg(long, default_value = ".")]
    pub bundle: PathBuf,

    /// Configuration file path (layered over the global config)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, file+stderr, both)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Fold the logging flags into `config`
    pub fn apply_logging_overrides(&self, config: &mut AppConfig) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
        if let Some(output) = &self.log_output {
            config.logging.output = output.clone();
        }
        if let Some(file) = &self.log_file {
            config.logging.file = Some(file.clone());
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// List every entry of the bundle
    Tree,
    /// Print the value stored in a JSON or TOML file
    Get {
        /// File path relative to the bundle
        file: PathBuf,
    },
    /// Replace the value stored in a file, creating it when missing
    Set {
        /// File path relative to the bundle
        file: PathBuf,
        /// New value as JSON
        json: String,
    },
    /// Remove a file or directory from the bundle
    Rm {
        /// Entry path relative to the bundle
        path: PathBuf,
    },
    /// Print the effective configuration as TOML
    Config,
}

/// CLI context for command execution
pub struct CliContext {
    root: BundleRoot<DynamicBundle>,
    config: AppConfig,
}

impl CliContext {
    pub fn new(bundle: PathBuf, config: AppConfig) -> anyhow::Result<Self> {
        let root = BundleRoot::open(&bundle, config.sync.clone())
            .with_context(|| format!("Failed to open bundle at {}", bundle.display()))?;
        Ok(Self { root, config })
    }

    pub fn root(&self) -> &BundleRoot<DynamicBundle> {
        &self.root
    }

    /// Execute a CLI command and return its printable output
    pub fn execute(&self, command: &Commands) -> anyhow::Result<String> {
        match command {
            Commands::Tree => Ok(self.tree()),
            Commands::Get { file } => self.get(file),
            Commands::Set { file, json } => self.set(file, json),
            Commands::Rm { path } => self.remove(path),
            Commands::Config => {
                toml::to_string_pretty(&self.config).context("Failed to render configuration")
            }
        }
    }

    fn tree(&self) -> String {
        let mut rows = Vec::new();
        collect_rows(self.root.node(), PathBuf::new(), &mut rows);
        if rows.is_empty() {
            return "Bundle is empty.".to_string();
        }
        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["Path", "Kind", "Pending"]);
        for (path, kind, pending) in rows {
            let pending = if pending { "yes" } else { "no" };
            table.add_row(vec![
                path.display().to_string(),
                kind.as_str().to_string(),
                pending.to_string(),
            ]);
        }
        table.to_string()
    }

    fn get(&self, file: &Path) -> anyhow::Result<String> {
        let scope = self.root.bundle().scope();
        if scope.entry(file).is_none() {
            anyhow::bail!("No entry at {}", file.display());
        }
        let coordinator = scope.file(FileProperty::<serde_json::Value>::new(file))?;
        let value = coordinator
            .read()
            .with_context(|| format!("Failed to read {}", file.display()))?;
        coordinator.discard();
        Ok(serde_json::to_string_pretty(&value)?)
    }

    fn set(&self, file: &Path, json: &str) -> anyhow::Result<String> {
        let value: serde_json::Value =
            serde_json::from_str(json).context("Value is not valid JSON")?;
        let scope = self.root.bundle().scope();
        let coordinator =
            scope.file(FileProperty::new(file).initial(value.clone()))?;
        coordinator.write(value);
        let report = self
            .root
            .commit()
            .with_context(|| format!("Failed to write {}", file.display()))?;
        info!(file = %file.display(), written = report.written, "Set value");
        Ok(format!("Wrote {}", file.display()))
    }

    fn remove(&self, path: &Path) -> anyhow::Result<String> {
        let removed = self.root.bundle().scope().remove(path)?;
        if !removed {
            return Ok(format!("Nothing at {}", path.display()));
        }
        self.root
            .flush()
            .with_context(|| format!("Failed to remove {}", path.display()))?;
        Ok(format!("Removed {}", path.display()))
    }
}

fn collect_rows(node: &Node, prefix: PathBuf, rows: &mut Vec<(PathBuf, EntryKind, bool)>) {
    for (name, child) in node.children() {
        let path = prefix.join(&name);
        rows.push((path.clone(), child.kind(), child.has_pending_changes()));
        if child.is_directory() {
            collect_rows(&child, path, rows);
        }
    }
}
