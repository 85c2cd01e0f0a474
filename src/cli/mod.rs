//! Command-line interface: argument types, command handlers and output.

pub mod commands;
pub mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::adapters::storage::JsonSpecRepository;
use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;
use crate::services::SpecStore;
use commands::{init::InitArgs, run::RunArgs, snapshots::SnapshotsArgs, status::StatusArgs};

pub use output::{create_progress_bar, ProgressObserver, TableFormatter};

#[derive(Parser)]
#[command(name = "evalsmith")]
#[command(about = "Evalsmith - evaluation harness for agents, teams and flows", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Project directory
    #[arg(short, long, global = true, default_value = ".")]
    pub path: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the .evalsmith directory with a default configuration
    Init(InitArgs),
    /// Run evaluation tests
    Run(RunArgs),
    /// Show entities, dimensions, last results and trends
    Status(StatusArgs),
    /// List version snapshots of the eval spec
    Snapshots(SnapshotsArgs),
}

/// Resolved project directory and its configuration.
pub struct ProjectContext {
    pub root: PathBuf,
    pub config: Config,
}

impl ProjectContext {
    pub fn load(path: &Path) -> Result<Self> {
        let root = resolve_path(path)?;
        let config = ConfigLoader::load_for_project(&root)
            .with_context(|| format!("Failed to load configuration for {}", root.display()))?;
        Ok(Self { root, config })
    }

    /// Project identifier recorded in new documents: the directory name.
    pub fn project_id(&self) -> String {
        self.root
            .file_name()
            .map_or_else(|| "project".to_string(), |n| n.to_string_lossy().into_owned())
    }

    pub fn repository(&self) -> Arc<JsonSpecRepository> {
        Arc::new(JsonSpecRepository::from_config(&self.root, &self.config.storage))
    }

    pub async fn open_store(&self) -> Result<SpecStore> {
        SpecStore::load_or_create(self.repository(), &self.project_id())
            .await
            .context("Failed to load eval spec")
    }
}

/// Make `path` absolute against the current directory.
pub fn resolve_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("Failed to get current directory")?
            .join(path))
    }
}

/// Report a command failure and exit non-zero.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let chain: Vec<String> = err.chain().map(ToString::to_string).collect();
        let value = serde_json::json!({
            "success": false,
            "error": err.to_string(),
            "causes": chain.get(1..).unwrap_or_default(),
        });
        println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
    } else {
        eprintln!("{} {err:#}", console::style("Error:").red().bold());
    }
    std::process::exit(1);
}
