//! Implementation of the `evalsmith init` command.

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::adapters::storage::JsonSpecRepository;
use crate::cli::output::{output, CommandOutput};
use crate::cli::ProjectContext;
use crate::domain::models::{Config, EvalSpec};
use crate::domain::ports::SpecRepository;
use crate::infrastructure::config::loader::CONFIG_DIR;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config.yaml (the eval spec is never replaced)
    #[arg(long, short)]
    pub force: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub message: String,
    pub initialized_path: PathBuf,
    pub directories_created: Vec<String>,
    pub config_written: bool,
    pub spec_created: bool,
}

impl CommandOutput for InitOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![self.message.clone()];
        if !self.directories_created.is_empty() {
            lines.push("\nCreated directories:".to_string());
            for dir in &self.directories_created {
                lines.push(format!("  - {dir}"));
            }
        }
        if self.config_written {
            lines.push(format!("\nWrote {CONFIG_DIR}/config.yaml"));
        }
        if self.spec_created {
            lines.push("Created an empty eval spec".to_string());
        }
        lines.join("\n")
    }
}

pub async fn execute(args: InitArgs, project: &ProjectContext, json_mode: bool) -> Result<()> {
    let result = initialize(&project.root, &project.project_id(), args.force).await?;
    output(&result, json_mode);
    Ok(())
}

/// Lay out the project directory. Uses the default storage paths, since no
/// configuration exists yet.
pub async fn initialize(root: &Path, project_id: &str, force: bool) -> Result<InitOutput> {
    let config_dir = root.join(CONFIG_DIR);
    let config_path = config_dir.join("config.yaml");

    if config_path.exists() && !force {
        return Ok(InitOutput {
            success: false,
            message: "Project already initialized. Use --force to rewrite config.yaml.".to_string(),
            initialized_path: root.to_path_buf(),
            directories_created: vec![],
            config_written: false,
            spec_created: false,
        });
    }

    let config = Config::default();
    let mut directories_created = vec![];
    let dirs = [
        config_dir.clone(),
        root.join(&config.dimensions.dir),
        root.join(&config.storage.history_dir),
    ];
    for dir in &dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let relative = dir
                .strip_prefix(root)
                .unwrap_or(dir)
                .to_string_lossy()
                .to_string();
            directories_created.push(relative);
        }
    }

    let yaml = serde_yaml::to_string(&config).context("Failed to serialize default config")?;
    fs::write(&config_path, yaml)
        .await
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    let repository = JsonSpecRepository::from_config(root, &config.storage);
    let spec_created = if repository.spec_path().exists() {
        false
    } else {
        repository
            .save(&EvalSpec::new(project_id))
            .await
            .context("Failed to create eval spec")?;
        true
    };

    Ok(InitOutput {
        success: true,
        message: if force {
            "Project reinitialized successfully.".to_string()
        } else {
            "Project initialized successfully.".to_string()
        },
        initialized_path: root.to_path_buf(),
        directories_created,
        config_written: true,
        spec_created,
    })
}
