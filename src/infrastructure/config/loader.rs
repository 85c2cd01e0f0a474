use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use std::path::Path;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_concurrency: {0}. Must be between 1 and 256")]
    InvalidMaxConcurrency(usize),

    #[error("Invalid max_llm_concurrency: {0}. Must be between 1 and 64")]
    InvalidMaxLlmConcurrency(usize),

    #[error("Invalid timeout_ms: {0}. Must be positive")]
    InvalidTimeout(u64),

    #[error("Invalid strictness: {0}. Must be between 0 and 100")]
    InvalidStrictness(u8),

    #[error("Invalid passing_criteria_percentage: {0}. Must be between 0 and 100")]
    InvalidPassingPercentage(f64),

    #[error("Invalid similarity_threshold: {0}. Must be between 0 and 1")]
    InvalidSimilarityThreshold(f64),

    #[error("Invalid default_runs_per_input: {0}. Must be at least 1")]
    InvalidRunsPerInput(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Specification path cannot be empty")]
    EmptySpecPath,

    #[error("Invalid requests_per_second: {0}. Must be at least 1")]
    InvalidRequestRate(u32),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Project-relative directory holding the configuration files.
pub const CONFIG_DIR: &str = ".evalsmith";

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for the project in the current directory.
    pub fn load() -> Result<Config> {
        Self::load_for_project(Path::new("."))
    }

    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. <project>/.evalsmith/config.yaml (project config, created by init)
    /// 3. <project>/.evalsmith/local.yaml (local overrides, optional)
    /// 4. Environment variables (EVALSMITH_* prefix, highest priority)
    pub fn load_for_project(project_root: &Path) -> Result<Config> {
        let dir = project_root.join(CONFIG_DIR);
        let config: Config = Self::figment(&dir)
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment(config_dir: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(config_dir.join("config.yaml")))
            .merge(Yaml::file(config_dir.join("local.yaml")))
            .merge(Env::prefixed("EVALSMITH_").split("__"))
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let execution = &config.execution;
        if execution.max_concurrency == 0 || execution.max_concurrency > 256 {
            return Err(ConfigError::InvalidMaxConcurrency(execution.max_concurrency));
        }
        if execution.max_llm_concurrency == 0 || execution.max_llm_concurrency > 64 {
            return Err(ConfigError::InvalidMaxLlmConcurrency(
                execution.max_llm_concurrency,
            ));
        }
        if execution.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(execution.timeout_ms));
        }

        let evaluation = &config.evaluation;
        if evaluation.default_strictness > 100 {
            return Err(ConfigError::InvalidStrictness(evaluation.default_strictness));
        }
        if !(0.0..=100.0).contains(&evaluation.passing_criteria_percentage) {
            return Err(ConfigError::InvalidPassingPercentage(
                evaluation.passing_criteria_percentage,
            ));
        }
        if !(0.0..=1.0).contains(&evaluation.similarity_threshold) {
            return Err(ConfigError::InvalidSimilarityThreshold(
                evaluation.similarity_threshold,
            ));
        }
        if evaluation.default_runs_per_input == 0 {
            return Err(ConfigError::InvalidRunsPerInput(
                evaluation.default_runs_per_input,
            ));
        }

        if config.storage.spec_path.trim().is_empty() {
            return Err(ConfigError::EmptySpecPath);
        }
        if config.storage.keep_recent > config.storage.max_snapshots {
            return Err(ConfigError::ValidationFailed(format!(
                "storage.keep_recent ({}) cannot exceed storage.max_snapshots ({})",
                config.storage.keep_recent, config.storage.max_snapshots
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.llm.requests_per_second == 0 {
            return Err(ConfigError::InvalidRequestRate(config.llm.requests_per_second));
        }

        if let Some(cmd) = &config.agents.default_command {
            if cmd.command.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "agents.default_command command cannot be empty".to_string(),
                ));
            }
        }
        for (name, cmd) in &config.agents.commands {
            if cmd.command.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "agent '{name}' command cannot be empty"
                )));
            }
        }

        Ok(())
    }
}
