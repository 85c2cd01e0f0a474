use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::evaluation::{ConsistencyMethod, DEFAULT_STRICTNESS};

/// Main configuration structure for evalsmith
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Concurrency, timeout and retry settings for test execution
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Evaluation defaults applied when tests and dimensions are silent
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// Specification document and snapshot storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Dimension definition loading
    #[serde(default)]
    pub dimensions: DimensionsConfig,

    /// LLM judge/generator configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// How agents are invoked
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionConfig {
    /// Maximum number of tests executing at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Maximum number of in-flight LLM calls
    #[serde(default = "default_max_llm_concurrency")]
    pub max_llm_concurrency: usize,

    /// Per-test agent invocation timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retries after the first attempt for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between retries in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

const fn default_max_concurrency() -> usize {
    5
}

const fn default_max_llm_concurrency() -> usize {
    3
}

const fn default_timeout_ms() -> u64 {
    60_000
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_retry_delay_ms() -> u64 {
    2_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_llm_concurrency: default_max_llm_concurrency(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Evaluation defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EvaluationConfig {
    /// Strictness used when neither criterion nor dimension sets one (0-100)
    #[serde(default = "default_strictness")]
    pub default_strictness: u8,

    /// Percentage of criteria that must be met for a test to pass (0-100)
    #[serde(default = "default_passing_percentage")]
    pub passing_criteria_percentage: f64,

    /// Minimum average similarity for multi-run outputs to count as consistent
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Runs per input for multi-run dimensions without explicit configuration
    #[serde(default = "default_runs_per_input")]
    pub default_runs_per_input: u32,

    /// Which similarity formula drives the consistent flag
    #[serde(default)]
    pub consistency_method: ConsistencyMethod,
}

const fn default_strictness() -> u8 {
    DEFAULT_STRICTNESS
}

const fn default_passing_percentage() -> f64 {
    100.0
}

const fn default_similarity_threshold() -> f64 {
    0.8
}

const fn default_runs_per_input() -> u32 {
    3
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            default_strictness: default_strictness(),
            passing_criteria_percentage: default_passing_percentage(),
            similarity_threshold: default_similarity_threshold(),
            default_runs_per_input: default_runs_per_input(),
            consistency_method: ConsistencyMethod::default(),
        }
    }
}

/// Specification document storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StorageConfig {
    /// Project-relative path of the eval spec document
    #[serde(default = "default_spec_path")]
    pub spec_path: String,

    /// Project-relative directory for version snapshots
    #[serde(default = "default_history_dir")]
    pub history_dir: String,

    /// Maximum snapshots kept
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,

    /// Snapshots older than this are evicted
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Most recent snapshots always kept regardless of age or count
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

fn default_spec_path() -> String {
    ".evalsmith/eval-spec.json".to_string()
}

fn default_history_dir() -> String {
    ".evalsmith/history".to_string()
}

const fn default_max_snapshots() -> usize {
    20
}

const fn default_retention_days() -> u32 {
    30
}

const fn default_keep_recent() -> usize {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            spec_path: default_spec_path(),
            history_dir: default_history_dir(),
            max_snapshots: default_max_snapshots(),
            retention_days: default_retention_days(),
            keep_recent: default_keep_recent(),
        }
    }
}

/// Dimension loading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DimensionsConfig {
    /// Project-relative directory of `<name>.yml` definitions
    #[serde(default = "default_dimensions_dir")]
    pub dir: String,

    /// Dimensions evaluated when a run does not name any
    #[serde(default = "default_enabled_dimensions")]
    pub enabled: Vec<String>,
}

fn default_dimensions_dir() -> String {
    ".evalsmith/dimensions".to_string()
}

fn default_enabled_dimensions() -> Vec<String> {
    vec![
        "consistency".to_string(),
        "safety".to_string(),
        "performance".to_string(),
    ]
}

impl Default for DimensionsConfig {
    fn default() -> Self {
        Self {
            dir: default_dimensions_dir(),
            enabled: default_enabled_dimensions(),
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LlmConfig {
    /// Provider name (currently "anthropic")
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model used for evaluation and generation
    #[serde(default = "default_model")]
    pub model: String,

    /// API key (can also be set via ANTHROPIC_API_KEY env var)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// API base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API version header
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Max tokens per response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Request pacing for the provider
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_api_version() -> String {
    "2023-06-01".to_string()
}

const fn default_llm_timeout() -> u64 {
    120
}

const fn default_max_tokens() -> u32 {
    2048
}

const fn default_requests_per_second() -> u32 {
    5
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: default_base_url(),
            api_version: default_api_version(),
            timeout_secs: default_llm_timeout(),
            max_tokens: default_max_tokens(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

impl LlmConfig {
    /// Get API key from config or environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
    }
}

/// Agent invocation configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct AgentsConfig {
    /// Command used for entities without an explicit entry. `{entity}` and
    /// `{kind}` in arguments are replaced with the entity name and kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_command: Option<AgentCommandConfig>,

    /// Per-entity commands
    #[serde(default)]
    pub commands: HashMap<String, AgentCommandConfig>,
}

/// A command that runs one entity: input JSON on stdin, output on stdout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentCommandConfig {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory relative to the project root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files (stderr only when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Number of days to retain logs
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

const fn default_log_retention_days() -> u32 {
    14
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            retention_days: default_log_retention_days(),
        }
    }
}
