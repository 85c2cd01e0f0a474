//! Runs entities as external processes.
//!
//! The test input is written to the child's stdin as JSON. Stdout is parsed
//! as JSON when possible and kept as a trimmed string otherwise.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AgentCommandConfig, AgentsConfig, EntityRef, InvocationOutput, InvocationRequest};
use crate::domain::ports::AgentRunner;

/// Stderr kept in error messages.
const MAX_STDERR_CHARS: usize = 2_000;

pub struct CommandAgentRunner {
    config: AgentsConfig,
    project_root: PathBuf,
}

impl CommandAgentRunner {
    pub fn new(config: AgentsConfig, project_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            project_root: project_root.into(),
        }
    }

    /// Command for an entity: its own entry, else the default command.
    fn command_for(&self, entity: &EntityRef) -> DomainResult<&AgentCommandConfig> {
        self.config
            .commands
            .get(&entity.name)
            .or(self.config.default_command.as_ref())
            .ok_or_else(|| {
                DomainError::InvalidConfiguration(format!(
                    "no command configured for {entity} and no agents.default_command"
                ))
            })
    }
}

fn substitute(arg: &str, entity: &EntityRef) -> String {
    arg.replace("{entity}", &entity.name)
        .replace("{kind}", entity.kind.as_str())
}

fn parse_stdout(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[async_trait]
impl AgentRunner for CommandAgentRunner {
    fn name(&self) -> &'static str {
        "command"
    }

    #[instrument(skip(self, request), fields(entity = %request.entity, test_id = %request.test_id))]
    async fn invoke(&self, request: InvocationRequest) -> DomainResult<InvocationOutput> {
        let spec = self.command_for(&request.entity)?;
        let working_dir = spec
            .working_dir
            .as_ref()
            .map_or_else(|| self.project_root.clone(), |dir| self.project_root.join(dir));

        let mut cmd = Command::new(&spec.command);
        cmd.args(spec.args.iter().map(|a| substitute(a, &request.entity)))
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.env("EVALSMITH_ENTITY", &request.entity.name)
            .env("EVALSMITH_ENTITY_KIND", request.entity.kind.as_str())
            .env("EVALSMITH_TEST_ID", &request.test_id);

        let payload = serde_json::to_vec(&request.input)?;
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            DomainError::invocation(format!("failed to spawn '{}': {e}", spec.command), false)
        })?;

        // Stdin is written while output is drained; dropping it signals EOF.
        let stdin = child.stdin.take();
        let feed_input = async move {
            if let Some(mut stdin) = stdin {
                // A child that exits without reading its input is not an error.
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "child closed stdin early");
                }
            }
        };
        let ((), output) = tokio::join!(feed_input, child.wait_with_output());
        let output = output.map_err(|e| {
            DomainError::invocation(format!("failed to wait for '{}': {e}", spec.command), true)
        })?;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(MAX_STDERR_CHARS).collect();
            return Err(DomainError::invocation(
                format!("'{}' exited with {}: {stderr}", spec.command, output.status),
                true,
            ));
        }

        debug!(latency_ms, bytes = output.stdout.len(), "entity responded");
        Ok(InvocationOutput {
            output: parse_stdout(&output.stdout),
            latency_ms,
        })
    }
}
