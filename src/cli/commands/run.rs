//! Implementation of the `evalsmith run` command.

use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;

use crate::adapters::agents::CommandAgentRunner;
use crate::adapters::dimensions::YamlDimensionSource;
use crate::adapters::llm::create_provider;
use crate::cli::output::{output, CommandOutput, ProgressObserver, TableFormatter};
use crate::cli::ProjectContext;
use crate::services::{DimensionProvider, RunRequest, RunSummary, RunnerContext, TestRunner};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Entity to test, as `name` or `kind:name` (repeatable; defaults to every entity)
    #[arg(short, long)]
    pub entity: Vec<String>,

    /// Dimension to test (repeatable; defaults to each entity's dimensions)
    #[arg(short, long)]
    pub dimension: Vec<String>,

    /// Maximum concurrently executing tests
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Maximum concurrent judge/generator calls
    #[arg(long)]
    pub llm_concurrency: Option<usize>,

    /// Generate tests for selected dimensions that have none
    #[arg(long)]
    pub generate_missing: bool,
}

impl From<RunArgs> for RunRequest {
    fn from(args: RunArgs) -> Self {
        Self {
            entities: args.entity,
            dimensions: args.dimension,
            max_concurrency: args.concurrency,
            max_llm_concurrency: args.llm_concurrency,
            generate_missing: args.generate_missing,
        }
    }
}

impl CommandOutput for RunSummary {
    fn to_human(&self) -> String {
        let formatter = TableFormatter::new();
        let mut lines = Vec::new();

        for (entity, dimension, count) in &self.generated {
            lines.push(format!("Generated {count} test(s) for {entity} / {dimension}"));
        }

        lines.push(format!(
            "Run {}: {} test(s), {} passed, {} failed, {} error(s) ({:.1}% success) in {:.1}s",
            self.run_id,
            self.total,
            self.passed,
            self.failed,
            self.errors,
            self.success_rate * 100.0,
            self.duration_ms as f64 / 1000.0,
        ));

        if !self.dimensions.is_empty() {
            lines.push(String::new());
            lines.push(formatter.format_dimensions(&self.dimensions));
        }

        if self.tests.iter().any(|t| !t.passed) {
            lines.push("\nNot passed:".to_string());
            lines.push(formatter.format_failures(&self.tests));
        }

        if let Some(snapshot) = &self.snapshot {
            lines.push(format!("\nSnapshot written: {snapshot}"));
        }
        lines.join("\n")
    }
}

pub async fn execute(args: RunArgs, project: &ProjectContext, json_mode: bool) -> Result<()> {
    let config = project.config.clone();

    let mut store = project.open_store().await?;
    let source = Arc::new(YamlDimensionSource::new(project.root.join(&config.dimensions.dir)));
    let dimensions = Arc::new(DimensionProvider::new(
        source,
        config.evaluation.default_strictness,
    ));
    let agent_runner = Arc::new(CommandAgentRunner::new(
        config.agents.clone(),
        project.root.clone(),
    ));
    let llm = create_provider(&config.llm).context("Failed to create LLM provider")?;

    let progress = Arc::new(if json_mode {
        ProgressObserver::hidden()
    } else {
        ProgressObserver::new()
    });
    let ctx = RunnerContext::new(agent_runner, llm, dimensions, config)
        .with_observer(progress.clone());
    let runner = TestRunner::new(ctx);

    let result = runner.run(&mut store, RunRequest::from(args)).await;
    progress.finish();
    let summary = result.context("Evaluation run failed")?;

    output(&summary, json_mode);
    Ok(())
}
