//! Implementation of the `evalsmith status` command.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use std::sync::Arc;

use crate::adapters::dimensions::YamlDimensionSource;
use crate::cli::output::{output, CommandOutput, TableFormatter};
use crate::cli::ProjectContext;
use crate::domain::models::{EntityKind, EntityRef, EvalSpec, TestRunRecord, Trend};
use crate::services::DimensionProvider;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only show this entity (`name` or `kind:name`)
    #[arg(short, long)]
    pub entity: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionStatus {
    pub name: String,
    pub tests: usize,
    pub trend: Trend,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_passed: Option<usize>,
    pub last_total: Option<usize>,
    pub last_score: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityStatus {
    pub entity: EntityRef,
    pub version: u32,
    pub total_runs: u64,
    pub average_score: f64,
    pub trend: Trend,
    pub dimensions: Vec<DimensionStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusOutput {
    pub project_id: String,
    pub test_count: usize,
    pub entities: Vec<EntityStatus>,
    pub last_run: Option<TestRunRecord>,
    /// Dimension definitions found in the project's dimensions directory.
    pub available_dimensions: Vec<String>,
    #[serde(skip)]
    spec: EvalSpec,
}

impl StatusOutput {
    pub fn from_spec(spec: EvalSpec, only: Option<&str>) -> Self {
        let entities = spec
            .entity_refs()
            .into_iter()
            .filter(|e| only.is_none_or(|selector| e.matches(selector)))
            .filter_map(|entity_ref| {
                let entity = spec.entity(&entity_ref)?;
                let tracking = &entity.performance;
                let dimensions = entity
                    .test_specs
                    .iter()
                    .map(|(name, tests)| {
                        let last = tests.last_results.as_ref();
                        DimensionStatus {
                            name: name.clone(),
                            tests: tests.tests.len(),
                            trend: tracking.trends.dimensions.get(name).copied().unwrap_or_default(),
                            last_run_at: last.map(|r| r.timestamp),
                            last_passed: last.map(|r| r.passed),
                            last_total: last.map(|r| r.total),
                            last_score: last.map(|r| r.score),
                        }
                    })
                    .collect();
                Some(EntityStatus {
                    version: entity.discovered.version,
                    total_runs: tracking.total_runs,
                    average_score: tracking.average_score,
                    trend: tracking.trends.overall,
                    dimensions,
                    entity: entity_ref,
                })
            })
            .collect();

        let mut shown = spec.clone();
        if let Some(name) = only {
            for kind in EntityKind::all() {
                shown
                    .entities_mut(kind)
                    .retain(|n, _| EntityRef::new(kind, n.clone()).matches(name));
            }
        }

        Self {
            project_id: spec.project_id.clone(),
            test_count: spec.test_count(),
            last_run: spec.test_history.runs.last().cloned(),
            entities,
            available_dimensions: Vec::new(),
            spec: shown,
        }
    }

    #[must_use]
    pub fn with_available_dimensions(mut self, names: Vec<String>) -> Self {
        self.available_dimensions = names;
        self
    }
}

impl CommandOutput for StatusOutput {
    fn to_human(&self) -> String {
        if self.entities.is_empty() {
            return format!("No entities in the eval spec for {}.", self.project_id);
        }

        let mut lines = vec![
            format!("Project {} ({} test specification(s))", self.project_id, self.test_count),
            TableFormatter::new().format_entities(&self.spec),
        ];

        for entity in &self.entities {
            if entity.dimensions.is_empty() {
                continue;
            }
            lines.push(format!("\n{}", entity.entity));
            for dimension in &entity.dimensions {
                let last = match (dimension.last_passed, dimension.last_total, dimension.last_score) {
                    (Some(passed), Some(total), Some(score)) => {
                        format!("last run {passed}/{total} passed, score {:.0}%", score * 100.0)
                    }
                    _ => "never run".to_string(),
                };
                lines.push(format!(
                    "  {:<20} {:>3} test(s)  {}  ({})",
                    dimension.name, dimension.tests, last, dimension.trend
                ));
            }
        }

        if let Some(run) = &self.last_run {
            lines.push(format!(
                "\nLast run {} at {}: {}/{} passed, {} error(s)",
                run.run_id,
                run.timestamp.format("%Y-%m-%d %H:%M:%S"),
                run.passed,
                run.total,
                run.errors
            ));
        }
        if !self.available_dimensions.is_empty() {
            lines.push(format!(
                "\nDimension definitions: {}",
                self.available_dimensions.join(", ")
            ));
        }
        lines.join("\n")
    }
}

pub async fn execute(args: StatusArgs, project: &ProjectContext, json_mode: bool) -> Result<()> {
    let store = project.open_store().await?;
    let source = Arc::new(YamlDimensionSource::new(
        project.root.join(&project.config.dimensions.dir),
    ));
    let available = DimensionProvider::new(source, project.config.evaluation.default_strictness)
        .available()
        .await
        .context("Failed to list dimension definitions")?;
    let status = StatusOutput::from_spec(store.spec().clone(), args.entity.as_deref())
        .with_available_dimensions(available);
    output(&status, json_mode);
    Ok(())
}
