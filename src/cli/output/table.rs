//! Table output formatting for CLI commands
//!
//! Renders run summaries, per-test results, entity status and snapshots with
//! comfy-table. Colors are dropped when the terminal cannot show them.

use chrono::{DateTime, Utc};
use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use std::env;

use super::truncate;
use crate::domain::models::{EntityKind, EntitySpec, EvalSpec, Trend};
use crate::domain::ports::SnapshotInfo;
use crate::services::result_aggregator::{DimensionSummary, TestOutcome};

/// Table formatter for CLI output
pub struct TableFormatter {
    /// Whether to use colors in output
    use_colors: bool,
    /// Maximum width for tables (None = auto)
    max_width: Option<usize>,
}

impl TableFormatter {
    /// Create a new table formatter
    pub fn new() -> Self {
        Self {
            use_colors: supports_color(),
            max_width: None,
        }
    }

    /// Create a new table formatter with custom settings
    pub fn with_config(use_colors: bool, max_width: Option<usize>) -> Self {
        Self {
            use_colors,
            max_width,
        }
    }

    /// One row per (entity, dimension) of a run.
    pub fn format_dimensions(&self, summaries: &[DimensionSummary]) -> String {
        let mut table = self.create_base_table();
        table.set_header(header(&[
            "Entity", "Dimension", "Tests", "Passed", "Failed", "Errors", "Score",
        ]));

        for summary in summaries {
            let tally = &summary.tally;
            table.add_row(vec![
                Cell::new(summary.entity.to_string()),
                Cell::new(&summary.dimension),
                Cell::new(tally.total),
                self.count_cell(tally.passed, Color::Green),
                self.count_cell(tally.failed, Color::Red),
                self.count_cell(tally.errors, Color::Yellow),
                self.score_cell(tally.score),
            ]);
        }

        table.to_string()
    }

    /// One row per test that did not pass.
    pub fn format_failures(&self, outcomes: &[TestOutcome]) -> String {
        let mut table = self.create_base_table();
        table.set_header(header(&["Test", "Entity", "Dimension", "Result", "Detail"]));

        for outcome in outcomes.iter().filter(|o| !o.passed) {
            let (label, color) = if outcome.errored {
                ("error", Color::Yellow)
            } else {
                ("failed", Color::Red)
            };
            let result_cell = if self.use_colors {
                Cell::new(label).fg(color)
            } else {
                Cell::new(format!("✗ {label}"))
            };

            table.add_row(vec![
                Cell::new(truncate(&outcome.test_spec_id, 30)),
                Cell::new(outcome.entity.to_string()),
                Cell::new(&outcome.dimension),
                result_cell,
                Cell::new(truncate(&outcome_detail(outcome), 60)),
            ]);
        }

        table.to_string()
    }

    /// Every entity in the document with its tracking figures.
    pub fn format_entities(&self, spec: &EvalSpec) -> String {
        let mut table = self.create_base_table();
        table.set_header(header(&[
            "Kind", "Name", "Version", "Tests", "Runs", "Avg Score", "Trend", "Last Run",
        ]));

        for kind in EntityKind::all() {
            for (name, entity) in spec.entities(kind) {
                let trend = entity.performance.trends.overall;
                let trend_cell = if self.use_colors {
                    Cell::new(trend.to_string()).fg(trend_color(trend))
                } else {
                    Cell::new(format!("{} {trend}", trend_icon(trend)))
                };

                table.add_row(vec![
                    Cell::new(kind.as_str()),
                    Cell::new(name),
                    Cell::new(entity.discovered.version),
                    Cell::new(entity.test_count()),
                    Cell::new(entity.performance.total_runs),
                    self.score_cell(entity.performance.average_score),
                    trend_cell,
                    Cell::new(last_run(entity).map_or_else(|| "-".to_string(), format_relative_time)),
                ]);
            }
        }

        table.to_string()
    }

    /// Snapshots, oldest first.
    pub fn format_snapshots(&self, snapshots: &[SnapshotInfo]) -> String {
        let mut table = self.create_base_table();
        table.set_header(header(&["ID", "Created", "Changed Entities"]));

        for snapshot in snapshots {
            let changed = if snapshot.changed_entities.is_empty() {
                "-".to_string()
            } else {
                snapshot.changed_entities.join(", ")
            };
            table.add_row(vec![
                Cell::new(&snapshot.id),
                Cell::new(snapshot.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
                Cell::new(truncate(&changed, 60)),
            ]);
        }

        table.to_string()
    }

    fn count_cell(&self, count: usize, color: Color) -> Cell {
        if self.use_colors && count > 0 {
            Cell::new(count).fg(color)
        } else {
            Cell::new(count)
        }
    }

    fn score_cell(&self, score: f64) -> Cell {
        let text = format!("{:.0}%", score * 100.0);
        if !self.use_colors {
            return Cell::new(text);
        }
        let color = if score >= 0.8 {
            Color::Green
        } else if score >= 0.5 {
            Color::Yellow
        } else {
            Color::Red
        };
        Cell::new(text).fg(color)
    }

    /// Create a base table with common settings
    fn create_base_table(&self) -> Table {
        let mut table = Table::new();

        table
            .load_preset(presets::UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);

        if let Some(width) = self.max_width {
            table.set_width(u16::try_from(width).unwrap_or(u16::MAX));
        }

        table
    }
}

impl Default for TableFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn header(titles: &[&str]) -> Vec<Cell> {
    titles
        .iter()
        .map(|t| Cell::new(t).add_attribute(Attribute::Bold))
        .collect()
}

/// Check if color output is supported
fn supports_color() -> bool {
    if env::var("NO_COLOR").is_ok() {
        return false;
    }

    if let Ok(term) = env::var("TERM") {
        if term == "dumb" {
            return false;
        }
    }

    true
}

fn outcome_detail(outcome: &TestOutcome) -> String {
    if let Some(error) = &outcome.error {
        return error.clone();
    }
    match (outcome.passed_runs, outcome.runs) {
        (Some(passed), Some(runs)) => {
            let similarity = outcome
                .similarity
                .map_or_else(String::new, |s| format!(", similarity {s:.2}"));
            format!("{passed}/{runs} runs passed{similarity}")
        }
        _ => format!("score {:.0}%", outcome.score * 100.0),
    }
}

fn last_run(entity: &EntitySpec) -> Option<DateTime<Utc>> {
    entity.performance.score_history.last().map(|e| e.timestamp)
}

fn trend_color(trend: Trend) -> Color {
    match trend {
        Trend::Improving => Color::Green,
        Trend::Degrading => Color::Red,
        Trend::Stable => Color::White,
    }
}

fn trend_icon(trend: Trend) -> &'static str {
    match trend {
        Trend::Improving => "↑",
        Trend::Degrading => "↓",
        Trend::Stable => "→",
    }
}

/// Format relative time (e.g., "2 hours ago")
fn format_relative_time(datetime: DateTime<Utc>) -> String {
    let duration = Utc::now().signed_duration_since(datetime);

    if duration.num_seconds() < 60 {
        "just now".to_string()
    } else if duration.num_minutes() < 60 {
        let mins = duration.num_minutes();
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if duration.num_hours() < 24 {
        let hours = duration.num_hours();
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        let days = duration.num_days();
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    }
}
