//! Test unit domain model.
//!
//! A test unit is one concrete scheduled execution: one entity, one
//! dimension, one input and (for multi-run tests) one run. Multi-run tests
//! get an extra hidden parent unit whose status is derived from its runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::errors::DomainError;

use super::entity::EntityKind;
use super::evaluation::{ConsistencyReport, CriterionEvaluation};

/// Lifecycle state of a test unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// Created and waiting for a queue slot
    #[default]
    Queued,
    /// Agent invocation or evaluation in progress
    Running,
    /// Executed and evaluated (see `TestResult::success` for the verdict)
    Completed,
    /// An error prevented a verdict
    Failed,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [TestStatus] {
        match self {
            Self::Queued => &[Self::Running, Self::Failed],
            Self::Running => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an executed unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TestResult {
    /// Whether the unit passed its criteria (or, for parents, the majority rule).
    pub success: bool,
    /// Score in [0, 1].
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<CriterionEvaluation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency: Option<ConsistencyReport>,
    /// Invocation attempts consumed (1 = no retries).
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed_runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_runs: Option<u32>,
}

/// One concrete execution tracked by the state tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestUnit {
    pub id: String,
    pub entity_name: String,
    pub entity_kind: EntityKind,
    pub dimension: String,
    pub input_index: usize,
    pub input: serde_json::Value,
    pub run_index: Option<u32>,
    pub parent_id: Option<String>,
    /// Id of the `TestSpecification` this unit executes, when known.
    pub test_spec_id: Option<String>,
    pub status: TestStatus,
    pub result: Option<TestResult>,
    pub error: Option<String>,
    /// `DomainError::kind` of the failure recorded in `error`.
    pub error_kind: Option<String>,
    pub latency_ms: Option<u64>,
    pub is_multi_run: bool,
    pub is_parent_test: bool,
    pub total_runs: Option<u32>,
    pub completed_runs: Option<u32>,
    pub visible_in_queue: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TestUnit {
    /// Build the id for a unit. Children carry a `run` suffix; parents and
    /// single-run units share the base form. The kind keeps an agent and a
    /// team of the same name apart.
    pub fn make_id(
        entity_kind: EntityKind,
        entity_name: &str,
        dimension: &str,
        input_index: usize,
        run_index: Option<u32>,
    ) -> String {
        match run_index {
            Some(run) => format!("{entity_kind}:{entity_name}:{dimension}:{input_index}:run{run}"),
            None => format!("{entity_kind}:{entity_name}:{dimension}:{input_index}"),
        }
    }

    pub fn new(
        entity_name: impl Into<String>,
        entity_kind: EntityKind,
        dimension: impl Into<String>,
        input_index: usize,
        input: serde_json::Value,
        run_index: Option<u32>,
    ) -> Self {
        let entity_name = entity_name.into();
        let dimension = dimension.into();
        Self {
            id: Self::make_id(entity_kind, &entity_name, &dimension, input_index, run_index),
            entity_name,
            entity_kind,
            dimension,
            input_index,
            input,
            run_index,
            parent_id: None,
            test_spec_id: None,
            status: TestStatus::Queued,
            result: None,
            error: None,
            error_kind: None,
            latency_ms: None,
            is_multi_run: run_index.is_some(),
            is_parent_test: false,
            total_runs: None,
            completed_runs: None,
            visible_in_queue: true,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether this unit is a run of a multi-run group.
    pub fn is_child(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Whether the unit counts as a top-level test in summaries.
    pub fn is_top_level(&self) -> bool {
        !self.is_child()
    }

    /// Whether the unit finished with a passing verdict.
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Completed && self.result.as_ref().is_some_and(|r| r.success)
    }
}

/// A partial update applied atomically by the tracker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestUnitUpdate {
    pub status: Option<TestStatus>,
    pub result: Option<TestResult>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub latency_ms: Option<u64>,
    pub test_spec_id: Option<String>,
}

impl TestUnitUpdate {
    pub fn status(status: TestStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn running() -> Self {
        Self::status(TestStatus::Running)
    }

    pub fn completed(result: TestResult, latency_ms: u64) -> Self {
        Self {
            status: Some(TestStatus::Completed),
            result: Some(result),
            latency_ms: Some(latency_ms),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, latency_ms: Option<u64>) -> Self {
        Self {
            status: Some(TestStatus::Failed),
            error: Some(error.into()),
            latency_ms,
            ..Default::default()
        }
    }

    /// Fail with the error's own message, keeping its kind alongside.
    pub fn failed_with(error: &DomainError, latency_ms: Option<u64>) -> Self {
        Self {
            error_kind: Some(error.kind().to_string()),
            ..Self::failed(error.detail(), latency_ms)
        }
    }
}
