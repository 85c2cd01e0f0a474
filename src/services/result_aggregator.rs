//! Folds terminal test units into summaries and records them in the eval spec.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{error, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    DimensionRunResults, EntityRef, PerformanceHistoryEntry, TestOutcomeRecord, TestRunRecord,
    TestStatus, TestUnit,
};
use crate::services::spec_store::SpecStore;

/// Final outcome of one top-level test (a single-run unit or a parent).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestOutcome {
    pub unit_id: String,
    pub entity: EntityRef,
    pub dimension: String,
    pub test_spec_id: String,
    pub passed: bool,
    /// An error prevented a verdict.
    pub errored: bool,
    pub score: f64,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub runs: Option<u32>,
    pub passed_runs: Option<u32>,
    pub consistent: Option<bool>,
    pub similarity: Option<f64>,
}

impl TestOutcome {
    fn from_unit(unit: &TestUnit) -> Self {
        let result = unit.result.as_ref();
        let consistency = result.and_then(|r| r.consistency.as_ref());
        Self {
            unit_id: unit.id.clone(),
            entity: EntityRef::new(unit.entity_kind, unit.entity_name.clone()),
            dimension: unit.dimension.clone(),
            test_spec_id: unit.test_spec_id.clone().unwrap_or_else(|| unit.id.clone()),
            passed: unit.passed(),
            errored: unit.status == TestStatus::Failed && result.is_none(),
            score: result.map_or(0.0, |r| r.score),
            latency_ms: unit.latency_ms,
            error: unit.error.clone(),
            error_kind: unit.error_kind.clone(),
            runs: unit.total_runs,
            passed_runs: result.and_then(|r| r.passed_runs),
            consistent: consistency.map(|c| c.consistent),
            similarity: consistency.map(|c| c.similarity()),
        }
    }

    fn record(&self) -> TestOutcomeRecord {
        TestOutcomeRecord {
            passed: self.passed,
            score: self.score,
            latency_ms: self.latency_ms,
            error: self.error.clone(),
            runs: self.runs,
            passed_runs: self.passed_runs,
            consistent: self.consistent,
            similarity: self.similarity,
        }
    }
}

/// Pass/fail/error tallies with a mean score.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Tally {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    /// Mean score over all tests, errors counting as zero.
    pub score: f64,
}

impl Tally {
    fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a TestOutcome>) -> Self {
        let mut tally = Self::default();
        let mut score_sum = 0.0;
        for outcome in outcomes {
            tally.total += 1;
            score_sum += outcome.score;
            if outcome.passed {
                tally.passed += 1;
            } else if outcome.errored {
                tally.errors += 1;
            } else {
                tally.failed += 1;
            }
        }
        if tally.total > 0 {
            tally.score = score_sum / tally.total as f64;
        }
        tally
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionSummary {
    pub entity: EntityRef,
    pub dimension: String,
    #[serde(flatten)]
    pub tally: Tally,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySummary {
    pub entity: EntityRef,
    #[serde(flatten)]
    pub tally: Tally,
    pub dimensions: Vec<String>,
}

/// Everything the run produced, folded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunAggregate {
    pub outcomes: Vec<TestOutcome>,
    pub dimensions: Vec<DimensionSummary>,
    pub entities: Vec<EntitySummary>,
    pub totals: Tally,
}

impl RunAggregate {
    pub fn dimension_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dimensions.iter().map(|d| d.dimension.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn entity_names(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.entity.name.clone()).collect()
    }
}

/// Fold terminal top-level units. Children are already folded into their
/// parents by the tracker and are skipped here.
pub fn aggregate(units: &[TestUnit]) -> RunAggregate {
    let outcomes: Vec<TestOutcome> = units
        .iter()
        .filter(|u| u.is_top_level())
        .filter(|u| {
            let terminal = u.status.is_terminal();
            if !terminal {
                warn!(test_id = %u.id, status = %u.status, "skipping unfinished test");
            }
            terminal
        })
        .map(TestOutcome::from_unit)
        .collect();

    let mut by_dimension: BTreeMap<(EntityRef, String), Vec<&TestOutcome>> = BTreeMap::new();
    let mut by_entity: BTreeMap<EntityRef, Vec<&TestOutcome>> = BTreeMap::new();
    for outcome in &outcomes {
        by_dimension
            .entry((outcome.entity.clone(), outcome.dimension.clone()))
            .or_default()
            .push(outcome);
        by_entity.entry(outcome.entity.clone()).or_default().push(outcome);
    }

    let dimensions = by_dimension
        .into_iter()
        .map(|((entity, dimension), items)| DimensionSummary {
            entity,
            dimension,
            tally: Tally::from_outcomes(items),
        })
        .collect();

    let entities = by_entity
        .into_iter()
        .map(|(entity, items)| {
            let mut dimensions: Vec<String> = items.iter().map(|o| o.dimension.clone()).collect();
            dimensions.sort();
            dimensions.dedup();
            EntitySummary {
                entity,
                tally: Tally::from_outcomes(items),
                dimensions,
            }
        })
        .collect();

    let totals = Tally::from_outcomes(&outcomes);
    RunAggregate {
        outcomes,
        dimensions,
        entities,
        totals,
    }
}

/// Identity of the run being recorded.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Record an aggregate in the eval spec: per-test `last_results`, one performance
/// entry per (entity, dimension) and one run record in the test history.
///
/// An entity missing from the document is a desynchronization: it is logged
/// and skipped so the rest of the run is still recorded.
pub fn apply(
    store: &mut SpecStore,
    aggregate: &RunAggregate,
    run: &RunInfo,
) -> DomainResult<TestRunRecord> {
    for summary in &aggregate.dimensions {
        let tests = aggregate
            .outcomes
            .iter()
            .filter(|o| o.entity == summary.entity && o.dimension == summary.dimension)
            .map(|o| (o.test_spec_id.clone(), o.record()))
            .collect();

        let results = DimensionRunResults {
            run_id: run.run_id.clone(),
            timestamp: run.timestamp,
            total: summary.tally.total,
            passed: summary.tally.passed,
            score: summary.tally.score,
            tests,
        };
        let entry = PerformanceHistoryEntry {
            timestamp: run.timestamp,
            dimension: summary.dimension.clone(),
            score: summary.tally.score,
            passed: summary.tally.passed == summary.tally.total,
            details: Some(json!({
                "runId": run.run_id,
                "total": summary.tally.total,
                "passed": summary.tally.passed,
                "failed": summary.tally.failed,
                "errors": summary.tally.errors,
            })),
        };

        let recorded = store
            .record_dimension_results(&summary.entity, &summary.dimension, results)
            .and_then(|()| store.record_performance(&summary.entity, entry));
        if let Err(e) = recorded {
            if e.is_desync() || matches!(e, DomainError::EntityNotFound(_)) {
                error!(entity = %summary.entity, dimension = %summary.dimension, error = %e, "cannot record results");
            } else {
                return Err(e);
            }
        }
    }

    let record = TestRunRecord {
        run_id: run.run_id.clone(),
        timestamp: run.timestamp,
        total: aggregate.totals.total,
        passed: aggregate.totals.passed,
        failed: aggregate.totals.failed,
        errors: aggregate.totals.errors,
        success_rate: aggregate.totals.success_rate(),
        duration_ms: run.duration_ms,
        entities: aggregate.entity_names(),
        dimensions: aggregate.dimension_names(),
    };
    store.record_run(record.clone());
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::storage::InMemorySpecRepository;
    use crate::domain::models::{EntityKind, TestResult};
    use serde_json::json;
    use std::sync::Arc;

    fn unit(entity: &str, dimension: &str, idx: usize, status: TestStatus, success: Option<bool>) -> TestUnit {
        let mut unit = TestUnit::new(entity, EntityKind::Agent, dimension, idx, json!("in"), None);
        unit.status = status;
        unit.test_spec_id = Some(format!("{dimension}_{idx}"));
        unit.result = success.map(|success| TestResult {
            success,
            score: if success { 1.0 } else { 0.25 },
            ..Default::default()
        });
        if status == TestStatus::Failed && success.is_none() {
            unit.error = Some("timeout".to_string());
        }
        unit
    }

    #[test]
    fn test_tallies_distinguish_failures_from_errors() {
        let units = vec![
            unit("A", "safety", 0, TestStatus::Completed, Some(true)),
            unit("A", "safety", 1, TestStatus::Completed, Some(false)),
            unit("A", "accuracy", 0, TestStatus::Failed, None),
            unit("B", "safety", 0, TestStatus::Completed, Some(true)),
        ];
        let agg = aggregate(&units);
        assert_eq!(agg.totals.total, 4);
        assert_eq!(agg.totals.passed, 2);
        assert_eq!(agg.totals.failed, 1);
        assert_eq!(agg.totals.errors, 1);
        assert_eq!(agg.dimensions.len(), 3);
        assert_eq!(agg.entities.len(), 2);

        let a_safety = agg
            .dimensions
            .iter()
            .find(|d| d.entity.name == "A" && d.dimension == "safety")
            .unwrap();
        assert!((a_safety.tally.score - 0.625).abs() < 1e-9);
        assert_eq!(agg.entities[0].dimensions, vec!["accuracy", "safety"]);
    }

    #[test]
    fn test_children_are_not_counted() {
        let mut parent = unit("A", "consistency", 0, TestStatus::Completed, Some(true));
        parent.is_parent_test = true;
        parent.total_runs = Some(2);
        let mut child = unit("A", "consistency", 0, TestStatus::Completed, Some(true));
        child.id = format!("{}:run0", parent.id);
        child.parent_id = Some(parent.id.clone());

        let agg = aggregate(&[parent, child]);
        assert_eq!(agg.totals.total, 1);
        assert_eq!(agg.outcomes[0].runs, Some(2));
    }

    #[tokio::test]
    async fn test_apply_records_results_performance_and_history() {
        let repo = Arc::new(InMemorySpecRepository::default());
        let mut store = SpecStore::load_or_create(repo, "demo").await.unwrap();
        let a = EntityRef::new(EntityKind::Agent, "A");
        store.upsert_entity(&a, "h", json!({}), None, None);

        let agg = aggregate(&[
            unit("A", "safety", 0, TestStatus::Completed, Some(true)),
            unit("A", "safety", 1, TestStatus::Completed, Some(false)),
            unit("Ghost", "safety", 0, TestStatus::Completed, Some(true)),
        ]);
        let run = RunInfo {
            run_id: "run-1".to_string(),
            timestamp: Utc::now(),
            duration_ms: 42,
        };
        let record = apply(&mut store, &agg, &run).unwrap();
        assert_eq!(record.total, 3);
        assert_eq!(record.passed, 2);
        assert_eq!(record.entities, vec!["A", "Ghost"]);

        let entity = store.entity(&a).unwrap();
        let last = entity.test_specs["safety"].last_results.as_ref().unwrap();
        assert_eq!(last.run_id, "run-1");
        assert_eq!(last.total, 2);
        assert!(last.tests["safety_0"].passed);
        assert!(!last.tests["safety_1"].passed);
        assert_eq!(entity.performance.total_runs, 1);
        assert_eq!(entity.performance.score_history.len(), 1);
        assert!(!entity.performance.score_history[0].passed);
        assert_eq!(store.spec().test_history.runs.len(), 1);
    }
}
