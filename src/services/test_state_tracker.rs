//! Test state tracker.
//!
//! Single source of truth for every test unit of one run session. All
//! mutations happen under one short synchronous lock that is never held
//! across an `.await`, so readers never observe a half-applied update.
//!
//! Multi-run groups consist of a hidden parent plus one visible child per
//! run. The parent's status is never set directly: when its last child
//! becomes terminal it resolves by majority vote over the children's
//! verdicts (strictly more than half must pass; ties fail).

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    ConsistencyMethod, EntityKind, TestResult, TestStatus, TestUnit, TestUnitUpdate,
};
use crate::services::consistency;

/// Per-status counts of visible units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerCounts {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TrackerCounts {
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    tests: HashMap<String, TestUnit>,
    order: Vec<String>,
    /// Per-parent similarity thresholds overriding the tracker default.
    thresholds: HashMap<String, f64>,
}

impl TrackerState {
    fn insert(&mut self, unit: TestUnit) -> DomainResult<String> {
        if self.tests.contains_key(&unit.id) {
            return Err(DomainError::DuplicateTest(unit.id));
        }
        let id = unit.id.clone();
        self.order.push(id.clone());
        self.tests.insert(id.clone(), unit);
        Ok(id)
    }
}

pub struct TestStateTracker {
    state: RwLock<TrackerState>,
    similarity_threshold: f64,
    consistency_method: ConsistencyMethod,
}

impl Default for TestStateTracker {
    fn default() -> Self {
        Self::new(0.8, ConsistencyMethod::default())
    }
}

impl TestStateTracker {
    pub fn new(similarity_threshold: f64, consistency_method: ConsistencyMethod) -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            similarity_threshold,
            consistency_method,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the hidden parent of a multi-run group.
    pub fn create_parent_test(
        &self,
        entity_name: &str,
        entity_kind: EntityKind,
        dimension: &str,
        input_index: usize,
        input: serde_json::Value,
        total_runs: u32,
    ) -> DomainResult<String> {
        let mut unit = TestUnit::new(entity_name, entity_kind, dimension, input_index, input, None);
        unit.is_parent_test = true;
        unit.is_multi_run = true;
        unit.visible_in_queue = false;
        unit.total_runs = Some(total_runs);
        unit.completed_runs = Some(0);

        let id = self.write().insert(unit)?;
        debug!(test_id = %id, total_runs, "created multi-run parent");
        Ok(id)
    }

    /// Override the similarity threshold used when `parent_id` resolves.
    pub fn set_similarity_threshold(&self, parent_id: &str, threshold: f64) {
        self.write()
            .thresholds
            .insert(parent_id.to_string(), threshold);
    }

    /// Create a unit in `queued` state.
    ///
    /// With `run_index` the unit is a run of the multi-run group for
    /// `(entity_name, dimension, input_index)`, whose parent must exist.
    pub fn create_test(
        &self,
        entity_name: &str,
        entity_kind: EntityKind,
        dimension: &str,
        input_index: usize,
        input: serde_json::Value,
        run_index: Option<u32>,
    ) -> DomainResult<String> {
        let mut unit = TestUnit::new(entity_name, entity_kind, dimension, input_index, input, run_index);
        let mut state = self.write();

        if run_index.is_some() {
            let parent_id = TestUnit::make_id(entity_kind, entity_name, dimension, input_index, None);
            match state.tests.get(&parent_id) {
                Some(parent) if parent.is_parent_test => {
                    unit.parent_id = Some(parent_id);
                }
                _ => {
                    error!(parent_id = %parent_id, "run created without a multi-run parent");
                    return Err(DomainError::TestNotFound(parent_id));
                }
            }
        }

        state.insert(unit)
    }

    /// Apply a partial update atomically.
    ///
    /// Returns the parent unit when this update was the one that resolved it.
    pub fn update_test(&self, id: &str, update: TestUnitUpdate) -> DomainResult<Option<TestUnit>> {
        let mut state = self.write();

        let Some(unit) = state.tests.get_mut(id) else {
            error!(test_id = %id, "update for unknown test; runner and tracker are out of sync");
            return Err(DomainError::TestNotFound(id.to_string()));
        };

        let was_terminal = unit.status.is_terminal();
        if let Some(status) = update.status {
            if unit.is_parent_test {
                return Err(DomainError::ParentStatusImmutable(id.to_string()));
            }
            if status != unit.status {
                if !unit.status.can_transition_to(status) {
                    error!(test_id = %id, from = %unit.status, to = %status, "invalid transition");
                    return Err(DomainError::InvalidStateTransition {
                        id: id.to_string(),
                        from: unit.status.to_string(),
                        to: status.to_string(),
                    });
                }
                unit.status = status;
                match status {
                    TestStatus::Running => unit.started_at = Some(Utc::now()),
                    TestStatus::Completed | TestStatus::Failed => unit.completed_at = Some(Utc::now()),
                    TestStatus::Queued => {}
                }
            }
        }
        if let Some(result) = update.result {
            unit.result = Some(result);
        }
        if let Some(err) = update.error {
            unit.error = Some(err);
        }
        if let Some(kind) = update.error_kind {
            unit.error_kind = Some(kind);
        }
        if let Some(latency) = update.latency_ms {
            unit.latency_ms = Some(latency);
        }
        if let Some(spec_id) = update.test_spec_id {
            unit.test_spec_id = Some(spec_id);
        }

        let became_terminal = !was_terminal && unit.status.is_terminal();
        let parent_id = unit.parent_id.clone();

        match parent_id {
            Some(parent_id) if became_terminal => self.record_child_terminal(&mut state, &parent_id),
            _ => Ok(None),
        }
    }

    fn record_child_terminal(
        &self,
        state: &mut TrackerState,
        parent_id: &str,
    ) -> DomainResult<Option<TestUnit>> {
        let (completed_runs, total_runs) = {
            let Some(parent) = state.tests.get_mut(parent_id) else {
                error!(parent_id = %parent_id, "child references missing parent");
                return Err(DomainError::TestNotFound(parent_id.to_string()));
            };
            let total = parent.total_runs.unwrap_or(0);
            let completed = (parent.completed_runs.unwrap_or(0) + 1).min(total);
            parent.completed_runs = Some(completed);
            (completed, total)
        };

        if completed_runs < total_runs {
            return Ok(None);
        }

        let threshold = state
            .thresholds
            .get(parent_id)
            .copied()
            .unwrap_or(self.similarity_threshold);
        let mut children: Vec<&TestUnit> = state
            .tests
            .values()
            .filter(|t| t.parent_id.as_deref() == Some(parent_id))
            .collect();
        children.sort_by_key(|t| t.run_index);

        let resolution = resolve_parent(&children, total_runs, threshold, self.consistency_method);

        let Some(parent) = state.tests.get_mut(parent_id) else {
            return Err(DomainError::TestNotFound(parent_id.to_string()));
        };
        parent.status = resolution.status;
        parent.started_at = resolution.started_at;
        parent.completed_at = Some(Utc::now());
        parent.latency_ms = resolution.latency_ms;
        parent.error = resolution.error;
        parent.result = Some(resolution.result);

        info!(
            test_id = %parent_id,
            status = %parent.status,
            passed_runs = parent.result.as_ref().and_then(|r| r.passed_runs).unwrap_or(0),
            total_runs,
            "multi-run test resolved"
        );
        Ok(Some(parent.clone()))
    }

    pub fn get_test(&self, id: &str) -> Option<TestUnit> {
        self.read().tests.get(id).cloned()
    }

    /// Every unit, in creation order.
    pub fn get_all_tests(&self) -> Vec<TestUnit> {
        let state = self.read();
        state
            .order
            .iter()
            .filter_map(|id| state.tests.get(id).cloned())
            .collect()
    }

    /// Units shown in the live queue (parents hidden).
    pub fn visible_tests(&self) -> Vec<TestUnit> {
        self.get_all_tests()
            .into_iter()
            .filter(|t| t.visible_in_queue)
            .collect()
    }

    pub fn counts(&self) -> TrackerCounts {
        let state = self.read();
        let mut counts = TrackerCounts::default();
        for unit in state.tests.values().filter(|t| t.visible_in_queue) {
            counts.total += 1;
            match unit.status {
                TestStatus::Queued => counts.queued += 1,
                TestStatus::Running => counts.running += 1,
                TestStatus::Completed => counts.completed += 1,
                TestStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Whether every unit (parents included) is terminal.
    pub fn is_finished(&self) -> bool {
        self.read().tests.values().all(|t| t.status.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.read().tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.write();
        state.tests.clear();
        state.order.clear();
        state.thresholds.clear();
    }
}

struct ParentResolution {
    status: TestStatus,
    result: TestResult,
    error: Option<String>,
    latency_ms: Option<u64>,
    started_at: Option<chrono::DateTime<Utc>>,
}

/// Majority vote plus consistency over the outputs of the runs. Pure in the
/// set of children, so completion order does not matter.
fn resolve_parent(
    children: &[&TestUnit],
    total_runs: u32,
    similarity_threshold: f64,
    method: ConsistencyMethod,
) -> ParentResolution {
    let passed_runs = children.iter().filter(|c| c.passed()).count() as u32;
    let success = passed_runs * 2 > total_runs;

    let outputs: Vec<serde_json::Value> = children
        .iter()
        .filter_map(|c| c.result.as_ref().and_then(|r| r.output.clone()))
        .collect();
    let consistency = (!outputs.is_empty())
        .then(|| consistency::assess(&outputs, similarity_threshold, method));

    let latencies: Vec<u64> = children.iter().filter_map(|c| c.latency_ms).collect();
    let latency_ms = (!latencies.is_empty())
        .then(|| latencies.iter().sum::<u64>() / latencies.len() as u64);

    let errored: Vec<&str> = children
        .iter()
        .filter(|c| c.status == TestStatus::Failed)
        .filter_map(|c| c.error.as_deref())
        .collect();
    let error = if success {
        None
    } else if errored.len() == children.len() && !errored.is_empty() {
        Some(format!("all {total_runs} runs failed: {}", errored[0]))
    } else {
        Some(format!("{passed_runs}/{total_runs} runs passed"))
    };

    let score = if total_runs == 0 {
        0.0
    } else {
        f64::from(passed_runs) / f64::from(total_runs)
    };

    ParentResolution {
        status: if success {
            TestStatus::Completed
        } else {
            TestStatus::Failed
        },
        result: TestResult {
            success,
            score,
            output: None,
            criteria: Vec::new(),
            consistency,
            attempts: children
                .iter()
                .filter_map(|c| c.result.as_ref().map(|r| r.attempts))
                .sum(),
            passed_runs: Some(passed_runs),
            total_runs: Some(total_runs),
        },
        error,
        latency_ms,
        started_at: children.iter().filter_map(|c| c.started_at).min(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn passing(output: serde_json::Value) -> TestUnitUpdate {
        TestUnitUpdate::completed(
            TestResult {
                success: true,
                score: 1.0,
                output: Some(output),
                attempts: 1,
                ..Default::default()
            },
            10,
        )
    }

    fn not_passing(output: serde_json::Value) -> TestUnitUpdate {
        TestUnitUpdate::completed(
            TestResult {
                success: false,
                score: 0.0,
                output: Some(output),
                attempts: 1,
                ..Default::default()
            },
            10,
        )
    }

    fn multi_run(tracker: &TestStateTracker, runs: u32) -> (String, Vec<String>) {
        let parent = tracker
            .create_parent_test("RouterAgent", EntityKind::Agent, "consistency", 0, json!("classify"), runs)
            .unwrap();
        let children = (0..runs)
            .map(|r| {
                tracker
                    .create_test("RouterAgent", EntityKind::Agent, "consistency", 0, json!("classify"), Some(r))
                    .unwrap()
            })
            .collect();
        (parent, children)
    }

    #[test]
    fn test_create_single_test_is_queued_and_visible() {
        let tracker = TestStateTracker::default();
        let id = tracker
            .create_test("A", EntityKind::Agent, "safety", 0, json!("hi"), None)
            .unwrap();
        let unit = tracker.get_test(&id).unwrap();
        assert_eq!(unit.status, TestStatus::Queued);
        assert!(unit.visible_in_queue);
        assert!(!unit.is_parent_test);
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let tracker = TestStateTracker::default();
        tracker.create_test("A", EntityKind::Agent, "safety", 0, json!("hi"), None).unwrap();
        let err = tracker
            .create_test("A", EntityKind::Agent, "safety", 0, json!("hi"), None)
            .unwrap_err();
        assert!(matches!(err, DomainError::DuplicateTest(_)));
    }

    #[test]
    fn test_same_name_different_kind_does_not_collide() {
        let tracker = TestStateTracker::default();
        let agent = tracker.create_test("Router", EntityKind::Agent, "safety", 0, json!("hi"), None).unwrap();
        let team = tracker.create_test("Router", EntityKind::Team, "safety", 0, json!("hi"), None).unwrap();
        assert_ne!(agent, team);
        assert_eq!(tracker.get_all_tests().len(), 2);
    }

    #[test]
    fn test_child_requires_parent() {
        let tracker = TestStateTracker::default();
        let err = tracker
            .create_test("A", EntityKind::Agent, "consistency", 0, json!("hi"), Some(0))
            .unwrap_err();
        assert!(matches!(err, DomainError::TestNotFound(_)));
    }

    #[test]
    fn test_unknown_id_is_desync_error() {
        let tracker = TestStateTracker::default();
        let err = tracker.update_test("ghost", TestUnitUpdate::running()).unwrap_err();
        assert!(matches!(err, DomainError::TestNotFound(_)));
        assert!(err.is_desync());
    }

    #[test]
    fn test_lifecycle_is_strictly_ordered() {
        let tracker = TestStateTracker::default();
        let id = tracker.create_test("A", EntityKind::Agent, "safety", 0, json!("x"), None).unwrap();

        let err = tracker.update_test(&id, passing(json!("y"))).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));

        tracker.update_test(&id, TestUnitUpdate::running()).unwrap();
        assert!(tracker.get_test(&id).unwrap().started_at.is_some());
        tracker.update_test(&id, passing(json!("y"))).unwrap();

        let unit = tracker.get_test(&id).unwrap();
        assert_eq!(unit.status, TestStatus::Completed);
        assert_eq!(unit.latency_ms, Some(10));
        assert!(unit.completed_at.is_some());

        let err = tracker.update_test(&id, TestUnitUpdate::running()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_queued_unit_can_fail_without_running() {
        let tracker = TestStateTracker::default();
        let id = tracker.create_test("A", EntityKind::Agent, "safety", 0, json!("x"), None).unwrap();
        tracker
            .update_test(&id, TestUnitUpdate::failed("dimension not found", None))
            .unwrap();
        assert_eq!(tracker.get_test(&id).unwrap().status, TestStatus::Failed);
    }

    #[test]
    fn test_parent_status_cannot_be_set() {
        let tracker = TestStateTracker::default();
        let (parent, _) = multi_run(&tracker, 2);
        let err = tracker.update_test(&parent, TestUnitUpdate::running()).unwrap_err();
        assert!(matches!(err, DomainError::ParentStatusImmutable(_)));
    }

    #[test]
    fn test_parent_hidden_and_counts_runs() {
        let tracker = TestStateTracker::default();
        let (parent, children) = multi_run(&tracker, 3);

        let unit = tracker.get_test(&parent).unwrap();
        assert!(!unit.visible_in_queue);
        assert_eq!(unit.total_runs, Some(3));
        assert_eq!(unit.completed_runs, Some(0));
        assert_eq!(tracker.visible_tests().len(), 3);

        tracker.update_test(&children[0], TestUnitUpdate::running()).unwrap();
        let resolved = tracker.update_test(&children[0], passing(json!("a"))).unwrap();
        assert!(resolved.is_none());
        assert_eq!(tracker.get_test(&parent).unwrap().completed_runs, Some(1));
        assert_eq!(tracker.get_test(&parent).unwrap().status, TestStatus::Queued);
    }

    #[test]
    fn test_majority_of_three_completes_parent_but_flags_inconsistency() {
        let tracker = TestStateTracker::new(0.8, ConsistencyMethod::Uniqueness);
        let (parent, children) = multi_run(&tracker, 3);
        let outputs = [
            json!({"category": "billing"}),
            json!({"category": "billing"}),
            json!({"category": "technical"}),
        ];

        // Finish out of order; aggregation must not care.
        for i in [2usize, 0, 1] {
            tracker.update_test(&children[i], TestUnitUpdate::running()).unwrap();
            let update = if i == 2 {
                not_passing(outputs[i].clone())
            } else {
                passing(outputs[i].clone())
            };
            tracker.update_test(&children[i], update).unwrap();
        }

        let unit = tracker.get_test(&parent).unwrap();
        assert_eq!(unit.status, TestStatus::Completed);
        assert_eq!(unit.completed_runs, Some(3));
        let result = unit.result.unwrap();
        assert!(result.success);
        assert_eq!(result.passed_runs, Some(2));
        let consistency = result.consistency.unwrap();
        assert!((consistency.uniqueness_similarity - 0.5).abs() < 1e-9);
        assert!(!consistency.consistent);
    }

    #[test]
    fn test_tie_resolves_to_failed() {
        let tracker = TestStateTracker::default();
        let (parent, children) = multi_run(&tracker, 4);
        for (i, child) in children.iter().enumerate() {
            tracker.update_test(child, TestUnitUpdate::running()).unwrap();
            let update = if i < 2 { passing(json!("x")) } else { not_passing(json!("x")) };
            tracker.update_test(child, update).unwrap();
        }
        let unit = tracker.get_test(&parent).unwrap();
        assert_eq!(unit.status, TestStatus::Failed);
        assert_eq!(unit.error.as_deref(), Some("2/4 runs passed"));
    }

    #[test]
    fn test_errored_runs_count_against_majority() {
        let tracker = TestStateTracker::default();
        let (parent, children) = multi_run(&tracker, 3);
        for child in &children {
            tracker.update_test(child, TestUnitUpdate::running()).unwrap();
            tracker
                .update_test(child, TestUnitUpdate::failed("timeout", Some(5)))
                .unwrap();
        }
        let unit = tracker.get_test(&parent).unwrap();
        assert_eq!(unit.status, TestStatus::Failed);
        assert_eq!(unit.error.as_deref(), Some("all 3 runs failed: timeout"));
        assert!(unit.result.unwrap().consistency.is_none());
    }

    #[test]
    fn test_per_parent_threshold_override() {
        let tracker = TestStateTracker::new(0.8, ConsistencyMethod::Uniqueness);
        let (parent, children) = multi_run(&tracker, 3);
        tracker.set_similarity_threshold(&parent, 0.5);
        for (i, child) in children.iter().enumerate() {
            tracker.update_test(child, TestUnitUpdate::running()).unwrap();
            let output = if i == 2 { json!("technical") } else { json!("billing") };
            tracker.update_test(child, passing(output)).unwrap();
        }
        let consistency = tracker.get_test(&parent).unwrap().result.unwrap().consistency.unwrap();
        assert!((consistency.threshold - 0.5).abs() < f64::EPSILON);
        assert!(consistency.consistent);
    }

    #[test]
    fn test_counts_only_visible_units() {
        let tracker = TestStateTracker::default();
        multi_run(&tracker, 2);
        tracker.create_test("B", EntityKind::Team, "safety", 0, json!("x"), None).unwrap();
        let counts = tracker.counts();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.queued, 3);
        assert!(!tracker.is_finished());
    }
}
