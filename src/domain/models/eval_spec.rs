//! The living evaluation specification document.
//!
//! An `EvalSpec` records every evaluated entity (agents, teams, flows), the
//! test specifications generated or hand-written for each dimension, the
//! latest results, and a capped performance history used for trend
//! reporting. It is persisted as camelCase JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use super::entity::{EntityKind, EntityRef};

/// Schema version written into new documents.
pub const SPEC_SCHEMA_VERSION: &str = "1.0";

/// Maximum performance entries retained per entity.
pub const MAX_PERFORMANCE_HISTORY: usize = 100;

/// Maximum run records retained in the document's test history.
pub const MAX_TEST_HISTORY: usize = 50;

/// Samples per trend window.
pub const TREND_WINDOW: usize = 10;

/// Fewer samples than this always report `stable`.
pub const TREND_MIN_SAMPLES: usize = 5;

/// Relative change between windows that counts as a trend.
pub const TREND_THRESHOLD: f64 = 0.05;

/// Root aggregate of the specification document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalSpec {
    pub version: String,
    pub project_id: String,
    #[serde(default)]
    pub agents: BTreeMap<String, EntitySpec>,
    #[serde(default)]
    pub teams: BTreeMap<String, EntitySpec>,
    #[serde(default)]
    pub flows: BTreeMap<String, EntitySpec>,
    #[serde(default)]
    pub test_history: TestHistory,
    #[serde(default)]
    pub customizations: BTreeMap<String, serde_json::Value>,
    pub metadata: SpecMetadata,
}

impl EvalSpec {
    pub fn new(project_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: SPEC_SCHEMA_VERSION.to_string(),
            project_id: project_id.into(),
            agents: BTreeMap::new(),
            teams: BTreeMap::new(),
            flows: BTreeMap::new(),
            test_history: TestHistory::default(),
            customizations: BTreeMap::new(),
            metadata: SpecMetadata {
                created_at: now,
                updated_at: now,
                last_run_at: None,
            },
        }
    }

    pub fn entities(&self, kind: EntityKind) -> &BTreeMap<String, EntitySpec> {
        match kind {
            EntityKind::Agent => &self.agents,
            EntityKind::Team => &self.teams,
            EntityKind::Flow => &self.flows,
        }
    }

    pub fn entities_mut(&mut self, kind: EntityKind) -> &mut BTreeMap<String, EntitySpec> {
        match kind {
            EntityKind::Agent => &mut self.agents,
            EntityKind::Team => &mut self.teams,
            EntityKind::Flow => &mut self.flows,
        }
    }

    pub fn entity(&self, entity: &EntityRef) -> Option<&EntitySpec> {
        self.entities(entity.kind).get(&entity.name)
    }

    pub fn entity_mut(&mut self, entity: &EntityRef) -> Option<&mut EntitySpec> {
        self.entities_mut(entity.kind).get_mut(&entity.name)
    }

    /// Entities matching a selector: a bare name selects that name under
    /// every kind, `kind:name` selects one entity.
    pub fn find_entities(&self, selector: &str) -> Vec<EntityRef> {
        self.entity_refs()
            .into_iter()
            .filter(|entity| entity.matches(selector))
            .collect()
    }

    /// All entities in a stable order: agents, teams, flows; by name within.
    pub fn entity_refs(&self) -> Vec<EntityRef> {
        EntityKind::all()
            .into_iter()
            .flat_map(|kind| {
                self.entities(kind)
                    .keys()
                    .map(move |name| EntityRef::new(kind, name.clone()))
            })
            .collect()
    }

    /// Total number of test specifications across all entities.
    pub fn test_count(&self) -> usize {
        EntityKind::all()
            .into_iter()
            .flat_map(|kind| self.entities(kind).values())
            .map(EntitySpec::test_count)
            .sum()
    }
}

/// Document-level bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Contract, discovery data, tests and performance for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySpec {
    /// Framework-specific description of the entity (role, goal, members,
    /// steps...). Opaque to the harness except for change detection.
    #[serde(default)]
    pub contract: serde_json::Value,
    pub discovered: Discovered,
    #[serde(default)]
    pub test_specs: BTreeMap<String, DimensionTests>,
    #[serde(default)]
    pub performance: PerformanceTracking,
}

impl EntitySpec {
    pub fn new(source_hash: impl Into<String>, contract: serde_json::Value) -> Self {
        Self {
            contract,
            discovered: Discovered::new(source_hash),
            test_specs: BTreeMap::new(),
            performance: PerformanceTracking::default(),
        }
    }

    pub fn test_count(&self) -> usize {
        self.test_specs.values().map(|d| d.tests.len()).sum()
    }

    /// SHA-256 of the contract serialized as canonical (sorted-key) JSON.
    pub fn structural_hash(&self) -> String {
        structural_hash(&self.contract)
    }

    /// The hash used for change detection of this entity kind: the
    /// discovered source hash for agents, the structural hash otherwise.
    pub fn change_hash(&self, kind: EntityKind) -> String {
        match kind {
            EntityKind::Agent => self.discovered.source_hash.clone(),
            EntityKind::Team | EntityKind::Flow => self.structural_hash(),
        }
    }
}

/// Discovery metadata; `version` is a change counter bumped on hash change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovered {
    pub source_hash: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Discovered {
    pub fn new(source_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            source_hash: source_hash.into(),
            version: 1,
            path: None,
            framework: None,
            discovered_at: now,
            last_modified: now,
        }
    }
}

/// Test specifications and latest results for one dimension of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DimensionTests {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_by: Option<String>,
    #[serde(default)]
    pub tests: Vec<TestSpecification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_results: Option<DimensionRunResults>,
}

/// Declarative definition of one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSpecification {
    pub id: String,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<serde_json::Value>,
    #[serde(default, rename = "evaluation_criteria", alias = "evaluationCriteria")]
    pub evaluation_criteria: Vec<EvaluationCriterion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<Thresholds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_run: Option<MultiRunConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic_inputs: Option<Vec<serde_json::Value>>,
    #[serde(default = "default_test_priority")]
    pub priority: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub user_modified: bool,
    #[serde(default = "default_generated_by")]
    pub generated_by: String,
    #[serde(default = "Utc::now")]
    pub generated_at: DateTime<Utc>,
}

const fn default_test_priority() -> u32 {
    1
}

fn default_generated_by() -> String {
    "user".to_string()
}

impl TestSpecification {
    pub fn new(id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            input,
            expected: None,
            evaluation_criteria: Vec::new(),
            thresholds: None,
            multi_run: None,
            synthetic_inputs: None,
            priority: default_test_priority(),
            tags: Vec::new(),
            user_modified: false,
            generated_by: default_generated_by(),
            generated_at: Utc::now(),
        }
    }

    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.evaluation_criteria.push(EvaluationCriterion::new(criterion));
        self
    }

    pub fn with_expected(mut self, expected: serde_json::Value) -> Self {
        self.expected = Some(expected);
        self
    }

    pub fn with_runs(mut self, run_count: u32) -> Self {
        self.multi_run = Some(MultiRunConfig {
            enabled: true,
            run_count,
        });
        self
    }

    pub fn user_modified(mut self) -> Self {
        self.user_modified = true;
        self
    }

    /// Explicit run count requested by this test, if multi-run is enabled.
    pub fn requested_runs(&self) -> Option<u32> {
        self.multi_run
            .as_ref()
            .filter(|m| m.enabled && m.run_count > 0)
            .map(|m| m.run_count)
    }
}

/// One criterion the judge decides on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationCriterion {
    pub criterion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_strictness: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
}

impl EvaluationCriterion {
    pub fn new(criterion: impl Into<String>) -> Self {
        Self {
            criterion: criterion.into(),
            evaluation_strictness: None,
            special_instructions: None,
        }
    }

    pub fn with_strictness(mut self, strictness: u8) -> Self {
        self.evaluation_strictness = Some(strictness);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Thresholds {
    /// Percentage of criteria that must be met, in [0, 100].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passing_criteria_percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiRunConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub run_count: u32,
}

const fn default_true() -> bool {
    true
}

/// Results of the latest run of one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionRunResults {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub score: f64,
    #[serde(default)]
    pub tests: BTreeMap<String, TestOutcomeRecord>,
}

/// Recorded outcome of one test specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcomeRecord {
    pub passed: bool,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed_runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

/// Direction of an entity's recent scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Degrading,
    #[default]
    Stable,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Improving => "improving",
            Self::Degrading => "degrading",
            Self::Stable => "stable",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub dimension: String,
    pub score: f64,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PerformanceTrends {
    #[serde(default)]
    pub overall: Trend,
    #[serde(default)]
    pub dimensions: BTreeMap<String, Trend>,
}

/// Performance-tracking block of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceTracking {
    #[serde(default)]
    pub total_runs: u64,
    #[serde(default)]
    pub average_score: f64,
    #[serde(default)]
    pub score_history: Vec<PerformanceHistoryEntry>,
    #[serde(default)]
    pub trends: PerformanceTrends,
}

impl PerformanceTracking {
    /// Append an entry, evict beyond the cap, and recompute the average and
    /// trends over what is retained.
    pub fn record(&mut self, entry: PerformanceHistoryEntry) {
        self.score_history.push(entry);
        if self.score_history.len() > MAX_PERFORMANCE_HISTORY {
            let excess = self.score_history.len() - MAX_PERFORMANCE_HISTORY;
            self.score_history.drain(..excess);
        }

        let scores: Vec<f64> = self.score_history.iter().map(|e| e.score).collect();
        self.average_score = mean(&scores);
        self.trends.overall = compute_trend(&scores);

        let mut by_dimension: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for e in &self.score_history {
            by_dimension.entry(e.dimension.clone()).or_default().push(e.score);
        }
        self.trends.dimensions = by_dimension
            .into_iter()
            .map(|(dimension, scores)| (dimension, compute_trend(&scores)))
            .collect();
    }
}

/// Trend of a chronological score series.
///
/// Compares the mean of the most recent `TREND_WINDOW` scores with the mean of
/// the window before it. Series shorter than `TREND_MIN_SAMPLES`, or with no
/// previous window, are `stable`.
pub fn compute_trend(scores: &[f64]) -> Trend {
    if scores.len() < TREND_MIN_SAMPLES {
        return Trend::Stable;
    }

    let recent_start = scores.len().saturating_sub(TREND_WINDOW);
    let previous_start = recent_start.saturating_sub(TREND_WINDOW);
    let recent = &scores[recent_start..];
    let previous = &scores[previous_start..recent_start];
    if previous.is_empty() {
        return Trend::Stable;
    }

    let recent_mean = mean(recent);
    let previous_mean = mean(previous);
    let change = if previous_mean.abs() < f64::EPSILON {
        if recent_mean > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        (recent_mean - previous_mean) / previous_mean
    };

    if change > TREND_THRESHOLD {
        Trend::Improving
    } else if change < -TREND_THRESHOLD {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Run records of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TestHistory {
    #[serde(default)]
    pub runs: Vec<TestRunRecord>,
}

impl TestHistory {
    pub fn push(&mut self, record: TestRunRecord) {
        self.runs.push(record);
        if self.runs.len() > MAX_TEST_HISTORY {
            let excess = self.runs.len() - MAX_TEST_HISTORY;
            self.runs.drain(..excess);
        }
    }

    pub fn latest(&self) -> Option<&TestRunRecord> {
        self.runs.last()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunRecord {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub success_rate: f64,
    pub duration_ms: u64,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
}

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn write(value: &serde_json::Value, out: &mut String) {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                    out.push(':');
                    write(&map[key.as_str()], out);
                }
                out.push('}');
            }
            serde_json::Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            scalar => out.push_str(&scalar.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Hex SHA-256 of the canonical JSON form of `value`.
pub fn structural_hash(value: &serde_json::Value) -> String {
    let digest = Sha256::digest(canonical_json(value).as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(score: f64) -> PerformanceHistoryEntry {
        PerformanceHistoryEntry {
            timestamp: Utc::now(),
            dimension: "accuracy".to_string(),
            score,
            passed: score >= 0.5,
            details: None,
        }
    }

    #[test]
    fn test_trend_requires_minimum_samples() {
        assert_eq!(compute_trend(&[0.1, 0.9, 0.9, 0.9]), Trend::Stable);
    }

    #[test]
    fn test_trend_without_previous_window_is_stable() {
        assert_eq!(compute_trend(&[0.1, 0.2, 0.3, 0.9, 1.0]), Trend::Stable);
    }

    #[test]
    fn test_trend_detects_improvement_and_degradation() {
        let mut improving = vec![0.5; 10];
        improving.extend(vec![0.8; 10]);
        assert_eq!(compute_trend(&improving), Trend::Improving);

        let mut degrading = vec![0.8; 10];
        degrading.extend(vec![0.5; 10]);
        assert_eq!(compute_trend(&degrading), Trend::Degrading);
    }

    #[test]
    fn test_trend_within_threshold_is_stable() {
        let mut scores = vec![0.80; 10];
        scores.extend(vec![0.82; 10]);
        assert_eq!(compute_trend(&scores), Trend::Stable);
    }

    #[test]
    fn test_trend_compares_most_recent_windows_only() {
        let mut scores = vec![0.1; 30];
        scores.extend(vec![0.9; 20]);
        // The two most recent windows are both 0.9.
        assert_eq!(compute_trend(&scores), Trend::Stable);
    }

    #[test]
    fn test_record_caps_history_and_recomputes_average() {
        let mut perf = PerformanceTracking::default();
        for _ in 0..MAX_PERFORMANCE_HISTORY {
            perf.record(entry(0.0));
        }
        for _ in 0..10 {
            perf.record(entry(1.0));
        }
        assert_eq!(perf.score_history.len(), MAX_PERFORMANCE_HISTORY);
        assert!((perf.average_score - 0.1).abs() < 1e-9);
        assert_eq!(perf.trends.overall, Trend::Improving);
        assert_eq!(perf.trends.dimensions.get("accuracy"), Some(&Trend::Improving));
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"d": [1, {"z": 1, "y": 2}], "c": "x"}});
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"c":"x","d":[1,{"y":2,"z":1}]},"b":1}"#
        );
    }

    #[test]
    fn test_structural_hash_ignores_key_order() {
        let a = json!({"members": ["a", "b"], "process": "sequential"});
        let b = json!({"process": "sequential", "members": ["a", "b"]});
        let c = json!({"process": "hierarchical", "members": ["a", "b"]});
        assert_eq!(structural_hash(&a), structural_hash(&b));
        assert_ne!(structural_hash(&a), structural_hash(&c));
        assert_eq!(structural_hash(&a).len(), 64);
    }

    #[test]
    fn test_spec_json_uses_camel_case_and_snake_criteria() {
        let mut spec = EvalSpec::new("demo");
        let mut entity = EntitySpec::new("abc", json!({"role": "router"}));
        entity.test_specs.insert(
            "safety".to_string(),
            DimensionTests {
                tests: vec![TestSpecification::new("t1", json!("hi")).with_criterion("is polite")],
                ..Default::default()
            },
        );
        spec.agents.insert("RouterAgent".to_string(), entity);

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["projectId"], "demo");
        let test = &value["agents"]["RouterAgent"]["testSpecs"]["safety"]["tests"][0];
        assert_eq!(test["evaluation_criteria"][0]["criterion"], "is polite");
        assert_eq!(test["userModified"], false);
        assert_eq!(value["agents"]["RouterAgent"]["discovered"]["sourceHash"], "abc");

        let back: EvalSpec = serde_json::from_value(value).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_find_entities_and_refs() {
        let mut spec = EvalSpec::new("demo");
        spec.agents.insert("A".into(), EntitySpec::new("h", json!({})));
        spec.teams.insert("Crew".into(), EntitySpec::new("h", json!({})));
        spec.flows.insert("A".into(), EntitySpec::new("h", json!({})));
        assert_eq!(spec.find_entities("Crew"), vec![EntityRef::new(EntityKind::Team, "Crew")]);
        assert_eq!(
            spec.find_entities("A"),
            vec![EntityRef::new(EntityKind::Agent, "A"), EntityRef::new(EntityKind::Flow, "A")]
        );
        assert_eq!(spec.find_entities("flow:A"), vec![EntityRef::new(EntityKind::Flow, "A")]);
        assert!(spec.find_entities("missing").is_empty());
        assert_eq!(spec.entity_refs().len(), 3);
    }

    #[test]
    fn test_history_is_capped() {
        let mut history = TestHistory::default();
        for i in 0..(MAX_TEST_HISTORY + 5) {
            history.push(TestRunRecord {
                run_id: i.to_string(),
                timestamp: Utc::now(),
                total: 1,
                passed: 1,
                failed: 0,
                errors: 0,
                success_rate: 1.0,
                duration_ms: 1,
                entities: vec![],
                dimensions: vec![],
            });
        }
        assert_eq!(history.runs.len(), MAX_TEST_HISTORY);
        assert_eq!(history.runs[0].run_id, "5");
    }
}
