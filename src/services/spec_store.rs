//! Specification store: owner of the living `EvalSpec` document.
//!
//! All mutations go through the methods here. Persistence happens only at
//! explicit checkpoints (`save`), where entity change hashes are compared
//! with the last persisted state. A changed hash is the only thing that
//! bumps `discovered.version` and produces a snapshot.

use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    DimensionRunResults, DimensionTests, EntityRef, EntitySpec, EvalSpec,
    PerformanceHistoryEntry, TestRunRecord, TestSpecification,
};
use crate::domain::ports::{SnapshotInfo, SpecRepository};

/// Merge regenerated tests into an existing list without losing user edits.
///
/// User-modified tests from `existing` are kept verbatim in their original
/// order. Incoming tests whose id is not among the kept ones follow in
/// incoming order; repeated incoming ids keep their first occurrence.
/// Generated tests of `existing` that are not regenerated are dropped.
pub fn merge_tests(
    existing: &[TestSpecification],
    incoming: &[TestSpecification],
) -> Vec<TestSpecification> {
    let mut merged: Vec<TestSpecification> = existing
        .iter()
        .filter(|t| t.user_modified)
        .cloned()
        .collect();
    let mut seen: HashSet<String> = merged.iter().map(|t| t.id.clone()).collect();

    for test in incoming {
        if seen.insert(test.id.clone()) {
            merged.push(test.clone());
        }
    }
    merged
}

/// What a `save` did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveOutcome {
    /// Entities (as `kind:name`) whose change hash differed from the last
    /// persisted state.
    pub changed_entities: Vec<String>,
    pub snapshot: Option<SnapshotInfo>,
    pub pruned_snapshots: usize,
}

impl SaveOutcome {
    pub fn changed(&self) -> bool {
        !self.changed_entities.is_empty()
    }
}

pub struct SpecStore {
    repository: Arc<dyn SpecRepository>,
    spec: EvalSpec,
    /// Change hash per entity as of the last load or save.
    persisted_hashes: HashMap<EntityRef, String>,
}

impl SpecStore {
    /// Load the document, or start a new one for `project_id` if none exists.
    #[instrument(skip(repository))]
    pub async fn load_or_create(
        repository: Arc<dyn SpecRepository>,
        project_id: &str,
    ) -> DomainResult<Self> {
        let (spec, persisted_hashes) = match repository.load().await? {
            Some(spec) => {
                let hashes = change_hashes(&spec);
                debug!(entities = hashes.len(), tests = spec.test_count(), "loaded eval spec");
                (spec, hashes)
            }
            None => {
                info!(project_id, "no eval spec found, starting a new one");
                (EvalSpec::new(project_id), HashMap::new())
            }
        };

        Ok(Self {
            repository,
            spec,
            persisted_hashes,
        })
    }

    pub fn spec(&self) -> &EvalSpec {
        &self.spec
    }

    pub fn entity(&self, entity: &EntityRef) -> DomainResult<&EntitySpec> {
        self.spec
            .entity(entity)
            .ok_or_else(|| DomainError::EntityNotFound(entity.to_string()))
    }

    fn entity_mut(&mut self, entity: &EntityRef) -> DomainResult<&mut EntitySpec> {
        self.spec
            .entity_mut(entity)
            .ok_or_else(|| DomainError::EntityNotFound(entity.to_string()))
    }

    /// Record (re)discovery of an entity. Returns whether anything changed.
    ///
    /// The version counter is not touched here; `save` bumps it when the
    /// change hash differs from the persisted one.
    pub fn upsert_entity(
        &mut self,
        entity: &EntityRef,
        source_hash: &str,
        contract: Value,
        path: Option<String>,
        framework: Option<String>,
    ) -> bool {
        let entities = self.spec.entities_mut(entity.kind);
        match entities.get_mut(&entity.name) {
            Some(existing) => {
                let changed = existing.discovered.source_hash != source_hash
                    || existing.contract != contract;
                existing.discovered.source_hash = source_hash.to_string();
                existing.contract = contract;
                if path.is_some() {
                    existing.discovered.path = path;
                }
                if framework.is_some() {
                    existing.discovered.framework = framework;
                }
                changed
            }
            None => {
                let mut spec = EntitySpec::new(source_hash, contract);
                spec.discovered.path = path;
                spec.discovered.framework = framework;
                entities.insert(entity.name.clone(), spec);
                true
            }
        }
    }

    /// Merge `incoming` into the tests of one dimension via [`merge_tests`].
    /// Returns the number of tests after merging.
    pub fn merge_dimension_tests(
        &mut self,
        entity: &EntityRef,
        dimension: &str,
        incoming: &[TestSpecification],
        generated_by: &str,
    ) -> DomainResult<usize> {
        let spec = self.entity_mut(entity)?;
        let tests = spec.test_specs.entry(dimension.to_string()).or_default();
        tests.tests = merge_tests(&tests.tests, incoming);
        tests.generated_at = Some(Utc::now());
        tests.generated_by = Some(generated_by.to_string());
        debug!(entity = %entity, dimension, count = tests.tests.len(), "merged dimension tests");
        Ok(tests.tests.len())
    }

    /// Tests of one dimension of an entity; empty when none are defined.
    pub fn dimension_tests(&self, entity: &EntityRef, dimension: &str) -> Vec<TestSpecification> {
        self.spec
            .entity(entity)
            .and_then(|e| e.test_specs.get(dimension))
            .map(|d| d.tests.clone())
            .unwrap_or_default()
    }

    pub fn record_dimension_results(
        &mut self,
        entity: &EntityRef,
        dimension: &str,
        results: DimensionRunResults,
    ) -> DomainResult<()> {
        let spec = self.entity_mut(entity)?;
        let tests: &mut DimensionTests = spec.test_specs.entry(dimension.to_string()).or_default();
        tests.last_results = Some(results);
        Ok(())
    }

    /// Append a performance entry and count one more run for the entity.
    pub fn record_performance(
        &mut self,
        entity: &EntityRef,
        entry: PerformanceHistoryEntry,
    ) -> DomainResult<()> {
        let spec = self.entity_mut(entity)?;
        spec.performance.total_runs += 1;
        spec.performance.record(entry);
        Ok(())
    }

    pub fn record_run(&mut self, record: TestRunRecord) {
        self.spec.metadata.last_run_at = Some(record.timestamp);
        self.spec.test_history.push(record);
    }

    /// Entities whose change hash differs from the last persisted state.
    pub fn pending_changes(&self) -> Vec<EntityRef> {
        change_hashes(&self.spec)
            .into_iter()
            .filter(|(entity, hash)| self.persisted_hashes.get(entity) != Some(hash))
            .map(|(entity, _)| entity)
            .collect()
    }

    /// Persist the document.
    ///
    /// Entities whose change hash moved since the last persisted state get
    /// `discovered.version` bumped (newly added entities keep version 1).
    /// When anything changed, a snapshot is created and retention applied.
    #[instrument(skip(self))]
    pub async fn save(&mut self) -> DomainResult<SaveOutcome> {
        let mut changed = self.pending_changes();
        changed.sort();

        let now = Utc::now();
        for entity in &changed {
            let was_persisted = self.persisted_hashes.contains_key(entity);
            if let Some(spec) = self.spec.entity_mut(entity) {
                if was_persisted {
                    spec.discovered.version += 1;
                }
                spec.discovered.last_modified = now;
            }
        }
        self.spec.metadata.updated_at = now;

        self.repository.save(&self.spec).await?;

        let changed_entities: Vec<String> = changed.iter().map(ToString::to_string).collect();
        let mut outcome = SaveOutcome {
            changed_entities: changed_entities.clone(),
            ..Default::default()
        };

        if !changed.is_empty() {
            let snapshot = self
                .repository
                .create_snapshot(&self.spec, &changed_entities)
                .await?;
            info!(snapshot = %snapshot.id, changed = changed.len(), "created spec snapshot");
            outcome.snapshot = Some(snapshot);

            match self.repository.prune_snapshots().await {
                Ok(pruned) => outcome.pruned_snapshots = pruned,
                Err(e) => warn!(error = %e, "snapshot pruning failed"),
            }
        } else {
            debug!("no entity changes; snapshot skipped");
        }

        self.persisted_hashes = change_hashes(&self.spec);
        Ok(outcome)
    }

    pub async fn snapshots(&self) -> DomainResult<Vec<SnapshotInfo>> {
        self.repository.list_snapshots().await
    }
}

fn change_hashes(spec: &EvalSpec) -> HashMap<EntityRef, String> {
    spec.entity_refs()
        .into_iter()
        .filter_map(|entity| {
            let hash = spec.entity(&entity)?.change_hash(entity.kind);
            Some((entity, hash))
        })
        .collect()
}
