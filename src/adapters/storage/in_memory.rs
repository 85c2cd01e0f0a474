//! In-memory spec repository for tests.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::EvalSpec;
use crate::domain::ports::{SnapshotInfo, SpecRepository};

#[derive(Default)]
struct State {
    document: Option<EvalSpec>,
    snapshots: Vec<(SnapshotInfo, EvalSpec)>,
    saves: usize,
    fail_saves: bool,
}

#[derive(Default)]
pub struct InMemorySpecRepository {
    state: Mutex<State>,
}

impl InMemorySpecRepository {
    pub fn with_document(spec: EvalSpec) -> Self {
        Self {
            state: Mutex::new(State {
                document: Some(spec),
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent `save` fail with a persistence error.
    pub fn fail_saves(&self) {
        self.state().fail_saves = true;
    }

    pub fn document(&self) -> Option<EvalSpec> {
        self.state().document.clone()
    }

    pub fn save_count(&self) -> usize {
        self.state().saves
    }

    pub fn snapshot_count(&self) -> usize {
        self.state().snapshots.len()
    }
}

#[async_trait]
impl SpecRepository for InMemorySpecRepository {
    async fn load(&self) -> DomainResult<Option<EvalSpec>> {
        Ok(self.state().document.clone())
    }

    async fn save(&self, spec: &EvalSpec) -> DomainResult<()> {
        let mut state = self.state();
        if state.fail_saves {
            return Err(DomainError::Persistence("disk full".to_string()));
        }
        state.document = Some(spec.clone());
        state.saves += 1;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        spec: &EvalSpec,
        changed_entities: &[String],
    ) -> DomainResult<SnapshotInfo> {
        let mut state = self.state();
        let id = format!("snapshot-{}", state.snapshots.len() + 1);
        let info = SnapshotInfo {
            id: id.clone(),
            created_at: Utc::now(),
            path: PathBuf::from(format!("memory://{id}")),
            changed_entities: changed_entities.to_vec(),
        };
        state.snapshots.push((info.clone(), spec.clone()));
        Ok(info)
    }

    async fn list_snapshots(&self) -> DomainResult<Vec<SnapshotInfo>> {
        Ok(self.state().snapshots.iter().map(|(i, _)| i.clone()).collect())
    }

    async fn prune_snapshots(&self) -> DomainResult<usize> {
        Ok(0)
    }
}
