//! Specification repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::errors::DomainResult;
use crate::domain::models::EvalSpec;

/// A stored version snapshot of the specification document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    /// Entities whose change triggered this snapshot.
    #[serde(default)]
    pub changed_entities: Vec<String>,
}

/// Persistence of the eval spec document and its snapshots.
#[async_trait]
pub trait SpecRepository: Send + Sync {
    /// Load the document, `Ok(None)` if it does not exist yet.
    async fn load(&self) -> DomainResult<Option<EvalSpec>>;

    /// Persist the document.
    async fn save(&self, spec: &EvalSpec) -> DomainResult<()>;

    /// Store a copy of `spec` as a new version snapshot.
    async fn create_snapshot(
        &self,
        spec: &EvalSpec,
        changed_entities: &[String],
    ) -> DomainResult<SnapshotInfo>;

    /// Snapshots ordered oldest first.
    async fn list_snapshots(&self) -> DomainResult<Vec<SnapshotInfo>>;

    /// Apply the retention policy; returns the number of snapshots removed.
    async fn prune_snapshots(&self) -> DomainResult<usize>;
}
