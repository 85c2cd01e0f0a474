//! JSON file repository for the eval spec document and its snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{EvalSpec, StorageConfig};
use crate::domain::ports::{SnapshotInfo, SpecRepository};

/// Snapshot retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRetention {
    pub max_snapshots: usize,
    pub retention_days: u32,
    /// The newest `keep_recent` snapshots survive both limits.
    pub keep_recent: usize,
}

impl Default for SnapshotRetention {
    fn default() -> Self {
        Self {
            max_snapshots: 20,
            retention_days: 30,
            keep_recent: 5,
        }
    }
}

impl From<&StorageConfig> for SnapshotRetention {
    fn from(config: &StorageConfig) -> Self {
        Self {
            max_snapshots: config.max_snapshots,
            retention_days: config.retention_days,
            keep_recent: config.keep_recent,
        }
    }
}

impl SnapshotRetention {
    /// Indices (into `created`, oldest first) of snapshots to evict.
    pub fn evictions(&self, created: &[DateTime<Utc>], now: DateTime<Utc>) -> Vec<usize> {
        let n = created.len();
        let protected_from = n.saturating_sub(self.keep_recent);
        let cutoff = now - Duration::days(i64::from(self.retention_days));

        let mut evict: Vec<usize> = (0..protected_from)
            .filter(|&i| created[i] < cutoff)
            .collect();

        let mut remaining = n - evict.len();
        for i in 0..protected_from {
            if remaining <= self.max_snapshots {
                break;
            }
            if !evict.contains(&i) {
                evict.push(i);
                remaining -= 1;
            }
        }
        evict.sort_unstable();
        evict
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotHeader {
    id: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    changed_entities: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotFile<'a> {
    #[serde(flatten)]
    header: &'a SnapshotHeader,
    spec: &'a EvalSpec,
}

pub struct JsonSpecRepository {
    spec_path: PathBuf,
    history_dir: PathBuf,
    retention: SnapshotRetention,
}

impl JsonSpecRepository {
    pub fn new(
        spec_path: impl Into<PathBuf>,
        history_dir: impl Into<PathBuf>,
        retention: SnapshotRetention,
    ) -> Self {
        Self {
            spec_path: spec_path.into(),
            history_dir: history_dir.into(),
            retention,
        }
    }

    /// Resolve the configured paths against `project_root`.
    pub fn from_config(project_root: &Path, config: &StorageConfig) -> Self {
        Self::new(
            project_root.join(&config.spec_path),
            project_root.join(&config.history_dir),
            SnapshotRetention::from(config),
        )
    }

    pub fn spec_path(&self) -> &Path {
        &self.spec_path
    }

    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }
}

/// Write via a temporary sibling file and rename, so readers never see a
/// partially written document.
async fn write_atomic(path: &Path, bytes: &[u8]) -> DomainResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            DomainError::Persistence(format!("failed to create {}: {e}", parent.display()))
        })?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        return Err(DomainError::Persistence(format!(
            "failed to write {}: {e}",
            tmp.display()
        )));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(DomainError::Persistence(format!(
            "failed to replace {}: {e}",
            path.display()
        )));
    }
    Ok(())
}

#[async_trait]
impl SpecRepository for JsonSpecRepository {
    async fn load(&self) -> DomainResult<Option<EvalSpec>> {
        let content = match tokio::fs::read_to_string(&self.spec_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DomainError::Persistence(format!(
                    "failed to read {}: {e}",
                    self.spec_path.display()
                )))
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| DomainError::MalformedSpec(format!("{}: {e}", self.spec_path.display())))
    }

    async fn save(&self, spec: &EvalSpec) -> DomainResult<()> {
        let bytes = serde_json::to_vec_pretty(spec)?;
        write_atomic(&self.spec_path, &bytes).await?;
        debug!(path = %self.spec_path.display(), bytes = bytes.len(), "saved eval spec");
        Ok(())
    }

    async fn create_snapshot(
        &self,
        spec: &EvalSpec,
        changed_entities: &[String],
    ) -> DomainResult<SnapshotInfo> {
        let created_at = Utc::now();
        let id = format!(
            "{}-{}",
            created_at.format("%Y%m%dT%H%M%S%3fZ"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let header = SnapshotHeader {
            id: id.clone(),
            created_at,
            changed_entities: changed_entities.to_vec(),
        };
        let path = self.history_dir.join(format!("eval-spec-{id}.json"));

        let bytes = serde_json::to_vec_pretty(&SnapshotFile {
            header: &header,
            spec,
        })?;
        write_atomic(&path, &bytes).await?;

        Ok(SnapshotInfo {
            id,
            created_at,
            path,
            changed_entities: header.changed_entities,
        })
    }

    async fn list_snapshots(&self) -> DomainResult<Vec<SnapshotInfo>> {
        let mut entries = match tokio::fs::read_dir(&self.history_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("eval-spec-") && n.ends_with(".json"));
            if !is_snapshot {
                continue;
            }

            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<SnapshotHeader>(&content) {
                Ok(header) => snapshots.push(SnapshotInfo {
                    id: header.id,
                    created_at: header.created_at,
                    path,
                    changed_entities: header.changed_entities,
                }),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
            }
        }

        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(snapshots)
    }

    async fn prune_snapshots(&self) -> DomainResult<usize> {
        let snapshots = self.list_snapshots().await?;
        let created: Vec<DateTime<Utc>> = snapshots.iter().map(|s| s.created_at).collect();
        let evictions = self.retention.evictions(&created, Utc::now());

        for &i in &evictions {
            let path = &snapshots[i].path;
            tokio::fs::remove_file(path).await.map_err(|e| {
                DomainError::Persistence(format!("failed to remove {}: {e}", path.display()))
            })?;
            debug!(snapshot = %snapshots[i].id, "evicted snapshot");
        }
        Ok(evictions.len())
    }
}
