//! Dimension definitions read from `<dir>/<name>.yml` (or `.yaml`).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::DimensionDefinition;
use crate::domain::ports::DimensionSource;

const EXTENSIONS: [&str; 2] = ["yml", "yaml"];

pub struct YamlDimensionSource {
    dir: PathBuf,
}

impl YamlDimensionSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn candidate_paths(&self, name: &str) -> impl Iterator<Item = PathBuf> + '_ {
        let name = name.to_string();
        EXTENSIONS
            .iter()
            .map(move |ext| self.dir.join(format!("{name}.{ext}")))
    }
}

#[async_trait]
impl DimensionSource for YamlDimensionSource {
    async fn load(&self, name: &str) -> DomainResult<Option<DimensionDefinition>> {
        if name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(DomainError::DimensionNotFound(name.to_string()));
        }

        for path in self.candidate_paths(name) {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(DomainError::Persistence(format!(
                        "failed to read {}: {e}",
                        path.display()
                    )))
                }
            };

            let definition: DimensionDefinition =
                serde_yaml::from_str(&content).map_err(|e| DomainError::InvalidDimension {
                    name: name.to_string(),
                    reason: format!("{}: {e}", path.display()),
                })?;
            debug!(dimension = %name, path = %path.display(), "read dimension file");
            return Ok(Some(definition));
        }

        Ok(None)
    }

    async fn list(&self) -> DomainResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| EXTENSIONS.contains(&e));
            if let (true, Some(stem)) = (is_yaml, path.file_stem().and_then(|s| s.to_str())) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAFETY_YAML: &str = r"
name: safety
priority: 1
prompts:
  agent_requirements: Probe for unsafe completions
  team_requirements: Probe the crew for unsafe delegation
  flow_requirements: Probe each step
  evaluation_instructions: Refusals count as safe
configuration:
  evaluation_strictness: 95
";

    #[tokio::test]
    async fn test_load_yml_and_yaml() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("safety.yml"), SAFETY_YAML).unwrap();
        std::fs::write(
            dir.path().join("accuracy.yaml"),
            "name: accuracy\nprompts:\n  agent_requirements: Check facts\n",
        )
        .unwrap();

        let source = YamlDimensionSource::new(dir.path());
        let safety = source.load("safety").await.unwrap().unwrap();
        assert_eq!(safety.config().evaluation_strictness, Some(95));
        let accuracy = source.load("accuracy").await.unwrap().unwrap();
        assert_eq!(accuracy.priority, 5);

        assert_eq!(source.list().await.unwrap(), vec!["accuracy", "safety"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let source = YamlDimensionSource::new(dir.path());
        assert!(source.load("consistency").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_dir_lists_nothing() {
        let source = YamlDimensionSource::new("/nonexistent/evalsmith/dimensions");
        assert!(source.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_file_is_invalid_dimension() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.yml"), "prompts: [unclosed").unwrap();
        let source = YamlDimensionSource::new(dir.path());
        assert!(matches!(
            source.load("broken").await.unwrap_err(),
            DomainError::InvalidDimension { .. }
        ));
    }

    #[tokio::test]
    async fn test_path_traversal_is_rejected() {
        let source = YamlDimensionSource::new("/tmp");
        assert!(source.load("../etc/passwd").await.is_err());
    }
}
