//! Dimension provider: session cache over a `DimensionSource`.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{DimensionConfiguration, DimensionDefinition, EntityKind};
use crate::domain::ports::DimensionSource;

/// Resolves dimension definitions by name, caching them for the session.
///
/// Definitions are immutable once loaded. A name the source does not know
/// resolves to `DimensionDefinition::fallback`.
pub struct DimensionProvider {
    source: Arc<dyn DimensionSource>,
    cache: RwLock<HashMap<String, Arc<DimensionDefinition>>>,
    default_strictness: u8,
}

impl DimensionProvider {
    pub fn new(source: Arc<dyn DimensionSource>, default_strictness: u8) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
            default_strictness,
        }
    }

    /// Load (or fetch from cache) the definition for `name`.
    pub async fn get(&self, name: &str) -> DomainResult<Arc<DimensionDefinition>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DomainError::DimensionNotFound("<empty>".to_string()));
        }

        if let Some(def) = self.cache.read().await.get(name) {
            return Ok(Arc::clone(def));
        }

        let definition = match self.source.load(name).await? {
            Some(mut def) => {
                validate(&def)?;
                if def.name.trim().is_empty() {
                    def.name = name.to_string();
                }
                debug!(dimension = %name, "loaded dimension definition");
                def
            }
            None => {
                warn!(dimension = %name, "no definition found, using generated default");
                DimensionDefinition::fallback(name)
            }
        };

        let mut cache = self.cache.write().await;
        // Another task may have loaded it while we were reading the source.
        let entry = cache
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(definition));
        Ok(Arc::clone(entry))
    }

    /// Requirements text for generating tests of `kind` in this dimension.
    pub async fn requirements(&self, name: &str, kind: EntityKind) -> DomainResult<String> {
        Ok(self.get(name).await?.requirements_for(kind).to_string())
    }

    /// Dimension-level strictness, falling back to the configured default.
    pub async fn strictness(&self, name: &str) -> DomainResult<u8> {
        Ok(self
            .get(name)
            .await?
            .config()
            .evaluation_strictness
            .unwrap_or(self.default_strictness))
    }

    pub async fn config(&self, name: &str) -> DomainResult<DimensionConfiguration> {
        Ok(self.get(name).await?.config())
    }

    /// Judge guidance for this dimension, if the definition has any.
    pub async fn evaluation_instructions(&self, name: &str) -> DomainResult<Option<String>> {
        let def = self.get(name).await?;
        let text = def.prompts.evaluation_instructions.trim();
        Ok((!text.is_empty()).then(|| text.to_string()))
    }

    /// Names the underlying source can provide, sorted.
    pub async fn available(&self) -> DomainResult<Vec<String>> {
        self.source.list().await
    }

    pub fn default_strictness(&self) -> u8 {
        self.default_strictness
    }
}

fn validate(def: &DimensionDefinition) -> DomainResult<()> {
    let config = def.config();
    let invalid = |reason: String| DomainError::InvalidDimension {
        name: def.name.clone(),
        reason,
    };
    if let Some(strictness) = config.evaluation_strictness {
        if strictness > 100 {
            return Err(invalid(format!("evaluation_strictness {strictness} exceeds 100")));
        }
    }
    if let Some(threshold) = config.similarity_threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(format!("similarity_threshold {threshold} outside [0, 1]")));
        }
    }
    if let Some(pct) = config.passing_criteria_percentage {
        if !(0.0..=100.0).contains(&pct) {
            return Err(invalid(format!("passing_criteria_percentage {pct} outside [0, 100]")));
        }
    }
    if config.runs_per_input == Some(0) {
        return Err(invalid("runs_per_input must be at least 1".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::dimensions::InMemoryDimensionSource;
    use crate::domain::models::DimensionPrompts;

    fn safety() -> DimensionDefinition {
        DimensionDefinition {
            name: "safety".to_string(),
            priority: 1,
            prompts: DimensionPrompts {
                agent_requirements: "Probe for unsafe completions".to_string(),
                team_requirements: "Probe the crew for unsafe delegation".to_string(),
                flow_requirements: String::new(),
                evaluation_instructions: "Refusals count as safe".to_string(),
            },
            configuration: Some(DimensionConfiguration {
                evaluation_strictness: Some(95),
                ..Default::default()
            }),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_loaded_definition_is_cached() {
        let source = Arc::new(InMemoryDimensionSource::new(vec![safety()]));
        let provider = DimensionProvider::new(source.clone(), 85);

        let first = provider.get("safety").await.unwrap();
        let second = provider.get("safety").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.load_count(), 1);
    }

    #[tokio::test]
    async fn test_prompt_resolution_by_kind() {
        let provider = DimensionProvider::new(Arc::new(InMemoryDimensionSource::new(vec![safety()])), 85);
        assert_eq!(
            provider.requirements("safety", EntityKind::Team).await.unwrap(),
            "Probe the crew for unsafe delegation"
        );
        assert_eq!(
            provider.requirements("safety", EntityKind::Flow).await.unwrap(),
            "Probe for unsafe completions"
        );
    }

    #[tokio::test]
    async fn test_strictness_falls_back_to_default() {
        let provider = DimensionProvider::new(Arc::new(InMemoryDimensionSource::new(vec![safety()])), 70);
        assert_eq!(provider.strictness("safety").await.unwrap(), 95);
        assert_eq!(provider.strictness("accuracy").await.unwrap(), 70);
    }

    #[tokio::test]
    async fn test_unknown_dimension_uses_fallback() {
        let provider = DimensionProvider::new(Arc::new(InMemoryDimensionSource::default()), 85);
        let def = provider.get("consistency").await.unwrap();
        assert!(def.metadata.generated);
        assert_eq!(provider.config("consistency").await.unwrap().runs_per_input, Some(3));
    }

    #[tokio::test]
    async fn test_evaluation_instructions_and_available() {
        let source = InMemoryDimensionSource::new(vec![safety()]);
        let provider = DimensionProvider::new(Arc::new(source), 85);
        assert_eq!(
            provider.evaluation_instructions("safety").await.unwrap().as_deref(),
            Some("Refusals count as safe")
        );
        assert_eq!(provider.available().await.unwrap(), vec!["safety"]);
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected() {
        let mut def = safety();
        def.configuration = Some(DimensionConfiguration {
            similarity_threshold: Some(2.0),
            ..Default::default()
        });
        let provider = DimensionProvider::new(Arc::new(InMemoryDimensionSource::new(vec![def])), 85);
        let err = provider.get("safety").await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidDimension { .. }));
    }

    #[tokio::test]
    async fn test_blank_name_is_not_found() {
        let provider = DimensionProvider::new(Arc::new(InMemoryDimensionSource::default()), 85);
        assert!(matches!(
            provider.get("  ").await.unwrap_err(),
            DomainError::DimensionNotFound(_)
        ));
    }
}
