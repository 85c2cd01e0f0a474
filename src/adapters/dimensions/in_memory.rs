//! In-memory dimension source, used by tests and embedding callers.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::domain::errors::DomainResult;
use crate::domain::models::DimensionDefinition;
use crate::domain::ports::DimensionSource;

#[derive(Default)]
pub struct InMemoryDimensionSource {
    definitions: BTreeMap<String, DimensionDefinition>,
    loads: AtomicUsize,
}

impl InMemoryDimensionSource {
    pub fn new(definitions: Vec<DimensionDefinition>) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            loads: AtomicUsize::new(0),
        }
    }

    /// Number of `load` calls served so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DimensionSource for InMemoryDimensionSource {
    async fn load(&self, name: &str) -> DomainResult<Option<DimensionDefinition>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.definitions.get(name).cloned())
    }

    async fn list(&self) -> DomainResult<Vec<String>> {
        Ok(self.definitions.keys().cloned().collect())
    }
}
