//! Dimension source port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::DimensionDefinition;

/// Loads dimension definitions by name.
#[async_trait]
pub trait DimensionSource: Send + Sync {
    /// Returns `Ok(None)` when no definition exists for `name`; a definition
    /// that exists but cannot be parsed is an error.
    async fn load(&self, name: &str) -> DomainResult<Option<DimensionDefinition>>;

    /// Names of all definitions this source can provide.
    async fn list(&self) -> DomainResult<Vec<String>>;
}
