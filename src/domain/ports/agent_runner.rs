//! Agent runner port - how entities under test are invoked.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{InvocationOutput, InvocationRequest};

/// Invokes an agent, team or flow with a single input.
///
/// Implementations report transport problems (network, process spawn,
/// non-zero exit that may succeed later) as transient
/// `DomainError::InvocationFailed` so the runner can retry them. The runner
/// applies its own timeout around `invoke`.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Get the runner type name.
    fn name(&self) -> &'static str;

    async fn invoke(&self, request: InvocationRequest) -> DomainResult<InvocationOutput>;
}
