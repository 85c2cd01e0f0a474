//! LLM provider port - judge and test generator.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    CriterionEvaluation, CriterionRequest, GenerationRequest, TestSpecification,
};

/// LLM capabilities consumed by the harness.
///
/// Callers acquire an LLM slot from the task queue before calling either
/// method; implementations only pace requests and translate errors.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &'static str;

    /// Decide whether one criterion is met by the given outputs.
    async fn evaluate_criterion(&self, request: CriterionRequest)
        -> DomainResult<CriterionEvaluation>;

    /// Generate test specifications for one entity and dimension.
    async fn generate_dimension_tests(
        &self,
        request: GenerationRequest,
    ) -> DomainResult<Vec<TestSpecification>>;
}
