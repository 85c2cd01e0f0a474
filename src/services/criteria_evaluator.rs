//! Criterion-by-criterion evaluation of agent outputs by the LLM judge.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    CriterionEvaluation, CriterionRequest, EntityRef, EvaluationCriterion, TestSpecification,
};
use crate::domain::ports::LlmProvider;
use crate::services::retry::RetryPolicy;
use crate::services::task_queue::AdmissionGate;

/// Criterion synthesized for tests that only carry an expected output.
pub const EXPECTED_OUTPUT_CRITERION: &str = "The output matches the expected output";

/// Dimension-level inputs to an evaluation.
#[derive(Debug, Clone, Default)]
pub struct DimensionContext {
    pub name: String,
    pub strictness: Option<u8>,
    pub passing_criteria_percentage: Option<f64>,
    pub evaluation_instructions: Option<String>,
}

/// Outcome of evaluating one test's criteria.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub success: bool,
    /// Fraction of criteria met, in [0, 1].
    pub score: f64,
    pub criteria: Vec<CriterionEvaluation>,
}

/// Criteria a test is judged on. Tests without criteria but with an
/// expected output get one synthesized comparison criterion.
pub fn effective_criteria(test: &TestSpecification) -> Vec<EvaluationCriterion> {
    if !test.evaluation_criteria.is_empty() {
        return test.evaluation_criteria.clone();
    }
    match &test.expected {
        Some(expected) => {
            let rendered = match expected {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            vec![EvaluationCriterion {
                criterion: EXPECTED_OUTPUT_CRITERION.to_string(),
                evaluation_strictness: None,
                special_instructions: Some(format!("Expected output: {rendered}")),
            }]
        }
        None => Vec::new(),
    }
}

/// Strictness precedence: criterion, then dimension, then default.
pub fn resolve_strictness(
    criterion: &EvaluationCriterion,
    dimension: Option<u8>,
    default: u8,
) -> u8 {
    criterion
        .evaluation_strictness
        .or(dimension)
        .unwrap_or(default)
        .min(100)
}

/// Whether `met` of `total` criteria reaches `passing_percentage`.
pub fn meets_threshold(met: usize, total: usize, passing_percentage: f64) -> bool {
    if total == 0 {
        return true;
    }
    // Compare in integer-scaled space to keep 2/3 vs 66.67 stable.
    (met as f64) * 100.0 >= passing_percentage * total as f64 - 1e-9
}

pub struct CriteriaEvaluator {
    llm: Arc<dyn LlmProvider>,
    llm_gate: Arc<AdmissionGate>,
    retry: RetryPolicy,
    default_strictness: u8,
    default_passing_percentage: f64,
}

impl CriteriaEvaluator {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        llm_gate: Arc<AdmissionGate>,
        retry: RetryPolicy,
        default_strictness: u8,
        default_passing_percentage: f64,
    ) -> Self {
        Self {
            llm,
            llm_gate,
            retry,
            default_strictness,
            default_passing_percentage,
        }
    }

    /// Judge `outputs` of one test against its criteria.
    ///
    /// Each criterion is a separate LLM call made under an LLM slot and
    /// retried on transient failures. A criterion whose call ultimately
    /// fails fails the whole evaluation.
    #[instrument(skip_all, fields(entity = %entity, dimension = %dimension.name, test_id = %test.id))]
    pub async fn evaluate(
        &self,
        entity: &EntityRef,
        dimension: &DimensionContext,
        test: &TestSpecification,
        input: &Value,
        outputs: &[Value],
    ) -> DomainResult<Verdict> {
        let criteria = effective_criteria(test);
        if criteria.is_empty() {
            debug!("no criteria; successful invocation passes");
            return Ok(Verdict {
                success: true,
                score: 1.0,
                criteria: Vec::new(),
            });
        }

        let mut evaluations = Vec::with_capacity(criteria.len());
        for criterion in &criteria {
            let request = CriterionRequest {
                criterion: criterion.criterion.clone(),
                evaluation_strictness: resolve_strictness(
                    criterion,
                    dimension.strictness,
                    self.default_strictness,
                ),
                special_instructions: criterion.special_instructions.clone(),
                outputs: outputs.to_vec(),
                input: input.clone(),
                dimension: dimension.name.clone(),
                entity_name: entity.name.clone(),
                entity_kind: entity.kind,
                evaluation_instructions: dimension.evaluation_instructions.clone(),
            };
            evaluations.push(self.judge(request).await?);
        }

        let passing_percentage = test
            .thresholds
            .as_ref()
            .and_then(|t| t.passing_criteria_percentage)
            .or(dimension.passing_criteria_percentage)
            .unwrap_or(self.default_passing_percentage);
        let met = evaluations.iter().filter(|e| e.met).count();
        let success = meets_threshold(met, evaluations.len(), passing_percentage);
        let score = met as f64 / evaluations.len() as f64;

        debug!(met, total = evaluations.len(), passing_percentage, success, "criteria evaluated");
        Ok(Verdict {
            success,
            score,
            criteria: evaluations,
        })
    }

    async fn judge(&self, request: CriterionRequest) -> DomainResult<CriterionEvaluation> {
        let criterion = request.criterion.clone();
        let result = self
            .retry
            .execute(|_attempt| {
                let request = request.clone();
                let gate = Arc::clone(&self.llm_gate);
                let llm = Arc::clone(&self.llm);
                async move {
                    let _slot = gate.acquire().await?;
                    llm.evaluate_criterion(request).await
                }
            })
            .await;

        match result {
            Ok(attempted) => {
                let mut evaluation = attempted.value.normalized();
                if evaluation.criterion.trim().is_empty() {
                    evaluation.criterion = criterion;
                }
                Ok(evaluation)
            }
            Err(exhausted) => Err(match exhausted.error {
                DomainError::LlmRequestFailed { message, transient } => DomainError::LlmRequestFailed {
                    message: format!("criterion '{criterion}': {message}"),
                    transient,
                },
                other => other,
            }),
        }
    }
}
