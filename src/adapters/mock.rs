//! Mock agent runner and LLM provider for tests and dry runs.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    CriterionEvaluation, CriterionRequest, GenerationRequest, InvocationOutput,
    InvocationRequest, TestSpecification,
};
use crate::domain::ports::{AgentRunner, LlmProvider};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted behavior of one mock invocation.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Return this output.
    Output(Value),
    /// Fail with an invocation error.
    Fail { message: String, transient: bool },
    /// Never answer; the runner's timeout must fire.
    Hang,
}

impl MockBehavior {
    pub fn output(value: impl Into<Value>) -> Self {
        Self::Output(value.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
            transient: false,
        }
    }
}

/// Mock agent runner.
///
/// Per entity, scripted behaviors are consumed in order; once exhausted the
/// fixed response for the entity (or the default echo) is used.
#[derive(Default)]
pub struct MockAgentRunner {
    scripts: Mutex<HashMap<String, VecDeque<MockBehavior>>>,
    fixed: Mutex<HashMap<String, Value>>,
    requests: Mutex<Vec<InvocationRequest>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockAgentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every invocation for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_response(&self, entity: &str, output: Value) {
        lock(&self.fixed).insert(entity.to_string(), output);
    }

    pub fn push_script(&self, entity: &str, behaviors: impl IntoIterator<Item = MockBehavior>) {
        lock(&self.scripts)
            .entry(entity.to_string())
            .or_default()
            .extend(behaviors);
    }

    pub fn invocation_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<InvocationRequest> {
        lock(&self.requests).clone()
    }

    /// Highest number of invocations observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_behavior(&self, request: &InvocationRequest) -> MockBehavior {
        let name = &request.entity.name;
        if let Some(behavior) = lock(&self.scripts).get_mut(name).and_then(VecDeque::pop_front) {
            return behavior;
        }
        if let Some(output) = lock(&self.fixed).get(name) {
            return MockBehavior::Output(output.clone());
        }
        MockBehavior::Output(json!({
            "entity": name,
            "response": format!("handled {}", render(&request.input)),
        }))
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentRunner for MockAgentRunner {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn invoke(&self, request: InvocationRequest) -> DomainResult<InvocationOutput> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let started = Instant::now();
        let behavior = self.next_behavior(&request);
        lock(&self.requests).push(request);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match behavior {
            MockBehavior::Output(output) => Ok(InvocationOutput {
                output,
                latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            }),
            MockBehavior::Fail { message, transient } => {
                Err(DomainError::invocation(message, transient))
            }
            MockBehavior::Hang => std::future::pending().await,
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Deterministic mock judge and generator.
///
/// Each criterion has a quality in [0, 1] (default 1.0). A criterion is met
/// when `quality * 100 >= strictness`, so raising strictness can only turn
/// verdicts from met to not met. Criteria carrying an `Expected output:`
/// instruction are met when every output renders equal to the expectation.
#[derive(Default)]
pub struct MockLlmProvider {
    quality: Mutex<HashMap<String, f64>>,
    forced: Mutex<HashMap<String, bool>>,
    failures: Mutex<VecDeque<bool>>,
    evaluations: Mutex<Vec<CriterionRequest>>,
    generated: Mutex<Option<Vec<TestSpecification>>>,
    generations: Mutex<Vec<GenerationRequest>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_criterion_quality(&self, criterion: &str, quality: f64) {
        lock(&self.quality).insert(criterion.to_string(), quality.clamp(0.0, 1.0));
    }

    /// Force a verdict regardless of strictness.
    pub fn set_criterion_verdict(&self, criterion: &str, met: bool) {
        lock(&self.forced).insert(criterion.to_string(), met);
    }

    /// Fail the next `count` evaluation calls.
    pub fn fail_next_evaluations(&self, count: usize, transient: bool) {
        lock(&self.failures).extend(std::iter::repeat(transient).take(count));
    }

    /// Return these tests from every generation call.
    pub fn set_generated_tests(&self, tests: Vec<TestSpecification>) {
        *lock(&self.generated) = Some(tests);
    }

    pub fn evaluation_count(&self) -> usize {
        lock(&self.evaluations).len()
    }

    pub fn evaluation_requests(&self) -> Vec<CriterionRequest> {
        lock(&self.evaluations).clone()
    }

    pub fn generation_requests(&self) -> Vec<GenerationRequest> {
        lock(&self.generations).clone()
    }

    fn judge(&self, request: &CriterionRequest) -> CriterionEvaluation {
        let strictness = f64::from(request.evaluation_strictness);

        if let Some(expected) = request
            .special_instructions
            .as_deref()
            .and_then(|s| s.strip_prefix("Expected output: "))
        {
            let met = !request.outputs.is_empty()
                && request.outputs.iter().all(|o| render(o).trim() == expected.trim());
            return CriterionEvaluation {
                criterion: request.criterion.clone(),
                met,
                score: if met { 1.0 } else { 0.0 },
                evidence: format!("expected {expected}"),
                reasoning: "compared rendered output with expectation".to_string(),
            };
        }

        let quality = lock(&self.quality)
            .get(&request.criterion)
            .copied()
            .unwrap_or(1.0);
        let met = lock(&self.forced)
            .get(&request.criterion)
            .copied()
            .unwrap_or(quality * 100.0 >= strictness);

        CriterionEvaluation {
            criterion: request.criterion.clone(),
            met,
            score: quality,
            evidence: format!("quality {quality:.2} at strictness {strictness}"),
            reasoning: if met {
                "evidence meets the required strictness".to_string()
            } else {
                "evidence falls short of the required strictness".to_string()
            },
        }
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn evaluate_criterion(
        &self,
        request: CriterionRequest,
    ) -> DomainResult<CriterionEvaluation> {
        let verdict = self.judge(&request);
        lock(&self.evaluations).push(request);

        if let Some(transient) = lock(&self.failures).pop_front() {
            return Err(DomainError::llm("mock judge unavailable", transient));
        }
        Ok(verdict)
    }

    async fn generate_dimension_tests(
        &self,
        request: GenerationRequest,
    ) -> DomainResult<Vec<TestSpecification>> {
        lock(&self.generations).push(request.clone());

        if let Some(tests) = lock(&self.generated).clone() {
            return Ok(tests);
        }

        Ok((1..=request.test_count.max(1))
            .map(|i| {
                let mut test = TestSpecification::new(
                    format!("{}_{i}", request.dimension),
                    json!(format!("{} input {i} for {}", request.dimension, request.entity.name)),
                )
                .with_criterion(format!("Response satisfies {}", request.dimension));
                if let Some(runs) = request.runs_per_input.filter(|r| *r > 1) {
                    test = test.with_runs(runs);
                }
                test.generated_by = "mock".to_string();
                test
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{EntityKind, EntityRef};

    fn request(criterion: &str, strictness: u8) -> CriterionRequest {
        CriterionRequest {
            criterion: criterion.to_string(),
            evaluation_strictness: strictness,
            special_instructions: None,
            outputs: vec![json!("out")],
            input: json!("in"),
            dimension: "accuracy".to_string(),
            entity_name: "A".to_string(),
            entity_kind: EntityKind::Agent,
            evaluation_instructions: None,
        }
    }

    #[tokio::test]
    async fn test_stricter_judge_meets_fewer() {
        let llm = MockLlmProvider::new();
        llm.set_criterion_quality("relevant", 0.8);
        assert!(llm.evaluate_criterion(request("relevant", 50)).await.unwrap().met);
        assert!(!llm.evaluate_criterion(request("relevant", 95)).await.unwrap().met);
    }

    #[tokio::test]
    async fn test_expected_output_comparison() {
        let llm = MockLlmProvider::new();
        let mut req = request("matches", 85);
        req.special_instructions = Some("Expected output: out".to_string());
        assert!(llm.evaluate_criterion(req.clone()).await.unwrap().met);
        req.outputs = vec![json!("other")];
        assert!(!llm.evaluate_criterion(req).await.unwrap().met);
    }

    #[tokio::test]
    async fn test_scripted_runner_then_fixed() {
        let runner = MockAgentRunner::new();
        runner.push_script("A", [MockBehavior::transient("reset")]);
        runner.set_response("A", json!("fixed"));
        let req = InvocationRequest {
            entity: EntityRef::new(EntityKind::Agent, "A"),
            input: json!("x"),
            test_id: "agent:A:accuracy:0".to_string(),
        };
        assert!(runner.invoke(req.clone()).await.unwrap_err().is_transient());
        assert_eq!(runner.invoke(req).await.unwrap().output, json!("fixed"));
        assert_eq!(runner.invocation_count(), 2);
    }

    #[tokio::test]
    async fn test_default_generation_requests_runs() {
        let llm = MockLlmProvider::new();
        let tests = llm
            .generate_dimension_tests(GenerationRequest {
                entity: EntityRef::new(EntityKind::Agent, "A"),
                dimension: "consistency".to_string(),
                requirements: "be stable".to_string(),
                contract: json!({}),
                test_count: 2,
                runs_per_input: Some(3),
            })
            .await
            .unwrap();
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].id, "consistency_1");
        assert_eq!(tests[1].requested_runs(), Some(3));
    }
}
