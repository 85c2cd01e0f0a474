//! Test runner.
//!
//! Turns the selected test specifications into tracker units, executes them
//! on the task queue, judges their outputs and records the folded results
//! in the eval spec store.

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Config, EntityKind, EntityRef, GenerationRequest, InvocationRequest, TestResult, TestSpecification,
    TestUnit, TestUnitUpdate, MULTI_RUN_DIMENSIONS,
};
use crate::domain::ports::{AgentRunner, LlmProvider};
use crate::services::criteria_evaluator::{CriteriaEvaluator, DimensionContext};
use crate::services::dimension_provider::DimensionProvider;
use crate::services::result_aggregator::{
    self, DimensionSummary, EntitySummary, RunInfo, TestOutcome,
};
use crate::services::retry::RetryPolicy;
use crate::services::spec_store::SpecStore;
use crate::services::task_queue::{AdmissionGate, QueueObserver, QueuedTask, TaskQueue};
use crate::services::test_state_tracker::TestStateTracker;

/// Tests requested from the generator when a dimension does not say.
const DEFAULT_GENERATED_TESTS: u32 = 5;

/// Collaborators for one session. Nothing here is global.
pub struct RunnerContext {
    pub agent_runner: Arc<dyn AgentRunner>,
    pub llm: Arc<dyn LlmProvider>,
    pub dimensions: Arc<DimensionProvider>,
    pub config: Config,
    observers: Vec<Arc<dyn QueueObserver<TestUnit>>>,
}

impl RunnerContext {
    pub fn new(
        agent_runner: Arc<dyn AgentRunner>,
        llm: Arc<dyn LlmProvider>,
        dimensions: Arc<DimensionProvider>,
        config: Config,
    ) -> Self {
        Self {
            agent_runner,
            llm,
            dimensions,
            config,
            observers: Vec::new(),
        }
    }

    /// Attach a queue observer (progress bars, metrics).
    pub fn with_observer(mut self, observer: Arc<dyn QueueObserver<TestUnit>>) -> Self {
        self.observers.push(observer);
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.execution.max_retries,
            Duration::from_millis(self.config.execution.retry_delay_ms),
        )
    }
}

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Entity names; empty selects every entity in the document.
    pub entities: Vec<String>,
    /// Dimension names; empty selects the dimensions each entity has tests
    /// for (plus the enabled ones when generating).
    pub dimensions: Vec<String>,
    pub max_concurrency: Option<usize>,
    pub max_llm_concurrency: Option<usize>,
    /// Generate tests for selected dimensions that have none.
    pub generate_missing: bool,
}

/// Result of a whole run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub success_rate: f64,
    pub duration_ms: u64,
    pub dimensions: Vec<DimensionSummary>,
    pub entities: Vec<EntitySummary>,
    pub tests: Vec<TestOutcome>,
    /// Tests generated before the run, as `(entity, dimension, count)`.
    pub generated: Vec<(String, String, usize)>,
    /// Snapshot written by the final save, if the document changed.
    pub snapshot: Option<String>,
}

/// Dimension settings resolved once per run.
#[derive(Debug, Clone)]
struct ResolvedDimension {
    context: Arc<DimensionContext>,
    runs_per_input: Option<u32>,
    similarity_threshold: f64,
    requirements: HashMap<EntityKind, String>,
    test_count: u32,
}

/// One (test, input) pair scheduled for execution.
struct PlannedTest {
    entity: EntityRef,
    dimension: Arc<DimensionContext>,
    test: Arc<TestSpecification>,
    test_spec_id: String,
    input_index: usize,
    input: Value,
    runs: u32,
    similarity_threshold: f64,
}

/// A test whose dimension could not be resolved.
struct BrokenTest {
    entity: EntityRef,
    dimension: String,
    test_spec_id: String,
    input_index: usize,
    input: Value,
    error: String,
}

pub struct TestRunner {
    ctx: RunnerContext,
}

impl TestRunner {
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RunnerContext {
        &self.ctx
    }

    /// Execute a run against the document held by `store`.
    ///
    /// Individual test failures never fail the run; they are counted in the
    /// summary. The run fails when nothing is selected (`NoTestsFound`) or
    /// when the store cannot persist the results.
    #[instrument(skip(self, store), fields(entities = ?request.entities, dimensions = ?request.dimensions))]
    pub async fn run(&self, store: &mut SpecStore, request: RunRequest) -> DomainResult<RunSummary> {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let execution = &self.ctx.config.execution;
        let evaluation = &self.ctx.config.evaluation;

        let mut queue = TaskQueue::new(
            request.max_concurrency.unwrap_or(execution.max_concurrency).max(1),
            request
                .max_llm_concurrency
                .unwrap_or(execution.max_llm_concurrency)
                .max(1),
        );
        for observer in &self.ctx.observers {
            queue = queue.with_observer(Arc::clone(observer));
        }
        let queue = Arc::new(queue);
        let retry = self.ctx.retry_policy();

        let selection = self.select(store, &request);
        let mut resolved: HashMap<String, Result<ResolvedDimension, String>> = HashMap::new();
        for (_, dimensions) in &selection {
            for dimension in dimensions {
                if !resolved.contains_key(dimension) {
                    let entry = self.resolve_dimension(dimension).await.map_err(|e| e.to_string());
                    resolved.insert(dimension.clone(), entry);
                }
            }
        }

        let generated = if request.generate_missing {
            self.generate_missing(store, &selection, &resolved, queue.llm_gate(), retry)
                .await?
        } else {
            Vec::new()
        };

        let (plans, broken) = plan(store, &selection, &resolved);
        if plans.is_empty() && broken.is_empty() {
            warn!("no test specifications matched the selection");
            return Err(DomainError::NoTestsFound(describe_selection(&request)));
        }
        info!(
            run_id = %run_id,
            tests = plans.len() + broken.len(),
            max_concurrency = queue.max_concurrency(),
            max_llm_concurrency = queue.max_llm_concurrency(),
            "starting evaluation run"
        );

        let tracker = Arc::new(TestStateTracker::new(
            evaluation.similarity_threshold,
            evaluation.consistency_method,
        ));
        let executor = Arc::new(Executor {
            runner: Arc::clone(&self.ctx.agent_runner),
            evaluator: CriteriaEvaluator::new(
                Arc::clone(&self.ctx.llm),
                queue.llm_gate(),
                retry,
                evaluation.default_strictness,
                evaluation.passing_criteria_percentage,
            ),
            tracker: Arc::clone(&tracker),
            retry,
            timeout: Duration::from_millis(execution.timeout_ms),
        });

        for test in &broken {
            mark_broken(&tracker, test);
        }

        let mut handles = Vec::new();
        for plan in plans {
            let plan = Arc::new(plan);
            let unit_ids = match create_units(&tracker, &plan) {
                Ok(ids) => ids,
                Err(e) => {
                    error!(entity = %plan.entity, dimension = %plan.dimension.name, error = %e, "cannot schedule test");
                    continue;
                }
            };
            for unit_id in unit_ids {
                let task = QueuedTask::new(unit_id.clone(), format!("{} / {}", plan.entity.name, plan.dimension.name));
                let executor = Arc::clone(&executor);
                let plan = Arc::clone(&plan);
                let admitted = queue.enqueue(task, move || async move { executor.execute(unit_id, plan).await });
                handles.push(tokio::spawn(admitted));
            }
        }

        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.is_desync() => error!(error = %e, "tracker desynchronized"),
                Ok(Err(e)) => debug!(error = %e, "test did not produce a verdict"),
                Err(e) => error!(error = %e, "test task aborted"),
            }
        }
        queue.close();

        let units = tracker.get_all_tests();
        let aggregate = result_aggregator::aggregate(&units);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let run = RunInfo {
            run_id: run_id.clone(),
            timestamp: Utc::now(),
            duration_ms,
        };
        let record = result_aggregator::apply(store, &aggregate, &run)?;
        let saved = store.save().await?;

        info!(
            run_id = %run_id,
            total = record.total,
            passed = record.passed,
            failed = record.failed,
            errors = record.errors,
            duration_ms,
            "evaluation run finished"
        );

        Ok(RunSummary {
            run_id,
            total: record.total,
            passed: record.passed,
            failed: record.failed,
            errors: record.errors,
            success_rate: record.success_rate,
            duration_ms,
            dimensions: aggregate.dimensions,
            entities: aggregate.entities,
            tests: aggregate.outcomes,
            generated,
            snapshot: saved.snapshot.map(|s| s.id),
        })
    }

    /// Entities and their dimensions, in document order.
    fn select(&self, store: &SpecStore, request: &RunRequest) -> Vec<(EntityRef, Vec<String>)> {
        let entities: Vec<EntityRef> = if request.entities.is_empty() {
            store.spec().entity_refs()
        } else {
            let mut selected: Vec<EntityRef> = Vec::new();
            for selector in &request.entities {
                let found = store.spec().find_entities(selector);
                if found.is_empty() {
                    warn!(entity = %selector, "entity not found in eval spec");
                }
                for entity in found {
                    if !selected.contains(&entity) {
                        selected.push(entity);
                    }
                }
            }
            selected
        };

        entities
            .into_iter()
            .map(|entity| {
                let dimensions = if request.dimensions.is_empty() {
                    let mut names: Vec<String> = store
                        .entity(&entity)
                        .map(|e| e.test_specs.keys().cloned().collect())
                        .unwrap_or_default();
                    if request.generate_missing {
                        for enabled in &self.ctx.config.dimensions.enabled {
                            if !names.contains(enabled) {
                                names.push(enabled.clone());
                            }
                        }
                    }
                    names
                } else {
                    request.dimensions.clone()
                };
                (entity, dimensions)
            })
            .collect()
    }

    async fn resolve_dimension(&self, name: &str) -> DomainResult<ResolvedDimension> {
        let definition = self.ctx.dimensions.get(name).await?;
        let config = definition.config();
        let evaluation = &self.ctx.config.evaluation;

        let runs_per_input = config.runs_per_input.or_else(|| {
            MULTI_RUN_DIMENSIONS
                .contains(&name)
                .then_some(evaluation.default_runs_per_input)
        });
        let evaluation_instructions = self.ctx.dimensions.evaluation_instructions(name).await?;

        Ok(ResolvedDimension {
            context: Arc::new(DimensionContext {
                name: name.to_string(),
                strictness: config.evaluation_strictness,
                passing_criteria_percentage: config.passing_criteria_percentage,
                evaluation_instructions,
            }),
            runs_per_input,
            similarity_threshold: config
                .similarity_threshold
                .unwrap_or(evaluation.similarity_threshold),
            requirements: EntityKind::all()
                .into_iter()
                .map(|kind| (kind, definition.requirements_for(kind).to_string()))
                .collect(),
            test_count: config.test_count.unwrap_or(DEFAULT_GENERATED_TESTS),
        })
    }

    /// Fill dimensions without tests from the generator, then checkpoint.
    ///
    /// A generation failure only skips that dimension.
    #[instrument(skip_all)]
    async fn generate_missing(
        &self,
        store: &mut SpecStore,
        selection: &[(EntityRef, Vec<String>)],
        resolved: &HashMap<String, Result<ResolvedDimension, String>>,
        llm_gate: Arc<AdmissionGate>,
        retry: RetryPolicy,
    ) -> DomainResult<Vec<(String, String, usize)>> {
        let mut generated = Vec::new();

        for (entity, dimensions) in selection {
            for dimension in dimensions {
                if !store.dimension_tests(entity, dimension).is_empty() {
                    continue;
                }
                let Some(Ok(settings)) = resolved.get(dimension) else {
                    warn!(entity = %entity, dimension = %dimension, "skipping generation for unresolved dimension");
                    continue;
                };

                let request = GenerationRequest {
                    entity: entity.clone(),
                    dimension: dimension.clone(),
                    requirements: settings
                        .requirements
                        .get(&entity.kind)
                        .cloned()
                        .unwrap_or_default(),
                    contract: store.entity(entity)?.contract.clone(),
                    test_count: settings.test_count,
                    runs_per_input: settings.runs_per_input,
                };

                let attempt = retry
                    .execute(|_| {
                        let request = request.clone();
                        let gate = Arc::clone(&llm_gate);
                        let llm = Arc::clone(&self.ctx.llm);
                        async move {
                            let _slot = gate.acquire().await?;
                            llm.generate_dimension_tests(request).await
                        }
                    })
                    .await;

                match attempt {
                    Ok(tests) if tests.value.is_empty() => {
                        warn!(entity = %entity, dimension = %dimension, "generator returned no tests");
                    }
                    Ok(tests) => {
                        let count = store.merge_dimension_tests(
                            entity,
                            dimension,
                            &tests.value,
                            self.ctx.llm.name(),
                        )?;
                        info!(entity = %entity, dimension = %dimension, count, "generated tests");
                        generated.push((entity.to_string(), dimension.clone(), count));
                    }
                    Err(exhausted) => {
                        warn!(
                            entity = %entity,
                            dimension = %dimension,
                            attempts = exhausted.attempts,
                            error = %exhausted.error,
                            "test generation failed"
                        );
                    }
                }
            }
        }

        if !generated.is_empty() {
            store.save().await?;
        }
        Ok(generated)
    }
}

/// Expand the selection into scheduled (test, input) pairs.
fn plan(
    store: &SpecStore,
    selection: &[(EntityRef, Vec<String>)],
    resolved: &HashMap<String, Result<ResolvedDimension, String>>,
) -> (Vec<PlannedTest>, Vec<BrokenTest>) {
    let mut plans = Vec::new();
    let mut broken = Vec::new();

    for (entity, dimensions) in selection {
        for dimension in dimensions {
            let mut input_index = 0;
            for test in store.dimension_tests(entity, dimension) {
                let test = Arc::new(test);
                let inputs = std::iter::once(test.input.clone())
                    .chain(test.synthetic_inputs.clone().unwrap_or_default());

                for (k, input) in inputs.enumerate() {
                    let test_spec_id = if k == 0 {
                        test.id.clone()
                    } else {
                        format!("{}#{k}", test.id)
                    };

                    match resolved.get(dimension) {
                        Some(Ok(settings)) => plans.push(PlannedTest {
                            entity: entity.clone(),
                            dimension: Arc::clone(&settings.context),
                            test: Arc::clone(&test),
                            test_spec_id,
                            input_index,
                            input,
                            runs: test
                                .requested_runs()
                                .or(settings.runs_per_input)
                                .unwrap_or(1)
                                .max(1),
                            similarity_threshold: settings.similarity_threshold,
                        }),
                        Some(Err(message)) => broken.push(BrokenTest {
                            entity: entity.clone(),
                            dimension: dimension.clone(),
                            test_spec_id,
                            input_index,
                            input,
                            error: message.clone(),
                        }),
                        None => {}
                    }
                    input_index += 1;
                }
            }
        }
    }
    (plans, broken)
}

/// Create the tracker units for one planned test. Returns the ids that
/// must be executed: the single unit, or every run of a multi-run group.
fn create_units(tracker: &TestStateTracker, plan: &PlannedTest) -> DomainResult<Vec<String>> {
    let entity = &plan.entity;
    let dimension = plan.dimension.name.as_str();
    let spec_id = || TestUnitUpdate {
        test_spec_id: Some(plan.test_spec_id.clone()),
        ..Default::default()
    };

    if plan.runs <= 1 {
        let id = tracker.create_test(&entity.name, entity.kind, dimension, plan.input_index, plan.input.clone(), None)?;
        tracker.update_test(&id, spec_id())?;
        return Ok(vec![id]);
    }

    let parent = tracker.create_parent_test(
        &entity.name,
        entity.kind,
        dimension,
        plan.input_index,
        plan.input.clone(),
        plan.runs,
    )?;
    tracker.set_similarity_threshold(&parent, plan.similarity_threshold);
    tracker.update_test(&parent, spec_id())?;

    (0..plan.runs)
        .map(|run| {
            let id = tracker.create_test(
                &entity.name,
                entity.kind,
                dimension,
                plan.input_index,
                plan.input.clone(),
                Some(run),
            )?;
            tracker.update_test(&id, spec_id())?;
            Ok(id)
        })
        .collect()
}

/// Record a test that never reached the queue as failed.
fn mark_broken(tracker: &TestStateTracker, test: &BrokenTest) {
    let created = tracker
        .create_test(
            &test.entity.name,
            test.entity.kind,
            &test.dimension,
            test.input_index,
            test.input.clone(),
            None,
        )
        .and_then(|id| {
            tracker.update_test(
                &id,
                TestUnitUpdate {
                    test_spec_id: Some(test.test_spec_id.clone()),
                    ..TestUnitUpdate::failed(test.error.clone(), None)
                },
            )
        });
    if let Err(e) = created {
        error!(entity = %test.entity, dimension = %test.dimension, error = %e, "cannot record failed test");
    }
}

fn describe_selection(request: &RunRequest) -> String {
    let entities = if request.entities.is_empty() {
        "all entities".to_string()
    } else {
        request.entities.join(", ")
    };
    let dimensions = if request.dimensions.is_empty() {
        "all dimensions".to_string()
    } else {
        request.dimensions.join(", ")
    };
    format!("{entities} / {dimensions}")
}

/// Executes single units. Shared by every queued task of a run.
struct Executor {
    runner: Arc<dyn AgentRunner>,
    evaluator: CriteriaEvaluator,
    tracker: Arc<TestStateTracker>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Executor {
    #[instrument(skip(self, plan), fields(entity = %plan.entity, dimension = %plan.dimension.name))]
    async fn execute(&self, unit_id: String, plan: Arc<PlannedTest>) -> DomainResult<TestUnit> {
        self.tracker.update_test(&unit_id, TestUnitUpdate::running())?;
        let started = Instant::now();

        let request = InvocationRequest {
            entity: plan.entity.clone(),
            input: plan.input.clone(),
            test_id: unit_id.clone(),
        };
        let timeout = self.timeout;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

        let invoked = self
            .retry
            .execute(|attempt| {
                let request = request.clone();
                let runner = Arc::clone(&self.runner);
                async move {
                    debug!(attempt, "invoking entity");
                    match tokio::time::timeout(timeout, runner.invoke(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(DomainError::InvocationTimeout { timeout_ms }),
                    }
                }
            })
            .await;

        let attempted = match invoked {
            Ok(attempted) => attempted,
            Err(exhausted) => {
                warn!(attempts = exhausted.attempts, error = %exhausted.error, "invocation failed");
                self.fail(&unit_id, &exhausted.error, started)?;
                return Err(exhausted.error);
            }
        };
        let output = attempted.value;

        let verdict = match self
            .evaluator
            .evaluate(
                &plan.entity,
                &plan.dimension,
                &plan.test,
                &plan.input,
                std::slice::from_ref(&output.output),
            )
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(error = %e, "evaluation failed");
                self.fail(&unit_id, &e, started)?;
                return Err(e);
            }
        };

        let result = TestResult {
            success: verdict.success,
            score: verdict.score,
            output: Some(output.output),
            criteria: verdict.criteria,
            attempts: attempted.attempts,
            ..Default::default()
        };
        let resolved = self
            .tracker
            .update_test(&unit_id, TestUnitUpdate::completed(result, output.latency_ms))?;
        if let Some(parent) = resolved {
            info!(test_id = %parent.id, passed = parent.passed(), "multi-run test resolved");
        }

        self.tracker
            .get_test(&unit_id)
            .ok_or(DomainError::TestNotFound(unit_id))
    }

    fn fail(&self, unit_id: &str, error: &DomainError, started: Instant) -> DomainResult<()> {
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.tracker
            .update_test(unit_id, TestUnitUpdate::failed_with(error, Some(elapsed)))
            .map(|_| ())
    }
}
