//! Common test utilities for integration tests
//!
//! Shared fixtures for building eval spec documents and wiring a runner to
//! the mock agent runner, mock judge and in-memory storage.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;

use evalsmith::adapters::dimensions::InMemoryDimensionSource;
use evalsmith::adapters::mock::{MockAgentRunner, MockLlmProvider};
use evalsmith::adapters::storage::InMemorySpecRepository;
use evalsmith::domain::models::{
    Config, DimensionDefinition, EntitySpec, EvalSpec, TestSpecification,
};
use evalsmith::domain::ports::LlmProvider;
use evalsmith::services::{DimensionProvider, RunnerContext, SpecStore, TestRunner};

pub const AGENT: &str = "RouterAgent";

/// Config with no retry delay and a short invocation timeout.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.execution.retry_delay_ms = 0;
    config.execution.timeout_ms = 500;
    config
}

/// A document with one agent named [`AGENT`] carrying the given tests.
pub fn document(tests: Vec<(&str, Vec<TestSpecification>)>) -> EvalSpec {
    let mut spec = EvalSpec::new("demo");
    let mut entity = EntitySpec::new("hash-a", json!({"description": "routes support tickets"}));
    for (dimension, tests) in tests {
        entity.test_specs.entry(dimension.to_string()).or_default().tests = tests;
    }
    spec.agents.insert(AGENT.to_string(), entity);
    spec
}

pub fn test_spec(id: &str, input: Value) -> TestSpecification {
    TestSpecification::new(id, input)
}

/// Mocks plus in-memory storage, wired the way the CLI wires real adapters.
pub struct Fixture {
    pub agents: Arc<MockAgentRunner>,
    pub llm: Arc<MockLlmProvider>,
    pub repository: Arc<InMemorySpecRepository>,
}

impl Fixture {
    pub fn new(spec: EvalSpec) -> Self {
        Self::with_agents(spec, MockAgentRunner::new())
    }

    pub fn with_agents(spec: EvalSpec, agents: MockAgentRunner) -> Self {
        Self {
            agents: Arc::new(agents),
            llm: Arc::new(MockLlmProvider::new()),
            repository: Arc::new(InMemorySpecRepository::with_document(spec)),
        }
    }

    pub fn runner(&self, config: Config) -> TestRunner {
        self.runner_with_dimensions(config, Vec::new())
    }

    pub fn runner_with_dimensions(
        &self,
        config: Config,
        definitions: Vec<DimensionDefinition>,
    ) -> TestRunner {
        self.build_runner(config, definitions, self.llm.clone())
    }

    /// A runner judging with `llm` instead of the mock judge.
    pub fn runner_with_llm(&self, config: Config, llm: Arc<dyn LlmProvider>) -> TestRunner {
        self.build_runner(config, Vec::new(), llm)
    }

    fn build_runner(
        &self,
        config: Config,
        definitions: Vec<DimensionDefinition>,
        llm: Arc<dyn LlmProvider>,
    ) -> TestRunner {
        let dimensions = Arc::new(DimensionProvider::new(
            Arc::new(InMemoryDimensionSource::new(definitions)),
            config.evaluation.default_strictness,
        ));
        TestRunner::new(RunnerContext::new(
            self.agents.clone(),
            llm,
            dimensions,
            config,
        ))
    }

    pub async fn store(&self) -> SpecStore {
        SpecStore::load_or_create(self.repository.clone(), "demo")
            .await
            .expect("load store")
    }
}

/// Setup test logging
#[allow(dead_code)]
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
