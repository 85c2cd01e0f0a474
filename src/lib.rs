//! Evalsmith - evaluation harness for AI agents, teams and flows
//!
//! Evalsmith runs dimension-based test suites (accuracy, safety,
//! consistency, ...) against agents under a global concurrency bound, judges
//! the outputs with an LLM, and records the results in a versioned eval spec
//! document that tracks performance trends over time.
//!
//! # Architecture
//!
//! This crate follows Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): Eval spec model, test units, errors and ports
//! - **Service Layer** (`services`): Runner, task queue, state tracker, aggregation
//! - **Adapters** (`adapters`): Agent runners, LLM providers, storage, dimension sources
//! - **Infrastructure Layer** (`infrastructure`): Configuration and logging
//! - **CLI Layer** (`cli`): Command-line interface
//!
//! # Example
//!
//! ```ignore
//! use evalsmith::services::{RunRequest, RunnerContext, SpecStore, TestRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut store = SpecStore::load_or_create(repository, "my-project").await?;
//!     let runner = TestRunner::new(RunnerContext::new(agents, llm, dimensions, config));
//!     let summary = runner.run(&mut store, RunRequest::default()).await?;
//!     println!("{} of {} passed", summary.passed, summary.total);
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::models::{
    Config, EntityKind, EntityRef, EvalSpec, TestResult, TestSpecification, TestStatus, TestUnit,
};
pub use domain::ports::{AgentRunner, DimensionSource, LlmProvider, SpecRepository};
pub use domain::{DomainError, DomainResult};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{RunRequest, RunSummary, RunnerContext, SpecStore, TestRunner};
