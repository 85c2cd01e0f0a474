//! Port trait definitions (Hexagonal Architecture)
//!
//! This module defines async trait interfaces that adapters must implement:
//! - AgentRunner: invokes an agent, team or flow with one input
//! - LlmProvider: judges criteria and generates test specifications
//! - SpecRepository: persists the eval spec document and its snapshots
//! - DimensionSource: loads dimension definitions
//!
//! These traits keep the runner and the aggregator independent of
//! frameworks, providers and storage formats.

pub mod agent_runner;
pub mod dimension_source;
pub mod llm_provider;
pub mod spec_repository;

pub use agent_runner::AgentRunner;
pub use dimension_source::DimensionSource;
pub use llm_provider::LlmProvider;
pub use spec_repository::{SnapshotInfo, SpecRepository};
