//! Requests exchanged with the agent runner and the test generator.

use serde::{Deserialize, Serialize};

use super::entity::EntityRef;

/// One invocation of an entity under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub entity: EntityRef,
    pub input: serde_json::Value,
    /// Tracker id of the unit this invocation belongs to.
    pub test_id: String,
}

/// Raw output of a successful invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationOutput {
    pub output: serde_json::Value,
    pub latency_ms: u64,
}

/// Request to generate test specifications for one entity and dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub entity: EntityRef,
    pub dimension: String,
    /// Dimension requirements text for the entity's kind.
    pub requirements: String,
    pub contract: serde_json::Value,
    pub test_count: u32,
    /// Runs per input the generated tests should request, if any.
    pub runs_per_input: Option<u32>,
}
