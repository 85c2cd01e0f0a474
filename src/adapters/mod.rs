//! Infrastructure adapters for external systems.

pub mod agents;
pub mod dimensions;
pub mod llm;
pub mod mock;
pub mod storage;
