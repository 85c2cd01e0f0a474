//! Specification document storage.

pub mod in_memory;
pub mod json_spec_repository;

pub use in_memory::InMemorySpecRepository;
pub use json_spec_repository::{JsonSpecRepository, SnapshotRetention};
