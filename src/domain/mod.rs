//! Domain layer for the evalsmith harness
//!
//! This module contains the evaluation data model, domain errors and the
//! port traits that adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
