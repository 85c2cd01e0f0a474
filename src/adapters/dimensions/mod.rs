//! Dimension definition sources.

pub mod in_memory;
pub mod yaml_dimension_source;

pub use in_memory::InMemoryDimensionSource;
pub use yaml_dimension_source::YamlDimensionSource;
