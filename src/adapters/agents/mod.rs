//! Agent runner adapters.

pub mod command_runner;

pub use command_runner::CommandAgentRunner;
