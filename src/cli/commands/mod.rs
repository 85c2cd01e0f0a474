//! Command handlers, one module per subcommand.

pub mod init;
pub mod run;
pub mod snapshots;
pub mod status;
