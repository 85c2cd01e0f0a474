//! Evalsmith CLI entry point.

use clap::Parser;

use evalsmith::cli::{commands, handle_error, Cli, Commands, ProjectContext};
use evalsmith::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let project = match ProjectContext::load(&cli.path) {
        Ok(project) => project,
        Err(err) => handle_error(err, cli.json),
    };

    let _logger = match LoggerImpl::init(&LogConfig::from_settings(
        &project.config.logging,
        &project.root,
    )) {
        Ok(logger) => logger,
        Err(err) => handle_error(err, cli.json),
    };

    let result = match cli.command {
        Commands::Init(args) => commands::init::execute(args, &project, cli.json).await,
        Commands::Run(args) => commands::run::execute(args, &project, cli.json).await,
        Commands::Status(args) => commands::status::execute(args, &project, cli.json).await,
        Commands::Snapshots(args) => commands::snapshots::execute(args, &project, cli.json).await,
    };

    if let Err(err) = result {
        handle_error(err, cli.json);
    }
}
