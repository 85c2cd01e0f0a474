//! Implementation of the `evalsmith snapshots` command.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use crate::cli::output::{output, CommandOutput, TableFormatter};
use crate::cli::ProjectContext;
use crate::domain::ports::{SnapshotInfo, SpecRepository};

#[derive(Args, Debug)]
pub struct SnapshotsArgs {
    /// Show only the newest N snapshots
    #[arg(short, long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotsOutput {
    pub snapshots: Vec<SnapshotInfo>,
}

impl CommandOutput for SnapshotsOutput {
    fn to_human(&self) -> String {
        if self.snapshots.is_empty() {
            return "No snapshots yet.".to_string();
        }
        format!(
            "{}\n{} snapshot(s)",
            TableFormatter::new().format_snapshots(&self.snapshots),
            self.snapshots.len()
        )
    }
}

pub async fn execute(args: SnapshotsArgs, project: &ProjectContext, json_mode: bool) -> Result<()> {
    let mut snapshots = project
        .repository()
        .list_snapshots()
        .await
        .context("Failed to list snapshots")?;

    if let Some(limit) = args.limit {
        let skip = snapshots.len().saturating_sub(limit);
        snapshots.drain(..skip);
    }

    output(&SnapshotsOutput { snapshots }, json_mode);
    Ok(())
}
