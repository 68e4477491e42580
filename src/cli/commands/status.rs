use std::collections::BTreeSet;
use std::process::ExitCode;

use crate::backup::{reconcile, CheckpointStore};
use crate::cli::args::StatusArgs;
use crate::cli::commands::select_patterns;
use crate::config::model::RuntimeConfig;
use crate::error::Result;
use crate::host::VirshHost;
use crate::targets::expand_targets;
use crate::types::TargetId;

pub fn run_status_command(cfg: &RuntimeConfig, args: &StatusArgs) -> Result<ExitCode> {
    let host = VirshHost::new(cfg.connect.clone());
    let targets = expand_targets(select_patterns(&args.targets, &cfg.targets), &host)?;
    let live: BTreeSet<TargetId> = targets.iter().map(|t| t.id.clone()).collect();
    let store = CheckpointStore::new(&cfg.checkpoint);
    let state = reconcile(&store, &live, false)?;

    println!("checkpoint: {}", store.path().display());
    println!("backup dir: {}", cfg.backup_dir.display());
    println!("generations: {}", cfg.generations);
    if state.cycle_restarted {
        println!("cycle complete; the next run starts a new cycle");
    }
    if state.removed > 0 {
        println!(
            "backed up: {}/{} ({} removed since backup)",
            state.completed.len(),
            state.all.len(),
            state.removed
        );
    } else {
        println!("backed up: {}/{}", state.completed.len(), state.all.len());
    }
    let pending: Vec<&TargetId> = state.pending().collect();
    if pending.is_empty() {
        println!("pending: <none>");
    } else {
        println!("pending:");
        for id in pending {
            println!("  {}", id);
        }
    }
    Ok(ExitCode::SUCCESS)
}
