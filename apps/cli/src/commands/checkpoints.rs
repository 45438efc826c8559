//! Checkpoint listing and deletion.

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use kiln_trainer::TrainingManager;

#[derive(Subcommand, Debug)]
pub enum CheckpointsCommand {
    /// List checkpoints, newest first
    List {
        /// Only checkpoints belonging to this run
        #[arg(long)]
        run: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a checkpoint by id
    Delete {
        /// Checkpoint id (ckpt-...)
        checkpoint_id: String,
    },
}

pub fn execute(manager: &TrainingManager, command: CheckpointsCommand) -> Result<()> {
    match command {
        CheckpointsCommand::List { run, json } => list(manager, run.as_deref(), json),
        CheckpointsCommand::Delete { checkpoint_id } => delete(manager, &checkpoint_id),
    }
}

fn list(manager: &TrainingManager, run_id: Option<&str>, json: bool) -> Result<()> {
    let metas = manager.checkpoints(run_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&metas)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Checkpoints ({})", metas.len()).bold().cyan());
    println!();
    if metas.is_empty() {
        println!("  {}", "No checkpoints found.".dimmed());
        println!();
        return Ok(());
    }

    println!("{:<44} {:<8} {:<16} {:<10} {}", "ID", "Tag", "Run", "Metric", "Created");
    println!("{}", "─".repeat(96));
    for meta in metas {
        println!(
            "{:<44} {:<8} {:<16} {:<10} {}",
            meta.id.cyan(),
            meta.tag,
            meta.run_id,
            meta.metric.map_or_else(|| "-".to_string(), |m| format!("{m:.4}")),
            meta.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }
    println!();
    Ok(())
}

fn delete(manager: &TrainingManager, checkpoint_id: &str) -> Result<()> {
    manager.delete_checkpoint(checkpoint_id)?;
    println!("{}", format!("Deleted checkpoint {checkpoint_id}").green());
    Ok(())
}
