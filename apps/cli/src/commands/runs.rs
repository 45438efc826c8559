//! Run listing, inspection and deletion.

use anyhow::Result;
use colored::{ColoredString, Colorize};
use kiln_core::RunPhase;
use kiln_trainer::TrainingManager;

pub fn list(manager: &TrainingManager, json: bool) -> Result<()> {
    let runs = manager.list_runs()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Runs ({})", runs.len()).bold().cyan());
    println!();
    if runs.is_empty() {
        println!("  {}", "No runs in this data directory.".dimmed());
        println!("  {}", "Tip: start one with `kiln train --run-id my-run`.".dimmed());
        println!();
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:<14} {:<10} {:<12} {}",
        "ID", "Phase", "Progress", "Best", "Model", "Created"
    );
    println!("{}", "─".repeat(88));
    for run in runs {
        println!(
            "{:<20} {:<10} {:<14} {:<10} {:<12} {}",
            run.run_id.cyan(),
            phase_colored(run.phase),
            format!(
                "e{}/{} s{}/{}",
                run.current_epoch, run.total_epochs, run.current_step, run.total_steps
            ),
            run.best_metric.map_or_else(|| "-".to_string(), |b| format!("{b:.4}")),
            run.model.dimmed(),
            run.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }
    println!();
    Ok(())
}

pub fn status(manager: &TrainingManager, run_id: &str, json: bool) -> Result<()> {
    let run = manager.status(run_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!();
    println!("Run: {}", run.run_id.bold().cyan());
    println!("Model: {}", run.model);
    println!("Phase: {}", phase_colored(run.phase));
    println!(
        "Progress: epoch {}/{}, step {}/{}",
        run.current_epoch, run.total_epochs, run.current_step, run.total_steps
    );
    if let Some(best) = run.best_metric {
        println!("Best loss: {best:.4}");
    }
    if let Some(ref checkpoint_id) = run.last_checkpoint_id {
        println!("Last checkpoint: {checkpoint_id}");
    }
    if let Some(ref message) = run.error {
        println!("Error: {}", message.red());
    }
    println!("Created: {}", run.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(started) = run.started_at {
        println!("Started: {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(finished) = run.finished_at {
        println!("Finished: {}", finished.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();
    Ok(())
}

pub fn delete(manager: &TrainingManager, run_id: &str, delete_checkpoints: bool) -> Result<()> {
    manager.delete_run(run_id, delete_checkpoints)?;
    if delete_checkpoints {
        println!("{}", format!("Deleted run {run_id} and its checkpoints").green());
    } else {
        println!("{}", format!("Deleted run {run_id} (checkpoints kept)").green());
    }
    Ok(())
}

fn phase_colored(phase: RunPhase) -> ColoredString {
    match phase {
        RunPhase::Idle => "idle".normal(),
        RunPhase::Running => "running".cyan(),
        RunPhase::Paused => "paused".yellow(),
        RunPhase::Stopped => "stopped".dimmed(),
        RunPhase::Completed => "completed".green(),
        RunPhase::Error => "error".red(),
    }
}
