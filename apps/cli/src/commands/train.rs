//! Train command: start a run in-process and follow it to the end.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use kiln_core::{Run, RunPhase, TrainingConfig};
use kiln_stream::{EventPayload, StreamEvent};
use kiln_trainer::TrainingManager;

use crate::config::{StreamSettings, TrainDefaults};

/// Arguments for `kiln train`.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Run identifier (unique per data directory)
    #[arg(long)]
    pub run_id: String,

    /// Model name recorded on the run
    #[arg(long)]
    pub model: Option<String>,

    /// Number of epochs
    #[arg(long)]
    pub epochs: Option<u32>,

    /// Steps per epoch
    #[arg(long)]
    pub steps: Option<u32>,

    /// Batch size passed to the batch source
    #[arg(long)]
    pub batch_size: Option<u32>,

    /// Learning rate recorded with each metric
    #[arg(long = "lr")]
    pub learning_rate: Option<f64>,

    /// Save a latest checkpoint every N completed steps
    #[arg(long)]
    pub save_every: Option<u32>,

    /// Checkpoint id to restore weights and cursor from
    #[arg(long)]
    pub resume_from: Option<String>,

    /// Emit events and the final record as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(
    manager: &TrainingManager,
    args: TrainArgs,
    defaults: &TrainDefaults,
    stream: &StreamSettings,
) -> Result<()> {
    let config = merge_config(&args, defaults);
    let run_id = args.run_id.clone();

    // Subscribe before starting so no event is missed.
    let mut events = manager.subscribe("cli");
    let _heartbeat = stream
        .heartbeat_secs
        .filter(|&secs| secs > 0)
        .map(|secs| manager.start_heartbeat(Duration::from_secs(secs)));

    let run = manager.start(&run_id, config).await.context("Failed to start run")?;
    if !args.json {
        print_header(&run);
    }

    let mut joined = false;
    let mut stop_requested = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => render_event(&run_id, &event, args.json)?,
                None => break,
            },
            () = manager.join(&run_id), if !joined => {
                joined = true;
            }
            _ = tokio::signal::ctrl_c() => {
                if stop_requested {
                    // second interrupt: give up on graceful shutdown
                    std::process::exit(130);
                }
                stop_requested = true;
                if !args.json {
                    println!("  {}", "stop requested, finishing the in-flight step".yellow());
                }
                if let Err(e) = manager.stop(&run_id).await {
                    tracing::warn!(error = %e, "stop request rejected");
                }
            }
        }
        if joined {
            // give the pump a moment to flush the queue tail, then drain
            tokio::time::sleep(Duration::from_millis(50)).await;
            while let Some(event) = events.try_recv() {
                render_event(&run_id, &event, args.json)?;
            }
            break;
        }
    }

    let run = manager.status(&run_id)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_outcome(&run);
    }
    Ok(())
}

/// Flags win over the `[train]` config section, which wins over the
/// built-in defaults.
fn merge_config(args: &TrainArgs, defaults: &TrainDefaults) -> TrainingConfig {
    let base = TrainingConfig::default();
    TrainingConfig {
        model: args.model.clone().or_else(|| defaults.model.clone()).unwrap_or(base.model),
        total_epochs: args.epochs.or(defaults.epochs).unwrap_or(base.total_epochs),
        total_steps: args.steps.or(defaults.steps).unwrap_or(base.total_steps),
        batch_size: args.batch_size.or(defaults.batch_size).unwrap_or(base.batch_size),
        learning_rate: args.learning_rate.or(defaults.learning_rate).unwrap_or(base.learning_rate),
        save_every_steps: args.save_every.or(defaults.save_every).unwrap_or(base.save_every_steps),
        resume_checkpoint_id: args.resume_from.clone(),
    }
}

fn print_header(run: &Run) {
    println!();
    println!("{}", format!("Training {}", run.run_id).bold().cyan());
    println!(
        "  Model: {} | {} epochs x {} steps | batch {} | lr {}",
        run.model.cyan(),
        run.total_epochs,
        run.total_steps,
        run.config.batch_size,
        run.config.learning_rate
    );
    if let Some(ref checkpoint_id) = run.config.resume_checkpoint_id {
        println!("  Resuming from: {}", checkpoint_id.dimmed());
    }
    println!();
}

fn render_event(run_id: &str, event: &StreamEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match &event.payload {
        EventPayload::Metric(m) if m.run_id == run_id => {
            let accuracy = m.accuracy.map(|a| format!("  acc {a:.3}")).unwrap_or_default();
            println!("  epoch {:>3}  step {:>4}  loss {:.4}{}", m.epoch, m.step, m.loss, accuracy);
        }
        EventPayload::Checkpoint(c) => {
            println!("  {} {} checkpoint {}", "saved".green(), c.tag, c.checkpoint_id.dimmed());
        }
        // per-step running statuses are noise; transitions are worth a line
        EventPayload::Status(s) if s.run_id == run_id && s.phase != RunPhase::Running => {
            println!("  {} {}", "phase:".dimmed(), s.phase);
        }
        EventPayload::Error(e) => {
            println!("  {} {}", "error:".red(), e.message);
        }
        _ => {}
    }
    Ok(())
}

fn print_outcome(run: &Run) {
    println!();
    match run.phase {
        RunPhase::Completed => println!("{}", "Training complete".bold().green()),
        RunPhase::Stopped => println!("{}", "Training stopped".bold().yellow()),
        RunPhase::Error => {
            println!("{}", "Training failed".bold().red());
            if let Some(ref message) = run.error {
                println!("  {}", message.red());
            }
        }
        phase => println!("{}", format!("Run left in phase {phase}").bold().yellow()),
    }
    if let Some(best) = run.best_metric {
        println!("  Best loss: {}", format!("{best:.4}").cyan());
    }
    if let Some(ref checkpoint_id) = run.last_checkpoint_id {
        println!("  Checkpoint: {}", checkpoint_id.dimmed());
    }
    if let (Some(started), Some(finished)) = (run.started_at, run.finished_at) {
        let secs = (finished - started).num_milliseconds() as f64 / 1000.0;
        println!("  Duration: {}", format!("{secs:.1}s").dimmed());
    }
    println!();
}
