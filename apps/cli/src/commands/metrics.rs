//! Metric history, aggregates and run logs.

use anyhow::Result;
use colored::Colorize;
use kiln_trainer::TrainingManager;
use serde_json::json;

pub fn metrics(
    manager: &TrainingManager,
    run_id: &str,
    limit: Option<usize>,
    summary: bool,
    eta: bool,
    json_output: bool,
) -> Result<()> {
    let history = manager.history(run_id, limit)?;
    let summary_data = if summary { manager.summary(run_id)? } else { None };
    let eta_data = if eta { manager.eta(run_id)? } else { None };

    if json_output {
        let mut out = json!({ "history": history });
        if let Some(s) = &summary_data {
            out["summary"] = serde_json::to_value(s)?;
        }
        if let Some(e) = &eta_data {
            out["eta"] = serde_json::to_value(e)?;
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Metrics for {run_id} ({})", history.len()).bold().cyan());
    println!();
    if history.is_empty() {
        println!("  {}", "No metrics recorded yet.".dimmed());
    } else {
        println!(
            "{:<7} {:<6} {:<10} {:<10} {:<10} {}",
            "Epoch", "Step", "Loss", "Accuracy", "LR", "Recorded"
        );
        println!("{}", "─".repeat(64));
        for metric in &history {
            println!(
                "{:<7} {:<6} {:<10.4} {:<10} {:<10} {}",
                metric.epoch,
                metric.step,
                metric.loss,
                metric.accuracy.map_or_else(|| "-".to_string(), |a| format!("{a:.3}")),
                metric.learning_rate.map_or_else(|| "-".to_string(), |lr| lr.to_string()),
                metric.timestamp.format("%H:%M:%S").to_string().dimmed()
            );
        }
    }

    if summary {
        println!();
        match &summary_data {
            Some(s) => {
                println!("{}", "Summary".bold());
                println!("  Steps: {}", s.count);
                println!(
                    "  Loss: min {:.4}, avg {:.4}, max {:.4}",
                    s.min_loss, s.avg_loss, s.max_loss
                );
                if let Some(acc) = s.avg_accuracy {
                    println!("  Avg accuracy: {acc:.3}");
                }
            }
            None => println!("  {}", "No summary available.".dimmed()),
        }
    }

    if eta {
        println!();
        match &eta_data {
            Some(e) => {
                println!("{}", "ETA".bold());
                println!(
                    "  {:.1}s per epoch, {} epochs remaining",
                    e.ms_per_epoch / 1000.0,
                    e.remaining_epochs
                );
                println!("  Estimated finish: {}", e.eta_at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            None => println!("  {}", "Not enough data for an estimate.".dimmed()),
        }
    }
    println!();
    Ok(())
}

pub fn logs(manager: &TrainingManager, run_id: &str, limit: Option<usize>) -> Result<()> {
    let lines = manager.logs(run_id, limit)?;
    if lines.is_empty() {
        println!("{}", "No log lines for this run.".dimmed());
        return Ok(());
    }
    for line in lines {
        println!("{line}");
    }
    Ok(())
}
