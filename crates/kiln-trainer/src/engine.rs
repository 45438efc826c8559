//! The cooperative training loop.
//!
//! One loop task per active run. The loop owns its step provider and
//! batch source outright and talks to the durable stores synchronously:
//! metrics and run-record writes happen inline so their failure modes
//! are exact, while observability flows out as [`LoopEvent`]s over a
//! bounded channel that the manager pumps into the broadcaster.
//!
//! Control is cooperative. The manager flips a watch channel and the
//! loop obeys it at iteration boundaries: an in-flight step always
//! completes and records its metric before a pause or stop takes
//! effect. While parked on pause the loop keeps servicing checkpoint
//! commands and re-checks the control state on a bounded interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kiln_core::{
    Checkpoint, CheckpointStore, CheckpointTag, KilnError, KilnResult, Metric, MetricsRecorder,
    ResumeToken, Run, RunPhase, RunStore, TrainingConfig,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::step::{BatchSource, StepProvider};

/// How long a paused loop sleeps between control re-checks.
const PAUSE_POLL: Duration = Duration::from_millis(200);

/// Checkpoint writes get this many attempts before the loop gives up on
/// them. Giving up is not fatal; training continues.
const CHECKPOINT_SAVE_ATTEMPTS: u32 = 3;
const CHECKPOINT_RETRY_DELAY: Duration = Duration::from_millis(25);

/// What the manager is asking the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Paused,
    Stopping,
}

/// Observability events emitted by a loop, pumped into the broadcaster.
#[derive(Debug)]
pub enum LoopEvent {
    Status(Run),
    Metric(Metric),
    Checkpoint {
        checkpoint_id: String,
        tag: CheckpointTag,
        metric: Option<f64>,
    },
    Failed {
        message: String,
    },
}

/// Requests serviced by the loop at iteration boundaries and while
/// parked on pause.
pub enum LoopCommand {
    SaveCheckpoint {
        tag: CheckpointTag,
        reply: oneshot::Sender<KilnResult<Checkpoint>>,
    },
}

/// Everything a loop task needs, assembled by the manager.
pub(crate) struct LoopContext {
    pub run_id: String,
    pub config: TrainingConfig,
    pub store: Arc<RunStore>,
    pub metrics: Arc<MetricsRecorder>,
    pub checkpoints: Arc<CheckpointStore>,
    pub provider: Box<dyn StepProvider>,
    pub batches: Box<dyn BatchSource>,
    pub control: watch::Receiver<ControlState>,
    pub commands: mpsc::Receiver<LoopCommand>,
    pub events: mpsc::Sender<LoopEvent>,
    /// Cursor to resume from; `(1, 0)` for a fresh run.
    pub start_epoch: u32,
    pub start_step: u32,
    /// Global completed-step count behind the cursor, so the periodic
    /// save cadence survives a resume.
    pub completed_steps: u64,
}

/// Shared handles the checkpoint paths need; everything except the
/// channels and the cursor.
struct CommandCtx<'a> {
    run_id: &'a str,
    store: &'a RunStore,
    checkpoints: &'a CheckpointStore,
    events: &'a mpsc::Sender<LoopEvent>,
}

/// Entry point for a spawned loop task. Any fatal error moves the run
/// to the `error` phase with the message attached.
pub(crate) async fn run_training_loop(ctx: LoopContext) {
    let run_id = ctx.run_id.clone();
    let store = Arc::clone(&ctx.store);
    let events = ctx.events.clone();

    if let Err(e) = drive(ctx).await {
        let message = e.to_string();
        error!(run_id = %run_id, error = %message, "training loop failed");
        log_line(&store, &run_id, &format!("fatal: {message}"));
        match store.set_error(&run_id, &message) {
            Ok(run) => emit(&events, LoopEvent::Status(run)),
            Err(persist) => {
                error!(run_id = %run_id, error = %persist, "failed to record error phase");
            }
        }
        emit(&events, LoopEvent::Failed { message });
    }
}

async fn drive(ctx: LoopContext) -> KilnResult<()> {
    let LoopContext {
        run_id,
        config,
        store,
        metrics,
        checkpoints,
        mut provider,
        mut batches,
        mut control,
        mut commands,
        events,
        start_epoch,
        start_step,
        completed_steps: completed_seed,
    } = ctx;

    let total_epochs = config.total_epochs;
    let total_steps = config.total_steps;
    let save_every = u64::from(config.save_every_steps);

    // Normalize a resume cursor that sits exactly on an epoch boundary.
    let mut epoch = start_epoch.max(1);
    let mut step = start_step;
    if step >= total_steps {
        epoch += 1;
        step = 0;
    }
    let mut completed_steps = completed_seed;
    let mut last_loss: Option<f64> = None;

    let cx = CommandCtx {
        run_id: &run_id,
        store: &store,
        checkpoints: &checkpoints,
        events: &events,
    };

    info!(run_id = %run_id, epoch, step, "training loop started");
    log_line(&store, &run_id, &format!("training started at epoch {epoch}, step {}", step + 1));

    loop {
        // Service checkpoint requests that arrived since the last boundary.
        while let Ok(cmd) = commands.try_recv() {
            handle_command(&cx, provider.as_ref(), epoch, step, last_loss, cmd).await;
        }

        // Control first: a pause or stop that lands on the final boundary
        // still wins over completion.
        let state = *control.borrow();
        match state {
            ControlState::Stopping => {
                return finish_stopped(&cx, provider.as_ref(), epoch, step, last_loss, completed_steps)
                    .await;
            }
            ControlState::Paused => {
                let resumed =
                    park_while_paused(&mut control, &mut commands, &cx, provider.as_ref(), epoch, step, last_loss)
                        .await;
                if resumed == ControlState::Stopping {
                    return finish_stopped(
                        &cx,
                        provider.as_ref(),
                        epoch,
                        step,
                        last_loss,
                        completed_steps,
                    )
                    .await;
                }
                continue;
            }
            ControlState::Running => {}
        }

        if epoch > total_epochs {
            let run = store.transition(&run_id, RunPhase::Completed)?;
            log_line(&store, &run_id, "training completed");
            info!(run_id = %run_id, steps = completed_steps, "run completed");
            emit(&events, LoopEvent::Status(run));
            return Ok(());
        }

        // One step. Collaborator failures abort the run.
        let batch = batches
            .next_batch(epoch, step + 1, config.batch_size)
            .await
            .map_err(|e| KilnError::Step(format!("batch source failed: {e}")))?;
        let outcome = provider.step(&batch).await.map_err(|e| KilnError::Step(e.to_string()))?;

        step += 1;
        completed_steps += 1;
        last_loss = Some(outcome.loss);

        // Metric append and run-record update are required persistence;
        // either failing is fatal to the run.
        let metric = Metric {
            run_id: run_id.clone(),
            epoch,
            step,
            timestamp: Utc::now(),
            loss: outcome.loss,
            val_loss: None,
            accuracy: outcome.accuracy,
            learning_rate: Some(config.learning_rate),
        };
        metrics.record(metric.clone())?;

        let run = store.update_run(&run_id, |r| {
            r.current_epoch = epoch;
            r.current_step = step;
        })?;

        debug!(run_id = %run_id, epoch, step, loss = outcome.loss, "step complete");
        emit(&events, LoopEvent::Metric(metric));
        emit(&events, LoopEvent::Status(run));

        // Epoch boundary and periodic save are mutually exclusive within
        // one iteration: a boundary only considers a best checkpoint.
        if step == total_steps {
            let run = store.get_run(&run_id)?;
            if run.best_metric.is_none_or(|best| outcome.loss < best) {
                save_or_log(&cx, provider.as_ref(), CheckpointTag::Best, epoch, step, Some(outcome.loss))
                    .await;
            }
            log_line(&store, &run_id, &format!("epoch {epoch} complete (loss {:.4})", outcome.loss));
            epoch += 1;
            step = 0;
        } else if completed_steps % save_every == 0 {
            save_or_log(&cx, provider.as_ref(), CheckpointTag::Latest, epoch, step, Some(outcome.loss))
                .await;
        }
    }
}

/// Wait until the control state leaves `Paused`, servicing checkpoint
/// commands while parked. Returns the state that ended the wait.
async fn park_while_paused(
    control: &mut watch::Receiver<ControlState>,
    commands: &mut mpsc::Receiver<LoopCommand>,
    cx: &CommandCtx<'_>,
    provider: &dyn StepProvider,
    epoch: u32,
    step: u32,
    last_loss: Option<f64>,
) -> ControlState {
    info!(run_id = %cx.run_id, epoch, step, "loop parked on pause");
    loop {
        let state = *control.borrow();
        if state != ControlState::Paused {
            return state;
        }
        tokio::select! {
            changed = control.changed() => {
                if changed.is_err() {
                    // control side went away; shut down cleanly
                    return ControlState::Stopping;
                }
            }
            cmd = commands.recv() => {
                if let Some(cmd) = cmd {
                    handle_command(cx, provider, epoch, step, last_loss, cmd).await;
                }
            }
            () = tokio::time::sleep(PAUSE_POLL) => {}
        }
    }
}

async fn handle_command(
    cx: &CommandCtx<'_>,
    provider: &dyn StepProvider,
    epoch: u32,
    step: u32,
    last_loss: Option<f64>,
    cmd: LoopCommand,
) {
    match cmd {
        LoopCommand::SaveCheckpoint { tag, reply } => {
            let result = persist_checkpoint(cx, provider, tag, epoch, step, last_loss).await;
            if let Err(e) = &result {
                log_line(cx.store, cx.run_id, &format!("checkpoint write failed ({tag}): {e}"));
            }
            // a dropped reply just means the requester stopped waiting
            let _ = reply.send(result);
        }
    }
}

/// Save a checkpoint; on failure log and carry on. Checkpoint loss is
/// never fatal to a run.
async fn save_or_log(
    cx: &CommandCtx<'_>,
    provider: &dyn StepProvider,
    tag: CheckpointTag,
    epoch: u32,
    step: u32,
    metric: Option<f64>,
) {
    if let Err(e) = persist_checkpoint(cx, provider, tag, epoch, step, metric).await {
        warn!(run_id = %cx.run_id, tag = %tag, error = %e, "checkpoint save failed");
        log_line(cx.store, cx.run_id, &format!("checkpoint write failed ({tag}): {e}"));
    }
}

/// Snapshot the provider, write the checkpoint with bounded retries, and
/// update the run record's checkpoint bookkeeping.
async fn persist_checkpoint(
    cx: &CommandCtx<'_>,
    provider: &dyn StepProvider,
    tag: CheckpointTag,
    epoch: u32,
    step: u32,
    metric: Option<f64>,
) -> KilnResult<Checkpoint> {
    let checkpoint = Checkpoint::new(
        cx.run_id,
        provider.weights(),
        ResumeToken { epoch, step, optimizer: provider.optimizer_state() },
        tag,
        metric,
    );

    save_with_retry(cx.checkpoints, &checkpoint).await?;

    cx.store.update_run(cx.run_id, |run| {
        run.last_checkpoint_id = Some(checkpoint.id.clone());
        if tag == CheckpointTag::Best {
            if let Some(loss) = metric {
                if run.best_metric.is_none_or(|best| loss < best) {
                    run.best_metric = Some(loss);
                }
            }
        }
    })?;

    log_line(
        cx.store,
        cx.run_id,
        &format!("saved {tag} checkpoint {} (epoch {epoch}, step {step})", checkpoint.id),
    );
    emit(
        cx.events,
        LoopEvent::Checkpoint { checkpoint_id: checkpoint.id.clone(), tag, metric },
    );
    Ok(checkpoint)
}

async fn save_with_retry(store: &CheckpointStore, checkpoint: &Checkpoint) -> KilnResult<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.save(checkpoint) {
            Ok(_) => return Ok(()),
            Err(e) if attempt < CHECKPOINT_SAVE_ATTEMPTS => {
                warn!(
                    checkpoint_id = %checkpoint.id,
                    attempt,
                    error = %e,
                    "checkpoint save attempt failed, retrying"
                );
                tokio::time::sleep(CHECKPOINT_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Graceful stop: one final `latest` checkpoint (if any step completed),
/// then the `stopped` transition.
async fn finish_stopped(
    cx: &CommandCtx<'_>,
    provider: &dyn StepProvider,
    epoch: u32,
    step: u32,
    last_loss: Option<f64>,
    completed_steps: u64,
) -> KilnResult<()> {
    if completed_steps > 0 {
        save_or_log(cx, provider, CheckpointTag::Latest, epoch, step, last_loss).await;
    }
    let run = cx.store.transition(cx.run_id, RunPhase::Stopped)?;
    log_line(cx.store, cx.run_id, "training stopped");
    info!(run_id = %cx.run_id, epoch, step, "run stopped");
    emit(cx.events, LoopEvent::Status(run));
    Ok(())
}

fn emit(events: &mpsc::Sender<LoopEvent>, event: LoopEvent) {
    if let Err(e) = events.try_send(event) {
        debug!("loop event dropped: {e}");
    }
}

fn log_line(store: &RunStore, run_id: &str, line: &str) {
    if let Err(e) = store.append_log(run_id, line) {
        warn!(run_id = %run_id, error = %e, "failed to append run log");
    }
}
