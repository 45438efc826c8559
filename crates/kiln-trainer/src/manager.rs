//! Run orchestration: the command surface over stores, loops and stream.
//!
//! One [`TrainingManager`] per data directory. It owns the durable
//! stores, the broadcaster and the registry of live loops; commands
//! validate against the run record first, then talk to the loop through
//! its registered channels. Nothing here is global; two managers over
//! two data directories are fully independent.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::{
    Checkpoint, CheckpointMeta, CheckpointStore, CheckpointTag, DataLayout, EtaEstimate, KilnError,
    KilnResult, Metric, MetricsRecorder, MetricsSummary, ResumeToken, Run, RunPhase, RunStore,
    TrainingConfig,
};
use kiln_stream::{BroadcasterConfig, HeartbeatHandle, StreamBroadcaster, Subscription};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::baseline::{BaselineProvider, SyntheticBatches};
use crate::engine::{ControlState, LoopCommand, LoopContext, LoopEvent, run_training_loop};
use crate::registry::{RunHandle, RunRegistry};
use crate::step::{BatchSource, StepProvider};

/// Builds the step provider for a run at start time.
pub type ProviderFactory = Arc<dyn Fn(&Run) -> Box<dyn StepProvider> + Send + Sync>;

/// Builds the batch source for a run at start time.
pub type BatchFactory = Arc<dyn Fn(&Run) -> Box<dyn BatchSource> + Send + Sync>;

const EVENT_QUEUE_CAPACITY: usize = 256;
const COMMAND_QUEUE_CAPACITY: usize = 8;

pub struct TrainingManager {
    store: Arc<RunStore>,
    metrics: Arc<MetricsRecorder>,
    checkpoints: Arc<CheckpointStore>,
    broadcaster: Arc<StreamBroadcaster>,
    registry: Arc<RunRegistry>,
    provider_factory: ProviderFactory,
    batch_factory: BatchFactory,
    // serializes start() so the registry check and spawn are atomic
    start_lock: Mutex<()>,
}

impl TrainingManager {
    /// Open a manager over `layout`, loading all persisted runs, metrics
    /// and checkpoints. Records left `running` or `paused` by a dead
    /// process are loaded verbatim; commands against them report
    /// `Concurrency` until the run is deleted or resumed under a new id.
    pub fn open(layout: DataLayout) -> KilnResult<Self> {
        Ok(Self {
            store: Arc::new(RunStore::open(layout.clone())?),
            metrics: Arc::new(MetricsRecorder::open(layout.clone())?),
            checkpoints: Arc::new(CheckpointStore::open(layout)?),
            broadcaster: Arc::new(StreamBroadcaster::default()),
            registry: Arc::new(RunRegistry::new()),
            provider_factory: default_provider_factory(),
            batch_factory: default_batch_factory(),
            start_lock: Mutex::new(()),
        })
    }

    /// Replace the step-provider factory (the default builds a seeded
    /// [`BaselineProvider`] per run).
    #[must_use]
    pub fn with_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.provider_factory = factory;
        self
    }

    #[must_use]
    pub fn with_batch_factory(mut self, factory: BatchFactory) -> Self {
        self.batch_factory = factory;
        self
    }

    #[must_use]
    pub fn with_broadcaster_config(mut self, config: BroadcasterConfig) -> Self {
        self.broadcaster = Arc::new(StreamBroadcaster::new(config));
        self
    }

    /// Create an `idle` run record without starting a loop. `start` on
    /// the same id later picks the record up.
    pub fn create_run(&self, run_id: &str, config: TrainingConfig) -> KilnResult<Run> {
        self.store.create_run(run_id, config)
    }

    /// Start training: create (or adopt an `idle`) record, apply any
    /// resume checkpoint, move `idle -> running` and spawn the loop.
    ///
    /// Run ids are unique forever within a data dir. Restarting finished
    /// work means a new run id with `resume_checkpoint_id` pointing at
    /// the old run's checkpoint.
    pub async fn start(&self, run_id: &str, config: TrainingConfig) -> KilnResult<Run> {
        let _guard = self.start_lock.lock().await;
        config.validate()?;

        if self.registry.contains(run_id) {
            return Err(KilnError::concurrency("start", RunPhase::Running));
        }

        match self.store.get_run(run_id) {
            Err(KilnError::NotFound(_)) => {
                self.store.create_run(run_id, config.clone())?;
            }
            Ok(run) if run.phase == RunPhase::Idle => {
                // adopt the staged record under the provided config
                self.store.update_run(run_id, |r| {
                    r.config = config.clone();
                    r.model = config.model.clone();
                    r.total_epochs = config.total_epochs;
                    r.total_steps = config.total_steps;
                })?;
            }
            Ok(run) => return Err(KilnError::concurrency("start", run.phase)),
            Err(e) => return Err(e),
        }

        let resume = match &config.resume_checkpoint_id {
            Some(checkpoint_id) => Some(self.checkpoints.load(checkpoint_id)?),
            None => None,
        };
        let (start_epoch, start_step, completed_steps) = resume.as_ref().map_or((1, 0, 0), |c| {
            (c.resume.epoch, c.resume.step, steps_behind(&c.resume, config.total_steps))
        });

        let run = self.store.get_run(run_id)?;
        let mut provider = (self.provider_factory)(&run);
        let batches = (self.batch_factory)(&run);

        if let Some(checkpoint) = resume {
            let Checkpoint { id, weights, resume: token, .. } = checkpoint;
            provider
                .set_weights(weights)
                .map_err(|e| KilnError::Validation(format!("resume checkpoint {id}: {e}")))?;
            provider
                .set_optimizer_state(token.optimizer)
                .map_err(|e| KilnError::Validation(format!("resume checkpoint {id}: {e}")))?;
            self.store.append_log(
                run_id,
                &format!("resuming from checkpoint {id} (epoch {start_epoch}, step {start_step})"),
            )?;
        }

        let (control_tx, control_rx) = watch::channel(ControlState::Running);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (done_tx, done_rx) = watch::channel(false);

        if !self.registry.register(run_id, RunHandle::new(control_tx, command_tx, done_rx)) {
            return Err(KilnError::concurrency("start", RunPhase::Running));
        }
        let run = match self.store.transition(run_id, RunPhase::Running) {
            Ok(run) => run,
            Err(e) => {
                self.registry.remove(run_id);
                return Err(e);
            }
        };

        let ctx = LoopContext {
            run_id: run_id.to_string(),
            config: run.config.clone(),
            store: Arc::clone(&self.store),
            metrics: Arc::clone(&self.metrics),
            checkpoints: Arc::clone(&self.checkpoints),
            provider,
            batches,
            control: control_rx,
            commands: command_rx,
            events: event_tx,
            start_epoch,
            start_step,
            completed_steps,
        };

        self.spawn_pump(event_rx);
        let loop_task = tokio::spawn(run_training_loop(ctx));
        self.registry.set_abort(run_id, loop_task.abort_handle());
        self.spawn_monitor(run_id, loop_task, done_tx);

        self.broadcaster.broadcast_status(&run);
        info!(run_id = %run_id, model = %run.model, "run started");
        Ok(run)
    }

    /// Ask a running loop to pause at the next iteration boundary. The
    /// in-flight step completes and records its metric first.
    pub async fn pause(&self, run_id: &str) -> KilnResult<Run> {
        let current = self.store.get_run(run_id)?;
        if !self.registry.contains(run_id) {
            return Err(KilnError::concurrency("pause", current.phase));
        }
        let run = self
            .store
            .transition(run_id, RunPhase::Paused)
            .map_err(|e| command_error(e, "pause"))?;
        self.registry.send_control(run_id, ControlState::Paused);
        self.store.append_log(run_id, "training paused")?;
        self.broadcaster.broadcast_status(&run);
        info!(run_id = %run_id, "run paused");
        Ok(run)
    }

    /// Wake a paused loop.
    pub async fn resume(&self, run_id: &str) -> KilnResult<Run> {
        let current = self.store.get_run(run_id)?;
        if !self.registry.contains(run_id) {
            return Err(KilnError::concurrency("resume", current.phase));
        }
        let run = self
            .store
            .transition(run_id, RunPhase::Running)
            .map_err(|e| command_error(e, "resume"))?;
        self.registry.send_control(run_id, ControlState::Running);
        self.store.append_log(run_id, "training resumed")?;
        self.broadcaster.broadcast_status(&run);
        info!(run_id = %run_id, "run resumed");
        Ok(run)
    }

    /// Request a cooperative stop. The loop finishes in-flight work,
    /// writes a final `latest` checkpoint and transitions to `stopped`;
    /// the returned snapshot still shows the pre-stop phase. Use
    /// [`join`](Self::join) to wait for the loop to finish.
    pub async fn stop(&self, run_id: &str) -> KilnResult<Run> {
        let current = self.store.get_run(run_id)?;
        let live = current.phase == RunPhase::Running || current.phase == RunPhase::Paused;
        if !live || !self.registry.contains(run_id) {
            return Err(KilnError::concurrency("stop", current.phase));
        }
        self.registry.send_control(run_id, ControlState::Stopping);
        self.store.append_log(run_id, "stop requested")?;
        info!(run_id = %run_id, "stop requested");
        Ok(current)
    }

    /// Snapshot a checkpoint out of the live loop (default tag `manual`).
    /// Without a live loop there is no training context to snapshot, so
    /// idle and finished runs report `Concurrency`.
    pub async fn checkpoint(
        &self,
        run_id: &str,
        tag: Option<CheckpointTag>,
    ) -> KilnResult<Checkpoint> {
        let current = self.store.get_run(run_id)?;
        let Some(commands) = self.registry.commands(run_id) else {
            return Err(KilnError::concurrency("checkpoint", current.phase));
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let command =
            LoopCommand::SaveCheckpoint { tag: tag.unwrap_or(CheckpointTag::Manual), reply: reply_tx };
        if commands.send(command).await.is_err() {
            return Err(KilnError::concurrency("checkpoint", self.phase_of(run_id, current.phase)));
        }
        match reply_rx.await {
            Ok(result) => result,
            // loop exited before servicing the request
            Err(_) => Err(KilnError::concurrency("checkpoint", self.phase_of(run_id, current.phase))),
        }
    }

    pub fn status(&self, run_id: &str) -> KilnResult<Run> {
        self.store.get_run(run_id)
    }

    pub fn list_runs(&self) -> KilnResult<Vec<Run>> {
        self.store.list_runs()
    }

    pub fn logs(&self, run_id: &str, limit: Option<usize>) -> KilnResult<Vec<String>> {
        self.store.logs(run_id, limit)
    }

    pub fn history(&self, run_id: &str, limit: Option<usize>) -> KilnResult<Vec<Metric>> {
        self.store.get_run(run_id)?;
        self.metrics.history(run_id, limit)
    }

    pub fn latest_metric(&self, run_id: &str) -> KilnResult<Option<Metric>> {
        self.store.get_run(run_id)?;
        self.metrics.latest(run_id)
    }

    pub fn summary(&self, run_id: &str) -> KilnResult<Option<MetricsSummary>> {
        self.store.get_run(run_id)?;
        self.metrics.summary(run_id)
    }

    /// Completion estimate against the run's configured epoch target.
    pub fn eta(&self, run_id: &str) -> KilnResult<Option<EtaEstimate>> {
        let run = self.store.get_run(run_id)?;
        self.metrics.eta(run_id, run.total_epochs)
    }

    /// Checkpoint metadata, newest first; `None` lists all runs.
    pub fn checkpoints(&self, run_id: Option<&str>) -> KilnResult<Vec<CheckpointMeta>> {
        self.checkpoints.list(run_id)
    }

    pub fn load_checkpoint(&self, checkpoint_id: &str) -> KilnResult<Checkpoint> {
        self.checkpoints.load(checkpoint_id)
    }

    pub fn delete_checkpoint(&self, checkpoint_id: &str) -> KilnResult<()> {
        self.checkpoints.delete(checkpoint_id)
    }

    /// Delete a run's record, logs and metrics; refused while its loop is
    /// live. Checkpoints are global artifacts and only removed when
    /// `delete_checkpoints` is set.
    pub fn delete_run(&self, run_id: &str, delete_checkpoints: bool) -> KilnResult<()> {
        let run = self.store.get_run(run_id)?;
        if self.registry.contains(run_id) {
            return Err(KilnError::concurrency("delete", run.phase));
        }
        self.store.delete_run(run_id)?;
        self.metrics.clear_run(run_id)?;
        if delete_checkpoints {
            for meta in self.checkpoints.list(Some(run_id))? {
                if let Err(e) = self.checkpoints.delete(&meta.id) {
                    warn!(checkpoint_id = %meta.id, error = %e, "failed to delete checkpoint");
                }
            }
        }
        info!(run_id = %run_id, "run deleted");
        Ok(())
    }

    /// Subscribe to the push stream (status/metric/checkpoint/heartbeat/
    /// error events, bounded per-subscriber queue).
    #[must_use]
    pub fn subscribe(&self, subscriber_id: &str) -> Subscription {
        self.broadcaster.subscribe(subscriber_id)
    }

    /// Start fixed-interval heartbeat events; stops when the handle drops.
    #[must_use]
    pub fn start_heartbeat(&self, interval: Duration) -> HeartbeatHandle {
        self.broadcaster.start_heartbeat(interval)
    }

    /// Wait until the run's loop task has exited. Returns immediately for
    /// runs with no live loop.
    pub async fn join(&self, run_id: &str) {
        let Some(mut done) = self.registry.done_signal(run_id) else {
            return;
        };
        loop {
            if *done.borrow() {
                return;
            }
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    fn phase_of(&self, run_id: &str, fallback: RunPhase) -> RunPhase {
        self.store.get_run(run_id).map(|r| r.phase).unwrap_or(fallback)
    }

    fn spawn_pump(&self, mut events: mpsc::Receiver<LoopEvent>) {
        let broadcaster = Arc::clone(&self.broadcaster);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LoopEvent::Status(run) => broadcaster.broadcast_status(&run),
                    LoopEvent::Metric(metric) => broadcaster.broadcast_metric(&metric),
                    LoopEvent::Checkpoint { checkpoint_id, tag, metric } => {
                        broadcaster.broadcast_checkpoint(&checkpoint_id, tag, metric);
                    }
                    LoopEvent::Failed { message } => broadcaster.broadcast_error(&message),
                }
            }
        });
    }

    fn spawn_monitor(
        &self,
        run_id: &str,
        loop_task: tokio::task::JoinHandle<()>,
        done: watch::Sender<bool>,
    ) {
        let registry = Arc::clone(&self.registry);
        let store = Arc::clone(&self.store);
        let broadcaster = Arc::clone(&self.broadcaster);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            if let Err(join_err) = loop_task.await {
                if join_err.is_panic() {
                    warn!(run_id = %run_id, "training loop panicked");
                    match store.set_error(&run_id, "training loop panicked") {
                        Ok(run) => broadcaster.broadcast_status(&run),
                        Err(e) => {
                            warn!(run_id = %run_id, error = %e, "failed to record panic phase");
                        }
                    }
                    broadcaster.broadcast_error("training loop panicked");
                }
            }
            registry.remove(&run_id);
            let _ = done.send(true);
        });
    }
}

impl std::fmt::Debug for TrainingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingManager")
            .field("active_runs", &self.registry.active_count())
            .finish_non_exhaustive()
    }
}

/// Global completed-step count a resume token sits behind, used to keep
/// the periodic save cadence stable across resumes.
fn steps_behind(token: &ResumeToken, steps_per_epoch: u32) -> u64 {
    u64::from(token.epoch.saturating_sub(1)) * u64::from(steps_per_epoch) + u64::from(token.step)
}

/// Keep the phase but rename the rejected command so `pause` on a
/// completed run reads "phase completed does not allow pause" rather
/// than naming the internal transition.
fn command_error(e: KilnError, command: &str) -> KilnError {
    match e {
        KilnError::Concurrency { phase, .. } => {
            KilnError::Concurrency { command: command.to_string(), phase }
        }
        other => other,
    }
}

fn default_provider_factory() -> ProviderFactory {
    Arc::new(|run: &Run| {
        Box::new(BaselineProvider::new(seed_for(&run.run_id))) as Box<dyn StepProvider>
    })
}

fn default_batch_factory() -> BatchFactory {
    Arc::new(|_run: &Run| Box::new(SyntheticBatches::new()) as Box<dyn BatchSource>)
}

/// Stable per-run seed so the baseline provider is reproducible for a
/// given run id.
fn seed_for(run_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    run_id.hash(&mut hasher);
    hasher.finish()
}
