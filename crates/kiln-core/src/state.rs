//! Durable run-state store: the source of truth for run lifecycle.
//!
//! Every mutation is persisted atomically (write-to-temp, then rename)
//! before the in-memory record advances, so a crash mid-write never leaves
//! a corrupt record and a reopened store sees exactly the last fully
//! persisted state. The store never invents transitions on load: a record
//! that was `running` when the process died is loaded as `running`.

use crate::error::{KilnError, KilnResult};
use crate::io::{atomic_write_json, read_json};
use crate::layout::DataLayout;
use crate::run::{Run, RunPhase, TrainingConfig};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

/// Maximum log lines retained per run (oldest evicted first).
pub const MAX_LOG_LINES: usize = 2000;

/// Lines returned by [`RunStore::logs`] when no limit is given.
pub const DEFAULT_LOG_TAIL: usize = 200;

struct SlotState {
    run: Run,
    logs: VecDeque<String>,
}

/// One run's record plus log ring. The slot mutex is held across
/// mutate-and-persist, which is what serializes writers per run.
struct RunSlot {
    state: Mutex<SlotState>,
}

pub struct RunStore {
    layout: DataLayout,
    slots: RwLock<HashMap<String, Arc<RunSlot>>>,
}

impl RunStore {
    /// Open a store rooted at `layout`, loading every persisted run and its
    /// log ring verbatim.
    pub fn open(layout: DataLayout) -> KilnResult<Self> {
        layout.ensure()?;

        let mut slots = HashMap::new();
        let runs_dir = layout.runs_dir();
        if runs_dir.exists() {
            for entry in fs::read_dir(&runs_dir)? {
                let entry = entry?;
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let record_path = path.join("run.json");
                if !record_path.exists() {
                    continue;
                }
                let run: Run = match read_json(&record_path) {
                    Ok(run) => run,
                    Err(e) => {
                        warn!("skipping unreadable run record {}: {}", record_path.display(), e);
                        continue;
                    }
                };
                let logs_path = path.join("logs.json");
                let logs: VecDeque<String> = if logs_path.exists() {
                    match read_json::<Vec<String>>(&logs_path) {
                        Ok(lines) => lines.into(),
                        Err(e) => {
                            warn!("resetting unreadable log ring {}: {}", logs_path.display(), e);
                            VecDeque::new()
                        }
                    }
                } else {
                    VecDeque::new()
                };
                debug!(run_id = %run.run_id, phase = %run.phase, "loaded run record");
                slots.insert(
                    run.run_id.clone(),
                    Arc::new(RunSlot { state: Mutex::new(SlotState { run, logs }) }),
                );
            }
        }

        Ok(Self { layout, slots: RwLock::new(slots) })
    }

    #[must_use]
    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Create and persist a new `idle` run record.
    ///
    /// Rejects blank and already-used run ids; the record only enters the
    /// in-memory map once its first persist succeeded.
    pub fn create_run(&self, run_id: &str, config: TrainingConfig) -> KilnResult<Run> {
        if run_id.trim().is_empty() {
            return Err(KilnError::Validation("run id must not be blank".to_string()));
        }
        config.validate()?;

        let mut slots = self.slots.write().map_err(|_| lock_poisoned())?;
        if slots.contains_key(run_id) {
            return Err(KilnError::Validation(format!("run already exists: {run_id}")));
        }

        let run = Run::new(run_id, config);
        atomic_write_json(&self.layout.run_record_path(run_id), &run)?;
        debug!(run_id = %run_id, model = %run.model, "created run");

        slots.insert(
            run_id.to_string(),
            Arc::new(RunSlot {
                state: Mutex::new(SlotState { run: run.clone(), logs: VecDeque::new() }),
            }),
        );
        Ok(run)
    }

    fn slot(&self, run_id: &str) -> KilnResult<Arc<RunSlot>> {
        let slots = self.slots.read().map_err(|_| lock_poisoned())?;
        slots
            .get(run_id)
            .cloned()
            .ok_or_else(|| KilnError::NotFound(format!("run: {run_id}")))
    }

    /// Snapshot of a run's current record.
    pub fn get_run(&self, run_id: &str) -> KilnResult<Run> {
        let slot = self.slot(run_id)?;
        let state = slot.state.lock().map_err(|_| lock_poisoned())?;
        Ok(state.run.clone())
    }

    /// All run records, oldest created first.
    pub fn list_runs(&self) -> KilnResult<Vec<Run>> {
        let slots = self.slots.read().map_err(|_| lock_poisoned())?;
        let mut runs = Vec::with_capacity(slots.len());
        for slot in slots.values() {
            let state = slot.state.lock().map_err(|_| lock_poisoned())?;
            runs.push(state.run.clone());
        }
        drop(slots);
        runs.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }

    /// Apply a mutation to a run, bump `updated_at`, and persist atomically.
    ///
    /// The in-memory record only advances when the persist succeeds.
    pub fn update_run(&self, run_id: &str, f: impl FnOnce(&mut Run)) -> KilnResult<Run> {
        let slot = self.slot(run_id)?;
        let mut state = slot.state.lock().map_err(|_| lock_poisoned())?;

        let mut updated = state.run.clone();
        f(&mut updated);
        updated.updated_at = Utc::now();

        atomic_write_json(&self.layout.run_record_path(run_id), &updated)?;
        state.run = updated.clone();
        Ok(updated)
    }

    /// Move a run to `to`, validating the edge against the lifecycle state
    /// machine. Illegal transitions return `Concurrency` and leave the
    /// record untouched, both in memory and on disk.
    pub fn transition(&self, run_id: &str, to: RunPhase) -> KilnResult<Run> {
        self.transition_inner(run_id, to, None)
    }

    /// Move a run to `error`, attaching a human-readable message.
    pub fn set_error(&self, run_id: &str, message: &str) -> KilnResult<Run> {
        self.transition_inner(run_id, RunPhase::Error, Some(message.to_string()))
    }

    fn transition_inner(
        &self,
        run_id: &str,
        to: RunPhase,
        error: Option<String>,
    ) -> KilnResult<Run> {
        let slot = self.slot(run_id)?;
        let mut state = slot.state.lock().map_err(|_| lock_poisoned())?;

        let from = state.run.phase;
        if !from.can_transition(to) {
            return Err(KilnError::concurrency(&format!("transition to {to}"), from));
        }

        let mut updated = state.run.clone();
        updated.phase = to;
        updated.updated_at = Utc::now();
        if to == RunPhase::Running && updated.started_at.is_none() {
            updated.started_at = Some(updated.updated_at);
        }
        if to.is_terminal() {
            updated.finished_at = Some(updated.updated_at);
        }
        if let Some(message) = error {
            updated.error = Some(message);
        }

        atomic_write_json(&self.layout.run_record_path(run_id), &updated)?;
        debug!(run_id = %run_id, from = %from, to = %to, "phase transition");
        state.run = updated.clone();
        Ok(updated)
    }

    /// Append a timestamped line to the run's bounded log ring and persist
    /// the ring atomically.
    pub fn append_log(&self, run_id: &str, line: &str) -> KilnResult<()> {
        let slot = self.slot(run_id)?;
        let mut state = slot.state.lock().map_err(|_| lock_poisoned())?;

        let mut logs = state.logs.clone();
        logs.push_back(format!("[{}] {}", Utc::now().format("%H:%M:%S"), line));
        while logs.len() > MAX_LOG_LINES {
            logs.pop_front();
        }

        let lines: Vec<&String> = logs.iter().collect();
        atomic_write_json(&self.layout.run_logs_path(run_id), &lines)?;
        state.logs = logs;
        Ok(())
    }

    /// Tail of the run's log ring; `None` means the default of 200 lines.
    pub fn logs(&self, run_id: &str, limit: Option<usize>) -> KilnResult<Vec<String>> {
        let slot = self.slot(run_id)?;
        let state = slot.state.lock().map_err(|_| lock_poisoned())?;
        let limit = limit.unwrap_or(DEFAULT_LOG_TAIL);
        let skip = state.logs.len().saturating_sub(limit);
        Ok(state.logs.iter().skip(skip).cloned().collect())
    }

    /// Remove a run's record, logs and metrics file from memory and disk.
    ///
    /// Callers are responsible for refusing deletion while a training loop
    /// is active; checkpoints are global artifacts deleted separately.
    pub fn delete_run(&self, run_id: &str) -> KilnResult<()> {
        let mut slots = self.slots.write().map_err(|_| lock_poisoned())?;
        if slots.remove(run_id).is_none() {
            return Err(KilnError::NotFound(format!("run: {run_id}")));
        }
        drop(slots);

        let run_dir = self.layout.run_dir(run_id);
        if run_dir.exists() {
            fs::remove_dir_all(&run_dir)?;
        }
        debug!(run_id = %run_id, "deleted run");
        Ok(())
    }
}

fn lock_poisoned() -> KilnError {
    KilnError::Other(anyhow::anyhow!("run store lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> RunStore {
        RunStore::open(DataLayout::new(temp.path())).unwrap()
    }

    fn small_config() -> TrainingConfig {
        TrainingConfig { total_epochs: 2, total_steps: 3, ..TrainingConfig::default() }
    }

    #[test]
    fn test_create_get_and_list_runs() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        store.create_run("run-a", small_config()).unwrap();
        store.create_run("run-b", small_config()).unwrap();

        let run = store.get_run("run-a").unwrap();
        assert_eq!(run.phase, RunPhase::Idle);
        assert_eq!(run.current_epoch, 0);

        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "run-a");
        assert_eq!(runs[1].run_id, "run-b");
    }

    #[test]
    fn test_create_rejects_blank_and_duplicate_ids() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        assert!(matches!(
            store.create_run("  ", small_config()),
            Err(KilnError::Validation(_))
        ));

        store.create_run("run-a", small_config()).unwrap();
        assert!(matches!(
            store.create_run("run-a", small_config()),
            Err(KilnError::Validation(_))
        ));
    }

    #[test]
    fn test_get_unknown_run_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        assert!(matches!(store.get_run("ghost"), Err(KilnError::NotFound(_))));
    }

    #[test]
    fn test_update_persists_and_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let store = store(&temp);
            store.create_run("run-a", small_config()).unwrap();
            let before = store.get_run("run-a").unwrap().updated_at;
            let after = store
                .update_run("run-a", |run| {
                    run.current_epoch = 1;
                    run.current_step = 2;
                })
                .unwrap();
            assert!(after.updated_at >= before);
        }

        let reopened = store(&temp);
        let run = reopened.get_run("run-a").unwrap();
        assert_eq!(run.current_epoch, 1);
        assert_eq!(run.current_step, 2);
    }

    #[test]
    fn test_transition_validates_edges_and_keeps_phase_on_rejection() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        store.create_run("run-a", small_config()).unwrap();

        // pause while idle is not a legal edge
        let err = store.transition("run-a", RunPhase::Paused).unwrap_err();
        assert!(matches!(err, KilnError::Concurrency { .. }));
        assert_eq!(store.get_run("run-a").unwrap().phase, RunPhase::Idle);

        let run = store.transition("run-a", RunPhase::Running).unwrap();
        assert_eq!(run.phase, RunPhase::Running);
        assert!(run.started_at.is_some());

        let run = store.transition("run-a", RunPhase::Completed).unwrap();
        assert!(run.finished_at.is_some());

        // terminal phases have no outgoing edges
        assert!(store.transition("run-a", RunPhase::Running).is_err());
    }

    #[test]
    fn test_set_error_attaches_message_and_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let store = store(&temp);
            store.create_run("run-a", small_config()).unwrap();
            store.transition("run-a", RunPhase::Running).unwrap();
            store.set_error("run-a", "step failed: boom").unwrap();
        }

        let reopened = store(&temp);
        let run = reopened.get_run("run-a").unwrap();
        assert_eq!(run.phase, RunPhase::Error);
        assert_eq!(run.error.as_deref(), Some("step failed: boom"));
    }

    #[test]
    fn test_log_ring_caps_at_limit_and_tails() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        store.create_run("run-a", small_config()).unwrap();

        for i in 0..(MAX_LOG_LINES + 5) {
            store.append_log("run-a", &format!("line {i}")).unwrap();
        }

        let all = store.logs("run-a", Some(MAX_LOG_LINES * 2)).unwrap();
        assert_eq!(all.len(), MAX_LOG_LINES);
        assert!(all[0].ends_with("line 5"));
        assert!(all.last().unwrap().ends_with(&format!("line {}", MAX_LOG_LINES + 4)));

        let tail = store.logs("run-a", Some(3)).unwrap();
        assert_eq!(tail.len(), 3);

        let default_tail = store.logs("run-a", None).unwrap();
        assert_eq!(default_tail.len(), DEFAULT_LOG_TAIL);
    }

    #[test]
    fn test_logs_survive_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let store = store(&temp);
            store.create_run("run-a", small_config()).unwrap();
            store.append_log("run-a", "hello").unwrap();
        }

        let reopened = store(&temp);
        let logs = reopened.logs("run-a", None).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].ends_with("hello"));
    }

    #[test]
    fn test_reopen_ignores_leftover_temp_files() {
        let temp = TempDir::new().unwrap();
        let layout = DataLayout::new(temp.path());
        {
            let store = RunStore::open(layout.clone()).unwrap();
            store.create_run("run-a", small_config()).unwrap();
            store.transition("run-a", RunPhase::Running).unwrap();
        }

        // simulate a crash mid-write: a partial temp file next to the record
        let junk = layout.run_dir("run-a").join("run.tmp.deadbeef");
        fs::write(&junk, "{\"runId\": \"run-a\", \"phase\":").unwrap();

        let reopened = RunStore::open(layout).unwrap();
        let run = reopened.get_run("run-a").unwrap();
        assert_eq!(run.phase, RunPhase::Running);
    }

    #[test]
    fn test_delete_run_removes_record_and_files() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        store.create_run("run-a", small_config()).unwrap();
        store.append_log("run-a", "hello").unwrap();

        let run_dir = store.layout().run_dir("run-a");
        assert!(run_dir.exists());

        store.delete_run("run-a").unwrap();
        assert!(!run_dir.exists());
        assert!(matches!(store.get_run("run-a"), Err(KilnError::NotFound(_))));
        assert!(matches!(store.delete_run("run-a"), Err(KilnError::NotFound(_))));
    }
}
