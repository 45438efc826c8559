//! Bookkeeping for live training loops.
//!
//! The registry is owned by a [`TrainingManager`](crate::manager::TrainingManager)
//! instance, never global. One entry per run with an active loop task;
//! the manager's monitor task removes the entry when the loop exits, so
//! presence here means "commands can reach a loop".

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::engine::{ControlState, LoopCommand};

/// Channel endpoints for one live loop.
pub struct RunHandle {
    control: watch::Sender<ControlState>,
    commands: mpsc::Sender<LoopCommand>,
    done: watch::Receiver<bool>,
    abort: Mutex<Option<AbortHandle>>,
}

impl RunHandle {
    #[must_use]
    pub fn new(
        control: watch::Sender<ControlState>,
        commands: mpsc::Sender<LoopCommand>,
        done: watch::Receiver<bool>,
    ) -> Self {
        Self { control, commands, done, abort: Mutex::new(None) }
    }
}

#[derive(Default)]
pub struct RunRegistry {
    active: RwLock<HashMap<String, RunHandle>>,
}

impl RunRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run's handle. Returns false if the run already has a
    /// live entry.
    pub fn register(&self, run_id: &str, handle: RunHandle) -> bool {
        let Ok(mut active) = self.active.write() else {
            warn!("run registry lock poisoned");
            return false;
        };
        if active.contains_key(run_id) {
            return false;
        }
        active.insert(run_id.to_string(), handle);
        debug!(run_id = %run_id, "registered training loop");
        true
    }

    /// Attach the loop task's abort handle after spawning it.
    pub fn set_abort(&self, run_id: &str, abort: AbortHandle) {
        if let Ok(active) = self.active.read() {
            if let Some(handle) = active.get(run_id) {
                if let Ok(mut slot) = handle.abort.lock() {
                    *slot = Some(abort);
                }
            }
        }
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.active.read().map(|active| active.contains_key(run_id)).unwrap_or(false)
    }

    /// Push a new control state to the run's loop. Returns false when the
    /// run has no live entry or the loop is no longer listening.
    pub fn send_control(&self, run_id: &str, state: ControlState) -> bool {
        let Ok(active) = self.active.read() else { return false };
        active.get(run_id).is_some_and(|handle| handle.control.send(state).is_ok())
    }

    /// Clone out the command sender so callers can await a send without
    /// holding the registry lock.
    pub fn commands(&self, run_id: &str) -> Option<mpsc::Sender<LoopCommand>> {
        let active = self.active.read().ok()?;
        active.get(run_id).map(|handle| handle.commands.clone())
    }

    /// Watch that flips to `true` when the run's loop task has exited.
    pub fn done_signal(&self, run_id: &str) -> Option<watch::Receiver<bool>> {
        let active = self.active.read().ok()?;
        active.get(run_id).map(|handle| handle.done.clone())
    }

    pub fn remove(&self, run_id: &str) {
        if let Ok(mut active) = self.active.write() {
            if active.remove(run_id).is_some() {
                debug!(run_id = %run_id, "removed training loop");
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.read().map(|active| active.len()).unwrap_or(0)
    }
}

impl Drop for RunRegistry {
    fn drop(&mut self) {
        // loops are cooperative but must not outlive their manager
        if let Ok(active) = self.active.read() {
            for handle in active.values() {
                if let Ok(slot) = handle.abort.lock() {
                    if let Some(abort) = slot.as_ref() {
                        abort.abort();
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for RunRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRegistry").field("active", &self.active_count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (RunHandle, watch::Receiver<ControlState>) {
        let (control_tx, control_rx) = watch::channel(ControlState::Running);
        let (command_tx, _command_rx) = mpsc::channel(4);
        let (_done_tx, done_rx) = watch::channel(false);
        (RunHandle::new(control_tx, command_tx, done_rx), control_rx)
    }

    #[test]
    fn test_register_rejects_live_duplicate() {
        let registry = RunRegistry::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();

        assert!(registry.register("run-a", first));
        assert!(!registry.register("run-a", second));
        assert_eq!(registry.active_count(), 1);

        registry.remove("run-a");
        assert!(!registry.contains("run-a"));
        let (third, _rx3) = handle();
        assert!(registry.register("run-a", third));
    }

    #[test]
    fn test_send_control_reaches_receiver() {
        let registry = RunRegistry::new();
        let (entry, rx) = handle();
        registry.register("run-a", entry);

        assert!(registry.send_control("run-a", ControlState::Paused));
        assert_eq!(*rx.borrow(), ControlState::Paused);

        assert!(!registry.send_control("ghost", ControlState::Paused));

        // loop side gone: send reports failure
        drop(rx);
        assert!(!registry.send_control("run-a", ControlState::Running));
    }

    #[test]
    fn test_command_sender_is_cloned_out() {
        let registry = RunRegistry::new();
        let (entry, _rx) = handle();
        registry.register("run-a", entry);

        assert!(registry.commands("run-a").is_some());
        assert!(registry.commands("ghost").is_none());
        assert!(registry.done_signal("run-a").is_some());
    }
}
