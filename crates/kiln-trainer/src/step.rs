//! Pluggable seams for the training loop.
//!
//! The loop drives two collaborators it knows nothing about: a
//! [`BatchSource`] that materializes training batches on demand, and a
//! [`StepProvider`] that consumes one batch and reports the resulting
//! loss. Both are async so real providers can do I/O; the loop itself
//! only suspends between steps, never inside one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One materialized training batch.
///
/// `epoch` and `step` are 1-based and identify where in the schedule the
/// batch was requested; `data` is whatever payload the source produces
/// and is passed through to the step provider untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub epoch: u32,
    pub step: u32,
    pub size: u32,
    pub data: serde_json::Value,
}

/// Result of a single training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub loss: f64,
    pub accuracy: Option<f64>,
}

/// Produces batches for the loop. Implementations decide what a batch
/// contains; the loop only threads the schedule position through.
#[async_trait]
pub trait BatchSource: Send {
    async fn next_batch(&mut self, epoch: u32, step: u32, size: u32) -> anyhow::Result<Batch>;
}

/// The model seam. The loop calls `step` once per scheduled step and
/// snapshots `weights`/`optimizer_state` whenever it writes a
/// checkpoint; `set_weights`/`set_optimizer_state` restore those
/// snapshots when a run resumes from a checkpoint.
#[async_trait]
pub trait StepProvider: Send + Sync {
    /// Run one training step against `batch`. An `Err` here aborts the
    /// run and moves it to the error phase.
    async fn step(&mut self, batch: &Batch) -> anyhow::Result<StepOutcome>;

    /// Serializable snapshot of the current model weights.
    fn weights(&self) -> serde_json::Value;

    /// Restore weights from a checkpoint snapshot.
    fn set_weights(&mut self, weights: serde_json::Value) -> anyhow::Result<()>;

    /// Serializable snapshot of the optimizer state.
    fn optimizer_state(&self) -> serde_json::Value;

    /// Restore optimizer state from a checkpoint snapshot.
    fn set_optimizer_state(&mut self, state: serde_json::Value) -> anyhow::Result<()>;
}
