//! Kiln Trainer
//!
//! The cooperative training loop and its orchestration:
//! - Pluggable step/batch seams (`StepProvider`, `BatchSource`)
//! - A deterministic synthetic baseline provider
//! - One loop task per run, controlled at iteration boundaries
//! - `TrainingManager`: the command surface over stores, loops and the
//!   event stream

pub mod baseline;
mod engine;
pub mod manager;
mod registry;
pub mod step;

pub use baseline::{BaselineProvider, RestoredState, ScriptedProvider, SyntheticBatches};
pub use manager::{BatchFactory, ProviderFactory, TrainingManager};
pub use step::{Batch, BatchSource, StepOutcome, StepProvider};
