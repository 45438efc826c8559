//! Kiln Core
//!
//! Durable primitives for training-run orchestration:
//! - Run lifecycle records and the phase state machine (`Run`, `RunPhase`)
//! - Write-through atomic run-state persistence (`RunStore`)
//! - Append-only metric history with summaries and ETA (`MetricsRecorder`)
//! - Tagged checkpoint snapshots with resume tokens (`CheckpointStore`)

pub mod checkpoint;
pub mod error;
pub mod io;
pub mod layout;
pub mod metrics;
pub mod run;
pub mod state;

pub use checkpoint::{Checkpoint, CheckpointMeta, CheckpointStore, CheckpointTag, ResumeToken};
pub use error::{KilnError, KilnResult};
pub use layout::DataLayout;
pub use metrics::MetricsRecorder;
pub use run::{EtaEstimate, Metric, MetricsSummary, Run, RunPhase, TrainingConfig};
pub use state::{DEFAULT_LOG_TAIL, MAX_LOG_LINES, RunStore};
