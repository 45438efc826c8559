use crate::error::{KilnError, KilnResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl RunPhase {
    /// Phases with no outgoing transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Error)
    }

    /// Whether the lifecycle state machine allows moving from `self` to `to`.
    ///
    /// Edges: `idle -> running`; `running -> paused | stopped | completed | error`;
    /// `paused -> running | stopped`. Terminal phases have no outgoing edges.
    #[must_use]
    pub fn can_transition(self, to: RunPhase) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Running)
                | (Self::Running, Self::Paused | Self::Stopped | Self::Completed | Self::Error)
                | (Self::Paused, Self::Running | Self::Stopped)
        )
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.pad(s)
    }
}

/// Per-run training configuration, as accepted by the start command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrainingConfig {
    pub model: String,
    pub total_epochs: u32,
    /// Steps per epoch.
    pub total_steps: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
    /// Save a `latest` checkpoint every N completed steps (global count).
    pub save_every_steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_checkpoint_id: Option<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model: "baseline".to_string(),
            total_epochs: 3,
            total_steps: 5,
            batch_size: 8,
            learning_rate: 0.01,
            save_every_steps: 2,
            resume_checkpoint_id: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> KilnResult<()> {
        if self.model.trim().is_empty() {
            return Err(KilnError::Validation("model is required".to_string()));
        }
        if self.total_epochs == 0 {
            return Err(KilnError::Validation("totalEpochs must be >= 1".to_string()));
        }
        if self.total_steps == 0 {
            return Err(KilnError::Validation("totalSteps must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(KilnError::Validation("batchSize must be >= 1".to_string()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(KilnError::Validation("learningRate must be > 0".to_string()));
        }
        if self.save_every_steps == 0 {
            return Err(KilnError::Validation("saveEverySteps must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Durable metadata record for a single training run.
///
/// `current_epoch`/`current_step` move lexicographically forward while the
/// run is `running`, are frozen while `paused`, and never change after a
/// terminal phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: String,
    pub model: String,
    pub phase: RunPhase,
    pub config: TrainingConfig,
    pub current_epoch: u32,
    pub current_step: u32,
    pub total_epochs: u32,
    pub total_steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_metric: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    #[must_use]
    pub fn new(run_id: impl Into<String>, config: TrainingConfig) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            model: config.model.clone(),
            phase: RunPhase::Idle,
            total_epochs: config.total_epochs,
            total_steps: config.total_steps,
            config,
            current_epoch: 0,
            current_step: 0,
            best_metric: None,
            last_checkpoint_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A single recorded step measurement. Append-only once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub run_id: String,
    /// 1-based epoch the step belongs to.
    pub epoch: u32,
    /// 1-based step within the epoch.
    pub step: u32,
    pub timestamp: DateTime<Utc>,
    pub loss: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
}

/// Rolling aggregate over a run's recorded metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub count: usize,
    pub min_loss: f64,
    pub max_loss: f64,
    pub avg_loss: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_accuracy: Option<f64>,
}

/// Completion estimate derived from the first and most recent metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtaEstimate {
    pub ms_per_epoch: f64,
    pub remaining_epochs: u32,
    pub eta_at: DateTime<Utc>,
}
