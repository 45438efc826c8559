//! Event envelope pushed to stream subscribers.
//!
//! Wire shape is `{ "type": ..., "data": ..., "timestamp": ... }` with
//! snake_case type names and camelCase data fields, ready for an external
//! push transport (SSE, WebSocket) to relay as-is.

use chrono::{DateTime, Utc};
use kiln_core::{CheckpointTag, Metric, Run, RunPhase};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Status(StatusData),
    Metric(MetricData),
    Checkpoint(CheckpointData),
    Heartbeat(HeartbeatData),
    Error(ErrorData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub run_id: String,
    pub phase: RunPhase,
    pub current_epoch: u32,
    pub current_step: u32,
    pub total_epochs: u32,
    pub total_steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_metric: Option<f64>,
}

impl From<&Run> for StatusData {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id.clone(),
            phase: run.phase,
            current_epoch: run.current_epoch,
            current_step: run.current_step,
            total_epochs: run.total_epochs,
            total_steps: run.total_steps,
            best_metric: run.best_metric,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricData {
    pub run_id: String,
    pub epoch: u32,
    pub step: u32,
    pub loss: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
}

impl From<&Metric> for MetricData {
    fn from(metric: &Metric) -> Self {
        Self {
            run_id: metric.run_id.clone(),
            epoch: metric.epoch,
            step: metric.step,
            loss: metric.loss,
            val_loss: metric.val_loss,
            accuracy: metric.accuracy,
            learning_rate: metric.learning_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointData {
    pub checkpoint_id: String,
    pub tag: CheckpointTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    fn wrap(payload: EventPayload) -> Self {
        Self { payload, timestamp: Utc::now() }
    }

    #[must_use]
    pub fn status(run: &Run) -> Self {
        Self::wrap(EventPayload::Status(run.into()))
    }

    #[must_use]
    pub fn metric(metric: &Metric) -> Self {
        Self::wrap(EventPayload::Metric(metric.into()))
    }

    #[must_use]
    pub fn checkpoint(checkpoint_id: &str, tag: CheckpointTag, metric: Option<f64>) -> Self {
        Self::wrap(EventPayload::Checkpoint(CheckpointData {
            checkpoint_id: checkpoint_id.to_string(),
            tag,
            metric,
        }))
    }

    #[must_use]
    pub fn heartbeat() -> Self {
        let now = Utc::now();
        Self {
            payload: EventPayload::Heartbeat(HeartbeatData { timestamp: now }),
            timestamp: now,
        }
    }

    #[must_use]
    pub fn error(message: &str) -> Self {
        let now = Utc::now();
        Self {
            payload: EventPayload::Error(ErrorData { message: message.to_string(), timestamp: now }),
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::TrainingConfig;

    #[test]
    fn test_status_envelope_shape() {
        let run = Run::new("run-1", TrainingConfig::default());
        let event = StreamEvent::status(&run);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "status");
        assert_eq!(value["data"]["runId"], "run-1");
        assert_eq!(value["data"]["phase"], "idle");
        assert!(value["data"]["totalSteps"].is_number());
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn test_metric_envelope_drops_absent_optionals() {
        let metric = Metric {
            run_id: "run-1".to_string(),
            epoch: 1,
            step: 2,
            timestamp: Utc::now(),
            loss: 0.5,
            val_loss: None,
            accuracy: None,
            learning_rate: Some(0.01),
        };
        let value = serde_json::to_value(StreamEvent::metric(&metric)).unwrap();

        assert_eq!(value["type"], "metric");
        assert_eq!(value["data"]["step"], 2);
        assert!(value["data"].get("valLoss").is_none());
        assert!(value["data"].get("accuracy").is_none());
        assert_eq!(value["data"]["learningRate"], 0.01);
        // envelope timestamp, not a per-metric one inside data
        assert!(value["data"].get("timestamp").is_none());
    }

    #[test]
    fn test_checkpoint_and_heartbeat_envelopes() {
        let value =
            serde_json::to_value(StreamEvent::checkpoint("ckpt-1", CheckpointTag::Best, Some(0.4)))
                .unwrap();
        assert_eq!(value["type"], "checkpoint");
        assert_eq!(value["data"]["checkpointId"], "ckpt-1");
        assert_eq!(value["data"]["tag"], "best");

        let value = serde_json::to_value(StreamEvent::heartbeat()).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert!(value["data"].get("timestamp").is_some());
    }

    #[test]
    fn test_event_round_trips() {
        let event = StreamEvent::error("boom");
        let json = serde_json::to_string(&event).unwrap();
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
