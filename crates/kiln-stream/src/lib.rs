//! Kiln Stream
//!
//! Push-side observability for training runs:
//! - The wire event envelope (`StreamEvent`, `EventPayload`)
//! - Non-blocking fan-out with bounded per-subscriber queues
//!   (`StreamBroadcaster`)
//! - Fixed-interval heartbeats independent of training activity

pub mod broadcaster;
pub mod event;

pub use broadcaster::{
    BroadcasterConfig, DEFAULT_QUEUE_CAPACITY, HeartbeatHandle, StreamBroadcaster, Subscription,
};
pub use event::{
    CheckpointData, ErrorData, EventPayload, HeartbeatData, MetricData, StatusData, StreamEvent,
};
