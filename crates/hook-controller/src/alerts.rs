//! Projection of dispatch outcomes toward the alert console.
//!
//! The pipeline publishes a small, console-agnostic record after every
//! successful agent call; the console crate owns severity derivation and
//! the operator-facing shape. A [`NullAlertSink`] stands in when no console
//! is wired up.

use chrono::{DateTime, Utc};

use crate::crd::EventType;

/// What the pipeline knows about an alert at dispatch time.
#[derive(Clone, Debug)]
pub struct AlertProjection {
    pub hook_name: String,
    pub hook_namespace: String,
    pub event_type: EventType,
    pub resource_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub message: String,
    /// Effective agent reference, `namespace/name`.
    pub agent_ref: String,
    /// Session id of the most recent successful agent call.
    pub session_id: Option<String>,
}

/// Capability set for receiving alert projections. Implementations must not
/// block: the pipeline publishes from its event loop.
pub trait AlertSink: Send + Sync {
    fn publish(&self, alert: AlertProjection);
}

/// Sink that drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullAlertSink;

impl AlertSink for NullAlertSink {
    fn publish(&self, _alert: AlertProjection) {}
}
