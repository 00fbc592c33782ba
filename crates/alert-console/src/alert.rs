//! The operator-facing alert shape and the stream protocol.

use chrono::{DateTime, Utc};
use hook_controller::alerts::AlertProjection;
use hook_controller::{EventStatus, EventType};
use serde::{Deserialize, Serialize};

/// Severity buckets derived from the event type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
}

impl Severity {
    pub fn for_event_type(event_type: EventType) -> Self {
        match event_type {
            EventType::OomKill => Severity::Critical,
            EventType::PodRestart | EventType::ProbeFailed => Severity::High,
            EventType::PodPending => Severity::Medium,
        }
    }
}

/// A live alert: the console's view of one active event plus the outcome of
/// its most recent agent call.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Stable id: `namespace-hookName-eventType-resourceName`.
    pub id: String,
    pub hook_name: String,
    pub hook_namespace: String,
    pub event_type: EventType,
    pub resource_name: String,
    pub severity: Severity,
    pub status: EventStatus,
    pub message: String,
    pub agent_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Alert {
    pub fn from_projection(projection: AlertProjection) -> Self {
        let id = alert_id(
            &projection.hook_namespace,
            &projection.hook_name,
            projection.event_type,
            &projection.resource_name,
        );
        Alert {
            id,
            hook_name: projection.hook_name,
            hook_namespace: projection.hook_namespace,
            event_type: projection.event_type,
            resource_name: projection.resource_name,
            severity: Severity::for_event_type(projection.event_type),
            status: EventStatus::Firing,
            message: projection.message,
            agent_ref: projection.agent_ref,
            session_id: projection.session_id,
            first_seen: projection.first_seen,
            last_seen: projection.last_seen,
        }
    }
}

pub fn alert_id(
    hook_namespace: &str,
    hook_name: &str,
    event_type: EventType,
    resource_name: &str,
) -> String {
    format!(
        "{}-{}-{}-{}",
        hook_namespace, hook_name, event_type, resource_name
    )
}

/// Messages sent to stream subscribers: one snapshot on connect, then
/// incremental updates.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Snapshot { alerts: Vec<Alert> },
    AlertUpserted { alert: Alert },
    AlertResolved { id: String },
    Subscribed,
    Pong,
}

impl StreamMessage {
    /// SSE event name for this message.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Snapshot { .. } => "snapshot",
            StreamMessage::AlertUpserted { .. } => "alert",
            StreamMessage::AlertResolved { .. } => "resolved",
            StreamMessage::Subscribed => "subscribed",
            StreamMessage::Pong => "pong",
        }
    }
}

/// Control messages accepted on the WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping,
    Subscribe,
}
