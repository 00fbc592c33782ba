//! The `Hook` custom resource and the admission rules the controller
//! re-checks before acting on a hook.
//!
//! A Hook binds event types observed in its namespace to agents: one prompt
//! template per event type, at most fifty configurations, unique by type.
//! The admission webhook enforces these rules at write time; the controller
//! re-validates on every sync so that hooks created while the webhook was
//! down are skipped instead of half-processed.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use lazy_static::lazy_static;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::template::{self, TemplateError};

/// Upper bound on event configurations per hook.
pub const MAX_EVENT_CONFIGURATIONS: usize = 50;
/// Upper bound on the agent reference name length.
pub const MAX_AGENT_NAME_LEN: usize = 100;

lazy_static! {
    static ref AGENT_NAME: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
}

/// The closed set of event types a hook may subscribe to.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    PodRestart,
    PodPending,
    OomKill,
    ProbeFailed,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::PodRestart,
        EventType::PodPending,
        EventType::OomKill,
        EventType::ProbeFailed,
    ];

    /// Wire form, matching the CRD schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PodRestart => "pod-restart",
            EventType::PodPending => "pod-pending",
            EventType::OomKill => "oom-kill",
            EventType::ProbeFailed => "probe-failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

#[derive(Debug, Error)]
#[error("unknown event type {0:?}")]
pub struct UnknownEventType(pub String);

/// Reference to an agent by name. The namespace defaults to the hook's own
/// namespace when omitted.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// One entry inside a hook: event type, agent, prompt template.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventConfiguration {
    pub event_type: EventType,
    pub agent_ref: AgentRef,
    pub prompt: String,
}

/// Spec of the `Hook` custom resource (`kagent.dev/v1alpha2`).
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kagent.dev",
    version = "v1alpha2",
    kind = "Hook",
    namespaced,
    status = "HookStatus",
    shortname = "hk"
)]
#[serde(rename_all = "camelCase")]
pub struct HookSpec {
    pub event_configurations: Vec<EventConfiguration>,
}

/// Firing / resolved state of an active-event projection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Firing,
    Resolved,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::Firing => f.write_str("firing"),
            EventStatus::Resolved => f.write_str("resolved"),
        }
    }
}

/// One active event as written to the hook status subresource.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveEventStatus {
    pub event_type: EventType,
    pub resource_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: EventStatus,
}

/// Status subresource of a hook: the active-event projection plus the time
/// of the last projection write.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HookStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_events: Vec<ActiveEventStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Reasons a hook fails admission validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(
        "hook must declare between 1 and {MAX_EVENT_CONFIGURATIONS} event configurations, got {0}"
    )]
    EventConfigurationCount(usize),
    #[error("event type {0} appears more than once")]
    DuplicateEventType(EventType),
    #[error("agent reference name must not be empty")]
    EmptyAgentName,
    #[error("agent reference name {0:?} exceeds {MAX_AGENT_NAME_LEN} characters")]
    AgentNameTooLong(String),
    #[error("agent reference name {0:?} contains characters outside [A-Za-z0-9_-]")]
    InvalidAgentName(String),
    #[error("prompt for {0}: {1}")]
    Prompt(EventType, TemplateError),
}

/// Re-checks the admission rule set against a hook spec.
pub fn validate_hook(spec: &HookSpec) -> Result<(), ValidationError> {
    let count = spec.event_configurations.len();
    if count == 0 || count > MAX_EVENT_CONFIGURATIONS {
        return Err(ValidationError::EventConfigurationCount(count));
    }

    let mut seen = HashSet::new();
    for config in &spec.event_configurations {
        if !seen.insert(config.event_type) {
            return Err(ValidationError::DuplicateEventType(config.event_type));
        }

        let name = &config.agent_ref.name;
        if name.is_empty() {
            return Err(ValidationError::EmptyAgentName);
        }
        if name.len() > MAX_AGENT_NAME_LEN {
            return Err(ValidationError::AgentNameTooLong(name.clone()));
        }
        if !AGENT_NAME.is_match(name) {
            return Err(ValidationError::InvalidAgentName(name.clone()));
        }

        template::validate_template(&config.prompt)
            .map_err(|e| ValidationError::Prompt(config.event_type, e))?;
    }
    Ok(())
}

/// Canonical `namespace/name` reference for a hook, used as the
/// deduplication table key and in log fields.
pub fn hook_ref(hook: &Hook) -> String {
    format!(
        "{}/{}",
        hook.namespace().unwrap_or_default(),
        hook.name_any()
    )
}
