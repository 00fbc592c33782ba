//! Hook status projection and audit records.
//!
//! Two side effects live here: writing the active-event projection to the
//! hook status subresource, and emitting `events.k8s.io/v1` audit records
//! so that `kubectl describe hook` tells the story of every dispatch.
//! Status writes go through `replace_status` with the resource version from
//! the last list, so a stale write fails with a conflict and the next
//! status tick rewrites it.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::events::v1::Event as K8sEvent;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::PostParams;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, warn};

use crate::crd::{ActiveEventStatus, Hook, HookStatus};
use crate::dedup::ActiveEvent;
use crate::event::ClassifiedEvent;

const CONTROLLER_NAME: &str = "khook";

/// Audit record severities, mirroring the cluster event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditSeverity {
    Normal,
    Warning,
}

impl AuditSeverity {
    fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Normal => "Normal",
            AuditSeverity::Warning => "Warning",
        }
    }
}

/// Capability set for recording pipeline outcomes against the cluster.
///
/// The `record_*` family is fire-and-forget: failures are logged inside the
/// implementation and never interrupt the match sweep. Only the status
/// projection returns its error, and even that is non-fatal to callers.
#[async_trait]
pub trait StatusRecorder: Send + Sync {
    /// Write the active-event projection to the hook status subresource.
    async fn update_hook_status(
        &self,
        hook: &Hook,
        active: Vec<ActiveEvent>,
    ) -> anyhow::Result<()>;

    /// A matching event was observed and will be dispatched.
    async fn record_event_detected(&self, hook: &Hook, event: &ClassifiedEvent);

    /// A matching event was suppressed by the deduplication window.
    async fn record_duplicate_skipped(&self, hook: &Hook, event: &ClassifiedEvent);

    /// The agent call succeeded; `request_id` is the session id.
    async fn record_agent_call_success(
        &self,
        hook: &Hook,
        event: &ClassifiedEvent,
        request_id: &str,
    );

    /// The agent call failed after retries.
    async fn record_agent_call_failure(&self, hook: &Hook, event: &ClassifiedEvent, error: &str);
}

/// Production recorder backed by the cluster API.
#[derive(Clone)]
pub struct KubeStatusManager {
    client: Client,
    reporting_instance: String,
}

impl KubeStatusManager {
    pub fn new(client: Client, reporting_instance: impl Into<String>) -> Self {
        Self {
            client,
            reporting_instance: reporting_instance.into(),
        }
    }

    async fn emit(&self, hook: &Hook, severity: AuditSeverity, reason: &str, note: String) {
        let namespace = hook.namespace().unwrap_or_else(|| "default".to_string());
        let event = audit_event(
            hook,
            severity,
            reason,
            note,
            &self.reporting_instance,
            Utc::now(),
        );
        let api: Api<K8sEvent> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(err) = api.create(&PostParams::default(), &event).await {
            warn!(
                hook = %hook.name_any(),
                reason = %reason,
                error = %err,
                "failed to emit audit record"
            );
        }
    }
}

#[async_trait]
impl StatusRecorder for KubeStatusManager {
    async fn update_hook_status(
        &self,
        hook: &Hook,
        active: Vec<ActiveEvent>,
    ) -> anyhow::Result<()> {
        let namespace = hook.namespace().unwrap_or_else(|| "default".to_string());
        let name = hook.name_any();
        let mut updated = hook.clone();
        updated.status = Some(project_status(active));

        let api: Api<Hook> = Api::namespaced(self.client.clone(), &namespace);
        api.replace_status(&name, &PostParams::default(), serde_json::to_vec(&updated)?)
            .await?;
        debug!(hook = %name, namespace = %namespace, "hook status updated");
        Ok(())
    }

    async fn record_event_detected(&self, hook: &Hook, event: &ClassifiedEvent) {
        self.emit(
            hook,
            AuditSeverity::Normal,
            "EventDetected",
            format!(
                "Detected {} on {}/{}: {}",
                event.event_type, event.namespace, event.resource_name, event.reason
            ),
        )
        .await;
    }

    async fn record_duplicate_skipped(&self, hook: &Hook, event: &ClassifiedEvent) {
        self.emit(
            hook,
            AuditSeverity::Normal,
            "DuplicateEventSkipped",
            format!(
                "Duplicate {} on {}/{} ignored inside the suppression window",
                event.event_type, event.namespace, event.resource_name
            ),
        )
        .await;
    }

    async fn record_agent_call_success(
        &self,
        hook: &Hook,
        event: &ClassifiedEvent,
        request_id: &str,
    ) {
        self.emit(
            hook,
            AuditSeverity::Normal,
            "AgentCallCompleted",
            format!(
                "Agent notified for {} on {}/{} (request {})",
                event.event_type, event.namespace, event.resource_name, request_id
            ),
        )
        .await;
    }

    async fn record_agent_call_failure(&self, hook: &Hook, event: &ClassifiedEvent, error: &str) {
        self.emit(
            hook,
            AuditSeverity::Warning,
            "AgentCallFailed",
            format!(
                "Agent call failed for {} on {}/{}: {}",
                event.event_type, event.namespace, event.resource_name, error
            ),
        )
        .await;
    }
}

/// Build the status subresource content from the active-event projection.
pub fn project_status(active: Vec<ActiveEvent>) -> HookStatus {
    let mut active_events: Vec<ActiveEventStatus> = active
        .into_iter()
        .map(|e| ActiveEventStatus {
            event_type: e.event_type,
            resource_name: e.resource_name,
            first_seen: e.first_seen,
            last_seen: e.last_seen,
            status: e.status,
        })
        .collect();
    // Stable order keeps status diffs readable.
    active_events.sort_by(|a, b| {
        (a.event_type, a.resource_name.as_str()).cmp(&(b.event_type, b.resource_name.as_str()))
    });
    HookStatus {
        active_events,
        last_updated: Some(Utc::now()),
    }
}

/// Build one audit record regarding a hook.
fn audit_event(
    hook: &Hook,
    severity: AuditSeverity,
    reason: &str,
    note: String,
    reporting_instance: &str,
    now: chrono::DateTime<Utc>,
) -> K8sEvent {
    let reference: ObjectReference = hook.object_ref(&());
    K8sEvent {
        metadata: ObjectMeta {
            namespace: reference.namespace.clone(),
            name: Some(format!(
                "{}.{:x}",
                reference
                    .name
                    .as_deref()
                    .unwrap_or(CONTROLLER_NAME),
                now.timestamp_nanos_opt().unwrap_or_default()
            )),
            ..Default::default()
        },
        action: Some("Dispatch".to_string()),
        reason: Some(reason.to_string()),
        note: Some(note),
        type_: Some(severity.as_str().to_string()),
        event_time: Some(MicroTime(now)),
        regarding: Some(reference),
        reporting_controller: Some(CONTROLLER_NAME.to_string()),
        reporting_instance: Some(reporting_instance.to_string()),
        ..Default::default()
    }
}
