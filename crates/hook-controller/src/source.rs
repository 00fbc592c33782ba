//! Event ingestion from the cluster.
//!
//! A [`KubernetesEventSource`] opens a namespace-scoped watch on the
//! `events.k8s.io/v1` stream and forwards classified, fresh events on a
//! bounded channel. The pipeline only ever sees [`ClassifiedEvent`]s, so a
//! non-Kubernetes source can slot in behind the [`EventSource`] trait
//! without processor changes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::{pin_mut, StreamExt};
use k8s_openapi::api::events::v1::Event as KubeEvent;
use kube::api::ListParams;
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::classifier::classify;
use crate::crd::EventType;
use crate::event::ClassifiedEvent;

/// Events whose most recent timestamp is older than this never enter the
/// pipeline.
pub fn staleness_cutoff() -> Duration {
    Duration::minutes(15)
}

/// Bound on the watch channel. A full channel blocks the watch task rather
/// than dropping events; the API server buffers upstream.
pub const CHANNEL_CAPACITY: usize = 100;

/// Capability set for event ingestion.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Event types this source can produce.
    fn supported_event_types(&self) -> &[EventType];

    /// Open a watch scoped to `namespace`. Returns once the watch target is
    /// reachable, or with the error that prevented it. The channel closes
    /// exactly once, on cancellation or watch disconnect; the supervisor
    /// re-creates the source on its next sync.
    async fn start(&self, namespace: &str) -> anyhow::Result<mpsc::Receiver<ClassifiedEvent>>;
}

/// Watches the `events.k8s.io/v1` stream of one namespace.
#[derive(Clone)]
pub struct KubernetesEventSource {
    client: Client,
}

impl KubernetesEventSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSource for KubernetesEventSource {
    fn supported_event_types(&self) -> &[EventType] {
        &EventType::ALL
    }

    async fn start(&self, namespace: &str) -> anyhow::Result<mpsc::Receiver<ClassifiedEvent>> {
        let api: Api<KubeEvent> = Api::namespaced(self.client.clone(), namespace);

        // Probe the target before spawning so that missing RBAC or an
        // unreachable API server fail the start instead of a silent
        // channel close.
        api.list(&ListParams::default().limit(1)).await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let namespace = namespace.to_string();
        tokio::spawn(async move {
            let stream = watcher(api, watcher::Config::default());
            pin_mut!(stream);
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(namespace = %namespace, "event channel closed, stopping watch");
                        break;
                    }
                    item = stream.next() => match item {
                        None => {
                            info!(namespace = %namespace, "event watch stream ended");
                            break;
                        }
                        Some(Err(err)) => {
                            // Transient per the error model: surface as a
                            // channel close and let the supervisor restart.
                            info!(namespace = %namespace, error = %err, "event watch interrupted");
                            break;
                        }
                        Some(Ok(event)) => match event {
                            watcher::Event::Apply(raw) | watcher::Event::InitApply(raw) => {
                                if let Some(classified) = admit(&raw, Utc::now()) {
                                    if tx.send(classified).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            watcher::Event::Delete(_)
                            | watcher::Event::Init
                            | watcher::Event::InitDone => {}
                        },
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Classify a raw event and apply the staleness cutoff. `None` means the
/// event produces no downstream effect.
pub fn admit(raw: &KubeEvent, now: DateTime<Utc>) -> Option<ClassifiedEvent> {
    let regarding = raw.regarding.as_ref()?;
    let kind = regarding.kind.as_deref().unwrap_or_default();
    let reason = raw.reason.as_deref().unwrap_or_default();
    let note = raw.note.as_deref().unwrap_or_default();
    let severity = raw.type_.as_deref().unwrap_or_default();

    let event_type = classify(kind, reason, note, severity)?;

    let timestamp = most_recent_timestamp(raw);
    if now.signed_duration_since(timestamp) > staleness_cutoff() {
        debug!(
            reason = %reason,
            age_minutes = now.signed_duration_since(timestamp).num_minutes(),
            "dropping stale event"
        );
        return None;
    }

    let mut metadata = HashMap::new();
    if let Some(controller) = raw.reporting_controller.as_deref() {
        metadata.insert("reportingController".to_string(), controller.to_string());
    }
    if let Some(count) = raw.series.as_ref().map(|s| s.count) {
        metadata.insert("seriesCount".to_string(), count.to_string());
    }
    if let Some(uid) = regarding.uid.as_deref() {
        metadata.insert("regardingUid".to_string(), uid.to_string());
    }

    Some(ClassifiedEvent {
        event_type,
        resource_name: regarding.name.clone().unwrap_or_default(),
        namespace: regarding
            .namespace
            .clone()
            .or_else(|| raw.metadata.namespace.clone())
            .unwrap_or_default(),
        timestamp,
        reason: reason.to_string(),
        message: note.to_string(),
        uid: raw.metadata.uid.clone().unwrap_or_default(),
        metadata,
    })
}

/// Most recent of series-last-observed, event time and creation time.
fn most_recent_timestamp(event: &KubeEvent) -> DateTime<Utc> {
    event
        .series
        .as_ref()
        .map(|series| series.last_observed_time.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::api::events::v1::EventSeries;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};

    fn raw_event(reason: &str, note: &str, severity: &str) -> KubeEvent {
        KubeEvent {
            regarding: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some("web-0".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("pod-uid".to_string()),
                ..Default::default()
            }),
            reason: Some(reason.to_string()),
            note: Some(note.to_string()),
            type_: Some(severity.to_string()),
            event_time: Some(MicroTime(Utc::now())),
            ..Default::default()
        }
    }

    #[test]
    fn admits_fresh_matching_events() {
        let raw = raw_event("BackOff", "Back-off restarting failed container", "Warning");
        let classified = admit(&raw, Utc::now()).expect("event should be admitted");
        assert_eq!(classified.event_type, EventType::PodRestart);
        assert_eq!(classified.resource_name, "web-0");
        assert_eq!(classified.namespace, "default");
        assert_eq!(classified.reason, "BackOff");
    }

    #[test]
    fn drops_unclassifiable_events() {
        let raw = raw_event("FailedMount", "volume timeout", "Warning");
        assert!(admit(&raw, Utc::now()).is_none());
    }

    #[test]
    fn drops_events_past_the_staleness_cutoff() {
        let mut raw = raw_event("BackOff", "restarting", "Warning");
        raw.event_time = Some(MicroTime(Utc::now() - Duration::minutes(20)));
        assert!(admit(&raw, Utc::now()).is_none());
    }

    #[test]
    fn series_last_observed_revives_an_old_event() {
        let mut raw = raw_event("BackOff", "restarting", "Warning");
        raw.event_time = Some(MicroTime(Utc::now() - Duration::minutes(30)));
        raw.series = Some(EventSeries {
            count: 4,
            last_observed_time: MicroTime(Utc::now() - Duration::minutes(1)),
        });
        let classified = admit(&raw, Utc::now()).expect("series keeps the event fresh");
        assert_eq!(classified.metadata.get("seriesCount").unwrap(), "4");
    }

    #[test]
    fn timestamp_prefers_series_then_event_time_then_creation() {
        let series_time = Utc::now() - Duration::minutes(1);
        let event_time = Utc::now() - Duration::minutes(5);
        let creation = Utc::now() - Duration::minutes(9);

        let mut raw = raw_event("BackOff", "restarting", "Warning");
        raw.metadata.creation_timestamp = Some(Time(creation));
        raw.event_time = Some(MicroTime(event_time));
        raw.series = Some(EventSeries {
            count: 2,
            last_observed_time: MicroTime(series_time),
        });
        assert_eq!(most_recent_timestamp(&raw), series_time);

        raw.series = None;
        assert_eq!(most_recent_timestamp(&raw), event_time);

        raw.event_time = None;
        assert_eq!(most_recent_timestamp(&raw), creation);
    }

    #[test]
    fn events_without_a_regarding_object_are_dropped() {
        let mut raw = raw_event("BackOff", "restarting", "Warning");
        raw.regarding = None;
        assert!(admit(&raw, Utc::now()).is_none());
    }
}
