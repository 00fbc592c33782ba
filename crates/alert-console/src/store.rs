//! In-memory alert table and stream fan-out.
//!
//! The store owns every alert the console serves. Readers copy out;
//! subscribers get a bounded channel each and are dropped individually when
//! they cannot keep up, so a slow console tab never blocks the pipeline.
//! SSE and WebSocket subscriber sets live under separate locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use hook_controller::alerts::{AlertProjection, AlertSink};
use hook_controller::EventStatus;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::alert::{Alert, StreamMessage};

/// Buffered messages per subscriber before it is dropped.
const SUBSCRIBER_BUFFER: usize = 64;

/// Age at which a firing alert reads as resolved, matching the pipeline's
/// suppression window.
fn resolve_after() -> Duration {
    Duration::minutes(10)
}

/// How long an alert is kept after it was last seen.
fn retention() -> Duration {
    Duration::hours(1)
}

/// Which stream a subscriber belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriberKind {
    Sse,
    WebSocket,
}

/// Monotonic counters served by the metrics endpoint.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub alerts_published: AtomicU64,
    pub subscribers_dropped: AtomicU64,
}

/// A live stream subscription: the snapshot taken at subscribe time plus
/// the update channel. Dropping the guard unsubscribes.
pub struct Subscription {
    pub snapshot: Vec<Alert>,
    pub rx: mpsc::Receiver<StreamMessage>,
    pub guard: SubscriptionGuard,
}

pub struct SubscriptionGuard {
    store: Arc<AlertStore>,
    kind: SubscriberKind,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.store.unsubscribe(self.kind, self.id);
    }
}

/// The console's alert table.
pub struct AlertStore {
    alerts: RwLock<HashMap<String, Alert>>,
    sse_subscribers: Mutex<HashMap<u64, mpsc::Sender<StreamMessage>>>,
    ws_subscribers: Mutex<HashMap<u64, mpsc::Sender<StreamMessage>>>,
    next_subscriber_id: AtomicU64,
    started_at: DateTime<Utc>,
    pub counters: Counters,
}

impl Default for AlertStore {
    fn default() -> Self {
        Self {
            alerts: RwLock::new(HashMap::new()),
            sse_subscribers: Mutex::new(HashMap::new()),
            ws_subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            started_at: Utc::now(),
            counters: Counters::default(),
        }
    }
}

impl AlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Insert or refresh an alert and notify subscribers.
    pub fn upsert(&self, projection: AlertProjection) {
        let mut alert = Alert::from_projection(projection);
        {
            let mut alerts = self.alerts.write().expect("alert table lock poisoned");
            if let Some(existing) = alerts.get(&alert.id) {
                if existing.first_seen < alert.first_seen {
                    alert.first_seen = existing.first_seen;
                }
            }
            alerts.insert(alert.id.clone(), alert.clone());
        }
        self.counters.alerts_published.fetch_add(1, Ordering::Relaxed);
        self.broadcast(StreamMessage::AlertUpserted { alert });
    }

    /// Copies of all alerts with read-time status projection, newest first.
    pub fn snapshot(&self) -> Vec<Alert> {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let alerts = self.alerts.read().expect("alert table lock poisoned");
        let mut out: Vec<Alert> = alerts.values().map(|a| project(a, now)).collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.id.cmp(&b.id)));
        out
    }

    /// Mark aged-out alerts resolved (emitting deltas) and drop ones past
    /// retention. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut resolved = Vec::new();
        let mut removed = 0;
        {
            let mut alerts = self.alerts.write().expect("alert table lock poisoned");
            alerts.retain(|id, alert| {
                if now.signed_duration_since(alert.last_seen) > retention() {
                    removed += 1;
                    return false;
                }
                if alert.status == EventStatus::Firing
                    && now.signed_duration_since(alert.first_seen) > resolve_after()
                {
                    alert.status = EventStatus::Resolved;
                    resolved.push(id.clone());
                }
                true
            });
        }
        for id in resolved {
            self.broadcast(StreamMessage::AlertResolved { id });
        }
        if removed > 0 {
            debug!(removed, "expired alerts dropped from the console table");
        }
        removed
    }

    /// Periodic sweep driver; runs until `shutdown` fires.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.sweep(Utc::now());
                }
            }
        }
    }

    pub fn subscribe(self: &Arc<Self>, kind: SubscriberKind) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers(kind)
            .lock()
            .expect("subscriber lock poisoned")
            .insert(id, tx);
        debug!(?kind, id, "stream subscriber connected");
        Subscription {
            snapshot: self.snapshot(),
            rx,
            guard: SubscriptionGuard {
                store: self.clone(),
                kind,
                id,
            },
        }
    }

    pub fn subscriber_count(&self, kind: SubscriberKind) -> usize {
        self.subscribers(kind)
            .lock()
            .expect("subscriber lock poisoned")
            .len()
    }

    fn subscribers(&self, kind: SubscriberKind) -> &Mutex<HashMap<u64, mpsc::Sender<StreamMessage>>> {
        match kind {
            SubscriberKind::Sse => &self.sse_subscribers,
            SubscriberKind::WebSocket => &self.ws_subscribers,
        }
    }

    fn unsubscribe(&self, kind: SubscriberKind, id: u64) {
        self.subscribers(kind)
            .lock()
            .expect("subscriber lock poisoned")
            .remove(&id);
        debug!(?kind, id, "stream subscriber disconnected");
    }

    /// Fan a message out to every subscriber. A full or closed channel
    /// drops that subscriber only; the publisher never waits.
    fn broadcast(&self, message: StreamMessage) {
        for kind in [SubscriberKind::Sse, SubscriberKind::WebSocket] {
            let mut dead = Vec::new();
            {
                let subscribers = self
                    .subscribers(kind)
                    .lock()
                    .expect("subscriber lock poisoned");
                for (id, tx) in subscribers.iter() {
                    if tx.try_send(message.clone()).is_err() {
                        dead.push(*id);
                    }
                }
            }
            if !dead.is_empty() {
                let mut subscribers = self
                    .subscribers(kind)
                    .lock()
                    .expect("subscriber lock poisoned");
                for id in dead {
                    subscribers.remove(&id);
                    self.counters.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(?kind, id, "dropped slow stream subscriber");
                }
            }
        }
    }
}

impl AlertSink for AlertStore {
    fn publish(&self, alert: AlertProjection) {
        self.upsert(alert);
    }
}

/// Read-time status projection, mirroring the dedup manager's.
fn project(alert: &Alert, now: DateTime<Utc>) -> Alert {
    let mut copy = alert.clone();
    if copy.status == EventStatus::Firing
        && now.signed_duration_since(copy.first_seen) > resolve_after()
    {
        copy.status = EventStatus::Resolved;
    }
    copy
}

#[cfg(test)]
mod test {
    use super::*;
    use hook_controller::EventType;

    fn projection(resource: &str) -> AlertProjection {
        let now = Utc::now();
        AlertProjection {
            hook_name: "h1".to_string(),
            hook_namespace: "default".to_string(),
            event_type: EventType::PodRestart,
            resource_name: resource.to_string(),
            first_seen: now,
            last_seen: now,
            message: "restarting".to_string(),
            agent_ref: "default/a1".to_string(),
            session_id: Some("session-1".to_string()),
        }
    }

    #[test]
    fn upsert_keys_by_stable_id() {
        let store = Arc::new(AlertStore::new());
        store.upsert(projection("web-0"));
        store.upsert(projection("web-0"));
        store.upsert(projection("web-1"));
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn upsert_preserves_earliest_first_seen() {
        let store = Arc::new(AlertStore::new());
        let mut first = projection("web-0");
        first.first_seen = Utc::now() - Duration::minutes(5);
        let early = first.first_seen;
        store.upsert(first);
        store.upsert(projection("web-0"));
        assert_eq!(store.snapshot()[0].first_seen, early);
    }

    #[test]
    fn snapshot_projects_resolved_after_the_window() {
        let store = Arc::new(AlertStore::new());
        let mut old = projection("web-0");
        old.first_seen = Utc::now() - Duration::minutes(15);
        store.upsert(old);
        assert_eq!(store.snapshot()[0].status, EventStatus::Resolved);
    }

    #[test]
    fn sweep_resolves_and_emits_then_prunes() {
        let store = Arc::new(AlertStore::new());
        let mut sub = store.subscribe(SubscriberKind::Sse);

        let mut aging = projection("web-0");
        aging.first_seen = Utc::now() - Duration::minutes(15);
        store.upsert(aging);
        assert_eq!(store.sweep(Utc::now()), 0);
        // Upsert delta plus the resolved delta.
        let first = sub.rx.try_recv().unwrap();
        assert!(matches!(first, StreamMessage::AlertUpserted { .. }));
        let second = sub.rx.try_recv().unwrap();
        assert!(matches!(second, StreamMessage::AlertResolved { .. }));

        let mut expired = projection("web-1");
        expired.first_seen = Utc::now() - Duration::hours(3);
        expired.last_seen = Utc::now() - Duration::hours(2);
        store.upsert(expired);
        assert_eq!(store.sweep(Utc::now()), 1);
    }

    #[test]
    fn subscribers_get_deltas_and_unsubscribe_on_drop() {
        let store = Arc::new(AlertStore::new());
        let mut sub = store.subscribe(SubscriberKind::WebSocket);
        assert_eq!(store.subscriber_count(SubscriberKind::WebSocket), 1);

        store.upsert(projection("web-0"));
        assert!(matches!(
            sub.rx.try_recv().unwrap(),
            StreamMessage::AlertUpserted { .. }
        ));

        drop(sub);
        assert_eq!(store.subscriber_count(SubscriberKind::WebSocket), 0);
    }

    #[test]
    fn slow_subscriber_is_dropped_not_blocked() {
        let store = Arc::new(AlertStore::new());
        let sub = store.subscribe(SubscriberKind::Sse);
        // Never drain; overflow the buffer.
        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            store.upsert(projection(&format!("web-{}", i)));
        }
        assert_eq!(store.subscriber_count(SubscriberKind::Sse), 0);
        assert!(
            store.counters.subscribers_dropped.load(Ordering::Relaxed) >= 1
        );
        drop(sub);
    }

    #[test]
    fn snapshot_is_copied_out() {
        let store = Arc::new(AlertStore::new());
        store.upsert(projection("web-0"));
        let mut snapshot = store.snapshot();
        snapshot[0].message = "mutated".to_string();
        assert_eq!(store.snapshot()[0].message, "restarting");
    }
}
