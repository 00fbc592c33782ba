//! In-memory deduplication of active events.
//!
//! The manager owns the only mutable view of active events. Everything
//! handed out is a copy, so no reader can bypass the suppression window by
//! mutating shared state. State is process-lifetime: a restart forgets all
//! suppression markers, and the first post-restart event for any key is
//! delivered again.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::crd::{EventStatus, EventType};
use crate::event::ClassifiedEvent;

/// Window during which a second notification for the same (hook, event-key)
/// is withheld. Also the age at which an active event reads as resolved.
pub fn suppression_window() -> Duration {
    Duration::minutes(10)
}

/// One tracked event under a hook.
#[derive(Clone, Debug)]
pub struct ActiveEvent {
    pub event_type: EventType,
    pub resource_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: EventStatus,
    /// Set on the first successful agent call for this entry.
    pub notified_at: Option<DateTime<Utc>>,
    /// Set on every successful agent call for this entry.
    pub last_notified_at: Option<DateTime<Utc>>,
}

/// Thread-safe table of active events, keyed by hook reference and then by
/// event key. One lock guards the whole table; it stays small (hooks ×
/// currently-problematic resources) so contention is not a concern.
#[derive(Default)]
pub struct DeduplicationManager {
    table: RwLock<HashMap<String, HashMap<String, ActiveEvent>>>,
}

impl DeduplicationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an event should be dispatched for `hook_ref`.
    ///
    /// True when the key is unknown, or when the previous episode is old
    /// enough that this reads as a fresh one. An entry whose agent call
    /// never succeeded (`last_notified_at` unset) still suppresses until it
    /// expires: the record itself is the suppression marker.
    pub fn should_process(&self, hook_ref: &str, event: &ClassifiedEvent) -> bool {
        self.should_process_at(hook_ref, event, Utc::now())
    }

    pub fn should_process_at(
        &self,
        hook_ref: &str,
        event: &ClassifiedEvent,
        now: DateTime<Utc>,
    ) -> bool {
        let table = self.table.read().expect("dedup table lock poisoned");
        let entry = match table.get(hook_ref).and_then(|m| m.get(&event.key())) {
            None => return true,
            Some(entry) => entry,
        };

        if let Some(notified) = entry.last_notified_at {
            if now.signed_duration_since(notified) < suppression_window() {
                return false;
            }
        }
        now.signed_duration_since(entry.first_seen) > suppression_window()
    }

    /// Create or refresh the entry for this event. First-seen is preserved
    /// on refresh; last-seen always advances to `now`.
    pub fn record_event(&self, hook_ref: &str, event: &ClassifiedEvent) {
        self.record_event_at(hook_ref, event, Utc::now())
    }

    pub fn record_event_at(&self, hook_ref: &str, event: &ClassifiedEvent, now: DateTime<Utc>) {
        let mut table = self.table.write().expect("dedup table lock poisoned");
        let entries = table.entry(hook_ref.to_string()).or_default();
        entries
            .entry(event.key())
            .and_modify(|e| {
                e.last_seen = now;
                e.status = EventStatus::Firing;
            })
            .or_insert_with(|| ActiveEvent {
                event_type: event.event_type,
                resource_name: event.resource_name.clone(),
                first_seen: now,
                last_seen: now,
                status: EventStatus::Firing,
                notified_at: None,
                last_notified_at: None,
            });
    }

    /// Record a successful agent call for this event.
    pub fn mark_notified(&self, hook_ref: &str, event: &ClassifiedEvent) {
        self.mark_notified_at(hook_ref, event, Utc::now())
    }

    pub fn mark_notified_at(&self, hook_ref: &str, event: &ClassifiedEvent, now: DateTime<Utc>) {
        let mut table = self.table.write().expect("dedup table lock poisoned");
        if let Some(entry) = table
            .get_mut(hook_ref)
            .and_then(|m| m.get_mut(&event.key()))
        {
            entry.notified_at.get_or_insert(now);
            entry.last_notified_at = Some(now);
        }
    }

    /// Drop entries whose first-seen is past the window. Empty per-hook maps
    /// collapse. Returns the number of entries removed.
    pub fn cleanup_expired_events(&self, hook_ref: &str) -> usize {
        self.cleanup_expired_events_at(hook_ref, Utc::now())
    }

    pub fn cleanup_expired_events_at(&self, hook_ref: &str, now: DateTime<Utc>) -> usize {
        let mut table = self.table.write().expect("dedup table lock poisoned");
        let Some(entries) = table.get_mut(hook_ref) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| now.signed_duration_since(e.first_seen) <= suppression_window());
        let removed = before - entries.len();
        if removed > 0 {
            debug!(hook = %hook_ref, removed, "cleaned up expired events");
        }
        if entries.is_empty() {
            table.remove(hook_ref);
        }
        removed
    }

    /// Copies of the active events for a hook, with entries past the window
    /// projected as resolved. The projection never mutates the table.
    pub fn get_active_events_with_status(&self, hook_ref: &str) -> Vec<ActiveEvent> {
        self.get_active_events_with_status_at(hook_ref, Utc::now())
    }

    pub fn get_active_events_with_status_at(
        &self,
        hook_ref: &str,
        now: DateTime<Utc>,
    ) -> Vec<ActiveEvent> {
        let table = self.table.read().expect("dedup table lock poisoned");
        table
            .get(hook_ref)
            .map(|entries| {
                entries
                    .values()
                    .map(|e| {
                        let mut copy = e.clone();
                        if now.signed_duration_since(e.first_seen) > suppression_window() {
                            copy.status = EventStatus::Resolved;
                        }
                        copy
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
