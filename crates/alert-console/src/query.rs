//! Filtering, sorting and pagination for the events endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::Alert;

/// Hard ceiling on page size.
pub const MAX_LIMIT: usize = 1000;
/// Page size when the caller does not ask for one.
pub const DEFAULT_LIMIT: usize = 100;

/// Query parameters accepted by the events endpoints.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub namespace: Option<String>,
    pub event_type: Option<String>,
    pub resource_name: Option<String>,
    pub status: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

/// One page of alerts plus paging metadata.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPage {
    pub events: Vec<Alert>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Apply filters, sort and pagination to a snapshot.
pub fn apply(alerts: Vec<Alert>, query: &EventsQuery) -> EventsPage {
    let mut filtered: Vec<Alert> = alerts
        .into_iter()
        .filter(|a| matches(a, query))
        .collect();

    sort(&mut filtered, query);

    let total = filtered.len();
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let events = filtered.into_iter().skip(offset).take(limit).collect();

    EventsPage {
        events,
        total,
        limit,
        offset,
    }
}

fn matches(alert: &Alert, query: &EventsQuery) -> bool {
    if let Some(namespace) = &query.namespace {
        if &alert.hook_namespace != namespace {
            return false;
        }
    }
    if let Some(event_type) = &query.event_type {
        if alert.event_type.as_str() != event_type {
            return false;
        }
    }
    if let Some(resource) = &query.resource_name {
        if &alert.resource_name != resource {
            return false;
        }
    }
    if let Some(status) = &query.status {
        if alert.status.to_string() != *status {
            return false;
        }
    }
    if let Some(start) = query.start_time {
        if alert.last_seen < start {
            return false;
        }
    }
    if let Some(end) = query.end_time {
        if alert.last_seen > end {
            return false;
        }
    }
    true
}

fn sort(alerts: &mut [Alert], query: &EventsQuery) {
    let ascending = matches!(query.sort_order.as_deref(), Some("asc"));
    match query.sort_by.as_deref() {
        Some("eventType") => alerts.sort_by(|a, b| {
            a.event_type
                .as_str()
                .cmp(b.event_type.as_str())
                .then(a.id.cmp(&b.id))
        }),
        Some("resourceName") => {
            alerts.sort_by(|a, b| a.resource_name.cmp(&b.resource_name).then(a.id.cmp(&b.id)))
        }
        // "timestamp" and anything unrecognized.
        _ => alerts.sort_by(|a, b| a.last_seen.cmp(&b.last_seen).then(a.id.cmp(&b.id))),
    }
    if !ascending {
        alerts.reverse();
    }
}
