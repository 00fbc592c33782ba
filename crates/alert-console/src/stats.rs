//! Aggregations served by the stats endpoints.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::Alert;
use hook_controller::{EventStatus, EventType};

/// Totals by status.
#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total: usize,
    pub firing: usize,
    pub resolved: usize,
}

pub fn summary(alerts: &[Alert]) -> Summary {
    let firing = alerts
        .iter()
        .filter(|a| a.status == EventStatus::Firing)
        .count();
    Summary {
        total: alerts.len(),
        firing,
        resolved: alerts.len() - firing,
    }
}

/// Count and share of one event type.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeCount {
    pub event_type: EventType,
    pub count: usize,
    pub percentage: f64,
}

/// Counts per event type. Types with no alerts are included at zero so the
/// console can render a stable legend.
pub fn by_type(alerts: &[Alert]) -> Vec<TypeCount> {
    let total = alerts.len();
    EventType::ALL
        .into_iter()
        .map(|event_type| {
            let count = alerts.iter().filter(|a| a.event_type == event_type).count();
            let percentage = if total == 0 {
                0.0
            } else {
                (count as f64 / total as f64) * 100.0
            };
            TypeCount {
                event_type,
                count,
                percentage,
            }
        })
        .collect()
}

/// Supported trend windows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl TimeRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::Hour => "1h",
            TimeRange::Day => "24h",
            TimeRange::Week => "7d",
            TimeRange::Month => "30d",
        }
    }

    fn window(&self) -> Duration {
        match self {
            TimeRange::Hour => Duration::hours(1),
            TimeRange::Day => Duration::hours(24),
            TimeRange::Week => Duration::days(7),
            TimeRange::Month => Duration::days(30),
        }
    }

    fn bucket(&self) -> Duration {
        match self {
            TimeRange::Hour => Duration::minutes(5),
            TimeRange::Day => Duration::hours(1),
            TimeRange::Week | TimeRange::Month => Duration::days(1),
        }
    }
}

impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(TimeRange::Hour),
            "24h" => Ok(TimeRange::Day),
            "7d" => Ok(TimeRange::Week),
            "30d" => Ok(TimeRange::Month),
            other => Err(format!("unsupported timeRange {:?}", other)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendBucket {
    pub start: DateTime<Utc>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trends {
    pub time_range: String,
    pub buckets: Vec<TrendBucket>,
}

/// Bucketed alert counts (by first-seen) over the window ending now.
pub fn trends(alerts: &[Alert], range: TimeRange, now: DateTime<Utc>) -> Trends {
    let window = range.window();
    let bucket = range.bucket();
    let start = now - window;
    let count = (window.num_seconds() / bucket.num_seconds()) as usize;

    let buckets = (0..count)
        .map(|i| {
            let bucket_start = start + bucket * (i as i32);
            let bucket_end = bucket_start + bucket;
            let count = alerts
                .iter()
                .filter(|a| a.first_seen >= bucket_start && a.first_seen < bucket_end)
                .count();
            TrendBucket {
                start: bucket_start,
                count,
            }
        })
        .collect();

    Trends {
        time_range: range.as_str().to_string(),
        buckets,
    }
}
