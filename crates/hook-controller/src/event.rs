//! The internal event shape flowing through the pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::crd::EventType;

/// A raw cluster event after classification: typed, timestamped, stripped
/// down to the fields the pipeline and the prompt variables need.
#[derive(Clone, Debug)]
pub struct ClassifiedEvent {
    pub event_type: EventType,
    pub resource_name: String,
    pub namespace: String,
    /// Most recent of series-last-observed, event time and creation time.
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub message: String,
    pub uid: String,
    pub metadata: HashMap<String, String>,
}

impl ClassifiedEvent {
    /// Deduplication key within a hook: `type:namespace:resource-name`.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.event_type, self.namespace, self.resource_name
        )
    }
}

#[cfg(test)]
pub(crate) fn test_event(event_type: EventType, namespace: &str, resource: &str) -> ClassifiedEvent {
    ClassifiedEvent {
        event_type,
        resource_name: resource.to_string(),
        namespace: namespace.to_string(),
        timestamp: Utc::now(),
        reason: "BackOff".to_string(),
        message: "Back-off restarting failed container".to_string(),
        uid: "test-uid".to_string(),
        metadata: HashMap::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_is_type_namespace_resource() {
        let event = test_event(EventType::PodRestart, "default", "web-0");
        assert_eq!(event.key(), "pod-restart:default:web-0");
    }
}
