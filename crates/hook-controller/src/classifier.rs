//! Classification of raw cluster events into the hook event taxonomy.
//!
//! The classifier is a pure function over four strings pulled out of a
//! cluster event: the kind of the regarding object, the reason, the message
//! and the severity ("Normal"/"Warning"). Rules are evaluated in order and
//! the first match wins; anything unmatched is discarded upstream of the
//! pipeline. All comparisons are case-insensitive.

use crate::crd::EventType;

/// Map a raw event to an event type, or `None` to ignore it.
///
/// Only pod events participate today; node and other object kinds are
/// reserved for future taxonomy growth.
pub fn classify(kind: &str, reason: &str, message: &str, severity: &str) -> Option<EventType> {
    if !kind.eq_ignore_ascii_case("pod") {
        return None;
    }
    if severity.eq_ignore_ascii_case("normal") {
        return None;
    }

    let reason = reason.to_ascii_lowercase();
    let message = message.to_ascii_lowercase();
    let warning = severity.eq_ignore_ascii_case("warning");

    match reason.as_str() {
        "oomkilling" | "oomkilled" => Some(EventType::OomKill),
        "killing" | "killed" => {
            if message.contains("oom") || message.contains("out of memory") {
                Some(EventType::OomKill)
            } else {
                // Plain kills read as restarts; see the hook authoring docs.
                Some(EventType::PodRestart)
            }
        }
        "backoff" => Some(EventType::PodRestart),
        "failed" if message.contains("container") => Some(EventType::PodRestart),
        "failedscheduling" => Some(EventType::PodPending),
        _ if message.contains("pending") && warning => Some(EventType::PodPending),
        "unhealthy"
            if message.contains("liveness")
                || message.contains("readiness")
                || message.contains("startup") =>
        {
            Some(EventType::ProbeFailed)
        }
        _ if reason.contains("probe") && warning => Some(EventType::ProbeFailed),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn warn(reason: &str, message: &str) -> Option<EventType> {
        classify("Pod", reason, message, "Warning")
    }

    #[test]
    fn ignores_non_pod_objects() {
        assert_eq!(classify("Node", "OOMKilling", "", "Warning"), None);
        assert_eq!(classify("Deployment", "BackOff", "", "Warning"), None);
    }

    #[test]
    fn ignores_normal_events() {
        assert_eq!(classify("Pod", "BackOff", "", "Normal"), None);
        assert_eq!(classify("Pod", "OOMKilling", "", "normal"), None);
    }

    #[test]
    fn oom_reasons_map_to_oom_kill() {
        assert_eq!(warn("OOMKilling", ""), Some(EventType::OomKill));
        assert_eq!(warn("OOMKilled", ""), Some(EventType::OomKill));
        assert_eq!(warn("oomkilled", ""), Some(EventType::OomKill));
    }

    #[test]
    fn kills_with_oom_text_map_to_oom_kill() {
        assert_eq!(
            warn("Killing", "container exceeded memory, OOM"),
            Some(EventType::OomKill)
        );
        assert_eq!(
            warn("Killed", "process was out of memory"),
            Some(EventType::OomKill)
        );
    }

    #[test]
    fn kills_without_oom_text_map_to_pod_restart() {
        assert_eq!(warn("Killing", "stopping container"), Some(EventType::PodRestart));
        assert_eq!(warn("Killed", ""), Some(EventType::PodRestart));
    }

    #[test]
    fn backoff_maps_to_pod_restart() {
        assert_eq!(
            warn("BackOff", "Back-off restarting failed container"),
            Some(EventType::PodRestart)
        );
    }

    #[test]
    fn failed_requires_container_mention() {
        assert_eq!(
            warn("Failed", "Error: failed to start container \"web\""),
            Some(EventType::PodRestart)
        );
        assert_eq!(warn("Failed", "image pull error"), None);
    }

    #[test]
    fn failed_scheduling_maps_to_pod_pending() {
        assert_eq!(
            warn("FailedScheduling", "0/3 nodes are available"),
            Some(EventType::PodPending)
        );
    }

    #[test]
    fn pending_message_with_warning_maps_to_pod_pending() {
        assert_eq!(
            warn("SomeReason", "pod is pending on volume attach"),
            Some(EventType::PodPending)
        );
        assert_eq!(
            classify("Pod", "SomeReason", "pod is pending", "Error"),
            None
        );
    }

    #[test]
    fn unhealthy_probe_messages_map_to_probe_failed() {
        assert_eq!(
            warn("Unhealthy", "Liveness probe failed: HTTP 500"),
            Some(EventType::ProbeFailed)
        );
        assert_eq!(
            warn("Unhealthy", "Readiness probe failed"),
            Some(EventType::ProbeFailed)
        );
        assert_eq!(
            warn("Unhealthy", "Startup probe failed"),
            Some(EventType::ProbeFailed)
        );
        assert_eq!(warn("Unhealthy", "something else"), None);
    }

    #[test]
    fn probe_reasons_with_warning_map_to_probe_failed() {
        assert_eq!(warn("ProbeError", ""), Some(EventType::ProbeFailed));
        assert_eq!(classify("Pod", "ProbeError", "", "Error"), None);
    }

    #[test]
    fn unknown_reasons_are_ignored() {
        assert_eq!(warn("FailedMount", "volume timeout"), None);
        assert_eq!(warn("NodeNotReady", ""), None);
    }
}
