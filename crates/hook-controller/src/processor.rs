//! The per-namespace pipeline.
//!
//! One processor runs per namespace that has hooks. It owns a single event
//! stream for the namespace and drives every event through match →
//! deduplicate → expand → dispatch → record, strictly sequentially. Two
//! tickers ride along: cleanup of expired dedup entries every five minutes
//! and the status projection every minute. Everything stops on the shutdown
//! signal from the coordinator.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentCaller, AgentRequest};
use crate::alerts::{AlertProjection, AlertSink};
use crate::crd::{hook_ref, EventConfiguration, EventType, Hook};
use crate::dedup::DeduplicationManager;
use crate::event::ClassifiedEvent;
use crate::source::EventSource;
use crate::status::StatusRecorder;
use crate::template;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Everything a processor needs, shared with the coordinator that spawns it.
pub struct Processor {
    namespace: String,
    hooks: Vec<Hook>,
    dedup: Arc<DeduplicationManager>,
    source: Arc<dyn EventSource>,
    agent: Arc<dyn AgentCaller>,
    status: Arc<dyn StatusRecorder>,
    alerts: Arc<dyn AlertSink>,
}

impl Processor {
    pub fn new(
        namespace: impl Into<String>,
        hooks: Vec<Hook>,
        dedup: Arc<DeduplicationManager>,
        source: Arc<dyn EventSource>,
        agent: Arc<dyn AgentCaller>,
        status: Arc<dyn StatusRecorder>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            hooks,
            dedup,
            source,
            agent,
            status,
            alerts,
        }
    }

    /// Event types referenced by this namespace's hooks.
    pub fn referenced_event_types(&self) -> BTreeSet<EventType> {
        self.hooks
            .iter()
            .flat_map(|h| h.spec.event_configurations.iter())
            .map(|c| c.event_type)
            .collect()
    }

    /// Run until the shutdown signal fires or the event stream closes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            namespace = %self.namespace,
            hooks = self.hooks.len(),
            event_types = ?self.referenced_event_types(),
            "starting namespace processor"
        );

        let mut events = match self.source.start(&self.namespace).await {
            Ok(rx) => rx,
            Err(err) => {
                error!(
                    namespace = %self.namespace,
                    error = %err,
                    "failed to start event watch; processor exiting"
                );
                return;
            }
        };

        let start = tokio::time::Instant::now();
        let mut cleanup = tokio::time::interval_at(start + CLEANUP_INTERVAL, CLEANUP_INTERVAL);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut status = tokio::time::interval_at(start + STATUS_INTERVAL, STATUS_INTERVAL);
        status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(namespace = %self.namespace, "processor shutting down");
                    break;
                }
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.handle_event(&event).await,
                    None => {
                        info!(
                            namespace = %self.namespace,
                            "event stream closed; processor exiting for supervisor restart"
                        );
                        break;
                    }
                },
                _ = cleanup.tick() => self.cleanup_tick(),
                _ = status.tick() => self.status_tick().await,
            }
        }
    }

    /// All (hook, configuration) pairs subscribed to this event's type.
    fn match_set(&self, event: &ClassifiedEvent) -> Vec<(&Hook, &EventConfiguration)> {
        self.hooks
            .iter()
            .flat_map(|hook| {
                hook.spec
                    .event_configurations
                    .iter()
                    .filter(|c| c.event_type == event.event_type)
                    .map(move |c| (hook, c))
            })
            .collect()
    }

    /// Sweep the match set for one event. Agent failures never halt the
    /// sweep; each hook keeps independent deduplication state.
    pub async fn handle_event(&self, event: &ClassifiedEvent) {
        let matches = self.match_set(event);
        if matches.is_empty() {
            return;
        }
        debug!(
            namespace = %self.namespace,
            event_type = %event.event_type,
            resource = %event.resource_name,
            matches = matches.len(),
            "handling classified event"
        );

        for (hook, config) in matches {
            let reference = hook_ref(hook);
            if !self.dedup.should_process(&reference, event) {
                debug!(hook = %reference, key = %event.key(), "suppressed duplicate event");
                self.status.record_duplicate_skipped(hook, event).await;
                continue;
            }

            self.dedup.record_event(&reference, event);
            self.status.record_event_detected(hook, event).await;

            let prompt = template::expand(&config.prompt, event);
            let agent_namespace = effective_agent_namespace(hook, config);
            let request = AgentRequest {
                agent_name: config.agent_ref.name.clone(),
                agent_namespace: agent_namespace.clone(),
                event_type: event.event_type.as_str().to_string(),
                prompt,
                event_namespace: event.namespace.clone(),
                reason: event.reason.clone(),
                message: event.message.clone(),
            };

            match self.agent.call_agent(request).await {
                Err(err) => {
                    warn!(
                        hook = %reference,
                        agent = %config.agent_ref.name,
                        error = %err,
                        "agent call failed"
                    );
                    self.status
                        .record_agent_call_failure(hook, event, &err.to_string())
                        .await;
                }
                Ok(response) => {
                    self.status
                        .record_agent_call_success(hook, event, &response.request_id)
                        .await;
                    self.dedup.mark_notified(&reference, event);
                    self.project_alert(hook, config, event, &agent_namespace, &response.request_id);
                }
            }
        }
    }

    fn project_alert(
        &self,
        hook: &Hook,
        config: &EventConfiguration,
        event: &ClassifiedEvent,
        agent_namespace: &str,
        session_id: &str,
    ) {
        let reference = hook_ref(hook);
        let entry = self
            .dedup
            .get_active_events_with_status(&reference)
            .into_iter()
            .find(|e| e.event_type == event.event_type && e.resource_name == event.resource_name);
        let (first_seen, last_seen) = entry
            .map(|e| (e.first_seen, e.last_seen))
            .unwrap_or_else(|| (event.timestamp, event.timestamp));

        self.alerts.publish(AlertProjection {
            hook_name: hook.name_any(),
            hook_namespace: hook.namespace().unwrap_or_default(),
            event_type: event.event_type,
            resource_name: event.resource_name.clone(),
            first_seen,
            last_seen,
            message: event.message.clone(),
            agent_ref: format!("{}/{}", agent_namespace, config.agent_ref.name),
            session_id: Some(session_id.to_string()),
        });
    }

    fn cleanup_tick(&self) {
        for hook in &self.hooks {
            self.dedup.cleanup_expired_events(&hook_ref(hook));
        }
    }

    async fn status_tick(&self) {
        for hook in &self.hooks {
            let active = self.dedup.get_active_events_with_status(&hook_ref(hook));
            if let Err(err) = self.status.update_hook_status(hook, active).await {
                warn!(
                    hook = %hook_ref(hook),
                    error = %err,
                    "status update failed; next tick retries"
                );
            }
        }
    }
}

/// A configuration's namespace override defaults to the hook's namespace.
fn effective_agent_namespace(hook: &Hook, config: &EventConfiguration) -> String {
    config
        .agent_ref
        .namespace
        .clone()
        .unwrap_or_else(|| hook.namespace().unwrap_or_default())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::agent::{AgentCallError, AgentResponse};
    use crate::crd::{AgentRef, HookSpec};
    use crate::event::test_event;
    use crate::source::EventSource;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn hook(namespace: &str, name: &str, agent: &str, event_type: EventType) -> Hook {
        let mut hook = Hook::new(
            name,
            HookSpec {
                event_configurations: vec![EventConfiguration {
                    event_type,
                    agent_ref: AgentRef {
                        name: agent.to_string(),
                        namespace: None,
                    },
                    prompt: "Investigate {{ResourceName}} in {{Namespace}}".to_string(),
                }],
            },
        );
        hook.metadata.namespace = Some(namespace.to_string());
        hook
    }

    #[derive(Default)]
    struct MockAgent {
        calls: Mutex<Vec<AgentRequest>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl AgentCaller for MockAgent {
        async fn call_agent(&self, request: AgentRequest) -> Result<AgentResponse, AgentCallError> {
            self.calls.lock().unwrap().push(request);
            if self.fail.load(Ordering::SeqCst) {
                Err(AgentCallError::Api {
                    status: 500,
                    message: "agent unavailable".to_string(),
                })
            } else {
                Ok(AgentResponse {
                    request_id: "session-1".to_string(),
                })
            }
        }
    }

    #[derive(Default)]
    struct MockRecorder {
        detected: Mutex<Vec<String>>,
        duplicates: Mutex<Vec<String>>,
        successes: Mutex<Vec<String>>,
        failures: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StatusRecorder for MockRecorder {
        async fn update_hook_status(
            &self,
            _hook: &Hook,
            _active: Vec<crate::dedup::ActiveEvent>,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn record_event_detected(&self, hook: &Hook, _event: &ClassifiedEvent) {
            self.detected.lock().unwrap().push(hook_ref(hook));
        }

        async fn record_duplicate_skipped(&self, hook: &Hook, _event: &ClassifiedEvent) {
            self.duplicates.lock().unwrap().push(hook_ref(hook));
        }

        async fn record_agent_call_success(
            &self,
            hook: &Hook,
            _event: &ClassifiedEvent,
            request_id: &str,
        ) {
            self.successes
                .lock()
                .unwrap()
                .push(format!("{}:{}", hook_ref(hook), request_id));
        }

        async fn record_agent_call_failure(
            &self,
            hook: &Hook,
            _event: &ClassifiedEvent,
            _error: &str,
        ) {
            self.failures.lock().unwrap().push(hook_ref(hook));
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<AlertProjection>>,
    }

    impl AlertSink for RecordingSink {
        fn publish(&self, alert: AlertProjection) {
            self.alerts.lock().unwrap().push(alert);
        }
    }

    struct IdleSource;

    #[async_trait]
    impl EventSource for IdleSource {
        fn supported_event_types(&self) -> &[EventType] {
            &EventType::ALL
        }

        async fn start(
            &self,
            _namespace: &str,
        ) -> anyhow::Result<mpsc::Receiver<ClassifiedEvent>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    struct Fixture {
        processor: Processor,
        agent: Arc<MockAgent>,
        recorder: Arc<MockRecorder>,
        sink: Arc<RecordingSink>,
        dedup: Arc<DeduplicationManager>,
    }

    fn fixture(hooks: Vec<Hook>) -> Fixture {
        let agent = Arc::new(MockAgent::default());
        let recorder = Arc::new(MockRecorder::default());
        let sink = Arc::new(RecordingSink::default());
        let dedup = Arc::new(DeduplicationManager::new());
        let processor = Processor::new(
            "default",
            hooks,
            dedup.clone(),
            Arc::new(IdleSource),
            agent.clone(),
            recorder.clone(),
            sink.clone(),
        );
        Fixture {
            processor,
            agent,
            recorder,
            sink,
            dedup,
        }
    }

    #[tokio::test]
    async fn dispatches_a_matching_event_once() {
        let f = fixture(vec![hook("default", "h1", "a1", EventType::PodRestart)]);
        let event = test_event(EventType::PodRestart, "default", "pod-a");

        f.processor.handle_event(&event).await;

        let calls = f.agent.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].agent_name, "a1");
        assert_eq!(calls[0].agent_namespace, "default");
        assert_eq!(calls[0].prompt, "Investigate pod-a in default");
        assert_eq!(f.recorder.detected.lock().unwrap().len(), 1);
        assert_eq!(
            f.recorder.successes.lock().unwrap()[0],
            "default/h1:session-1"
        );
        assert_eq!(f.sink.alerts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn suppresses_a_duplicate_inside_the_window() {
        let f = fixture(vec![hook("default", "h1", "a1", EventType::PodRestart)]);
        let event = test_event(EventType::PodRestart, "default", "pod-a");

        f.processor.handle_event(&event).await;
        f.processor.handle_event(&event).await;

        assert_eq!(f.agent.calls.lock().unwrap().len(), 1);
        assert_eq!(f.recorder.duplicates.lock().unwrap().len(), 1);
        assert_eq!(f.recorder.successes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retries_after_the_window_expires() {
        let f = fixture(vec![hook("default", "h1", "a1", EventType::PodRestart)]);
        let event = test_event(EventType::PodRestart, "default", "pod-a");

        // A prior episode, notified eleven minutes ago.
        let old = Utc::now() - ChronoDuration::minutes(11);
        f.dedup.record_event_at("default/h1", &event, old);
        f.dedup.mark_notified_at("default/h1", &event, old);

        f.processor.handle_event(&event).await;

        assert_eq!(f.agent.calls.lock().unwrap().len(), 1);
        assert!(f.recorder.duplicates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fans_out_to_every_matching_hook() {
        let f = fixture(vec![
            hook("default", "h1", "a1", EventType::OomKill),
            hook("default", "h2", "a2", EventType::OomKill),
        ]);
        let event = test_event(EventType::OomKill, "default", "pod-a");

        f.processor.handle_event(&event).await;

        let calls = f.agent.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let agents: Vec<_> = calls.iter().map(|c| c.agent_name.clone()).collect();
        assert_eq!(agents, vec!["a1", "a2"]);
        // Independent dedup state per hook.
        assert!(!f.dedup.should_process("default/h1", &event));
        assert!(!f.dedup.should_process("default/h2", &event));
    }

    #[tokio::test]
    async fn failed_agent_call_records_failure_and_allows_no_mark() {
        let f = fixture(vec![hook("default", "h1", "a1", EventType::PodRestart)]);
        f.agent.fail.store(true, Ordering::SeqCst);
        let event = test_event(EventType::PodRestart, "default", "pod-a");

        f.processor.handle_event(&event).await;

        assert_eq!(f.recorder.failures.lock().unwrap().len(), 1);
        assert!(f.recorder.successes.lock().unwrap().is_empty());
        assert!(f.sink.alerts.lock().unwrap().is_empty());
        let active = f.dedup.get_active_events_with_status("default/h1");
        assert_eq!(active.len(), 1);
        assert!(active[0].notified_at.is_none());
    }

    #[tokio::test]
    async fn failure_in_one_hook_does_not_halt_the_sweep() {
        // Both hooks share the failing agent mock; both must be attempted.
        let f = fixture(vec![
            hook("default", "h1", "a1", EventType::OomKill),
            hook("default", "h2", "a2", EventType::OomKill),
        ]);
        f.agent.fail.store(true, Ordering::SeqCst);
        let event = test_event(EventType::OomKill, "default", "pod-a");

        f.processor.handle_event(&event).await;

        assert_eq!(f.agent.calls.lock().unwrap().len(), 2);
        assert_eq!(f.recorder.failures.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn non_matching_event_types_are_ignored() {
        let f = fixture(vec![hook("default", "h1", "a1", EventType::ProbeFailed)]);
        let event = test_event(EventType::PodRestart, "default", "pod-a");

        f.processor.handle_event(&event).await;

        assert!(f.agent.calls.lock().unwrap().is_empty());
        assert!(f.recorder.detected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_template_is_sent_raw() {
        let mut h = hook("default", "h1", "a1", EventType::PodRestart);
        h.spec.event_configurations[0].prompt = "Go {{define \"x\"}}{{end}}".to_string();
        let f = fixture(vec![h]);
        let event = test_event(EventType::PodRestart, "default", "pod-a");

        f.processor.handle_event(&event).await;

        let calls = f.agent.calls.lock().unwrap();
        assert_eq!(calls[0].prompt, "Go {{define \"x\"}}{{end}}");
    }

    #[tokio::test]
    async fn agent_namespace_override_wins() {
        let mut h = hook("default", "h1", "a1", EventType::PodRestart);
        h.spec.event_configurations[0].agent_ref.namespace = Some("kagent".to_string());
        let f = fixture(vec![h]);
        let event = test_event(EventType::PodRestart, "default", "pod-a");

        f.processor.handle_event(&event).await;

        assert_eq!(f.agent.calls.lock().unwrap()[0].agent_namespace, "kagent");
    }

    #[tokio::test]
    async fn shutdown_stops_the_run_loop() {
        let f = fixture(vec![hook("default", "h1", "a1", EventType::PodRestart)]);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f.processor.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("processor did not stop on shutdown")
            .unwrap();
    }

    #[test]
    fn referenced_event_types_unions_all_hooks() {
        let f = fixture(vec![
            hook("default", "h1", "a1", EventType::OomKill),
            hook("default", "h2", "a2", EventType::PodPending),
        ]);
        let types = f.processor.referenced_event_types();
        assert!(types.contains(&EventType::OomKill));
        assert!(types.contains(&EventType::PodPending));
        assert_eq!(types.len(), 2);
    }
}
