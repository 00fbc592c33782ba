//! Cluster-wide hook discovery and per-namespace workflow supervision.
//!
//! A 30-second sync loop lists hooks, buckets them by namespace and
//! compares each bucket's content signature with the running workflow for
//! that namespace. Changed signature: cancel and restart. Vanished
//! namespace: cancel and forget. A workflow whose task has already exited
//! (watch disconnect, panic) is restarted on the next sync regardless of
//! signature. No diffing beyond the signature; restarting the whole
//! namespace workflow is the simplicity the design trades for.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::AgentCaller;
use crate::alerts::AlertSink;
use crate::crd::{hook_ref, validate_hook, Hook};
use crate::dedup::DeduplicationManager;
use crate::processor::Processor;
use crate::source::EventSource;
use crate::status::StatusRecorder;

/// Interval between hook list syncs.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Bounded wait for a cancelled workflow to drain before its replacement
/// starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Capability set for hook discovery.
#[async_trait]
pub trait HookLister: Send + Sync {
    async fn list_hooks(&self) -> anyhow::Result<Vec<Hook>>;
}

/// Lists hooks cluster-wide through the API server.
pub struct KubeHookLister {
    client: Client,
}

impl KubeHookLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HookLister for KubeHookLister {
    async fn list_hooks(&self) -> anyhow::Result<Vec<Hook>> {
        let api: Api<Hook> = Api::all(self.client.clone());
        let hooks = api.list(&ListParams::default()).await?;
        Ok(hooks.items)
    }
}

struct NamespaceWorkflow {
    signature: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Supervises one processor task per hook-bearing namespace.
pub struct WorkflowCoordinator {
    lister: Arc<dyn HookLister>,
    dedup: Arc<DeduplicationManager>,
    source: Arc<dyn EventSource>,
    agent: Arc<dyn AgentCaller>,
    status: Arc<dyn StatusRecorder>,
    alerts: Arc<dyn AlertSink>,
    sync_interval: Duration,
    workflows: HashMap<String, NamespaceWorkflow>,
}

impl WorkflowCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lister: Arc<dyn HookLister>,
        dedup: Arc<DeduplicationManager>,
        source: Arc<dyn EventSource>,
        agent: Arc<dyn AgentCaller>,
        status: Arc<dyn StatusRecorder>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            lister,
            dedup,
            source,
            agent,
            status,
            alerts,
            sync_interval: SYNC_INTERVAL,
            workflows: HashMap::new(),
        }
    }

    /// Override the sync cadence (tests).
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Run the sync loop until `shutdown` fires, then cancel every
    /// workflow.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.sync_interval, "workflow coordinator started");
        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sync().await {
                        warn!(error = %err, "hook sync failed; retrying next interval");
                    }
                }
            }
        }
        info!("workflow coordinator shutting down");
        self.shutdown_all().await;
    }

    async fn sync(&mut self) -> anyhow::Result<()> {
        let hooks = self.lister.list_hooks().await?;
        let buckets = bucket_by_namespace(hooks);

        let desired: HashMap<String, String> = buckets
            .iter()
            .map(|(ns, hooks)| (ns.clone(), namespace_signature(hooks)))
            .collect();
        let current: HashMap<String, WorkflowView> = self
            .workflows
            .iter()
            .map(|(ns, wf)| {
                (
                    ns.clone(),
                    WorkflowView {
                        signature: wf.signature.clone(),
                        finished: wf.handle.is_finished(),
                    },
                )
            })
            .collect();

        let plan = plan_sync(&current, &desired);

        for namespace in plan.stop {
            info!(namespace = %namespace, "namespace no longer has hooks; stopping workflow");
            self.stop_workflow(&namespace).await;
        }
        for namespace in plan.restart {
            info!(namespace = %namespace, "hook set changed; restarting workflow");
            self.stop_workflow(&namespace).await;
            let hooks = buckets.get(&namespace).cloned().unwrap_or_default();
            self.start_workflow(&namespace, hooks, desired[&namespace].clone());
        }
        for namespace in plan.start {
            info!(namespace = %namespace, "starting workflow");
            let hooks = buckets.get(&namespace).cloned().unwrap_or_default();
            self.start_workflow(&namespace, hooks, desired[&namespace].clone());
        }
        Ok(())
    }

    fn start_workflow(&mut self, namespace: &str, hooks: Vec<Hook>, signature: String) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let processor = Processor::new(
            namespace,
            hooks,
            self.dedup.clone(),
            self.source.clone(),
            self.agent.clone(),
            self.status.clone(),
            self.alerts.clone(),
        );
        let handle = tokio::spawn(processor.run(shutdown_rx));
        self.workflows.insert(
            namespace.to_string(),
            NamespaceWorkflow {
                signature,
                shutdown: shutdown_tx,
                handle,
            },
        );
    }

    async fn stop_workflow(&mut self, namespace: &str) {
        if let Some(workflow) = self.workflows.remove(namespace) {
            let _ = workflow.shutdown.send(true);
            let abort = workflow.handle.abort_handle();
            match tokio::time::timeout(DRAIN_TIMEOUT, workflow.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_panic() => {
                    warn!(namespace = %namespace, "processor task panicked; recovered");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    // A straggler still running here would race its
                    // replacement on the shared dedup table.
                    abort.abort();
                    warn!(namespace = %namespace, "processor did not drain in time; aborted");
                }
            }
        }
    }

    async fn shutdown_all(&mut self) {
        let namespaces: Vec<String> = self.workflows.keys().cloned().collect();
        for namespace in namespaces {
            self.stop_workflow(&namespace).await;
        }
    }
}

/// Snapshot of a running workflow used for sync planning.
#[derive(Clone, Debug)]
pub(crate) struct WorkflowView {
    pub signature: String,
    pub finished: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SyncPlan {
    pub start: Vec<String>,
    pub restart: Vec<String>,
    pub stop: Vec<String>,
}

/// Decide which namespaces to start, restart and stop. Pure so the
/// supervision rules stay unit-testable.
pub(crate) fn plan_sync(
    current: &HashMap<String, WorkflowView>,
    desired: &HashMap<String, String>,
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    for (namespace, signature) in desired {
        match current.get(namespace) {
            None => plan.start.push(namespace.clone()),
            Some(view) if view.signature != *signature || view.finished => {
                plan.restart.push(namespace.clone())
            }
            Some(_) => {}
        }
    }
    for namespace in current.keys() {
        if !desired.contains_key(namespace) {
            plan.stop.push(namespace.clone());
        }
    }

    plan.start.sort();
    plan.restart.sort();
    plan.stop.sort();
    plan
}

/// Group hooks by namespace, dropping ones that fail admission validation.
pub fn bucket_by_namespace(hooks: Vec<Hook>) -> HashMap<String, Vec<Hook>> {
    let mut buckets: HashMap<String, Vec<Hook>> = HashMap::new();
    for hook in hooks {
        if let Err(err) = validate_hook(&hook.spec) {
            warn!(hook = %hook_ref(&hook), error = %err, "skipping invalid hook");
            continue;
        }
        let namespace = hook.namespace().unwrap_or_else(|| "default".to_string());
        buckets.entry(namespace).or_default().push(hook);
    }
    buckets
}

/// Deterministic content signature of a namespace's hook set.
///
/// Hooks are sorted by (namespace, name); each configuration contributes
/// `ns/name@type|agent-name|prompt`. Any change to any of those fields for
/// any hook changes the signature; reordering hooks does not.
pub fn namespace_signature(hooks: &[Hook]) -> String {
    let mut sorted: Vec<&Hook> = hooks.iter().collect();
    sorted.sort_by_key(|h| (h.namespace().unwrap_or_default(), h.name_any()));

    let mut entries = Vec::new();
    for hook in sorted {
        let reference = hook_ref(hook);
        for config in &hook.spec.event_configurations {
            entries.push(format!(
                "{}@{}|{}|{}",
                reference, config.event_type, config.agent_ref.name, config.prompt
            ));
        }
    }
    entries.join(";")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::agent::{AgentCallError, AgentCaller, AgentRequest, AgentResponse};
    use crate::alerts::NullAlertSink;
    use crate::crd::{AgentRef, EventConfiguration, EventType, HookSpec};
    use crate::dedup::ActiveEvent;
    use crate::event::ClassifiedEvent;
    use crate::source::EventSource;
    use crate::status::StatusRecorder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn hook(namespace: &str, name: &str, prompt: &str) -> Hook {
        let mut hook = Hook::new(
            name,
            HookSpec {
                event_configurations: vec![EventConfiguration {
                    event_type: EventType::PodRestart,
                    agent_ref: AgentRef {
                        name: "agent".to_string(),
                        namespace: None,
                    },
                    prompt: prompt.to_string(),
                }],
            },
        );
        hook.metadata.namespace = Some(namespace.to_string());
        hook
    }

    fn view(signature: &str, finished: bool) -> WorkflowView {
        WorkflowView {
            signature: signature.to_string(),
            finished,
        }
    }

    #[test]
    fn signature_is_stable_under_hook_reordering() {
        let a = hook("ns1", "alpha", "p1");
        let b = hook("ns1", "beta", "p2");
        assert_eq!(
            namespace_signature(&[a.clone(), b.clone()]),
            namespace_signature(&[b, a])
        );
    }

    #[test]
    fn signature_changes_with_prompt_agent_or_type() {
        let base = hook("ns1", "alpha", "p1");
        let original = namespace_signature(&[base.clone()]);

        let mut prompt_changed = base.clone();
        prompt_changed.spec.event_configurations[0].prompt = "p2".to_string();
        assert_ne!(namespace_signature(&[prompt_changed]), original);

        let mut agent_changed = base.clone();
        agent_changed.spec.event_configurations[0].agent_ref.name = "other".to_string();
        assert_ne!(namespace_signature(&[agent_changed]), original);

        let mut type_changed = base.clone();
        type_changed.spec.event_configurations[0].event_type = EventType::OomKill;
        assert_ne!(namespace_signature(&[type_changed]), original);
    }

    #[test]
    fn plan_starts_new_namespaces() {
        let current = HashMap::new();
        let desired = HashMap::from([("ns1".to_string(), "sig".to_string())]);
        let plan = plan_sync(&current, &desired);
        assert_eq!(plan.start, vec!["ns1"]);
        assert!(plan.restart.is_empty() && plan.stop.is_empty());
    }

    #[test]
    fn plan_noops_unchanged_signatures() {
        let current = HashMap::from([("ns1".to_string(), view("sig", false))]);
        let desired = HashMap::from([("ns1".to_string(), "sig".to_string())]);
        assert_eq!(plan_sync(&current, &desired), SyncPlan::default());
    }

    #[test]
    fn plan_restarts_changed_signatures() {
        let current = HashMap::from([("ns1".to_string(), view("old", false))]);
        let desired = HashMap::from([("ns1".to_string(), "new".to_string())]);
        let plan = plan_sync(&current, &desired);
        assert_eq!(plan.restart, vec!["ns1"]);
    }

    #[test]
    fn plan_restarts_finished_workflows() {
        let current = HashMap::from([("ns1".to_string(), view("sig", true))]);
        let desired = HashMap::from([("ns1".to_string(), "sig".to_string())]);
        let plan = plan_sync(&current, &desired);
        assert_eq!(plan.restart, vec!["ns1"]);
    }

    #[test]
    fn plan_stops_vanished_namespaces() {
        let current = HashMap::from([("ns1".to_string(), view("sig", false))]);
        let desired = HashMap::new();
        let plan = plan_sync(&current, &desired);
        assert_eq!(plan.stop, vec!["ns1"]);
    }

    #[test]
    fn bucketing_drops_invalid_hooks() {
        let valid = hook("ns1", "good", "p");
        let mut invalid = hook("ns1", "bad", "p");
        invalid.spec.event_configurations.clear();
        let buckets = bucket_by_namespace(vec![valid, invalid]);
        assert_eq!(buckets["ns1"].len(), 1);
        assert_eq!(buckets["ns1"][0].name_any(), "good");
    }

    // Supervision tests drive the real coordinator loop with mock seams.

    struct StaticLister {
        hooks: Mutex<Vec<Hook>>,
    }

    #[async_trait]
    impl HookLister for StaticLister {
        async fn list_hooks(&self) -> anyhow::Result<Vec<Hook>> {
            Ok(self.hooks.lock().unwrap().clone())
        }
    }

    struct CountingSource {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl EventSource for CountingSource {
        fn supported_event_types(&self) -> &[EventType] {
            &EventType::ALL
        }

        async fn start(
            &self,
            _namespace: &str,
        ) -> anyhow::Result<mpsc::Receiver<ClassifiedEvent>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(1);
            // Keep the channel open for the life of the processor.
            tokio::spawn(async move {
                tx.closed().await;
            });
            Ok(rx)
        }
    }

    struct NoopAgent;

    #[async_trait]
    impl AgentCaller for NoopAgent {
        async fn call_agent(
            &self,
            _request: AgentRequest,
        ) -> Result<AgentResponse, AgentCallError> {
            Ok(AgentResponse {
                request_id: "noop".to_string(),
            })
        }
    }

    struct NoopRecorder;

    #[async_trait]
    impl StatusRecorder for NoopRecorder {
        async fn update_hook_status(
            &self,
            _hook: &Hook,
            _active: Vec<ActiveEvent>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn record_event_detected(&self, _hook: &Hook, _event: &ClassifiedEvent) {}
        async fn record_duplicate_skipped(&self, _hook: &Hook, _event: &ClassifiedEvent) {}
        async fn record_agent_call_success(
            &self,
            _hook: &Hook,
            _event: &ClassifiedEvent,
            _request_id: &str,
        ) {
        }
        async fn record_agent_call_failure(
            &self,
            _hook: &Hook,
            _event: &ClassifiedEvent,
            _error: &str,
        ) {
        }
    }

    fn coordinator(
        lister: Arc<StaticLister>,
        source: Arc<CountingSource>,
    ) -> WorkflowCoordinator {
        WorkflowCoordinator::new(
            lister,
            Arc::new(DeduplicationManager::new()),
            source,
            Arc::new(NoopAgent),
            Arc::new(NoopRecorder),
            Arc::new(NullAlertSink),
        )
        .with_sync_interval(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn signature_change_restarts_the_workflow() {
        let lister = Arc::new(StaticLister {
            hooks: Mutex::new(vec![hook("ns1", "h1", "p1")]),
        });
        let source = Arc::new(CountingSource {
            starts: AtomicUsize::new(0),
        });
        let coordinator = coordinator(lister.clone(), source.clone());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(coordinator.run(rx));

        // Wait for the first workflow to come up.
        for _ in 0..100 {
            if source.starts.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(source.starts.load(Ordering::SeqCst), 1);

        // Edit the prompt; the next sync must restart the processor.
        lister.hooks.lock().unwrap()[0].spec.event_configurations[0].prompt = "p2".to_string();
        for _ in 0..100 {
            if source.starts.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(source.starts.load(Ordering::SeqCst), 2);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("coordinator did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn removed_namespace_stops_its_workflow() {
        let lister = Arc::new(StaticLister {
            hooks: Mutex::new(vec![hook("ns1", "h1", "p1")]),
        });
        let source = Arc::new(CountingSource {
            starts: AtomicUsize::new(0),
        });
        let coordinator = coordinator(lister.clone(), source.clone());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(coordinator.run(rx));

        for _ in 0..100 {
            if source.starts.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        lister.hooks.lock().unwrap().clear();
        // Give the loop a few sync intervals to notice, then confirm no
        // further workflow was started.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(source.starts.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("coordinator did not stop")
            .unwrap();
    }
}
