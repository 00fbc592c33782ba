//! Lease-based leader election for the coordinator.
//!
//! One `coordination.k8s.io/v1` Lease gates the sync loop: the instance
//! holding it runs the coordinator, everyone else blocks in
//! [`LeaderElector::acquire`]. The console server sits outside the gate
//! and serves on every replica.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::PostParams;
use kube::{Api, Client};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LEASE_NAME: &str = "khook-leader";
const LEASE_DURATION_SECONDS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct LeaderElector {
    client: Client,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            identity: identity.into(),
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Block until this instance holds the lease or `shutdown` fires.
    /// Returns whether leadership was acquired.
    pub async fn acquire(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        info!(lease = LEASE_NAME, identity = %self.identity, "waiting for leadership");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "acquired leadership");
                    return true;
                }
                Ok(false) => debug!("lease held elsewhere, retrying"),
                Err(err) => warn!(error = %err, "leader election attempt failed"),
            }
            tokio::select! {
                _ = shutdown.changed() => return false,
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }

    /// Keep renewing the lease until shutdown. Renewal failures are logged
    /// and retried; a replica that loses the lease this way will be fenced
    /// by the API server on its next status write.
    pub fn spawn_renewal(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(RENEW_INTERVAL) => {
                        if let Err(err) = self.renew().await {
                            warn!(error = %err, "lease renewal failed");
                        }
                    }
                }
            }
        })
    }

    async fn try_acquire(&self) -> anyhow::Result<bool> {
        let api = self.api();
        match api.get_opt(LEASE_NAME).await? {
            None => {
                let lease = self.fresh_lease(None);
                match api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
            Some(existing) => {
                if !lease_available(&existing, &self.identity, Utc::now()) {
                    return Ok(false);
                }
                let mut updated = self.fresh_lease(existing.spec.as_ref());
                updated.metadata = existing.metadata.clone();
                match api
                    .replace(LEASE_NAME, &PostParams::default(), &updated)
                    .await
                {
                    Ok(_) => Ok(true),
                    // Someone else won the same race; back off.
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    async fn renew(&self) -> anyhow::Result<()> {
        let api = self.api();
        let Some(existing) = api.get_opt(LEASE_NAME).await? else {
            // The lease vanished; recreate rather than silently stop
            // renewing.
            api.create(&PostParams::default(), &self.fresh_lease(None))
                .await?;
            return Ok(());
        };
        let mut updated = existing.clone();
        let spec = updated.spec.get_or_insert_with(Default::default);
        spec.holder_identity = Some(self.identity.clone());
        spec.renew_time = Some(MicroTime(Utc::now()));
        api.replace(LEASE_NAME, &PostParams::default(), &updated)
            .await?;
        Ok(())
    }

    fn fresh_lease(&self, previous: Option<&LeaseSpec>) -> Lease {
        let now = Utc::now();
        let transitions = previous
            .map(|spec| match spec.holder_identity.as_deref() {
                Some(holder) if holder != self.identity => {
                    spec.lease_transitions.unwrap_or(0) + 1
                }
                _ => spec.lease_transitions.unwrap_or(0),
            })
            .unwrap_or(0);
        Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }
}

/// Whether `identity` may take the lease now: it is unheld, already ours,
/// or its last renewal is past the lease duration.
fn lease_available(lease: &Lease, identity: &str, now: DateTime<Utc>) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return true;
    };
    match spec.holder_identity.as_deref() {
        None => true,
        Some(holder) if holder == identity => true,
        Some(_) => {
            let duration =
                chrono::Duration::seconds(spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS) as i64);
            let last = spec
                .renew_time
                .as_ref()
                .map(|t| t.0)
                .or_else(|| spec.acquire_time.as_ref().map(|t| t.0));
            match last {
                Some(last) => now.signed_duration_since(last) > duration,
                // A held lease that was never stamped is unreadable; treat
                // it as expired.
                None => true,
            }
        }
    }
}
