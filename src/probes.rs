//! Health probe and metrics listeners.
//!
//! Kept off the console port so probes keep answering even when the
//! console is saturated, and so deployments can scrape metrics without
//! exposing the alert API.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use alert_console::AlertStore;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use warp::Filter;

pub async fn serve(
    probe_addr: SocketAddr,
    metrics_addr: SocketAddr,
    store: Arc<AlertStore>,
    shutdown: watch::Receiver<bool>,
) {
    let healthz = warp::path!("healthz").map(|| "ok");
    let readyz = warp::path!("readyz").map(|| "ok");
    let probe_routes = warp::get().and(healthz.or(readyz));

    let metrics_routes = warp::get().and(warp::path!("metrics")).map(move || {
        warp::reply::json(&json!({
            "alertsPublished": store.counters.alerts_published.load(Ordering::Relaxed),
            "subscribersDropped": store.counters.subscribers_dropped.load(Ordering::Relaxed),
            "activeAlerts": store.snapshot().len(),
        }))
    });

    let mut probe_shutdown = shutdown.clone();
    let probe_server = warp::serve(probe_routes).try_bind_with_graceful_shutdown(
        probe_addr,
        async move {
            let _ = probe_shutdown.changed().await;
        },
    );
    let mut metrics_shutdown = shutdown;
    let metrics_server = warp::serve(metrics_routes).try_bind_with_graceful_shutdown(
        metrics_addr,
        async move {
            let _ = metrics_shutdown.changed().await;
        },
    );

    match (probe_server, metrics_server) {
        (Ok((probe_bound, probe_fut)), Ok((metrics_bound, metrics_fut))) => {
            info!(probes = %probe_bound, metrics = %metrics_bound, "probe listeners up");
            futures::future::join(probe_fut, metrics_fut).await;
        }
        (Err(err), _) | (_, Err(err)) => {
            warn!(error = %err, "failed to bind probe listeners");
        }
    }
}
