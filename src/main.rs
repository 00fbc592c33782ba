//! khook: react to cluster events by dispatching kagent agents.
//!
//! The binary wires the pieces together: configuration, the kube client,
//! the alert console (every replica), health probes, leader election and
//! the workflow coordinator (leader only). Exit code 0 on a clean
//! shutdown, 1 when startup fails.

mod probes;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use alert_console::AlertStore;
use hook_controller::config::{Config, Opts};
use hook_controller::coordinator::{KubeHookLister, WorkflowCoordinator};
use hook_controller::dedup::DeduplicationManager;
use hook_controller::leader::LeaderElector;
use hook_controller::source::KubernetesEventSource;
use hook_controller::status::KubeStatusManager;
use kagent_client::KagentClient;

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(opts).await {
        error!(error = %format!("{:#}", err), "khook failed to start");
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let config = Config::load(&opts)?;
    info!(
        api_url = %config.kagent_api_url,
        leader_elect = config.leader_elect,
        "starting khook"
    );

    let client = kube::Client::try_default().await?;
    let kagent = KagentClient::new(
        &config.kagent_api_url,
        config.kagent_user_id.clone(),
        config.kagent_api_timeout,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx.clone());

    // The console and probes run on every replica, leader or not.
    let store = Arc::new(AlertStore::new());
    tokio::spawn(store.clone().run_maintenance(shutdown_rx.clone()));
    tokio::spawn(probes::serve(
        config.probe_addr,
        config.metrics_addr,
        store.clone(),
        shutdown_rx.clone(),
    ));
    let console = {
        let store = store.clone();
        let client = client.clone();
        let addr = config.console_addr;
        let shutdown = shutdown_rx.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = alert_console::serve(store, Some(client), addr, shutdown).await {
                error!(error = %err, "alert console failed; shutting down");
                let _ = shutdown_tx.send(true);
            }
        })
    };

    if config.leader_elect {
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            config.pod_namespace.clone(),
            config.identity.clone(),
        ));
        let mut rx = shutdown_rx.clone();
        if !elector.acquire(&mut rx).await {
            info!("shutdown requested before leadership was acquired");
            return Ok(());
        }
        elector.spawn_renewal(shutdown_rx.clone());
    }

    let coordinator = WorkflowCoordinator::new(
        Arc::new(KubeHookLister::new(client.clone())),
        Arc::new(DeduplicationManager::new()),
        Arc::new(KubernetesEventSource::new(client.clone())),
        Arc::new(kagent),
        Arc::new(KubeStatusManager::new(client, config.identity.clone())),
        store,
    );
    coordinator.run(shutdown_rx).await;

    let _ = console.await;
    info!("khook stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        let _ = shutdown.send(true);
    });
}
