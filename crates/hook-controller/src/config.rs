//! Controller configuration.
//!
//! Three layers, later wins: built-in defaults, an optional YAML config
//! file, then environment variables and flags. The kagent connection knobs
//! are environment-first because that is how the Helm chart has always
//! delivered them; `KAGENT_API_BASE_URL` is honored as a legacy alias.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::warn;

/// Default kagent controller endpoint inside the cluster.
pub const DEFAULT_API_URL: &str = "http://kagent-controller.kagent.svc.cluster.local:8083";
/// Default user id attached to created sessions.
pub const DEFAULT_USER_ID: &str = "admin@kagent.dev";
/// Default overall agent-call deadline.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(120);

pub const ENV_API_URL: &str = "KAGENT_API_URL";
pub const ENV_API_URL_LEGACY: &str = "KAGENT_API_BASE_URL";
pub const ENV_USER_ID: &str = "KAGENT_USER_ID";
pub const ENV_API_TIMEOUT: &str = "KAGENT_API_TIMEOUT";

/// Command-line flags, mirroring the usual manager set.
#[derive(Parser, Clone, Debug)]
#[command(
    name = "khook",
    about = "A Kubernetes controller that reacts to cluster events by dispatching kagent agents"
)]
pub struct Opts {
    #[arg(
        long = "metrics-bind-address",
        default_value = "0.0.0.0:8443",
        env = "METRICS_BIND_ADDRESS",
        help = "The address the metric endpoint binds to"
    )]
    pub metrics_bind_address: SocketAddr,

    #[arg(
        long = "health-probe-bind-address",
        default_value = "0.0.0.0:8081",
        env = "HEALTH_PROBE_BIND_ADDRESS",
        help = "The address the health probe endpoint binds to"
    )]
    pub health_probe_bind_address: SocketAddr,

    #[arg(
        long = "console-bind-address",
        default_value = "0.0.0.0:8080",
        env = "CONSOLE_BIND_ADDRESS",
        help = "The address the alert console binds to"
    )]
    pub console_bind_address: SocketAddr,

    #[arg(
        long = "leader-elect",
        default_value_t = false,
        env = "LEADER_ELECT",
        help = "Enable leader election for the controller manager"
    )]
    pub leader_elect: bool,

    #[arg(long = "config", help = "Path to an optional YAML config file")]
    pub config: Option<PathBuf>,
}

/// Optional config-file overrides.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    pub kagent_api_url: Option<String>,
    pub kagent_user_id: Option<String>,
    pub kagent_api_timeout: Option<String>,
    pub leader_elect: Option<bool>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

/// Fully resolved controller configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub kagent_api_url: String,
    pub kagent_user_id: String,
    pub kagent_api_timeout: Duration,
    pub leader_elect: bool,
    pub metrics_addr: SocketAddr,
    pub probe_addr: SocketAddr,
    pub console_addr: SocketAddr,
    /// Namespace for the leader lease, from `POD_NAMESPACE`.
    pub pod_namespace: String,
    /// Identity for leader election and audit records.
    pub identity: String,
}

impl Config {
    /// Resolve the configuration from flags, optional file and environment.
    pub fn load(opts: &Opts) -> anyhow::Result<Self> {
        let file = match &opts.config {
            Some(path) => FileConfig::from_path(path)?,
            None => FileConfig::default(),
        };

        let api_url = resolve_api_url(
            std::env::var(ENV_API_URL).ok(),
            std::env::var(ENV_API_URL_LEGACY).ok(),
            file.kagent_api_url.clone(),
        );
        let user_id = std::env::var(ENV_USER_ID)
            .ok()
            .or_else(|| file.kagent_user_id.clone())
            .unwrap_or_else(|| DEFAULT_USER_ID.to_string());
        let timeout = resolve_timeout(
            std::env::var(ENV_API_TIMEOUT)
                .ok()
                .or_else(|| file.kagent_api_timeout.clone()),
        )?;

        Ok(Config {
            kagent_api_url: api_url,
            kagent_user_id: user_id,
            kagent_api_timeout: timeout,
            leader_elect: opts.leader_elect || file.leader_elect.unwrap_or(false),
            metrics_addr: opts.metrics_bind_address,
            probe_addr: opts.health_probe_bind_address,
            console_addr: opts.console_bind_address,
            pod_namespace: std::env::var("POD_NAMESPACE")
                .unwrap_or_else(|_| "kagent".to_string()),
            identity: std::env::var("POD_NAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_else(|_| "khook".to_string()),
        })
    }
}

fn resolve_api_url(
    primary: Option<String>,
    legacy: Option<String>,
    file: Option<String>,
) -> String {
    if primary.is_none() && legacy.is_some() {
        warn!(
            "{} is deprecated, prefer {}",
            ENV_API_URL_LEGACY, ENV_API_URL
        );
    }
    primary
        .or(legacy)
        .or(file)
        .unwrap_or_else(|| DEFAULT_API_URL.to_string())
}

fn resolve_timeout(value: Option<String>) -> anyhow::Result<Duration> {
    match value {
        None => Ok(DEFAULT_API_TIMEOUT),
        Some(raw) => {
            let parsed = humantime::parse_duration(raw.trim())
                .map_err(|e| anyhow::anyhow!("invalid {}: {}", ENV_API_TIMEOUT, e))?;
            Ok(parsed)
        }
    }
}
