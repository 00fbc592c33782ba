//! The console HTTP server.
//!
//! Read-mostly warp service over the alert store, plus pass-through CRUD
//! against the cluster's Hook resources. Permissive CORS on every route:
//! the console is meant to sit behind a gateway. The legacy `/api/alerts*`
//! paths mirror `/api/v1/events*` for older dashboards.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use hook_controller::crd::{validate_hook, Hook};
use hook_controller::EventType;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::info;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::query::{self, EventsQuery};
use crate::stats::{self, TimeRange};
use crate::store::{AlertStore, SubscriberKind};
use crate::stream;

/// Run the console server until `shutdown` fires.
///
/// `client` is optional so the console can serve cached alerts even when
/// built without cluster access (tests, local development); hook CRUD and
/// connectivity checks degrade gracefully.
pub async fn serve(
    store: Arc<AlertStore>,
    client: Option<Client>,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let routes = routes(store, client);

    let (bound, server) =
        warp::serve(routes).try_bind_with_graceful_shutdown(addr, async move {
            let mut shutdown = shutdown;
            let _ = shutdown.changed().await;
        })?;
    info!(addr = %bound, "alert console listening");
    server.await;
    info!("alert console stopped");
    Ok(())
}

fn routes(
    store: Arc<AlertStore>,
    client: Option<Client>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type", "authorization"])
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"]);

    api_routes(store, client).with(cors)
}

fn api_routes(
    store: Arc<AlertStore>,
    client: Option<Client>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let events_list = warp::path!("api" / "v1" / "events")
        .and(warp::get())
        .and(warp::query::<EventsQuery>())
        .and(with_store(store.clone()))
        .map(list_events);

    let events_stream = warp::path!("api" / "v1" / "events" / "stream")
        .and(warp::get())
        .and(with_store(store.clone()))
        .map(stream::sse_reply);

    let events_ws = warp::path!("api" / "v1" / "events" / "ws")
        .and(warp::ws())
        .and(with_store(store.clone()))
        .map(|ws: warp::ws::Ws, store: Arc<AlertStore>| {
            ws.on_upgrade(move |socket| stream::ws_connection(socket, store))
        });

    let events_by_type = warp::path!("api" / "v1" / "events" / "types" / String)
        .and(warp::get())
        .and(warp::query::<EventsQuery>())
        .and(with_store(store.clone()))
        .map(list_events_by_type);

    let events_by_namespace = warp::path!("api" / "v1" / "events" / String)
        .and(warp::get())
        .and(warp::query::<EventsQuery>())
        .and(with_store(store.clone()))
        .map(list_events_in_namespace);

    let stats_summary = warp::path!("api" / "v1" / "stats" / "events" / "summary")
        .and(warp::get())
        .and(with_store(store.clone()))
        .map(|store: Arc<AlertStore>| warp::reply::json(&stats::summary(&store.snapshot())));

    let stats_by_type = warp::path!("api" / "v1" / "stats" / "events" / "by-type")
        .and(warp::get())
        .and(with_store(store.clone()))
        .map(|store: Arc<AlertStore>| warp::reply::json(&stats::by_type(&store.snapshot())));

    let stats_trends = warp::path!("api" / "v1" / "stats" / "trends")
        .and(warp::get())
        .and(warp::query::<TrendsQuery>())
        .and(with_store(store.clone()))
        .map(trends);

    let health = warp::path!("api" / "v1" / "health")
        .and(warp::get())
        .map(|| warp::reply::json(&json!({"status": "ok"})));

    let diagnostics = warp::path!("api" / "v1" / "diagnostics")
        .and(warp::get())
        .and(with_store(store.clone()))
        .and(with_client(client.clone()))
        .and_then(diagnostics);

    let metrics = warp::path!("api" / "v1" / "metrics")
        .and(warp::get())
        .and(with_store(store.clone()))
        .map(metrics);

    // Legacy alert paths, kept for older dashboards.
    let legacy_list = warp::path!("api" / "alerts")
        .and(warp::get())
        .and(warp::query::<EventsQuery>())
        .and(with_store(store.clone()))
        .map(list_events);

    let legacy_stream = warp::path!("api" / "alerts" / "stream")
        .and(warp::get())
        .and(with_store(store.clone()))
        .map(stream::sse_reply);

    let legacy_ws = warp::path!("api" / "alerts" / "ws")
        .and(warp::ws())
        .and(with_store(store.clone()))
        .map(|ws: warp::ws::Ws, store: Arc<AlertStore>| {
            ws.on_upgrade(move |socket| stream::ws_connection(socket, store))
        });

    let legacy_by_namespace = warp::path!("api" / "alerts" / String)
        .and(warp::get())
        .and(warp::query::<EventsQuery>())
        .and(with_store(store))
        .map(list_events_in_namespace);

    let hooks = hook_routes(client);

    events_stream
        .or(events_ws)
        .or(events_by_type)
        .or(events_list)
        .or(events_by_namespace)
        .or(stats_summary)
        .or(stats_by_type)
        .or(stats_trends)
        .or(health)
        .or(diagnostics)
        .or(metrics)
        .or(legacy_stream)
        .or(legacy_ws)
        .or(legacy_list)
        .or(legacy_by_namespace)
        .or(hooks)
        .boxed()
}

fn hook_routes(
    client: Option<Client>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let list = warp::path!("api" / "v1" / "hooks")
        .and(warp::get())
        .and(with_client(client.clone()))
        .and_then(list_hooks);

    let create = warp::path!("api" / "v1" / "hooks")
        .and(warp::post())
        .map(|| {
            // Hooks are declarative resources; create them with kubectl or
            // GitOps tooling rather than through the console.
            warp::reply::with_status(
                warp::reply::json(&json!({"error": "hook creation is not supported here"})),
                StatusCode::NOT_IMPLEMENTED,
            )
        });

    let get = warp::path!("api" / "v1" / "hooks" / String / String)
        .and(warp::get())
        .and(with_client(client.clone()))
        .and_then(get_hook);

    let update = warp::path!("api" / "v1" / "hooks" / String / String)
        .and(warp::put())
        .and(warp::body::content_length_limit(1 << 20))
        .and(warp::body::json())
        .and(with_client(client.clone()))
        .and_then(update_hook);

    let delete = warp::path!("api" / "v1" / "hooks" / String / String)
        .and(warp::delete())
        .and(with_client(client))
        .and_then(delete_hook);

    let validate = warp::path!("api" / "v1" / "hooks" / "validate")
        .and(warp::post())
        .and(warp::body::content_length_limit(1 << 20))
        .and(warp::body::json())
        .map(validate_hook_body);

    list.or(create).or(validate).or(get).or(update).or(delete).boxed()
}

fn with_store(
    store: Arc<AlertStore>,
) -> impl Filter<Extract = (Arc<AlertStore>,), Error = Infallible> + Clone {
    warp::any().map(move || store.clone())
}

fn with_client(
    client: Option<Client>,
) -> impl Filter<Extract = (Option<Client>,), Error = Infallible> + Clone {
    warp::any().map(move || client.clone())
}

fn list_events(query: EventsQuery, store: Arc<AlertStore>) -> impl Reply {
    warp::reply::json(&query::apply(store.snapshot(), &query))
}

fn list_events_in_namespace(
    namespace: String,
    mut query: EventsQuery,
    store: Arc<AlertStore>,
) -> impl Reply {
    query.namespace = Some(namespace);
    warp::reply::json(&query::apply(store.snapshot(), &query))
}

fn list_events_by_type(
    event_type: String,
    mut query: EventsQuery,
    store: Arc<AlertStore>,
) -> warp::reply::Response {
    if event_type.parse::<EventType>().is_err() {
        return error_reply(
            StatusCode::BAD_REQUEST,
            &format!("unknown event type {:?}", event_type),
        );
    }
    query.event_type = Some(event_type);
    warp::reply::json(&query::apply(store.snapshot(), &query)).into_response()
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrendsQuery {
    time_range: Option<String>,
}

fn trends(query: TrendsQuery, store: Arc<AlertStore>) -> warp::reply::Response {
    let range = match query.time_range.as_deref() {
        None => TimeRange::Day,
        Some(raw) => match raw.parse::<TimeRange>() {
            Ok(range) => range,
            Err(err) => return error_reply(StatusCode::BAD_REQUEST, &err),
        },
    };
    warp::reply::json(&stats::trends(&store.snapshot(), range, Utc::now())).into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Diagnostics {
    status: &'static str,
    uptime_seconds: i64,
    total_alerts: usize,
    firing_alerts: usize,
    sse_subscribers: usize,
    ws_subscribers: usize,
    kubernetes_connectivity: &'static str,
}

async fn diagnostics(
    store: Arc<AlertStore>,
    client: Option<Client>,
) -> Result<impl Reply, Infallible> {
    let connectivity = match &client {
        None => "disabled",
        Some(client) => match client.apiserver_version().await {
            Ok(_) => "ok",
            Err(_) => "degraded",
        },
    };
    let snapshot = store.snapshot();
    let summary = stats::summary(&snapshot);
    Ok(warp::reply::json(&Diagnostics {
        status: "ok",
        uptime_seconds: (Utc::now() - store.started_at()).num_seconds(),
        total_alerts: summary.total,
        firing_alerts: summary.firing,
        sse_subscribers: store.subscriber_count(SubscriberKind::Sse),
        ws_subscribers: store.subscriber_count(SubscriberKind::WebSocket),
        kubernetes_connectivity: connectivity,
    }))
}

fn metrics(store: Arc<AlertStore>) -> impl Reply {
    warp::reply::json(&json!({
        "alertsPublished": store.counters.alerts_published.load(Ordering::Relaxed),
        "subscribersDropped": store.counters.subscribers_dropped.load(Ordering::Relaxed),
        "activeAlerts": store.snapshot().len(),
        "sseSubscribers": store.subscriber_count(SubscriberKind::Sse),
        "wsSubscribers": store.subscriber_count(SubscriberKind::WebSocket),
        "uptimeSeconds": (Utc::now() - store.started_at()).num_seconds(),
    }))
}

async fn list_hooks(client: Option<Client>) -> Result<warp::reply::Response, Infallible> {
    let Some(client) = client else {
        return Ok(no_cluster_reply());
    };
    let api: Api<Hook> = Api::all(client);
    match api.list(&ListParams::default()).await {
        Ok(hooks) => Ok(warp::reply::json(&hooks.items).into_response()),
        Err(err) => Ok(kube_error_reply(err)),
    }
}

async fn get_hook(
    namespace: String,
    name: String,
    client: Option<Client>,
) -> Result<warp::reply::Response, Infallible> {
    let Some(client) = client else {
        return Ok(no_cluster_reply());
    };
    let api: Api<Hook> = Api::namespaced(client, &namespace);
    match api.get(&name).await {
        Ok(hook) => Ok(warp::reply::json(&hook).into_response()),
        Err(err) => Ok(kube_error_reply(err)),
    }
}

async fn update_hook(
    namespace: String,
    name: String,
    mut hook: Hook,
    client: Option<Client>,
) -> Result<warp::reply::Response, Infallible> {
    let Some(client) = client else {
        return Ok(no_cluster_reply());
    };
    if let Err(err) = validate_hook(&hook.spec) {
        return Ok(error_reply(StatusCode::UNPROCESSABLE_ENTITY, &err.to_string()));
    }
    if hook.name_any() != name {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "hook name does not match the path",
        ));
    }
    hook.metadata.namespace = Some(namespace.clone());
    let api: Api<Hook> = Api::namespaced(client, &namespace);
    match api.replace(&name, &PostParams::default(), &hook).await {
        Ok(updated) => Ok(warp::reply::json(&updated).into_response()),
        Err(err) => Ok(kube_error_reply(err)),
    }
}

async fn delete_hook(
    namespace: String,
    name: String,
    client: Option<Client>,
) -> Result<warp::reply::Response, Infallible> {
    let Some(client) = client else {
        return Ok(no_cluster_reply());
    };
    let api: Api<Hook> = Api::namespaced(client, &namespace);
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => Ok(warp::reply::json(&json!({"deleted": name})).into_response()),
        Err(err) => Ok(kube_error_reply(err)),
    }
}

fn validate_hook_body(hook: Hook) -> warp::reply::Response {
    match validate_hook(&hook.spec) {
        Ok(()) => warp::reply::json(&json!({"valid": true})).into_response(),
        Err(err) => warp::reply::json(&json!({
            "valid": false,
            "error": err.to_string(),
        }))
        .into_response(),
    }
}

fn no_cluster_reply() -> warp::reply::Response {
    error_reply(
        StatusCode::SERVICE_UNAVAILABLE,
        "console is running without cluster access",
    )
}

fn kube_error_reply(err: kube::Error) -> warp::reply::Response {
    let status = match &err {
        kube::Error::Api(response) => {
            StatusCode::from_u16(response.code).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        _ => StatusCode::BAD_GATEWAY,
    };
    error_reply(status, &err.to_string())
}

fn error_reply(status: StatusCode, message: &str) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(&json!({"error": message})), status)
        .into_response()
}
