use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::backoff::RetryBackoff;

/// Default deadline applied to a complete agent call (session + message).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

const MESSAGE_SEND_RETRIES: u32 = 3;
const MESSAGE_BACKOFF_BASE: Duration = Duration::from_secs(1);
const MESSAGE_BACKOFF_CAP: Duration = Duration::from_secs(4);

/// Errors returned by [`KagentClient::call_agent`].
#[derive(Debug, Error)]
pub enum Error {
    /// The request never produced an HTTP response.
    #[error("transport error talking to the agent api: {0}")]
    Transport(#[from] reqwest::Error),
    /// The agent API answered with a non-success status or an error body.
    #[error("agent api error (status {status}): {message}")]
    Api { status: u16, message: String },
    /// The overall call deadline elapsed.
    #[error("agent call exceeded the {0:?} deadline")]
    DeadlineExceeded(Duration),
    /// The API answered 2xx but the body was not in the expected shape.
    #[error("invalid response from the agent api: {0}")]
    InvalidResponse(String),
    /// The configured base URL (or a path joined onto it) failed to parse.
    #[error("invalid agent api url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Everything the client needs to dispatch one event to one agent.
#[derive(Clone, Debug)]
pub struct AgentRequest {
    pub agent_name: String,
    pub agent_namespace: String,
    /// Wire form of the event type, used in the generated session name.
    pub event_type: String,
    /// Fully expanded prompt text.
    pub prompt: String,
    pub event_namespace: String,
    pub reason: String,
    pub message: String,
}

/// Result of a successful agent call. The request id is the session id and
/// is the only correlation handle the controller keeps.
#[derive(Clone, Debug)]
pub struct AgentResponse {
    pub request_id: String,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    id: Option<String>,
    #[allow(dead_code)]
    name: Option<String>,
}

/// Session-create response. Some kagent deployments answer with the session
/// at the top level, others wrap it in `data`; `error: true` is fatal in
/// either shape.
#[derive(Debug, Deserialize)]
struct SessionEnvelope {
    id: Option<String>,
    #[allow(dead_code)]
    name: Option<String>,
    data: Option<SessionData>,
    error: Option<bool>,
    message: Option<String>,
}

impl SessionEnvelope {
    fn session_id(self) -> Result<String, Error> {
        if self.error.unwrap_or(false) {
            return Err(Error::Api {
                status: 200,
                message: self
                    .message
                    .unwrap_or_else(|| "agent api reported an error".to_string()),
            });
        }
        self.id
            .or(self.data.and_then(|d| d.id))
            .ok_or_else(|| Error::InvalidResponse("session response carried no id".to_string()))
    }
}

/// HTTP client for the kagent controller API.
#[derive(Clone, Debug)]
pub struct KagentClient {
    http: reqwest::Client,
    base_url: Url,
    user_id: String,
    timeout: Duration,
}

impl KagentClient {
    /// Build a client against `base_url`. Calls are bounded by `timeout`
    /// end to end.
    pub fn new(base_url: &str, user_id: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: Url::parse(base_url)?,
            user_id: user_id.into(),
            timeout,
        })
    }

    /// Create a session and deliver the prompt to the named agent.
    ///
    /// Session creation failures are fatal for the call. The message send is
    /// retried up to three times (1s/2s/4s) on transport errors only; the
    /// session is never re-created.
    pub async fn call_agent(&self, request: AgentRequest) -> Result<AgentResponse, Error> {
        match tokio::time::timeout(self.timeout, self.call_inner(&request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded(self.timeout)),
        }
    }

    async fn call_inner(&self, request: &AgentRequest) -> Result<AgentResponse, Error> {
        let session_id = self.create_session(request).await?;
        let endpoint = self.a2a_endpoint(&request.agent_namespace, &request.agent_name)?;
        let payload = message_send_payload(&session_id, request);

        let mut backoff = RetryBackoff::new(MESSAGE_BACKOFF_BASE, MESSAGE_BACKOFF_CAP);
        let mut retries = 0;
        loop {
            match self.send_message(&endpoint, &payload).await {
                Ok(()) => {
                    debug!(session = %session_id, agent = %request.agent_name, "agent notified");
                    return Ok(AgentResponse {
                        request_id: session_id,
                    });
                }
                Err(Error::Transport(err)) if retries < MESSAGE_SEND_RETRIES => {
                    retries += 1;
                    warn!(
                        retries,
                        error = %err,
                        agent = %request.agent_name,
                        "message send failed, backing off"
                    );
                    backoff.wait().await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn create_session(&self, request: &AgentRequest) -> Result<String, Error> {
        let url = self.base_url.join("/api/sessions")?;
        let name = session_name(&request.event_type, unix_now());
        let body = json!({
            "agentRef": format!("{}/{}", request.agent_namespace, request.agent_name),
            "name": name,
            "userId": self.user_id,
        });

        let response = self.http.post(url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }
        let envelope: SessionEnvelope = response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;
        envelope.session_id()
    }

    async fn send_message(&self, endpoint: &Url, payload: &serde_json::Value) -> Result<(), Error> {
        let response = self.http.post(endpoint.clone()).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }
        // A JSON-RPC level error still arrives with a 200.
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;
        if let Some(err) = body.get("error") {
            if !err.is_null() {
                return Err(Error::Api {
                    status: status.as_u16(),
                    message: err.to_string(),
                });
            }
        }
        Ok(())
    }

    fn a2a_endpoint(&self, agent_namespace: &str, agent_name: &str) -> Result<Url, Error> {
        Ok(self
            .base_url
            .join(&format!("/api/a2a/{}/{}/", agent_namespace, agent_name))?)
    }
}

/// Session names encode the event type and the dispatch second so operators
/// can line sessions up with audit records.
pub(crate) fn session_name(event_type: &str, unix_seconds: u64) -> String {
    format!("hook-{}-{}", event_type, unix_seconds)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn message_send_payload(session_id: &str, request: &AgentRequest) -> serde_json::Value {
    let text = format!(
        "{}\n\nNamespace: {}\nReason: {}\nMessage: {}",
        request.prompt, request.event_namespace, request.reason, request.message
    );
    json!({
        "jsonrpc": "2.0",
        "id": Uuid::new_v4().to_string(),
        "method": "message/send",
        "params": {
            "message": {
                "kind": "message",
                "role": "user",
                "messageId": Uuid::new_v4().to_string(),
                "contextId": session_id,
                "parts": [{"kind": "text", "text": text}],
            }
        }
    })
}
