//! The agent-dispatch seam of the pipeline.
//!
//! The processor only ever talks to [`AgentCaller`]; the production
//! implementation delegates to [`kagent_client::KagentClient`], and tests
//! substitute recording mocks.

use async_trait::async_trait;
use kagent_client::KagentClient;

pub use kagent_client::{AgentRequest, AgentResponse, Error as AgentCallError};

/// Capability set for dispatching one event to one agent.
#[async_trait]
pub trait AgentCaller: Send + Sync {
    async fn call_agent(&self, request: AgentRequest) -> Result<AgentResponse, AgentCallError>;
}

#[async_trait]
impl AgentCaller for KagentClient {
    async fn call_agent(&self, request: AgentRequest) -> Result<AgentResponse, AgentCallError> {
        KagentClient::call_agent(self, request).await
    }
}
