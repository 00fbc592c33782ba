//! Client library for the kagent agent API.
//!
//! The controller talks to kagent in two steps: it creates a session scoped
//! to the event that fired, then delivers the expanded prompt to the agent
//! over the A2A endpoint with the session as the context reference. Session
//! creation is never retried; message delivery is retried a bounded number
//! of times with exponential backoff.

mod backoff;
mod client;

pub use client::{AgentRequest, AgentResponse, Error, KagentClient, DEFAULT_CALL_TIMEOUT};
