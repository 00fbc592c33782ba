//! Operator-facing alert console for khook.
//!
//! The pipeline projects every successful agent dispatch into an in-memory
//! [`store::AlertStore`]; this crate serves that table over a versioned
//! HTTP API plus live SSE and WebSocket streams. The console is read-mostly
//! and holds no state across restarts, like the deduplication table it
//! mirrors.

pub mod alert;
pub mod query;
pub mod server;
pub mod stats;
pub mod store;
pub mod stream;

pub use alert::{Alert, Severity, StreamMessage};
pub use server::serve;
pub use store::AlertStore;
