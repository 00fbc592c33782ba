//! Core library for the khook controller.
//!
//! khook watches the cluster event stream and reacts to a small taxonomy of
//! pod-level incidents (restarts, pending scheduling, OOM kills, probe
//! failures) by dispatching kagent agents. The moving parts:
//!
//! * [`crd`]: the `Hook` custom resource and its admission rules.
//! * [`classifier`]: pure mapping from raw cluster events to the taxonomy.
//! * [`source`]: namespace-scoped event watch behind the [`source::EventSource`] seam.
//! * [`dedup`]: the in-memory active-event table and suppression window.
//! * [`template`]: safe expansion of user-authored prompt templates.
//! * [`agent`]: the [`agent::AgentCaller`] seam over the kagent client.
//! * [`status`]: hook status projection and audit records.
//! * [`processor`]: the per-namespace pipeline binding all of the above.
//! * [`coordinator`]: cluster-wide hook discovery and workflow supervision.
//! * [`leader`]: lease-based leader election for the coordinator.
//!
//! Deduplication state lives in process memory for the lifetime of the
//! controller. After a restart the first event for any key is delivered
//! again even if one was delivered before the restart; this is a known
//! behavior, not a bug.

pub mod agent;
pub mod alerts;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod crd;
pub mod dedup;
pub mod event;
pub mod leader;
pub mod processor;
pub mod source;
pub mod status;
pub mod template;

pub use crd::{AgentRef, EventConfiguration, EventStatus, EventType, Hook, HookSpec, HookStatus};
pub use event::ClassifiedEvent;
