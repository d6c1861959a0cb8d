//! # Conductor Core
//!
//! Conductor Core is the task queue engine of a multi-agent coordination
//! system: users define queues of prompts addressed to worker agents
//! reachable over HTTP, and the engine dispatches them concurrently with
//! bounded parallelism, streams progress to observers in real time,
//! retries transient failures with exponential backoff, and durably
//! persists state so that crashes do not lose queues.
//!
//! ## Architecture
//!
//! - **Agent Invoker**: streaming NDJSON HTTP client for one dispatch
//! - **Queue Store**: durable persistence (Redis, with an in-memory
//!   fallback) plus per-queue pub/sub of lifecycle events
//! - **Scheduler**: per-queue dispatch loop with priority selection,
//!   retry policy, and pause/resume/stop
//! - **Control API**: HTTP lifecycle endpoints and the SSE event stream
//!   that drives execution
//! - **Recovery**: startup pass folding interrupted queues back to a
//!   resumable paused state

/// Worker agent descriptors and registry
pub mod agents;
/// HTTP control API and SSE streaming
pub mod api;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and handling
pub mod error;
/// Streaming agent invocation client
pub mod invoker;
/// Core data models and events
pub mod models;
/// Per-queue scheduling and recovery
pub mod scheduler;
/// Durable queue store and pub/sub
pub mod store;

#[cfg(test)]
mod tests;

pub use error::{ConductorError, Result};
