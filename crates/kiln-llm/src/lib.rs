//! Model client for kiln sessions.
//!
//! The client sends an ordered conversation to a provider and returns the raw
//! response text. Timeouts, retries and backoff live here so the session loop
//! only ever sees a single bounded call.

pub mod client;
pub mod errors;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod types;

pub use client::{Client, CompleteHandler, Middleware};
pub use errors::ModelError;
pub use provider::ProviderAdapter;
pub use providers::{GeminiAdapter, ScriptedAdapter};
pub use retry::{RetryPolicy, delay_for_attempt_ms};
pub use types::{Message, ModelRequest, ModelResponse, Role, Usage};
