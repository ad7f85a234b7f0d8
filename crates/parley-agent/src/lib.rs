//! Conversational agent runtime for Parley.
//!
//! A user's text becomes a schema-checked turn, the recent history is sent
//! to a model backend, and the reply is validated against the output
//! contract before it is committed to memory.  Streaming replies are shown
//! as monotonic display snapshots while they arrive.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────────┐     ┌─────────────────┐
//! │ AgentRuntime │────>│ GenerationClient │────>│ BackendAdapter  │
//! │  (one turn)  │     │ (retry/validate) │     │ (encoding mode) │
//! └──────┬───────┘     └────────┬─────────┘     └────────┬────────┘
//!        │                      │                        │
//! ┌──────┴─────────────┐ ┌──────┴───────────┐   ┌────────┴────────┐
//! │ ConversationMemory │ │ StreamReconciler │   │  ChatTransport  │
//! │  (turn history)    │ │ (display state)  │   │  (HTTP / SSE)   │
//! └────────────────────┘ └──────────────────┘   └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`schema`] -- Payloads and the contracts they are validated against.
//! - [`memory`] -- Ordered, role-attributed turn history.
//! - [`llm`] -- Backend adapters, transports and the provider registry.
//! - [`generation`] -- Transport retries and corrective validation retries.
//! - [`reconciler`] -- Turns partial decode events into display snapshots.
//! - [`runtime`] -- One conversational turn, end to end.
//! - [`config`] -- File configuration.
//! - [`error`] -- Agent error types.

pub mod config;
pub mod error;
pub mod generation;
pub mod llm;
pub mod memory;
pub mod reconciler;
pub mod runtime;
pub mod schema;

// Re-export the most commonly used types at the crate root.
pub use config::{DEFAULT_CONFIG_PATH, DEFAULT_GREETING, ParleyConfig};
pub use error::{AgentError, Result, TransportFailure};
pub use generation::{BackoffPolicy, Generation, GenerationClient, GenerationConfig, SnapshotStream};
pub use llm::{
    BackendAdapter, BackendDescriptor, ChatTransport, Credentials, DisplaySnapshot, EncodedAdapter,
    EncodingMode, GenerationRequest, Message, ProviderRegistry, Role,
};
pub use memory::{ConversationMemory, RetentionPolicy, Turn};
pub use reconciler::{Observation, ReconcilerState, StreamReconciler};
pub use runtime::{AgentConfig, AgentRuntime, TurnStream};
pub use schema::{FieldType, FieldViolation, Payload, SchemaContract, ViolationKind};
