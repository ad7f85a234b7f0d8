//! Model backend layer.
//!
//! - [`types`] -- Messages, backend descriptors, requests and stream events.
//! - [`transport`] -- The wire boundary: send messages, get text or tool calls.
//! - [`client`] -- HTTP transport for OpenAI-compatible Chat Completions APIs.
//! - [`streaming`] -- SSE line decoder for incremental replies.
//! - [`partial`] -- Lenient decoding of incomplete JSON objects.
//! - [`adapter`] -- Encoding-mode handling on top of a transport.
//! - [`registry`] -- Built-in provider table and adapter construction.
//! - [`mock`] -- Scripted transport for tests and offline use.

pub mod adapter;
pub mod client;
pub mod mock;
pub mod partial;
pub mod registry;
pub mod streaming;
pub mod transport;
pub mod types;

pub use adapter::{BackendAdapter, EncodedAdapter, PartialStream};
pub use client::OpenAiCompatTransport;
pub use mock::{ScriptedResponse, ScriptedTransport};
pub use registry::{Credentials, ProviderEntry, ProviderRegistry, ResolvedBackend};
pub use transport::{ChatTransport, ChunkStream};
pub use types::{
    BackendDescriptor, Candidate, DisplaySnapshot, EncodingMode, GenerationRequest, Message,
    PartialDecodeEvent, RawReply, Role, ToolDefinition, TransportChunk, TransportRequest,
};
