//! Core types for model interaction.
//!
//! These types model the data flowing between the generation client, the
//! backend adapters and the transports underneath them.  They are
//! provider-agnostic at this layer; a [`super::transport::ChatTransport`]
//! translates them into a wire format.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::Turn;
use crate::schema::{Payload, SchemaContract};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the human user.
    User,
    /// Output from the model.
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a model request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,
    /// The textual content of the message.
    #[serde(default)]
    pub content: String,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend description
// ---------------------------------------------------------------------------

/// The wire convention used to carry structured data in a model reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingMode {
    /// The model emits one JSON object matching the contract.
    Json,
    /// The model emits a function call whose arguments are the contract fields.
    ToolCall,
    /// The model emits free text, wrapped into `chat_message`.
    Markup,
}

impl fmt::Display for EncodingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Json => "json",
            Self::ToolCall => "tool_call",
            Self::Markup => "markup",
        };
        f.write_str(label)
    }
}

/// Everything the engine knows about the selected backend.
///
/// Built once per session by the provider registry and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendDescriptor {
    pub provider_id: String,
    pub model_id: String,
    pub encoding_mode: EncodingMode,
    pub supports_streaming: bool,
    /// Extra request parameters merged into every call (e.g. `max_tokens`).
    pub default_params: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A tool definition exposed to the model in [`EncodingMode::ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's input parameters.
    pub input_schema: Value,
}

/// A provider-neutral generation request: the history to send and the
/// contract the reply must satisfy.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    pub contract: SchemaContract,
}

impl GenerationRequest {
    /// Create an empty request for a contract.
    pub fn new(contract: SchemaContract) -> Self {
        Self {
            messages: Vec::new(),
            contract,
        }
    }

    /// Prepend a system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.messages.insert(0, Message::system(prompt));
        self
    }

    /// Append conversation turns as messages.
    pub fn with_history<'a>(mut self, turns: impl IntoIterator<Item = &'a Turn>) -> Self {
        self.messages.extend(turns.into_iter().map(Turn::to_message));
        self
    }

    /// Append a message.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

/// The request a transport puts on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub encoding_mode: EncodingMode,
    /// The function the model must call ([`EncodingMode::ToolCall`] only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolDefinition>,
    pub params: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// What a transport returns for a non-streaming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawReply {
    /// Free text content.
    Text(String),
    /// A function call; `arguments` is the raw JSON argument string.
    ToolCall { name: String, arguments: String },
}

impl RawReply {
    /// The raw text of the reply, kept for diagnostics.
    pub fn raw_text(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::ToolCall { arguments, .. } => arguments,
        }
    }
}

/// One item of a transport stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportChunk {
    /// A fragment of text content or tool-call arguments.
    Delta(String),
    /// The provider signalled the end of the reply.
    Done,
}

/// A decoded candidate value plus the raw output it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub value: Value,
    pub raw: String,
}

/// One increment of a streaming reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialDecodeEvent {
    /// The text added by this event (may be empty).
    pub raw_fragment: String,
    /// Everything received so far, this event included.
    pub cumulative_text: String,
    /// Set on the one event that closes the stream.
    pub is_final: bool,
}

/// A rendered state of the reply, handed to the UI collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplaySnapshot {
    pub payload: Payload,
    pub is_final: bool,
}

impl DisplaySnapshot {
    /// The text a UI should render: `chat_message`, or empty.
    pub fn text(&self) -> &str {
        self.payload.chat_message().unwrap_or_default()
    }
}
