//! Backend adapters.
//!
//! An adapter turns a provider-neutral [`GenerationRequest`] into one
//! [`TransportRequest`] shaped by the backend's [`EncodingMode`], and turns
//! the raw reply back into a candidate value.  It never validates and never
//! retries.
//!
//! | Mode       | Request                                    | Reply                         |
//! |------------|--------------------------------------------|-------------------------------|
//! | `Json`     | schema instruction in the system message   | first JSON object in the text |
//! | `ToolCall` | one forced function named after the schema | function-call arguments       |
//! | `Markup`   | unchanged                                  | text wrapped as `chat_message`|

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde_json::Value;
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::llm::partial::{extract_object, parse_partial_object};
use crate::llm::transport::{ChatTransport, ChunkStream};
use crate::llm::types::{
    BackendDescriptor, Candidate, EncodingMode, GenerationRequest, Message, PartialDecodeEvent,
    RawReply, Role, ToolDefinition, TransportChunk, TransportRequest,
};
use crate::schema::{Payload, SchemaContract};

/// A stream of partial decode events.  Exactly one event has `is_final` set
/// on a healthy stream, and it is the last one.
pub type PartialStream = BoxStream<'static, Result<PartialDecodeEvent>>;

/// Anything that can produce candidates for a contract.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// The backend this adapter talks to.
    fn descriptor(&self) -> &BackendDescriptor;

    /// One invocation, decoded into a candidate.
    async fn generate(&self, request: &GenerationRequest) -> Result<Candidate>;

    /// One streaming invocation, surfaced as partial decode events.
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<PartialStream>;
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

impl EncodingMode {
    /// Decode a complete reply into a candidate.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Decode`] when no object can be recovered.
    pub fn decode_reply(self, reply: RawReply) -> Result<Candidate> {
        match reply {
            RawReply::ToolCall { arguments, .. } => decode_object(arguments),
            RawReply::Text(text) => self.decode_final(&text),
        }
    }

    /// Decode the full text of a finished stream into a candidate.
    pub fn decode_final(self, text: &str) -> Result<Candidate> {
        match self {
            Self::Markup => Ok(Candidate {
                value: Payload::chat(text.trim()).to_value(),
                raw: text.to_owned(),
            }),
            Self::Json | Self::ToolCall => decode_object(text.to_owned()),
        }
    }

    /// Best-effort decode of an unfinished stream.
    pub fn decode_partial(self, text: &str) -> Option<Payload> {
        match self {
            Self::Markup => Some(Payload::chat(text.trim_start())),
            Self::Json | Self::ToolCall => parse_partial_object(text).map(Payload::from),
        }
    }
}

fn decode_object(raw: String) -> Result<Candidate> {
    match extract_object(&raw) {
        Some(map) => Ok(Candidate {
            value: Value::Object(map),
            raw,
        }),
        None => Err(AgentError::Decode {
            reason: "reply does not contain a JSON object".into(),
            raw,
        }),
    }
}

// ---------------------------------------------------------------------------
// Request encoding
// ---------------------------------------------------------------------------

fn json_instruction(contract: &SchemaContract) -> String {
    let schema = serde_json::to_string_pretty(contract.json_schema())
        .unwrap_or_else(|_| contract.json_schema().to_string());
    format!(
        "Respond with a single JSON object that conforms to the following JSON schema. \
         Do not add any text outside the JSON object.\n\n{schema}"
    )
}

/// Function names are limited to `[A-Za-z0-9_-]`.
fn tool_name(contract: &SchemaContract) -> String {
    contract
        .name()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn tool_definition(contract: &SchemaContract) -> ToolDefinition {
    let description = if contract.description().is_empty() {
        format!("Reply using the `{}` structure.", contract.name())
    } else {
        contract.description().to_owned()
    };
    ToolDefinition {
        name: tool_name(contract),
        description,
        input_schema: contract.json_schema().clone(),
    }
}

// ---------------------------------------------------------------------------
// Encoded adapter
// ---------------------------------------------------------------------------

/// The adapter used for every registry backend: encodes per
/// [`EncodingMode`] and delegates the wire to a [`ChatTransport`].
#[derive(Clone)]
pub struct EncodedAdapter {
    descriptor: Arc<BackendDescriptor>,
    transport: Arc<dyn ChatTransport>,
}

impl std::fmt::Debug for EncodedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedAdapter")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl EncodedAdapter {
    pub fn new(descriptor: BackendDescriptor, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            transport,
        }
    }

    /// Shape `request` for this backend's encoding mode.
    pub fn transport_request(&self, request: &GenerationRequest) -> TransportRequest {
        let mut messages = request.messages.clone();
        let mut tool = None;

        match self.descriptor.encoding_mode {
            EncodingMode::Json => {
                let instruction = json_instruction(&request.contract);
                match messages.first_mut() {
                    Some(first) if first.role == Role::System => {
                        first.content.push_str("\n\n");
                        first.content.push_str(&instruction);
                    }
                    _ => messages.insert(0, Message::system(instruction)),
                }
            }
            EncodingMode::ToolCall => tool = Some(tool_definition(&request.contract)),
            EncodingMode::Markup => {}
        }

        TransportRequest {
            model: self.descriptor.model_id.clone(),
            messages,
            encoding_mode: self.descriptor.encoding_mode,
            tool,
            params: self.descriptor.default_params.clone(),
        }
    }
}

#[async_trait]
impl BackendAdapter for EncodedAdapter {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Candidate> {
        let wire = self.transport_request(request);
        debug!(
            provider = %self.descriptor.provider_id,
            model = %wire.model,
            mode = %wire.encoding_mode,
            messages = wire.messages.len(),
            "invoking backend"
        );
        let reply = self.transport.complete(&wire).await?;
        self.descriptor.encoding_mode.decode_reply(reply)
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<PartialStream> {
        let wire = self.transport_request(request);
        debug!(
            provider = %self.descriptor.provider_id,
            model = %wire.model,
            mode = %wire.encoding_mode,
            messages = wire.messages.len(),
            "opening backend stream"
        );
        let chunks = self.transport.stream(&wire).await?;
        Ok(partial_events(chunks))
    }
}

/// Fold transport chunks into cumulative partial decode events.
///
/// `Done` becomes the final event and ends the stream; a stream that ends
/// without `Done` produces no final event.
pub fn partial_events(chunks: ChunkStream) -> PartialStream {
    stream::unfold(Some((chunks, String::new())), |state| async move {
        let Some((mut chunks, mut text)) = state else {
            return None;
        };
        loop {
            let Some(chunk) = chunks.next().await else {
                return None;
            };
            match chunk {
                Ok(TransportChunk::Delta(fragment)) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    text.push_str(&fragment);
                    let event = PartialDecodeEvent {
                        raw_fragment: fragment,
                        cumulative_text: text.clone(),
                        is_final: false,
                    };
                    return Some((Ok(event), Some((chunks, text))));
                }
                Ok(TransportChunk::Done) => {
                    let event = PartialDecodeEvent {
                        raw_fragment: String::new(),
                        cumulative_text: text,
                        is_final: true,
                    };
                    return Some((Ok(event), None));
                }
                Err(e) => return Some((Err(e), None)),
            }
        }
    })
    .boxed()
}
