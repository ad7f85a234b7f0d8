//! HTTP transport for OpenAI-compatible Chat Completions endpoints.
//!
//! Every built-in provider (OpenAI, Anthropic's compatibility endpoint,
//! Groq, Ollama, Gemini, OpenRouter, Nebius) speaks this wire format, so one
//! transport covers them all.  Streaming and non-streaming modes are both
//! supported.  HTTP failures are classified into [`TransportFailure`]s; the
//! transport itself never retries.

use std::collections::VecDeque;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{AgentError, Result, TransportFailure};
use crate::llm::streaming::SseDecoder;
use crate::llm::transport::{ChatTransport, ChunkStream};
use crate::llm::types::{EncodingMode, Message, RawReply, ToolDefinition, TransportChunk, TransportRequest};

/// Default deadline for connecting, and for a whole non-streaming reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// A [`ChatTransport`] speaking the OpenAI Chat Completions API.
#[derive(Debug, Clone)]
pub struct OpenAiCompatTransport {
    provider_id: String,
    base_url: String,
    api_key: Option<String>,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl OpenAiCompatTransport {
    /// Create a transport.  Performs no network I/O.
    ///
    /// `timeout` bounds connecting and whole `complete` calls.  Streamed
    /// bodies are not bounded here; the caller applies an idle deadline per
    /// chunk instead.
    pub fn new(
        provider_id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| AgentError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            provider_id: provider_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.filter(|k| !k.is_empty()),
            request_timeout: timeout,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| {
                AgentError::ConfigError {
                    reason: format!("invalid authorization header: {e}"),
                }
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// POST the body and turn non-success statuses into classified errors.
    async fn send(&self, body: &Value, deadline: Option<Duration>) -> Result<reqwest::Response> {
        let url = self.endpoint();
        tracing::debug!(
            url = %url,
            model = %body["model"],
            provider = %self.provider_id,
            stream = body.get("stream").is_some(),
            "sending chat completion request"
        );

        let mut builder = self.http.post(&url).headers(self.headers()?).json(body);
        if let Some(deadline) = deadline {
            builder = builder.timeout(deadline);
        }
        let resp = builder.send().await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        let failure = TransportFailure::from_status(status.as_u16(), &text);
        tracing::warn!(
            provider = %self.provider_id,
            status = status.as_u16(),
            %failure,
            "chat completion request failed"
        );
        Err(AgentError::transport(
            failure,
            format!("API returned {status}: {text}"),
        ))
    }
}

#[async_trait::async_trait]
impl ChatTransport for OpenAiCompatTransport {
    async fn complete(&self, request: &TransportRequest) -> Result<RawReply> {
        let body = request_body(request, false);
        let resp = self.send(&body, Some(self.request_timeout)).await?;
        let text = resp.text().await?;

        let v: Value = serde_json::from_str(&text).map_err(|e| AgentError::Decode {
            reason: format!("invalid JSON response: {e}"),
            raw: text.clone(),
        })?;
        parse_completion(&v)
    }

    async fn stream(&self, request: &TransportRequest) -> Result<ChunkStream> {
        let body = request_body(request, true);
        let resp = self.send(&body, None).await?;
        let bytes = resp.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed();
        Ok(sse_chunks(bytes))
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Build the JSON body for a Chat Completions request.
pub fn request_body(request: &TransportRequest, stream: bool) -> Value {
    let mut body = Value::Object(request.params.clone());
    body["model"] = json!(request.model);
    body["messages"] = messages_to_wire(&request.messages);

    if let Some(tool) = &request.tool {
        body["tools"] = tools_to_wire(std::slice::from_ref(tool));
        body["tool_choice"] = json!({
            "type": "function",
            "function": { "name": tool.name },
        });
    }

    if request.encoding_mode == EncodingMode::Json {
        body["response_format"] = json!({ "type": "json_object" });
    }

    if stream {
        body["stream"] = json!(true);
    }

    body
}

fn messages_to_wire(messages: &[Message]) -> Value {
    messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect()
}

/// OpenAI wraps each tool in `{"type": "function", "function": {...}}`.
fn tools_to_wire(tools: &[ToolDefinition]) -> Value {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            })
        })
        .collect()
}

/// Parse a non-streaming Chat Completions response.
///
/// A function call takes priority over text content.
pub fn parse_completion(v: &Value) -> Result<RawReply> {
    let message = &v["choices"][0]["message"];
    if message.is_null() {
        return Err(AgentError::Decode {
            reason: "missing `choices[0].message` in response".into(),
            raw: v.to_string(),
        });
    }

    if let Some(call) = message["tool_calls"].as_array().and_then(|calls| calls.first()) {
        let function = &call["function"];
        return Ok(RawReply::ToolCall {
            name: function["name"].as_str().unwrap_or_default().to_owned(),
            arguments: function["arguments"].as_str().unwrap_or("{}").to_owned(),
        });
    }

    let content = message["content"].as_str().unwrap_or_default();
    Ok(RawReply::Text(content.to_owned()))
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

type ByteStream = BoxStream<'static, reqwest::Result<Vec<u8>>>;

struct SseState {
    bytes: ByteStream,
    buffer: Vec<u8>,
    decoder: SseDecoder,
    pending: VecDeque<TransportChunk>,
    finished: bool,
}

impl SseState {
    /// Decode one line; `Err` ends the stream.
    fn feed(&mut self, line: &[u8]) -> Result<()> {
        let line = String::from_utf8_lossy(line);
        if let Some(chunk) = self.decoder.feed_line(&line)? {
            self.pending.push_back(chunk);
        }
        if self.decoder.is_done() {
            self.finished = true;
        }
        Ok(())
    }

    /// Decode every complete line in the buffer.
    fn drain_lines(&mut self) -> Result<()> {
        while !self.finished
            && let Some(pos) = self.buffer.iter().position(|b| *b == b'\n')
        {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.feed(&line)?;
        }
        Ok(())
    }
}

/// Split a byte stream into SSE lines and decode them into chunks.
///
/// Lines are split on raw bytes so multi-byte characters spanning network
/// chunks stay intact.  The stream ends after `[DONE]`.
fn sse_chunks(bytes: ByteStream) -> ChunkStream {
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.pending.pop_front() {
                return Some((Ok(chunk), state));
            }
            if state.finished {
                return None;
            }

            let step = match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    state.drain_lines()
                }
                Some(Err(e)) => Err(AgentError::from(e)),
                None => {
                    state.finished = true;
                    let rest = std::mem::take(&mut state.buffer);
                    state.feed(&rest)
                }
            };

            if let Err(e) = step {
                state.finished = true;
                state.pending.clear();
                return Some((Err(e), state));
            }
        }
    })
    .boxed()
}
