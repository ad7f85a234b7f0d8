//! SSE line decoder for OpenAI-compatible Chat Completions streams.
//!
//! The stream sends `data:` lines whose JSON payloads carry
//! `choices[0].delta` objects and terminates with a `data: [DONE]` sentinel.
//! Text content and function-call argument fragments are both surfaced as
//! [`TransportChunk::Delta`]; the encoding mode decides how to read them.

use serde_json::Value;

use crate::error::{AgentError, Result, TransportFailure};
use crate::llm::types::TransportChunk;

/// Turns raw SSE lines into transport chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once the `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a single line from the stream.
    ///
    /// Returns `Ok(None)` for comments, blank lines, non-data fields and
    /// payloads without content.
    pub fn feed_line(&mut self, line: &str) -> Result<Option<TransportChunk>> {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with(':') {
            return Ok(None);
        }

        let Some(data) = line.strip_prefix("data:") else {
            tracing::trace!(line, "ignoring non-data SSE line");
            return Ok(None);
        };
        let data = data.trim();

        if data == "[DONE]" {
            self.done = true;
            return Ok(Some(TransportChunk::Done));
        }

        let v: Value = serde_json::from_str(data).map_err(|e| AgentError::Decode {
            reason: format!("invalid JSON in SSE data: {e}"),
            raw: data.to_owned(),
        })?;

        // Some providers report failures inside an open stream.
        if let Some(error) = v.get("error").filter(|e| !e.is_null()) {
            let message = error["message"].as_str().unwrap_or("stream error");
            return Err(AgentError::transport(TransportFailure::Server, message));
        }

        let delta = &v["choices"][0]["delta"];
        if delta.is_null() {
            return Ok(None);
        }

        let mut fragment = String::new();
        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for call in tool_calls {
                if let Some(arguments) = call["function"]["arguments"].as_str() {
                    fragment.push_str(arguments);
                }
            }
        }
        if fragment.is_empty()
            && let Some(content) = delta["content"].as_str()
        {
            fragment.push_str(content);
        }

        Ok((!fragment.is_empty()).then_some(TransportChunk::Delta(fragment)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> Option<TransportChunk> {
        Some(TransportChunk::Delta(text.to_owned()))
    }

    #[test]
    fn text_content_deltas() {
        let mut decoder = SseDecoder::new();
        let first = decoder
            .feed_line(r#"data: {"id":"c1","choices":[{"index":0,"delta":{"content":"Hello"}}]}"#)
            .unwrap();
        assert_eq!(first, delta("Hello"));

        let second = decoder
            .feed_line(r#"data:{"id":"c1","choices":[{"index":0,"delta":{"content":" world"}}]}"#)
            .unwrap();
        assert_eq!(second, delta(" world"));
    }

    #[test]
    fn done_sentinel() {
        let mut decoder = SseDecoder::new();
        assert!(!decoder.is_done());
        assert_eq!(decoder.feed_line("data: [DONE]").unwrap(), Some(TransportChunk::Done));
        assert!(decoder.is_done());
    }

    #[test]
    fn blank_comment_and_event_lines_ignored() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed_line("").unwrap().is_none());
        assert!(decoder.feed_line(": keepalive").unwrap().is_none());
        assert!(decoder.feed_line("event: message").unwrap().is_none());
    }

    #[test]
    fn role_only_and_empty_deltas_ignored() {
        let mut decoder = SseDecoder::new();
        let line = r#"data: {"choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#;
        assert!(decoder.feed_line(line).unwrap().is_none());
        let line = r#"data: {"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#;
        assert!(decoder.feed_line(line).unwrap().is_none());
    }

    #[test]
    fn tool_call_argument_fragments() {
        let mut decoder = SseDecoder::new();
        let first = decoder
            .feed_line(
                r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"OutputSchema","arguments":""}}]}}]}"#,
            )
            .unwrap();
        assert!(first.is_none());

        let second = decoder
            .feed_line(
                r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"chat_message\":"}}]}}]}"#,
            )
            .unwrap();
        assert_eq!(second, delta(r#"{"chat_message":"#));
    }

    #[test]
    fn invalid_json_is_a_decode_error() {
        let mut decoder = SseDecoder::new();
        let err = decoder.feed_line("data: {invalid json}").unwrap_err();
        assert!(matches!(err, AgentError::Decode { .. }));
    }

    #[test]
    fn in_stream_error_is_a_transport_failure() {
        let mut decoder = SseDecoder::new();
        let err = decoder
            .feed_line(r#"data: {"error":{"message":"upstream overloaded"}}"#)
            .unwrap_err();
        assert!(err.is_retryable_transport());
    }
}
