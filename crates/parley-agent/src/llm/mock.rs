//! Scripted transport for tests and offline demos.
//!
//! [`ScriptedTransport`] replays a queue of prepared responses in order and
//! records every request it receives, so tests can drive the generation
//! client through retries, broken streams and schema failures without a
//! network.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;

use crate::error::{AgentError, Result, TransportFailure};
use crate::llm::transport::{ChatTransport, ChunkStream};
use crate::llm::types::{RawReply, TransportChunk, TransportRequest};

/// One prepared backend invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    /// A complete reply.  Streamed as one delta followed by `Done`.
    Reply(RawReply),
    /// A streamed reply.  Joined into one text reply for non-streaming calls.
    Chunks(Vec<TransportChunk>),
    /// A stream that yields some chunks and then breaks.
    BrokenStream {
        chunks: Vec<TransportChunk>,
        failure: TransportFailure,
    },
    /// A stream that yields some chunks and then goes silent without ending.
    StalledStream(Vec<TransportChunk>),
    /// A failed invocation.
    Failure(TransportFailure),
}

impl ScriptedResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Reply(RawReply::Text(text.into()))
    }

    pub fn tool_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self::Reply(RawReply::ToolCall {
            name: name.into(),
            arguments: arguments.into(),
        })
    }

    /// A well-terminated stream of the given fragments.
    pub fn stream<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut chunks: Vec<_> = fragments
            .into_iter()
            .map(|f| TransportChunk::Delta(f.into()))
            .collect();
        chunks.push(TransportChunk::Done);
        Self::Chunks(chunks)
    }

    /// A stream of the given fragments that ends without `Done`.
    pub fn truncated_stream<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Chunks(
            fragments
                .into_iter()
                .map(|f| TransportChunk::Delta(f.into()))
                .collect(),
        )
    }

    pub fn failure(failure: TransportFailure) -> Self {
        Self::Failure(failure)
    }
}

/// A [`ChatTransport`] that replays [`ScriptedResponse`]s.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    responses: Arc<Mutex<VecDeque<ScriptedResponse>>>,
    calls: Arc<Mutex<Vec<TransportRequest>>>,
    delay: Duration,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response.
    pub fn with(self, response: ScriptedResponse) -> Self {
        self.push(response);
        self
    }

    /// Queue a response on a shared handle.
    pub fn push(&self, response: ScriptedResponse) {
        locked(&self.responses).push_back(response);
    }

    /// Wait this long before answering each invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of invocations received so far.
    pub fn call_count(&self) -> usize {
        locked(&self.calls).len()
    }

    /// Every request received so far, oldest first.
    pub fn calls(&self) -> Vec<TransportRequest> {
        locked(&self.calls).clone()
    }

    /// Responses not yet consumed.
    pub fn remaining(&self) -> usize {
        locked(&self.responses).len()
    }

    async fn next_response(&self, request: &TransportRequest) -> Result<ScriptedResponse> {
        locked(&self.calls).push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        locked(&self.responses)
            .pop_front()
            .ok_or_else(|| AgentError::Internal("scripted transport has no responses left".into()))
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn complete(&self, request: &TransportRequest) -> Result<RawReply> {
        match self.next_response(request).await? {
            ScriptedResponse::Reply(reply) => Ok(reply),
            ScriptedResponse::Chunks(chunks) | ScriptedResponse::StalledStream(chunks) => {
                Ok(RawReply::Text(join_deltas(&chunks)))
            }
            ScriptedResponse::BrokenStream { failure, .. } | ScriptedResponse::Failure(failure) => {
                Err(AgentError::transport(failure, "scripted failure"))
            }
        }
    }

    async fn stream(&self, request: &TransportRequest) -> Result<ChunkStream> {
        let chunks = match self.next_response(request).await? {
            ScriptedResponse::Reply(reply) => vec![
                Ok(TransportChunk::Delta(reply.raw_text().to_owned())),
                Ok(TransportChunk::Done),
            ],
            ScriptedResponse::Chunks(chunks) => chunks.into_iter().map(Ok).collect(),
            ScriptedResponse::BrokenStream { chunks, failure } => {
                let mut items: Vec<Result<TransportChunk>> = chunks.into_iter().map(Ok).collect();
                items.push(Err(AgentError::transport(failure, "scripted stream break")));
                items
            }
            ScriptedResponse::StalledStream(chunks) => {
                let items: Vec<Result<TransportChunk>> = chunks.into_iter().map(Ok).collect();
                return Ok(stream::iter(items).chain(stream::pending()).boxed());
            }
            ScriptedResponse::Failure(failure) => {
                return Err(AgentError::transport(failure, "scripted failure"));
            }
        };
        Ok(stream::iter(chunks).boxed())
    }
}

fn join_deltas(chunks: &[TransportChunk]) -> String {
    chunks
        .iter()
        .filter_map(|chunk| match chunk {
            TransportChunk::Delta(text) => Some(text.as_str()),
            TransportChunk::Done => None,
        })
        .collect()
}
