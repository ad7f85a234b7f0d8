//! The seam between adapters and the network.
//!
//! A [`ChatTransport`] performs exactly one backend invocation per call and
//! classifies its failures; retrying is the generation client's job.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::llm::types::{RawReply, TransportChunk, TransportRequest};

/// A stream of transport chunks.  A healthy stream ends with
/// [`TransportChunk::Done`]; an `Err` item means the connection broke.
pub type ChunkStream = BoxStream<'static, Result<TransportChunk>>;

/// One way of talking to a chat-completion backend.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send the request and wait for the complete reply.
    async fn complete(&self, request: &TransportRequest) -> Result<RawReply>;

    /// Send the request and return the reply as it arrives.
    ///
    /// Errors returned here happened before any chunk was received and are
    /// classified like [`ChatTransport::complete`] failures.
    async fn stream(&self, request: &TransportRequest) -> Result<ChunkStream>;
}
