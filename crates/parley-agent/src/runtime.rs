//! Agent runtime.
//!
//! Orchestrates one conversational turn end to end: the user's text becomes
//! an input turn, the recent history is sent through the generation client,
//! and the validated reply becomes the next assistant turn.
//!
//! At most one turn may be in flight per runtime.  A second call while one is
//! outstanding fails with [`AgentError::TurnInProgress`] instead of queueing.
//! A failed or cancelled turn keeps the user's input but never commits an
//! assistant turn.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tracing::field::Empty;
use tracing::{Span, debug, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::generation::{GenerationClient, SnapshotStream};
use crate::llm::types::{BackendDescriptor, DisplaySnapshot, GenerationRequest, Role};
use crate::memory::{ConversationMemory, Turn};
use crate::schema::Payload;

/// Default number of recent turns sent with each request.
pub const DEFAULT_CONTEXT_WINDOW: usize = 20;

/// Per-session runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// How many recent turns are sent to the backend.
    pub context_window: usize,
    /// Prepended to every request; never stored in memory.
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            context_window: DEFAULT_CONTEXT_WINDOW,
            system_prompt: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Turn guard
// ---------------------------------------------------------------------------

/// Marks a turn as in flight until dropped.
#[derive(Debug)]
struct TurnGuard {
    flag: Arc<AtomicBool>,
}

impl TurnGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AgentError::TurnInProgress)?;
        Ok(Self {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn lock(memory: &Mutex<ConversationMemory>) -> MutexGuard<'_, ConversationMemory> {
    memory.lock().unwrap_or_else(PoisonError::into_inner)
}

fn commit_reply(memory: &Mutex<ConversationMemory>, payload: Payload) -> Result<u64> {
    let index = lock(memory).append(Role::Assistant, payload)?;
    debug!(sequence_index = index, "assistant turn committed");
    Ok(index)
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Owns one conversation and drives its turns.
#[derive(Debug)]
pub struct AgentRuntime {
    memory: Arc<Mutex<ConversationMemory>>,
    client: GenerationClient,
    config: AgentConfig,
    in_flight: Arc<AtomicBool>,
    greeting: Payload,
    session_id: Uuid,
}

impl AgentRuntime {
    /// Take ownership of a seeded memory and a generation client.
    pub fn new(memory: ConversationMemory, client: GenerationClient, config: AgentConfig) -> Self {
        let greeting = memory
            .history()
            .into_iter()
            .next()
            .map(|turn| turn.payload().clone())
            .unwrap_or_default();
        let session_id = memory.session_id();

        info!(
            session = %session_id,
            provider = %client.descriptor().provider_id,
            model = %client.descriptor().model_id,
            "agent runtime ready"
        );

        Self {
            memory: Arc::new(Mutex::new(memory)),
            client,
            config,
            in_flight: Arc::new(AtomicBool::new(false)),
            greeting,
            session_id,
        }
    }

    /// The greeting the conversation was seeded with.
    pub fn greeting(&self) -> &Payload {
        &self.greeting
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        self.client.descriptor()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Returns `true` while a turn is in flight.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Snapshot of the retained conversation, oldest first.
    pub fn history(&self) -> Vec<Turn> {
        lock(&self.memory).history()
    }

    /// Run one turn and return the validated reply.
    ///
    /// # Errors
    ///
    /// - [`AgentError::TurnInProgress`] if another turn is outstanding.
    /// - Any generation error; the user turn stays in memory and no
    ///   assistant turn is committed.
    #[instrument(skip(self, text), fields(session = %self.session_id, turn = Empty))]
    pub async fn handle_user_input(&self, text: &str) -> Result<Payload> {
        let _guard = TurnGuard::acquire(&self.in_flight)?;
        let (turn, request) = self.begin_turn(text)?;
        Span::current().record("turn", turn);

        let generation = match self.client.generate(request).await {
            Ok(generation) => generation,
            Err(e) => {
                warn!(error = %e, "turn failed");
                return Err(e);
            }
        };

        let index = commit_reply(&self.memory, generation.value.clone())?;
        info!(
            sequence_index = index,
            attempts = generation.attempts,
            "turn completed"
        );
        Ok(generation.value)
    }

    /// Run one turn as a stream of display snapshots.
    ///
    /// The turn stays in flight until the stream yields its final snapshot,
    /// yields an error, or is dropped.  The assistant turn is committed when
    /// the final snapshot is produced.  Dropping the stream early cancels the
    /// backend call and commits nothing.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`AgentError::TurnInProgress`] if another turn
    /// is outstanding.
    pub fn handle_user_input_streaming(&self, text: &str) -> Result<TurnStream> {
        let guard = TurnGuard::acquire(&self.in_flight)?;
        let (turn, request) = self.begin_turn(text)?;
        let span = info_span!("turn_stream", session = %self.session_id, turn);
        span.in_scope(|| debug!("streaming turn started"));

        Ok(TurnStream {
            inner: self.client.generate_stream(request),
            memory: Arc::clone(&self.memory),
            guard: Some(guard),
            span,
        })
    }

    /// Append the user turn and build the request from the recent window.
    fn begin_turn(&self, text: &str) -> Result<(u64, GenerationRequest)> {
        let mut memory = lock(&self.memory);
        let index = memory.append(Role::User, Payload::chat(text))?;
        debug!(sequence_index = index, "user turn appended");

        let window = memory.window(self.config.context_window);
        let mut request =
            GenerationRequest::new(memory.output_contract().clone()).with_history(&window);
        if let Some(prompt) = &self.config.system_prompt {
            request = request.with_system_prompt(prompt.clone());
        }
        Ok((index, request))
    }
}

// ---------------------------------------------------------------------------
// Streaming turn
// ---------------------------------------------------------------------------

/// The display snapshots of one streaming turn.
///
/// Finite and not restartable: it ends after the final snapshot or the first
/// error.
pub struct TurnStream {
    inner: SnapshotStream,
    memory: Arc<Mutex<ConversationMemory>>,
    guard: Option<TurnGuard>,
    span: Span,
}

impl std::fmt::Debug for TurnStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnStream")
            .field("active", &self.guard.is_some())
            .finish_non_exhaustive()
    }
}

impl Stream for TurnStream {
    type Item = Result<DisplaySnapshot>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.guard.is_none() {
            return Poll::Ready(None);
        }
        let _entered = this.span.enter();

        let item = match this.inner.poll_next_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(item) => item,
        };

        match item {
            Some(Ok(snapshot)) if snapshot.is_final => {
                let committed = commit_reply(&this.memory, snapshot.payload.clone());
                this.guard = None;
                match committed {
                    Ok(index) => {
                        info!(sequence_index = index, "streamed turn completed");
                        Poll::Ready(Some(Ok(snapshot)))
                    }
                    Err(e) => Poll::Ready(Some(Err(e))),
                }
            }
            Some(Ok(snapshot)) => Poll::Ready(Some(Ok(snapshot))),
            Some(Err(e)) => {
                warn!(error = %e, "streamed turn failed");
                this.guard = None;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.guard = None;
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{BackoffPolicy, GenerationConfig};
    use crate::llm::adapter::EncodedAdapter;
    use crate::llm::mock::{ScriptedResponse, ScriptedTransport};
    use crate::llm::types::EncodingMode;
    use serde_json::Map;
    use std::time::Duration;

    fn runtime_with(transport: &ScriptedTransport, config: AgentConfig) -> AgentRuntime {
        let descriptor = BackendDescriptor {
            provider_id: "test".into(),
            model_id: "test-model".into(),
            encoding_mode: EncodingMode::ToolCall,
            supports_streaming: true,
            default_params: Map::new(),
        };
        let adapter = EncodedAdapter::new(descriptor, Arc::new(transport.clone()));
        let generation = GenerationConfig {
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                factor: 2.0,
                cap: Duration::from_millis(2),
            },
            ..GenerationConfig::default()
        };
        let client = GenerationClient::new(Arc::new(adapter), generation);
        let memory = ConversationMemory::with_greeting("Hello! How can I assist you today?").unwrap();
        AgentRuntime::new(memory, client, config)
    }

    fn runtime(transport: &ScriptedTransport) -> AgentRuntime {
        runtime_with(transport, AgentConfig::default())
    }

    fn texts(turns: &[Turn]) -> Vec<(Role, String)> {
        turns
            .iter()
            .map(|t| (t.role(), t.payload().chat_message().unwrap_or_default().to_owned()))
            .collect()
    }

    #[tokio::test]
    async fn turn_appends_user_and_assistant() {
        let transport = ScriptedTransport::new().with(ScriptedResponse::tool_call(
            "OutputSchema",
            r#"{"chat_message": "hi there"}"#,
        ));
        let runtime = runtime(&transport);
        assert_eq!(runtime.history().len(), 1);

        let reply = runtime.handle_user_input("hello").await.unwrap();
        assert_eq!(reply, Payload::chat("hi there"));
        assert_eq!(
            texts(&runtime.history()),
            vec![
                (Role::Assistant, "Hello! How can I assist you today?".to_owned()),
                (Role::User, "hello".to_owned()),
                (Role::Assistant, "hi there".to_owned()),
            ]
        );
        assert!(!runtime.is_busy());
    }

    #[tokio::test]
    async fn request_carries_window_and_system_prompt() {
        let transport = ScriptedTransport::new().with(ScriptedResponse::tool_call(
            "OutputSchema",
            r#"{"chat_message": "sure"}"#,
        ));
        let config = AgentConfig {
            context_window: 1,
            system_prompt: Some("You are terse.".into()),
        };
        let runtime = runtime_with(&transport, config);
        runtime.handle_user_input("question").await.unwrap();

        let messages = &transport.calls()[0].messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "You are terse.");
        assert_eq!(messages[1].content, "question");
        // The system prompt is scratch; memory holds greeting, user, reply.
        assert_eq!(runtime.history().len(), 3);
    }

    #[tokio::test]
    async fn failed_turn_keeps_only_user_input() {
        let transport = ScriptedTransport::new();
        for _ in 0..4 {
            transport.push(ScriptedResponse::tool_call("OutputSchema", "{}"));
        }
        let runtime = runtime(&transport);
        let err = runtime.handle_user_input("hello").await.unwrap_err();
        assert!(matches!(err, AgentError::SchemaViolation { .. }));

        let history = runtime.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role(), Role::User);
        assert!(!runtime.is_busy());
    }

    #[tokio::test]
    async fn concurrent_turn_fails_fast() {
        let transport = ScriptedTransport::new()
            .with_delay(Duration::from_millis(50))
            .with(ScriptedResponse::tool_call("OutputSchema", r#"{"chat_message": "first"}"#));
        let runtime = runtime(&transport);

        let (first, second) = tokio::join!(runtime.handle_user_input("one"), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            runtime.handle_user_input("two").await
        });

        assert_eq!(first.unwrap(), Payload::chat("first"));
        assert!(matches!(second, Err(AgentError::TurnInProgress)));
        assert_eq!(
            texts(&runtime.history())[1..],
            [
                (Role::User, "one".to_owned()),
                (Role::Assistant, "first".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn streaming_turn_commits_final_snapshot() {
        let transport = ScriptedTransport::new().with(ScriptedResponse::stream([
            r#"{"chat_message": "Hi"#,
            r#" there"}"#,
        ]));
        let runtime = runtime(&transport);
        let stream = runtime.handle_user_input_streaming("hello").unwrap();
        assert!(runtime.is_busy());

        let snapshots: Vec<_> = stream.map(|s| s.unwrap()).collect().await;
        assert!(snapshots.last().unwrap().is_final);
        assert_eq!(snapshots.last().unwrap().text(), "Hi there");
        assert!(!runtime.is_busy());
        assert_eq!(runtime.history().last().unwrap().payload(), &Payload::chat("Hi there"));
    }

    #[tokio::test]
    async fn streaming_turn_blocks_other_turns_until_dropped() {
        let transport = ScriptedTransport::new().with(ScriptedResponse::truncated_stream([
            r#"{"chat_message": "Hi"#,
        ]));
        let runtime = runtime(&transport);

        let mut stream = runtime.handle_user_input_streaming("hello").unwrap();
        assert!(matches!(
            runtime.handle_user_input("again").await,
            Err(AgentError::TurnInProgress)
        ));
        assert!(matches!(
            runtime.handle_user_input_streaming("again"),
            Err(AgentError::TurnInProgress)
        ));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.text(), "Hi");
        drop(stream);

        assert!(!runtime.is_busy());
        // Cancelled: the user turn stays, nothing else was committed.
        let history = runtime.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role(), Role::User);
    }

    #[tokio::test]
    async fn incomplete_stream_commits_nothing() {
        let transport = ScriptedTransport::new().with(ScriptedResponse::truncated_stream([
            r#"{"chat_message": "Hal"#,
        ]));
        let runtime = runtime(&transport);
        let items: Vec<_> = runtime
            .handle_user_input_streaming("hello")
            .unwrap()
            .collect()
            .await;
        assert!(matches!(items.last(), Some(Err(AgentError::IncompleteStream { .. }))));
        assert_eq!(runtime.history().len(), 2);
        assert!(!runtime.is_busy());
    }

    #[test]
    fn greeting_is_exposed() {
        let runtime = runtime(&ScriptedTransport::new());
        assert_eq!(
            runtime.greeting().chat_message(),
            Some("Hello! How can I assist you today?")
        );
    }
}
