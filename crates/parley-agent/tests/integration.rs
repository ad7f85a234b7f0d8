//! Integration tests for the parley-agent crate.
//!
//! These drive whole turns through the public API with a scripted transport,
//! so no network connection is needed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Map;

use parley_agent::llm::mock::{ScriptedResponse, ScriptedTransport};
use parley_agent::llm::types::PartialDecodeEvent;
use parley_agent::{
    AgentConfig, AgentError, AgentRuntime, BackendDescriptor, BackoffPolicy, ConversationMemory,
    Credentials, DEFAULT_GREETING, EncodedAdapter, EncodingMode, GenerationClient,
    GenerationConfig, Observation, Payload, ProviderRegistry, ReconcilerState, Role,
    SchemaContract, StreamReconciler, TransportFailure,
};

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

fn fast_config() -> GenerationConfig {
    GenerationConfig {
        backoff: BackoffPolicy {
            base: Duration::from_millis(1),
            factor: 2.0,
            cap: Duration::from_millis(4),
        },
        ..GenerationConfig::default()
    }
}

fn runtime(transport: &ScriptedTransport, mode: EncodingMode) -> AgentRuntime {
    let descriptor = BackendDescriptor {
        provider_id: "scripted".into(),
        model_id: "scripted-model".into(),
        encoding_mode: mode,
        supports_streaming: true,
        default_params: Map::new(),
    };
    let adapter = EncodedAdapter::new(descriptor, Arc::new(transport.clone()));
    let client = GenerationClient::new(Arc::new(adapter), fast_config());
    let memory = ConversationMemory::with_greeting(DEFAULT_GREETING).unwrap();
    AgentRuntime::new(memory, client, AgentConfig::default())
}

fn chat_texts(runtime: &AgentRuntime) -> Vec<(Role, String)> {
    runtime
        .history()
        .iter()
        .map(|t| {
            (
                t.role(),
                t.payload().chat_message().unwrap_or_default().to_owned(),
            )
        })
        .collect()
}

fn event(text: &str, is_final: bool) -> PartialDecodeEvent {
    PartialDecodeEvent {
        raw_fragment: String::new(),
        cumulative_text: text.to_owned(),
        is_final,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Turns
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn first_valid_reply_grows_memory_to_three_turns() {
    let transport = ScriptedTransport::new().with(ScriptedResponse::text(
        r#"{"chat_message": "hi there"}"#,
    ));
    let runtime = runtime(&transport, EncodingMode::Json);
    assert_eq!(runtime.history().len(), 1);

    let reply = runtime.handle_user_input("hello").await.unwrap();

    assert_eq!(reply, Payload::chat("hi there"));
    assert_eq!(
        chat_texts(&runtime),
        vec![
            (Role::Assistant, DEFAULT_GREETING.to_owned()),
            (Role::User, "hello".to_owned()),
            (Role::Assistant, "hi there".to_owned()),
        ]
    );
    let indexes: Vec<u64> = runtime.history().iter().map(|t| t.sequence_index()).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
}

#[tokio::test]
async fn invalid_candidates_never_reach_memory() {
    let transport = ScriptedTransport::new()
        .with(ScriptedResponse::text("{}"))
        .with(ScriptedResponse::text("{}"))
        .with(ScriptedResponse::text(r#"{"chat_message": "ok"}"#));
    let runtime = runtime(&transport, EncodingMode::Json);

    let reply = runtime.handle_user_input("hello").await.unwrap();

    assert_eq!(reply, Payload::chat("ok"));
    assert_eq!(transport.call_count(), 3);
    assert_eq!(
        chat_texts(&runtime),
        vec![
            (Role::Assistant, DEFAULT_GREETING.to_owned()),
            (Role::User, "hello".to_owned()),
            (Role::Assistant, "ok".to_owned()),
        ]
    );

    // The corrective instructions were scratch messages on the wire only.
    let third = &transport.calls()[2];
    assert!(third.messages.len() > 2);
    assert!(
        third
            .messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains("chat_message"))
    );
}

#[tokio::test]
async fn validation_retries_are_bounded() {
    let transport = ScriptedTransport::new();
    for _ in 0..4 {
        transport.push(ScriptedResponse::text(r#"{"wrong": true}"#));
    }
    let runtime = runtime(&transport, EncodingMode::Json);

    let err = runtime.handle_user_input("hello").await.unwrap_err();

    match err {
        AgentError::SchemaViolation {
            attempts,
            raw_output,
            ..
        } => {
            assert_eq!(attempts, 4);
            assert_eq!(raw_output, r#"{"wrong": true}"#);
        }
        other => panic!("expected SchemaViolation, got {other:?}"),
    }
    assert_eq!(transport.call_count(), 4);
    assert_eq!(runtime.history().len(), 2);

    // The session survives a failed turn.
    transport.push(ScriptedResponse::text(r#"{"chat_message": "back"}"#));
    let reply = runtime.handle_user_input("retry").await.unwrap();
    assert_eq!(reply.chat_message(), Some("back"));
    assert_eq!(runtime.history().len(), 4);
}

#[tokio::test]
async fn transient_failures_surface_as_backend_unavailable() {
    let transport = ScriptedTransport::new()
        .with(ScriptedResponse::failure(TransportFailure::Server))
        .with(ScriptedResponse::failure(TransportFailure::RateLimited))
        .with(ScriptedResponse::failure(TransportFailure::Timeout));
    let runtime = runtime(&transport, EncodingMode::Json);

    let err = runtime.handle_user_input("hello").await.unwrap_err();

    assert!(matches!(err, AgentError::BackendUnavailable { attempts: 3, .. }));
    assert_eq!(transport.call_count(), 3);
    assert_eq!(runtime.history().len(), 2);
    assert!(!runtime.is_busy());
}

#[tokio::test]
async fn failed_turn_allows_next_turn() {
    let transport = ScriptedTransport::new()
        .with(ScriptedResponse::failure(TransportFailure::Rejected))
        .with(ScriptedResponse::text(r#"{"chat_message": "second time lucky"}"#));
    let runtime = runtime(&transport, EncodingMode::Json);

    assert!(runtime.handle_user_input("first").await.is_err());
    let reply = runtime.handle_user_input("second").await.unwrap();

    assert_eq!(reply.chat_message(), Some("second time lucky"));
    assert_eq!(
        chat_texts(&runtime)[1..],
        [
            (Role::User, "first".to_owned()),
            (Role::User, "second".to_owned()),
            (Role::Assistant, "second time lucky".to_owned()),
        ]
    );
}

#[tokio::test]
async fn concurrent_input_fails_fast() {
    let transport = ScriptedTransport::new()
        .with_delay(Duration::from_millis(50))
        .with(ScriptedResponse::text(r#"{"chat_message": "done"}"#));
    let runtime = runtime(&transport, EncodingMode::Json);

    let (first, second) = tokio::join!(runtime.handle_user_input("one"), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        runtime.handle_user_input("two").await
    });

    assert!(first.is_ok());
    assert!(matches!(second, Err(AgentError::TurnInProgress)));
    assert_eq!(transport.call_count(), 1);
    assert_eq!(runtime.history().len(), 3);
}

// ═══════════════════════════════════════════════════════════════════════
//  Streaming
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn repeated_partials_are_suppressed() {
    let mut reconciler = StreamReconciler::new(EncodingMode::Markup, SchemaContract::output());

    let snapshots: Vec<String> = [
        event("H", false),
        event("He", false),
        event("He", false),
        event("Hello", true),
    ]
    .iter()
    .filter_map(|e| match reconciler.observe(e) {
        Observation::Snapshot(snapshot) => Some(snapshot.text().to_owned()),
        _ => None,
    })
    .collect();

    assert_eq!(snapshots, vec!["H", "He", "Hello"]);
    assert_eq!(reconciler.state(), ReconcilerState::Finalized);
    assert!(reconciler.finish().unwrap().is_final);
}

#[tokio::test]
async fn streamed_turn_is_monotonic_and_committed_once() {
    let transport = ScriptedTransport::new().with(ScriptedResponse::stream([
        r#"{"chat_message": "Hel"#,
        "lo, ",
        "wor",
        r#"ld"}"#,
    ]));
    let runtime = runtime(&transport, EncodingMode::Json);

    let snapshots: Vec<_> = runtime
        .handle_user_input_streaming("hi")
        .unwrap()
        .map(|s| s.unwrap())
        .collect()
        .await;

    let texts: Vec<&str> = snapshots.iter().map(|s| s.text()).collect();
    for pair in texts.windows(2) {
        assert!(pair[1].starts_with(pair[0]), "{:?} then {:?}", pair[0], pair[1]);
    }
    assert_eq!(snapshots.iter().filter(|s| s.is_final).count(), 1);
    assert!(snapshots.last().unwrap().is_final);
    assert_eq!(texts.last().copied(), Some("Hello, world"));
    assert_eq!(runtime.history().len(), 3);
    assert!(!runtime.is_busy());
}

#[tokio::test]
async fn markup_stream_commits_plain_text() {
    let transport = ScriptedTransport::new().with(ScriptedResponse::stream(["  Hi", " there"]));
    let runtime = runtime(&transport, EncodingMode::Markup);

    let snapshots: Vec<_> = runtime
        .handle_user_input_streaming("hello")
        .unwrap()
        .map(|s| s.unwrap())
        .collect()
        .await;

    assert_eq!(snapshots.first().unwrap().text(), "Hi");
    assert_eq!(snapshots.last().unwrap().text(), "Hi there");
    assert_eq!(
        runtime.history().last().unwrap().payload(),
        &Payload::chat("Hi there")
    );
}

#[tokio::test]
async fn dropping_a_stream_cancels_the_turn() {
    let transport = ScriptedTransport::new()
        .with(ScriptedResponse::truncated_stream([r#"{"chat_message": "par"#]))
        .with(ScriptedResponse::text(r#"{"chat_message": "fresh"}"#));
    let runtime = runtime(&transport, EncodingMode::Json);

    let mut stream = runtime.handle_user_input_streaming("first").unwrap();
    assert!(matches!(
        runtime.handle_user_input("blocked").await,
        Err(AgentError::TurnInProgress)
    ));
    let partial = stream.next().await.unwrap().unwrap();
    assert!(!partial.is_final);
    drop(stream);

    assert!(!runtime.is_busy());
    assert_eq!(runtime.history().len(), 2);

    let reply = runtime.handle_user_input("second").await.unwrap();
    assert_eq!(reply.chat_message(), Some("fresh"));
}

#[tokio::test]
async fn abandoning_a_blocking_turn_releases_the_conversation() {
    let transport = ScriptedTransport::new()
        .with_delay(Duration::from_millis(200))
        .with(ScriptedResponse::text(r#"{"chat_message": "too late"}"#));
    let runtime = runtime(&transport, EncodingMode::Json);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), runtime.handle_user_input("first")).await;
    assert!(abandoned.is_err());

    assert!(!runtime.is_busy());
    assert_eq!(runtime.history().len(), 2);
    assert_eq!(runtime.history().last().unwrap().role(), Role::User);
    assert_eq!(transport.call_count(), 1);

    let reply = runtime.handle_user_input("second").await.unwrap();
    assert_eq!(reply.chat_message(), Some("too late"));
    assert_eq!(
        chat_texts(&runtime)[1..],
        [
            (Role::User, "first".to_owned()),
            (Role::User, "second".to_owned()),
            (Role::Assistant, "too late".to_owned()),
        ]
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Provider registry
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn unknown_provider_fails_without_network() {
    let registry = ProviderRegistry::builtin();
    let transport_built = AtomicBool::new(false);

    let result = registry.build_adapter_with(
        &Credentials::new("unknown").with_api_key("sk-test"),
        |_| {
            transport_built.store(true, Ordering::SeqCst);
            Ok(Arc::new(ScriptedTransport::new()) as Arc<dyn parley_agent::ChatTransport>)
        },
    );

    assert!(matches!(
        result,
        Err(AgentError::UnsupportedProvider { ref provider }) if provider == "unknown"
    ));
    assert!(!transport_built.load(Ordering::SeqCst));
}

#[test]
fn missing_credential_is_reported() {
    let registry = ProviderRegistry::builtin();
    let result = registry.build_adapter(&Credentials::new("openai"));
    assert!(matches!(result, Err(AgentError::MissingCredential { .. })));

    // Local providers need no key.
    assert!(registry.build_adapter(&Credentials::new("ollama")).is_ok());
}
