//! Turn-ordered conversation memory.
//!
//! The memory is seeded with a single assistant greeting and afterwards only
//! grows through [`ConversationMemory::append`].  Every payload is checked
//! against the contract implied by its role before it is stored, so the
//! history handed to a backend is always well-formed.
//!
//! An optional [`RetentionPolicy`] bounds the memory by turn count and/or by
//! an estimated token budget.  Eviction removes the oldest turns first and
//! never removes the newest one, so the memory is never empty.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::llm::types::{Message, Role};
use crate::schema::{Payload, SchemaContract};

// ---------------------------------------------------------------------------
// Turn
// ---------------------------------------------------------------------------

/// One role-attributed, schema-conforming entry of the history.
///
/// Turns are immutable once appended; the memory hands out clones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    role: Role,
    payload: Payload,
    sequence_index: u64,
    created_at: DateTime<Utc>,
}

impl Turn {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Position of the turn in the session; strictly increasing and gapless.
    pub fn sequence_index(&self) -> u64 {
        self.sequence_index
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Convert the turn into a request message.
    pub fn to_message(&self) -> Message {
        Message {
            role: self.role,
            content: self.payload.to_message_content(),
        }
    }

    /// Rough token estimate (~4 characters per token).
    pub fn estimated_tokens(&self) -> usize {
        self.payload.to_message_content().chars().count().div_ceil(4)
    }
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

/// Bounds applied to the memory after every append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep at most this many turns.
    pub max_turns: Option<usize>,
    /// Keep at most this many estimated tokens.
    pub max_tokens: Option<usize>,
}

impl RetentionPolicy {
    /// No eviction at all.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn max_turns(max_turns: usize) -> Self {
        Self {
            max_turns: Some(max_turns),
            max_tokens: None,
        }
    }

    pub fn max_tokens(max_tokens: usize) -> Self {
        Self {
            max_turns: None,
            max_tokens: Some(max_tokens),
        }
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// The ordered turn store of one conversation session.
#[derive(Debug)]
pub struct ConversationMemory {
    session_id: Uuid,
    turns: VecDeque<Turn>,
    next_index: u64,
    token_total: usize,
    input_contract: SchemaContract,
    output_contract: SchemaContract,
    retention: RetentionPolicy,
}

impl ConversationMemory {
    /// Create a memory seeded with `greeting` as its first assistant turn.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::SchemaMismatch`] if the greeting does not
    /// satisfy the output contract.
    pub fn new(
        greeting: Payload,
        input_contract: SchemaContract,
        output_contract: SchemaContract,
        retention: RetentionPolicy,
    ) -> Result<Self> {
        let mut memory = Self {
            session_id: Uuid::now_v7(),
            turns: VecDeque::new(),
            next_index: 0,
            token_total: 0,
            input_contract,
            output_contract,
            retention,
        };
        memory.append(Role::Assistant, greeting)?;
        Ok(memory)
    }

    /// Create a memory with the built-in contracts, no retention bound, and a
    /// plain-text greeting.
    pub fn with_greeting(greeting: impl Into<String>) -> Result<Self> {
        Self::new(
            Payload::chat(greeting),
            SchemaContract::input(),
            SchemaContract::output(),
            RetentionPolicy::unbounded(),
        )
    }

    /// Append a turn and apply the retention policy.
    ///
    /// Returns the sequence index assigned to the new turn.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::SchemaMismatch`] if `payload` does not conform
    /// to the contract for `role`; the memory is left unchanged.
    pub fn append(&mut self, role: Role, payload: Payload) -> Result<u64> {
        let contract = self.contract_for(role);
        if let Err(violations) = contract.validate_payload(&payload) {
            return Err(AgentError::SchemaMismatch {
                role,
                contract: contract.name().to_owned(),
                violations,
            });
        }

        let turn = Turn {
            role,
            payload,
            sequence_index: self.next_index,
            created_at: Utc::now(),
        };
        self.next_index += 1;
        self.token_total += turn.estimated_tokens();
        self.turns.push_back(turn);
        self.evict();

        Ok(self.next_index - 1)
    }

    /// Snapshot of every retained turn, oldest first.
    pub fn history(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    /// The most recent `max_turns` turns, oldest first.
    pub fn window(&self, max_turns: usize) -> Vec<Turn> {
        let skip = self.turns.len().saturating_sub(max_turns);
        self.turns.iter().skip(skip).cloned().collect()
    }

    /// The newest turn.
    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Estimated tokens across all retained turns.
    pub fn estimated_tokens(&self) -> usize {
        self.token_total
    }

    pub fn input_contract(&self) -> &SchemaContract {
        &self.input_contract
    }

    pub fn output_contract(&self) -> &SchemaContract {
        &self.output_contract
    }

    /// The contract a payload for `role` must satisfy.
    pub fn contract_for(&self, role: Role) -> &SchemaContract {
        match role {
            Role::Assistant => &self.output_contract,
            Role::User | Role::System => &self.input_contract,
        }
    }

    fn over_budget(&self) -> bool {
        let too_many = self
            .retention
            .max_turns
            .is_some_and(|max| self.turns.len() > max);
        let too_large = self
            .retention
            .max_tokens
            .is_some_and(|max| self.token_total > max);
        too_many || too_large
    }

    fn evict(&mut self) {
        while self.turns.len() > 1 && self.over_budget() {
            if let Some(evicted) = self.turns.pop_front() {
                self.token_total -= evicted.estimated_tokens();
                debug!(
                    session = %self.session_id,
                    sequence_index = evicted.sequence_index,
                    "evicted turn from conversation memory"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, ViolationKind};
    use serde_json::json;

    fn assert_gapless(turns: &[Turn]) {
        for pair in turns.windows(2) {
            assert_eq!(pair[1].sequence_index(), pair[0].sequence_index() + 1);
        }
    }

    #[test]
    fn seeded_with_single_greeting() {
        let memory = ConversationMemory::with_greeting("Hello! How can I assist you today?").unwrap();
        let history = memory.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role(), Role::Assistant);
        assert_eq!(history[0].sequence_index(), 0);
        assert_eq!(
            history[0].payload().chat_message(),
            Some("Hello! How can I assist you today?")
        );
        assert!(!memory.is_empty());
    }

    #[test]
    fn greeting_must_satisfy_output_contract() {
        let err = ConversationMemory::new(
            Payload::new(),
            SchemaContract::input(),
            SchemaContract::output(),
            RetentionPolicy::unbounded(),
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::SchemaMismatch { role: Role::Assistant, .. }));
    }

    #[test]
    fn sequence_indexes_are_gapless() {
        let mut memory = ConversationMemory::with_greeting("hi").unwrap();
        for i in 0..10 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            let index = memory.append(role, Payload::chat(format!("msg {i}"))).unwrap();
            assert_eq!(index, i + 1);
        }
        let history = memory.history();
        assert_eq!(history.len(), 11);
        assert_gapless(&history);
    }

    #[test]
    fn mismatched_payload_is_rejected_without_mutation() {
        let mut memory = ConversationMemory::with_greeting("hi").unwrap();
        let err = memory
            .append(Role::User, Payload::new().with_field("chat_message", json!(12)))
            .unwrap_err();

        match err {
            AgentError::SchemaMismatch {
                role,
                contract,
                violations,
            } => {
                assert_eq!(role, Role::User);
                assert_eq!(contract, "InputSchema");
                assert!(matches!(violations[0].kind, ViolationKind::Malformed { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(memory.len(), 1);

        // The failed append did not consume a sequence index.
        assert_eq!(memory.append(Role::User, Payload::chat("ok")).unwrap(), 1);
    }

    #[test]
    fn role_selects_contract() {
        let output = SchemaContract::builder("Reply")
            .required("chat_message", FieldType::String, "")
            .required("mood", FieldType::String, "")
            .build()
            .unwrap();
        let mut memory = ConversationMemory::new(
            Payload::chat("hi").with_field("mood", json!("warm")),
            SchemaContract::input(),
            output,
            RetentionPolicy::unbounded(),
        )
        .unwrap();

        // User turns only need the input contract.
        assert!(memory.append(Role::User, Payload::chat("hello")).is_ok());
        // Assistant turns need the richer output contract.
        assert!(memory.append(Role::Assistant, Payload::chat("bye")).is_err());
    }

    #[test]
    fn window_returns_most_recent_in_order() {
        let mut memory = ConversationMemory::with_greeting("hi").unwrap();
        for i in 0..5 {
            memory.append(Role::User, Payload::chat(format!("u{i}"))).unwrap();
        }
        let window = memory.window(3);
        let texts: Vec<_> = window
            .iter()
            .map(|t| t.payload().chat_message().unwrap().to_owned())
            .collect();
        assert_eq!(texts, vec!["u2", "u3", "u4"]);
        assert_eq!(memory.window(100).len(), 6);
        assert!(memory.window(0).is_empty());
    }

    #[test]
    fn history_is_a_snapshot() {
        let mut memory = ConversationMemory::with_greeting("hi").unwrap();
        let snapshot = memory.history();
        memory.append(Role::User, Payload::chat("later")).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(memory.len(), 2);
    }

    #[test]
    fn turn_retention_evicts_oldest_first() {
        let mut memory = ConversationMemory::new(
            Payload::chat("greeting"),
            SchemaContract::input(),
            SchemaContract::output(),
            RetentionPolicy::max_turns(3),
        )
        .unwrap();
        for i in 0..5 {
            memory.append(Role::User, Payload::chat(format!("u{i}"))).unwrap();
        }
        let history = memory.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].sequence_index(), 3);
        assert_eq!(history[2].sequence_index(), 5);
        assert_gapless(&history);
    }

    #[test]
    fn token_retention_keeps_newest_turn() {
        let mut memory = ConversationMemory::new(
            Payload::chat("hi"),
            SchemaContract::input(),
            SchemaContract::output(),
            RetentionPolicy::max_tokens(4),
        )
        .unwrap();
        memory.append(Role::User, Payload::chat("a".repeat(40))).unwrap();
        assert_eq!(memory.len(), 1);
        assert_eq!(memory.last().unwrap().sequence_index(), 1);
        assert_eq!(memory.estimated_tokens(), 10);

        memory.append(Role::Assistant, Payload::chat("ok")).unwrap();
        assert_eq!(memory.len(), 1);
        assert_eq!(memory.estimated_tokens(), 1);
    }

    #[test]
    fn turn_converts_to_message() {
        let memory = ConversationMemory::with_greeting("hi there").unwrap();
        let message = memory.history()[0].to_message();
        assert_eq!(message, Message::assistant("hi there"));
    }
}
