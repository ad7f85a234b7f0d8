//! Conversation memory: the ordered, schema-checked turn history of one
//! session.

pub mod conversation;

pub use conversation::{ConversationMemory, RetentionPolicy, Turn};
