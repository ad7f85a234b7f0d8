//! Stream reconciliation.
//!
//! A [`StreamReconciler`] turns the partial decode events of one streaming
//! reply into display snapshots.  Intermediate snapshots are best-effort and
//! monotone: once a field has been shown it is never blanked out again, and
//! identical snapshots are not repeated.  The single final snapshot carries
//! the exact validated payload.
//!
//! ```text
//! Idle ──partial──▶ Streaming ──final, valid──▶ Finalized
//!   │                  │   ▲
//!   └──────final───────┤   └── retry() ──┐
//!                      └─final, invalid─▶ Failed
//! ```

use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::llm::types::{DisplaySnapshot, EncodingMode, PartialDecodeEvent};
use crate::schema::{FieldViolation, Payload, SchemaContract, is_revealed};

/// Lifecycle of one reconciled reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    Streaming,
    Finalized,
    Failed,
}

/// Why a final event was not accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub violations: Vec<FieldViolation>,
    /// The full text of the rejected reply.
    pub raw: String,
}

/// What observing one event produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Nothing new to show.
    Quiet,
    /// A snapshot to render.
    Snapshot(DisplaySnapshot),
    /// The final event failed validation; the caller decides whether to
    /// retry.
    Rejected(Rejection),
}

/// Reconciles one streaming reply against a contract.
#[derive(Debug)]
pub struct StreamReconciler {
    state: ReconcilerState,
    mode: EncodingMode,
    contract: SchemaContract,
    last_emitted: Option<DisplaySnapshot>,
}

impl StreamReconciler {
    pub fn new(mode: EncodingMode, contract: SchemaContract) -> Self {
        Self {
            state: ReconcilerState::Idle,
            mode,
            contract,
            last_emitted: None,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    /// The most recent snapshot handed out.
    pub fn last_emitted(&self) -> Option<&DisplaySnapshot> {
        self.last_emitted.as_ref()
    }

    /// Feed one event.
    pub fn observe(&mut self, event: &PartialDecodeEvent) -> Observation {
        match self.state {
            ReconcilerState::Finalized | ReconcilerState::Failed => {
                warn!(state = ?self.state, "ignoring stream event after reply was settled");
                Observation::Quiet
            }
            ReconcilerState::Idle | ReconcilerState::Streaming if event.is_final => {
                self.finalize(&event.cumulative_text)
            }
            ReconcilerState::Idle | ReconcilerState::Streaming => {
                self.state = ReconcilerState::Streaming;
                self.partial(&event.cumulative_text)
            }
        }
    }

    /// Re-arm after a rejected final event so a corrective attempt can
    /// stream into the same display.  The last emitted snapshot is kept, so
    /// fields already shown stay visible.
    pub fn retry(&mut self) {
        if self.state == ReconcilerState::Failed {
            self.state = ReconcilerState::Streaming;
        }
    }

    /// Settle the reply once its event stream has ended.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::IncompleteStream`] unless a valid final event
    /// was observed; the reconciler is then `Failed`.
    pub fn finish(&mut self) -> Result<DisplaySnapshot> {
        if self.state == ReconcilerState::Finalized
            && let Some(snapshot) = &self.last_emitted
        {
            return Ok(snapshot.clone());
        }
        let reason = format!(
            "reply ended in state {:?} without a valid final event",
            self.state
        );
        Err(self.abort(reason))
    }

    /// Give up on an unsettled reply, e.g. after a broken or stalled stream.
    ///
    /// Moves to `Failed` unless already finalized and returns the
    /// [`AgentError::IncompleteStream`] to surface.
    pub fn abort(&mut self, reason: impl Into<String>) -> AgentError {
        let reason = reason.into();
        if self.state != ReconcilerState::Finalized {
            warn!(state = ?self.state, %reason, "reply stream abandoned");
            self.state = ReconcilerState::Failed;
        }
        AgentError::IncompleteStream { reason }
    }

    fn partial(&mut self, text: &str) -> Observation {
        let Some(decoded) = self.mode.decode_partial(text) else {
            return Observation::Quiet;
        };

        let merged = match &self.last_emitted {
            Some(previous) => merge_monotonic(&previous.payload, decoded),
            None => decoded,
        };
        if !merged.has_content() {
            return Observation::Quiet;
        }

        let snapshot = DisplaySnapshot {
            payload: merged,
            is_final: false,
        };
        self.emit(snapshot)
    }

    fn finalize(&mut self, text: &str) -> Observation {
        let outcome = self.mode.decode_final(text).and_then(|candidate| {
            Payload::from_value(candidate.value).ok_or_else(|| AgentError::Decode {
                reason: "reply is not a JSON object".into(),
                raw: candidate.raw,
            })
        });

        let payload = match outcome {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "final stream event could not be decoded");
                self.state = ReconcilerState::Failed;
                return Observation::Rejected(Rejection {
                    violations: vec![FieldViolation::unparseable(e.to_string())],
                    raw: text.to_owned(),
                });
            }
        };

        if let Err(violations) = self.contract.validate_payload(&payload) {
            debug!(violations = violations.len(), "final stream event failed validation");
            self.state = ReconcilerState::Failed;
            return Observation::Rejected(Rejection {
                violations,
                raw: text.to_owned(),
            });
        }

        self.state = ReconcilerState::Finalized;
        let snapshot = DisplaySnapshot {
            payload,
            is_final: true,
        };
        self.last_emitted = Some(snapshot.clone());
        Observation::Snapshot(snapshot)
    }

    fn emit(&mut self, snapshot: DisplaySnapshot) -> Observation {
        if self.last_emitted.as_ref() == Some(&snapshot) {
            return Observation::Quiet;
        }
        self.last_emitted = Some(snapshot.clone());
        Observation::Snapshot(snapshot)
    }
}

/// Keep every field already revealed in `previous` unless `next` reveals
/// something for it too.
fn merge_monotonic(previous: &Payload, mut next: Payload) -> Payload {
    for (name, value) in previous.fields() {
        if !is_revealed(value) {
            continue;
        }
        let next_reveals = next.get(name).is_some_and(is_revealed);
        if !next_reveals {
            next.insert(name.clone(), value.clone());
        }
    }
    next
}
