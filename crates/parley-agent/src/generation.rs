//! Structured generation client.
//!
//! Produces a value that conforms to a [`SchemaContract`] from a request,
//! hiding two kinds of failure behind bounded loops:
//!
//! - **Transport retries.**  Timeouts, throttling, server errors and dropped
//!   connections are retried with exponential backoff.  When the retries run
//!   out the call fails with [`AgentError::BackendUnavailable`].
//! - **Validation retries.**  A candidate that cannot be decoded or that
//!   violates the contract is answered with a corrective system message
//!   naming the offending fields, and the backend is asked again.  When the
//!   attempts run out the call fails with [`AgentError::SchemaViolation`].
//!
//! Corrective messages only ever live in the client's private copy of the
//! request; conversation memory never sees them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result, TransportFailure};
use crate::llm::adapter::{BackendAdapter, PartialStream};
use crate::llm::types::{BackendDescriptor, DisplaySnapshot, GenerationRequest, Message};
use crate::reconciler::{Observation, StreamReconciler};
use crate::schema::{FieldViolation, Payload, SchemaContract, describe_violations};

/// Display snapshots of one streamed reply.  Ends after the final snapshot
/// or after the first error.
pub type SnapshotStream = BoxStream<'static, Result<DisplaySnapshot>>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Exponential backoff between transport retries.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Multiplier applied after each retry.
    pub factor: f64,
    /// Upper bound for any single delay.
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            cap: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.factor.powi(exponent);
        let cap = self.cap.as_secs_f64();
        if secs.is_finite() {
            Duration::from_secs_f64(secs.clamp(0.0, cap))
        } else {
            self.cap
        }
    }
}

/// Retry bounds and deadlines for the generation client.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Transport retries per attempt (0 = no retries).
    pub max_transport_retries: u32,
    /// Corrective re-asks after an invalid candidate (0 = no retries).
    pub max_validation_retries: u32,
    pub backoff: BackoffPolicy,
    /// Deadline for one backend invocation, and for each wait on a stream.
    pub request_timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_transport_retries: 2,
            max_validation_retries: 3,
            backoff: BackoffPolicy::default(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// A validated reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub value: Payload,
    /// Validation attempts used, the successful one included.
    pub attempts: u32,
    /// The raw text the value was decoded from.
    pub raw: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Drives a [`BackendAdapter`] until it yields a conforming value.
#[derive(Clone)]
pub struct GenerationClient {
    adapter: Arc<dyn BackendAdapter>,
    config: GenerationConfig,
}

impl std::fmt::Debug for GenerationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationClient")
            .field("backend", self.adapter.descriptor())
            .field("config", &self.config)
            .finish()
    }
}

impl GenerationClient {
    pub fn new(adapter: Arc<dyn BackendAdapter>, config: GenerationConfig) -> Self {
        Self { adapter, config }
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        self.adapter.descriptor()
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Generate one validated value.
    ///
    /// # Errors
    ///
    /// - [`AgentError::BackendUnavailable`] when transient transport
    ///   failures outlast the transport retries.
    /// - [`AgentError::SchemaViolation`] when every attempt produced an
    ///   undecodable or invalid candidate.
    /// - Any non-retryable error from the adapter, unchanged.
    pub async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
        let mut request = request;
        let contract = request.contract.clone();
        let max_attempts = self.config.max_validation_retries + 1;
        let mut last_rejection = (Vec::new(), String::new());

        for attempt in 1..=max_attempts {
            debug!(attempt, max_attempts, contract = contract.name(), "generation attempt");

            let outcome = self
                .with_transport_retries(|| self.adapter.generate(&request))
                .await;

            let (violations, raw) = match outcome {
                Ok(candidate) => match Payload::from_value(candidate.value) {
                    Some(payload) => match contract.validate_payload(&payload) {
                        Ok(()) => {
                            info!(attempt, contract = contract.name(), "reply validated");
                            return Ok(Generation {
                                value: payload,
                                attempts: attempt,
                                raw: candidate.raw,
                            });
                        }
                        Err(violations) => (violations, candidate.raw),
                    },
                    None => (
                        vec![FieldViolation::unparseable("reply is not a JSON object")],
                        candidate.raw,
                    ),
                },
                Err(AgentError::Decode { reason, raw }) => {
                    (vec![FieldViolation::unparseable(reason)], raw)
                }
                Err(e) => return Err(e),
            };

            warn!(
                attempt,
                max_attempts,
                contract = contract.name(),
                violations = %describe_violations(&violations),
                "reply rejected"
            );
            if attempt < max_attempts {
                push_correction(&mut request, &contract, &raw, &violations);
            }
            last_rejection = (violations, raw);
        }

        let (violations, raw_output) = last_rejection;
        Err(AgentError::SchemaViolation {
            contract: contract.name().to_owned(),
            attempts: max_attempts,
            violations,
            raw_output,
        })
    }

    /// Generate one validated value as a stream of display snapshots.
    ///
    /// The stream yields best-effort snapshots while the reply arrives and
    /// ends with exactly one snapshot that has `is_final` set, or with an
    /// error.  A rejected final reply triggers a corrective attempt that
    /// streams into the same display.  Backends without streaming support
    /// yield a single final snapshot.
    ///
    /// Dropping the stream cancels the in-flight invocation.
    pub fn generate_stream(&self, request: GenerationRequest) -> SnapshotStream {
        if !self.descriptor().supports_streaming {
            let client = self.clone();
            return stream::once(async move {
                client.generate(request).await.map(|generation| DisplaySnapshot {
                    payload: generation.value,
                    is_final: true,
                })
            })
            .boxed();
        }

        stream::unfold(self.stream_driver(request), |mut driver| async move {
            driver.next_item().await.map(|item| (item, driver))
        })
        .boxed()
    }

    fn stream_driver(&self, request: GenerationRequest) -> StreamDriver {
        StreamDriver {
            reconciler: StreamReconciler::new(
                self.descriptor().encoding_mode,
                request.contract.clone(),
            ),
            client: self.clone(),
            request,
            events: None,
            attempt: 0,
            done: false,
        }
    }

    /// Run `op` with the configured deadline, retrying retryable transport
    /// failures with backoff.
    async fn with_transport_retries<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_transport_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.config.request_timeout, op()).await {
                Ok(result) => result,
                Err(_elapsed) => Err(AgentError::transport(
                    TransportFailure::Timeout,
                    format!("no reply within {:?}", self.config.request_timeout),
                )),
            };

            match result {
                Err(e) if e.is_retryable_transport() => {
                    if attempt >= max_attempts {
                        warn!(attempts = attempt, error = %e, "backend unavailable");
                        return Err(AgentError::BackendUnavailable {
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    let delay = self.config.backoff.delay_for(attempt - 1);
                    warn!(attempt, max_attempts, delay = ?delay, error = %e, "transport failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Append the rejected reply and a corrective instruction to the scratch
/// request.
fn push_correction(
    request: &mut GenerationRequest,
    contract: &SchemaContract,
    raw: &str,
    violations: &[FieldViolation],
) {
    if !raw.trim().is_empty() {
        request.push(Message::assistant(raw));
    }
    request.push(Message::system(format!(
        "Your previous reply did not match the `{}` structure: {}. \
         Reply again with every required field present and correctly typed.",
        contract.name(),
        describe_violations(violations)
    )));
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

struct StreamDriver {
    client: GenerationClient,
    request: GenerationRequest,
    reconciler: StreamReconciler,
    events: Option<PartialStream>,
    attempt: u32,
    done: bool,
}

impl StreamDriver {
    fn fail(&mut self, error: AgentError) -> Option<Result<DisplaySnapshot>> {
        self.done = true;
        self.events = None;
        Some(Err(error))
    }

    async fn next_item(&mut self) -> Option<Result<DisplaySnapshot>> {
        let max_attempts = self.client.config.max_validation_retries + 1;
        let timeout = self.client.config.request_timeout;

        loop {
            if self.done {
                return None;
            }

            if self.events.is_none() {
                self.attempt += 1;
                debug!(attempt = self.attempt, max_attempts, "opening reply stream");
                let client = &self.client;
                let request = &self.request;
                let opened = client
                    .with_transport_retries(|| client.adapter.generate_stream(request))
                    .await;
                match opened {
                    Ok(events) => self.events = Some(events),
                    Err(e) => return self.fail(e),
                }
            }
            let Some(events) = self.events.as_mut() else {
                continue;
            };

            let event = match tokio::time::timeout(timeout, events.next()).await {
                Ok(Some(Ok(event))) => event,
                Ok(Some(Err(e))) => {
                    let error = self.reconciler.abort(format!("stream broke: {e}"));
                    return self.fail(error);
                }
                Ok(None) => match self.reconciler.finish() {
                    Ok(_) => {
                        self.done = true;
                        return None;
                    }
                    Err(error) => return self.fail(error),
                },
                Err(_elapsed) => {
                    let error = self
                        .reconciler
                        .abort(format!("no stream activity within {timeout:?}"));
                    return self.fail(error);
                }
            };

            match self.reconciler.observe(&event) {
                Observation::Quiet => {}
                Observation::Snapshot(snapshot) => {
                    if snapshot.is_final {
                        info!(attempt = self.attempt, "streamed reply validated");
                        self.done = true;
                        self.events = None;
                    }
                    return Some(Ok(snapshot));
                }
                Observation::Rejected(rejection) => {
                    self.events = None;
                    warn!(
                        attempt = self.attempt,
                        max_attempts,
                        violations = %describe_violations(&rejection.violations),
                        "streamed reply rejected"
                    );
                    if self.attempt >= max_attempts {
                        let error = AgentError::SchemaViolation {
                            contract: self.request.contract.name().to_owned(),
                            attempts: self.attempt,
                            violations: rejection.violations,
                            raw_output: rejection.raw,
                        };
                        return self.fail(error);
                    }
                    let contract = self.request.contract.clone();
                    push_correction(
                        &mut self.request,
                        &contract,
                        &rejection.raw,
                        &rejection.violations,
                    );
                    self.reconciler.retry();
                }
            }
        }
    }
}
