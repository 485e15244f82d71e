// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared lifecycle for long-lived push streams.
//!
//! [`drive`] pumps events from a source to a sink while enforcing the
//! connection rules every stream kind shares:
//!
//! - client disconnect is observed before each emission,
//! - the bearer token is re-verified on a fixed cadence,
//! - the connection is capped at an absolute lifetime,
//! - sustained write failures close the connection after one final
//!   `SERVER_ERROR` event.
//!
//! Resource cleanup is by ownership. `drive` owns its timers and the event
//! source; both are dropped on the single return path, so a source that holds
//! a subscription or a ticker releases it exactly once no matter which branch
//! ended the stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::auth::TokenVerifier;
use crate::stream::{StreamErrorCode, StreamEvent};

/// Why a sink write failed.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The receiving side is gone. Treated as a client disconnect.
    #[error("client connection closed")]
    Closed,
    /// The write itself failed; counts toward the error threshold.
    #[error("write failed: {0}")]
    Write(String),
}

/// Where stream events are written.
#[async_trait]
pub trait StreamSink: Send {
    /// Delivers one event to the client.
    async fn send(&mut self, event: StreamEvent) -> Result<(), SinkError>;
}

/// Re-checks that the caller is still allowed to hold the connection open.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Returns false once the caller's credentials no longer verify.
    async fn still_valid(&self) -> bool;
}

/// [`TokenValidator`] that re-verifies a captured bearer token.
pub struct BearerValidator {
    verifier: Arc<dyn TokenVerifier>,
    token: String,
}

impl BearerValidator {
    pub fn new(verifier: Arc<dyn TokenVerifier>, token: impl Into<String>) -> Self {
        Self {
            verifier,
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for BearerValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerValidator")
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenValidator for BearerValidator {
    async fn still_valid(&self) -> bool {
        self.verifier.verify(&self.token).await.is_ok()
    }
}

/// Connection limits for one stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    /// Cadence of token re-verification.
    pub validate_every: Duration,
    /// Absolute cap on connection lifetime.
    pub max_lifetime: Duration,
    /// Consecutive write failures tolerated before the stream closes.
    pub error_threshold: u32,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            validate_every: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(60 * 60),
            error_threshold: 3,
        }
    }
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The event source ran out of events.
    Completed,
    /// The client went away.
    Disconnected,
    /// The bearer token stopped verifying.
    TokenExpired,
    /// Too many consecutive write failures.
    ErrorThreshold,
    /// The absolute lifetime cap was hit.
    Timeout,
}

/// Accounting for one finished stream, for the connection log line.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    pub outcome: StreamOutcome,
    /// Data events delivered to the client.
    pub messages_sent: u64,
    /// Failed write attempts, consecutive or not.
    pub write_errors: u64,
    /// Token re-verifications performed.
    pub validations: u64,
    pub duration: Duration,
}

/// Runs one stream to completion.
///
/// Disconnect is checked before each emission, then the lifetime cap, then
/// the validation tick, then the next event.
/// The first validation happens one full interval in, not at connect time;
/// the token was verified by the handler that opened the stream.
pub async fn drive<S, V, E>(
    events: E,
    sink: &mut S,
    validator: &V,
    limits: StreamLimits,
    disconnected: CancellationToken,
) -> StreamSummary
where
    S: StreamSink,
    V: TokenValidator + ?Sized,
    E: Stream<Item = StreamEvent>,
{
    let started = Instant::now();
    let mut messages_sent = 0u64;
    let mut write_errors = 0u64;
    let mut validations = 0u64;
    let mut consecutive_failures = 0u32;

    let mut validate = time::interval_at(
        time::Instant::now() + limits.validate_every,
        limits.validate_every,
    );
    let lifetime = time::sleep(limits.max_lifetime);
    tokio::pin!(lifetime);
    tokio::pin!(events);

    let outcome = loop {
        tokio::select! {
            biased;

            _ = disconnected.cancelled() => {
                break StreamOutcome::Disconnected;
            }

            _ = &mut lifetime => {
                let _ = sink
                    .send(StreamEvent::Error {
                        message: "Stream exceeded maximum lifetime".to_string(),
                        code: StreamErrorCode::Timeout,
                    })
                    .await;
                break StreamOutcome::Timeout;
            }

            _ = validate.tick() => {
                validations += 1;
                if !validator.still_valid().await {
                    let _ = sink
                        .send(StreamEvent::Error {
                            message: "Session token is no longer valid".to_string(),
                            code: StreamErrorCode::TokenExpired,
                        })
                        .await;
                    break StreamOutcome::TokenExpired;
                }
            }

            maybe = events.next() => match maybe {
                None => break StreamOutcome::Completed,
                Some(event) if event.is_terminal() => {
                    let _ = sink.send(event).await;
                    break StreamOutcome::Completed;
                }
                Some(event) => match sink.send(event).await {
                    Ok(()) => {
                        messages_sent += 1;
                        consecutive_failures = 0;
                    }
                    Err(SinkError::Closed) => {
                        break StreamOutcome::Disconnected;
                    }
                    Err(SinkError::Write(reason)) => {
                        write_errors += 1;
                        consecutive_failures += 1;
                        warn!(
                            error = %reason,
                            consecutive = consecutive_failures,
                            "Stream write failed"
                        );
                        if consecutive_failures >= limits.error_threshold {
                            let _ = sink
                                .send(StreamEvent::Error {
                                    message: "Stream closed after repeated write failures"
                                        .to_string(),
                                    code: StreamErrorCode::ServerError,
                                })
                                .await;
                            break StreamOutcome::ErrorThreshold;
                        }
                    }
                },
            }
        }
    };

    StreamSummary {
        outcome,
        messages_sent,
        write_errors,
        validations,
        duration: started.elapsed(),
    }
}

/// [`StreamSink`] over an mpsc channel, for transports that consume the
/// receiving half (SSE response bodies).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl StreamSink for ChannelSink {
    async fn send(&mut self, event: StreamEvent) -> Result<(), SinkError> {
        self.tx.send(event).await.map_err(|_| SinkError::Closed)
    }
}

/// Adapts the receiving half of an event channel into a [`drive`] source.
/// The source ends when every sender is dropped.
pub fn channel_events(mut rx: mpsc::Receiver<StreamEvent>) -> impl Stream<Item = StreamEvent> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield event;
        }
    }
}
