// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Long-lived push streams.
//!
//! Two connection kinds share one lifecycle: a log tail bridged from the
//! per-deployment pub/sub channel, and periodic metrics snapshots. The
//! lifecycle driver in [`lifecycle`] is transport-agnostic; the HTTP layer
//! adapts it onto SSE through an mpsc channel.

pub mod lifecycle;
pub mod logs;
pub mod metrics;

pub use lifecycle::{
    BearerValidator, ChannelSink, SinkError, StreamLimits, StreamOutcome, StreamSink,
    StreamSummary, TokenValidator, channel_events, drive,
};

use serde::Serialize;

/// Terminal error codes sent to stream clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamErrorCode {
    /// The caller's token no longer verifies.
    TokenExpired,
    /// The server side is failing (sustained write or snapshot errors).
    ServerError,
    /// The connection hit its absolute lifetime cap.
    Timeout,
}

/// One event pushed to a stream client.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Payload event, already framed as a JSON string.
    Data(String),
    /// Terminal error event. The connection closes after it is sent.
    Error {
        /// Human-readable reason.
        message: String,
        /// Stable code for client handling.
        code: StreamErrorCode,
    },
}

impl StreamEvent {
    /// Whether this event terminates the connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}
