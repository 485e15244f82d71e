// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live build-log tailing.
//!
//! A pump task bridges one [`LogSubscription`] into a stream event channel.
//! Chunks are framed as single-line JSON because SSE data frames strip one
//! trailing newline; raw multi-line chunks would come out of the transport
//! subtly mangled.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::redis::LogSubscription;
use crate::stream::StreamEvent;

/// Wraps a raw log chunk so embedded newlines survive SSE framing.
pub fn frame_chunk(chunk: &str) -> String {
    serde_json::json!({ "log": chunk }).to_string()
}

/// Forwards framed log chunks from the subscription into `tx` until either
/// side hangs up.
///
/// The task owns the subscription and closes it on its single exit path, so
/// the dedicated pub/sub connection is released exactly once whether the
/// publisher went quiet, the stream driver finished, or the client vanished.
pub fn spawn_tail(
    mut subscription: LogSubscription,
    tx: mpsc::Sender<StreamEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                maybe = subscription.next_chunk() => match maybe {
                    Some(chunk) => {
                        let event = StreamEvent::Data(frame_chunk(&chunk));
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    // Subscription connection is gone; end the stream.
                    None => break,
                },
            }
        }
        subscription.close().await;
    })
}
