// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed coordination: the status lock, the deploy-queue handoff,
//! and the build-log pub/sub tap.
//!
//! Commands ride a single [`ConnectionManager`], which multiplexes and
//! reconnects on its own; callers clone it per operation. Subscriptions
//! cannot ride the manager, so each log stream opens a dedicated pub/sub
//! connection from the [`redis::Client`] instead.

mod lock;
mod pubsub;
mod queue;

pub use lock::RedisStatusLock;
pub use pubsub::{LogSubscription, log_channel, publish_chunk};
pub use queue::RedisJobQueue;

use berth_core::{CoreError, Result};
use redis::aio::ConnectionManager;

/// Open the shared command connection.
///
/// Returns the client alongside the manager; the client is kept for opening
/// dedicated pub/sub connections later.
pub async fn connect(url: &str) -> Result<(redis::Client, ConnectionManager)> {
    let client = redis::Client::open(url).map_err(|e| CoreError::Redis(e.to_string()))?;
    let manager = ConnectionManager::new(client.clone())
        .await
        .map_err(|e| CoreError::Redis(e.to_string()))?;
    Ok((client, manager))
}
