// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build-log pub/sub tap.
//!
//! The build worker publishes raw log chunks to a per-deployment channel
//! while it works. Live log streams subscribe here; nothing is replayed,
//! a subscriber only sees chunks published while it is connected.

use berth_core::{CoreError, Result};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};
use uuid::Uuid;

/// Channel carrying one deployment's build log.
pub fn log_channel(deployment_id: Uuid) -> String {
    format!("deployment-logs:{deployment_id}")
}

/// Publish one log chunk. The worker-side entry point; also used by local
/// tooling to exercise live streams.
pub async fn publish_chunk(
    conn: &ConnectionManager,
    deployment_id: Uuid,
    chunk: &str,
) -> Result<()> {
    let mut conn = conn.clone();
    let _: () = redis::cmd("PUBLISH")
        .arg(log_channel(deployment_id))
        .arg(chunk)
        .query_async(&mut conn)
        .await
        .map_err(|e| CoreError::Redis(e.to_string()))?;
    Ok(())
}

/// A dedicated subscription to one deployment's log channel.
///
/// Subscriptions cannot share the multiplexed command connection; each
/// stream holds its own. Call [`close`](Self::close) when the stream ends
/// so the server drops the subscriber promptly instead of waiting for TCP
/// teardown.
pub struct LogSubscription {
    pubsub: redis::aio::PubSub,
    channel: String,
}

impl LogSubscription {
    /// Open a dedicated connection and subscribe.
    pub async fn open(client: &redis::Client, deployment_id: Uuid) -> Result<Self> {
        let channel = log_channel(deployment_id);
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| CoreError::Redis(e.to_string()))?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| CoreError::Redis(e.to_string()))?;
        debug!(channel = %channel, "Log subscription opened");
        Ok(Self { pubsub, channel })
    }

    /// Wait for the next published chunk. Returns `None` when the
    /// connection is gone.
    pub async fn next_chunk(&mut self) -> Option<String> {
        loop {
            let msg = self.pubsub.on_message().next().await?;
            match msg.get_payload::<String>() {
                Ok(chunk) => return Some(chunk),
                Err(e) => {
                    warn!(
                        channel = %self.channel,
                        error = %e,
                        "Dropping undecodable log chunk"
                    );
                }
            }
        }
    }

    /// Unsubscribe and drop the dedicated connection.
    pub async fn close(mut self) {
        if let Err(e) = self.pubsub.unsubscribe(&self.channel).await {
            debug!(
                channel = %self.channel,
                error = %e,
                "Unsubscribe failed; dropping the connection anyway"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Requires a reachable Redis; set TEST_BERTH_REDIS_URL to run.
    #[tokio::test]
    async fn test_subscriber_receives_published_chunks() {
        let Ok(url) = std::env::var("TEST_BERTH_REDIS_URL") else {
            eprintln!("Skipping redis pubsub test: TEST_BERTH_REDIS_URL not set");
            return;
        };
        let (client, conn) = crate::redis::connect(&url).await.unwrap();
        let deployment_id = Uuid::new_v4();

        let mut sub = LogSubscription::open(&client, deployment_id).await.unwrap();

        // Publish after the subscription is live; pub/sub has no replay.
        publish_chunk(&conn, deployment_id, "cloning repository\n")
            .await
            .unwrap();
        publish_chunk(&conn, deployment_id, "build step 1/4\nbuild step 2/4\n")
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), sub.next_chunk())
            .await
            .expect("chunk within deadline");
        assert_eq!(first.as_deref(), Some("cloning repository\n"));

        let second = tokio::time::timeout(Duration::from_secs(5), sub.next_chunk())
            .await
            .expect("chunk within deadline");
        assert_eq!(second.as_deref(), Some("build step 1/4\nbuild step 2/4\n"));

        sub.close().await;
    }

    #[tokio::test]
    async fn test_channels_are_scoped_per_deployment() {
        let Ok(url) = std::env::var("TEST_BERTH_REDIS_URL") else {
            eprintln!("Skipping redis pubsub test: TEST_BERTH_REDIS_URL not set");
            return;
        };
        let (client, conn) = crate::redis::connect(&url).await.unwrap();
        let watched = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut sub = LogSubscription::open(&client, watched).await.unwrap();

        publish_chunk(&conn, other, "unrelated build\n").await.unwrap();
        publish_chunk(&conn, watched, "our build\n").await.unwrap();

        let chunk = tokio::time::timeout(Duration::from_secs(5), sub.next_chunk())
            .await
            .expect("chunk within deadline");
        assert_eq!(chunk.as_deref(), Some("our build\n"));

        sub.close().await;
    }
}
