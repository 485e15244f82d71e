// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed deploy queue.
//!
//! Enqueue is one atomic pipeline: the payload lands under
//! `deploy:job:<deploymentId>` and the deployment id is RPUSHed onto
//! `deploy:queue`. The worker pops ids and fetches payloads by key, so a
//! half-written handoff must never be visible.

use async_trait::async_trait;
use berth_core::job::{DeployJob, JobQueue};
use berth_core::{CoreError, Result};
use redis::aio::ConnectionManager;
use tracing::debug;
use uuid::Uuid;

/// List the external build worker pops deployment ids from.
const QUEUE_KEY: &str = "deploy:queue";

/// Key holding the serialized payload for one deployment.
fn job_key(deployment_id: Uuid) -> String {
    format!("deploy:job:{deployment_id}")
}

/// [`JobQueue`] over the shared Redis.
pub struct RedisJobQueue {
    conn: ConnectionManager,
}

impl RedisJobQueue {
    /// Wrap the shared command connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &DeployJob) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        let key = job_key(job.deployment_id);

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .set(&key, &payload)
            .rpush(QUEUE_KEY, job.deployment_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::Queue(e.to_string()))?;

        debug!(
            deployment_id = %job.deployment_id,
            service_id = %job.service_id,
            "Deploy job enqueued"
        );
        Ok(())
    }
}
