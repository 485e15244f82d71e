// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed status lock.
//!
//! Acquisition is `SET key token NX PX ttl` with a random owner token.
//! Release runs a Lua script that deletes the key only while the token
//! still matches, so an expired lease reclaimed by another process is
//! never deleted out from under its new owner.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use berth_core::lock::{LockLease, StatusLock, lock_key};
use berth_core::{CoreError, Result};
use redis::aio::ConnectionManager;
use tracing::warn;
use uuid::Uuid;

/// Deletes the lock key only if the caller still owns it.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Cross-process [`StatusLock`] on a shared Redis.
pub struct RedisStatusLock {
    conn: ConnectionManager,
    release: redis::Script,
}

impl RedisStatusLock {
    /// Wrap the shared command connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

/// Slack allowed for clock skew and command latency when judging whether a
/// fresh lease still has usable lifetime.
fn drift_tolerance(ttl: Duration) -> Duration {
    ttl / 100 + Duration::from_millis(2)
}

#[async_trait]
impl StatusLock for RedisStatusLock {
    async fn try_acquire(&self, service_id: Uuid, ttl: Duration) -> Result<Option<LockLease>> {
        let key = lock_key(service_id);
        let token = Uuid::new_v4().to_string();
        let ttl_ms = ttl.as_millis() as u64;

        let mut conn = self.conn.clone();
        let started = Instant::now();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::Redis(e.to_string()))?;

        if reply.is_none() {
            return Ok(None);
        }

        let lease = LockLease {
            service_id,
            key,
            token,
            ttl,
        };

        // The round trip eats into the TTL. A lease whose safety margin is
        // already gone cannot guard a critical section, so hand it back and
        // report contention.
        let elapsed = started.elapsed();
        if elapsed + drift_tolerance(ttl) >= ttl {
            warn!(
                service_id = %service_id,
                elapsed_ms = elapsed.as_millis() as u64,
                ttl_ms,
                "Lock acquire round trip consumed the lease; giving it back"
            );
            let _ = self.release(&lease).await;
            return Ok(None);
        }

        Ok(Some(lease))
    }

    async fn release(&self, lease: &LockLease) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoreError::Redis(e.to_string()))?;
        Ok(removed == 1)
    }
}
