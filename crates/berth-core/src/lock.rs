// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributed status lock.
//!
//! Service status is written by two independent processes (the API and the
//! build worker). Every write happens inside a critical section guarded by
//! a named, TTL-bounded lock keyed by service id, so interleaved writes
//! cannot leave the persisted status inconsistent with reality.
//!
//! The lock is advisory and expiry-bounded: if a holder dies without
//! releasing, the TTL reclaims the name. Release after a finished critical
//! section is always attempted; a failed release is logged and left to
//! expiry.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Lock TTL for ad-hoc status updates (deploy, restart, stop, worker
/// completion).
pub const ADHOC_TTL: Duration = Duration::from_secs(10);

/// Lock TTL for periodic reconciliation passes. Short so a wedged
/// reconciler never starves user-facing writes for long.
pub const RECONCILE_TTL: Duration = Duration::from_secs(5);

/// Lock key for a service, shared by every backend.
pub fn lock_key(service_id: Uuid) -> String {
    format!("status:lock:{service_id}")
}

/// A held lock. Carries what [`StatusLock::release`] needs to give the
/// name back without deleting a successor's lock.
#[derive(Debug, Clone)]
pub struct LockLease {
    /// Service the lock belongs to.
    pub service_id: Uuid,
    /// Full lock key.
    pub key: String,
    /// Owner token. Release only deletes the lock while it still holds
    /// this value.
    pub token: String,
    /// TTL the lock was acquired with.
    pub ttl: Duration,
}

/// TTL-bounded mutual exclusion keyed by service id.
///
/// Implementations must guarantee that two valid, unexpired leases for the
/// same service never exist at once, across all cooperating processes.
#[async_trait]
pub trait StatusLock: Send + Sync {
    /// Attempt one acquisition. Returns `Ok(None)` when another writer
    /// holds the lock; `Err` only for infrastructure failures.
    async fn try_acquire(&self, service_id: Uuid, ttl: Duration) -> Result<Option<LockLease>>;

    /// Release a held lease. Returns `false` when the lease had already
    /// expired (and possibly been re-acquired by someone else); that is
    /// not an error.
    async fn release(&self, lease: &LockLease) -> Result<bool>;
}

/// Retry policy for contended acquisitions.
#[derive(Debug, Clone)]
pub struct LockRetryConfig {
    /// Total acquisition attempts before giving up.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
    /// Upper bound of the uniform random jitter added to each delay.
    /// Spreads out retries on a contended service.
    pub jitter: Duration,
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(100),
            jitter: Duration::from_millis(100),
        }
    }
}

/// Acquire the lock with bounded retries, run the critical section, then
/// release.
///
/// Release runs whether the critical section succeeded or failed. If
/// release itself fails the lease is left to TTL expiry. Exhausting the
/// retry budget surfaces [`CoreError::LockUnavailable`]; the caller must
/// abort the status mutation rather than proceed unguarded.
pub async fn with_status_lock<L, F, Fut, T>(
    lock: &L,
    service_id: Uuid,
    ttl: Duration,
    retry: &LockRetryConfig,
    critical_section: F,
) -> Result<T>
where
    L: StatusLock + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lease = acquire_with_retry(lock, service_id, ttl, retry).await?;

    let result = critical_section().await;

    match lock.release(&lease).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                service_id = %service_id,
                "Status lock expired before release; critical section outlived its TTL"
            );
        }
        Err(e) => {
            warn!(
                service_id = %service_id,
                error = %e,
                "Status lock release failed; TTL expiry will reclaim it"
            );
        }
    }

    result
}

/// Retry loop behind [`with_status_lock`], exposed for callers that need
/// to hold the lease across a non-closure shape.
pub async fn acquire_with_retry<L>(
    lock: &L,
    service_id: Uuid,
    ttl: Duration,
    retry: &LockRetryConfig,
) -> Result<LockLease>
where
    L: StatusLock + ?Sized,
{
    let attempts = retry.attempts.max(1);
    for attempt in 1..=attempts {
        if let Some(lease) = lock.try_acquire(service_id, ttl).await? {
            return Ok(lease);
        }
        if attempt < attempts {
            tokio::time::sleep(retry.delay + random_jitter(retry.jitter)).await;
        }
    }
    Err(CoreError::LockUnavailable {
        service_id: service_id.to_string(),
        attempts,
    })
}

fn random_jitter(bound: Duration) -> Duration {
    use rand::Rng;
    let bound_ms = bound.as_millis() as u64;
    if bound_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=bound_ms))
}

/// In-process lock backend.
///
/// Backs unit tests and single-process deployments. Honors TTL expiry and
/// owner-checked release like the distributed backend, and counts
/// contended acquisition attempts for test instrumentation.
#[derive(Debug, Default)]
pub struct MemoryStatusLock {
    held: std::sync::Mutex<std::collections::HashMap<Uuid, HeldEntry>>,
    contended: std::sync::atomic::AtomicU64,
}

#[derive(Debug)]
struct HeldEntry {
    token: String,
    expires_at: std::time::Instant,
}

impl MemoryStatusLock {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of acquisition attempts that found the lock held.
    pub fn contended_attempts(&self) -> u64 {
        self.contended.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusLock for MemoryStatusLock {
    async fn try_acquire(&self, service_id: Uuid, ttl: Duration) -> Result<Option<LockLease>> {
        let now = std::time::Instant::now();
        let mut held = self.held.lock().unwrap();
        if let Some(entry) = held.get(&service_id)
            && entry.expires_at > now
        {
            self.contended
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            return Ok(None);
        }
        let token = Uuid::new_v4().to_string();
        held.insert(
            service_id,
            HeldEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(LockLease {
            service_id,
            key: lock_key(service_id),
            token,
            ttl,
        }))
    }

    async fn release(&self, lease: &LockLease) -> Result<bool> {
        let mut held = self.held.lock().unwrap();
        match held.get(&lease.service_id) {
            Some(entry) if entry.token == lease.token => {
                held.remove(&lease.service_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
