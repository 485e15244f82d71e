// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background status reconciliation.
//!
//! Persisted statuses drift: workers die mid-build, containers crash while
//! nobody is reading, follow-on writes get lost. Each pass re-resolves the
//! services whose status claims live containers (RUNNING, CRASHING) plus
//! stale DEPLOYING rows, and persists corrections under (the short-TTL)
//! status lock.
//!
//! Two rules keep the pass safe:
//! - an unreachable engine skips the whole pass, because correcting
//!   against an empty container list would mark everything STOPPED;
//! - a correction is never written as DEPLOYING, because the sticky rule
//!   would then hold it there with no worker left to clear it.

use std::sync::Arc;
use std::time::Duration;

use berth_core::lock::{LockRetryConfig, RECONCILE_TTL, StatusLock, with_status_lock};
use berth_core::model::{
    ContainerInfo, DeploymentRecord, DeploymentStatus, ServiceRecord, ServiceStatus,
};
use berth_core::persistence::Repository;
use berth_core::status::resolve;
use berth_core::{CoreError, Result};
use berth_runtime::ContainerRuntime;
use berth_runtime::ops;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Maximum services examined per pass.
    pub batch_size: i64,
    /// Age after which an in-flight deployment is presumed abandoned and
    /// its service is re-resolved.
    pub deploying_stale_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 50,
            deploying_stale_after: Duration::from_secs(600),
        }
    }
}

/// Background worker correcting persisted service statuses.
pub struct StatusReconciler {
    repo: Arc<dyn Repository>,
    lock: Arc<dyn StatusLock>,
    runtime: Arc<dyn ContainerRuntime>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

/// Contended locks are skipped, not retried: the next pass will see the
/// service again, and whoever holds the lock is already writing status.
const SINGLE_ATTEMPT: LockRetryConfig = LockRetryConfig {
    attempts: 1,
    delay: Duration::ZERO,
    jitter: Duration::ZERO,
};

impl StatusReconciler {
    /// Create a reconciler.
    pub fn new(
        repo: Arc<dyn Repository>,
        lock: Arc<dyn StatusLock>,
        runtime: Arc<dyn ContainerRuntime>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            repo,
            lock,
            runtime,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconcile loop.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "Status reconciler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Status reconciler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Reconcile pass failed");
                    }
                }
            }
        }
    }

    /// One reconcile pass.
    async fn tick(&self) -> Result<()> {
        let candidates = self
            .repo
            .list_services_with_status(
                &[
                    ServiceStatus::Running,
                    ServiceStatus::Crashing,
                    ServiceStatus::Deploying,
                ],
                self.config.batch_size,
            )
            .await?;
        if candidates.is_empty() {
            debug!("No services in live-influenced states");
            return Ok(());
        }

        let snapshot = match ops::list_managed(self.runtime.as_ref()).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "Container engine unreachable; skipping reconcile pass");
                return Ok(());
            }
        };

        let examined = candidates.len();
        let mut corrected = 0usize;
        let mut contended = 0usize;
        let mut failed = 0usize;
        for service in candidates {
            match self.reconcile_one(&service, &snapshot).await {
                Ok(true) => corrected += 1,
                Ok(false) => {}
                Err(CoreError::LockUnavailable { .. }) => {
                    debug!(
                        service_id = %service.id,
                        "Status lock contended; leaving for the next pass"
                    );
                    contended += 1;
                }
                Err(e) => {
                    warn!(
                        service_id = %service.id,
                        error = %e,
                        "Reconcile failed for service"
                    );
                    failed += 1;
                }
            }
        }

        debug!(examined, corrected, contended, failed, "Reconcile pass finished");
        Ok(())
    }

    /// Re-resolve one service and persist the correction if it moved.
    ///
    /// Returns whether a correction was written.
    async fn reconcile_one(
        &self,
        service: &ServiceRecord,
        snapshot: &[ContainerInfo],
    ) -> Result<bool> {
        let mut latest = self.repo.latest_deployment(service.id).await?;

        // The resolver cannot see past a persisted DEPLOYING. Fresh
        // deploys are left alone; past the staleness threshold the
        // abandoned deployment is failed and the service is probed as if
        // nothing were in flight.
        let mut probe = service.clone();
        if probe.status == ServiceStatus::Deploying {
            match latest.as_ref() {
                Some(d) if d.status.is_in_progress() => {
                    if !self.is_stale(d) {
                        return Ok(false);
                    }
                    let failed = self
                        .repo
                        .update_deployment_status(
                            d.id,
                            DeploymentStatus::Failed,
                            Some("Deployment abandoned: no worker report within the staleness window\n"),
                        )
                        .await?;
                    info!(
                        service_id = %service.id,
                        deployment_id = %failed.id,
                        "Stale in-flight deployment marked FAILED"
                    );
                    latest = Some(failed);
                }
                // Terminal or missing deployment under a persisted
                // DEPLOYING means a lost follow-on write.
                _ => {}
            }
            probe.status = ServiceStatus::Idle;
        }

        let resolved = resolve(&probe, latest.as_ref(), snapshot);
        if resolved == service.status || resolved == ServiceStatus::Deploying {
            return Ok(false);
        }

        let next = resolved.clone();
        with_status_lock(
            self.lock.as_ref(),
            service.id,
            RECONCILE_TTL,
            &SINGLE_ATTEMPT,
            || async {
                self.repo.update_service_status(service.id, &next).await
            },
        )
        .await?;

        info!(
            service_id = %service.id,
            from = %service.status,
            to = %resolved,
            "Persisted status corrected"
        );
        Ok(true)
    }

    /// Whether an in-flight deployment has outlived the staleness window.
    fn is_stale(&self, deployment: &DeploymentRecord) -> bool {
        let age = Utc::now().signed_duration_since(deployment.created_at);
        match age.to_std() {
            Ok(age) => age >= self.config.deploying_stale_after,
            // A deployment from the future is clock skew; leave it alone.
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::lock::MemoryStatusLock;
    use berth_core::model::{ContainerState, ServiceKind};
    use berth_core::persistence::memory::MemoryRepository;
    use berth_core::persistence::{DeploymentRepository, NewService, ServiceRepository};
    use berth_runtime::MockRuntime;
    use berth_runtime::provision::discovery_label;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    struct Fixture {
        repo: Arc<MemoryRepository>,
        lock: Arc<MemoryStatusLock>,
        runtime: Arc<MockRuntime>,
        owner: Uuid,
    }

    impl Fixture {
        fn reconciler(&self, config: ReconcilerConfig) -> StatusReconciler {
            StatusReconciler::new(
                self.repo.clone(),
                self.lock.clone(),
                self.runtime.clone(),
                config,
            )
        }

        fn reconciler_with_default(&self) -> StatusReconciler {
            self.reconciler(ReconcilerConfig::default())
        }

        async fn service_with_status(&self, name: &str, status: ServiceStatus) -> ServiceRecord {
            let service = self
                .repo
                .create_service(NewService {
                    owner_id: self.owner,
                    name: name.to_string(),
                    kind: ServiceKind::App,
                    ..NewService::default()
                })
                .await
                .unwrap();
            self.repo
                .update_service_status(service.id, &status)
                .await
                .unwrap();
            self.repo.get_service(service.id).await.unwrap().unwrap()
        }

        async fn stored_status(&self, service_id: Uuid) -> ServiceStatus {
            self.repo
                .get_service(service_id)
                .await
                .unwrap()
                .unwrap()
                .status
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockRuntime::new())
    }

    fn fixture_with(runtime: MockRuntime) -> Fixture {
        let repo = Arc::new(MemoryRepository::new());
        let owner = repo.insert_user("alice").id;
        Fixture {
            repo,
            lock: Arc::new(MemoryStatusLock::new()),
            runtime: Arc::new(runtime),
            owner,
        }
    }

    fn labels_for(service: &ServiceRecord) -> BTreeMap<String, String> {
        let (key, value) = discovery_label(service);
        BTreeMap::from([(key.to_string(), value)])
    }

    #[tokio::test]
    async fn test_running_service_with_gone_containers_corrects_to_stopped() {
        let fx = fixture();
        let service = fx.service_with_status("api", ServiceStatus::Running).await;
        let d = fx.repo.create_deployment(service.id, None).await.unwrap();
        fx.repo
            .update_deployment_status(d.id, DeploymentStatus::Success, None)
            .await
            .unwrap();

        fx.reconciler_with_default().tick().await.unwrap();

        assert_eq!(fx.stored_status(service.id).await, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_matching_status_is_left_alone() {
        let fx = fixture();
        let service = fx.service_with_status("api", ServiceStatus::Running).await;
        fx.runtime
            .seed_running("api-1", "img:latest", labels_for(&service))
            .await;
        let before = fx.repo.get_service(service.id).await.unwrap().unwrap();

        fx.reconciler_with_default().tick().await.unwrap();

        let after = fx.repo.get_service(service.id).await.unwrap().unwrap();
        assert_eq!(after.status, ServiceStatus::Running);
        // Untouched row: a matching resolution must not write at all.
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn test_unreachable_engine_skips_the_pass() {
        let fx = fixture_with(MockRuntime::unreachable());
        let service = fx.service_with_status("api", ServiceStatus::Running).await;

        fx.reconciler_with_default().tick().await.unwrap();

        // Without the skip this would have read as STOPPED.
        assert_eq!(fx.stored_status(service.id).await, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_fresh_deploying_service_is_untouched() {
        let fx = fixture();
        let service = fx
            .service_with_status("api", ServiceStatus::Deploying)
            .await;
        fx.repo.create_deployment(service.id, None).await.unwrap();

        fx.reconciler_with_default().tick().await.unwrap();

        assert_eq!(fx.stored_status(service.id).await, ServiceStatus::Deploying);
    }

    #[tokio::test]
    async fn test_stale_deploying_fails_the_deployment_and_corrects() {
        let fx = fixture();
        let service = fx
            .service_with_status("api", ServiceStatus::Deploying)
            .await;
        let d = fx.repo.create_deployment(service.id, None).await.unwrap();

        let reconciler = fx.reconciler(ReconcilerConfig {
            deploying_stale_after: Duration::ZERO,
            ..ReconcilerConfig::default()
        });
        reconciler.tick().await.unwrap();

        assert_eq!(fx.stored_status(service.id).await, ServiceStatus::Failed);
        let deployment = fx.repo.get_deployment(d.id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment.logs.contains("abandoned"));
    }

    #[tokio::test]
    async fn test_lost_follow_on_write_is_recovered() {
        // Worker reported SUCCESS but the service row never moved.
        let fx = fixture();
        let service = fx
            .service_with_status("api", ServiceStatus::Deploying)
            .await;
        let d = fx.repo.create_deployment(service.id, None).await.unwrap();
        fx.repo
            .update_deployment_status(d.id, DeploymentStatus::Success, None)
            .await
            .unwrap();
        fx.runtime
            .seed_running("api-1", "img:latest", labels_for(&service))
            .await;

        fx.reconciler_with_default().tick().await.unwrap();

        assert_eq!(fx.stored_status(service.id).await, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_contended_lock_defers_to_next_pass() {
        let fx = fixture();
        let service = fx.service_with_status("api", ServiceStatus::Running).await;
        let d = fx.repo.create_deployment(service.id, None).await.unwrap();
        fx.repo
            .update_deployment_status(d.id, DeploymentStatus::Success, None)
            .await
            .unwrap();

        let held = fx
            .lock
            .try_acquire(service.id, Duration::from_secs(30))
            .await
            .unwrap()
            .expect("seed holder");

        fx.reconciler_with_default().tick().await.unwrap();
        assert_eq!(fx.stored_status(service.id).await, ServiceStatus::Running);

        fx.lock.release(&held).await.unwrap();
        fx.reconciler_with_default().tick().await.unwrap();
        assert_eq!(fx.stored_status(service.id).await, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_crashing_container_corrects_running_status() {
        let fx = fixture();
        let service = fx.service_with_status("api", ServiceStatus::Running).await;
        let id = fx
            .runtime
            .seed_running("api-1", "img:latest", labels_for(&service))
            .await;
        fx.runtime.set_state(&id, ContainerState::Restarting).await;

        fx.reconciler_with_default().tick().await.unwrap();

        assert_eq!(fx.stored_status(service.id).await, ServiceStatus::Crashing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_ticks_and_shuts_down() {
        let fx = fixture();
        let service = fx.service_with_status("api", ServiceStatus::Running).await;
        let d = fx.repo.create_deployment(service.id, None).await.unwrap();
        fx.repo
            .update_deployment_status(d.id, DeploymentStatus::Success, None)
            .await
            .unwrap();

        let reconciler = fx.reconciler(ReconcilerConfig {
            interval: Duration::from_millis(50),
            ..ReconcilerConfig::default()
        });
        let shutdown = reconciler.shutdown_handle();
        let handle = tokio::spawn(reconciler.run());

        // Let at least one interval elapse.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fx.stored_status(service.id).await, ServiceStatus::Stopped);

        shutdown.notify_one();
        handle.await.unwrap();
    }
}
