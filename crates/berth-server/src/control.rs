// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service lifecycle control.
//!
//! Owns service CRUD and the runtime workflows (restart, stop, delete).
//! Reads resolve status against live container state; when the engine is
//! unreachable they degrade to database-only status instead of failing.
//! Runtime writes go the other way: an unreachable engine fails the
//! operation.
//!
//! The container swap inside a restart routinely outlives the 10s ad-hoc
//! lock TTL, so the swap itself runs unlocked; only the persisted status
//! write afterwards takes the lock. The swap touches the engine, not the
//! status field, so this keeps the lock's actual invariant intact.

use std::sync::Arc;

use berth_core::lock::{ADHOC_TTL, LockRetryConfig, StatusLock, with_status_lock};
use berth_core::model::{
    ContainerInfo, DeploymentRecord, ServiceRecord, ServiceStatus, sanitize_name,
};
use berth_core::persistence::{NewService, Repository};
use berth_core::status::resolve;
use berth_core::{CoreError, Result};
use berth_runtime::ops::{self, RestartReport, StopReport};
use berth_runtime::provision::discovery_label;
use berth_runtime::{ContainerRuntime, RuntimeError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::access;

/// A service as presented to its owner: the stored row plus status
/// resolved against live container state.
#[derive(Debug, Clone)]
pub struct ServiceView {
    /// The stored service row. Its `status` field is the raw persisted
    /// value; `status` on the view is the resolved one.
    pub service: ServiceRecord,
    /// Resolved status.
    pub status: ServiceStatus,
    /// Live containers matched to the service. Empty when the engine did
    /// not contribute to this view.
    pub containers: Vec<ContainerInfo>,
    /// Most recent deployment, if any.
    pub latest_deployment: Option<DeploymentRecord>,
    /// Whether live container state contributed.
    pub live: bool,
}

/// Service CRUD and runtime workflows.
pub struct ServiceControl {
    repo: Arc<dyn Repository>,
    lock: Arc<dyn StatusLock>,
    runtime: Arc<dyn ContainerRuntime>,
    retry: LockRetryConfig,
    base_domain: String,
}

impl ServiceControl {
    /// Wire up with the default lock retry budget.
    pub fn new(
        repo: Arc<dyn Repository>,
        lock: Arc<dyn StatusLock>,
        runtime: Arc<dyn ContainerRuntime>,
        base_domain: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            lock,
            runtime,
            retry: LockRetryConfig::default(),
            base_domain: base_domain.into(),
        }
    }

    /// Override the lock retry budget.
    pub fn with_lock_retry(mut self, retry: LockRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Create a service owned by the requester.
    pub async fn create_service(
        &self,
        requester_id: Uuid,
        mut new: NewService,
    ) -> Result<ServiceRecord> {
        new.owner_id = requester_id;
        if new.name.is_empty() || sanitize_name(&new.name) != new.name {
            return Err(CoreError::Validation {
                field: "name",
                message: "must be a non-empty lowercase DNS-safe slug".to_string(),
            });
        }
        if let Some(port) = new.port
            && !(1..=65535).contains(&port)
        {
            return Err(CoreError::Validation {
                field: "port",
                message: format!("{port} is outside 1-65535"),
            });
        }

        let service = self.repo.create_service(new).await?;
        info!(service_id = %service.id, name = %service.name, "Service created");
        Ok(service)
    }

    /// One service with resolved status.
    pub async fn get_service(&self, service_id: Uuid, requester_id: Uuid) -> Result<ServiceView> {
        let service = access::owned_service(self.repo.as_ref(), service_id, requester_id).await?;
        let latest = self.repo.latest_deployment(service.id).await?;

        let (key, value) = discovery_label(&service);
        let snapshot = match self.runtime.list_by_label(key, &value).await {
            Ok(containers) => Some(containers),
            Err(e) => {
                warn!(
                    service_id = %service.id,
                    error = %e,
                    "Container engine unreachable; resolving from database only"
                );
                None
            }
        };
        Ok(assemble_view(service, latest, snapshot.as_deref()))
    }

    /// Every service the requester owns, resolved against one engine
    /// snapshot.
    pub async fn list_services(&self, requester_id: Uuid) -> Result<Vec<ServiceView>> {
        let services = self.repo.list_services_for_owner(requester_id).await?;
        if services.is_empty() {
            return Ok(Vec::new());
        }

        let snapshot = match ops::list_managed(self.runtime.as_ref()).await {
            Ok(containers) => Some(containers),
            Err(e) => {
                warn!(
                    error = %e,
                    "Container engine unreachable; listing from database only"
                );
                None
            }
        };

        let mut views = Vec::with_capacity(services.len());
        for service in services {
            let latest = self.repo.latest_deployment(service.id).await?;
            views.push(assemble_view(service, latest, snapshot.as_deref()));
        }
        Ok(views)
    }

    /// Replace the service's containers with a fresh one and persist
    /// `RUNNING`.
    pub async fn restart(&self, service_id: Uuid, requester_id: Uuid) -> Result<RestartReport> {
        let service = access::owned_service(self.repo.as_ref(), service_id, requester_id).await?;

        let report = ops::restart_service(self.runtime.as_ref(), &service, &self.base_domain)
            .await
            .map_err(map_runtime_error)?;
        if !report.cleanup.is_clean() {
            warn!(
                service_id = %service.id,
                failures = report.cleanup.failures.len(),
                "Restart left old containers behind"
            );
        }

        with_status_lock(
            self.lock.as_ref(),
            service.id,
            ADHOC_TTL,
            &self.retry,
            || async {
                self.repo
                    .update_service_status(service.id, &ServiceStatus::Running)
                    .await
            },
        )
        .await?;

        info!(
            service_id = %service.id,
            replacement = %report.replacement_id,
            replaced = report.replaced.len(),
            "Service restarted"
        );
        Ok(report)
    }

    /// Stop the service's running containers and persist `STOPPED`.
    pub async fn stop(&self, service_id: Uuid, requester_id: Uuid) -> Result<StopReport> {
        let service = access::owned_service(self.repo.as_ref(), service_id, requester_id).await?;

        let report = ops::stop_service(self.runtime.as_ref(), &service)
            .await
            .map_err(map_runtime_error)?;
        if !report.failures.is_empty() {
            warn!(
                service_id = %service.id,
                failures = report.failures.len(),
                "Some containers refused to stop"
            );
        }

        with_status_lock(
            self.lock.as_ref(),
            service.id,
            ADHOC_TTL,
            &self.retry,
            || async {
                self.repo
                    .update_service_status(service.id, &ServiceStatus::Stopped)
                    .await
            },
        )
        .await?;

        info!(
            service_id = %service.id,
            stopped = report.stopped.len(),
            "Service stopped"
        );
        Ok(report)
    }

    /// Soft-delete a service, stopping its containers first.
    ///
    /// The container stop is best-effort: a dead engine must not wedge
    /// deletion, and a leaked container is reclaimable later. Delete
    /// protection is checked before anything is touched.
    pub async fn delete_service(&self, service_id: Uuid, requester_id: Uuid) -> Result<()> {
        let service = access::owned_service(self.repo.as_ref(), service_id, requester_id).await?;
        if service.delete_protected {
            return Err(CoreError::Forbidden {
                resource: "service",
                id: service.id.to_string(),
            });
        }

        match ops::stop_service(self.runtime.as_ref(), &service).await {
            Ok(report) if !report.failures.is_empty() => {
                warn!(
                    service_id = %service.id,
                    failures = report.failures.len(),
                    "Some containers refused to stop before delete"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    service_id = %service.id,
                    error = %e,
                    "Could not stop containers before delete; leaving them to the engine"
                );
            }
        }

        self.repo.soft_delete_service(service.id).await?;
        info!(service_id = %service.id, "Service soft-deleted");
        Ok(())
    }
}

/// Build a view from a service row, its latest deployment, and an engine
/// snapshot (absent when the engine was unreachable).
fn assemble_view(
    service: ServiceRecord,
    latest: Option<DeploymentRecord>,
    snapshot: Option<&[ContainerInfo]>,
) -> ServiceView {
    match snapshot {
        Some(all) => {
            let containers: Vec<ContainerInfo> = all
                .iter()
                .filter(|c| c.belongs_to(&service))
                .cloned()
                .collect();
            let status = resolve(&service, latest.as_ref(), &containers);
            ServiceView {
                status,
                containers,
                latest_deployment: latest,
                live: true,
                service,
            }
        }
        None => ServiceView {
            status: database_only_status(&service, latest.as_ref()),
            containers: Vec::new(),
            latest_deployment: latest,
            live: false,
            service,
        },
    }
}

/// Engine-unreachable fallback: trust the database. In-flight deployments
/// still read as `DEPLOYING`; everything else keeps its persisted status.
fn database_only_status(
    service: &ServiceRecord,
    latest: Option<&DeploymentRecord>,
) -> ServiceStatus {
    if let Some(deployment) = latest
        && deployment.status.is_in_progress()
    {
        return ServiceStatus::Deploying;
    }
    service.status.clone()
}

/// Runtime failures as the control plane reports them: a label query that
/// found nothing is the caller's problem, everything else means the engine
/// let us down.
fn map_runtime_error(e: RuntimeError) -> CoreError {
    match e {
        RuntimeError::NoContainers(id) => CoreError::Validation {
            field: "service",
            message: format!("no live containers for service {id}"),
        },
        other => CoreError::RuntimeUnavailable(other.to_string()),
    }
}
