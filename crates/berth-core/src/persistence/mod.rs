// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for berth-core.
//!
//! Narrow repository traits per aggregate, wired into components at the
//! composition root. Two backends: PostgreSQL for deployments of the
//! platform, and an in-process one for hermetic tests.
//!
//! Every lookup path filters soft-deleted services. Ownership is NOT
//! checked here; callers compare `owner_id` and map mismatches to
//! `NotFound` themselves so the policy lives in one place.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryRepository;
pub use self::postgres::PostgresRepository;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    DeploymentRecord, DeploymentStatus, ServiceKind, ServiceRecord, ServiceStatus,
    SourceCredentialRecord, UserRecord,
};

/// Fields required to create a service.
#[derive(Debug, Clone)]
pub struct NewService {
    /// Owning user.
    pub owner_id: Uuid,
    /// DNS-safe service name.
    pub name: String,
    /// Kind of deployable unit.
    pub kind: ServiceKind,
    /// Source repository URL.
    pub repo_url: Option<String>,
    /// Branch to build.
    pub branch: Option<String>,
    /// Build command.
    pub build_command: Option<String>,
    /// Start command.
    pub start_command: Option<String>,
    /// Exposed container port.
    pub port: Option<i32>,
    /// Environment variables.
    pub env_vars: std::collections::BTreeMap<String, String>,
    /// Bind mounts, `host:container` form.
    pub volumes: Vec<String>,
    /// Custom domain to route.
    pub custom_domain: Option<String>,
    /// Output directory for static-site builds.
    pub static_output_dir: Option<String>,
}

impl Default for NewService {
    fn default() -> Self {
        Self {
            owner_id: Uuid::nil(),
            name: String::new(),
            kind: ServiceKind::App,
            repo_url: None,
            branch: None,
            build_command: None,
            start_command: None,
            port: None,
            env_vars: std::collections::BTreeMap::new(),
            volumes: Vec::new(),
            custom_domain: None,
            static_output_dir: None,
        }
    }
}

/// Service storage.
#[allow(missing_docs)]
#[async_trait]
pub trait ServiceRepository: Send + Sync {
    /// Create a service with status `IDLE`. Violating the one-live-service
    /// per (owner, name) invariant surfaces as a validation error.
    async fn create_service(&self, new: NewService) -> Result<ServiceRecord>;

    async fn get_service(&self, service_id: Uuid) -> Result<Option<ServiceRecord>>;

    async fn list_services_for_owner(&self, owner_id: Uuid) -> Result<Vec<ServiceRecord>>;

    /// Services currently in one of the given persisted statuses, oldest
    /// update first. Used by the reconciliation pass.
    async fn list_services_with_status(
        &self,
        statuses: &[ServiceStatus],
        limit: i64,
    ) -> Result<Vec<ServiceRecord>>;

    /// Write the persisted status. Callers must hold the status lock.
    async fn update_service_status(&self, service_id: Uuid, status: &ServiceStatus) -> Result<()>;

    /// Soft-delete. Rejected while `delete_protected` is set.
    async fn soft_delete_service(&self, service_id: Uuid) -> Result<()>;

    /// Storage liveness probe, for the health endpoint.
    async fn ping(&self) -> Result<()>;
}

/// Deployment storage.
#[allow(missing_docs)]
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    /// Insert a deployment with status `QUEUED` and empty logs.
    async fn create_deployment(
        &self,
        service_id: Uuid,
        commit_hash: Option<&str>,
    ) -> Result<DeploymentRecord>;

    async fn get_deployment(&self, deployment_id: Uuid) -> Result<Option<DeploymentRecord>>;

    /// Most recent deployment for a service, by creation time.
    async fn latest_deployment(&self, service_id: Uuid) -> Result<Option<DeploymentRecord>>;

    async fn list_deployments(
        &self,
        service_id: Uuid,
        limit: i64,
    ) -> Result<Vec<DeploymentRecord>>;

    async fn count_deployments(&self, service_id: Uuid) -> Result<i64>;

    /// Write worker-reported progress, appending `logs` when given.
    /// The deployment row has a single writer, so this is not lock-guarded.
    async fn update_deployment_status(
        &self,
        deployment_id: Uuid,
        status: DeploymentStatus,
        logs: Option<&str>,
    ) -> Result<DeploymentRecord>;

    /// Remove all deployments for a service. Returns how many went.
    async fn delete_deployments_for_service(&self, service_id: Uuid) -> Result<u64>;
}

/// User and credential lookup, reduced to what the dispatcher needs.
#[allow(missing_docs)]
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>>;

    /// The user's most recently linked source-control credential, if any.
    async fn get_source_credential(
        &self,
        user_id: Uuid,
    ) -> Result<Option<SourceCredentialRecord>>;
}

/// The full storage surface, as one object.
///
/// Blanket-implemented for anything providing all three repositories, so
/// backends only ever implement the narrow traits.
pub trait Repository: ServiceRepository + DeploymentRepository + AccountRepository {}

impl<T: ServiceRepository + DeploymentRepository + AccountRepository> Repository for T {}
