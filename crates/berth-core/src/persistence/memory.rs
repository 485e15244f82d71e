// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process persistence backend.
//!
//! Behaves like the PostgreSQL backend (soft-delete visibility, the
//! one-live-service-per-name invariant, append-only deployment logs) so
//! component and scenario tests run without a database. Also usable for
//! single-process demo deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::{
    CredentialProvider, DeploymentRecord, DeploymentStatus, ServiceRecord, ServiceStatus,
    SourceCredentialRecord, UserRecord,
};

use super::{AccountRepository, DeploymentRepository, NewService, ServiceRepository};

/// In-memory repository implementing all storage traits.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    services: Mutex<HashMap<Uuid, ServiceRecord>>,
    // Vec keeps insertion order so "latest" is deterministic even when
    // timestamps tie.
    deployments: Mutex<Vec<DeploymentRecord>>,
    users: Mutex<HashMap<Uuid, UserRecord>>,
    credentials: Mutex<HashMap<Uuid, SourceCredentialRecord>>,
}

impl MemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user. Test hook.
    pub fn insert_user(&self, username: &str) -> UserRecord {
        let user = UserRecord {
            id: Uuid::new_v4(),
            username: username.to_string(),
            created_at: Utc::now(),
        };
        self.users.lock().unwrap().insert(user.id, user.clone());
        user
    }

    /// Link a credential to a user. Test hook; `encrypted_token` is stored
    /// verbatim.
    pub fn link_credential(
        &self,
        user_id: Uuid,
        provider: CredentialProvider,
        encrypted_token: &str,
    ) -> SourceCredentialRecord {
        let credential = SourceCredentialRecord {
            id: Uuid::new_v4(),
            user_id,
            provider,
            encrypted_token: encrypted_token.to_string(),
            created_at: Utc::now(),
        };
        self.credentials
            .lock()
            .unwrap()
            .insert(user_id, credential.clone());
        credential
    }

    /// Overwrite a service record wholesale. Test hook for shaping
    /// scenarios the public API cannot produce directly.
    pub fn put_service(&self, service: ServiceRecord) {
        self.services.lock().unwrap().insert(service.id, service);
    }
}

#[async_trait]
impl ServiceRepository for MemoryRepository {
    async fn create_service(&self, new: NewService) -> Result<ServiceRecord> {
        let mut services = self.services.lock().unwrap();
        let clash = services
            .values()
            .any(|s| s.owner_id == new.owner_id && s.name == new.name && !s.is_deleted());
        if clash {
            return Err(CoreError::Validation {
                field: "name",
                message: format!("service name '{}' already in use", new.name),
            });
        }
        let now = Utc::now();
        let record = ServiceRecord {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            name: new.name,
            kind: new.kind,
            status: ServiceStatus::Idle,
            delete_protected: false,
            deleted_at: None,
            repo_url: new.repo_url,
            branch: new.branch,
            build_command: new.build_command,
            start_command: new.start_command,
            port: new.port,
            env_vars: new.env_vars,
            volumes: new.volumes,
            custom_domain: new.custom_domain,
            static_output_dir: new.static_output_dir,
            created_at: now,
            updated_at: now,
        };
        services.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_service(&self, service_id: Uuid) -> Result<Option<ServiceRecord>> {
        let services = self.services.lock().unwrap();
        Ok(services
            .get(&service_id)
            .filter(|s| !s.is_deleted())
            .cloned())
    }

    async fn list_services_for_owner(&self, owner_id: Uuid) -> Result<Vec<ServiceRecord>> {
        let services = self.services.lock().unwrap();
        let mut owned: Vec<ServiceRecord> = services
            .values()
            .filter(|s| s.owner_id == owner_id && !s.is_deleted())
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }

    async fn list_services_with_status(
        &self,
        statuses: &[ServiceStatus],
        limit: i64,
    ) -> Result<Vec<ServiceRecord>> {
        let services = self.services.lock().unwrap();
        let mut found: Vec<ServiceRecord> = services
            .values()
            .filter(|s| !s.is_deleted() && statuses.contains(&s.status))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn update_service_status(
        &self,
        service_id: Uuid,
        status: &ServiceStatus,
    ) -> Result<()> {
        let mut services = self.services.lock().unwrap();
        match services.get_mut(&service_id).filter(|s| !s.is_deleted()) {
            Some(service) => {
                service.status = status.clone();
                service.updated_at = Utc::now();
                Ok(())
            }
            None => Err(CoreError::not_found("service", service_id.to_string())),
        }
    }

    async fn soft_delete_service(&self, service_id: Uuid) -> Result<()> {
        let mut services = self.services.lock().unwrap();
        match services.get_mut(&service_id).filter(|s| !s.is_deleted()) {
            Some(service) if service.delete_protected => Err(CoreError::Validation {
                field: "delete_protected",
                message: "service is delete-protected".to_string(),
            }),
            Some(service) => {
                service.deleted_at = Some(Utc::now());
                service.updated_at = Utc::now();
                Ok(())
            }
            None => Err(CoreError::not_found("service", service_id.to_string())),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DeploymentRepository for MemoryRepository {
    async fn create_deployment(
        &self,
        service_id: Uuid,
        commit_hash: Option<&str>,
    ) -> Result<DeploymentRecord> {
        let now = Utc::now();
        let record = DeploymentRecord {
            id: Uuid::new_v4(),
            service_id,
            status: DeploymentStatus::Queued,
            commit_hash: commit_hash.map(str::to_string),
            logs: String::new(),
            created_at: now,
            updated_at: now,
        };
        self.deployments.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn get_deployment(&self, deployment_id: Uuid) -> Result<Option<DeploymentRecord>> {
        let deployments = self.deployments.lock().unwrap();
        Ok(deployments.iter().find(|d| d.id == deployment_id).cloned())
    }

    async fn latest_deployment(&self, service_id: Uuid) -> Result<Option<DeploymentRecord>> {
        let deployments = self.deployments.lock().unwrap();
        Ok(deployments
            .iter()
            .rev()
            .find(|d| d.service_id == service_id)
            .cloned())
    }

    async fn list_deployments(
        &self,
        service_id: Uuid,
        limit: i64,
    ) -> Result<Vec<DeploymentRecord>> {
        let deployments = self.deployments.lock().unwrap();
        Ok(deployments
            .iter()
            .rev()
            .filter(|d| d.service_id == service_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_deployments(&self, service_id: Uuid) -> Result<i64> {
        let deployments = self.deployments.lock().unwrap();
        Ok(deployments.iter().filter(|d| d.service_id == service_id).count() as i64)
    }

    async fn update_deployment_status(
        &self,
        deployment_id: Uuid,
        status: DeploymentStatus,
        logs: Option<&str>,
    ) -> Result<DeploymentRecord> {
        let mut deployments = self.deployments.lock().unwrap();
        match deployments.iter_mut().find(|d| d.id == deployment_id) {
            Some(deployment) => {
                deployment.status = status;
                if let Some(chunk) = logs {
                    deployment.logs.push_str(chunk);
                }
                deployment.updated_at = Utc::now();
                Ok(deployment.clone())
            }
            None => Err(CoreError::not_found("deployment", deployment_id.to_string())),
        }
    }

    async fn delete_deployments_for_service(&self, service_id: Uuid) -> Result<u64> {
        let mut deployments = self.deployments.lock().unwrap();
        let before = deployments.len();
        deployments.retain(|d| d.service_id != service_id);
        Ok((before - deployments.len()) as u64)
    }
}

#[async_trait]
impl AccountRepository for MemoryRepository {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>> {
        Ok(self.users.lock().unwrap().get(&user_id).cloned())
    }

    async fn get_source_credential(
        &self,
        user_id: Uuid,
    ) -> Result<Option<SourceCredentialRecord>> {
        Ok(self.credentials.lock().unwrap().get(&user_id).cloned())
    }
}

/// Convenience alias used where one struct backs every trait.
pub type SharedRepository = std::sync::Arc<MemoryRepository>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServiceKind;

    fn new_service(owner_id: Uuid, name: &str) -> NewService {
        NewService {
            owner_id,
            name: name.to_string(),
            kind: ServiceKind::App,
            ..NewService::default()
        }
    }

    #[tokio::test]
    async fn test_unique_live_name_enforced() {
        let repo = MemoryRepository::new();
        let owner = repo.insert_user("alice").id;

        let first = repo.create_service(new_service(owner, "web")).await.unwrap();
        let err = repo.create_service(new_service(owner, "web")).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        // Another owner may reuse the name.
        let other = repo.insert_user("bob").id;
        repo.create_service(new_service(other, "web")).await.unwrap();

        // Soft delete frees the name for its owner.
        repo.soft_delete_service(first.id).await.unwrap();
        repo.create_service(new_service(owner, "web")).await.unwrap();
    }

    #[tokio::test]
    async fn test_soft_delete_hides_and_protects() {
        let repo = MemoryRepository::new();
        let owner = repo.insert_user("alice").id;
        let svc = repo.create_service(new_service(owner, "api")).await.unwrap();

        let mut protected = svc.clone();
        protected.delete_protected = true;
        repo.put_service(protected);
        let err = repo.soft_delete_service(svc.id).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let mut unprotected = svc.clone();
        unprotected.delete_protected = false;
        repo.put_service(unprotected);
        repo.soft_delete_service(svc.id).await.unwrap();
        assert!(repo.get_service(svc.id).await.unwrap().is_none());
        let err = repo
            .update_service_status(svc.id, &ServiceStatus::Running)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_latest_deployment_tracks_insertion_order() {
        let repo = MemoryRepository::new();
        let owner = repo.insert_user("alice").id;
        let svc = repo.create_service(new_service(owner, "api")).await.unwrap();

        let _first = repo.create_deployment(svc.id, None).await.unwrap();
        let second = repo.create_deployment(svc.id, Some("def456")).await.unwrap();

        let latest = repo.latest_deployment(svc.id).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);

        assert_eq!(repo.count_deployments(svc.id).await.unwrap(), 2);
        assert_eq!(repo.list_deployments(svc.id, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_logs_append_only() {
        let repo = MemoryRepository::new();
        let owner = repo.insert_user("alice").id;
        let svc = repo.create_service(new_service(owner, "api")).await.unwrap();
        let dep = repo.create_deployment(svc.id, None).await.unwrap();

        repo.update_deployment_status(dep.id, DeploymentStatus::Building, Some("step 1\n"))
            .await
            .unwrap();
        let done = repo
            .update_deployment_status(dep.id, DeploymentStatus::Success, Some("step 2\n"))
            .await
            .unwrap();
        assert_eq!(done.logs, "step 1\nstep 2\n");
        assert_eq!(done.status, DeploymentStatus::Success);
    }
}
