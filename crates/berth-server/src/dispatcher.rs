// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment dispatch.
//!
//! Owns the write side of the deployment lifecycle: creating a deployment,
//! marking the service DEPLOYING under the status lock, assembling the job
//! payload, and handing it to the external build worker. Also consumes the
//! worker's status reports and applies the terminal follow-on to the
//! service row.
//!
//! Credential handling: if the owning user has a linked source-control
//! credential matching the repository host, it is decrypted here, embedded
//! into the clone URL, and travels only inside the job payload. It is
//! never logged and never appears in anything returned to a caller.

use std::sync::Arc;

use berth_core::job::{DeployJob, JobQueue, embed_credential};
use berth_core::lock::{ADHOC_TTL, LockRetryConfig, StatusLock, with_status_lock};
use berth_core::model::{DeploymentRecord, DeploymentStatus, ServiceRecord, ServiceStatus, UserRecord};
use berth_core::persistence::Repository;
use berth_core::{CoreError, Result};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::access;
use crate::credentials::CredentialCipher;

/// Write-side coordinator for deployments.
pub struct DeploymentDispatcher {
    repo: Arc<dyn Repository>,
    lock: Arc<dyn StatusLock>,
    queue: Arc<dyn JobQueue>,
    cipher: Arc<CredentialCipher>,
    retry: LockRetryConfig,
    environment_name: Option<String>,
}

impl DeploymentDispatcher {
    /// Wire up a dispatcher with the default lock retry budget.
    pub fn new(
        repo: Arc<dyn Repository>,
        lock: Arc<dyn StatusLock>,
        queue: Arc<dyn JobQueue>,
        cipher: Arc<CredentialCipher>,
    ) -> Self {
        Self {
            repo,
            lock,
            queue,
            cipher,
            retry: LockRetryConfig::default(),
            environment_name: None,
        }
    }

    /// Stamp every job payload with a platform environment name.
    pub fn with_environment(mut self, name: impl Into<String>) -> Self {
        self.environment_name = Some(name.into());
        self
    }

    /// Override the lock retry budget.
    pub fn with_lock_retry(mut self, retry: LockRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Create a deployment for a service and hand it to the build worker.
    ///
    /// Inserts the deployment as `QUEUED`, marks the service `DEPLOYING`
    /// under the status lock, then enqueues the assembled job. Returns the
    /// inserted record immediately; progress past this point arrives
    /// through [`update_deployment_status`](Self::update_deployment_status).
    ///
    /// If anything after the insert fails, the deployment is marked
    /// `FAILED` with the reason so the service cannot read as deploying
    /// forever on a handoff that never happened.
    pub async fn create_and_queue_deployment(
        &self,
        service_id: Uuid,
        requester_id: Uuid,
        commit_hash: Option<&str>,
    ) -> Result<DeploymentRecord> {
        let service = access::owned_service(self.repo.as_ref(), service_id, requester_id).await?;
        let requester = self
            .repo
            .get_user(requester_id)
            .await?
            .ok_or_else(|| CoreError::not_found("user", requester_id.to_string()))?;

        let deployment = self.repo.create_deployment(service.id, commit_hash).await?;
        let trace_id = Uuid::new_v4();
        info!(
            service_id = %service.id,
            deployment_id = %deployment.id,
            trace_id = %trace_id,
            "Deployment created"
        );

        if let Err(e) = self
            .hand_off(&service, &requester, &deployment, trace_id)
            .await
        {
            let note = format!("Dispatch failed before worker handoff: {e}\n");
            if let Err(mark) = self
                .repo
                .update_deployment_status(deployment.id, DeploymentStatus::Failed, Some(&note))
                .await
            {
                error!(
                    deployment_id = %deployment.id,
                    error = %mark,
                    "Could not mark deployment FAILED after dispatch error"
                );
            }
            return Err(e);
        }

        Ok(deployment)
    }

    /// Mark DEPLOYING, assemble the payload, enqueue.
    async fn hand_off(
        &self,
        service: &ServiceRecord,
        requester: &UserRecord,
        deployment: &DeploymentRecord,
        trace_id: Uuid,
    ) -> Result<()> {
        with_status_lock(
            self.lock.as_ref(),
            service.id,
            ADHOC_TTL,
            &self.retry,
            || async {
                self.repo
                    .update_service_status(service.id, &ServiceStatus::Deploying)
                    .await
            },
        )
        .await?;

        let job = self.assemble_job(service, requester, deployment, trace_id).await?;
        self.queue.enqueue(&job).await?;

        info!(
            service_id = %service.id,
            deployment_id = %deployment.id,
            trace_id = %trace_id,
            authenticated = job.credential_token.is_some(),
            "Deploy job handed to worker queue"
        );
        Ok(())
    }

    /// Build the worker payload from the service row.
    ///
    /// Credential lookup never fails the dispatch: a missing credential
    /// means an unauthenticated clone, and an undecryptable one is logged
    /// and skipped the same way.
    async fn assemble_job(
        &self,
        service: &ServiceRecord,
        requester: &UserRecord,
        deployment: &DeploymentRecord,
        trace_id: Uuid,
    ) -> Result<DeployJob> {
        let mut repo_url = service.repo_url.clone();
        let mut credential_token = None;

        if let Some(url) = &service.repo_url
            && let Some(credential) = self.repo.get_source_credential(service.owner_id).await?
        {
            if credential.provider.matches_repo_url(url) {
                match self.cipher.decrypt(&credential.encrypted_token) {
                    Ok(secret) => {
                        repo_url = Some(embed_credential(url, secret.as_str()));
                        credential_token = Some(secret.as_str().to_owned());
                    }
                    Err(e) => {
                        warn!(
                            service_id = %service.id,
                            provider = ?credential.provider,
                            error = %e,
                            "Stored credential could not be decrypted; cloning unauthenticated"
                        );
                    }
                }
            } else {
                debug!(
                    service_id = %service.id,
                    provider = ?credential.provider,
                    "Linked credential does not match repository host"
                );
            }
        }

        Ok(DeployJob {
            deployment_id: deployment.id,
            service_id: service.id,
            repo_url,
            branch: service.branch.clone(),
            build_command: service.build_command.clone(),
            start_command: service.start_command.clone(),
            service_name: service.name.clone(),
            port: service.effective_port(),
            env_vars: service.env_vars.clone(),
            custom_domain: service.custom_domain.clone(),
            kind: service.kind,
            static_output_dir: service.static_output_dir.clone(),
            volumes: service.volumes.clone(),
            credential_token,
            project_name: service.kind.is_stack().then(|| service.project_name()),
            environment_name: self.environment_name.clone(),
            requester_username: requester.username.clone(),
            trace_id: Some(trace_id.to_string()),
        })
    }

    /// Fetch one deployment the caller owns.
    pub async fn get_deployment(
        &self,
        deployment_id: Uuid,
        requester_id: Uuid,
    ) -> Result<DeploymentRecord> {
        let (deployment, _) =
            access::owned_deployment(self.repo.as_ref(), deployment_id, requester_id).await?;
        Ok(deployment)
    }

    /// Deployment history for a service the caller owns, newest first.
    pub async fn get_service_deployments(
        &self,
        service_id: Uuid,
        requester_id: Uuid,
        limit: i64,
    ) -> Result<Vec<DeploymentRecord>> {
        access::owned_service(self.repo.as_ref(), service_id, requester_id).await?;
        self.repo.list_deployments(service_id, limit).await
    }

    /// How many deployments a service has accumulated.
    pub async fn count_deployments(&self, service_id: Uuid, requester_id: Uuid) -> Result<i64> {
        access::owned_service(self.repo.as_ref(), service_id, requester_id).await?;
        self.repo.count_deployments(service_id).await
    }

    /// Drop a service's deployment history. Returns how many rows went.
    pub async fn clear_deployments(&self, service_id: Uuid, requester_id: Uuid) -> Result<u64> {
        access::owned_service(self.repo.as_ref(), service_id, requester_id).await?;
        let removed = self.repo.delete_deployments_for_service(service_id).await?;
        info!(service_id = %service_id, removed, "Deployment history cleared");
        Ok(removed)
    }

    /// Apply a worker progress report.
    ///
    /// The deployment row has a single writer (the worker), so the row
    /// update is not lock-guarded. Terminal statuses additionally move the
    /// service row under the status lock: SUCCESS ⇒ RUNNING, FAILED ⇒
    /// FAILED.
    pub async fn update_deployment_status(
        &self,
        deployment_id: Uuid,
        status: DeploymentStatus,
        logs: Option<&str>,
    ) -> Result<DeploymentRecord> {
        if status == DeploymentStatus::Queued {
            return Err(CoreError::Validation {
                field: "status",
                message: "a worker report cannot reset a deployment to QUEUED".to_string(),
            });
        }

        let updated = self
            .repo
            .update_deployment_status(deployment_id, status, logs)
            .await?;
        debug!(
            deployment_id = %deployment_id,
            status = %status,
            "Worker status report applied"
        );

        let follow_on = match status {
            DeploymentStatus::Success => Some(ServiceStatus::Running),
            DeploymentStatus::Failed => Some(ServiceStatus::Failed),
            DeploymentStatus::Queued | DeploymentStatus::Building => None,
        };
        if let Some(next) = follow_on {
            let service_id = updated.service_id;
            with_status_lock(
                self.lock.as_ref(),
                service_id,
                ADHOC_TTL,
                &self.retry,
                || async {
                    self.repo.update_service_status(service_id, &next).await
                },
            )
            .await?;
            info!(service_id = %service_id, status = %next, "Service status moved on worker report");
        }

        Ok(updated)
    }
}
