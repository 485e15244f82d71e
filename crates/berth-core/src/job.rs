// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build/deploy job contract.
//!
//! The payload handed to the external build worker, and the queue trait it
//! travels through. The handoff is one-way: after enqueue the worker owns
//! the job and reports progress back through the deployment status-update
//! path only.
//!
//! Payloads can carry a decrypted source-control credential (standalone
//! and embedded in the clone URL). `Debug` is implemented by hand so the
//! credential can never reach logs through format strings.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::model::ServiceKind;

/// Job payload consumed by the external build/deploy worker.
///
/// Serialized as camelCase JSON. Fields that may be absent on the wire are
/// skipped when `None`; the rest are always present (null when unset).
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployJob {
    /// Deployment this job builds.
    pub deployment_id: Uuid,
    /// Service being deployed.
    pub service_id: Uuid,
    /// Clone URL. May embed a decrypted credential for private
    /// repositories.
    pub repo_url: Option<String>,
    /// Branch to build.
    pub branch: Option<String>,
    /// Build command.
    pub build_command: Option<String>,
    /// Start command.
    pub start_command: Option<String>,
    /// Service name, for container naming and worker logs.
    pub service_name: String,
    /// Exposed port (configured port or kind default).
    pub port: Option<u16>,
    /// Environment variables.
    pub env_vars: BTreeMap<String, String>,
    /// Custom domain to route, if configured.
    pub custom_domain: Option<String>,
    /// Kind of deployable unit.
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    /// Output directory for static-site builds.
    pub static_output_dir: Option<String>,
    /// Bind mounts, `host:container` form.
    pub volumes: Vec<String>,
    /// Decrypted source-control token, when the owner has a matching
    /// linked credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_token: Option<String>,
    /// Compose project name for stack kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    /// Platform environment (e.g. "production"), when configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_name: Option<String>,
    /// Username of the requesting user, for worker-side audit.
    pub requester_username: String,
    /// Correlation id carried through worker logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl std::fmt::Debug for DeployJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployJob")
            .field("deployment_id", &self.deployment_id)
            .field("service_id", &self.service_id)
            .field(
                "repo_url",
                &self.repo_url.as_deref().map(redact_clone_url),
            )
            .field("branch", &self.branch)
            .field("build_command", &self.build_command)
            .field("start_command", &self.start_command)
            .field("service_name", &self.service_name)
            .field("port", &self.port)
            .field("env_vars", &format_args!("<{} vars>", self.env_vars.len()))
            .field("custom_domain", &self.custom_domain)
            .field("kind", &self.kind)
            .field("static_output_dir", &self.static_output_dir)
            .field("volumes", &self.volumes)
            .field(
                "credential_token",
                &self.credential_token.as_ref().map(|_| "***"),
            )
            .field("project_name", &self.project_name)
            .field("environment_name", &self.environment_name)
            .field("requester_username", &self.requester_username)
            .field("trace_id", &self.trace_id)
            .finish()
    }
}

/// Embed a credential into an https clone URL.
///
/// `https://github.com/acme/app.git` becomes
/// `https://<token>@github.com/acme/app.git`. Non-https URLs are returned
/// unchanged; the worker will clone them unauthenticated.
pub fn embed_credential(repo_url: &str, token: &str) -> String {
    match repo_url.strip_prefix("https://") {
        Some(rest) => format!("https://{token}@{rest}"),
        None => repo_url.to_string(),
    }
}

/// Strip userinfo from a clone URL for log output.
pub fn redact_clone_url(repo_url: &str) -> String {
    if let Some(rest) = repo_url.strip_prefix("https://")
        && let Some(at) = rest.find('@')
    {
        return format!("https://***@{}", &rest[at + 1..]);
    }
    repo_url.to_string()
}

/// One-way handoff to the external build worker.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. Returns once the queue has durably accepted it.
    async fn enqueue(&self, job: &DeployJob) -> Result<()>;
}

/// In-process queue capturing jobs for inspection.
///
/// Backs unit tests and the hermetic end-to-end suite.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    jobs: std::sync::Mutex<Vec<DeployJob>>,
    fail_next: std::sync::atomic::AtomicBool,
}

impl MemoryJobQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything enqueued so far.
    pub fn jobs(&self) -> Vec<DeployJob> {
        self.jobs.lock().unwrap().clone()
    }

    /// Make the next enqueue fail, for error-path tests.
    pub fn fail_next(&self) {
        self.fail_next
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &DeployJob) -> Result<()> {
        if self
            .fail_next
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(crate::error::CoreError::Queue(
                "injected enqueue failure".to_string(),
            ));
        }
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }
}
