// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model for the deployment control plane.
//!
//! Statuses are closed enums rather than free strings so the resolver's
//! precedence logic is checked exhaustively by the compiler. Enums that
//! the outside world can extend (persisted service status, live container
//! state) carry an `Other(String)` escape variant that round-trips the
//! unknown value verbatim.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Label attached to every standalone container at creation time.
///
/// Discovery always matches on this label, never on container name,
/// which is regenerated on every restart.
pub const SERVICE_ID_LABEL: &str = "berth.service.id";

/// Project label carried by compose-style multi-container stacks.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Kind of deployable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// Generic container built from a repository.
    App,
    /// Static site served from a build output directory.
    StaticSite,
    /// Managed PostgreSQL datastore.
    Postgres,
    /// Managed Redis datastore.
    Redis,
    /// Managed MySQL datastore.
    Mysql,
    /// Managed MongoDB datastore.
    Mongo,
}

impl ServiceKind {
    /// Stable string form, as stored in the database and the job payload.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::StaticSite => "static-site",
            Self::Postgres => "postgres",
            Self::Redis => "redis",
            Self::Mysql => "mysql",
            Self::Mongo => "mongo",
        }
    }

    /// Parse from the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "app" => Some(Self::App),
            "static-site" => Some(Self::StaticSite),
            "postgres" => Some(Self::Postgres),
            "redis" => Some(Self::Redis),
            "mysql" => Some(Self::Mysql),
            "mongo" => Some(Self::Mongo),
            _ => None,
        }
    }

    /// Default exposed port per kind. `None` means the service's own
    /// configured port applies.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::App => None,
            Self::StaticSite => Some(80),
            Self::Postgres => Some(5432),
            Self::Redis => Some(6379),
            Self::Mysql => Some(3306),
            Self::Mongo => Some(27017),
        }
    }

    /// Whether services of this kind run as a compose-style multi-container
    /// stack. Stacks are discovered by project label instead of the
    /// per-service label.
    pub fn is_stack(&self) -> bool {
        matches!(self, Self::Postgres | Self::Redis | Self::Mysql | Self::Mongo)
    }
}

/// Persisted service status, mutated only under the status lock.
///
/// `Other` carries a runtime-reported state outside the known set,
/// uppercased verbatim by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServiceStatus {
    /// Never deployed.
    Idle,
    /// A deploy or restart is in flight.
    Deploying,
    /// At least one live container is running.
    Running,
    /// A live container is stuck restarting.
    Crashing,
    /// Containers stopped cleanly or are absent after a successful run.
    Stopped,
    /// The most recent deployment failed.
    Failed,
    /// A runtime state outside the known set, passed through verbatim.
    Other(String),
}

impl ServiceStatus {
    /// Stable string form, as stored in the database.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Idle => "IDLE",
            Self::Deploying => "DEPLOYING",
            Self::Running => "RUNNING",
            Self::Crashing => "CRASHING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for ServiceStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "IDLE" => Self::Idle,
            "DEPLOYING" => Self::Deploying,
            "RUNNING" => Self::Running,
            "CRASHING" => Self::Crashing,
            "STOPPED" => Self::Stopped,
            "FAILED" => Self::Failed,
            _ => Self::Other(s),
        }
    }
}

impl From<ServiceStatus> for String {
    fn from(s: ServiceStatus) -> Self {
        s.as_str().to_string()
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one build-and-run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeploymentStatus {
    /// Queued, waiting for a worker.
    Queued,
    /// A worker is building the image.
    Building,
    /// Built and launched.
    Success,
    /// The build or launch failed.
    Failed,
}

impl DeploymentStatus {
    /// Stable string form, as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Building => "BUILDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    /// Parse from the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "BUILDING" => Some(Self::Building),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the deployment is still in progress.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Queued | Self::Building)
    }

    /// Whether the deployment reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a live container as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ContainerState {
    /// Created but never started.
    Created,
    /// Running.
    Running,
    /// Crash-looping under a restart policy.
    Restarting,
    /// Exited.
    Exited,
    /// Dead (engine failed to clean it up).
    Dead,
    /// Any other engine-reported state.
    Other(String),
}

impl ContainerState {
    /// Stable lowercase string form as the engine reports it.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Other(s) => s,
        }
    }

    /// Whether the state is terminal and non-running.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Created | Self::Exited | Self::Dead)
    }
}

impl From<String> for ContainerState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Other(s),
        }
    }
}

impl From<ContainerState> for String {
    fn from(s: ContainerState) -> Self {
        s.as_str().to_string()
    }
}

/// Live container observation sourced from the runtime, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Engine-assigned container id.
    pub id: String,
    /// Current container name. Regenerated on every restart; never used
    /// for discovery.
    pub name: String,
    /// Image reference the container was created from.
    pub image: String,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Labels attached at creation time.
    pub labels: BTreeMap<String, String>,
}

impl ContainerInfo {
    /// Whether this container belongs to the given service, by label.
    pub fn belongs_to(&self, service: &ServiceRecord) -> bool {
        if service.kind.is_stack() {
            self.labels
                .get(COMPOSE_PROJECT_LABEL)
                .is_some_and(|p| p == &service.project_name())
        } else {
            self.labels
                .get(SERVICE_ID_LABEL)
                .is_some_and(|id| id == &service.id.to_string())
        }
    }
}

/// Tenant-owned deployable unit and its desired configuration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    /// Unique service identifier.
    pub id: Uuid,
    /// Owning user.
    pub owner_id: Uuid,
    /// DNS-safe service name, unique per owner among non-deleted services.
    pub name: String,
    /// Kind of deployable unit.
    pub kind: ServiceKind,
    /// Persisted status. Written only inside a status-lock critical section.
    pub status: ServiceStatus,
    /// When set, deletion requests are rejected.
    pub delete_protected: bool,
    /// Soft-delete timestamp. Set rows are invisible to every lookup path.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Source repository URL.
    pub repo_url: Option<String>,
    /// Branch to build.
    pub branch: Option<String>,
    /// Build command run by the worker.
    pub build_command: Option<String>,
    /// Start command run in the container.
    pub start_command: Option<String>,
    /// Exposed container port. Falls back to the kind's default.
    pub port: Option<i32>,
    /// Environment variables injected at build and run time.
    pub env_vars: BTreeMap<String, String>,
    /// Bind mounts, `host:container` form.
    pub volumes: Vec<String>,
    /// Custom domain routed to the service, if configured.
    pub custom_domain: Option<String>,
    /// Output directory for static-site builds.
    pub static_output_dir: Option<String>,
    /// When the service was created.
    pub created_at: DateTime<Utc>,
    /// When the service row was last written.
    pub updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    /// Whether the service has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Effective exposed port: the configured port, else the kind default.
    pub fn effective_port(&self) -> Option<u16> {
        self.port
            .and_then(|p| u16::try_from(p).ok())
            .or_else(|| self.kind.default_port())
    }

    /// Tenant-qualified slug used for hostnames and project names.
    ///
    /// Stable across restarts for a given service identity.
    pub fn slug(&self) -> String {
        let owner_short = &self.owner_id.simple().to_string()[..8];
        sanitize_name(&format!("{}-{}", self.name, owner_short))
    }

    /// Compose project name for stack kinds.
    pub fn project_name(&self) -> String {
        self.slug()
    }
}

/// Lowercase and collapse anything outside `[a-z0-9-]` so the result is
/// safe as a hostname label and a compose project name.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = true;
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// One build-and-run attempt of a service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    /// Unique deployment identifier.
    pub id: Uuid,
    /// Service this deployment belongs to.
    pub service_id: Uuid,
    /// Current status, written only by the build worker after creation.
    pub status: DeploymentStatus,
    /// Commit hash being deployed, if pinned.
    pub commit_hash: Option<String>,
    /// Append-only build/deploy log text.
    pub logs: String,
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
    /// When the deployment was last written.
    pub updated_at: DateTime<Utc>,
}

/// Platform user, reduced to the fields the dispatcher needs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    /// Unique user identifier.
    pub id: Uuid,
    /// Login name, embedded in the job payload for worker-side audit.
    pub username: String,
    /// When the user was created.
    pub created_at: DateTime<Utc>,
}

/// Source-control provider a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialProvider {
    /// github.com
    Github,
    /// gitlab.com
    Gitlab,
    /// bitbucket.org
    Bitbucket,
}

impl CredentialProvider {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Bitbucket => "bitbucket",
        }
    }

    /// Parse from the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "github" => Some(Self::Github),
            "gitlab" => Some(Self::Gitlab),
            "bitbucket" => Some(Self::Bitbucket),
            _ => None,
        }
    }

    /// Whether the given clone URL belongs to this provider's host.
    pub fn matches_repo_url(&self, repo_url: &str) -> bool {
        let host = match self {
            Self::Github => "github.com",
            Self::Gitlab => "gitlab.com",
            Self::Bitbucket => "bitbucket.org",
        };
        repo_url
            .strip_prefix("https://")
            .or_else(|| repo_url.strip_prefix("http://"))
            .is_some_and(|rest| {
                rest.strip_prefix(host)
                    .is_some_and(|tail| tail.is_empty() || tail.starts_with('/'))
            })
    }
}

/// Linked source-control credential, token encrypted at rest.
#[derive(Debug, Clone)]
pub struct SourceCredentialRecord {
    /// Unique credential identifier.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Provider the token authenticates against.
    pub provider: CredentialProvider,
    /// Base64 of nonce-prefixed AES-GCM ciphertext. Decrypted only during
    /// job-payload assembly.
    pub encrypted_token: String,
    /// When the credential was linked.
    pub created_at: DateTime<Utc>,
}
