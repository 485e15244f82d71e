// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime trait definitions.
//!
//! Defines the abstract interface over the container engine. Implementations
//! are pure gateways: they never touch the database, and they never decide
//! what a service's status *means*. Discovery is label-based because
//! container names are regenerated on every restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use berth_core::model::ContainerInfo;

/// Errors from container runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// Container engine cannot be reached at all. Read paths degrade to
    /// database-only status on this error; write paths fail.
    #[error("Container engine unavailable: {0}")]
    Unavailable(String),

    /// The referenced container does not exist.
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// No live containers carry the service's discovery label.
    #[error("No containers found for service {0}")]
    NoContainers(String),

    /// Engine command exited with a non-zero code.
    #[error("`{command}` exited with {exit_code}: {stderr}")]
    CommandFailed {
        /// The engine subcommand that failed.
        command: String,
        /// Exit code from the process.
        exit_code: i32,
        /// Standard error output, trimmed.
        stderr: String,
    },

    /// Engine produced output the gateway could not parse.
    #[error("Unparseable engine output: {0}")]
    Parse(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything needed to create a replacement container.
///
/// Field shapes mirror what `inspect` reports so a restart can copy the
/// old container's configuration verbatim where it should survive the swap.
#[derive(Debug, Clone, Default)]
pub struct CreateContainerSpec {
    /// Container name. Must be unique on the engine.
    pub name: String,
    /// Image reference to create from.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Labels attached at creation time, including the discovery label
    /// and reverse-proxy routing labels.
    pub labels: BTreeMap<String, String>,
    /// Memory ceiling in bytes. `None` means unlimited.
    pub memory_limit_bytes: Option<u64>,
    /// CPU share in billionths of a core. `None` means unlimited.
    pub nano_cpus: Option<u64>,
    /// Network to attach to.
    pub network: Option<String>,
    /// Engine restart policy name (e.g. `unless-stopped`).
    pub restart_policy: Option<String>,
    /// Bind mounts, `host:container` form.
    pub volumes: Vec<String>,
}

/// Detailed state of one container, from `inspect`.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    /// Identity, state, and labels.
    pub info: ContainerInfo,
    /// Environment variables set at creation time.
    pub env: BTreeMap<String, String>,
    /// Memory ceiling in bytes, if limited.
    pub memory_limit_bytes: Option<u64>,
    /// CPU share in billionths of a core, if limited.
    pub nano_cpus: Option<u64>,
    /// Network the container is attached to.
    pub network: Option<String>,
    /// Engine restart policy name.
    pub restart_policy: Option<String>,
    /// When the container last started, if it ever did.
    pub started_at: Option<DateTime<Utc>>,
    /// Exit code of the last run, for stopped containers.
    pub exit_code: Option<i64>,
}

/// One resource-usage sample for one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetricsSample {
    /// Engine-assigned container id.
    pub container_id: String,
    /// Container name at sample time.
    pub name: String,
    /// CPU usage as a percentage of one core.
    pub cpu_percent: f64,
    /// Memory in use, bytes.
    pub memory_used_bytes: u64,
    /// Memory ceiling, bytes. Host total when the container is unlimited.
    pub memory_limit_bytes: u64,
    /// Bytes received over the network since start.
    pub network_rx_bytes: u64,
    /// Bytes sent over the network since start.
    pub network_tx_bytes: u64,
}

/// Trait for container runtime gateways.
///
/// Gateways translate between the engine's surface and the control plane's
/// vocabulary. The engine is the system of record for "is it really
/// running"; callers query it on demand and never cache beyond one
/// read-tick.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g. "docker", "mock").
    fn runtime_type(&self) -> &'static str;

    /// List all containers (running or not) carrying the given label.
    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<ContainerInfo>>;

    /// List all containers carrying the given label key, any value.
    ///
    /// Backs the one-query-per-tick discovery paths (service listings,
    /// metrics snapshots) that match containers to services afterwards.
    async fn list_labeled(&self, key: &str) -> Result<Vec<ContainerInfo>>;

    /// Detailed state of one container, by id or name.
    async fn inspect(&self, container: &str) -> Result<ContainerDetails>;

    /// Create a container from a spec without starting it.
    ///
    /// Returns the engine-assigned container id.
    async fn create(&self, spec: &CreateContainerSpec) -> Result<String>;

    /// Start a created or stopped container.
    async fn start(&self, container: &str) -> Result<()>;

    /// Stop a running container.
    async fn stop(&self, container: &str) -> Result<()>;

    /// Remove a stopped container.
    async fn remove(&self, container: &str) -> Result<()>;

    /// One resource-usage sample per requested container.
    ///
    /// Containers that disappeared between listing and sampling are
    /// silently absent from the result.
    async fn sample_metrics(&self, containers: &[String]) -> Result<Vec<ContainerMetricsSample>>;

    /// Engine liveness probe.
    async fn ping(&self) -> Result<()>;
}
