// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restart and stop workflows.
//!
//! Free functions over the runtime trait so they run unchanged against the
//! docker gateway and the mock. Old-container cleanup is collect-and-continue:
//! a leaked stopped container is an acceptable outcome, a missing replacement
//! is not.

use tracing::{debug, info, warn};

use berth_core::model::{
    COMPOSE_PROJECT_LABEL, ContainerInfo, ContainerState, SERVICE_ID_LABEL, ServiceRecord,
};

use crate::provision::{discovery_label, replacement_spec};
use crate::traits::{ContainerRuntime, Result, RuntimeError};

/// List every container the platform could own, in one engine pass.
///
/// The union of containers carrying the service-id label and containers
/// carrying a compose project label. Callers match the result to services
/// with [`ContainerInfo::belongs_to`]; compose containers from unrelated
/// projects fall out at that step.
pub async fn list_managed(runtime: &dyn ContainerRuntime) -> Result<Vec<ContainerInfo>> {
    let mut seen = std::collections::BTreeMap::new();
    for key in [SERVICE_ID_LABEL, COMPOSE_PROJECT_LABEL] {
        for container in runtime.list_labeled(key).await? {
            seen.insert(container.id.clone(), container);
        }
    }
    Ok(seen.into_values().collect())
}

/// One best-effort cleanup action that failed and was skipped over.
#[derive(Debug, Clone)]
pub struct CleanupFailure {
    /// Container the action targeted.
    pub container_id: String,
    /// Action that failed (`stop` or `remove`).
    pub action: &'static str,
    /// Rendered error.
    pub error: String,
}

/// Per-container outcomes of a cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Containers stopped.
    pub stopped: Vec<String>,
    /// Containers removed.
    pub removed: Vec<String>,
    /// Actions that failed.
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Whether every action succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of a restart workflow.
#[derive(Debug)]
pub struct RestartReport {
    /// Id of the replacement container, already started.
    pub replacement_id: String,
    /// Name of the replacement container.
    pub replacement_name: String,
    /// Ids of the containers the replacement supersedes.
    pub replaced: Vec<String>,
    /// Old-container cleanup outcomes.
    pub cleanup: CleanupReport,
}

/// Outcome of a stop workflow.
#[derive(Debug, Default)]
pub struct StopReport {
    /// Containers stopped.
    pub stopped: Vec<String>,
    /// Stop actions that failed.
    pub failures: Vec<CleanupFailure>,
}

/// Replace a service's containers with a fresh one.
///
/// Locates existing containers by label, creates and starts a replacement
/// cloned from the first match, then stops and removes the old containers.
/// The replacement must be running before any old container is touched, so
/// even a total cleanup failure leaves the service serving traffic.
pub async fn restart_service(
    runtime: &dyn ContainerRuntime,
    service: &ServiceRecord,
    base_domain: &str,
) -> Result<RestartReport> {
    let (key, value) = discovery_label(service);
    let existing = runtime.list_by_label(key, &value).await?;
    if existing.is_empty() {
        return Err(RuntimeError::NoContainers(service.id.to_string()));
    }

    let template = runtime.inspect(&existing[0].id).await?;
    let spec = replacement_spec(service, &template, base_domain);
    debug!(
        service_id = %service.id,
        image = %spec.image,
        name = %spec.name,
        "Creating replacement container"
    );

    let replacement_id = runtime.create(&spec).await?;
    if let Err(e) = runtime.start(&replacement_id).await {
        // A created-but-dead replacement would shadow the real containers
        // in later listings. Remove it before surfacing the error.
        if let Err(rm_err) = runtime.remove(&replacement_id).await {
            warn!(
                container = %replacement_id,
                error = %rm_err,
                "Failed to remove replacement that would not start"
            );
        }
        return Err(e);
    }

    let replaced: Vec<String> = existing.iter().map(|c| c.id.clone()).collect();
    let mut cleanup = CleanupReport::default();
    for container in &existing {
        match runtime.stop(&container.id).await {
            Ok(()) => cleanup.stopped.push(container.id.clone()),
            Err(e) => {
                warn!(container = %container.id, error = %e, "Failed to stop old container");
                cleanup.failures.push(CleanupFailure {
                    container_id: container.id.clone(),
                    action: "stop",
                    error: e.to_string(),
                });
            }
        }
        match runtime.remove(&container.id).await {
            Ok(()) => cleanup.removed.push(container.id.clone()),
            Err(e) => {
                warn!(container = %container.id, error = %e, "Failed to remove old container");
                cleanup.failures.push(CleanupFailure {
                    container_id: container.id.clone(),
                    action: "remove",
                    error: e.to_string(),
                });
            }
        }
    }

    info!(
        service_id = %service.id,
        replacement = %replacement_id,
        replaced = replaced.len(),
        cleanup_failures = cleanup.failures.len(),
        "Restarted service"
    );

    Ok(RestartReport {
        replacement_id,
        replacement_name: spec.name,
        replaced,
        cleanup,
    })
}

/// Stop a service's running containers.
///
/// Containers not currently running are left untouched. Persisting the
/// STOPPED status afterwards is the caller's job, under the status lock.
pub async fn stop_service(
    runtime: &dyn ContainerRuntime,
    service: &ServiceRecord,
) -> Result<StopReport> {
    let (key, value) = discovery_label(service);
    let existing = runtime.list_by_label(key, &value).await?;

    let mut report = StopReport::default();
    for container in existing
        .iter()
        .filter(|c| c.state == ContainerState::Running)
    {
        match runtime.stop(&container.id).await {
            Ok(()) => report.stopped.push(container.id.clone()),
            Err(e) => {
                warn!(container = %container.id, error = %e, "Failed to stop container");
                report.failures.push(CleanupFailure {
                    container_id: container.id.clone(),
                    action: "stop",
                    error: e.to_string(),
                });
            }
        }
    }

    info!(
        service_id = %service.id,
        stopped = report.stopped.len(),
        failures = report.failures.len(),
        "Stopped service containers"
    );
    Ok(report)
}
