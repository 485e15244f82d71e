// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service status resolution.
//!
//! Reconciles three independently-lagging sources of truth into one
//! authoritative status: the persisted status field, the most recent
//! deployment record, and the live container set. Pure function, no I/O;
//! callers fetch the inputs.
//!
//! Precedence, first match wins:
//!
//! 1. Persisted `DEPLOYING` is sticky: during a deploy/restart the live
//!    container set may be transiently empty or showing the old container
//!    mid-swap, so an in-flight operation outranks any live read.
//! 2. A latest deployment in `QUEUED`/`BUILDING` also reads as `DEPLOYING`.
//! 3. Live containers matched by label: any `running` wins, then
//!    `restarting` (crash loop), then all-terminal reads as `STOPPED`,
//!    and an unrecognized engine state is passed through uppercased
//!    rather than hidden.
//! 4. No live containers: deployment history decides (`FAILED` after a
//!    failed build, `STOPPED` after a successful run that has since gone).
//! 5. No deployments ever: `IDLE`.

use crate::model::{ContainerInfo, DeploymentRecord, ServiceRecord, ServiceStatus};

/// Resolve the authoritative status of a service.
///
/// `live_containers` may include containers belonging to other services;
/// only those matching the service's discovery label are considered.
pub fn resolve(
    service: &ServiceRecord,
    latest_deployment: Option<&DeploymentRecord>,
    live_containers: &[ContainerInfo],
) -> ServiceStatus {
    if service.status == ServiceStatus::Deploying {
        return ServiceStatus::Deploying;
    }

    if let Some(deployment) = latest_deployment
        && deployment.status.is_in_progress()
    {
        return ServiceStatus::Deploying;
    }

    let matched: Vec<&ContainerInfo> = live_containers
        .iter()
        .filter(|c| c.belongs_to(service))
        .collect();

    if !matched.is_empty() {
        return resolve_from_containers(&matched);
    }

    match latest_deployment {
        Some(d) if d.status == crate::model::DeploymentStatus::Failed => ServiceStatus::Failed,
        Some(_) => ServiceStatus::Stopped,
        None => ServiceStatus::Idle,
    }
}

/// Resolve from a non-empty set of matched live containers.
fn resolve_from_containers(matched: &[&ContainerInfo]) -> ServiceStatus {
    use crate::model::ContainerState;

    if matched.iter().any(|c| c.state == ContainerState::Running) {
        return ServiceStatus::Running;
    }
    if matched.iter().any(|c| c.state == ContainerState::Restarting) {
        return ServiceStatus::Crashing;
    }
    if matched.iter().all(|c| c.state.is_terminal()) {
        return ServiceStatus::Stopped;
    }

    // At least one container is in a state outside the known set. Surface
    // it verbatim instead of guessing.
    let unknown = matched
        .iter()
        .find(|c| !c.state.is_terminal())
        .map(|c| c.state.as_str().to_uppercase())
        .unwrap_or_else(|| "UNKNOWN".to_string());
    ServiceStatus::Other(unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        COMPOSE_PROJECT_LABEL, ContainerState, DeploymentStatus, SERVICE_ID_LABEL, ServiceKind,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn service(kind: ServiceKind, status: ServiceStatus) -> ServiceRecord {
        ServiceRecord {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "api".to_string(),
            kind,
            status,
            delete_protected: false,
            deleted_at: None,
            repo_url: None,
            branch: None,
            build_command: None,
            start_command: None,
            port: None,
            env_vars: BTreeMap::new(),
            volumes: Vec::new(),
            custom_domain: None,
            static_output_dir: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn deployment(status: DeploymentStatus) -> DeploymentRecord {
        DeploymentRecord {
            id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            status,
            commit_hash: None,
            logs: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn container_for(svc: &ServiceRecord, state: ContainerState) -> ContainerInfo {
        let mut labels = BTreeMap::new();
        if svc.kind.is_stack() {
            labels.insert(COMPOSE_PROJECT_LABEL.to_string(), svc.project_name());
        } else {
            labels.insert(SERVICE_ID_LABEL.to_string(), svc.id.to_string());
        }
        ContainerInfo {
            id: Uuid::new_v4().to_string(),
            name: format!("{}-x1y2z3", svc.name),
            image: "registry/api:latest".to_string(),
            state,
            labels,
        }
    }

    #[test]
    fn test_persisted_deploying_is_sticky() {
        let svc = service(ServiceKind::App, ServiceStatus::Deploying);
        let containers = vec![container_for(&svc, ContainerState::Running)];
        let dep = deployment(DeploymentStatus::Success);
        assert_eq!(
            resolve(&svc, Some(&dep), &containers),
            ServiceStatus::Deploying
        );
        // Even with no deployment and no containers.
        assert_eq!(resolve(&svc, None, &[]), ServiceStatus::Deploying);
    }

    #[test]
    fn test_in_progress_deployment_wins_over_live_containers() {
        let svc = service(ServiceKind::App, ServiceStatus::Running);
        let containers = vec![container_for(&svc, ContainerState::Running)];
        for status in [DeploymentStatus::Queued, DeploymentStatus::Building] {
            let dep = deployment(status);
            assert_eq!(
                resolve(&svc, Some(&dep), &containers),
                ServiceStatus::Deploying,
                "latest deployment {status} should read as DEPLOYING"
            );
        }
    }

    #[test]
    fn test_any_running_container_wins() {
        let svc = service(ServiceKind::App, ServiceStatus::Stopped);
        let dep = deployment(DeploymentStatus::Success);
        let containers = vec![
            container_for(&svc, ContainerState::Exited),
            container_for(&svc, ContainerState::Running),
            container_for(&svc, ContainerState::Restarting),
        ];
        assert_eq!(
            resolve(&svc, Some(&dep), &containers),
            ServiceStatus::Running
        );
    }

    #[test]
    fn test_restarting_reads_as_crashing() {
        let svc = service(ServiceKind::App, ServiceStatus::Running);
        let dep = deployment(DeploymentStatus::Success);
        let containers = vec![
            container_for(&svc, ContainerState::Exited),
            container_for(&svc, ContainerState::Restarting),
        ];
        assert_eq!(
            resolve(&svc, Some(&dep), &containers),
            ServiceStatus::Crashing
        );
    }

    #[test]
    fn test_all_terminal_reads_as_stopped() {
        let svc = service(ServiceKind::App, ServiceStatus::Running);
        let dep = deployment(DeploymentStatus::Success);
        let containers = vec![
            container_for(&svc, ContainerState::Exited),
            container_for(&svc, ContainerState::Dead),
            container_for(&svc, ContainerState::Created),
        ];
        assert_eq!(
            resolve(&svc, Some(&dep), &containers),
            ServiceStatus::Stopped
        );
    }

    #[test]
    fn test_unknown_state_passes_through_uppercased() {
        let svc = service(ServiceKind::App, ServiceStatus::Running);
        let dep = deployment(DeploymentStatus::Success);
        let containers = vec![
            container_for(&svc, ContainerState::Exited),
            container_for(&svc, ContainerState::Other("paused".to_string())),
        ];
        assert_eq!(
            resolve(&svc, Some(&dep), &containers),
            ServiceStatus::Other("PAUSED".to_string())
        );
    }

    #[test]
    fn test_unlabeled_containers_are_ignored() {
        let svc = service(ServiceKind::App, ServiceStatus::Running);
        let other = service(ServiceKind::App, ServiceStatus::Running);
        let dep = deployment(DeploymentStatus::Success);
        let containers = vec![container_for(&other, ContainerState::Running)];
        assert_eq!(
            resolve(&svc, Some(&dep), &containers),
            ServiceStatus::Stopped
        );
    }

    #[test]
    fn test_stack_kind_matches_by_project_label() {
        let svc = service(ServiceKind::Postgres, ServiceStatus::Stopped);
        let dep = deployment(DeploymentStatus::Success);
        let containers = vec![container_for(&svc, ContainerState::Running)];
        assert_eq!(
            resolve(&svc, Some(&dep), &containers),
            ServiceStatus::Running
        );
    }

    #[test]
    fn test_history_fallback_without_containers() {
        let svc = service(ServiceKind::App, ServiceStatus::Running);
        let failed = deployment(DeploymentStatus::Failed);
        assert_eq!(resolve(&svc, Some(&failed), &[]), ServiceStatus::Failed);

        let succeeded = deployment(DeploymentStatus::Success);
        assert_eq!(resolve(&svc, Some(&succeeded), &[]), ServiceStatus::Stopped);
    }

    #[test]
    fn test_no_history_reads_as_idle() {
        let svc = service(ServiceKind::App, ServiceStatus::Idle);
        assert_eq!(resolve(&svc, None, &[]), ServiceStatus::Idle);
    }

    #[test]
    fn test_non_deploying_persisted_status_is_not_sticky() {
        // Only DEPLOYING short-circuits; a stale persisted RUNNING must not
        // mask a dead container set.
        let svc = service(ServiceKind::App, ServiceStatus::Running);
        let dep = deployment(DeploymentStatus::Success);
        let containers = vec![container_for(&svc, ContainerState::Exited)];
        assert_eq!(
            resolve(&svc, Some(&dep), &containers),
            ServiceStatus::Stopped
        );

        let odd = service(
            ServiceKind::App,
            ServiceStatus::Other("PAUSED".to_string()),
        );
        assert_eq!(resolve(&odd, None, &[]), ServiceStatus::Idle);
    }

    #[test]
    fn test_precedence_order() {
        let svc = service(ServiceKind::App, ServiceStatus::Running);
        let running = vec![container_for(&svc, ContainerState::Running)];

        let queued = deployment(DeploymentStatus::Queued);
        assert_eq!(
            resolve(&svc, Some(&queued), &running),
            ServiceStatus::Deploying
        );

        let success = deployment(DeploymentStatus::Success);
        assert_eq!(
            resolve(&svc, Some(&success), &running),
            ServiceStatus::Running
        );
        assert_eq!(resolve(&svc, Some(&success), &[]), ServiceStatus::Stopped);
    }
}
