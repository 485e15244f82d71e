// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenant ownership checks.
//!
//! Missing, soft-deleted, and foreign-owned resources are all reported as
//! `NotFound`, so a status-code difference can never confirm that another
//! tenant's resource exists. Every read and write path that takes a
//! service or deployment id goes through here first.

use berth_core::model::{DeploymentRecord, ServiceRecord};
use berth_core::persistence::Repository;
use berth_core::{CoreError, Result};
use uuid::Uuid;

/// Fetch a service the caller owns.
pub async fn owned_service(
    repo: &dyn Repository,
    service_id: Uuid,
    user_id: Uuid,
) -> Result<ServiceRecord> {
    let service = repo
        .get_service(service_id)
        .await?
        .ok_or_else(|| CoreError::not_found("service", service_id.to_string()))?;
    if service.owner_id != user_id {
        return Err(CoreError::not_found("service", service_id.to_string()));
    }
    Ok(service)
}

/// Fetch a deployment through its service's ownership.
pub async fn owned_deployment(
    repo: &dyn Repository,
    deployment_id: Uuid,
    user_id: Uuid,
) -> Result<(DeploymentRecord, ServiceRecord)> {
    let deployment = repo
        .get_deployment(deployment_id)
        .await?
        .ok_or_else(|| CoreError::not_found("deployment", deployment_id.to_string()))?;
    let service = match repo.get_service(deployment.service_id).await? {
        Some(service) if service.owner_id == user_id => service,
        // The service being gone (deleted) or foreign both collapse to the
        // deployment not existing for this caller.
        _ => return Err(CoreError::not_found("deployment", deployment_id.to_string())),
    };
    Ok((deployment, service))
}
