// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for berth-core.
//!
//! Enum columns are stored as TEXT and converted at the mapping boundary.
//! Unknown kinds and deployment statuses surface as validation errors;
//! unknown service statuses pass through as [`ServiceStatus::Other`].

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::{
    CredentialProvider, DeploymentRecord, DeploymentStatus, ServiceKind, ServiceRecord,
    ServiceStatus, SourceCredentialRecord, UserRecord,
};

use super::{AccountRepository, DeploymentRepository, NewService, ServiceRepository};

/// PostgreSQL-backed repository implementing all storage traits.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Create a repository over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(sqlx::FromRow)]
struct ServiceRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    kind: String,
    status: String,
    delete_protected: bool,
    deleted_at: Option<DateTime<Utc>>,
    repo_url: Option<String>,
    branch: Option<String>,
    build_command: Option<String>,
    start_command: Option<String>,
    port: Option<i32>,
    env_vars: serde_json::Value,
    volumes: serde_json::Value,
    custom_domain: Option<String>,
    static_output_dir: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ServiceRow> for ServiceRecord {
    type Error = CoreError;

    fn try_from(row: ServiceRow) -> Result<Self> {
        let kind = ServiceKind::parse(&row.kind).ok_or_else(|| CoreError::Validation {
            field: "kind",
            message: format!("unknown service kind '{}'", row.kind),
        })?;
        let env_vars = serde_json::from_value(row.env_vars)?;
        let volumes = serde_json::from_value(row.volumes)?;
        Ok(ServiceRecord {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            kind,
            status: ServiceStatus::from(row.status),
            delete_protected: row.delete_protected,
            deleted_at: row.deleted_at,
            repo_url: row.repo_url,
            branch: row.branch,
            build_command: row.build_command,
            start_command: row.start_command,
            port: row.port,
            env_vars,
            volumes,
            custom_domain: row.custom_domain,
            static_output_dir: row.static_output_dir,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: Uuid,
    service_id: Uuid,
    status: String,
    commit_hash: Option<String>,
    logs: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeploymentRow> for DeploymentRecord {
    type Error = CoreError;

    fn try_from(row: DeploymentRow) -> Result<Self> {
        let status = DeploymentStatus::parse(&row.status).ok_or_else(|| CoreError::Validation {
            field: "status",
            message: format!("unknown deployment status '{}'", row.status),
        })?;
        Ok(DeploymentRecord {
            id: row.id,
            service_id: row.service_id,
            status,
            commit_hash: row.commit_hash,
            logs: row.logs,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SERVICE_COLUMNS: &str = "id, owner_id, name, kind, status, delete_protected, deleted_at, \
     repo_url, branch, build_command, start_command, port, env_vars, volumes, \
     custom_domain, static_output_dir, created_at, updated_at";

const DEPLOYMENT_COLUMNS: &str =
    "id, service_id, status, commit_hash, logs, created_at, updated_at";

// ============================================================================
// Service Operations
// ============================================================================

/// Insert a service with status IDLE.
pub async fn create_service(pool: &PgPool, new: NewService) -> Result<ServiceRecord> {
    let row = sqlx::query_as::<_, ServiceRow>(&format!(
        r#"
        INSERT INTO services (id, owner_id, name, kind, status, env_vars, volumes,
                              repo_url, branch, build_command, start_command, port,
                              custom_domain, static_output_dir)
        VALUES ($1, $2, $3, $4, 'IDLE', $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING {SERVICE_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(new.owner_id)
    .bind(&new.name)
    .bind(new.kind.as_str())
    .bind(serde_json::to_value(&new.env_vars)?)
    .bind(serde_json::to_value(&new.volumes)?)
    .bind(&new.repo_url)
    .bind(&new.branch)
    .bind(&new.build_command)
    .bind(&new.start_command)
    .bind(new.port)
    .bind(&new.custom_domain)
    .bind(&new.static_output_dir)
    .fetch_one(pool)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::Validation {
            field: "name",
            message: format!("service name '{}' already in use", new.name),
        },
        _ => e.into(),
    })?;

    row.try_into()
}

/// Fetch a service by id. Soft-deleted rows are invisible.
pub async fn get_service(pool: &PgPool, service_id: Uuid) -> Result<Option<ServiceRecord>> {
    let row = sqlx::query_as::<_, ServiceRow>(&format!(
        r#"
        SELECT {SERVICE_COLUMNS}
        FROM services
        WHERE id = $1 AND deleted_at IS NULL
        "#
    ))
    .bind(service_id)
    .fetch_optional(pool)
    .await?;

    row.map(ServiceRecord::try_from).transpose()
}

/// All live services owned by a user, newest first.
pub async fn list_services_for_owner(
    pool: &PgPool,
    owner_id: Uuid,
) -> Result<Vec<ServiceRecord>> {
    let rows = sqlx::query_as::<_, ServiceRow>(&format!(
        r#"
        SELECT {SERVICE_COLUMNS}
        FROM services
        WHERE owner_id = $1 AND deleted_at IS NULL
        ORDER BY created_at DESC
        "#
    ))
    .bind(owner_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ServiceRecord::try_from).collect()
}

/// Live services in any of the given persisted statuses, stalest first.
pub async fn list_services_with_status(
    pool: &PgPool,
    statuses: &[ServiceStatus],
    limit: i64,
) -> Result<Vec<ServiceRecord>> {
    let status_strings: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
    let rows = sqlx::query_as::<_, ServiceRow>(&format!(
        r#"
        SELECT {SERVICE_COLUMNS}
        FROM services
        WHERE status = ANY($1) AND deleted_at IS NULL
        ORDER BY updated_at ASC
        LIMIT $2
        "#
    ))
    .bind(&status_strings)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ServiceRecord::try_from).collect()
}

/// Write the persisted status. Callers must hold the status lock.
pub async fn update_service_status(
    pool: &PgPool,
    service_id: Uuid,
    status: &ServiceStatus,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE services
        SET status = $2, updated_at = NOW()
        WHERE id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(service_id)
    .bind(status.as_str())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::not_found("service", service_id.to_string()));
    }

    Ok(())
}

/// Soft-delete a service. Rejected while delete protection is on.
pub async fn soft_delete_service(pool: &PgPool, service_id: Uuid) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE services
        SET deleted_at = NOW(), updated_at = NOW()
        WHERE id = $1 AND deleted_at IS NULL AND NOT delete_protected
        "#,
    )
    .bind(service_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        // Distinguish "protected" from "absent" for the caller's error.
        let protected = sqlx::query_scalar::<_, bool>(
            "SELECT delete_protected FROM services WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(service_id)
        .fetch_optional(pool)
        .await?;

        return match protected {
            Some(true) => Err(CoreError::Validation {
                field: "delete_protected",
                message: "service is delete-protected".to_string(),
            }),
            _ => Err(CoreError::not_found("service", service_id.to_string())),
        };
    }

    Ok(())
}

/// Round-trip to the database, for liveness checks.
pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

// ============================================================================
// Deployment Operations
// ============================================================================

/// Insert a deployment with status QUEUED and empty logs.
pub async fn create_deployment(
    pool: &PgPool,
    service_id: Uuid,
    commit_hash: Option<&str>,
) -> Result<DeploymentRecord> {
    let row = sqlx::query_as::<_, DeploymentRow>(&format!(
        r#"
        INSERT INTO deployments (id, service_id, status, commit_hash)
        VALUES ($1, $2, 'QUEUED', $3)
        RETURNING {DEPLOYMENT_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(service_id)
    .bind(commit_hash)
    .fetch_one(pool)
    .await?;

    row.try_into()
}

/// Fetch a deployment by id.
pub async fn get_deployment(
    pool: &PgPool,
    deployment_id: Uuid,
) -> Result<Option<DeploymentRecord>> {
    let row = sqlx::query_as::<_, DeploymentRow>(&format!(
        r#"
        SELECT {DEPLOYMENT_COLUMNS}
        FROM deployments
        WHERE id = $1
        "#
    ))
    .bind(deployment_id)
    .fetch_optional(pool)
    .await?;

    row.map(DeploymentRecord::try_from).transpose()
}

/// Most recent deployment for a service.
pub async fn latest_deployment(
    pool: &PgPool,
    service_id: Uuid,
) -> Result<Option<DeploymentRecord>> {
    let row = sqlx::query_as::<_, DeploymentRow>(&format!(
        r#"
        SELECT {DEPLOYMENT_COLUMNS}
        FROM deployments
        WHERE service_id = $1
        ORDER BY created_at DESC
        LIMIT 1
        "#
    ))
    .bind(service_id)
    .fetch_optional(pool)
    .await?;

    row.map(DeploymentRecord::try_from).transpose()
}

/// Deployment history for a service, newest first.
pub async fn list_deployments(
    pool: &PgPool,
    service_id: Uuid,
    limit: i64,
) -> Result<Vec<DeploymentRecord>> {
    let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
        r#"
        SELECT {DEPLOYMENT_COLUMNS}
        FROM deployments
        WHERE service_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#
    ))
    .bind(service_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(DeploymentRecord::try_from).collect()
}

/// Number of deployments recorded for a service.
pub async fn count_deployments(pool: &PgPool, service_id: Uuid) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM deployments WHERE service_id = $1",
    )
    .bind(service_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Write worker-reported progress, appending logs when given.
pub async fn update_deployment_status(
    pool: &PgPool,
    deployment_id: Uuid,
    status: DeploymentStatus,
    logs: Option<&str>,
) -> Result<DeploymentRecord> {
    let row = sqlx::query_as::<_, DeploymentRow>(&format!(
        r#"
        UPDATE deployments
        SET status = $2, logs = logs || COALESCE($3, ''), updated_at = NOW()
        WHERE id = $1
        RETURNING {DEPLOYMENT_COLUMNS}
        "#
    ))
    .bind(deployment_id)
    .bind(status.as_str())
    .bind(logs)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => row.try_into(),
        None => Err(CoreError::not_found("deployment", deployment_id.to_string())),
    }
}

/// Remove all deployments for a service.
pub async fn delete_deployments_for_service(pool: &PgPool, service_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM deployments WHERE service_id = $1")
        .bind(service_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Account Operations
// ============================================================================

/// Fetch a user by id.
pub async fn get_user(pool: &PgPool, user_id: Uuid) -> Result<Option<UserRecord>> {
    #[derive(sqlx::FromRow)]
    struct UserRow {
        id: Uuid,
        username: String,
        created_at: DateTime<Utc>,
    }

    let row = sqlx::query_as::<_, UserRow>(
        "SELECT id, username, created_at FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| UserRecord {
        id: r.id,
        username: r.username,
        created_at: r.created_at,
    }))
}

/// The user's most recently linked source-control credential.
pub async fn get_source_credential(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Option<SourceCredentialRecord>> {
    #[derive(sqlx::FromRow)]
    struct CredentialRow {
        id: Uuid,
        user_id: Uuid,
        provider: String,
        encrypted_token: String,
        created_at: DateTime<Utc>,
    }

    let row = sqlx::query_as::<_, CredentialRow>(
        r#"
        SELECT id, user_id, provider, encrypted_token, created_at
        FROM source_credentials
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        let provider =
            CredentialProvider::parse(&r.provider).ok_or_else(|| CoreError::Validation {
                field: "provider",
                message: format!("unknown credential provider '{}'", r.provider),
            })?;
        Ok(SourceCredentialRecord {
            id: r.id,
            user_id: r.user_id,
            provider,
            encrypted_token: r.encrypted_token,
            created_at: r.created_at,
        })
    })
    .transpose()
}

// ============================================================================
// Trait Implementations
// ============================================================================

#[async_trait::async_trait]
impl ServiceRepository for PostgresRepository {
    async fn create_service(&self, new: NewService) -> Result<ServiceRecord> {
        create_service(&self.pool, new).await
    }

    async fn get_service(&self, service_id: Uuid) -> Result<Option<ServiceRecord>> {
        get_service(&self.pool, service_id).await
    }

    async fn list_services_for_owner(&self, owner_id: Uuid) -> Result<Vec<ServiceRecord>> {
        list_services_for_owner(&self.pool, owner_id).await
    }

    async fn list_services_with_status(
        &self,
        statuses: &[ServiceStatus],
        limit: i64,
    ) -> Result<Vec<ServiceRecord>> {
        list_services_with_status(&self.pool, statuses, limit).await
    }

    async fn update_service_status(
        &self,
        service_id: Uuid,
        status: &ServiceStatus,
    ) -> Result<()> {
        update_service_status(&self.pool, service_id, status).await
    }

    async fn soft_delete_service(&self, service_id: Uuid) -> Result<()> {
        soft_delete_service(&self.pool, service_id).await
    }

    async fn ping(&self) -> Result<()> {
        ping(&self.pool).await
    }
}

#[async_trait::async_trait]
impl DeploymentRepository for PostgresRepository {
    async fn create_deployment(
        &self,
        service_id: Uuid,
        commit_hash: Option<&str>,
    ) -> Result<DeploymentRecord> {
        create_deployment(&self.pool, service_id, commit_hash).await
    }

    async fn get_deployment(&self, deployment_id: Uuid) -> Result<Option<DeploymentRecord>> {
        get_deployment(&self.pool, deployment_id).await
    }

    async fn latest_deployment(&self, service_id: Uuid) -> Result<Option<DeploymentRecord>> {
        latest_deployment(&self.pool, service_id).await
    }

    async fn list_deployments(
        &self,
        service_id: Uuid,
        limit: i64,
    ) -> Result<Vec<DeploymentRecord>> {
        list_deployments(&self.pool, service_id, limit).await
    }

    async fn count_deployments(&self, service_id: Uuid) -> Result<i64> {
        count_deployments(&self.pool, service_id).await
    }

    async fn update_deployment_status(
        &self,
        deployment_id: Uuid,
        status: DeploymentStatus,
        logs: Option<&str>,
    ) -> Result<DeploymentRecord> {
        update_deployment_status(&self.pool, deployment_id, status, logs).await
    }

    async fn delete_deployments_for_service(&self, service_id: Uuid) -> Result<u64> {
        delete_deployments_for_service(&self.pool, service_id).await
    }
}

#[async_trait::async_trait]
impl AccountRepository for PostgresRepository {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>> {
        get_user(&self.pool, user_id).await
    }

    async fn get_source_credential(
        &self,
        user_id: Uuid,
    ) -> Result<Option<SourceCredentialRecord>> {
        get_source_credential(&self.pool, user_id).await
    }
}
