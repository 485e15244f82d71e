// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for berth-core.
//!
//! One taxonomy for the whole control plane. Ownership mismatches on
//! services and deployments always map to [`CoreError::NotFound`] so a
//! caller cannot learn whether another tenant's resource exists.

use thiserror::Error;

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Control-plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Resource absent, soft-deleted, or owned by another tenant.
    #[error("{resource} '{id}' not found")]
    NotFound {
        /// Resource kind ("service", "deployment", "user").
        resource: &'static str,
        /// The identifier that failed to resolve.
        id: String,
    },

    /// Access denied on a resource whose existence is already known to the caller.
    #[error("Access to {resource} '{id}' denied")]
    Forbidden {
        /// Resource kind.
        resource: &'static str,
        /// The identifier access was denied on.
        id: String,
    },

    /// Status lock acquisition exhausted its retry budget.
    ///
    /// Another writer holds the lock. The caller must abort the status
    /// mutation, not proceed unguarded.
    #[error("Status lock for service '{service_id}' unavailable after {attempts} attempts")]
    LockUnavailable {
        /// Service whose lock could not be acquired.
        service_id: String,
        /// Number of acquisition attempts made.
        attempts: u32,
    },

    /// Container engine unreachable or returned an engine-level failure.
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Job queue handoff failed.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Redis operation failed outside the queue handoff path (lock
    /// backend, pub/sub subscription).
    #[error("Redis error: {0}")]
    Redis(String),

    /// Request validation failed.
    #[error("Invalid {field}: {message}")]
    Validation {
        /// The field that failed validation.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },
}

impl CoreError {
    /// Shorthand for a not-found error.
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Stable error code for wire responses and log correlation.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::LockUnavailable { .. } => "LOCK_UNAVAILABLE",
            Self::RuntimeUnavailable(_) => "RUNTIME_UNAVAILABLE",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
        }
    }

    /// Whether the error should be presented to clients as-is.
    ///
    /// Infrastructure failures are logged with full context and surfaced
    /// as opaque server errors instead.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Forbidden { .. } | Self::Validation { .. }
        )
    }
}
