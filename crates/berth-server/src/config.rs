// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for berth-server.

use std::net::SocketAddr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL for services, deployments, and accounts
    pub database_url: String,
    /// Redis URL for the status lock, the job queue, and log pub/sub
    pub redis_url: String,
    /// HTTP bind address
    pub bind_addr: SocketAddr,
    /// Base domain services are exposed under (`<name>-<owner>.<base>`)
    pub base_domain: String,
    /// AES-256 key for source credentials at rest, 64 hex characters
    pub credential_key: String,
    /// HMAC secret for bearer token verification
    pub token_secret: String,
    /// Platform environment name passed through to build jobs
    pub environment_name: Option<String>,
    /// How often the status reconciler runs
    pub reconcile_interval: Duration,
    /// Services examined per reconciler tick
    pub reconcile_batch: i64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL"))?;

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let bind_addr: SocketAddr = std::env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr)?;

        let base_domain = std::env::var("BASE_DOMAIN").unwrap_or_else(|_| "localhost".to_string());

        let credential_key = std::env::var("CREDENTIAL_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("CREDENTIAL_KEY"))?;

        let token_secret = std::env::var("TOKEN_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("TOKEN_SECRET"))?;

        let environment_name = std::env::var("ENVIRONMENT_NAME").ok();

        let reconcile_interval = Duration::from_secs(
            std::env::var("RECONCILE_INTERVAL_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("RECONCILE_INTERVAL_SECS"))?,
        );

        let reconcile_batch: i64 = std::env::var("RECONCILE_BATCH_SIZE")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidNumber("RECONCILE_BATCH_SIZE"))?;

        Ok(Self {
            database_url,
            redis_url,
            bind_addr,
            base_domain,
            credential_key,
            token_secret,
            environment_name,
            reconcile_interval,
            reconcile_batch,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The bind address is not a valid socket address.
    #[error("Invalid bind address")]
    InvalidBindAddr,
    /// A numeric setting failed to parse.
    #[error("Invalid numeric value for {0}")]
    InvalidNumber(&'static str),
}
