// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Berth control-plane server.
//!
//! Composition root: loads configuration, connects PostgreSQL and Redis,
//! wires the dispatcher, service control, and the status reconciler, and
//! serves the HTTP API until SIGTERM or SIGINT.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use berth_core::migrations;
use berth_core::persistence::Repository;
use berth_core::persistence::postgres::PostgresRepository;
use berth_runtime::ContainerRuntime;
use berth_runtime::docker::DockerRuntime;
use berth_server::api::{self, AppState};
use berth_server::auth::{JwtVerifier, TokenVerifier};
use berth_server::config::Config;
use berth_server::control::ServiceControl;
use berth_server::credentials::CredentialCipher;
use berth_server::dispatcher::DeploymentDispatcher;
use berth_server::reconciler::{ReconcilerConfig, StatusReconciler};
use berth_server::redis::{self, RedisJobQueue, RedisStatusLock};
use berth_server::stream::StreamLimits;
use berth_server::stream::metrics::DEFAULT_SNAPSHOT_INTERVAL;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "berth_server=info,berth_core=info,berth_runtime=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("loading configuration")?;
    info!(
        bind_addr = %config.bind_addr,
        base_domain = %config.base_domain,
        "Starting berth-server"
    );

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connecting to PostgreSQL")?;
    migrations::run_postgres(&pool)
        .await
        .context("running database migrations")?;
    info!("Database ready");

    let (redis_client, manager) = redis::connect(&config.redis_url)
        .await
        .context("connecting to Redis")?;
    info!("Redis ready");

    let repo: Arc<dyn Repository> = Arc::new(PostgresRepository::new(pool));
    let lock = Arc::new(RedisStatusLock::new(manager.clone()));
    let queue = Arc::new(RedisJobQueue::new(manager));
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::from_env());
    let verifier: Arc<dyn TokenVerifier> = Arc::new(JwtVerifier::new(&config.token_secret));
    let cipher = Arc::new(
        CredentialCipher::new(&config.credential_key).context("loading credential key")?,
    );

    let mut dispatcher = DeploymentDispatcher::new(repo.clone(), lock.clone(), queue, cipher);
    if let Some(name) = &config.environment_name {
        dispatcher = dispatcher.with_environment(name);
    }
    let dispatcher = Arc::new(dispatcher);

    let control = Arc::new(ServiceControl::new(
        repo.clone(),
        lock.clone(),
        runtime.clone(),
        config.base_domain.as_str(),
    ));

    let reconciler = StatusReconciler::new(
        repo.clone(),
        lock,
        runtime.clone(),
        ReconcilerConfig {
            interval: config.reconcile_interval,
            batch_size: config.reconcile_batch,
            ..ReconcilerConfig::default()
        },
    );
    let reconciler_shutdown = reconciler.shutdown_handle();
    let reconciler_task = tokio::spawn(reconciler.run());

    let state = AppState {
        repo,
        runtime,
        verifier,
        dispatcher,
        control,
        redis_client,
        stream_limits: StreamLimits::default(),
        metrics_interval: DEFAULT_SNAPSHOT_INTERVAL,
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("binding listener")?;
    info!(addr = %config.bind_addr, "Listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    reconciler_shutdown.notify_one();
    reconciler_task.await.ok();
    info!("Shutdown complete");
    Ok(())
}

/// Resolves when SIGTERM or SIGINT arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            _ = sigint.recv() => info!("SIGINT received, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
        info!("Ctrl+C received, shutting down");
    }
}
