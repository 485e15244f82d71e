// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for berth-server scenario tests.
//!
//! Everything runs in process: the in-memory repository and lock, the
//! capture queue, the mock engine, and a static token table. No database,
//! Redis, or engine socket is required.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use berth_core::job::MemoryJobQueue;
use berth_core::lock::MemoryStatusLock;
use berth_core::model::{ServiceKind, ServiceRecord};
use berth_core::persistence::NewService;
use berth_core::persistence::memory::MemoryRepository;
use berth_runtime::MockRuntime;
use berth_runtime::provision::discovery_label;
use berth_server::api::{self, AppState};
use berth_server::auth::{Identity, StaticTokenVerifier};
use berth_server::control::ServiceControl;
use berth_server::credentials::CredentialCipher;
use berth_server::dispatcher::DeploymentDispatcher;
use berth_server::stream::StreamLimits;

/// 32 bytes of fixed key material, hex encoded.
pub const TEST_KEY_HEX: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

/// In-process wiring of the whole control plane.
pub struct TestContext {
    pub repo: Arc<MemoryRepository>,
    pub lock: Arc<MemoryStatusLock>,
    pub queue: Arc<MemoryJobQueue>,
    pub runtime: Arc<MockRuntime>,
    pub verifier: Arc<StaticTokenVerifier>,
    pub cipher: Arc<CredentialCipher>,
    pub dispatcher: Arc<DeploymentDispatcher>,
    pub control: Arc<ServiceControl>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_engine(MockRuntime::new())
    }

    /// Wire the context over a specific mock engine, for outage scenarios.
    pub fn with_engine(engine: MockRuntime) -> Self {
        let repo = Arc::new(MemoryRepository::new());
        let lock = Arc::new(MemoryStatusLock::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let runtime = Arc::new(engine);
        let verifier = Arc::new(StaticTokenVerifier::new());
        let cipher = Arc::new(CredentialCipher::new(TEST_KEY_HEX).expect("test key"));

        let dispatcher = Arc::new(
            DeploymentDispatcher::new(repo.clone(), lock.clone(), queue.clone(), cipher.clone())
                .with_environment("test"),
        );
        let control = Arc::new(ServiceControl::new(
            repo.clone(),
            lock.clone(),
            runtime.clone(),
            "berth.test",
        ));

        Self {
            repo,
            lock,
            queue,
            runtime,
            verifier,
            cipher,
            dispatcher,
            control,
        }
    }

    /// Register a user and issue a bearer token for them.
    pub fn signed_in(&self, username: &str) -> (Identity, String) {
        let user = self.repo.insert_user(username);
        let identity = Identity {
            user_id: user.id,
            username: user.username,
        };
        let token = format!("tok-{username}");
        self.verifier.issue(&token, identity.clone());
        (identity, token)
    }

    /// Create an app service owned by the given user.
    pub async fn app_service(&self, owner: &Identity, name: &str) -> ServiceRecord {
        self.control
            .create_service(
                owner.user_id,
                NewService {
                    name: name.to_string(),
                    kind: ServiceKind::App,
                    repo_url: Some(format!("https://github.com/acme/{name}.git")),
                    branch: Some("main".to_string()),
                    port: Some(3000),
                    ..NewService::default()
                },
            )
            .await
            .expect("create service")
    }

    /// Put a running container for the service into the mock engine.
    pub async fn seed_running_container(&self, service: &ServiceRecord) -> String {
        let (key, value) = discovery_label(service);
        self.runtime
            .seed_running(
                &format!("{}-x7k2p9", service.name),
                "registry/app:latest",
                BTreeMap::from([(key.to_string(), value)]),
            )
            .await
    }

    /// Application state over this context's backends.
    ///
    /// The Redis client is never connected here; pub/sub connections are
    /// opened lazily and only by the log-stream route.
    pub fn app_state(&self) -> AppState {
        AppState {
            repo: self.repo.clone(),
            runtime: self.runtime.clone(),
            verifier: self.verifier.clone(),
            dispatcher: self.dispatcher.clone(),
            control: self.control.clone(),
            redis_client: redis::Client::open("redis://127.0.0.1:6379/").expect("redis url"),
            stream_limits: StreamLimits::default(),
            metrics_interval: Duration::from_millis(20),
        }
    }

    /// A fresh router over this context.
    pub fn router(&self) -> axum::Router {
        api::router(self.app_state())
    }
}
