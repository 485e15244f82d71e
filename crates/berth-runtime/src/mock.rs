// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock container runtime for testing.
//!
//! Simulates an engine entirely in memory. Failure injection covers the
//! engine behaviors the workflows must tolerate: a dead socket, stop
//! failures during cleanup, and create/start failures during a swap.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

use berth_core::model::{ContainerInfo, ContainerState};

use crate::traits::{
    ContainerDetails, ContainerMetricsSample, ContainerRuntime, CreateContainerSpec, Result,
    RuntimeError,
};

/// Mock container runtime for tests and demos.
pub struct MockRuntime {
    containers: Arc<Mutex<HashMap<String, ContainerDetails>>>,
    next_id: AtomicU64,
    /// If true, every call fails as if the engine socket were gone.
    pub engine_down: bool,
    /// If true, `stop` calls always fail.
    pub fail_stop: bool,
    fail_next_create: AtomicBool,
    fail_next_start: AtomicBool,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create an empty mock engine.
    pub fn new() -> Self {
        Self {
            containers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            engine_down: false,
            fail_stop: false,
            fail_next_create: AtomicBool::new(false),
            fail_next_start: AtomicBool::new(false),
        }
    }

    /// Create a mock engine whose socket is unreachable.
    pub fn unreachable() -> Self {
        Self {
            engine_down: true,
            ..Self::new()
        }
    }

    /// Create a mock engine where every `stop` fails.
    pub fn failing_stop() -> Self {
        Self {
            fail_stop: true,
            ..Self::new()
        }
    }

    /// Make the next `create` call fail, for swap-abort tests.
    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    /// Make the next `start` call fail, for swap-abort tests.
    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    /// Insert a container directly, bypassing create/start.
    ///
    /// Returns the assigned container id.
    pub async fn seed_container(
        &self,
        spec: &CreateContainerSpec,
        state: ContainerState,
    ) -> String {
        let id = self.assign_id();
        let started_at = if state == ContainerState::Running {
            Some(Utc::now())
        } else {
            None
        };
        let details = ContainerDetails {
            info: ContainerInfo {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                state,
                labels: spec.labels.clone(),
            },
            env: spec.env.clone(),
            memory_limit_bytes: spec.memory_limit_bytes,
            nano_cpus: spec.nano_cpus,
            network: spec.network.clone(),
            restart_policy: spec.restart_policy.clone(),
            started_at,
            exit_code: None,
        };
        self.containers.lock().await.insert(id.clone(), details);
        id
    }

    /// Insert a running container with the given name, image, and labels.
    pub async fn seed_running(
        &self,
        name: &str,
        image: &str,
        labels: BTreeMap<String, String>,
    ) -> String {
        let spec = CreateContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            labels,
            ..CreateContainerSpec::default()
        };
        self.seed_container(&spec, ContainerState::Running).await
    }

    /// Ids of every container the engine knows, sorted.
    pub async fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.containers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Details of one container, if present.
    pub async fn get(&self, id: &str) -> Option<ContainerDetails> {
        self.containers.lock().await.get(id).cloned()
    }

    /// Force a container into a state, for scenario setup.
    pub async fn set_state(&self, id: &str, state: ContainerState) {
        if let Some(details) = self.containers.lock().await.get_mut(id) {
            details.info.state = state;
        }
    }

    fn assign_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("mock{n:012x}")
    }

    fn guard(&self) -> Result<()> {
        if self.engine_down {
            return Err(RuntimeError::Unavailable(
                "mock engine socket is down".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<ContainerInfo>> {
        self.guard()?;
        let containers = self.containers.lock().await;
        let mut matched: Vec<ContainerInfo> = containers
            .values()
            .filter(|d| d.info.labels.get(key).is_some_and(|v| v == value))
            .map(|d| d.info.clone())
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matched)
    }

    async fn list_labeled(&self, key: &str) -> Result<Vec<ContainerInfo>> {
        self.guard()?;
        let containers = self.containers.lock().await;
        let mut matched: Vec<ContainerInfo> = containers
            .values()
            .filter(|d| d.info.labels.contains_key(key))
            .map(|d| d.info.clone())
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matched)
    }

    async fn inspect(&self, container: &str) -> Result<ContainerDetails> {
        self.guard()?;
        self.containers
            .lock()
            .await
            .get(container)
            .cloned()
            .ok_or_else(|| RuntimeError::ContainerNotFound(container.to_string()))
    }

    async fn create(&self, spec: &CreateContainerSpec) -> Result<String> {
        self.guard()?;
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed {
                command: "create".to_string(),
                exit_code: 1,
                stderr: "injected create failure".to_string(),
            });
        }
        let mut containers = self.containers.lock().await;
        if containers.values().any(|d| d.info.name == spec.name) {
            return Err(RuntimeError::CommandFailed {
                command: "create".to_string(),
                exit_code: 1,
                stderr: format!("Conflict. The container name \"{}\" is already in use", spec.name),
            });
        }
        let id = self.assign_id();
        containers.insert(
            id.clone(),
            ContainerDetails {
                info: ContainerInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    image: spec.image.clone(),
                    state: ContainerState::Created,
                    labels: spec.labels.clone(),
                },
                env: spec.env.clone(),
                memory_limit_bytes: spec.memory_limit_bytes,
                nano_cpus: spec.nano_cpus,
                network: spec.network.clone(),
                restart_policy: spec.restart_policy.clone(),
                started_at: None,
                exit_code: None,
            },
        );
        Ok(id)
    }

    async fn start(&self, container: &str) -> Result<()> {
        self.guard()?;
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed {
                command: "start".to_string(),
                exit_code: 1,
                stderr: "injected start failure".to_string(),
            });
        }
        let mut containers = self.containers.lock().await;
        let details = containers
            .get_mut(container)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container.to_string()))?;
        details.info.state = ContainerState::Running;
        details.started_at = Some(Utc::now());
        details.exit_code = None;
        Ok(())
    }

    async fn stop(&self, container: &str) -> Result<()> {
        self.guard()?;
        if self.fail_stop {
            return Err(RuntimeError::CommandFailed {
                command: "stop".to_string(),
                exit_code: 1,
                stderr: "injected stop failure".to_string(),
            });
        }
        let mut containers = self.containers.lock().await;
        let details = containers
            .get_mut(container)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container.to_string()))?;
        // Stopping an already-stopped container is a no-op, like the engine.
        if !details.info.state.is_terminal() {
            details.info.state = ContainerState::Exited;
            details.exit_code = Some(0);
        }
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.guard()?;
        let mut containers = self.containers.lock().await;
        let details = containers
            .get(container)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container.to_string()))?;
        if matches!(
            details.info.state,
            ContainerState::Running | ContainerState::Restarting
        ) {
            return Err(RuntimeError::CommandFailed {
                command: "rm".to_string(),
                exit_code: 1,
                stderr: format!("cannot remove running container {container}"),
            });
        }
        containers.remove(container);
        Ok(())
    }

    async fn sample_metrics(&self, containers: &[String]) -> Result<Vec<ContainerMetricsSample>> {
        self.guard()?;
        let known = self.containers.lock().await;
        let samples = containers
            .iter()
            .filter_map(|id| known.get(id))
            .filter(|d| d.info.state == ContainerState::Running)
            .map(|d| ContainerMetricsSample {
                container_id: d.info.id.clone(),
                name: d.info.name.clone(),
                cpu_percent: 1.5,
                memory_used_bytes: 32 * 1024 * 1024,
                memory_limit_bytes: d.memory_limit_bytes.unwrap_or(512 * 1024 * 1024),
                network_rx_bytes: 2048,
                network_tx_bytes: 1024,
            })
            .collect();
        Ok(samples)
    }

    async fn ping(&self) -> Result<()> {
        self.guard()
    }
}
