// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic resource-usage snapshots for one tenant's services.
//!
//! Each tick costs one service query, one engine listing, and one batched
//! sample call, no matter how many services the caller owns. Containers are
//! matched to services by label afterwards.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::time;
use tracing::{error, warn};
use uuid::Uuid;

use berth_core::model::{ContainerInfo, ServiceRecord};
use berth_core::persistence::Repository;
use berth_core::{CoreError, Result};
use berth_runtime::{ContainerMetricsSample, ContainerRuntime, ops};

use crate::stream::{StreamErrorCode, StreamEvent};

/// Default re-snapshot cadence.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive failed snapshots tolerated before the stream closes.
const SNAPSHOT_FAILURE_LIMIT: u32 = 3;

/// Aggregate usage for one service at one instant.
///
/// Sums over the service's running containers; a stopped service reports
/// zeros rather than disappearing from the payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
    pub service_id: Uuid,
    pub name: String,
    /// Containers that produced a sample this tick.
    pub running_containers: usize,
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

impl ServiceMetrics {
    fn zeroed(service: &ServiceRecord) -> Self {
        Self {
            service_id: service.id,
            name: service.name.clone(),
            running_containers: 0,
            cpu_percent: 0.0,
            memory_used_bytes: 0,
            memory_limit_bytes: 0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
        }
    }

    fn absorb(&mut self, sample: &ContainerMetricsSample) {
        self.running_containers += 1;
        self.cpu_percent += sample.cpu_percent;
        self.memory_used_bytes += sample.memory_used_bytes;
        self.memory_limit_bytes += sample.memory_limit_bytes;
        self.network_rx_bytes += sample.network_rx_bytes;
        self.network_tx_bytes += sample.network_tx_bytes;
    }
}

/// One full metrics tick across every service the caller owns.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: DateTime<Utc>,
    pub services: Vec<ServiceMetrics>,
}

const SNAPSHOT_KIND: &str = "metrics";

fn connected_ack() -> String {
    serde_json::json!({ "type": "connected" }).to_string()
}

/// Collect one snapshot for everything `owner_id` owns.
pub async fn snapshot(
    repo: &dyn Repository,
    runtime: &dyn ContainerRuntime,
    owner_id: Uuid,
) -> Result<MetricsSnapshot> {
    let services = repo.list_services_for_owner(owner_id).await?;
    if services.is_empty() {
        return Ok(MetricsSnapshot {
            kind: SNAPSHOT_KIND,
            timestamp: Utc::now(),
            services: Vec::new(),
        });
    }

    let containers = ops::list_managed(runtime)
        .await
        .map_err(|e| CoreError::RuntimeUnavailable(e.to_string()))?;

    // Match once, sample once.
    let matched: Vec<Vec<&ContainerInfo>> = services
        .iter()
        .map(|service| {
            containers
                .iter()
                .filter(|c| c.belongs_to(service))
                .collect()
        })
        .collect();
    let ids: Vec<String> = matched
        .iter()
        .flatten()
        .map(|c| c.id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let samples = if ids.is_empty() {
        Vec::new()
    } else {
        runtime
            .sample_metrics(&ids)
            .await
            .map_err(|e| CoreError::RuntimeUnavailable(e.to_string()))?
    };
    let by_container: HashMap<&str, &ContainerMetricsSample> = samples
        .iter()
        .map(|s| (s.container_id.as_str(), s))
        .collect();

    let services = services
        .iter()
        .zip(&matched)
        .map(|(service, containers)| {
            let mut metrics = ServiceMetrics::zeroed(service);
            for container in containers {
                if let Some(sample) = by_container.get(container.id.as_str()) {
                    metrics.absorb(sample);
                }
            }
            metrics
        })
        .collect();

    Ok(MetricsSnapshot {
        kind: SNAPSHOT_KIND,
        timestamp: Utc::now(),
        services,
    })
}

/// Event source for one metrics connection: an acknowledgment, an immediate
/// first snapshot, then one snapshot per interval.
///
/// Degraded infrastructure is tolerated per tick; the source ends with one
/// `SERVER_ERROR` event only after [`SNAPSHOT_FAILURE_LIMIT`] consecutive
/// failures.
pub fn snapshot_events(
    repo: Arc<dyn Repository>,
    runtime: Arc<dyn ContainerRuntime>,
    owner_id: Uuid,
    interval: Duration,
) -> impl Stream<Item = StreamEvent> {
    async_stream::stream! {
        yield StreamEvent::Data(connected_ack());

        let mut ticker = time::interval(interval);
        // A slow engine pushes the next tick out instead of bursting.
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        loop {
            ticker.tick().await;
            let payload = match snapshot(repo.as_ref(), runtime.as_ref(), owner_id).await {
                Ok(snap) => serde_json::to_string(&snap).map_err(CoreError::from),
                Err(e) => Err(e),
            };
            match payload {
                Ok(json) => {
                    consecutive_failures = 0;
                    yield StreamEvent::Data(json);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        owner_id = %owner_id,
                        error = %e,
                        consecutive = consecutive_failures,
                        "Metrics snapshot failed"
                    );
                    if consecutive_failures >= SNAPSHOT_FAILURE_LIMIT {
                        error!(
                            owner_id = %owner_id,
                            "Closing metrics stream after repeated snapshot failures"
                        );
                        yield StreamEvent::Error {
                            message: "Metrics collection is failing".to_string(),
                            code: StreamErrorCode::ServerError,
                        };
                        break;
                    }
                }
            }
        }
    }
}
