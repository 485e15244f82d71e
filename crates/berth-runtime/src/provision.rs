// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container provisioning conventions.
//!
//! Names, labels, resource limits, and routing rules are deterministic
//! functions of service kind and identity. Container identities change on
//! every restart; these conventions are what stays stable across the swap.

use rand::Rng;
use std::collections::BTreeMap;

use berth_core::model::{COMPOSE_PROJECT_LABEL, SERVICE_ID_LABEL, ServiceKind, ServiceRecord};

use crate::traits::{ContainerDetails, CreateContainerSpec};

/// Shared network every routed container attaches to. The reverse proxy
/// lives on this network.
pub const PROXY_NETWORK: &str = "berth";

/// Engine restart policy applied to replacement containers that had none.
pub const DEFAULT_RESTART_POLICY: &str = "unless-stopped";

/// Memory ceiling and CPU share for one service kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes.
    pub memory_bytes: u64,
    /// CPU share in billionths of a core.
    pub nano_cpus: u64,
}

/// Resource limits per service kind.
pub fn limits_for(kind: ServiceKind) -> ResourceLimits {
    const MIB: u64 = 1024 * 1024;
    match kind {
        ServiceKind::App => ResourceLimits {
            memory_bytes: 512 * MIB,
            nano_cpus: 1_000_000_000,
        },
        ServiceKind::StaticSite => ResourceLimits {
            memory_bytes: 128 * MIB,
            nano_cpus: 250_000_000,
        },
        ServiceKind::Redis => ResourceLimits {
            memory_bytes: 256 * MIB,
            nano_cpus: 500_000_000,
        },
        ServiceKind::Postgres | ServiceKind::Mysql | ServiceKind::Mongo => ResourceLimits {
            memory_bytes: 1024 * MIB,
            nano_cpus: 1_000_000_000,
        },
    }
}

/// Label key/value pair that discovers this service's containers.
///
/// Stacks are discovered by compose project label; standalone services by
/// the per-service id label.
pub fn discovery_label(service: &ServiceRecord) -> (&'static str, String) {
    if service.kind.is_stack() {
        (COMPOSE_PROJECT_LABEL, service.project_name())
    } else {
        (SERVICE_ID_LABEL, service.id.to_string())
    }
}

/// Synthesize a unique replacement name from the current one.
///
/// The current name stays as prefix so operators can eyeball which service
/// a container serves; a random suffix makes it unique. Discovery never
/// reads the name.
pub fn replacement_name(current: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(6)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("{current}-{suffix}")
}

/// Reverse-proxy routing rule for a service.
///
/// Always routes the platform hostname; a configured custom domain is
/// OR-ed in.
pub fn routing_rule(service: &ServiceRecord, base_domain: &str) -> String {
    let mut rule = format!("Host(`{}.{}`)", service.slug(), base_domain);
    if let Some(domain) = &service.custom_domain {
        rule.push_str(&format!(" || Host(`{domain}`)"));
    }
    rule
}

/// Full label set for a container of this service.
///
/// The proxy reads routing from labels, so the rule must be correct at
/// creation time for a swap to keep traffic flowing.
pub fn container_labels(service: &ServiceRecord, base_domain: &str) -> BTreeMap<String, String> {
    let slug = service.slug();
    let mut labels = BTreeMap::new();
    labels.insert(SERVICE_ID_LABEL.to_string(), service.id.to_string());
    if service.kind.is_stack() {
        labels.insert(COMPOSE_PROJECT_LABEL.to_string(), service.project_name());
    }
    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert(
        format!("traefik.http.routers.{slug}.rule"),
        routing_rule(service, base_domain),
    );
    if let Some(port) = service.effective_port() {
        labels.insert(
            format!("traefik.http.services.{slug}.loadbalancer.server.port"),
            port.to_string(),
        );
    }
    labels
}

/// Spec for the container that replaces `old` during a restart.
///
/// Image and environment are cloned from the old container; labels and
/// limits are regenerated from the service record, so a custom-domain
/// change takes effect on the next restart without a redeploy.
pub fn replacement_spec(
    service: &ServiceRecord,
    old: &ContainerDetails,
    base_domain: &str,
) -> CreateContainerSpec {
    let limits = limits_for(service.kind);
    CreateContainerSpec {
        name: replacement_name(&old.info.name),
        image: old.info.image.clone(),
        env: old.env.clone(),
        labels: container_labels(service, base_domain),
        memory_limit_bytes: Some(limits.memory_bytes),
        nano_cpus: Some(limits.nano_cpus),
        network: old
            .network
            .clone()
            .or_else(|| Some(PROXY_NETWORK.to_string())),
        restart_policy: old
            .restart_policy
            .clone()
            .or_else(|| Some(DEFAULT_RESTART_POLICY.to_string())),
        volumes: service.volumes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::model::{ContainerInfo, ContainerState, ServiceStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn service(kind: ServiceKind) -> ServiceRecord {
        ServiceRecord {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "web".to_string(),
            kind,
            status: ServiceStatus::Running,
            delete_protected: false,
            deleted_at: None,
            repo_url: None,
            branch: None,
            build_command: None,
            start_command: None,
            port: Some(3000),
            env_vars: BTreeMap::new(),
            volumes: vec!["data:/var/lib/app".to_string()],
            custom_domain: None,
            static_output_dir: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_limits_are_deterministic_per_kind() {
        assert_eq!(limits_for(ServiceKind::App), limits_for(ServiceKind::App));
        assert!(limits_for(ServiceKind::StaticSite).memory_bytes < limits_for(ServiceKind::App).memory_bytes);
        assert_eq!(limits_for(ServiceKind::Postgres), limits_for(ServiceKind::Mysql));
    }

    #[test]
    fn test_discovery_label_per_kind() {
        let app = service(ServiceKind::App);
        let (key, value) = discovery_label(&app);
        assert_eq!(key, SERVICE_ID_LABEL);
        assert_eq!(value, app.id.to_string());

        let db = service(ServiceKind::Postgres);
        let (key, value) = discovery_label(&db);
        assert_eq!(key, COMPOSE_PROJECT_LABEL);
        assert_eq!(value, db.project_name());
    }

    #[test]
    fn test_replacement_name_keeps_prefix_and_differs() {
        let a = replacement_name("web-abc123");
        let b = replacement_name("web-abc123");
        assert!(a.starts_with("web-abc123-"));
        assert_eq!(a.len(), "web-abc123-".len() + 6);
        assert_ne!(a, b);
    }

    #[test]
    fn test_routing_rule_with_custom_domain() {
        let mut svc = service(ServiceKind::App);
        let plain = routing_rule(&svc, "apps.example.com");
        assert_eq!(plain, format!("Host(`{}.apps.example.com`)", svc.slug()));

        svc.custom_domain = Some("shop.acme.io".to_string());
        let with_custom = routing_rule(&svc, "apps.example.com");
        assert_eq!(
            with_custom,
            format!(
                "Host(`{}.apps.example.com`) || Host(`shop.acme.io`)",
                svc.slug()
            )
        );
    }

    #[test]
    fn test_container_labels_carry_routing() {
        let svc = service(ServiceKind::App);
        let labels = container_labels(&svc, "apps.example.com");
        assert_eq!(labels.get(SERVICE_ID_LABEL).unwrap(), &svc.id.to_string());
        assert_eq!(labels.get("traefik.enable").unwrap(), "true");
        let rule_key = format!("traefik.http.routers.{}.rule", svc.slug());
        assert!(labels.get(&rule_key).unwrap().contains("apps.example.com"));
        let port_key = format!(
            "traefik.http.services.{}.loadbalancer.server.port",
            svc.slug()
        );
        assert_eq!(labels.get(&port_key).unwrap(), "3000");
        assert!(!labels.contains_key(COMPOSE_PROJECT_LABEL));
    }

    #[test]
    fn test_stack_labels_include_project() {
        let svc = service(ServiceKind::Redis);
        let labels = container_labels(&svc, "apps.example.com");
        assert_eq!(
            labels.get(COMPOSE_PROJECT_LABEL).unwrap(),
            &svc.project_name()
        );
    }

    #[test]
    fn test_replacement_spec_clones_runtime_state_and_regenerates_config() {
        let mut svc = service(ServiceKind::App);
        svc.custom_domain = Some("shop.acme.io".to_string());

        let old = ContainerDetails {
            info: ContainerInfo {
                id: "old1".to_string(),
                name: "web-x7k2p9".to_string(),
                image: "registry/web:v42".to_string(),
                state: ContainerState::Running,
                labels: BTreeMap::from([("stale".to_string(), "label".to_string())]),
            },
            env: BTreeMap::from([("NODE_ENV".to_string(), "production".to_string())]),
            memory_limit_bytes: Some(1),
            nano_cpus: Some(1),
            network: None,
            restart_policy: None,
            started_at: None,
            exit_code: None,
        };

        let spec = replacement_spec(&svc, &old, "apps.example.com");
        assert!(spec.name.starts_with("web-x7k2p9-"));
        assert_eq!(spec.image, "registry/web:v42");
        assert_eq!(spec.env.get("NODE_ENV").unwrap(), "production");
        // Labels come from the service record, not the old container.
        assert!(!spec.labels.contains_key("stale"));
        let rule_key = format!("traefik.http.routers.{}.rule", svc.slug());
        assert!(spec.labels.get(&rule_key).unwrap().contains("shop.acme.io"));
        // Limits come from the kind, not the old container.
        assert_eq!(
            spec.memory_limit_bytes,
            Some(limits_for(ServiceKind::App).memory_bytes)
        );
        assert_eq!(spec.network.as_deref(), Some(PROXY_NETWORK));
        assert_eq!(spec.restart_policy.as_deref(), Some(DEFAULT_RESTART_POLICY));
        assert_eq!(spec.volumes, svc.volumes);
    }
}
