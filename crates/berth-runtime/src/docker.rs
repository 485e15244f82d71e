// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker container runtime gateway.
//!
//! Shells the `docker` CLI with `--format '{{json .}}'` output. The engine
//! socket is an operational dependency; the CLI is the stable integration
//! surface, so the same gateway works against docker and podman-docker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::{debug, warn};

use berth_core::model::{ContainerInfo, ContainerState};

use crate::traits::{
    ContainerDetails, ContainerMetricsSample, ContainerRuntime, CreateContainerSpec, Result,
    RuntimeError,
};

/// Container runtime gateway backed by the `docker` CLI.
pub struct DockerRuntime {
    binary: String,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerRuntime {
    /// Create a gateway shelling the `docker` binary from PATH.
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Create from environment variables.
    ///
    /// `DOCKER_BIN` overrides the binary name (e.g. `podman`).
    pub fn from_env() -> Self {
        Self {
            binary: std::env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()),
        }
    }

    /// Run one engine command, returning trimmed stdout.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let command = args.first().copied().unwrap_or_default();
        debug!(binary = %self.binary, command = %command, "Running engine command");

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::Unavailable(format!("`{}` binary not found", self.binary))
                } else {
                    RuntimeError::Io(e)
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(classify_failure(command, exit_code, stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// `docker ps --all` with one `--filter`, one parsed line per container.
    async fn ps_filtered(&self, filter: &str) -> Result<Vec<ContainerInfo>> {
        let stdout = self
            .run(&[
                "ps",
                "--all",
                "--no-trunc",
                "--filter",
                filter,
                "--format",
                "{{json .}}",
            ])
            .await?;

        let mut containers = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: PsLine = serde_json::from_str(line)
                .map_err(|e| RuntimeError::Parse(format!("ps line: {e}")))?;
            containers.push(ContainerInfo::from(parsed));
        }
        Ok(containers)
    }
}

/// Map a non-zero engine exit to the error taxonomy.
///
/// The CLI multiplexes every failure through exit code 1, so the stderr
/// text is the only discriminator available.
fn classify_failure(command: &str, exit_code: i32, stderr: String) -> RuntimeError {
    let lower = stderr.to_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        RuntimeError::Unavailable(stderr)
    } else if lower.contains("no such container") || lower.contains("no such object") {
        RuntimeError::ContainerNotFound(stderr)
    } else {
        RuntimeError::CommandFailed {
            command: command.to_string(),
            exit_code,
            stderr,
        }
    }
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

impl From<PsLine> for ContainerInfo {
    fn from(line: PsLine) -> Self {
        ContainerInfo {
            id: line.id,
            // Multiple names are comma-joined; the first is canonical.
            name: line
                .names
                .split(',')
                .next()
                .unwrap_or_default()
                .to_string(),
            image: line.image,
            state: ContainerState::from(line.state),
            labels: parse_label_list(&line.labels),
        }
    }
}

/// `docker inspect --format '{{json .}}'` document, reduced to the fields
/// the gateway consumes.
#[derive(Debug, Deserialize)]
struct InspectDoc {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "Config")]
    config: InspectConfig,
    #[serde(rename = "HostConfig")]
    host_config: InspectHostConfig,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "StartedAt")]
    started_at: Option<String>,
    #[serde(rename = "ExitCode")]
    exit_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Env", default)]
    env: Option<Vec<String>>,
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct InspectHostConfig {
    #[serde(rename = "Memory", default)]
    memory: i64,
    #[serde(rename = "NanoCpus", default)]
    nano_cpus: i64,
    #[serde(rename = "NetworkMode")]
    network_mode: Option<String>,
    #[serde(rename = "RestartPolicy")]
    restart_policy: Option<InspectRestartPolicy>,
}

#[derive(Debug, Deserialize)]
struct InspectRestartPolicy {
    #[serde(rename = "Name")]
    name: Option<String>,
}

impl From<InspectDoc> for ContainerDetails {
    fn from(doc: InspectDoc) -> Self {
        let restart_policy = doc
            .host_config
            .restart_policy
            .and_then(|p| p.name)
            .filter(|name| !name.is_empty() && name != "no");
        ContainerDetails {
            info: ContainerInfo {
                id: doc.id,
                name: doc.name.strip_prefix('/').unwrap_or(&doc.name).to_string(),
                image: doc.config.image,
                state: ContainerState::from(doc.state.status),
                labels: doc.config.labels.unwrap_or_default(),
            },
            env: parse_env_list(doc.config.env.as_deref().unwrap_or_default()),
            memory_limit_bytes: u64::try_from(doc.host_config.memory)
                .ok()
                .filter(|m| *m > 0),
            nano_cpus: u64::try_from(doc.host_config.nano_cpus)
                .ok()
                .filter(|n| *n > 0),
            network: doc.host_config.network_mode,
            restart_policy,
            started_at: doc.state.started_at.as_deref().and_then(parse_started_at),
            exit_code: doc.state.exit_code,
        }
    }
}

/// One line of `docker stats --no-stream --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Container", default)]
    container: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
}

impl StatsLine {
    fn container_id(&self) -> &str {
        if self.id.is_empty() {
            &self.container
        } else {
            &self.id
        }
    }

    fn into_sample(self) -> ContainerMetricsSample {
        let (memory_used_bytes, memory_limit_bytes) =
            parse_usage_pair(&self.mem_usage).unwrap_or((0, 0));
        let (network_rx_bytes, network_tx_bytes) =
            parse_usage_pair(&self.net_io).unwrap_or((0, 0));
        ContainerMetricsSample {
            container_id: self.container_id().to_string(),
            name: self.name,
            cpu_percent: parse_percent(&self.cpu_perc),
            memory_used_bytes,
            memory_limit_bytes,
            network_rx_bytes,
            network_tx_bytes,
        }
    }
}

/// Parse the comma-joined `k=v` label list from `docker ps`.
///
/// The ps format cannot escape commas inside label values; `inspect` is
/// authoritative where that matters. Discovery labels never contain commas.
fn parse_label_list(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or_default().to_string();
            Some((key, value))
        })
        .collect()
}

/// Parse the `K=V` environment list from `inspect`.
fn parse_env_list(raw: &[String]) -> BTreeMap<String, String> {
    raw.iter()
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or_default().to_string();
            Some((key, value))
        })
        .collect()
}

/// Parse a human-formatted byte size (`7.3MiB`, `648B`, `1.2kB`).
///
/// The stats output mixes SI units (network) and binary units (memory).
fn parse_byte_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let unit_start = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let value: f64 = raw[..unit_start].parse().ok()?;
    let multiplier: f64 = match raw[unit_start..].trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1048576.0,
        "GiB" => 1073741824.0,
        "TiB" => 1099511627776.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

/// Parse a `used / limit` pair as reported by `docker stats`.
fn parse_usage_pair(raw: &str) -> Option<(u64, u64)> {
    let (used, limit) = raw.split_once('/')?;
    Some((parse_byte_size(used)?, parse_byte_size(limit)?))
}

/// Parse a percentage string like `0.15%`.
fn parse_percent(raw: &str) -> f64 {
    raw.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Parse an inspect timestamp, treating the zero value (never started)
/// as absent.
fn parse_started_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .filter(|dt| dt.timestamp() > 0)
}

/// Format a nano-cpu share for `--cpus` (e.g. 500000000 becomes `0.5`).
fn format_cpus(nano_cpus: u64) -> String {
    format!("{}", nano_cpus as f64 / 1e9)
}

/// Assemble `docker create` arguments from a spec.
fn create_args(spec: &CreateContainerSpec) -> Vec<String> {
    let mut args: Vec<String> = vec!["create".into(), "--name".into(), spec.name.clone()];
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &spec.env {
        args.push("--env".into());
        args.push(format!("{key}={value}"));
    }
    for volume in &spec.volumes {
        args.push("--volume".into());
        args.push(volume.clone());
    }
    if let Some(memory) = spec.memory_limit_bytes {
        args.push("--memory".into());
        args.push(memory.to_string());
    }
    if let Some(nano) = spec.nano_cpus {
        args.push("--cpus".into());
        args.push(format_cpus(nano));
    }
    if let Some(network) = &spec.network {
        args.push("--network".into());
        args.push(network.clone());
    }
    if let Some(policy) = &spec.restart_policy {
        args.push("--restart".into());
        args.push(policy.clone());
    }
    args.push(spec.image.clone());
    args
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn runtime_type(&self) -> &'static str {
        "docker"
    }

    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<ContainerInfo>> {
        self.ps_filtered(&format!("label={key}={value}")).await
    }

    async fn list_labeled(&self, key: &str) -> Result<Vec<ContainerInfo>> {
        self.ps_filtered(&format!("label={key}")).await
    }

    async fn inspect(&self, container: &str) -> Result<ContainerDetails> {
        let stdout = self
            .run(&["inspect", "--format", "{{json .}}", container])
            .await?;
        let doc: InspectDoc = serde_json::from_str(&stdout)
            .map_err(|e| RuntimeError::Parse(format!("inspect output: {e}")))?;
        Ok(ContainerDetails::from(doc))
    }

    async fn create(&self, spec: &CreateContainerSpec) -> Result<String> {
        let args = create_args(spec);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.run(&refs).await?;
        // `docker create` prints the new container id as its only output.
        let id = stdout
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .to_string();
        if id.is_empty() {
            return Err(RuntimeError::Parse(
                "create produced no container id".to_string(),
            ));
        }
        debug!(name = %spec.name, id = %id, "Created container");
        Ok(id)
    }

    async fn start(&self, container: &str) -> Result<()> {
        self.run(&["start", container]).await.map(|_| ())
    }

    async fn stop(&self, container: &str) -> Result<()> {
        self.run(&["stop", container]).await.map(|_| ())
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.run(&["rm", container]).await.map(|_| ())
    }

    async fn sample_metrics(&self, containers: &[String]) -> Result<Vec<ContainerMetricsSample>> {
        if containers.is_empty() {
            return Ok(Vec::new());
        }

        // Sample everything in one invocation and filter client-side:
        // naming the ids would fail the whole command if any one container
        // exited between listing and sampling.
        let stdout = self
            .run(&["stats", "--no-stream", "--no-trunc", "--format", "{{json .}}"])
            .await?;

        let mut samples = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: StatsLine = match serde_json::from_str(line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "Skipping unparseable stats line");
                    continue;
                }
            };
            let id = parsed.container_id();
            let requested = containers
                .iter()
                .any(|c| c == id || id.starts_with(c.as_str()) || c.starts_with(id));
            if requested {
                samples.push(parsed.into_sample());
            }
        }
        Ok(samples)
    }

    async fn ping(&self) -> Result<()> {
        self.run(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label_list() {
        let labels = parse_label_list("berth.service.id=abc,com.docker.compose.project=web-12ab34cd");
        assert_eq!(labels.get("berth.service.id").unwrap(), "abc");
        assert_eq!(
            labels.get("com.docker.compose.project").unwrap(),
            "web-12ab34cd"
        );
        assert!(parse_label_list("").is_empty());
        // Values may contain '='.
        let labels = parse_label_list("rule=Host(`a`) && Path(`/x=y`)");
        assert_eq!(labels.get("rule").unwrap(), "Host(`a`) && Path(`/x=y`)");
    }

    #[test]
    fn test_parse_byte_size_units() {
        assert_eq!(parse_byte_size("648B"), Some(648));
        assert_eq!(parse_byte_size("0B"), Some(0));
        assert_eq!(parse_byte_size("1.2kB"), Some(1200));
        assert_eq!(parse_byte_size("2MB"), Some(2_000_000));
        assert_eq!(parse_byte_size("1KiB"), Some(1024));
        assert_eq!(parse_byte_size("7.5MiB"), Some(7_864_320));
        assert_eq!(parse_byte_size("1GiB"), Some(1_073_741_824));
        assert_eq!(parse_byte_size("garbage"), None);
    }

    #[test]
    fn test_parse_usage_pair() {
        assert_eq!(
            parse_usage_pair("7.5MiB / 1GiB"),
            Some((7_864_320, 1_073_741_824))
        );
        assert_eq!(parse_usage_pair("1.2kB / 648B"), Some((1200, 648)));
        assert_eq!(parse_usage_pair("no-slash"), None);
    }

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("0.15%"), 0.15);
        assert_eq!(parse_percent("102.33%"), 102.33);
        assert_eq!(parse_percent(""), 0.0);
    }

    #[test]
    fn test_ps_line_maps_to_container_info() {
        let line = r#"{"ID":"f5a3b2c1d0e9","Names":"web-x7k2p9","Image":"registry/web:latest","State":"running","Labels":"berth.service.id=11111111-2222-3333-4444-555555555555","Status":"Up 2 hours"}"#;
        let parsed: PsLine = serde_json::from_str(line).unwrap();
        let info = ContainerInfo::from(parsed);
        assert_eq!(info.id, "f5a3b2c1d0e9");
        assert_eq!(info.name, "web-x7k2p9");
        assert_eq!(info.state, ContainerState::Running);
        assert_eq!(
            info.labels.get("berth.service.id").unwrap(),
            "11111111-2222-3333-4444-555555555555"
        );
    }

    #[test]
    fn test_inspect_doc_maps_details() {
        let doc = r#"{
            "Id": "f5a3b2c1d0e9",
            "Name": "/web-x7k2p9",
            "State": {"Status": "exited", "StartedAt": "2025-06-01T10:00:00.000000000Z", "ExitCode": 137},
            "Config": {
                "Image": "registry/web:latest",
                "Env": ["NODE_ENV=production", "EMPTY="],
                "Labels": {"berth.service.id": "abc"}
            },
            "HostConfig": {
                "Memory": 536870912,
                "NanoCpus": 500000000,
                "NetworkMode": "berth",
                "RestartPolicy": {"Name": "unless-stopped"}
            }
        }"#;
        let parsed: InspectDoc = serde_json::from_str(doc).unwrap();
        let details = ContainerDetails::from(parsed);
        assert_eq!(details.info.name, "web-x7k2p9");
        assert_eq!(details.info.state, ContainerState::Exited);
        assert_eq!(details.env.get("NODE_ENV").unwrap(), "production");
        assert_eq!(details.env.get("EMPTY").unwrap(), "");
        assert_eq!(details.memory_limit_bytes, Some(536_870_912));
        assert_eq!(details.nano_cpus, Some(500_000_000));
        assert_eq!(details.network.as_deref(), Some("berth"));
        assert_eq!(details.restart_policy.as_deref(), Some("unless-stopped"));
        assert!(details.started_at.is_some());
        assert_eq!(details.exit_code, Some(137));
    }

    #[test]
    fn test_inspect_doc_zero_values_mean_absent() {
        let doc = r#"{
            "Id": "aa",
            "Name": "/fresh",
            "State": {"Status": "created", "StartedAt": "0001-01-01T00:00:00Z", "ExitCode": 0},
            "Config": {"Image": "redis:7", "Env": null, "Labels": null},
            "HostConfig": {"Memory": 0, "NanoCpus": 0, "NetworkMode": "default", "RestartPolicy": {"Name": "no"}}
        }"#;
        let parsed: InspectDoc = serde_json::from_str(doc).unwrap();
        let details = ContainerDetails::from(parsed);
        assert_eq!(details.memory_limit_bytes, None);
        assert_eq!(details.nano_cpus, None);
        assert_eq!(details.restart_policy, None);
        assert_eq!(details.started_at, None);
        assert!(details.env.is_empty());
        assert!(details.info.labels.is_empty());
    }

    #[test]
    fn test_stats_line_maps_sample() {
        let line = r#"{"ID":"f5a3b2c1d0e9","Name":"web-x7k2p9","CPUPerc":"1.52%","MemUsage":"7.5MiB / 1GiB","NetIO":"1.2kB / 648B","BlockIO":"0B / 0B","PIDs":"5"}"#;
        let parsed: StatsLine = serde_json::from_str(line).unwrap();
        let sample = parsed.into_sample();
        assert_eq!(sample.container_id, "f5a3b2c1d0e9");
        assert_eq!(sample.cpu_percent, 1.52);
        assert_eq!(sample.memory_used_bytes, 7_864_320);
        assert_eq!(sample.memory_limit_bytes, 1_073_741_824);
        assert_eq!(sample.network_rx_bytes, 1200);
        assert_eq!(sample.network_tx_bytes, 648);
    }

    #[test]
    fn test_create_args_assembly() {
        let spec = CreateContainerSpec {
            name: "web-x7k2p9-a1b2c3".to_string(),
            image: "registry/web:latest".to_string(),
            env: BTreeMap::from([("NODE_ENV".to_string(), "production".to_string())]),
            labels: BTreeMap::from([("berth.service.id".to_string(), "abc".to_string())]),
            memory_limit_bytes: Some(536_870_912),
            nano_cpus: Some(1_000_000_000),
            network: Some("berth".to_string()),
            restart_policy: Some("unless-stopped".to_string()),
            volumes: vec!["data:/var/lib/app".to_string()],
        };
        let args = create_args(&spec);
        assert_eq!(args[0], "create");
        assert_eq!(args[args.len() - 1], "registry/web:latest");
        let joined = args.join(" ");
        assert!(joined.contains("--name web-x7k2p9-a1b2c3"));
        assert!(joined.contains("--label berth.service.id=abc"));
        assert!(joined.contains("--env NODE_ENV=production"));
        assert!(joined.contains("--volume data:/var/lib/app"));
        assert!(joined.contains("--memory 536870912"));
        assert!(joined.contains("--cpus 1"));
        assert!(joined.contains("--network berth"));
        assert!(joined.contains("--restart unless-stopped"));
    }

    #[test]
    fn test_format_cpus() {
        assert_eq!(format_cpus(1_000_000_000), "1");
        assert_eq!(format_cpus(500_000_000), "0.5");
        assert_eq!(format_cpus(250_000_000), "0.25");
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure(
            "ps",
            1,
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?".to_string(),
        );
        assert!(matches!(err, RuntimeError::Unavailable(_)));

        let err = classify_failure("inspect", 1, "Error: No such object: ghost".to_string());
        assert!(matches!(err, RuntimeError::ContainerNotFound(_)));

        let err = classify_failure("stop", 1, "permission denied".to_string());
        assert!(matches!(err, RuntimeError::CommandFailed { .. }));
    }

    /// Requires a reachable docker daemon; set DOCKER_TESTS=1 to run.
    #[tokio::test]
    async fn test_live_daemon_ping_and_empty_list() {
        if std::env::var("DOCKER_TESTS").is_err() {
            eprintln!("Skipping docker integration test: DOCKER_TESTS not set");
            return;
        }
        let runtime = DockerRuntime::from_env();
        runtime.ping().await.unwrap();
        let containers = runtime
            .list_by_label("berth.service.id", "00000000-0000-0000-0000-000000000000")
            .await
            .unwrap();
        assert!(containers.is_empty());
    }
}
