//! Workload Probes
//!
//! `KubeWorkloadProber` judges support workloads by their pods on the node.
//! `ExporterHeartbeatScraper` reads the monitoring exporter's own
//! last-update gauge.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::ports::{HeartbeatSource, ValidationReport, WorkloadProbe, WorkloadProber};
use crate::error::{Error, Result};

/// Init container of the validator that checks the driver
pub const DRIVER_VALIDATION_CONTAINER: &str = "driver-validation";
/// Init container of the validator that checks the container toolkit
pub const TOOLKIT_VALIDATION_CONTAINER: &str = "toolkit-validation";

// =============================================================================
// Pod Evaluation
// =============================================================================

/// Health of a workload from its pods on one node
pub fn pod_health(workload: &str, pods: &[Pod]) -> WorkloadProbe {
    let mut probe = WorkloadProbe {
        name: workload.to_string(),
        ..Default::default()
    };

    if pods.is_empty() {
        probe.message = "no pod scheduled on node".to_string();
        return probe;
    }

    if let Some(pod) = pods.iter().find(|p| pod_ready(p)) {
        probe.healthy = true;
        probe.pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());
        return probe;
    }

    let pod = &pods[0];
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let waiting: Vec<String> = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .filter(|c| !c.ready)
                .map(|c| c.name.clone())
                .collect()
        })
        .unwrap_or_default();

    probe.message = if phase != "Running" {
        format!("pod {} is {}", pod.name_any(), phase)
    } else {
        format!("pod {} containers not ready: {}", pod.name_any(), waiting.join(", "))
    };
    probe
}

/// Running with every container ready
fn pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    match status.container_statuses.as_ref() {
        Some(containers) if !containers.is_empty() => containers.iter().all(|c| c.ready),
        _ => false,
    }
}

/// Validation result from the validator's init containers; `None` when
/// the pod does not carry them
pub fn validation_report_from_pod(pod: &Pod) -> Option<ValidationReport> {
    let statuses = pod.status.as_ref()?.init_container_statuses.as_ref()?;
    let passed = |name: &str| -> Option<bool> {
        statuses.iter().find(|c| c.name == name).map(|c| {
            c.state
                .as_ref()
                .and_then(|s| s.terminated.as_ref())
                .map(|t| t.exit_code == 0)
                .unwrap_or(false)
        })
    };

    match (
        passed(DRIVER_VALIDATION_CONTAINER),
        passed(TOOLKIT_VALIDATION_CONTAINER),
    ) {
        (None, None) => None,
        (driver, toolkit) => Some(ValidationReport {
            driver_ready: driver.unwrap_or(false),
            toolkit_ready: toolkit.unwrap_or(false),
        }),
    }
}

// =============================================================================
// Kube Workload Prober
// =============================================================================

/// Probes workloads through the pods API
pub struct KubeWorkloadProber {
    pods: Api<Pod>,
    validator: String,
    timeout: Duration,
}

impl KubeWorkloadProber {
    pub fn new(client: Client, namespace: &str, validator: &str, timeout: Duration) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            validator: validator.to_string(),
            timeout,
        }
    }

    async fn pods_on_node(&self, node: &str, workload: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default()
            .labels(&format!("app={}", workload))
            .fields(&format!("spec.nodeName={}", node));

        let list = tokio::time::timeout(self.timeout, self.pods.list(&params))
            .await
            .map_err(|_| Error::ProbeTimeout {
                workload: workload.to_string(),
            })?
            .map_err(|e| Error::Probe {
                workload: workload.to_string(),
                reason: e.to_string(),
            })?;
        Ok(list.items)
    }
}

#[async_trait]
impl WorkloadProber for KubeWorkloadProber {
    async fn probe(&self, node: &str, workload: &str) -> Result<WorkloadProbe> {
        let pods = self.pods_on_node(node, workload).await?;
        let probe = pod_health(workload, &pods);
        debug!(node, workload, healthy = probe.healthy, "Probed workload");
        Ok(probe)
    }

    async fn validation_report(&self, node: &str) -> Result<Option<ValidationReport>> {
        let pods = self.pods_on_node(node, &self.validator).await?;
        Ok(pods.iter().find_map(validation_report_from_pod))
    }
}

// =============================================================================
// Exporter Heartbeat
// =============================================================================

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Exporter metrics port on the pod
    pub port: u16,
    /// Gauge carrying the last update as unix seconds
    pub metric: String,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            port: 9400,
            metric: "dcgm_exporter_last_update_time_seconds".to_string(),
            timeout: Duration::from_secs(3),
        }
    }
}

/// Newest sample of `metric` in a Prometheus text exposition
pub fn parse_gauge(text: &str, metric: &str) -> Option<f64> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let rest = line.strip_prefix(metric)?;
            let rest = if let Some(labelled) = rest.strip_prefix('{') {
                &labelled[labelled.find('}')? + 1..]
            } else if rest.starts_with(char::is_whitespace) {
                rest
            } else {
                return None;
            };
            rest.split_whitespace().next()?.parse::<f64>().ok()
        })
        .filter(|v| v.is_finite())
        .reduce(f64::max)
}

fn to_timestamp(seconds: f64) -> Option<DateTime<Utc>> {
    let whole = seconds.trunc() as i64;
    let nanos = (seconds.fract() * 1e9) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}

/// Scrapes `http://<pod-ip>:<port>/metrics` of the exporter pod
pub struct ExporterHeartbeatScraper {
    client: reqwest::Client,
    config: HeartbeatConfig,
}

impl ExporterHeartbeatScraper {
    pub fn new(config: HeartbeatConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn scrape(&self, ip: &str) -> Result<String> {
        let url = format!("http://{}:{}/metrics", ip, self.config.port);
        Ok(self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?)
    }
}

#[async_trait]
impl HeartbeatSource for ExporterHeartbeatScraper {
    async fn heartbeat(&self, exporter: &WorkloadProbe) -> Option<DateTime<Utc>> {
        let ip = exporter.pod_ip.as_deref()?;
        match self.scrape(ip).await {
            Ok(body) => {
                let at = parse_gauge(&body, &self.config.metric).and_then(to_timestamp);
                if at.is_none() {
                    debug!(pod_ip = ip, metric = %self.config.metric, "Heartbeat metric not exposed");
                }
                at
            }
            Err(e) => {
                warn!(pod_ip = ip, error = %e, "Exporter heartbeat scrape failed");
                None
            }
        }
    }
}
