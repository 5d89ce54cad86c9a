//! Test fixtures shared across modules

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

use crate::crd::{GPUDevice, GPUDeviceSpec, GPUDeviceState, GPUDeviceStatus, DEVICE_INDEX_LABEL, NODE_LABEL};
use crate::domain::ports::{HeartbeatSource, ValidationReport, WorkloadProbe, WorkloadProber};
use crate::error::{Error, Result};
use crate::hardware::catalog;
use crate::hardware::snapshot::{
    device_name, inventory_id, DeviceSnapshot, DriverInfo, NodeInfo, NodeSnapshot, DEVICE_LABEL_PREFIX,
};

pub fn node_info(name: &str, labels: BTreeMap<String, String>) -> NodeInfo {
    NodeInfo {
        name: name.to_string(),
        uid: format!("uid-{name}"),
        labels,
        address: Some("10.0.0.10".to_string()),
    }
}

/// Label group for one device: `gpu.billyronks.io/device.<index>.<field>`
pub fn device_labels(index: u32, fields: &[(&str, &str)]) -> BTreeMap<String, String> {
    fields
        .iter()
        .map(|(field, value)| (format!("{DEVICE_LABEL_PREFIX}{index}.{field}"), value.to_string()))
        .collect()
}

/// NVIDIA device snapshot with catalog identity and no UUID
pub fn device_snapshot(index: &str, device: &str) -> DeviceSnapshot {
    let entry = catalog::lookup(device);
    DeviceSnapshot {
        index: index.to_string(),
        vendor: "10de".to_string(),
        device: device.to_string(),
        class: "0302".to_string(),
        pci_address: format!("{:02x}:00.0", 0x3b + index.parse::<u32>().unwrap_or(0)),
        product: entry.map(|e| e.product.to_string()).unwrap_or_default(),
        memory_mib: entry.map(|e| e.memory_mib).unwrap_or(0),
        compute_major: entry.map(|e| e.compute_major).unwrap_or(0),
        compute_minor: entry.map(|e| e.compute_minor).unwrap_or(0),
        ..Default::default()
    }
}

/// Managed node with feature data, driver and toolkit
pub fn node_snapshot(name: &str, devices: Vec<DeviceSnapshot>) -> NodeSnapshot {
    NodeSnapshot {
        name: name.to_string(),
        managed: true,
        feature_detected: true,
        devices,
        driver: DriverInfo {
            version: "550.54.15".to_string(),
            cuda_version: "12.4".to_string(),
            toolkit_ready: true,
        },
    }
}

/// Device record as the device reconciler would leave it
pub fn device_record(node: &str, snapshot: &DeviceSnapshot, state: GPUDeviceState) -> GPUDevice {
    let mut device = GPUDevice::new(&device_name(node, snapshot), GPUDeviceSpec::default());
    device.labels_mut().insert(NODE_LABEL.to_string(), node.to_string());
    device
        .labels_mut()
        .insert(DEVICE_INDEX_LABEL.to_string(), snapshot.index.clone());
    device.status = Some(GPUDeviceStatus {
        node_name: node.to_string(),
        inventory_id: inventory_id(node, snapshot),
        managed: true,
        state,
        hardware: snapshot.hardware(),
        ..Default::default()
    });
    device
}

// =============================================================================
// Fake Prober
// =============================================================================

/// Scripted workload prober; unknown workloads report unhealthy
#[derive(Default)]
pub struct FakeProber {
    healthy: Mutex<BTreeMap<String, bool>>,
    failures: Mutex<BTreeMap<String, String>>,
    timeouts: Mutex<BTreeSet<String>>,
    report: Mutex<Option<ValidationReport>>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every named workload healthy
    pub fn healthy<'a>(workloads: impl IntoIterator<Item = &'a str>) -> Self {
        let prober = Self::new();
        for workload in workloads {
            prober.set_healthy(workload, true);
        }
        prober
    }

    pub fn set_healthy(&self, workload: &str, healthy: bool) {
        self.healthy.lock().insert(workload.to_string(), healthy);
    }

    /// Make probes of `workload` fail with an error
    pub fn fail(&self, workload: &str, reason: &str) {
        self.failures.lock().insert(workload.to_string(), reason.to_string());
    }

    /// Make probes of `workload` time out
    pub fn time_out(&self, workload: &str) {
        self.timeouts.lock().insert(workload.to_string());
    }

    pub fn set_report(&self, report: Option<ValidationReport>) {
        *self.report.lock() = report;
    }
}

#[async_trait]
impl WorkloadProber for FakeProber {
    async fn probe(&self, _node: &str, workload: &str) -> Result<WorkloadProbe> {
        if self.timeouts.lock().contains(workload) {
            return Err(Error::ProbeTimeout {
                workload: workload.to_string(),
            });
        }
        if let Some(reason) = self.failures.lock().get(workload) {
            return Err(Error::Probe {
                workload: workload.to_string(),
                reason: reason.clone(),
            });
        }
        let healthy = self.healthy.lock().get(workload).copied().unwrap_or(false);
        Ok(WorkloadProbe {
            name: workload.to_string(),
            healthy,
            message: if healthy { String::new() } else { "no ready pod".to_string() },
            pod_ip: healthy.then(|| "10.1.0.5".to_string()),
        })
    }

    async fn validation_report(&self, _node: &str) -> Result<Option<ValidationReport>> {
        Ok(*self.report.lock())
    }
}

// =============================================================================
// Fake Heartbeat
// =============================================================================

#[derive(Default)]
pub struct FakeHeartbeat {
    at: Mutex<Option<DateTime<Utc>>>,
}

impl FakeHeartbeat {
    pub fn at(at: Option<DateTime<Utc>>) -> Self {
        Self { at: Mutex::new(at) }
    }

    pub fn set(&self, at: Option<DateTime<Utc>>) {
        *self.at.lock() = at;
    }
}

#[async_trait]
impl HeartbeatSource for FakeHeartbeat {
    async fn heartbeat(&self, _exporter: &WorkloadProbe) -> Option<DateTime<Utc>> {
        *self.at.lock()
    }
}
