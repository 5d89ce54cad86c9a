//! Detection Fusion
//!
//! Live GPU data from the per-node detection sidecar, and the rules for
//! merging it into a device record. Identity fields are filled in only when
//! the record has nothing yet; telemetry is refreshed on every merge.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::pci::{canonical_index, canonical_pci_address, normalize_hex_id};
use super::snapshot::NodeInfo;
use crate::crd::{GPUDeviceHardware, GPUDeviceHealth, MigStrategy, PcieLink};
use crate::domain::ports::DetectionSource;
use crate::error::Result;

/// Sidecar endpoint path
pub const DETECTION_PATH: &str = "/api/v1/gpus";

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionPci {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub class: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionMemory {
    #[serde(default, rename = "totalMiB")]
    pub total_mib: u64,
    #[serde(default, rename = "usedMiB")]
    pub used_mib: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionUtilization {
    #[serde(default)]
    pub gpu: Option<u32>,
    #[serde(default)]
    pub memory: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionPcie {
    #[serde(default)]
    pub generation: u32,
    #[serde(default)]
    pub width: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionMig {
    #[serde(default)]
    pub capable: bool,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub profiles_supported: Vec<String>,
}

/// One GPU as reported by the sidecar
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEntry {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub pci_info: DetectionPci,
    #[serde(default)]
    pub memory_info: DetectionMemory,
    #[serde(default)]
    pub utilization: DetectionUtilization,
    #[serde(default, rename = "powerUsageMW")]
    pub power_usage_mw: Option<u64>,
    #[serde(default, rename = "powerLimitMW")]
    pub power_limit_mw: Option<u64>,
    #[serde(default, rename = "temperatureC")]
    pub temperature_c: Option<i32>,
    #[serde(default)]
    pub compute_major: Option<u32>,
    #[serde(default)]
    pub compute_minor: Option<u32>,
    #[serde(default)]
    pub numa_node: Option<i32>,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub board: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub pstate: String,
    #[serde(default)]
    pub display_mode: String,
    #[serde(default)]
    pub sm_count: Option<u32>,
    #[serde(default, rename = "memoryBandwidthMiB")]
    pub memory_bandwidth_mib: Option<u64>,
    #[serde(default)]
    pub pcie: Option<DetectionPcie>,
    #[serde(default)]
    pub mig: Option<DetectionMig>,
}

/// All entries reported for one node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionSet {
    entries: Vec<DetectionEntry>,
}

impl DetectionSet {
    pub fn new(entries: Vec<DetectionEntry>) -> Self {
        Self { entries }
    }

    /// Entry for a device: by UUID when known, else by canonical index
    pub fn find(&self, uuid: &str, index: &str) -> Option<&DetectionEntry> {
        if !uuid.is_empty() {
            if let Some(entry) = self
                .entries
                .iter()
                .find(|e| e.uuid.eq_ignore_ascii_case(uuid))
            {
                return Some(entry);
            }
        }
        let index = canonical_index(index);
        self.entries
            .iter()
            .find(|e| e.index.map(|i| i.to_string()) == Some(index.clone()))
    }
}

// =============================================================================
// Fusion
// =============================================================================

/// Lowercase, strip the `mig-` prefix, dedupe and sort
pub fn normalize_mig_profiles<I, S>(profiles: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = profiles
        .into_iter()
        .map(|p| {
            let lower = p.as_ref().trim().to_ascii_lowercase();
            lower.strip_prefix("mig-").unwrap_or(&lower).to_string()
        })
        .filter(|p| !p.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Merge a detection entry into a device's hardware and health.
///
/// Identity fields are only set when empty; telemetry always refreshes.
/// Idempotent for a fixed entry.
pub fn apply_detection_hardware(
    hardware: &mut GPUDeviceHardware,
    health: &mut GPUDeviceHealth,
    entry: &DetectionEntry,
) {
    hardware.pci.address = canonical_pci_address(&hardware.pci.address);

    fill_text(&mut hardware.pci.address, &canonical_pci_address(&entry.pci_info.address));
    fill_hex(&mut hardware.pci.vendor, &entry.pci_info.vendor);
    fill_hex(&mut hardware.pci.device, &entry.pci_info.device);
    fill_hex(&mut hardware.pci.class, &entry.pci_info.class);
    fill_text(&mut hardware.product, &entry.product);
    fill_text(&mut hardware.uuid, &entry.uuid);
    fill_text(&mut hardware.serial, &entry.serial);
    fill_text(&mut hardware.board, &entry.board);
    fill_text(&mut hardware.family, &entry.family);

    if hardware.memory_mib == 0 {
        hardware.memory_mib = entry.memory_info.total_mib;
    }
    if !hardware.compute_capability.is_set() {
        if let (Some(major), minor) = (entry.compute_major, entry.compute_minor) {
            hardware.compute_capability.major = major;
            hardware.compute_capability.minor = minor.unwrap_or(0);
        }
    }
    hardware.numa_node = hardware.numa_node.or(entry.numa_node);
    hardware.sm_count = hardware.sm_count.or(entry.sm_count);
    hardware.memory_bandwidth_mib = hardware.memory_bandwidth_mib.or(entry.memory_bandwidth_mib);
    if hardware.pcie.is_none() {
        hardware.pcie = entry.pcie.as_ref().map(|p| PcieLink {
            generation: p.generation,
            width: p.width,
        });
    }

    // Mutable fields
    if entry.power_limit_mw.is_some() {
        hardware.power_limit_mw = entry.power_limit_mw;
    }
    if !entry.pstate.is_empty() {
        hardware.pstate = entry.pstate.clone();
    }
    if !entry.display_mode.is_empty() {
        hardware.display_mode = entry.display_mode.clone();
    }
    health.temperature_c = entry.temperature_c;
    health.gpu_utilization = entry.utilization.gpu;
    health.memory_utilization = entry.utilization.memory;
    health.power_usage_mw = entry.power_usage_mw;
    health.memory_used_mib = entry.memory_info.used_mib;

    if let Some(mig) = &entry.mig {
        let profiles = normalize_mig_profiles(
            hardware
                .mig
                .profiles_supported
                .iter()
                .map(String::as_str)
                .chain(mig.profiles_supported.iter().map(String::as_str)),
        );
        hardware.mig.capable = hardware.mig.capable || mig.capable || !profiles.is_empty();
        hardware.mig.profiles_supported = profiles;
        match MigStrategy::parse(&mig.mode) {
            Some(strategy) => hardware.mig.strategy = strategy,
            None if !mig.mode.is_empty() => {
                debug!(mode = %mig.mode, "Ignoring unrecognized MIG mode");
            }
            None => {}
        }
    }

    hardware.pci.address = canonical_pci_address(&hardware.pci.address);
}

fn fill_text(target: &mut String, value: &str) {
    if target.is_empty() && !value.trim().is_empty() {
        *target = value.trim().to_string();
    }
}

fn fill_hex(target: &mut String, value: &str) {
    if target.is_empty() {
        if let Some(id) = normalize_hex_id(value) {
            *target = id;
        }
    }
}

// =============================================================================
// HTTP Client
// =============================================================================

/// Configuration for the sidecar client
#[derive(Debug, Clone)]
pub struct DetectionClientConfig {
    /// Port the sidecar listens on (host network)
    pub port: u16,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for DetectionClientConfig {
    fn default() -> Self {
        Self {
            port: 9401,
            timeout: Duration::from_secs(3),
        }
    }
}

/// Fetches detection data from `http://<node-address>:<port>/api/v1/gpus`
pub struct HttpDetectionClient {
    client: reqwest::Client,
    config: DetectionClientConfig,
}

impl HttpDetectionClient {
    pub fn new(config: DetectionClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn fetch_entries(&self, address: &str) -> Result<Vec<DetectionEntry>> {
        let url = format!("http://{}:{}{}", address, self.config.port, DETECTION_PATH);
        let entries = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<DetectionEntry>>()
            .await?;
        Ok(entries)
    }
}

#[async_trait]
impl DetectionSource for HttpDetectionClient {
    async fn fetch(&self, node: &NodeInfo) -> Option<DetectionSet> {
        let Some(address) = node.address.as_deref() else {
            debug!(node = %node.name, "Node has no internal address, skipping detection");
            return None;
        };

        match self.fetch_entries(address).await {
            Ok(entries) => {
                debug!(node = %node.name, gpus = entries.len(), "Fetched detection data");
                Some(DetectionSet::new(entries))
            }
            Err(e) => {
                warn!(node = %node.name, error = %e, "Detection sidecar unavailable");
                None
            }
        }
    }
}
