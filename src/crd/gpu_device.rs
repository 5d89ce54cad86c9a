//! GPUDevice CRD
//!
//! One record per physical GPU (PCI function). `.spec` carries no fields:
//! identity, hardware, health and lifecycle state all live in status
//! and are recomputed from node data on every pass.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::condition::Condition;

/// Label carrying the owning node name (list-by-node index)
pub const NODE_LABEL: &str = "gpu.billyronks.io/node";

/// Label carrying the canonical device index on the node
pub const DEVICE_INDEX_LABEL: &str = "gpu.billyronks.io/device-index";

// =============================================================================
// GPUDevice CRD
// =============================================================================

/// GPUDevice tracks a single accelerator: where it lives, what it is,
/// how it is doing, and whether workloads may be handed to it.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gpu.billyronks.io",
    version = "v1",
    kind = "GPUDevice",
    plural = "gpudevices",
    shortname = "gpud",
    status = "GPUDeviceStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".status.nodeName"}"#,
    printcolumn = r#"{"name": "Product", "type": "string", "jsonPath": ".status.hardware.product"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "AutoAttach", "type": "boolean", "jsonPath": ".status.autoAttach"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct GPUDeviceSpec {}

// =============================================================================
// Lifecycle State
// =============================================================================

/// Device lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum GPUDeviceState {
    #[default]
    Discovered,
    Validating,
    Ready,
    PendingAssignment,
    Assigned,
    Reserved,
    InUse,
    Faulted,
}

impl GPUDeviceState {
    /// Every state, in lifecycle order
    pub const ALL: [GPUDeviceState; 8] = [
        GPUDeviceState::Discovered,
        GPUDeviceState::Validating,
        GPUDeviceState::Ready,
        GPUDeviceState::PendingAssignment,
        GPUDeviceState::Assigned,
        GPUDeviceState::Reserved,
        GPUDeviceState::InUse,
        GPUDeviceState::Faulted,
    ];

    /// States written by the pool controller; this engine only reads them
    pub fn is_externally_owned(&self) -> bool {
        matches!(
            self,
            GPUDeviceState::Assigned | GPUDeviceState::Reserved | GPUDeviceState::InUse
        )
    }

    /// Device still waits for the validator to clear it
    pub fn needs_validation(&self) -> bool {
        matches!(self, GPUDeviceState::Discovered | GPUDeviceState::Validating)
    }
}

impl std::fmt::Display for GPUDeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GPUDeviceState::Discovered => write!(f, "Discovered"),
            GPUDeviceState::Validating => write!(f, "Validating"),
            GPUDeviceState::Ready => write!(f, "Ready"),
            GPUDeviceState::PendingAssignment => write!(f, "PendingAssignment"),
            GPUDeviceState::Assigned => write!(f, "Assigned"),
            GPUDeviceState::Reserved => write!(f, "Reserved"),
            GPUDeviceState::InUse => write!(f, "InUse"),
            GPUDeviceState::Faulted => write!(f, "Faulted"),
        }
    }
}

// =============================================================================
// Hardware
// =============================================================================

/// PCI identity of the function
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PciIdentity {
    /// Vendor id, lowercase hex without 0x
    #[serde(default)]
    pub vendor: String,
    /// Device id, lowercase hex without 0x
    #[serde(default)]
    pub device: String,
    /// Class code, lowercase hex without 0x
    #[serde(default)]
    pub class: String,
    /// Canonical address (dddd:bb:dd.f)
    #[serde(default)]
    pub address: String,
}

/// CUDA compute capability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    pub fn is_set(&self) -> bool {
        self.major > 0 || self.minor > 0
    }
}

impl std::fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// PCIe link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PcieLink {
    pub generation: u32,
    pub width: u32,
}

/// MIG partitioning strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MigStrategy {
    #[default]
    None,
    Single,
    Mixed,
}

impl MigStrategy {
    /// Parse a strategy string; unrecognized values yield `None` (not the variant)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single" => Some(MigStrategy::Single),
            "mixed" => Some(MigStrategy::Mixed),
            "none" | "disabled" => Some(MigStrategy::None),
            _ => None,
        }
    }
}

impl std::fmt::Display for MigStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigStrategy::None => write!(f, "none"),
            MigStrategy::Single => write!(f, "single"),
            MigStrategy::Mixed => write!(f, "mixed"),
        }
    }
}

/// MIG capabilities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigInfo {
    #[serde(default)]
    pub capable: bool,
    #[serde(default)]
    pub strategy: MigStrategy,
    /// Normalized profile names (e.g. `1g.10gb`), sorted
    #[serde(default)]
    pub profiles_supported: Vec<String>,
    /// Instances available per profile
    #[serde(default)]
    pub capacity: BTreeMap<String, u32>,
}

/// Hardware description of a GPU
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GPUDeviceHardware {
    #[serde(default)]
    pub pci: PciIdentity,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default, rename = "memoryMiB")]
    pub memory_mib: u64,
    #[serde(default)]
    pub compute_capability: ComputeCapability,
    #[serde(default)]
    pub numa_node: Option<i32>,
    #[serde(default, rename = "powerLimitMW")]
    pub power_limit_mw: Option<u64>,
    #[serde(default)]
    pub sm_count: Option<u32>,
    #[serde(default, rename = "memoryBandwidthMiB")]
    pub memory_bandwidth_mib: Option<u64>,
    #[serde(default)]
    pub pcie: Option<PcieLink>,
    #[serde(default)]
    pub board: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub pstate: String,
    #[serde(default)]
    pub display_mode: String,
    #[serde(default)]
    pub precision: Vec<String>,
    #[serde(default)]
    pub mig: MigInfo,
}

/// Live telemetry from the detection sidecar
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GPUDeviceHealth {
    #[serde(default)]
    pub temperature_c: Option<i32>,
    #[serde(default)]
    pub gpu_utilization: Option<u32>,
    #[serde(default)]
    pub memory_utilization: Option<u32>,
    #[serde(default, rename = "powerUsageMW")]
    pub power_usage_mw: Option<u64>,
    #[serde(default, rename = "memoryUsedMiB")]
    pub memory_used_mib: Option<u64>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the GPUDevice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GPUDeviceStatus {
    #[serde(default)]
    pub node_name: String,

    /// Stable identifier derived from node and PCI identity
    #[serde(default, rename = "inventoryID")]
    pub inventory_id: String,

    #[serde(default)]
    pub managed: bool,

    #[serde(default)]
    pub state: GPUDeviceState,

    #[serde(default)]
    pub auto_attach: bool,

    #[serde(default)]
    pub hardware: GPUDeviceHardware,

    #[serde(default)]
    pub health: GPUDeviceHealth,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// =============================================================================
// Helper Methods
// =============================================================================

impl GPUDevice {
    /// Device name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    /// Node the device is labelled with
    pub fn node_label(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(NODE_LABEL))
            .map(String::as_str)
    }

    /// Current state, Discovered when no status was written yet
    pub fn state(&self) -> GPUDeviceState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn inventory_id(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.inventory_id.as_str())
            .unwrap_or("")
    }

    pub fn auto_attach(&self) -> bool {
        self.status.as_ref().map(|s| s.auto_attach).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_externally_owned_states() {
        let owned: Vec<_> = GPUDeviceState::ALL
            .iter()
            .filter(|s| s.is_externally_owned())
            .collect();
        assert_eq!(
            owned,
            vec![&GPUDeviceState::Assigned, &GPUDeviceState::Reserved, &GPUDeviceState::InUse]
        );
    }

    #[test]
    fn test_needs_validation() {
        assert!(GPUDeviceState::Discovered.needs_validation());
        assert!(GPUDeviceState::Validating.needs_validation());
        assert!(!GPUDeviceState::Faulted.needs_validation());
        assert!(!GPUDeviceState::Ready.needs_validation());
    }

    #[test]
    fn test_mig_strategy_parse() {
        assert_eq!(MigStrategy::parse("Mixed"), Some(MigStrategy::Mixed));
        assert_eq!(MigStrategy::parse("disabled"), Some(MigStrategy::None));
        assert_eq!(MigStrategy::parse("sometimes"), None);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = GPUDeviceStatus {
            node_name: "node-a".into(),
            inventory_id: "node-a-0123456789ab".into(),
            state: GPUDeviceState::PendingAssignment,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["nodeName"], "node-a");
        assert_eq!(json["inventoryID"], "node-a-0123456789ab");
        assert_eq!(json["state"], "PendingAssignment");
        assert_eq!(json["hardware"]["memoryMiB"], 0);
    }
}
