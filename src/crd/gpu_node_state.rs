//! GPUNodeState CRD
//!
//! Per-node inventory record: what GPUs the node carries, which driver it
//! runs, and how far the node is through bootstrap. Named after the node.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::condition::{condition_is_true, Condition, INVENTORY_COMPLETE, MANAGED_DISABLED, READY_FOR_POOLING};
use super::gpu_device::GPUDeviceState;

// =============================================================================
// GPUNodeState CRD
// =============================================================================

/// GPUNodeState aggregates the GPU inventory and bootstrap progress of a node.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gpu.billyronks.io",
    version = "v1",
    kind = "GPUNodeState",
    plural = "gpunodestates",
    shortname = "gpuns",
    status = "GPUNodeStateStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "GPUs", "type": "integer", "jsonPath": ".status.hardware.deviceCount"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.bootstrap.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct GPUNodeStateSpec {
    /// Name of the Kubernetes node
    pub node_name: String,
}

// =============================================================================
// Bootstrap Phase
// =============================================================================

/// Node bootstrap phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum BootstrapPhase {
    Disabled,
    #[default]
    Validating,
    ValidatingFailed,
    #[serde(rename = "GFD")]
    Gfd,
    Monitoring,
    Ready,
}

impl BootstrapPhase {
    /// Node already cleared validation at some point
    pub fn has_passed_validation(&self) -> bool {
        matches!(
            self,
            BootstrapPhase::Gfd | BootstrapPhase::Monitoring | BootstrapPhase::Ready
        )
    }
}

impl std::fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootstrapPhase::Disabled => write!(f, "Disabled"),
            BootstrapPhase::Validating => write!(f, "Validating"),
            BootstrapPhase::ValidatingFailed => write!(f, "ValidatingFailed"),
            BootstrapPhase::Gfd => write!(f, "GFD"),
            BootstrapPhase::Monitoring => write!(f, "Monitoring"),
            BootstrapPhase::Ready => write!(f, "Ready"),
        }
    }
}

// =============================================================================
// Status Sub-Types
// =============================================================================

/// Hardware presence summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeHardware {
    #[serde(default)]
    pub present: bool,
    #[serde(default)]
    pub device_count: u32,
}

/// Driver and toolkit as advertised by node labels
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriverStatus {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub cuda_version: String,
    #[serde(default)]
    pub toolkit_ready: bool,
}

/// Denormalized view of one device on the node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeviceStatus {
    #[serde(rename = "inventoryID")]
    pub inventory_id: String,
    pub name: String,
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub state: GPUDeviceState,
    #[serde(default)]
    pub auto_attach: bool,
}

/// Monitoring stack readiness
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStatus {
    #[serde(default)]
    pub dcgm_ready: bool,
    #[serde(default)]
    pub exporter_ready: bool,
    /// Heartbeat reported by the exporter itself
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Health of one support workload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    pub name: String,
    pub healthy: bool,
    #[serde(default)]
    pub message: String,
}

/// Validation retry bookkeeping for one pending device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidationAttempt {
    #[serde(rename = "inventoryID")]
    pub inventory_id: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_failure: Option<DateTime<Utc>>,
}

/// Bootstrap progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapStatus {
    #[serde(default)]
    pub phase: BootstrapPhase,
    /// Node cleared validation at least once; never reset
    #[serde(default)]
    pub validation_passed: bool,
    /// Component name -> healthy
    #[serde(default)]
    pub components: BTreeMap<String, bool>,
    #[serde(default)]
    pub gfd_ready: bool,
    #[serde(default)]
    pub toolkit_ready: bool,
    #[serde(default)]
    pub workloads: Vec<WorkloadStatus>,
    #[serde(default)]
    pub validator_required: bool,
    /// Inventory ids still waiting for validation
    #[serde(default)]
    pub pending_devices: Vec<String>,
    #[serde(default)]
    pub validations: Vec<ValidationAttempt>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the GPUNodeState
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GPUNodeStateStatus {
    #[serde(default)]
    pub hardware: NodeHardware,
    #[serde(default)]
    pub driver: DriverStatus,
    #[serde(default)]
    pub devices: Vec<NodeDeviceStatus>,
    #[serde(default)]
    pub monitoring: MonitoringStatus,
    #[serde(default)]
    pub bootstrap: BootstrapStatus,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl GPUNodeStateStatus {
    pub fn inventory_complete(&self) -> bool {
        condition_is_true(&self.conditions, INVENTORY_COMPLETE)
    }

    pub fn managed_disabled(&self) -> bool {
        condition_is_true(&self.conditions, MANAGED_DISABLED)
    }

    pub fn ready_for_pooling(&self) -> bool {
        condition_is_true(&self.conditions, READY_FOR_POOLING)
    }

    /// Insert or replace the mirror entry for a device, keeping the list sorted by name
    pub fn upsert_device(&mut self, entry: NodeDeviceStatus) {
        match self.devices.iter_mut().find(|d| d.name == entry.name) {
            Some(existing) => *existing = entry,
            None => {
                self.devices.push(entry);
                self.devices.sort_by(|a, b| a.name.cmp(&b.name));
            }
        }
    }
}

impl GPUNodeState {
    /// Node name (record name)
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_passed_validation() {
        assert!(BootstrapPhase::Gfd.has_passed_validation());
        assert!(BootstrapPhase::Monitoring.has_passed_validation());
        assert!(BootstrapPhase::Ready.has_passed_validation());
        assert!(!BootstrapPhase::Validating.has_passed_validation());
        assert!(!BootstrapPhase::ValidatingFailed.has_passed_validation());
        assert!(!BootstrapPhase::Disabled.has_passed_validation());
    }

    #[test]
    fn test_phase_wire_names() {
        assert_eq!(serde_json::to_value(BootstrapPhase::Gfd).unwrap(), "GFD");
        let phase: BootstrapPhase = serde_json::from_value("ValidatingFailed".into()).unwrap();
        assert_eq!(phase, BootstrapPhase::ValidatingFailed);
    }

    #[test]
    fn test_upsert_device_keeps_order() {
        let mut status = GPUNodeStateStatus::default();
        for name in ["node-a-1", "node-a-0"] {
            status.upsert_device(NodeDeviceStatus {
                inventory_id: format!("inv-{name}"),
                name: name.into(),
                ..Default::default()
            });
        }
        status.upsert_device(NodeDeviceStatus {
            inventory_id: "inv-node-a-1".into(),
            name: "node-a-1".into(),
            state: GPUDeviceState::Ready,
            ..Default::default()
        });

        assert_eq!(status.devices.len(), 2);
        assert_eq!(status.devices[0].name, "node-a-0");
        assert_eq!(status.devices[1].state, GPUDeviceState::Ready);
    }
}
