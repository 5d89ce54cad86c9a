//! Device Approval Policy
//!
//! Decides whether a device may be auto-attached to the pool. Pure and
//! stateless: the policy is rebuilt from module settings on every pass and
//! never persisted per device.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crd::GPUDeviceHardware;

/// Selector operators understood by [`selector_matches`]
pub const SUPPORTED_OPERATORS: [&str; 4] = ["In", "NotIn", "Exists", "DoesNotExist"];

/// Derived device label keys
pub const PRODUCT_LABEL: &str = "gpu.billyronks.io/product";
pub const MEMORY_LABEL: &str = "gpu.billyronks.io/memory-mib";
pub const COMPUTE_LABEL: &str = "gpu.billyronks.io/compute-capability";
pub const VENDOR_LABEL: &str = "gpu.billyronks.io/vendor";
pub const DEVICE_ID_LABEL: &str = "gpu.billyronks.io/device-id";

// =============================================================================
// Policy
// =============================================================================

/// Approval mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceApprovalMode {
    /// Operators attach devices by hand
    #[default]
    Manual,
    /// Every device on a managed node is attached
    Automatic,
    /// Devices on managed nodes matching the selector are attached
    Selector,
}

impl std::fmt::Display for DeviceApprovalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceApprovalMode::Manual => write!(f, "Manual"),
            DeviceApprovalMode::Automatic => write!(f, "Automatic"),
            DeviceApprovalMode::Selector => write!(f, "Selector"),
        }
    }
}

/// Evaluated approval policy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceApprovalPolicy {
    mode: DeviceApprovalMode,
    selector: Option<LabelSelector>,
}

impl DeviceApprovalPolicy {
    pub fn new(mode: DeviceApprovalMode, selector: Option<LabelSelector>) -> Self {
        Self { mode, selector }
    }

    pub fn mode(&self) -> DeviceApprovalMode {
        self.mode
    }

    /// Auto-attach decision for a device.
    ///
    /// Selector mode without a selector behaves like Automatic, and an empty
    /// selector matches every device.
    pub fn auto_attach(&self, managed: bool, labels: &BTreeMap<String, String>) -> bool {
        match self.mode {
            DeviceApprovalMode::Manual => false,
            DeviceApprovalMode::Automatic => managed,
            DeviceApprovalMode::Selector => match &self.selector {
                None => managed,
                Some(selector) => managed && selector_matches(selector, labels),
            },
        }
    }
}

// =============================================================================
// Selector Matching
// =============================================================================

/// Label selector semantics: all matchLabels and all matchExpressions must hold.
/// Unknown operators never match.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(key, value)| labels.get(key) == Some(value));

    if !labels_match {
        return false;
    }

    selector.match_expressions.iter().flatten().all(|expr| {
        let actual = labels.get(&expr.key);
        let values = expr.values.as_deref().unwrap_or_default();
        match expr.operator.as_str() {
            "In" => actual.map(|v| values.contains(v)).unwrap_or(false),
            "NotIn" => actual.map(|v| !values.contains(v)).unwrap_or(true),
            "Exists" => actual.is_some(),
            "DoesNotExist" => actual.is_none(),
            _ => false,
        }
    })
}

/// Labels a selector is evaluated against: the node's labels plus a few
/// derived from the device hardware.
pub fn approval_labels(
    node_labels: &BTreeMap<String, String>,
    hardware: &GPUDeviceHardware,
) -> BTreeMap<String, String> {
    let mut labels = node_labels.clone();
    if !hardware.product.is_empty() {
        labels.insert(PRODUCT_LABEL.to_string(), label_value(&hardware.product));
    }
    if hardware.memory_mib > 0 {
        labels.insert(MEMORY_LABEL.to_string(), hardware.memory_mib.to_string());
    }
    if hardware.compute_capability.is_set() {
        labels.insert(COMPUTE_LABEL.to_string(), hardware.compute_capability.to_string());
    }
    if !hardware.pci.vendor.is_empty() {
        labels.insert(VENDOR_LABEL.to_string(), hardware.pci.vendor.clone());
    }
    if !hardware.pci.device.is_empty() {
        labels.insert(DEVICE_ID_LABEL.to_string(), hardware.pci.device.clone());
    }
    labels
}

fn label_value(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '-' })
        .collect()
}
