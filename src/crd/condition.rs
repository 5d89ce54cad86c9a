//! Status Conditions
//!
//! Shared condition type for GPUDevice and GPUNodeState, plus the
//! condition type and reason names the engine writes.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Condition Types
// =============================================================================

pub const INVENTORY_COMPLETE: &str = "InventoryComplete";
pub const MANAGED_DISABLED: &str = "ManagedDisabled";
pub const DRIVER_READY: &str = "DriverReady";
pub const TOOLKIT_READY: &str = "ToolkitReady";
pub const COMPONENTS_HEALTHY: &str = "ComponentsHealthy";
pub const MONITORING_READY: &str = "MonitoringReady";
pub const READY_FOR_POOLING: &str = "ReadyForPooling";

pub const DEVICE_MANAGED: &str = "Managed";
pub const HARDWARE_IDENTIFIED: &str = "HardwareIdentified";

// =============================================================================
// Reasons
// =============================================================================

pub mod reasons {
    // InventoryComplete
    pub const NODE_FEATURE_MISSING: &str = "NodeFeatureMissing";
    pub const NO_DEVICES_DISCOVERED: &str = "NoDevicesDiscovered";
    pub const INVENTORY_SYNCED: &str = "InventorySynced";

    // ManagedDisabled
    pub const NODE_NOT_MANAGED: &str = "NodeNotManaged";
    pub const NODE_MANAGED: &str = "NodeManaged";

    // Facets
    pub const VALIDATOR_READY: &str = "ValidatorReady";
    pub const VALIDATOR_NOT_READY: &str = "ValidatorNotReady";
    pub const VALIDATION_PASSED: &str = "ValidationPassed";
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const COMPONENTS_READY: &str = "ComponentsReady";
    pub const COMPONENTS_NOT_READY: &str = "ComponentsNotReady";
    pub const MONITORING_HEALTHY: &str = "MonitoringHealthy";
    pub const HEARTBEAT_STALE: &str = "HeartbeatStale";

    // ReadyForPooling
    pub const NO_DEVICES: &str = "NoDevices";
    pub const NODE_DISABLED: &str = "NodeDisabled";
    pub const INVENTORY_PENDING: &str = "InventoryPending";
    pub const DEVICES_PENDING: &str = "DevicesPending";
    pub const DRIVER_NOT_DETECTED: &str = "DriverNotDetected";
    pub const TOOLKIT_NOT_READY: &str = "ToolkitNotReady";
    pub const COMPONENT_PENDING: &str = "ComponentPending";
    pub const MONITORING_UNHEALTHY: &str = "MonitoringUnhealthy";
    pub const DEVICES_FAULTED: &str = "DevicesFaulted";
    pub const ALL_CHECKS_PASSED: &str = "AllChecksPassed";

    // Device conditions
    pub const MANAGED_BY_NODE: &str = "ManagedByNode";
    pub const NODE_UNMANAGED: &str = "NodeUnmanaged";
    pub const IDENTITY_COMPLETE: &str = "IdentityComplete";
    pub const IDENTITY_INCOMPLETE: &str = "IdentityIncomplete";
}

// =============================================================================
// Condition
// =============================================================================

/// Condition status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Status condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Last time the status flipped
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Whether the condition is True
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

/// True only if the condition exists and is True
pub fn condition_is_true(conditions: &[Condition], r#type: &str) -> bool {
    find_condition(conditions, r#type)
        .map(Condition::is_true)
        .unwrap_or(false)
}

/// Set a condition, returning whether (status, reason, message) changed.
///
/// `last_transition_time` only moves when the status flips, and is stamped
/// with the caller's `now`.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    r#type: &str,
    status: impl Into<ConditionStatus>,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) -> bool {
    let status = status.into();
    let message = message.into();

    match conditions.iter_mut().find(|c| c.r#type == r#type) {
        Some(existing) => {
            if existing.status == status && existing.reason == reason && existing.message == message {
                return false;
            }
            if existing.status != status {
                existing.last_transition_time = Some(now);
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message;
            true
        }
        None => {
            conditions.push(Condition {
                r#type: r#type.to_string(),
                status,
                reason: reason.to_string(),
                message,
                last_transition_time: Some(now),
            });
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_reports_changes() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::minutes(5);
        let t2 = t0 + chrono::Duration::minutes(9);

        let mut conditions = Vec::new();
        assert!(set_condition(&mut conditions, DRIVER_READY, true, reasons::VALIDATOR_READY, "ok", t0));
        assert!(!set_condition(&mut conditions, DRIVER_READY, true, reasons::VALIDATOR_READY, "ok", t1));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, Some(t0));

        // message-only change keeps the transition time
        assert!(set_condition(&mut conditions, DRIVER_READY, true, reasons::VALIDATOR_READY, "still ok", t1));
        assert_eq!(conditions[0].last_transition_time, Some(t0));

        assert!(set_condition(&mut conditions, DRIVER_READY, false, reasons::VALIDATOR_NOT_READY, "down", t2));
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_eq!(conditions[0].last_transition_time, Some(t2));
        assert!(!condition_is_true(&conditions, DRIVER_READY));
    }

    #[test]
    fn test_missing_condition_is_not_true() {
        assert!(!condition_is_true(&[], READY_FOR_POOLING));
        assert!(find_condition(&[], READY_FOR_POOLING).is_none());
    }
}
