//! Domain Ports - Core trait definitions for the GPU fleet engine
//!
//! These traits define the boundaries between the reconciliation engine and
//! external systems: the resource store, the event sink, workload health
//! probes, the exporter heartbeat and the detection sidecar.
//! Adapters implement these traits to provide concrete functionality.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::crd::{GPUDevice, GPUNodeState};
use crate::error::Result;
use crate::hardware::detection::DetectionSet;
use crate::hardware::snapshot::NodeInfo;

// =============================================================================
// Resource Store
// =============================================================================

/// Durable record storage.
///
/// Conditional writes use `metadata.resourceVersion` of the passed object as
/// the optimistic lock and fail with `Error::Conflict` when it is stale.
/// Deletes treat a missing record as success.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_device(&self, name: &str) -> Result<Option<GPUDevice>>;

    /// Create a device; status is not persisted on create
    async fn create_device(&self, device: &GPUDevice) -> Result<GPUDevice>;

    /// Replace labels and owner references (conditional)
    async fn patch_device_metadata(&self, device: &GPUDevice) -> Result<GPUDevice>;

    /// Replace the status subresource (conditional)
    async fn patch_device_status(&self, device: &GPUDevice) -> Result<GPUDevice>;

    /// Devices labelled with the node, sorted by name
    async fn list_devices_by_node(&self, node: &str) -> Result<Vec<GPUDevice>>;

    async fn delete_device(&self, name: &str) -> Result<()>;

    async fn get_inventory(&self, node: &str) -> Result<Option<GPUNodeState>>;

    /// Create an inventory; status is not persisted on create
    async fn create_inventory(&self, inventory: &GPUNodeState) -> Result<GPUNodeState>;

    /// Replace spec and owner references (conditional)
    async fn patch_inventory_spec(&self, inventory: &GPUNodeState) -> Result<GPUNodeState>;

    /// Replace the status subresource (conditional)
    async fn patch_inventory_status(&self, inventory: &GPUNodeState) -> Result<GPUNodeState>;

    async fn delete_inventory(&self, node: &str) -> Result<()>;
}

// =============================================================================
// Events
// =============================================================================

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Normal,
    Warning,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Normal => write!(f, "Normal"),
            EventKind::Warning => write!(f, "Warning"),
        }
    }
}

/// Cluster event sink
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(
        &self,
        reference: &ObjectReference,
        kind: EventKind,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

// =============================================================================
// Workload Probes
// =============================================================================

/// Health of one support workload on a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadProbe {
    pub name: String,
    pub healthy: bool,
    pub message: String,
    /// IP of the pod that answered, when one was found
    pub pod_ip: Option<String>,
}

/// Explicit validation result published by the validator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub driver_ready: bool,
    pub toolkit_ready: bool,
}

/// Probes support workloads scheduled on a node
#[async_trait]
pub trait WorkloadProber: Send + Sync {
    async fn probe(&self, node: &str, workload: &str) -> Result<WorkloadProbe>;

    /// `None` when the validator does not expose a result
    async fn validation_report(&self, node: &str) -> Result<Option<ValidationReport>>;
}

/// Self-reported heartbeat of the monitoring exporter
#[async_trait]
pub trait HeartbeatSource: Send + Sync {
    /// `None` when the signal is unavailable
    async fn heartbeat(&self, exporter: &WorkloadProbe) -> Option<DateTime<Utc>>;
}

// =============================================================================
// Detection
// =============================================================================

/// Live GPU data from the per-node detection sidecar
#[async_trait]
pub trait DetectionSource: Send + Sync {
    /// `None` when no live data is available this pass
    async fn fetch(&self, node: &NodeInfo) -> Option<DetectionSet>;
}

// =============================================================================
// Type Aliases
// =============================================================================

pub type ResourceStoreRef = Arc<dyn ResourceStore>;
pub type EventRecorderRef = Arc<dyn EventRecorder>;
pub type WorkloadProberRef = Arc<dyn WorkloadProber>;
pub type HeartbeatSourceRef = Arc<dyn HeartbeatSource>;
pub type DetectionSourceRef = Arc<dyn DetectionSource>;
