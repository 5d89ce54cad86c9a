//! GPU Fleet Operator
//!
//! A Kubernetes controller that owns the lifecycle of physical GPUs: one
//! `GPUDevice` record per PCI function, one `GPUNodeState` inventory per
//! node, and the bootstrap gate that decides when a node's GPUs may be
//! handed to the pool controller.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                 Node Controller (kube runtime)                       │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  NodeFeature labels ──► NodeSnapshot ──► DeviceReconciler            │
//! │  Detection sidecar  ──► DetectionSet ─┘        │                     │
//! │                                                ▼                     │
//! │                      InventoryReconciler ─► WorkloadStatusHandler    │
//! │                                          └► DeviceStateSyncHandler   │
//! │                                                                      │
//! │  CleanupService (orphans, deleted nodes)   OperatorMetrics           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Ports: ResourceStore · EventRecorder · WorkloadProber ·             │
//! │         HeartbeatSource · DetectionSource                            │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: reconcilers, handlers, adapters and the controller loop
//! - [`hardware`]: snapshots, catalog, detection fusion and approval policy
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: port traits
//! - [`config`]: module settings
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod hardware;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types
pub use config::ModuleSettings;

pub use controlplane::{
    BootstrapConfig, CleanupService, DeviceReconciler, InventoryReconciler, KubeEventRecorder,
    KubeStore, KubeWorkloadProber, MemoryStore, OperatorMetrics, Orchestrator, OrchestratorConfig,
};

pub use crd::{
    BootstrapPhase, Condition, ConditionStatus, GPUDevice, GPUDeviceSpec, GPUDeviceState,
    GPUDeviceStatus, GPUNodeState, GPUNodeStateSpec, GPUNodeStateStatus,
};

pub use domain::ports::{
    DetectionSource, EventRecorder, HeartbeatSource, ResourceStore, WorkloadProber,
};

pub use error::{Error, ErrorAction, Result};

pub use hardware::{DeviceApprovalMode, DeviceApprovalPolicy, DeviceSnapshot, NodeInfo, NodeSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
