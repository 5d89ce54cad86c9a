//! Control Plane
//!
//! The reconciliation engine: device and inventory reconcilers, the
//! bootstrap phase handler, device state sync and cleanup, plus the adapters
//! they run against (cluster store, events, probes) and the controller loop
//! that drives them.

pub mod bootstrap;
pub mod cleanup;
pub mod device;
pub mod device_state;
pub mod events;
pub mod handler;
pub mod inventory;
pub mod metrics;
pub mod orchestrator;
pub mod probe;
pub mod server;
pub mod store;

pub use bootstrap::{BootstrapConfig, ComponentNames, WorkloadStatusHandler};
pub use cleanup::CleanupService;
pub use device::{DeviceConditionsHandler, DeviceReconcileResult, DeviceReconciler};
pub use device_state::{desired_device_state, DeviceStateSyncHandler};
pub use events::{KubeEventRecorder, MemoryEventRecorder};
pub use handler::{DeviceHandler, HandlerResult, InventoryHandler};
pub use inventory::{InventoryReconcileResult, InventoryReconciler};
pub use metrics::OperatorMetrics;
pub use orchestrator::{NodeFeatureClient, Orchestrator, OrchestratorBuilder, OrchestratorConfig};
pub use probe::{ExporterHeartbeatScraper, HeartbeatConfig, KubeWorkloadProber};
pub use server::ProbeState;
pub use store::{KubeStore, MemoryStore};
