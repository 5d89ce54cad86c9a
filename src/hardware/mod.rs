//! Hardware Module
//!
//! Everything the engine knows about physical GPUs before it touches a
//! record: PCI identity helpers, the product catalog, per-node snapshots
//! built from feature labels, live detection fusion and auto-attach approval.

pub mod approval;
pub mod catalog;
pub mod detection;
pub mod pci;
pub mod snapshot;

pub use approval::{selector_matches, DeviceApprovalMode, DeviceApprovalPolicy};
pub use detection::{apply_detection_hardware, DetectionEntry, DetectionSet, HttpDetectionClient};
pub use pci::{canonical_index, canonical_pci_address, normalize_hex_id, NVIDIA_VENDOR_ID};
pub use snapshot::{
    build_node_snapshot, device_name, inventory_id, DeviceSnapshot, NodeInfo, NodeSnapshot,
};
