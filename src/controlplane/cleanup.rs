//! Cleanup Service
//!
//! Deletes device and inventory records, with their metric series, when a
//! node's GPUs disappear or the node itself is removed.

use tracing::info;

use super::metrics::OperatorMetrics;
use crate::crd::condition;
use crate::crd::GPUDevice;
use crate::domain::ports::ResourceStoreRef;
use crate::error::Result;

/// Inventory condition series kept per node
const NODE_CONDITIONS: [&str; 2] = [condition::INVENTORY_COMPLETE, condition::READY_FOR_POOLING];

pub struct CleanupService {
    store: ResourceStoreRef,
    metrics: OperatorMetrics,
}

impl CleanupService {
    pub fn new(store: ResourceStoreRef, metrics: OperatorMetrics) -> Self {
        Self { store, metrics }
    }

    /// Delete device records; returns how many were removed
    pub async fn remove_devices(&self, node: &str, devices: &[&GPUDevice]) -> Result<usize> {
        for device in devices {
            self.store.delete_device(device.name()).await?;
            info!(node, device = %device.name(), "Removed GPU device");
        }
        Ok(devices.len())
    }

    /// Delete the node's inventory and its metric series
    pub async fn remove_inventory(&self, node: &str) -> Result<()> {
        self.store.delete_inventory(node).await?;
        self.metrics.remove_node(node, &NODE_CONDITIONS);
        info!(node, "Removed GPU node inventory");
        Ok(())
    }

    /// Everything belonging to a deleted node
    pub async fn node_removed(&self, node: &str) -> Result<()> {
        let devices = self.store.list_devices_by_node(node).await?;
        let refs: Vec<&GPUDevice> = devices.iter().collect();
        self.remove_devices(node, &refs).await?;
        self.remove_inventory(node).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::store::{MemoryStore, WriteOp};
    use crate::crd::{GPUDeviceState, GPUNodeState, GPUNodeStateSpec};
    use crate::test_utils::{device_record, device_snapshot};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_node_removed_clears_records_and_metrics() {
        let store = Arc::new(MemoryStore::new());
        let metrics = OperatorMetrics::new().unwrap();
        let cleanup = CleanupService::new(store.clone(), metrics.clone());

        store.seed_device(device_record("node-a", &device_snapshot("0", "2330"), GPUDeviceState::Ready));
        store.seed_device(device_record("node-a", &device_snapshot("1", "2330"), GPUDeviceState::Ready));
        store.seed_device(device_record("node-b", &device_snapshot("0", "2330"), GPUDeviceState::Ready));
        store.seed_inventory(GPUNodeState::new(
            "node-a",
            GPUNodeStateSpec {
                node_name: "node-a".into(),
            },
        ));
        metrics.update_device_metrics("node-a", &[GPUDeviceState::Ready, GPUDeviceState::Ready]);
        metrics.set_inventory_condition("node-a", condition::INVENTORY_COMPLETE, true);

        cleanup.node_removed("node-a").await.unwrap();

        assert_eq!(store.devices().len(), 1);
        assert!(store.inventory("node-a").is_none());
        assert_eq!(store.write_counts().get(WriteOp::DeleteDevice), 2);
        assert_eq!(metrics.node_device_count("node-a"), None);
        assert_eq!(metrics.state_count("node-a", GPUDeviceState::Ready), None);

        // already gone
        cleanup.node_removed("node-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_selected_devices() {
        let store = Arc::new(MemoryStore::new());
        let cleanup = CleanupService::new(store.clone(), OperatorMetrics::new().unwrap());
        let orphan = store.seed_device(device_record("node-a", &device_snapshot("3", "2330"), GPUDeviceState::Ready));
        store.seed_device(device_record("node-a", &device_snapshot("0", "2330"), GPUDeviceState::Ready));

        let removed = cleanup.remove_devices("node-a", &[&orphan]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.device(orphan.name()).is_none());
        assert_eq!(store.devices().len(), 1);
    }
}
