//! Kubernetes Resource Store
//!
//! Cluster-scoped `GPUDevice` and `GPUNodeState` access through kube `Api`.
//! Conditional writes are merge patches carrying `metadata.resourceVersion`;
//! the API server rejects them with 409 when the version is stale.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;

use crate::crd::{GPUDevice, GPUNodeState, NODE_LABEL};
use crate::domain::ports::ResourceStore;
use crate::error::{Error, Result};

const DEVICE_KIND: &str = "GPUDevice";
const INVENTORY_KIND: &str = "GPUNodeState";

/// Store backed by the cluster API
#[derive(Clone)]
pub struct KubeStore {
    devices: Api<GPUDevice>,
    inventories: Api<GPUNodeState>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            devices: Api::all(client.clone()),
            inventories: Api::all(client),
        }
    }
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::ResourceNotFound { .. }) => Ok(()),
        other => other,
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_device(&self, name: &str) -> Result<Option<GPUDevice>> {
        self.devices
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, DEVICE_KIND, name))
    }

    async fn create_device(&self, device: &GPUDevice) -> Result<GPUDevice> {
        self.devices
            .create(&PostParams::default(), device)
            .await
            .map_err(|e| Error::from_kube(e, DEVICE_KIND, device.name()))
    }

    async fn patch_device_metadata(&self, device: &GPUDevice) -> Result<GPUDevice> {
        let patch = json!({
            "metadata": {
                "resourceVersion": device.metadata.resource_version,
                "labels": device.metadata.labels,
                "ownerReferences": device.metadata.owner_references,
            }
        });
        self.devices
            .patch(device.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, DEVICE_KIND, device.name()))
    }

    async fn patch_device_status(&self, device: &GPUDevice) -> Result<GPUDevice> {
        let patch = json!({
            "metadata": { "resourceVersion": device.metadata.resource_version },
            "status": device.status,
        });
        self.devices
            .patch_status(device.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, DEVICE_KIND, device.name()))
    }

    async fn list_devices_by_node(&self, node: &str) -> Result<Vec<GPUDevice>> {
        let params = ListParams::default().labels(&format!("{}={}", NODE_LABEL, node));
        let mut devices = self
            .devices
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, DEVICE_KIND, node))?
            .items;
        devices.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(devices)
    }

    async fn delete_device(&self, name: &str) -> Result<()> {
        let result = self
            .devices
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, DEVICE_KIND, name));
        ignore_not_found(result)
    }

    async fn get_inventory(&self, node: &str) -> Result<Option<GPUNodeState>> {
        self.inventories
            .get_opt(node)
            .await
            .map_err(|e| Error::from_kube(e, INVENTORY_KIND, node))
    }

    async fn create_inventory(&self, inventory: &GPUNodeState) -> Result<GPUNodeState> {
        self.inventories
            .create(&PostParams::default(), inventory)
            .await
            .map_err(|e| Error::from_kube(e, INVENTORY_KIND, inventory.name()))
    }

    async fn patch_inventory_spec(&self, inventory: &GPUNodeState) -> Result<GPUNodeState> {
        let patch = json!({
            "metadata": {
                "resourceVersion": inventory.metadata.resource_version,
                "ownerReferences": inventory.metadata.owner_references,
            },
            "spec": inventory.spec,
        });
        self.inventories
            .patch(inventory.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, INVENTORY_KIND, inventory.name()))
    }

    async fn patch_inventory_status(&self, inventory: &GPUNodeState) -> Result<GPUNodeState> {
        let patch = json!({
            "metadata": { "resourceVersion": inventory.metadata.resource_version },
            "status": inventory.status,
        });
        self.inventories
            .patch_status(inventory.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, INVENTORY_KIND, inventory.name()))
    }

    async fn delete_inventory(&self, node: &str) -> Result<()> {
        let result = self
            .inventories
            .delete(node, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, INVENTORY_KIND, node));
        ignore_not_found(result)
    }
}
