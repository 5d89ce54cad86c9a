//! In-Memory Resource Store
//!
//! Keeps records in process with resource versions, so conditional writes
//! behave like the API server's. Supports injecting conflicts and counts
//! writes, which is what the idempotence tests assert on.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

use crate::crd::{GPUDevice, GPUNodeState, NODE_LABEL};
use crate::domain::ports::ResourceStore;
use crate::error::{Error, Result};

/// Write operations that can be counted or made to conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteOp {
    CreateDevice,
    DeviceMetadata,
    DeviceStatus,
    DeleteDevice,
    CreateInventory,
    InventorySpec,
    InventoryStatus,
    DeleteInventory,
}

/// Writes per operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteCounts(BTreeMap<WriteOp, u64>);

impl WriteCounts {
    pub fn get(&self, op: WriteOp) -> u64 {
        self.0.get(&op).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

#[derive(Default)]
struct State {
    devices: BTreeMap<String, GPUDevice>,
    inventories: BTreeMap<String, GPUNodeState>,
    version: u64,
    writes: WriteCounts,
    conflicts: BTreeSet<WriteOp>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn record(&mut self, op: WriteOp) {
        *self.writes.0.entry(op).or_default() += 1;
    }

    /// Consume an injected conflict for `op`
    fn take_conflict(&mut self, op: WriteOp) -> bool {
        self.conflicts.remove(&op)
    }
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn conflict(kind: &str, name: &str) -> Error {
    Error::Conflict {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::ResourceNotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

/// Stale when the caller supplied a version that is not the stored one
fn is_stale(expected: &Option<String>, stored: &Option<String>) -> bool {
    expected.is_some() && expected != stored
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `op` fail with a conflict
    pub fn inject_conflict(&self, op: WriteOp) {
        self.state.lock().conflicts.insert(op);
    }

    pub fn write_counts(&self) -> WriteCounts {
        self.state.lock().writes.clone()
    }

    pub fn reset_write_counts(&self) {
        self.state.lock().writes = WriteCounts::default();
    }

    pub fn device(&self, name: &str) -> Option<GPUDevice> {
        self.state.lock().devices.get(name).cloned()
    }

    pub fn devices(&self) -> Vec<GPUDevice> {
        self.state.lock().devices.values().cloned().collect()
    }

    pub fn inventory(&self, node: &str) -> Option<GPUNodeState> {
        self.state.lock().inventories.get(node).cloned()
    }

    /// Store a device as-is (status included), without counting a write
    pub fn seed_device(&self, mut device: GPUDevice) -> GPUDevice {
        let mut state = self.state.lock();
        device.metadata.resource_version = Some(state.next_version());
        state.devices.insert(device.name_any(), device.clone());
        device
    }

    /// Store an inventory as-is (status included), without counting a write
    pub fn seed_inventory(&self, mut inventory: GPUNodeState) -> GPUNodeState {
        let mut state = self.state.lock();
        inventory.metadata.resource_version = Some(state.next_version());
        state.inventories.insert(inventory.name_any(), inventory.clone());
        inventory
    }

    /// Simulate another writer touching a device
    pub fn touch_device(&self, name: &str) {
        let mut state = self.state.lock();
        let version = state.next_version();
        if let Some(device) = state.devices.get_mut(name) {
            device.metadata.resource_version = Some(version);
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_device(&self, name: &str) -> Result<Option<GPUDevice>> {
        Ok(self.device(name))
    }

    async fn create_device(&self, device: &GPUDevice) -> Result<GPUDevice> {
        let name = device.name_any();
        let mut state = self.state.lock();
        if state.take_conflict(WriteOp::CreateDevice) || state.devices.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: "GPUDevice".into(),
                name,
            });
        }

        let mut created = device.clone();
        created.status = None;
        created.metadata.resource_version = Some(state.next_version());
        created.metadata.uid = Some(format!("uid-{}", name));
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        state.record(WriteOp::CreateDevice);
        state.devices.insert(name, created.clone());
        Ok(created)
    }

    async fn patch_device_metadata(&self, device: &GPUDevice) -> Result<GPUDevice> {
        let name = device.name_any();
        let mut state = self.state.lock();
        if state.take_conflict(WriteOp::DeviceMetadata) {
            return Err(conflict("GPUDevice", &name));
        }
        let stored_version = match state.devices.get(&name) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => return Err(not_found("GPUDevice", &name)),
        };
        if is_stale(&device.metadata.resource_version, &stored_version) {
            return Err(conflict("GPUDevice", &name));
        }

        let version = state.next_version();
        state.record(WriteOp::DeviceMetadata);
        let stored = state
            .devices
            .get_mut(&name)
            .ok_or_else(|| not_found("GPUDevice", &name))?;
        stored.metadata.labels = device.metadata.labels.clone();
        stored.metadata.owner_references = device.metadata.owner_references.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn patch_device_status(&self, device: &GPUDevice) -> Result<GPUDevice> {
        let name = device.name_any();
        let mut state = self.state.lock();
        if state.take_conflict(WriteOp::DeviceStatus) {
            return Err(conflict("GPUDevice", &name));
        }
        let stored_version = match state.devices.get(&name) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => return Err(not_found("GPUDevice", &name)),
        };
        if is_stale(&device.metadata.resource_version, &stored_version) {
            return Err(conflict("GPUDevice", &name));
        }

        let version = state.next_version();
        state.record(WriteOp::DeviceStatus);
        let stored = state
            .devices
            .get_mut(&name)
            .ok_or_else(|| not_found("GPUDevice", &name))?;
        stored.status = device.status.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn list_devices_by_node(&self, node: &str) -> Result<Vec<GPUDevice>> {
        let state = self.state.lock();
        Ok(state
            .devices
            .values()
            .filter(|d| d.labels().get(NODE_LABEL).map(String::as_str) == Some(node))
            .cloned()
            .collect())
    }

    async fn delete_device(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.devices.remove(name).is_some() {
            state.record(WriteOp::DeleteDevice);
        }
        Ok(())
    }

    async fn get_inventory(&self, node: &str) -> Result<Option<GPUNodeState>> {
        Ok(self.inventory(node))
    }

    async fn create_inventory(&self, inventory: &GPUNodeState) -> Result<GPUNodeState> {
        let name = inventory.name_any();
        let mut state = self.state.lock();
        if state.take_conflict(WriteOp::CreateInventory) || state.inventories.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: "GPUNodeState".into(),
                name,
            });
        }

        let mut created = inventory.clone();
        created.status = None;
        created.metadata.resource_version = Some(state.next_version());
        created.metadata.uid = Some(format!("uid-{}", name));
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        state.record(WriteOp::CreateInventory);
        state.inventories.insert(name, created.clone());
        Ok(created)
    }

    async fn patch_inventory_spec(&self, inventory: &GPUNodeState) -> Result<GPUNodeState> {
        let name = inventory.name_any();
        let mut state = self.state.lock();
        if state.take_conflict(WriteOp::InventorySpec) {
            return Err(conflict("GPUNodeState", &name));
        }
        let stored_version = match state.inventories.get(&name) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => return Err(not_found("GPUNodeState", &name)),
        };
        if is_stale(&inventory.metadata.resource_version, &stored_version) {
            return Err(conflict("GPUNodeState", &name));
        }

        let version = state.next_version();
        state.record(WriteOp::InventorySpec);
        let stored = state
            .inventories
            .get_mut(&name)
            .ok_or_else(|| not_found("GPUNodeState", &name))?;
        stored.spec = inventory.spec.clone();
        stored.metadata.owner_references = inventory.metadata.owner_references.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn patch_inventory_status(&self, inventory: &GPUNodeState) -> Result<GPUNodeState> {
        let name = inventory.name_any();
        let mut state = self.state.lock();
        if state.take_conflict(WriteOp::InventoryStatus) {
            return Err(conflict("GPUNodeState", &name));
        }
        let stored_version = match state.inventories.get(&name) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => return Err(not_found("GPUNodeState", &name)),
        };
        if is_stale(&inventory.metadata.resource_version, &stored_version) {
            return Err(conflict("GPUNodeState", &name));
        }

        let version = state.next_version();
        state.record(WriteOp::InventoryStatus);
        let stored = state
            .inventories
            .get_mut(&name)
            .ok_or_else(|| not_found("GPUNodeState", &name))?;
        stored.status = inventory.status.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn delete_inventory(&self, node: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.inventories.remove(node).is_some() {
            state.record(WriteOp::DeleteInventory);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GPUDeviceSpec, GPUDeviceStatus, GPUDeviceState};
    use assert_matches::assert_matches;

    fn device(name: &str, node: &str) -> GPUDevice {
        let mut device = GPUDevice::new(name, GPUDeviceSpec::default());
        device
            .labels_mut()
            .insert(NODE_LABEL.to_string(), node.to_string());
        device
    }

    #[tokio::test]
    async fn test_create_strips_status_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let mut dev = device("node-a-0-10de-2330", "node-a");
        dev.status = Some(GPUDeviceStatus::default());

        let created = store.create_device(&dev).await.unwrap();
        assert!(created.status.is_none());
        assert!(created.metadata.resource_version.is_some());

        assert_matches!(
            store.create_device(&dev).await,
            Err(Error::ResourceExists { .. })
        );
    }

    #[tokio::test]
    async fn test_stale_status_patch_conflicts() {
        let store = MemoryStore::new();
        let mut created = store
            .create_device(&device("node-a-0-10de-2330", "node-a"))
            .await
            .unwrap();
        store.touch_device("node-a-0-10de-2330");

        created.status = Some(GPUDeviceStatus {
            state: GPUDeviceState::Ready,
            ..Default::default()
        });
        assert_matches!(
            store.patch_device_status(&created).await,
            Err(Error::Conflict { .. })
        );

        let fresh = store.get_device("node-a-0-10de-2330").await.unwrap().unwrap();
        let mut update = fresh.clone();
        update.status = created.status.clone();
        let patched = store.patch_device_status(&update).await.unwrap();
        assert_eq!(patched.state(), GPUDeviceState::Ready);
        assert_eq!(store.write_counts().get(WriteOp::DeviceStatus), 1);
    }

    #[tokio::test]
    async fn test_injected_conflict_fires_once() {
        let store = MemoryStore::new();
        let created = store
            .create_device(&device("node-a-0-10de-2330", "node-a"))
            .await
            .unwrap();
        store.inject_conflict(WriteOp::DeviceStatus);

        assert!(store.patch_device_status(&created).await.unwrap_err().is_conflict());
        assert!(store.patch_device_status(&created).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_by_node_and_idempotent_delete() {
        let store = MemoryStore::new();
        store.create_device(&device("node-a-0-10de-2330", "node-a")).await.unwrap();
        store.create_device(&device("node-a-1-10de-2330", "node-a")).await.unwrap();
        store.create_device(&device("node-b-0-10de-2330", "node-b")).await.unwrap();

        let listed = store.list_devices_by_node("node-a").await.unwrap();
        assert_eq!(listed.len(), 2);

        store.delete_device("node-a-0-10de-2330").await.unwrap();
        store.delete_device("node-a-0-10de-2330").await.unwrap();
        assert_eq!(store.write_counts().get(WriteOp::DeleteDevice), 1);
        store.delete_inventory("missing").await.unwrap();
    }
}
