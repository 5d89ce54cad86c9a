//! Inventory Reconciler
//!
//! Owns the per-node `GPUNodeState`. Derives the inventory conditions from
//! the node snapshot, mirrors the node's device records into status, runs
//! the inventory handlers (bootstrap, device state sync) and writes status
//! only when it changed.

use chrono::{DateTime, Utc};
use kube::Resource;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

use super::device::{has_owner, node_owner_reference};
use super::events::emit;
use super::handler::{run_inventory_handlers, HandlerResult, InventoryContext, InventoryHandlerRef};
use super::metrics::OperatorMetrics;
use super::store::{conditional, WriteOutcome};
use crate::crd::condition::{self, reasons};
use crate::crd::{
    find_condition, set_condition, DriverStatus, GPUDevice, GPUNodeState, GPUNodeStateSpec,
    GPUNodeStateStatus, NodeDeviceStatus, DEVICE_INDEX_LABEL,
};
use crate::domain::ports::{EventKind, EventRecorderRef, ResourceStoreRef};
use crate::error::{Result, CONFLICT_REQUEUE};
use crate::hardware::snapshot::{device_name, NodeInfo, NodeSnapshot};

// =============================================================================
// Reconcile Result
// =============================================================================

/// Outcome of one inventory pass
#[derive(Debug, Clone, Default)]
pub struct InventoryReconcileResult {
    /// `None` when no record exists and none was needed
    pub inventory: Option<GPUNodeState>,
    pub conflicted: bool,
    pub requeue_after: Option<Duration>,
}

impl InventoryReconcileResult {
    fn done(inventory: GPUNodeState, result: HandlerResult) -> Self {
        Self {
            inventory: Some(inventory),
            conflicted: false,
            requeue_after: result.requeue_after,
        }
    }

    fn conflict(inventory: Option<GPUNodeState>) -> Self {
        Self {
            inventory,
            conflicted: true,
            requeue_after: Some(CONFLICT_REQUEUE),
        }
    }
}

/// Condition change waiting to be announced once the status lands
struct PendingEvent {
    kind: EventKind,
    reason: String,
    message: String,
}

// =============================================================================
// Inventory Reconciler
// =============================================================================

pub struct InventoryReconciler {
    store: ResourceStoreRef,
    events: EventRecorderRef,
    metrics: OperatorMetrics,
    handlers: Vec<InventoryHandlerRef>,
}

impl InventoryReconciler {
    pub fn new(store: ResourceStoreRef, events: EventRecorderRef, metrics: OperatorMetrics) -> Self {
        Self {
            store,
            events,
            metrics,
            handlers: Vec::new(),
        }
    }

    /// Append a handler; handlers run in registration order
    pub fn with_handler(mut self, handler: InventoryHandlerRef) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Reconcile the inventory of one node against its device records
    pub async fn reconcile(
        &self,
        node: &NodeInfo,
        snapshot: &NodeSnapshot,
        devices: &[GPUDevice],
        now: DateTime<Utc>,
    ) -> Result<InventoryReconcileResult> {
        let existing = self.store.get_inventory(&node.name).await?;
        if existing.is_none() && devices.is_empty() {
            debug!(node = %node.name, "No devices and no inventory, nothing to do");
            return Ok(InventoryReconcileResult::default());
        }

        let desired = desired_inventory(node);
        let mut inventory = match existing {
            None => match conditional(self.store.create_inventory(&desired)).await? {
                WriteOutcome::Written(created) => {
                    info!(node = %node.name, "Created GPU node inventory");
                    created
                }
                WriteOutcome::Conflict => return Ok(InventoryReconcileResult::conflict(None)),
            },
            Some(current) => {
                let owner = node_owner_reference(node);
                if current.spec.node_name == node.name
                    && has_owner(current.metadata.owner_references.as_ref(), &owner)
                {
                    current
                } else {
                    let mut patched = current.clone();
                    patched.spec.node_name = node.name.clone();
                    let mut owners = patched.metadata.owner_references.take().unwrap_or_default();
                    owners.retain(|o| o.kind != owner.kind || o.name != owner.name);
                    owners.push(owner);
                    patched.metadata.owner_references = Some(owners);

                    match conditional(self.store.patch_inventory_spec(&patched)).await? {
                        WriteOutcome::Written(updated) => {
                            debug!(node = %node.name, "Synced inventory spec");
                            updated
                        }
                        WriteOutcome::Conflict => {
                            return Ok(InventoryReconcileResult::conflict(Some(current)))
                        }
                    }
                }
            }
        };

        let before = inventory.status.clone();
        let mut status = before.clone().unwrap_or_default();
        let mut pending_events = Vec::new();

        status.hardware.present = !devices.is_empty();
        status.hardware.device_count = devices.len() as u32;
        status.driver = DriverStatus {
            version: snapshot.driver.version.clone(),
            cuda_version: snapshot.driver.cuda_version.clone(),
            toolkit_ready: snapshot.driver.toolkit_ready,
        };
        status.devices = device_mirror(devices);

        let (complete, reason, message) = inventory_complete(snapshot);
        if set_condition(
            &mut status.conditions,
            condition::INVENTORY_COMPLETE,
            complete,
            reason,
            message.clone(),
            now,
        ) {
            pending_events.push(PendingEvent {
                kind: if complete { EventKind::Normal } else { EventKind::Warning },
                reason: reason.to_string(),
                message,
            });
        }
        self.metrics
            .set_inventory_condition(&node.name, condition::INVENTORY_COMPLETE, complete);

        let (reason, message) = if snapshot.managed {
            (reasons::NODE_MANAGED, String::new())
        } else {
            (
                reasons::NODE_NOT_MANAGED,
                format!("node {} is excluded from GPU management", node.name),
            )
        };
        if set_condition(
            &mut status.conditions,
            condition::MANAGED_DISABLED,
            !snapshot.managed,
            reason,
            message.clone(),
            now,
        ) && !snapshot.managed
        {
            pending_events.push(PendingEvent {
                kind: EventKind::Normal,
                reason: reason.to_string(),
                message,
            });
        }

        inventory.status = Some(status);

        let ctx = InventoryContext { node, snapshot, now };
        let result = run_inventory_handlers(&self.handlers, &ctx, &mut inventory, &self.metrics).await?;

        if let Some(status) = inventory.status.as_ref() {
            self.metrics.set_inventory_condition(
                &node.name,
                condition::READY_FOR_POOLING,
                status.ready_for_pooling(),
            );
        }

        if inventory.status == before {
            debug!(node = %node.name, "Inventory status unchanged");
            return Ok(InventoryReconcileResult::done(inventory, result));
        }

        let changed = changed_conditions(before.as_ref(), inventory.status.as_ref());
        match conditional(self.store.patch_inventory_status(&inventory)).await? {
            WriteOutcome::Written(updated) => {
                if !changed.is_empty() {
                    info!(
                        node = %node.name,
                        phase = %updated.status.as_ref().map(|s| s.bootstrap.phase).unwrap_or_default(),
                        changed = ?changed,
                        "Inventory conditions changed"
                    );
                }
                let reference = updated.object_ref(&());
                for event in pending_events {
                    emit(
                        self.events.as_ref(),
                        &reference,
                        event.kind,
                        &event.reason,
                        &event.message,
                    )
                    .await;
                }
                Ok(InventoryReconcileResult::done(updated, result))
            }
            WriteOutcome::Conflict => {
                debug!(node = %node.name, "Inventory status conflict, requeueing");
                Ok(InventoryReconcileResult::conflict(Some(inventory)))
            }
        }
    }

    /// Recompute the per-state device gauges of a node
    pub fn update_device_metrics(&self, node: &str, devices: &[GPUDevice]) {
        let states: Vec<_> = devices.iter().map(GPUDevice::state).collect();
        self.metrics.update_device_metrics(node, &states);
    }
}

fn desired_inventory(node: &NodeInfo) -> GPUNodeState {
    let mut inventory = GPUNodeState::new(
        &node.name,
        GPUNodeStateSpec {
            node_name: node.name.clone(),
        },
    );
    inventory.metadata.owner_references = Some(vec![node_owner_reference(node)]);
    inventory
}

/// (complete, reason, message) for the InventoryComplete condition
fn inventory_complete(snapshot: &NodeSnapshot) -> (bool, &'static str, String) {
    if !snapshot.feature_detected {
        (
            false,
            reasons::NODE_FEATURE_MISSING,
            "node feature data has not been published".to_string(),
        )
    } else if snapshot.devices.is_empty() {
        (
            false,
            reasons::NO_DEVICES_DISCOVERED,
            "no NVIDIA GPU devices discovered".to_string(),
        )
    } else {
        (
            true,
            reasons::INVENTORY_SYNCED,
            format!("{} GPU device(s) discovered", snapshot.devices.len()),
        )
    }
}

fn device_mirror(devices: &[GPUDevice]) -> Vec<NodeDeviceStatus> {
    let mut mirror: Vec<NodeDeviceStatus> = devices
        .iter()
        .map(|device| {
            let status = device.status.clone().unwrap_or_default();
            NodeDeviceStatus {
                inventory_id: status.inventory_id,
                name: device.name().to_string(),
                index: device
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(DEVICE_INDEX_LABEL))
                    .cloned()
                    .unwrap_or_default(),
                product: status.hardware.product,
                uuid: status.hardware.uuid,
                state: status.state,
                auto_attach: status.auto_attach,
            }
        })
        .collect();
    mirror.sort_by(|a, b| a.name.cmp(&b.name));
    mirror
}

fn changed_conditions(before: Option<&GPUNodeStateStatus>, after: Option<&GPUNodeStateStatus>) -> Vec<String> {
    let Some(after) = after else {
        return Vec::new();
    };
    let empty = Vec::new();
    let previous = before.map(|s| &s.conditions).unwrap_or(&empty);
    after
        .conditions
        .iter()
        .filter(|c| {
            find_condition(previous, &c.r#type)
                .map(|p| p.status != c.status || p.reason != c.reason || p.message != c.message)
                .unwrap_or(true)
        })
        .map(|c| format!("{}={}/{}", c.r#type, c.status, c.reason))
        .collect()
}

/// Device records of a node that no longer match any snapshot device.
///
/// Without feature data and without any devices the snapshot is not
/// trusted, so nothing is reported.
pub fn orphaned_devices<'a>(node: &str, snapshot: &NodeSnapshot, devices: &'a [GPUDevice]) -> Vec<&'a GPUDevice> {
    if !snapshot.feature_detected && snapshot.devices.is_empty() {
        return Vec::new();
    }
    let expected: BTreeSet<String> = snapshot.devices.iter().map(|d| device_name(node, d)).collect();
    devices
        .iter()
        .filter(|device| !expected.contains(device.name()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::events::MemoryEventRecorder;
    use crate::controlplane::store::{MemoryStore, WriteOp};
    use crate::crd::{ConditionStatus, GPUDeviceState};
    use crate::test_utils::{device_record, device_snapshot, node_info, node_snapshot};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct Fixture {
        store: Arc<MemoryStore>,
        events: Arc<MemoryEventRecorder>,
        metrics: OperatorMetrics,
        reconciler: InventoryReconciler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventRecorder::new());
        let metrics = OperatorMetrics::new().unwrap();
        let reconciler = InventoryReconciler::new(store.clone(), events.clone(), metrics.clone());
        Fixture {
            store,
            events,
            metrics,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_no_record_for_node_without_devices() {
        let f = fixture();
        let node = node_info("node-a", BTreeMap::new());
        let snapshot = node_snapshot("node-a", vec![]);

        let result = f.reconciler.reconcile(&node, &snapshot, &[], Utc::now()).await.unwrap();
        assert!(result.inventory.is_none());
        assert_eq!(f.store.write_counts().total(), 0);
    }

    #[tokio::test]
    async fn test_feature_missing_scenario() {
        let f = fixture();
        let node = node_info("node-a", BTreeMap::new());
        let device = device_snapshot("0", "1db6");
        let mut snapshot = node_snapshot("node-a", vec![device.clone()]);
        snapshot.feature_detected = false;
        let devices = vec![device_record("node-a", &device, GPUDeviceState::Discovered)];

        f.reconciler
            .reconcile(&node, &snapshot, &devices, Utc::now())
            .await
            .unwrap();

        let stored = f.store.inventory("node-a").unwrap();
        let status = stored.status.unwrap();
        let cond = find_condition(&status.conditions, condition::INVENTORY_COMPLETE).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, reasons::NODE_FEATURE_MISSING);
        assert_eq!(status.devices[0].product, "Tesla V100 PCIe 32GB");
        assert_eq!(stored.spec.node_name, "node-a");
        assert_eq!(f.events.reasons(), vec![reasons::NODE_FEATURE_MISSING]);
    }

    #[tokio::test]
    async fn test_second_pass_is_write_and_event_free() {
        let f = fixture();
        let node = node_info("node-a", BTreeMap::new());
        let device = device_snapshot("0", "2330");
        let snapshot = node_snapshot("node-a", vec![device.clone()]);
        let devices = vec![device_record("node-a", &device, GPUDeviceState::Ready)];

        f.reconciler
            .reconcile(&node, &snapshot, &devices, Utc::now())
            .await
            .unwrap();
        assert_eq!(f.events.reasons(), vec![reasons::INVENTORY_SYNCED]);
        f.store.reset_write_counts();

        f.reconciler
            .reconcile(&node, &snapshot, &devices, Utc::now())
            .await
            .unwrap();
        assert_eq!(f.store.write_counts().total(), 0);
        assert_eq!(f.events.events().len(), 1);
        assert!(f.store.inventory("node-a").unwrap().status.unwrap().inventory_complete());
    }

    #[tokio::test]
    async fn test_status_conflict_requests_requeue() {
        let f = fixture();
        let node = node_info("node-a", BTreeMap::new());
        let device = device_snapshot("0", "2330");
        let snapshot = node_snapshot("node-a", vec![device.clone()]);
        let devices = vec![device_record("node-a", &device, GPUDeviceState::Ready)];
        f.store.inject_conflict(WriteOp::InventoryStatus);

        let result = f
            .reconciler
            .reconcile(&node, &snapshot, &devices, Utc::now())
            .await
            .unwrap();
        assert!(result.conflicted);
        assert_eq!(result.requeue_after, Some(CONFLICT_REQUEUE));
        // announced only once the status lands
        assert!(f.events.events().is_empty());
    }

    #[tokio::test]
    async fn test_unmanaged_node_sets_managed_disabled() {
        let f = fixture();
        let node = node_info("node-a", BTreeMap::new());
        let device = device_snapshot("0", "2330");
        let mut snapshot = node_snapshot("node-a", vec![device.clone()]);
        snapshot.managed = false;
        let devices = vec![device_record("node-a", &device, GPUDeviceState::Discovered)];

        f.reconciler
            .reconcile(&node, &snapshot, &devices, Utc::now())
            .await
            .unwrap();
        let status = f.store.inventory("node-a").unwrap().status.unwrap();
        assert!(status.managed_disabled());
        assert!(f.events.reasons().contains(&reasons::NODE_NOT_MANAGED.to_string()));
    }

    #[tokio::test]
    async fn test_spec_drift_is_repaired() {
        let f = fixture();
        let node = node_info("node-a", BTreeMap::new());
        f.store.seed_inventory(GPUNodeState::new(
            "node-a",
            GPUNodeStateSpec {
                node_name: "stale".into(),
            },
        ));
        let device = device_snapshot("0", "2330");
        let snapshot = node_snapshot("node-a", vec![device.clone()]);
        let devices = vec![device_record("node-a", &device, GPUDeviceState::Ready)];

        f.reconciler
            .reconcile(&node, &snapshot, &devices, Utc::now())
            .await
            .unwrap();
        let stored = f.store.inventory("node-a").unwrap();
        assert_eq!(stored.spec.node_name, "node-a");
        assert_eq!(f.store.write_counts().get(WriteOp::InventorySpec), 1);
    }

    #[test]
    fn test_update_device_metrics() {
        let f = fixture();
        let a = device_snapshot("0", "2330");
        let b = device_snapshot("1", "2330");
        let devices = vec![
            device_record("node-a", &a, GPUDeviceState::Ready),
            device_record("node-a", &b, GPUDeviceState::Faulted),
        ];
        f.reconciler.update_device_metrics("node-a", &devices);
        assert_eq!(f.metrics.node_device_count("node-a"), Some(2));
        assert_eq!(f.metrics.state_count("node-a", GPUDeviceState::Faulted), Some(1));

        f.reconciler.update_device_metrics("node-a", &devices[..1]);
        assert_eq!(f.metrics.state_count("node-a", GPUDeviceState::Faulted), None);
    }

    #[test]
    fn test_orphaned_devices() {
        let kept = device_snapshot("0", "2330");
        let gone = device_snapshot("1", "2330");
        let devices = vec![
            device_record("node-a", &kept, GPUDeviceState::Ready),
            device_record("node-a", &gone, GPUDeviceState::Ready),
        ];

        let snapshot = node_snapshot("node-a", vec![kept.clone()]);
        let orphans = orphaned_devices("node-a", &snapshot, &devices);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].name(), device_name("node-a", &gone));

        let mut untrusted = node_snapshot("node-a", vec![]);
        untrusted.feature_detected = false;
        assert!(orphaned_devices("node-a", &untrusted, &devices).is_empty());
    }
}
