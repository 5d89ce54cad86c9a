//! Device Reconciler
//!
//! Owns one `GPUDevice` per physical GPU. Each pass syncs identifying
//! labels and the node owner reference, merges snapshot and detection data
//! into the hardware block, applies the approval policy, runs the device
//! handlers and persists status only when it actually changed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::time::Duration;
use tracing::{debug, info};

use super::events::emit;
use super::handler::{run_device_handlers, DeviceContext, DeviceHandler, DeviceHandlerRef, HandlerResult};
use super::metrics::OperatorMetrics;
use super::store::{conditional, WriteOutcome};
use crate::crd::condition::{self, reasons};
use crate::crd::{set_condition, GPUDevice, GPUDeviceSpec, DEVICE_INDEX_LABEL, NODE_LABEL};
use crate::domain::ports::{EventKind, EventRecorderRef, ResourceStoreRef};
use crate::error::{Error, Result, CONFLICT_REQUEUE};
use crate::hardware::approval::{approval_labels, DeviceApprovalPolicy};
use crate::hardware::detection::{apply_detection_hardware, DetectionSet};
use crate::hardware::snapshot::{device_name, inventory_id, merge_hardware, DeviceSnapshot, NodeInfo};

/// Event reason for a newly created device record
pub const DEVICE_DETECTED: &str = "DeviceDetected";

/// Owner reference pointing at the node
pub fn node_owner_reference(node: &NodeInfo) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Node".to_string(),
        name: node.name.clone(),
        uid: node.uid.clone(),
        controller: Some(true),
        block_owner_deletion: None,
    }
}

pub(crate) fn has_owner(owners: Option<&Vec<OwnerReference>>, wanted: &OwnerReference) -> bool {
    owners
        .map(|refs| {
            refs.iter()
                .any(|r| r.kind == wanted.kind && r.name == wanted.name && r.uid == wanted.uid)
        })
        .unwrap_or(false)
}

// =============================================================================
// Reconcile Result
// =============================================================================

/// Outcome of one device pass
#[derive(Debug, Clone)]
pub struct DeviceReconcileResult {
    pub device: GPUDevice,
    /// A conditional write lost the optimistic lock
    pub conflicted: bool,
    pub requeue_after: Option<Duration>,
}

impl DeviceReconcileResult {
    fn done(device: GPUDevice, result: HandlerResult) -> Self {
        Self {
            device,
            conflicted: false,
            requeue_after: result.requeue_after,
        }
    }

    fn conflict(device: GPUDevice) -> Self {
        Self {
            device,
            conflicted: true,
            requeue_after: Some(CONFLICT_REQUEUE),
        }
    }
}

// =============================================================================
// Device Reconciler
// =============================================================================

pub struct DeviceReconciler {
    store: ResourceStoreRef,
    events: EventRecorderRef,
    metrics: OperatorMetrics,
    handlers: Vec<DeviceHandlerRef>,
}

impl DeviceReconciler {
    pub fn new(store: ResourceStoreRef, events: EventRecorderRef, metrics: OperatorMetrics) -> Self {
        Self {
            store,
            events,
            metrics,
            handlers: Vec::new(),
        }
    }

    /// Append a handler; handlers run in registration order
    pub fn with_handler(mut self, handler: DeviceHandlerRef) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Reconcile one device of a node
    pub async fn reconcile(
        &self,
        node: &NodeInfo,
        snapshot: &DeviceSnapshot,
        managed: bool,
        policy: &DeviceApprovalPolicy,
        detection: Option<&DetectionSet>,
        now: DateTime<Utc>,
    ) -> Result<DeviceReconcileResult> {
        if snapshot.index.is_empty() {
            return Err(Error::Internal(format!(
                "device snapshot on {} has no index",
                node.name
            )));
        }

        let name = device_name(&node.name, snapshot);
        let desired = self.desired_device(node, snapshot, &name);

        let mut device = match self.store.get_device(&name).await? {
            None => match conditional(self.store.create_device(&desired)).await? {
                WriteOutcome::Written(created) => {
                    info!(node = %node.name, device = %name, index = %snapshot.index, "Created GPU device");
                    emit(
                        self.events.as_ref(),
                        &created.object_ref(&()),
                        EventKind::Normal,
                        DEVICE_DETECTED,
                        &format!(
                            "GPU {} ({}) detected on node {}",
                            snapshot.index,
                            display_product(snapshot),
                            node.name
                        ),
                    )
                    .await;
                    created
                }
                WriteOutcome::Conflict => {
                    debug!(device = %name, "Device was created concurrently, requeueing");
                    return Ok(DeviceReconcileResult::conflict(desired));
                }
            },
            Some(existing) => match self.sync_metadata(existing, &desired).await? {
                Some(current) => current,
                None => return Ok(DeviceReconcileResult::conflict(desired)),
            },
        };

        let before = device.status.clone();
        let mut status = before.clone().unwrap_or_default();
        status.node_name = node.name.clone();
        status.inventory_id = inventory_id(&node.name, snapshot);
        status.managed = managed;
        merge_hardware(&mut status.hardware, &snapshot.hardware());

        if let Some(entry) = detection.and_then(|set| set.find(&status.hardware.uuid, &snapshot.index)) {
            apply_detection_hardware(&mut status.hardware, &mut status.health, entry);
        }

        let labels = approval_labels(&node.labels, &status.hardware);
        status.auto_attach = policy.auto_attach(managed, &labels);
        device.status = Some(status);

        let ctx = DeviceContext {
            node,
            snapshot,
            managed,
            now,
        };
        let result = run_device_handlers(&self.handlers, &ctx, &mut device, &self.metrics).await?;

        if device.status == before {
            debug!(device = %name, "Device status unchanged");
            return Ok(DeviceReconcileResult::done(device, result));
        }

        match conditional(self.store.patch_device_status(&device)).await? {
            WriteOutcome::Written(updated) => {
                debug!(device = %name, "Updated device status");
                Ok(DeviceReconcileResult::done(updated, result))
            }
            WriteOutcome::Conflict => {
                debug!(device = %name, "Device status conflict, requeueing");
                Ok(DeviceReconcileResult::conflict(device))
            }
        }
    }

    fn desired_device(&self, node: &NodeInfo, snapshot: &DeviceSnapshot, name: &str) -> GPUDevice {
        let mut device = GPUDevice::new(name, GPUDeviceSpec::default());
        let labels = device.labels_mut();
        labels.insert(NODE_LABEL.to_string(), node.name.clone());
        labels.insert(DEVICE_INDEX_LABEL.to_string(), snapshot.index.clone());
        device.metadata.owner_references = Some(vec![node_owner_reference(node)]);
        device
    }

    /// Bring labels and owner reference in line, then refetch.
    /// `None` means the write conflicted or the record vanished.
    async fn sync_metadata(&self, existing: GPUDevice, desired: &GPUDevice) -> Result<Option<GPUDevice>> {
        let labels_ok = desired
            .labels()
            .iter()
            .all(|(k, v)| existing.labels().get(k) == Some(v));
        let owner_ok = desired
            .metadata
            .owner_references
            .iter()
            .flatten()
            .all(|owner| has_owner(existing.metadata.owner_references.as_ref(), owner));

        if labels_ok && owner_ok {
            return Ok(Some(existing));
        }

        let mut patched = existing.clone();
        for (k, v) in desired.labels() {
            patched.labels_mut().insert(k.clone(), v.clone());
        }
        let mut owners = patched.metadata.owner_references.take().unwrap_or_default();
        for owner in desired.metadata.owner_references.iter().flatten() {
            if !has_owner(Some(&owners), owner) {
                owners.retain(|o| o.kind != owner.kind || o.name != owner.name);
                owners.push(owner.clone());
            }
        }
        patched.metadata.owner_references = Some(owners);

        if conditional(self.store.patch_device_metadata(&patched)).await?.is_conflict() {
            debug!(device = %existing.name(), "Device metadata conflict, requeueing");
            return Ok(None);
        }
        debug!(device = %existing.name(), "Synced device metadata");
        self.store.get_device(existing.name()).await
    }
}

fn display_product(snapshot: &DeviceSnapshot) -> &str {
    if snapshot.product.is_empty() {
        "unknown product"
    } else {
        &snapshot.product
    }
}

// =============================================================================
// Device Conditions Handler
// =============================================================================

/// Maintains the `Managed` and `HardwareIdentified` conditions
pub struct DeviceConditionsHandler;

#[async_trait]
impl DeviceHandler for DeviceConditionsHandler {
    fn name(&self) -> &'static str {
        "device-conditions"
    }

    async fn handle(&self, ctx: &DeviceContext<'_>, device: &mut GPUDevice) -> Result<HandlerResult> {
        let Some(status) = device.status.as_mut() else {
            return Ok(HandlerResult::done());
        };

        if ctx.managed {
            set_condition(
                &mut status.conditions,
                condition::DEVICE_MANAGED,
                true,
                reasons::MANAGED_BY_NODE,
                format!("node {} is managed", ctx.node.name),
                ctx.now,
            );
        } else {
            set_condition(
                &mut status.conditions,
                condition::DEVICE_MANAGED,
                false,
                reasons::NODE_UNMANAGED,
                format!("node {} is not managed", ctx.node.name),
                ctx.now,
            );
        }

        let hardware = &status.hardware;
        let missing: Vec<&str> = [
            ("vendor", hardware.pci.vendor.is_empty()),
            ("device", hardware.pci.device.is_empty()),
            ("product", hardware.product.is_empty()),
        ]
        .into_iter()
        .filter(|(_, empty)| *empty)
        .map(|(field, _)| field)
        .collect();

        if missing.is_empty() {
            set_condition(
                &mut status.conditions,
                condition::HARDWARE_IDENTIFIED,
                true,
                reasons::IDENTITY_COMPLETE,
                "",
                ctx.now,
            );
        } else {
            let message = format!("missing {}", missing.join(", "));
            set_condition(
                &mut status.conditions,
                condition::HARDWARE_IDENTIFIED,
                false,
                reasons::IDENTITY_INCOMPLETE,
                message,
                ctx.now,
            );
        }

        Ok(HandlerResult::done())
    }
}
