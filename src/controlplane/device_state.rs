//! Device State Sync
//!
//! Propagates the node's readiness facets into each device's state.
//! `Assigned`, `Reserved` and `InUse` belong to the pool controller and are
//! only ever read here.

use async_trait::async_trait;
use kube::Resource;
use tracing::{debug, info};

use super::events::emit;
use super::handler::{HandlerResult, InventoryContext, InventoryHandler};
use super::store::{conditional, WriteOutcome};
use crate::crd::condition;
use crate::crd::{condition_is_true, GPUDeviceState, GPUNodeState};
use crate::domain::ports::{EventKind, EventRecorderRef, ResourceStoreRef};
use crate::error::{Result, CONFLICT_REQUEUE};

/// Event reason for a device entering `Faulted`
pub const DEVICE_FAULTED: &str = "DeviceFaulted";

/// Next state for a device given the node facets
pub fn desired_device_state(
    current: GPUDeviceState,
    driver_and_toolkit_ready: bool,
    infra_ready: bool,
    degraded_hard: bool,
) -> GPUDeviceState {
    use crate::crd::GPUDeviceState::*;

    match current {
        Assigned | Reserved | InUse => current,
        PendingAssignment if degraded_hard => Faulted,
        PendingAssignment => PendingAssignment,
        Ready if degraded_hard => Faulted,
        Ready if driver_and_toolkit_ready && !infra_ready => Validating,
        Ready => Ready,
        Faulted if degraded_hard => Faulted,
        Faulted if driver_and_toolkit_ready => Validating,
        Faulted => Faulted,
        Validating if degraded_hard => Faulted,
        Validating if infra_ready => Ready,
        Validating => Validating,
        Discovered if driver_and_toolkit_ready => Validating,
        Discovered => Discovered,
    }
}

/// Apply the auto-attach approval on top of the facet-driven state
fn with_approval(state: GPUDeviceState, auto_attach: bool) -> GPUDeviceState {
    match state {
        GPUDeviceState::Ready if auto_attach => GPUDeviceState::PendingAssignment,
        GPUDeviceState::PendingAssignment if !auto_attach => GPUDeviceState::Ready,
        other => other,
    }
}

/// Facets as read back from the inventory conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeFacets {
    driver_and_toolkit_ready: bool,
    infra_ready: bool,
    degraded_hard: bool,
}

impl NodeFacets {
    fn from_inventory(inventory: &GPUNodeState) -> Self {
        let conditions = inventory
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default();
        let driver = condition_is_true(conditions, condition::DRIVER_READY);
        let toolkit = condition_is_true(conditions, condition::TOOLKIT_READY);
        let monitoring = condition_is_true(conditions, condition::MONITORING_READY);
        let complete = condition_is_true(conditions, condition::INVENTORY_COMPLETE);

        Self {
            driver_and_toolkit_ready: driver && toolkit,
            infra_ready: driver && toolkit && monitoring,
            degraded_hard: complete && (!driver || !toolkit),
        }
    }
}

// =============================================================================
// Device State Sync Handler
// =============================================================================

pub struct DeviceStateSyncHandler {
    store: ResourceStoreRef,
    events: EventRecorderRef,
}

impl DeviceStateSyncHandler {
    pub fn new(store: ResourceStoreRef, events: EventRecorderRef) -> Self {
        Self { store, events }
    }
}

#[async_trait]
impl InventoryHandler for DeviceStateSyncHandler {
    fn name(&self) -> &'static str {
        "device-state-sync"
    }

    async fn handle(&self, ctx: &InventoryContext<'_>, inventory: &mut GPUNodeState) -> Result<HandlerResult> {
        let facets = NodeFacets::from_inventory(inventory);
        let devices = self.store.list_devices_by_node(&ctx.node.name).await?;
        let mut result = HandlerResult::done();

        for mut device in devices {
            let Some(status) = device.status.as_mut() else {
                continue;
            };
            let current = status.state;
            if current.is_externally_owned() {
                continue;
            }

            let next = with_approval(
                desired_device_state(
                    current,
                    facets.driver_and_toolkit_ready,
                    facets.infra_ready,
                    facets.degraded_hard,
                ),
                status.auto_attach,
            );
            if next == current {
                continue;
            }
            status.state = next;

            match conditional(self.store.patch_device_status(&device)).await? {
                WriteOutcome::Written(updated) => {
                    info!(
                        node = %ctx.node.name,
                        device = %updated.name(),
                        from = %current,
                        to = %next,
                        "Device state changed"
                    );
                    if next == GPUDeviceState::Faulted {
                        emit(
                            self.events.as_ref(),
                            &updated.object_ref(&()),
                            EventKind::Warning,
                            DEVICE_FAULTED,
                            &format!("driver or toolkit lost on node {}", ctx.node.name),
                        )
                        .await;
                    }
                    if let Some(inventory_status) = inventory.status.as_mut() {
                        if let Some(entry) = inventory_status
                            .devices
                            .iter_mut()
                            .find(|d| d.name == updated.name())
                        {
                            entry.state = next;
                        }
                    }
                }
                WriteOutcome::Conflict => {
                    debug!(device = %device.name(), "Device state conflict, requeueing");
                    result = result.merge(HandlerResult::requeue(CONFLICT_REQUEUE));
                }
            }
        }

        Ok(result)
    }
}
