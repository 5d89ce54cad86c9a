//! Reconcile Handlers
//!
//! Small capability traits the device and inventory reconcilers run in
//! order, once per pass, against the record they are about to persist.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::metrics::OperatorMetrics;
use crate::crd::{GPUDevice, GPUNodeState};
use crate::error::Result;
use crate::hardware::snapshot::{DeviceSnapshot, NodeInfo, NodeSnapshot};

// =============================================================================
// Handler Result
// =============================================================================

/// Scheduling hint returned by a handler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerResult {
    pub requeue_after: Option<Duration>,
}

impl HandlerResult {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    /// Combine two hints; the shortest requeue wins
    pub fn merge(self, other: HandlerResult) -> HandlerResult {
        let requeue_after = match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        HandlerResult { requeue_after }
    }
}

// =============================================================================
// Contexts
// =============================================================================

/// What a device handler may look at
#[derive(Debug, Clone, Copy)]
pub struct DeviceContext<'a> {
    pub node: &'a NodeInfo,
    pub snapshot: &'a DeviceSnapshot,
    pub managed: bool,
    pub now: DateTime<Utc>,
}

/// What an inventory handler may look at
#[derive(Debug, Clone, Copy)]
pub struct InventoryContext<'a> {
    pub node: &'a NodeInfo,
    pub snapshot: &'a NodeSnapshot,
    pub now: DateTime<Utc>,
}

// =============================================================================
// Handler Traits
// =============================================================================

/// Mutates a device record before its status is persisted
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &DeviceContext<'_>, device: &mut GPUDevice) -> Result<HandlerResult>;
}

/// Mutates an inventory record before its status is persisted
#[async_trait]
pub trait InventoryHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(
        &self,
        ctx: &InventoryContext<'_>,
        inventory: &mut GPUNodeState,
    ) -> Result<HandlerResult>;
}

pub type DeviceHandlerRef = Arc<dyn DeviceHandler>;
pub type InventoryHandlerRef = Arc<dyn InventoryHandler>;

// =============================================================================
// Runners
// =============================================================================

/// Run device handlers in order; the first failure stops the chain
pub async fn run_device_handlers(
    handlers: &[DeviceHandlerRef],
    ctx: &DeviceContext<'_>,
    device: &mut GPUDevice,
    metrics: &OperatorMetrics,
) -> Result<HandlerResult> {
    let mut result = HandlerResult::done();
    for handler in handlers {
        match handler.handle(ctx, device).await {
            Ok(r) => result = result.merge(r),
            Err(e) => {
                warn!(handler = handler.name(), device = %device.name(), error = %e, "Device handler failed");
                metrics.inc_handler_error(handler.name());
                return Err(e);
            }
        }
    }
    Ok(result)
}

/// Run inventory handlers in order; the first failure stops the chain
pub async fn run_inventory_handlers(
    handlers: &[InventoryHandlerRef],
    ctx: &InventoryContext<'_>,
    inventory: &mut GPUNodeState,
    metrics: &OperatorMetrics,
) -> Result<HandlerResult> {
    let mut result = HandlerResult::done();
    for handler in handlers {
        match handler.handle(ctx, inventory).await {
            Ok(r) => result = result.merge(r),
            Err(e) => {
                warn!(handler = handler.name(), node = %ctx.node.name, error = %e, "Inventory handler failed");
                metrics.inc_handler_error(handler.name());
                return Err(e);
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::GPUDeviceSpec;
    use crate::error::Error;

    struct Fixed(&'static str, Option<Duration>, bool);

    #[async_trait]
    impl DeviceHandler for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn handle(&self, _ctx: &DeviceContext<'_>, _device: &mut GPUDevice) -> Result<HandlerResult> {
            if self.2 {
                return Err(Error::Internal(format!("{} failed", self.0)));
            }
            Ok(HandlerResult {
                requeue_after: self.1,
            })
        }
    }

    #[test]
    fn test_merge_keeps_shortest() {
        let a = HandlerResult::requeue(Duration::from_secs(60));
        let b = HandlerResult::requeue(Duration::from_secs(15));
        assert_eq!(a.merge(b).requeue_after, Some(Duration::from_secs(15)));
        assert_eq!(a.merge(HandlerResult::done()).requeue_after, Some(Duration::from_secs(60)));
        assert_eq!(HandlerResult::done().merge(HandlerResult::done()).requeue_after, None);
    }

    #[tokio::test]
    async fn test_runner_merges_and_counts_failures() {
        let metrics = OperatorMetrics::new().unwrap();
        let node = NodeInfo::default();
        let snapshot = DeviceSnapshot::default();
        let ctx = DeviceContext {
            node: &node,
            snapshot: &snapshot,
            managed: true,
            now: Utc::now(),
        };
        let mut device = GPUDevice::new("dev", GPUDeviceSpec::default());

        let handlers: Vec<DeviceHandlerRef> = vec![
            Arc::new(Fixed("slow", Some(Duration::from_secs(60)), false)),
            Arc::new(Fixed("fast", Some(Duration::from_secs(5)), false)),
        ];
        let result = run_device_handlers(&handlers, &ctx, &mut device, &metrics).await.unwrap();
        assert_eq!(result.requeue_after, Some(Duration::from_secs(5)));

        let handlers: Vec<DeviceHandlerRef> = vec![
            Arc::new(Fixed("broken", None, true)),
            Arc::new(Fixed("never", None, true)),
        ];
        assert!(run_device_handlers(&handlers, &ctx, &mut device, &metrics).await.is_err());
        assert_eq!(metrics.handler_errors("broken"), 1);
        assert_eq!(metrics.handler_errors("never"), 0);
    }
}
