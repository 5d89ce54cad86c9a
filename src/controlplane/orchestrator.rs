//! Orchestrator
//!
//! Runs one reconcile pass per node and drives those passes from a kube
//! `Controller` over `Node` objects:
//! - snapshot and detection fusion
//! - device records, orphan cleanup
//! - inventory, bootstrap phase and device states
//! - per-node metrics

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bootstrap::{BootstrapConfig, WorkloadStatusHandler};
use super::cleanup::CleanupService;
use super::device::{DeviceConditionsHandler, DeviceReconciler};
use super::device_state::DeviceStateSyncHandler;
use super::handler::HandlerResult;
use super::inventory::{orphaned_devices, InventoryReconciler};
use super::metrics::OperatorMetrics;
use crate::config::ModuleSettings;
use crate::crd::{GPUDevice, GPUNodeState};
use crate::domain::ports::{
    DetectionSourceRef, EventRecorderRef, HeartbeatSourceRef, ResourceStoreRef, WorkloadProberRef,
};
use crate::error::{Error, ErrorAction, Result};
use crate::hardware::approval::DeviceApprovalPolicy;
use crate::hardware::snapshot::{build_node_snapshot, NodeInfo};

/// Label NFD puts on NodeFeature objects to name their node
pub const NODE_FEATURE_NODE_LABEL: &str = "nfd.node.kubernetes.io/node-name";

// =============================================================================
// Orchestrator Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Nodes reconciled in parallel
    pub concurrency: u16,
    /// First backoff delay after a failed pass
    pub backoff_initial: Duration,
    /// Backoff ceiling
    pub backoff_max: Duration,
    pub bootstrap: BootstrapConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            bootstrap: BootstrapConfig::default(),
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Collects the collaborators before the handler chains are assembled
pub struct OrchestratorBuilder {
    settings: ModuleSettings,
    config: OrchestratorConfig,
    store: ResourceStoreRef,
    events: EventRecorderRef,
    metrics: OperatorMetrics,
    prober: Option<WorkloadProberRef>,
    heartbeat: Option<HeartbeatSourceRef>,
    detection: Option<DetectionSourceRef>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn prober(mut self, prober: WorkloadProberRef) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatSourceRef) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn detection(mut self, detection: DetectionSourceRef) -> Self {
        self.detection = Some(detection);
        self
    }

    /// Validate the settings and wire the reconcilers
    pub fn build(self) -> Result<Orchestrator> {
        self.settings.validate()?;
        let resync = self.settings.inventory.resync()?;

        let mut workload_status = WorkloadStatusHandler::new(self.config.bootstrap.clone());
        if let Some(prober) = self.prober {
            workload_status = workload_status.with_prober(prober);
        }
        if let Some(heartbeat) = self.heartbeat {
            workload_status = workload_status.with_heartbeat(heartbeat);
        }

        let devices = DeviceReconciler::new(self.store.clone(), self.events.clone(), self.metrics.clone())
            .with_handler(Arc::new(DeviceConditionsHandler));
        let inventory =
            InventoryReconciler::new(self.store.clone(), self.events.clone(), self.metrics.clone())
                .with_handler(Arc::new(workload_status))
                .with_handler(Arc::new(DeviceStateSyncHandler::new(
                    self.store.clone(),
                    self.events.clone(),
                )));

        Ok(Orchestrator {
            policy: self.settings.device_approval.policy(),
            settings: self.settings,
            config: self.config,
            resync,
            store: self.store.clone(),
            devices,
            inventory,
            cleanup: CleanupService::new(self.store, self.metrics.clone()),
            detection: self.detection,
            metrics: self.metrics,
            backoffs: DashMap::new(),
            ready: Arc::new(AtomicBool::new(false)),
        })
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    settings: ModuleSettings,
    config: OrchestratorConfig,
    policy: DeviceApprovalPolicy,
    resync: Duration,
    store: ResourceStoreRef,
    devices: DeviceReconciler,
    inventory: InventoryReconciler,
    cleanup: CleanupService,
    detection: Option<DetectionSourceRef>,
    metrics: OperatorMetrics,
    /// Failure backoff per node, dropped after the next clean pass
    backoffs: DashMap<String, ExponentialBackoff>,
    ready: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn builder(
        settings: ModuleSettings,
        store: ResourceStoreRef,
        events: EventRecorderRef,
        metrics: OperatorMetrics,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            settings,
            config: OrchestratorConfig::default(),
            store,
            events,
            metrics,
            prober: None,
            heartbeat: None,
            detection: None,
        }
    }

    pub fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    /// Flipped once the controller is running
    pub fn readiness(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// One full pass for a node; returns when to look at it again
    pub async fn reconcile_node(
        &self,
        node: &NodeInfo,
        features: Option<&BTreeMap<String, String>>,
        now: DateTime<Utc>,
    ) -> Result<Duration> {
        let snapshot = build_node_snapshot(node, features, &self.settings.managed_nodes);
        debug!(
            node = %node.name,
            devices = snapshot.devices.len(),
            managed = snapshot.managed,
            feature_detected = snapshot.feature_detected,
            "Built node snapshot"
        );

        let detection = match &self.detection {
            Some(source) if !snapshot.devices.is_empty() => source.fetch(node).await,
            _ => None,
        };

        let mut hint = HandlerResult::requeue(self.resync);
        let mut errors = Vec::new();
        for device in &snapshot.devices {
            match self
                .devices
                .reconcile(node, device, snapshot.managed, &self.policy, detection.as_ref(), now)
                .await
            {
                Ok(result) => {
                    hint = hint.merge(HandlerResult {
                        requeue_after: result.requeue_after,
                    })
                }
                Err(e) => {
                    warn!(node = %node.name, index = %device.index, error = %e, "Device reconcile failed");
                    errors.push(e);
                }
            }
        }
        Error::aggregate(errors)?;

        let mut devices = self.store.list_devices_by_node(&node.name).await?;
        let removed = {
            let orphans = orphaned_devices(&node.name, &snapshot, &devices);
            self.cleanup.remove_devices(&node.name, &orphans).await?
        };
        if removed > 0 {
            devices = self.store.list_devices_by_node(&node.name).await?;
        }

        if devices.is_empty() && snapshot.feature_detected && snapshot.devices.is_empty() {
            if self.store.get_inventory(&node.name).await?.is_some() {
                self.cleanup.remove_inventory(&node.name).await?;
            }
            self.inventory.update_device_metrics(&node.name, &devices);
            return Ok(self.resync);
        }

        let result = self.inventory.reconcile(node, &snapshot, &devices, now).await?;
        hint = hint.merge(HandlerResult {
            requeue_after: result.requeue_after,
        });

        // States may have moved inside the inventory handlers
        let devices = self.store.list_devices_by_node(&node.name).await?;
        self.inventory.update_device_metrics(&node.name, &devices);

        Ok(hint.requeue_after.unwrap_or(self.resync))
    }

    /// Remove everything recorded for a deleted node
    pub async fn node_removed(&self, node: &str) -> Result<()> {
        self.backoffs.remove(node);
        self.cleanup.node_removed(node).await
    }

    /// Requeue decision after a failed pass
    pub fn error_action(&self, node: &str, error: &Error) -> Action {
        match error.action() {
            ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
            ErrorAction::NoRequeue => Action::await_change(),
            ErrorAction::RequeueWithBackoff => {
                let mut backoff = self
                    .backoffs
                    .entry(node.to_string())
                    .or_insert_with(|| self.new_backoff());
                let delay = backoff.next_backoff().unwrap_or(self.config.backoff_max);
                Action::requeue(delay)
            }
        }
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.backoff_initial)
            .with_max_interval(self.config.backoff_max)
            .with_max_elapsed_time(None)
            .build()
    }

    fn pass_succeeded(&self, node: &str) {
        self.backoffs.remove(node);
    }

    // =========================================================================
    // Controller
    // =========================================================================

    /// Run until `token` is cancelled
    pub async fn run(self: Arc<Self>, client: Client, token: CancellationToken) -> Result<()> {
        let nodes: Api<Node> = Api::all(client.clone());
        let devices: Api<GPUDevice> = Api::all(client.clone());
        let inventories: Api<GPUNodeState> = Api::all(client.clone());

        let context = Arc::new(ControllerContext {
            orchestrator: self.clone(),
            features: NodeFeatureClient::new(client),
        });

        let deletions = tokio::spawn(watch_node_deletions(
            self.clone(),
            nodes.clone(),
            token.clone(),
        ));

        info!(
            concurrency = self.config.concurrency,
            resync_secs = self.resync.as_secs(),
            "Starting node controller"
        );
        self.ready.store(true, Ordering::SeqCst);

        Controller::new(nodes, watcher::Config::default())
            .owns(devices, watcher::Config::default())
            .owns(inventories, watcher::Config::default())
            .with_config(ControllerConfig::default().concurrency(self.config.concurrency))
            .graceful_shutdown_on(token.clone().cancelled_owned())
            .run(reconcile, error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok((node, _)) => debug!(node = %node.name, "Reconciled node"),
                    Err(e) => debug!(error = %e, "Controller event not reconciled"),
                }
            })
            .await;

        self.ready.store(false, Ordering::SeqCst);
        token.cancel();
        if let Err(e) = deletions.await {
            warn!(error = %e, "Node deletion watcher did not stop cleanly");
        }
        info!("Node controller stopped");
        Ok(())
    }
}

// =============================================================================
// Controller Plumbing
// =============================================================================

struct ControllerContext {
    orchestrator: Arc<Orchestrator>,
    features: NodeFeatureClient,
}

async fn reconcile(node: Arc<Node>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let info = NodeInfo::from_node(&node);
    let features = ctx.features.fetch(&info.name).await?;
    let requeue = ctx
        .orchestrator
        .reconcile_node(&info, features.as_ref(), Utc::now())
        .await?;
    ctx.orchestrator.pass_succeeded(&info.name);
    Ok(Action::requeue(requeue))
}

fn error_policy(node: Arc<Node>, error: &Error, ctx: Arc<ControllerContext>) -> Action {
    let name = node.name_any();
    error!(node = %name, error = %error, "Node reconcile failed");
    ctx.orchestrator.error_action(&name, error)
}

async fn watch_node_deletions(orchestrator: Arc<Orchestrator>, nodes: Api<Node>, token: CancellationToken) {
    let mut events = watcher(nodes, watcher::Config::default())
        .default_backoff()
        .boxed();

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.next() => event,
        };
        match event {
            Some(Ok(watcher::Event::Deleted(node))) => {
                let name = node.name_any();
                info!(node = %name, "Node deleted, removing GPU records");
                if let Err(e) = orchestrator.node_removed(&name).await {
                    error!(node = %name, error = %e, "Failed to clean up deleted node");
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => warn!(error = %e, "Node watch error"),
            None => break,
        }
    }
}

// =============================================================================
// NodeFeature
// =============================================================================

/// Reads NFD `NodeFeature` objects without a typed binding
pub struct NodeFeatureClient {
    api: Api<DynamicObject>,
}

impl NodeFeatureClient {
    pub fn new(client: Client) -> Self {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "nfd.k8s-sigs.io",
            "v1alpha1",
            "NodeFeature",
        ));
        Self {
            api: Api::all_with(client, &resource),
        }
    }

    /// Feature labels published for a node; `None` when there are none
    pub async fn fetch(&self, node: &str) -> Result<Option<BTreeMap<String, String>>> {
        let params = ListParams::default().labels(&format!("{}={}", NODE_FEATURE_NODE_LABEL, node));
        match self.api.list(&params).await {
            Ok(list) => Ok(merge_feature_labels(&list.items)),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!(node, "NodeFeature API not served");
                Ok(None)
            }
            Err(e) => Err(Error::from_kube(e, "NodeFeature", node)),
        }
    }
}

/// Union of `spec.labels` over a node's NodeFeature objects
pub fn merge_feature_labels(objects: &[DynamicObject]) -> Option<BTreeMap<String, String>> {
    let mut sorted: Vec<&DynamicObject> = objects.iter().collect();
    sorted.sort_by_key(|o| o.name_any());

    let mut labels = BTreeMap::new();
    for object in sorted {
        let Some(map) = object
            .data
            .get("spec")
            .and_then(|spec| spec.get("labels"))
            .and_then(|l| l.as_object())
        else {
            continue;
        };
        for (key, value) in map {
            if let Some(value) = value.as_str() {
                labels.insert(key.clone(), value.to_string());
            }
        }
    }

    if objects.is_empty() {
        None
    } else {
        Some(labels)
    }
}
