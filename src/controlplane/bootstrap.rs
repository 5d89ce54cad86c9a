//! Bootstrap Phase Engine
//!
//! Gates a node's GPUs until the support stack is healthy. Each pass probes
//! the feature-discovery agent, the validator and the monitoring pair,
//! derives the readiness facets, tracks validation retries for pending
//! devices, and writes the bootstrap phase plus the `ReadyForPooling`
//! condition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::handler::{HandlerResult, InventoryContext, InventoryHandler};
use crate::crd::condition::{self, reasons};
use crate::crd::{
    set_condition, BootstrapPhase, GPUDeviceState, GPUNodeState, GPUNodeStateStatus, ValidationAttempt,
    WorkloadStatus,
};
use crate::domain::ports::{HeartbeatSourceRef, WorkloadProbe, WorkloadProberRef};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// App names of the support workloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentNames {
    pub gfd: String,
    pub validator: String,
    pub dcgm: String,
    pub exporter: String,
}

impl Default for ComponentNames {
    fn default() -> Self {
        Self {
            gfd: "gpu-feature-discovery".to_string(),
            validator: "nvidia-operator-validator".to_string(),
            dcgm: "nvidia-dcgm".to_string(),
            exporter: "nvidia-dcgm-exporter".to_string(),
        }
    }
}

impl ComponentNames {
    /// Probe order
    pub fn all(&self) -> [&str; 4] {
        [&self.gfd, &self.validator, &self.dcgm, &self.exporter]
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub components: ComponentNames,
    /// Validation attempts before a device needs manual intervention
    pub max_attempts: u32,
    /// Minimum spacing between two attempts for one device
    pub retry_interval: Duration,
    /// Older exporter heartbeats mark monitoring unhealthy
    pub heartbeat_max_age: Duration,
    pub ready_requeue: Duration,
    pub not_ready_requeue: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            components: ComponentNames::default(),
            max_attempts: 5,
            retry_interval: Duration::from_secs(60),
            heartbeat_max_age: Duration::from_secs(120),
            ready_requeue: Duration::from_secs(60),
            not_ready_requeue: Duration::from_secs(15),
        }
    }
}

// =============================================================================
// Facets
// =============================================================================

/// Readiness dimensions derived from the probes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Facets {
    pub gfd_ready: bool,
    pub validator_ready: bool,
    pub driver_ready: bool,
    pub toolkit_ready: bool,
    pub dcgm_ready: bool,
    pub exporter_ready: bool,
    /// Exporter heartbeat present and older than the allowed age
    pub heartbeat_stale: bool,
    /// Driver and toolkit came from the validator's own report
    pub from_report: bool,
}

impl Facets {
    pub fn component_healthy(&self) -> bool {
        self.gfd_ready && self.validator_ready
    }

    pub fn monitoring_ready(&self) -> bool {
        self.dcgm_ready && self.exporter_ready && !self.heartbeat_stale
    }
}

/// Inputs of the phase derivation
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseInputs {
    pub managed_disabled: bool,
    pub inventory_complete: bool,
    /// Node cleared validation on some earlier pass
    pub validation_passed: bool,
    /// Some pending device was not pending on the previous pass
    pub newly_pending: bool,
    pub has_pending: bool,
    pub validator_ready: bool,
    pub gfd_ready: bool,
    pub monitoring_ready: bool,
}

/// Derive the bootstrap phase; earlier rules win.
///
/// Until a node first clears validation it is held in `Validating` while the
/// validator is down or devices are pending. Afterwards only newly pending
/// devices send it back, and a later pass falls through to the component
/// checks again.
pub fn derive_phase(input: &PhaseInputs) -> BootstrapPhase {
    if input.managed_disabled {
        return BootstrapPhase::Disabled;
    }
    if !input.inventory_complete {
        return BootstrapPhase::Validating;
    }
    if input.newly_pending && input.validation_passed && input.validator_ready {
        return BootstrapPhase::Validating;
    }
    if !input.validator_ready {
        return if input.validation_passed {
            BootstrapPhase::ValidatingFailed
        } else {
            BootstrapPhase::Validating
        };
    }
    if input.has_pending && !input.validation_passed {
        return BootstrapPhase::Validating;
    }
    if !input.gfd_ready {
        return BootstrapPhase::Gfd;
    }
    if !input.monitoring_ready {
        return BootstrapPhase::Monitoring;
    }
    BootstrapPhase::Ready
}

// =============================================================================
// Validation Tracking
// =============================================================================

/// Advance retry bookkeeping for the pending devices.
///
/// Entries of devices that left the pending set are pruned. Returns the
/// inventory ids whose budget is exhausted.
pub fn track_validations(
    validations: &mut Vec<ValidationAttempt>,
    pending: &[String],
    validator_ready: bool,
    now: DateTime<Utc>,
    config: &BootstrapConfig,
) -> Vec<String> {
    let mut tracked: BTreeMap<String, ValidationAttempt> = validations
        .drain(..)
        .filter(|v| pending.contains(&v.inventory_id))
        .map(|v| (v.inventory_id.clone(), v))
        .collect();

    let mut throttled = Vec::new();
    for id in pending {
        let entry = tracked.entry(id.clone()).or_insert_with(|| ValidationAttempt {
            inventory_id: id.clone(),
            ..Default::default()
        });

        let due = entry
            .last_failure
            .map(|at| {
                now.signed_duration_since(at)
                    .to_std()
                    .map(|elapsed| elapsed >= config.retry_interval)
                    .unwrap_or(false)
            })
            .unwrap_or(true);
        if validator_ready && entry.attempts < config.max_attempts && due {
            entry.attempts += 1;
            entry.last_failure = Some(now);
        }
        if entry.attempts >= config.max_attempts {
            throttled.push(id.clone());
        }
    }

    *validations = tracked.into_values().collect();
    throttled
}

// =============================================================================
// Pooling Condition
// =============================================================================

/// (ready, reason, message) for ReadyForPooling; first failing check wins
fn pooling_condition(
    status: &GPUNodeStateStatus,
    facets: &Facets,
    pending: &[String],
    throttled: &[String],
) -> (bool, &'static str, String) {
    if !status.hardware.present {
        return (false, reasons::NO_DEVICES, "no GPU devices present".into());
    }
    if status.managed_disabled() {
        return (false, reasons::NODE_DISABLED, "node is excluded from GPU management".into());
    }
    if !status.inventory_complete() {
        return (false, reasons::INVENTORY_PENDING, "inventory is not complete".into());
    }
    if !pending.is_empty() {
        return (false, reasons::DEVICES_PENDING, pending_message(pending.len(), throttled));
    }
    if !facets.driver_ready {
        return (false, reasons::DRIVER_NOT_DETECTED, "driver validation has not passed".into());
    }
    if !facets.toolkit_ready {
        return (false, reasons::TOOLKIT_NOT_READY, "container toolkit is not ready".into());
    }
    if !facets.component_healthy() {
        return (false, reasons::COMPONENT_PENDING, "support components are not healthy".into());
    }
    if !facets.monitoring_ready() {
        return (false, reasons::MONITORING_UNHEALTHY, "monitoring stack is not healthy".into());
    }
    let faulted: Vec<&str> = status
        .devices
        .iter()
        .filter(|d| d.state == GPUDeviceState::Faulted)
        .map(|d| d.inventory_id.as_str())
        .collect();
    if !faulted.is_empty() {
        return (
            false,
            reasons::DEVICES_FAULTED,
            format!("faulted devices: {}", faulted.join(", ")),
        );
    }
    (true, reasons::ALL_CHECKS_PASSED, "all readiness checks passed".into())
}

fn pending_message(count: usize, throttled: &[String]) -> String {
    let mut message = if count == 1 {
        "1 GPU device requires validation".to_string()
    } else {
        format!("{} GPU devices require validation", count)
    };
    if !throttled.is_empty() {
        message.push_str("; manual intervention required for ");
        message.push_str(&throttled.join(", "));
    }
    message
}

fn unhealthy_message(probes: &[&WorkloadProbe]) -> String {
    probes
        .iter()
        .filter(|p| !p.healthy)
        .map(|p| {
            if p.message.is_empty() {
                p.name.clone()
            } else {
                format!("{}: {}", p.name, p.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

// =============================================================================
// Workload Status Handler
// =============================================================================

/// Inventory handler running the bootstrap state machine
pub struct WorkloadStatusHandler {
    config: BootstrapConfig,
    prober: Option<WorkloadProberRef>,
    heartbeat: Option<HeartbeatSourceRef>,
}

impl WorkloadStatusHandler {
    pub fn new(config: BootstrapConfig) -> Self {
        Self {
            config,
            prober: None,
            heartbeat: None,
        }
    }

    pub fn with_prober(mut self, prober: WorkloadProberRef) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatSourceRef) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// Probe every component; all failures are collected.
    ///
    /// A timed out probe counts as an unhealthy workload so one hung pod
    /// cannot keep the pass from writing its conditions.
    async fn probe_all(
        &self,
        prober: &WorkloadProberRef,
        node: &str,
    ) -> Result<BTreeMap<String, WorkloadProbe>> {
        let mut probes = BTreeMap::new();
        let mut errors = Vec::new();
        for name in self.config.components.all() {
            match prober.probe(node, name).await {
                Ok(probe) => {
                    probes.insert(name.to_string(), probe);
                }
                Err(Error::ProbeTimeout { workload }) => {
                    warn!(node, workload = %workload, "Workload probe timed out, treating as unhealthy");
                    probes.insert(
                        name.to_string(),
                        WorkloadProbe {
                            name: name.to_string(),
                            healthy: false,
                            message: "probe timed out".to_string(),
                            pod_ip: None,
                        },
                    );
                }
                Err(e) => errors.push(e),
            }
        }
        Error::aggregate(errors)?;
        Ok(probes)
    }
}

#[async_trait]
impl InventoryHandler for WorkloadStatusHandler {
    fn name(&self) -> &'static str {
        "workload-status"
    }

    async fn handle(&self, ctx: &InventoryContext<'_>, inventory: &mut GPUNodeState) -> Result<HandlerResult> {
        let prober = self
            .prober
            .as_ref()
            .ok_or(Error::MissingDependency("workload prober"))?;
        let node = ctx.node.name.as_str();
        let components = &self.config.components;

        let probes = self.probe_all(prober, node).await?;
        let probe = |name: &str| probes.get(name).cloned().unwrap_or_default();
        let (gfd, validator, dcgm, exporter) = (
            probe(&components.gfd),
            probe(&components.validator),
            probe(&components.dcgm),
            probe(&components.exporter),
        );

        let report = if validator.healthy {
            match prober.validation_report(node).await {
                Ok(report) => report,
                Err(Error::ProbeTimeout { .. }) => {
                    warn!(node, "Validation report timed out, using validator health");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let mut facets = Facets {
            gfd_ready: gfd.healthy,
            validator_ready: validator.healthy,
            driver_ready: report.map(|r| r.driver_ready).unwrap_or(validator.healthy),
            toolkit_ready: report.map(|r| r.toolkit_ready).unwrap_or(validator.healthy),
            dcgm_ready: dcgm.healthy,
            exporter_ready: exporter.healthy,
            heartbeat_stale: false,
            from_report: report.is_some(),
        };

        let status = inventory.status.get_or_insert_with(Default::default);

        // A missing heartbeat signal falls back to "reachable now"
        if exporter.healthy {
            if let Some(source) = &self.heartbeat {
                match source.heartbeat(&exporter).await {
                    Some(at) => {
                        facets.heartbeat_stale = ctx
                            .now
                            .signed_duration_since(at)
                            .to_std()
                            .map(|age| age > self.config.heartbeat_max_age)
                            .unwrap_or(false);
                        status.monitoring.last_heartbeat = Some(at);
                    }
                    None => debug!(node, "Exporter heartbeat unavailable, treating exporter as live"),
                }
            }
        }

        let previous_phase = status.bootstrap.phase;
        // Records written before the marker existed carry the progress in the phase
        let validation_passed = status.bootstrap.validation_passed
            || previous_phase.has_passed_validation()
            || previous_phase == BootstrapPhase::ValidatingFailed;
        let previous_pending: BTreeSet<String> = status.bootstrap.pending_devices.iter().cloned().collect();
        let mut pending: Vec<String> = status
            .devices
            .iter()
            .filter(|d| d.state.needs_validation())
            .map(|d| d.inventory_id.clone())
            .collect();
        pending.sort();
        pending.dedup();
        let newly_pending = pending.iter().any(|id| !previous_pending.contains(id));

        let throttled = track_validations(
            &mut status.bootstrap.validations,
            &pending,
            facets.validator_ready,
            ctx.now,
            &self.config,
        );

        // Workload bookkeeping
        status.monitoring.dcgm_ready = facets.dcgm_ready;
        status.monitoring.exporter_ready = facets.exporter_ready;
        status.bootstrap.gfd_ready = facets.gfd_ready;
        status.bootstrap.toolkit_ready = facets.toolkit_ready;
        status.bootstrap.components = [&gfd, &validator, &dcgm, &exporter]
            .iter()
            .zip(components.all())
            .map(|(p, name)| (name.to_string(), p.healthy))
            .collect();
        status.bootstrap.workloads = [&gfd, &validator, &dcgm, &exporter]
            .iter()
            .zip(components.all())
            .map(|(p, name)| WorkloadStatus {
                name: name.to_string(),
                healthy: p.healthy,
                message: p.message.clone(),
            })
            .collect();
        status.bootstrap.validator_required = !pending.is_empty();
        status.bootstrap.pending_devices = pending.clone();

        // Facet conditions
        let mut changed = Vec::new();
        let (ready_reason, not_ready_reason) = if facets.from_report {
            (reasons::VALIDATION_PASSED, reasons::VALIDATION_FAILED)
        } else {
            (reasons::VALIDATOR_READY, reasons::VALIDATOR_NOT_READY)
        };
        for (kind, ready) in [
            (condition::DRIVER_READY, facets.driver_ready),
            (condition::TOOLKIT_READY, facets.toolkit_ready),
        ] {
            let reason = if ready { ready_reason } else { not_ready_reason };
            let message = if ready || validator.healthy {
                String::new()
            } else {
                validator.message.clone()
            };
            if set_condition(&mut status.conditions, kind, ready, reason, message, ctx.now) {
                changed.push(kind);
            }
        }

        let (reason, message) = if facets.component_healthy() {
            (reasons::COMPONENTS_READY, String::new())
        } else {
            (reasons::COMPONENTS_NOT_READY, unhealthy_message(&[&gfd, &validator]))
        };
        if set_condition(
            &mut status.conditions,
            condition::COMPONENTS_HEALTHY,
            facets.component_healthy(),
            reason,
            message,
            ctx.now,
        ) {
            changed.push(condition::COMPONENTS_HEALTHY);
        }

        let (reason, message) = if facets.monitoring_ready() {
            (reasons::MONITORING_HEALTHY, String::new())
        } else if facets.heartbeat_stale {
            (
                reasons::HEARTBEAT_STALE,
                format!(
                    "exporter heartbeat older than {}s",
                    self.config.heartbeat_max_age.as_secs()
                ),
            )
        } else {
            (reasons::MONITORING_UNHEALTHY, unhealthy_message(&[&dcgm, &exporter]))
        };
        if set_condition(
            &mut status.conditions,
            condition::MONITORING_READY,
            facets.monitoring_ready(),
            reason,
            message,
            ctx.now,
        ) {
            changed.push(condition::MONITORING_READY);
        }

        // Phase
        let phase = derive_phase(&PhaseInputs {
            managed_disabled: status.managed_disabled(),
            inventory_complete: status.inventory_complete(),
            validation_passed,
            newly_pending,
            has_pending: !pending.is_empty(),
            validator_ready: facets.validator_ready,
            gfd_ready: facets.gfd_ready,
            monitoring_ready: facets.monitoring_ready(),
        });
        status.bootstrap.phase = phase;
        status.bootstrap.validation_passed = validation_passed || phase.has_passed_validation();

        // Pooling, evaluated last
        let (ready, reason, message) = pooling_condition(status, &facets, &pending, &throttled);
        if set_condition(
            &mut status.conditions,
            condition::READY_FOR_POOLING,
            ready,
            reason,
            message,
            ctx.now,
        ) {
            changed.push(condition::READY_FOR_POOLING);
        }

        if previous_phase != phase || !changed.is_empty() {
            info!(
                node,
                phase = %phase,
                previous = %previous_phase,
                reason,
                changed = ?changed,
                "Bootstrap status updated"
            );
        }
        if !throttled.is_empty() {
            debug!(node, throttled = ?throttled, "Devices exhausted validation attempts");
        }

        Ok(HandlerResult::requeue(if ready {
            self.config.ready_requeue
        } else {
            self.config.not_ready_requeue
        }))
    }
}
