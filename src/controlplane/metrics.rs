//! Operator Metrics
//!
//! Prometheus gauges and counters kept in a private registry. Per-node
//! series are removed when the node or state goes away so cardinality stays
//! bounded by what currently exists.

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;

use crate::crd::GPUDeviceState;
use crate::error::{Error, Result};

/// Metrics exported by the engine
#[derive(Clone)]
pub struct OperatorMetrics {
    registry: Registry,
    node_devices: IntGaugeVec,
    devices_by_state: IntGaugeVec,
    inventory_condition: IntGaugeVec,
    handler_errors: IntCounterVec,
}

impl OperatorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let node_devices = IntGaugeVec::new(
            Opts::new("gpu_fleet_node_devices", "GPU devices discovered on a node"),
            &["node"],
        )?;
        let devices_by_state = IntGaugeVec::new(
            Opts::new(
                "gpu_fleet_node_devices_by_state",
                "GPU devices on a node by lifecycle state",
            ),
            &["node", "state"],
        )?;
        let inventory_condition = IntGaugeVec::new(
            Opts::new(
                "gpu_fleet_inventory_condition",
                "Inventory condition status (1 = True)",
            ),
            &["node", "condition"],
        )?;
        let handler_errors = IntCounterVec::new(
            Opts::new("gpu_fleet_handler_errors_total", "Handler failures"),
            &["handler"],
        )?;

        registry.register(Box::new(node_devices.clone()))?;
        registry.register(Box::new(devices_by_state.clone()))?;
        registry.register(Box::new(inventory_condition.clone()))?;
        registry.register(Box::new(handler_errors.clone()))?;

        Ok(Self {
            registry,
            node_devices,
            devices_by_state,
            inventory_condition,
            handler_errors,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Recompute the per-node device gauges from the current device states
    pub fn update_device_metrics(&self, node: &str, states: &[GPUDeviceState]) {
        self.node_devices
            .with_label_values(&[node])
            .set(states.len() as i64);

        let mut counts: BTreeMap<GPUDeviceState, i64> = BTreeMap::new();
        for state in states {
            *counts.entry(*state).or_default() += 1;
        }

        for state in GPUDeviceState::ALL {
            let label = state.to_string();
            match counts.get(&state) {
                Some(count) => self
                    .devices_by_state
                    .with_label_values(&[node, &label])
                    .set(*count),
                None => {
                    let _ = self.devices_by_state.remove_label_values(&[node, &label]);
                }
            }
        }
    }

    pub fn set_inventory_condition(&self, node: &str, condition: &str, value: bool) {
        self.inventory_condition
            .with_label_values(&[node, condition])
            .set(i64::from(value));
    }

    pub fn inc_handler_error(&self, handler: &str) {
        self.handler_errors.with_label_values(&[handler]).inc();
    }

    /// Drop every series belonging to a node
    pub fn remove_node(&self, node: &str, conditions: &[&str]) {
        let _ = self.node_devices.remove_label_values(&[node]);
        for state in GPUDeviceState::ALL {
            let _ = self
                .devices_by_state
                .remove_label_values(&[node, &state.to_string()]);
        }
        for condition in conditions {
            let _ = self.inventory_condition.remove_label_values(&[node, *condition]);
        }
    }

    /// Current device count gauge for a node, if the series exists
    pub fn node_device_count(&self, node: &str) -> Option<i64> {
        self.gauge_value("gpu_fleet_node_devices", &[("node", node)])
    }

    /// Current per-state gauge, if the series exists
    pub fn state_count(&self, node: &str, state: GPUDeviceState) -> Option<i64> {
        let state = state.to_string();
        self.gauge_value(
            "gpu_fleet_node_devices_by_state",
            &[("node", node), ("state", &state)],
        )
    }

    pub fn handler_errors(&self, handler: &str) -> u64 {
        self.handler_errors.with_label_values(&[handler]).get()
    }

    fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<i64> {
        self.registry
            .gather()
            .into_iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric().to_vec())
            .find(|metric| {
                labels.iter().all(|(key, value)| {
                    metric
                        .get_label()
                        .iter()
                        .any(|l| l.get_name() == *key && l.get_value() == *value)
                })
            })
            .map(|metric| metric.get_gauge().get_value() as i64)
    }

    /// Render in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics are not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_series_are_removed() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.update_device_metrics(
            "node-a",
            &[GPUDeviceState::Ready, GPUDeviceState::Ready, GPUDeviceState::Faulted],
        );
        assert_eq!(metrics.node_device_count("node-a"), Some(3));
        assert_eq!(metrics.state_count("node-a", GPUDeviceState::Ready), Some(2));
        assert_eq!(metrics.state_count("node-a", GPUDeviceState::Faulted), Some(1));

        metrics.update_device_metrics("node-a", &[GPUDeviceState::Ready]);
        assert_eq!(metrics.state_count("node-a", GPUDeviceState::Ready), Some(1));
        assert_eq!(metrics.state_count("node-a", GPUDeviceState::Faulted), None);
    }

    #[test]
    fn test_remove_node() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.update_device_metrics("node-a", &[GPUDeviceState::Validating]);
        metrics.set_inventory_condition("node-a", "InventoryComplete", true);
        metrics.remove_node("node-a", &["InventoryComplete"]);

        assert_eq!(metrics.node_device_count("node-a"), None);
        assert_eq!(metrics.state_count("node-a", GPUDeviceState::Validating), None);
        assert!(!metrics.encode().unwrap().contains("node-a"));
    }

    #[test]
    fn test_encode_contains_families() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.update_device_metrics("node-b", &[GPUDeviceState::Ready]);
        metrics.inc_handler_error("bootstrap");

        let text = metrics.encode().unwrap();
        assert!(text.contains("gpu_fleet_node_devices{node=\"node-b\"} 1"));
        assert!(text.contains("gpu_fleet_handler_errors_total{handler=\"bootstrap\"} 1"));
        assert_eq!(metrics.handler_errors("bootstrap"), 1);
    }
}
