//! Module Settings
//!
//! Cluster-wide settings for the GPU module: which nodes are managed, how
//! devices get approved for auto-attach, the default scheduling strategy and
//! the inventory resync period. Loaded from YAML, defaulted field by field
//! and validated before the engine sees them.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::hardware::approval::{DeviceApprovalMode, DeviceApprovalPolicy, SUPPORTED_OPERATORS};

// =============================================================================
// Settings
// =============================================================================

/// Top-level module settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSettings {
    #[serde(default)]
    pub managed_nodes: ManagedNodesSettings,

    #[serde(default)]
    pub device_approval: DeviceApprovalSettings,

    #[serde(default)]
    pub scheduling: SchedulingSettings,

    #[serde(default)]
    pub inventory: InventorySettings,
}

/// Which nodes the module manages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedNodesSettings {
    /// Node label whose boolean value opts a node in or out
    #[serde(default = "default_label_key")]
    pub label_key: String,

    /// Applies to nodes without the label
    #[serde(default = "default_true")]
    pub enabled_by_default: bool,
}

impl Default for ManagedNodesSettings {
    fn default() -> Self {
        Self {
            label_key: default_label_key(),
            enabled_by_default: true,
        }
    }
}

/// Auto-attach approval
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceApprovalSettings {
    #[serde(default)]
    pub mode: DeviceApprovalMode,

    /// Only consulted in Selector mode
    #[serde(default)]
    pub selector: Option<LabelSelector>,
}

impl DeviceApprovalSettings {
    /// Build the evaluator for these settings
    pub fn policy(&self) -> DeviceApprovalPolicy {
        DeviceApprovalPolicy::new(self.mode, self.selector.clone())
    }
}

/// Default placement strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingStrategy {
    #[default]
    BinPack,
    Spread,
}

impl std::fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingStrategy::BinPack => write!(f, "BinPack"),
            SchedulingStrategy::Spread => write!(f, "Spread"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingSettings {
    #[serde(default)]
    pub default_strategy: SchedulingStrategy,

    #[serde(default = "default_topology_key")]
    pub topology_key: String,
}

impl Default for SchedulingSettings {
    fn default() -> Self {
        Self {
            default_strategy: SchedulingStrategy::default(),
            topology_key: default_topology_key(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySettings {
    /// Duration string, e.g. `30s` or `1m30s`
    #[serde(default = "default_resync_period")]
    pub resync_period: String,
}

impl Default for InventorySettings {
    fn default() -> Self {
        Self {
            resync_period: default_resync_period(),
        }
    }
}

impl InventorySettings {
    pub fn resync(&self) -> Result<Duration> {
        parse_duration(&self.resync_period)
    }
}

// =============================================================================
// Loading & Validation
// =============================================================================

impl ModuleSettings {
    /// Parse settings from YAML and validate them
    pub fn from_yaml(text: &str) -> Result<Self> {
        let settings: ModuleSettings = serde_yaml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a file; a missing path yields the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Self::from_yaml(&text)
            }
            None => Ok(Self::default()),
        }
    }

    /// Reject settings the engine cannot act on
    pub fn validate(&self) -> Result<()> {
        if self.managed_nodes.label_key.trim().is_empty() {
            return Err(Error::Configuration(
                "managedNodes.labelKey must not be empty".into(),
            ));
        }

        if self.device_approval.mode == DeviceApprovalMode::Selector {
            if let Some(selector) = &self.device_approval.selector {
                for expr in selector.match_expressions.iter().flatten() {
                    if !SUPPORTED_OPERATORS.contains(&expr.operator.as_str()) {
                        return Err(Error::Configuration(format!(
                            "deviceApproval.selector: unsupported operator {:?} for key {}",
                            expr.operator, expr.key
                        )));
                    }
                }
            }
        }

        if self.scheduling.default_strategy == SchedulingStrategy::Spread
            && self.scheduling.topology_key.trim().is_empty()
        {
            return Err(Error::Configuration(
                "scheduling.topologyKey is required for the Spread strategy".into(),
            ));
        }

        let resync = self.inventory.resync()?;
        if resync.is_zero() {
            return Err(Error::Configuration(
                "inventory.resyncPeriod must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration such as `500ms`, `30s`, `5m`, `1h` or `1m30s`.
/// A bare integer is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let text = input.trim();
    if text.is_empty() {
        return Err(Error::DurationParse("empty duration".into()));
    }

    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(Error::DurationParse(format!("invalid duration {:?}", input)));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in {:?}", input)))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown unit {:?} in {:?}",
                    unit, input
                )))
            }
        };
    }

    Ok(total)
}

// =============================================================================
// Defaults
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_label_key() -> String {
    "gpu.billyronks.io/enabled".to_string()
}

fn default_topology_key() -> String {
    "topology.kubernetes.io/zone".to_string()
}

fn default_resync_period() -> String {
    "30s".to_string()
}
