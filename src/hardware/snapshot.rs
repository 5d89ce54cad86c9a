//! Node and Device Snapshots
//!
//! Snapshots are rebuilt from node labels and node-feature labels on every
//! pass. Devices are described by label groups of the form
//! `gpu.billyronks.io/device.<index>.<field>`; one group per PCI function.

use k8s_openapi::api::core::v1::Node;
use std::collections::BTreeMap;
use tracing::debug;

use super::catalog;
use super::detection::normalize_mig_profiles;
use super::pci::{canonical_index, canonical_pci_address, normalize_hex_id, NVIDIA_VENDOR_ID};
use crate::config::ManagedNodesSettings;
use crate::crd::{ComputeCapability, GPUDeviceHardware, MigInfo, MigStrategy, PciIdentity, PcieLink};

/// Prefix of per-device label groups
pub const DEVICE_LABEL_PREFIX: &str = "gpu.billyronks.io/device.";

pub const DRIVER_MAJOR_LABEL: &str = "nvidia.com/cuda.driver.major";
pub const DRIVER_MINOR_LABEL: &str = "nvidia.com/cuda.driver.minor";
pub const DRIVER_REV_LABEL: &str = "nvidia.com/cuda.driver.rev";
pub const CUDA_MAJOR_LABEL: &str = "nvidia.com/cuda.runtime.major";
pub const CUDA_MINOR_LABEL: &str = "nvidia.com/cuda.runtime.minor";
pub const TOOLKIT_READY_LABEL: &str = "gpu.billyronks.io/toolkit.ready";

// =============================================================================
// Snapshot Types
// =============================================================================

/// The parts of a Node object the engine looks at
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    /// InternalIP, used to reach the detection sidecar
    pub address: Option<String>,
}

impl NodeInfo {
    pub fn from_node(node: &Node) -> Self {
        let address = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
            .map(|a| a.address.clone());

        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            uid: node.metadata.uid.clone().unwrap_or_default(),
            labels: node.metadata.labels.clone().unwrap_or_default(),
            address,
        }
    }
}

/// MIG data from labels
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigSnapshot {
    pub capable: bool,
    pub strategy: MigStrategy,
    pub profiles: Vec<String>,
    pub capacity: BTreeMap<String, u32>,
}

/// One GPU as seen in this pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSnapshot {
    /// Canonical index
    pub index: String,
    pub vendor: String,
    pub device: String,
    pub class: String,
    /// Raw address as published
    pub pci_address: String,
    pub product: String,
    pub uuid: String,
    pub memory_mib: u64,
    pub compute_major: u32,
    pub compute_minor: u32,
    pub numa_node: Option<i32>,
    pub power_limit_mw: Option<u64>,
    pub sm_count: Option<u32>,
    pub memory_bandwidth_mib: Option<u64>,
    pub pcie_generation: Option<u32>,
    pub pcie_width: Option<u32>,
    pub board: String,
    pub family: String,
    pub serial: String,
    pub pstate: String,
    pub display_mode: String,
    pub precision: Vec<String>,
    pub mig: MigSnapshot,
}

/// Driver as advertised on the node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverInfo {
    pub version: String,
    pub cuda_version: String,
    pub toolkit_ready: bool,
}

/// Everything known about a node's GPUs in this pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSnapshot {
    pub name: String,
    pub managed: bool,
    /// Node-feature data was observed at all
    pub feature_detected: bool,
    pub devices: Vec<DeviceSnapshot>,
    pub driver: DriverInfo,
}

// =============================================================================
// Snapshot Building
// =============================================================================

/// Build the snapshot for a node.
///
/// `features` are the labels of the node's NodeFeature object, if one exists.
pub fn build_node_snapshot(
    node: &NodeInfo,
    features: Option<&BTreeMap<String, String>>,
    settings: &ManagedNodesSettings,
) -> NodeSnapshot {
    let source = features.unwrap_or(&node.labels);

    let mut groups: BTreeMap<String, BTreeMap<&str, &str>> = BTreeMap::new();
    for (key, value) in source {
        let Some(rest) = key.strip_prefix(DEVICE_LABEL_PREFIX) else {
            continue;
        };
        let Some((index, field)) = rest.split_once('.') else {
            debug!(node = %node.name, label = %key, "Skipping device label without field");
            continue;
        };
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            debug!(node = %node.name, label = %key, "Skipping device label with invalid index");
            continue;
        }
        groups
            .entry(canonical_index(index))
            .or_default()
            .insert(field, value.as_str());
    }

    let mut devices: Vec<DeviceSnapshot> = groups
        .into_iter()
        .filter_map(|(index, fields)| match parse_device(&index, &fields) {
            Ok(Some(device)) => Some(device),
            Ok(None) => None,
            Err(reason) => {
                debug!(node = %node.name, index = %index, %reason, "Skipping malformed device");
                None
            }
        })
        .collect();
    devices.sort_by_key(|d| d.index.parse::<u64>().unwrap_or(u64::MAX));

    let lookup = |key: &str| -> Option<String> {
        features
            .and_then(|f| f.get(key))
            .or_else(|| node.labels.get(key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    NodeSnapshot {
        name: node.name.clone(),
        managed: is_managed(node, settings),
        feature_detected: features.is_some(),
        devices,
        driver: DriverInfo {
            version: join_version(&[
                lookup(DRIVER_MAJOR_LABEL),
                lookup(DRIVER_MINOR_LABEL),
                lookup(DRIVER_REV_LABEL),
            ]),
            cuda_version: join_version(&[lookup(CUDA_MAJOR_LABEL), lookup(CUDA_MINOR_LABEL)]),
            toolkit_ready: lookup(TOOLKIT_READY_LABEL)
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
        },
    }
}

/// Node opts in or out through the configured label, else the default applies
pub fn is_managed(node: &NodeInfo, settings: &ManagedNodesSettings) -> bool {
    node.labels
        .get(&settings.label_key)
        .and_then(|v| parse_bool(v))
        .unwrap_or(settings.enabled_by_default)
}

/// Ok(None) for non-NVIDIA functions, Err for malformed groups
fn parse_device(index: &str, fields: &BTreeMap<&str, &str>) -> Result<Option<DeviceSnapshot>, String> {
    let text = |name: &str| fields.get(name).map(|v| v.trim().to_string()).unwrap_or_default();

    let vendor = fields
        .get("vendor")
        .and_then(|v| normalize_hex_id(v))
        .ok_or("missing or invalid vendor")?;
    if vendor != NVIDIA_VENDOR_ID {
        return Ok(None);
    }
    let device = fields
        .get("device")
        .and_then(|v| normalize_hex_id(v))
        .ok_or("missing or invalid device id")?;
    let class = match fields.get("class") {
        Some(v) => normalize_hex_id(v).ok_or("invalid class")?,
        None => String::new(),
    };

    let mut product = text("product");
    if product.is_empty() {
        product = catalog::product_name(&device).unwrap_or_default().to_string();
    }

    let mig_profiles = fields
        .get("mig.profiles")
        .map(|v| normalize_mig_profiles(v.split('_')))
        .unwrap_or_default();
    let mut mig_capacity = BTreeMap::new();
    for (field, value) in fields.iter() {
        if let Some(profile) = field.strip_prefix("mig.capacity.") {
            let count: u32 = parse_number(Some(value), field)?.unwrap_or(0);
            for name in normalize_mig_profiles(std::iter::once(profile)) {
                mig_capacity.insert(name, count);
            }
        }
    }
    let mig_flag = fields.get("mig.capable").and_then(|v| parse_bool(v)).unwrap_or(false);

    Ok(Some(DeviceSnapshot {
        index: index.to_string(),
        vendor,
        device,
        class,
        pci_address: text("pci"),
        product,
        uuid: text("uuid"),
        memory_mib: parse_number(fields.get("memory-mib"), "memory-mib")?.unwrap_or(0),
        compute_major: parse_number(fields.get("compute.major"), "compute.major")?.unwrap_or(0),
        compute_minor: parse_number(fields.get("compute.minor"), "compute.minor")?.unwrap_or(0),
        numa_node: parse_number(fields.get("numa"), "numa")?,
        power_limit_mw: parse_number(fields.get("power-limit-mw"), "power-limit-mw")?,
        sm_count: parse_number(fields.get("sm-count"), "sm-count")?,
        memory_bandwidth_mib: parse_number(fields.get("mem-bandwidth"), "mem-bandwidth")?,
        pcie_generation: parse_number(fields.get("pcie.gen"), "pcie.gen")?,
        pcie_width: parse_number(fields.get("pcie.width"), "pcie.width")?,
        board: text("board"),
        family: text("family"),
        serial: text("serial"),
        pstate: text("pstate"),
        display_mode: text("display-mode"),
        precision: split_sorted(fields.get("precision").copied().unwrap_or_default()),
        mig: MigSnapshot {
            capable: mig_flag || !mig_profiles.is_empty(),
            strategy: fields
                .get("mig.strategy")
                .and_then(|v| MigStrategy::parse(v))
                .unwrap_or_default(),
            profiles: mig_profiles,
            capacity: mig_capacity,
        },
    }))
}

fn parse_number<T: std::str::FromStr>(value: Option<&&str>, field: &str) -> Result<Option<T>, String> {
    match value.map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("invalid {field}: {v:?}")),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "enabled" => Some(true),
        "false" | "0" | "no" | "disabled" => Some(false),
        _ => None,
    }
}

fn split_sorted(value: &str) -> Vec<String> {
    let mut items: Vec<String> = value
        .split('_')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    items.sort();
    items.dedup();
    items
}

fn join_version(parts: &[Option<String>]) -> String {
    if parts.first().and_then(|p| p.as_ref()).is_none() {
        return String::new();
    }
    parts
        .iter()
        .map_while(|p| p.as_deref())
        .collect::<Vec<_>>()
        .join(".")
}

// =============================================================================
// Identity
// =============================================================================

/// Resource name for a device, stable for a given (node, index, vendor, device)
pub fn device_name(node: &str, device: &DeviceSnapshot) -> String {
    let raw = format!("{}-{}-{}-{}", node, device.index, device.vendor, device.device);
    let mut name: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    name.truncate(253);
    name.trim_matches(|c| c == '-' || c == '.').to_string()
}

/// Inventory id, stable for a given (node, vendor, device, index)
pub fn inventory_id(node: &str, device: &DeviceSnapshot) -> String {
    let key = format!("{}/{}/{}/{}", node, device.vendor, device.device, device.index);
    format!("{}-{:012x}", node, fnv1a64(key.as_bytes()) & 0xffff_ffff_ffff)
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

// =============================================================================
// Hardware Mapping
// =============================================================================

impl DeviceSnapshot {
    /// Hardware block for a device record, PCI address canonicalized
    pub fn hardware(&self) -> GPUDeviceHardware {
        GPUDeviceHardware {
            pci: PciIdentity {
                vendor: self.vendor.clone(),
                device: self.device.clone(),
                class: self.class.clone(),
                address: canonical_pci_address(&self.pci_address),
            },
            product: self.product.clone(),
            uuid: self.uuid.clone(),
            memory_mib: self.memory_mib,
            compute_capability: ComputeCapability {
                major: self.compute_major,
                minor: self.compute_minor,
            },
            numa_node: self.numa_node,
            power_limit_mw: self.power_limit_mw,
            sm_count: self.sm_count,
            memory_bandwidth_mib: self.memory_bandwidth_mib,
            pcie: match (self.pcie_generation, self.pcie_width) {
                (None, None) => None,
                (generation, width) => Some(PcieLink {
                    generation: generation.unwrap_or(0),
                    width: width.unwrap_or(0),
                }),
            },
            board: self.board.clone(),
            family: self.family.clone(),
            serial: self.serial.clone(),
            pstate: self.pstate.clone(),
            display_mode: self.display_mode.clone(),
            precision: self.precision.clone(),
            mig: MigInfo {
                capable: self.mig.capable,
                strategy: self.mig.strategy,
                profiles_supported: self.mig.profiles.clone(),
                capacity: self.mig.capacity.clone(),
            },
        }
    }
}

/// Merge freshly observed hardware into a stored record.
/// Only non-empty observed values overwrite.
pub fn merge_hardware(target: &mut GPUDeviceHardware, observed: &GPUDeviceHardware) {
    fn text(target: &mut String, value: &str) {
        if !value.is_empty() {
            *target = value.to_string();
        }
    }
    fn opt<T: Copy>(target: &mut Option<T>, value: Option<T>) {
        if value.is_some() {
            *target = value;
        }
    }

    text(&mut target.pci.vendor, &observed.pci.vendor);
    text(&mut target.pci.device, &observed.pci.device);
    text(&mut target.pci.class, &observed.pci.class);
    text(&mut target.pci.address, &observed.pci.address);
    text(&mut target.product, &observed.product);
    text(&mut target.uuid, &observed.uuid);
    if observed.memory_mib > 0 {
        target.memory_mib = observed.memory_mib;
    }
    if observed.compute_capability.is_set() {
        target.compute_capability = observed.compute_capability;
    }
    opt(&mut target.numa_node, observed.numa_node);
    opt(&mut target.power_limit_mw, observed.power_limit_mw);
    opt(&mut target.sm_count, observed.sm_count);
    opt(&mut target.memory_bandwidth_mib, observed.memory_bandwidth_mib);
    opt(&mut target.pcie, observed.pcie);
    text(&mut target.board, &observed.board);
    text(&mut target.family, &observed.family);
    text(&mut target.serial, &observed.serial);
    text(&mut target.pstate, &observed.pstate);
    text(&mut target.display_mode, &observed.display_mode);
    if !observed.precision.is_empty() {
        target.precision = observed.precision.clone();
    }
    if observed.mig.capable {
        target.mig.capable = true;
    }
    if observed.mig.strategy != MigStrategy::None {
        target.mig.strategy = observed.mig.strategy;
    }
    if !observed.mig.profiles_supported.is_empty() {
        target.mig.profiles_supported = observed.mig.profiles_supported.clone();
    }
    if !observed.mig.capacity.is_empty() {
        target.mig.capacity = observed.mig.capacity.clone();
    }
    target.pci.address = canonical_pci_address(&target.pci.address);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{device_labels, node_info};

    #[test]
    fn test_catalog_fallback_without_features() {
        let node = node_info(
            "node-a",
            device_labels(0, &[("vendor", "10de"), ("device", "1db6"), ("class", "0302")]),
        );
        let snapshot = build_node_snapshot(&node, None, &ManagedNodesSettings::default());

        assert!(!snapshot.feature_detected);
        assert!(snapshot.managed);
        assert_eq!(snapshot.devices.len(), 1);
        let device = &snapshot.devices[0];
        assert_eq!(device.index, "0");
        assert_eq!(device.product, "Tesla V100 PCIe 32GB");
        assert_eq!(device.class, "0302");
    }

    #[test]
    fn test_features_take_precedence_over_node_labels() {
        let node = node_info(
            "node-a",
            device_labels(0, &[("vendor", "10de"), ("device", "1db6")]),
        );
        let features = device_labels(
            0,
            &[("vendor", "0x10DE"), ("device", "20B5"), ("product", "A100 PCIe 80GB")],
        );
        let snapshot = build_node_snapshot(&node, Some(&features), &ManagedNodesSettings::default());

        assert!(snapshot.feature_detected);
        assert_eq!(snapshot.devices[0].device, "20b5");
        assert_eq!(snapshot.devices[0].product, "A100 PCIe 80GB");
    }

    #[test]
    fn test_skips_foreign_and_malformed_devices() {
        let mut labels = device_labels(0, &[("vendor", "10de"), ("device", "2330")]);
        labels.extend(device_labels(1, &[("vendor", "8086"), ("device", "0b25")]));
        labels.extend(device_labels(2, &[("vendor", "10de")]));
        labels.extend(device_labels(3, &[("vendor", "10de"), ("device", "2330"), ("memory-mib", "lots")]));
        labels.insert("gpu.billyronks.io/device.x.vendor".into(), "10de".into());

        let snapshot = build_node_snapshot(&node_info("node-a", labels), None, &ManagedNodesSettings::default());
        let indexes: Vec<_> = snapshot.devices.iter().map(|d| d.index.as_str()).collect();
        assert_eq!(indexes, vec!["0"]);
    }

    #[test]
    fn test_index_canonicalization_and_ordering() {
        let mut labels = device_labels(10, &[("vendor", "10de"), ("device", "2330")]);
        labels.insert("gpu.billyronks.io/device.002.vendor".into(), "10de".into());
        labels.insert("gpu.billyronks.io/device.002.device".into(), "2330".into());

        let snapshot = build_node_snapshot(&node_info("node-a", labels), None, &ManagedNodesSettings::default());
        let indexes: Vec<_> = snapshot.devices.iter().map(|d| d.index.as_str()).collect();
        assert_eq!(indexes, vec!["2", "10"]);
    }

    #[test]
    fn test_lists_and_mig() {
        let labels = device_labels(
            0,
            &[
                ("vendor", "10de"),
                ("device", "20b2"),
                ("precision", "fp32_fp16_fp32_bf16"),
                ("mig.profiles", "MIG-1g.10gb_2g.20gb_1g.10gb"),
                ("mig.strategy", "mixed"),
                ("mig.capacity.1g.10gb", "7"),
            ],
        );
        let snapshot = build_node_snapshot(&node_info("node-a", labels), None, &ManagedNodesSettings::default());
        let device = &snapshot.devices[0];

        assert_eq!(device.precision, vec!["bf16", "fp16", "fp32"]);
        assert_eq!(device.mig.profiles, vec!["1g.10gb", "2g.20gb"]);
        assert!(device.mig.capable);
        assert_eq!(device.mig.strategy, MigStrategy::Mixed);
        assert_eq!(device.mig.capacity.get("1g.10gb"), Some(&7));
    }

    #[test]
    fn test_driver_and_managed() {
        let mut labels = BTreeMap::new();
        labels.insert(DRIVER_MAJOR_LABEL.to_string(), "550".to_string());
        labels.insert(DRIVER_MINOR_LABEL.to_string(), "54".to_string());
        labels.insert(DRIVER_REV_LABEL.to_string(), "15".to_string());
        labels.insert(CUDA_MAJOR_LABEL.to_string(), "12".to_string());
        labels.insert(CUDA_MINOR_LABEL.to_string(), "4".to_string());
        labels.insert(TOOLKIT_READY_LABEL.to_string(), "true".to_string());
        labels.insert("gpu.billyronks.io/enabled".to_string(), "false".to_string());

        let snapshot = build_node_snapshot(&node_info("node-a", labels), None, &ManagedNodesSettings::default());
        assert_eq!(snapshot.driver.version, "550.54.15");
        assert_eq!(snapshot.driver.cuda_version, "12.4");
        assert!(snapshot.driver.toolkit_ready);
        assert!(!snapshot.managed);

        let settings = ManagedNodesSettings {
            label_key: "gpu.billyronks.io/enabled".into(),
            enabled_by_default: false,
        };
        let snapshot = build_node_snapshot(&node_info("node-b", BTreeMap::new()), None, &settings);
        assert!(!snapshot.managed);
        assert!(snapshot.driver.version.is_empty());
    }

    #[test]
    fn test_identity_is_stable_across_mutable_fields() {
        let base = DeviceSnapshot {
            index: "3".into(),
            vendor: "10de".into(),
            device: "2330".into(),
            ..Default::default()
        };
        let mut changed = base.clone();
        changed.pstate = "P8".into();
        changed.power_limit_mw = Some(700_000);
        changed.uuid = "GPU-1234".into();

        assert_eq!(device_name("Node-A", &base), "node-a-3-10de-2330");
        assert_eq!(device_name("Node-A", &base), device_name("Node-A", &changed));
        assert_eq!(inventory_id("node-a", &base), inventory_id("node-a", &changed));
        assert_ne!(inventory_id("node-a", &base), inventory_id("node-b", &base));

        let id = inventory_id("node-a", &base);
        assert!(id.starts_with("node-a-"));
        assert_eq!(id.len(), "node-a-".len() + 12);
    }

    #[test]
    fn test_merge_hardware_keeps_values_on_empty_input() {
        let mut stored = GPUDeviceHardware::default();
        stored.product = "H100 SXM5 80GB".into();
        stored.pci.address = "0000:3b:00.0".into();
        stored.memory_mib = 81559;

        let observed = GPUDeviceHardware {
            serial: "1650123".into(),
            ..Default::default()
        };
        merge_hardware(&mut stored, &observed);

        assert_eq!(stored.product, "H100 SXM5 80GB");
        assert_eq!(stored.memory_mib, 81559);
        assert_eq!(stored.serial, "1650123");
        assert_eq!(stored.pci.address, "0000:3b:00.0");
    }
}
