//! GPU Product Catalog
//!
//! Static PCI device id -> product table. Used only as a fallback when
//! neither node labels nor the detection sidecar report a product name.

// =============================================================================
// Catalog Entry
// =============================================================================

/// Known characteristics of a GPU model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    /// PCI device id (lowercase hex)
    pub device_id: &'static str,
    /// Marketing product name
    pub product: &'static str,
    /// Architecture family
    pub family: &'static str,
    /// Framebuffer size
    pub memory_mib: u64,
    pub compute_major: u32,
    pub compute_minor: u32,
    pub mig_capable: bool,
}

const fn entry(
    device_id: &'static str,
    product: &'static str,
    family: &'static str,
    memory_mib: u64,
    compute: (u32, u32),
    mig_capable: bool,
) -> CatalogEntry {
    CatalogEntry {
        device_id,
        product,
        family,
        memory_mib,
        compute_major: compute.0,
        compute_minor: compute.1,
        mig_capable,
    }
}

/// Built-in NVIDIA datacenter parts
static CATALOG: &[CatalogEntry] = &[
    // Volta
    entry("1db1", "Tesla V100 SXM2 16GB", "volta", 16384, (7, 0), false),
    entry("1db4", "Tesla V100 PCIe 16GB", "volta", 16384, (7, 0), false),
    entry("1db5", "Tesla V100 SXM2 32GB", "volta", 32768, (7, 0), false),
    entry("1db6", "Tesla V100 PCIe 32GB", "volta", 32768, (7, 0), false),
    // Turing
    entry("1eb8", "Tesla T4", "turing", 15360, (7, 5), false),
    // Ampere
    entry("20b0", "A100 SXM4 40GB", "ampere", 40960, (8, 0), true),
    entry("20b2", "A100 SXM4 80GB", "ampere", 81920, (8, 0), true),
    entry("20b5", "A100 PCIe 80GB", "ampere", 81920, (8, 0), true),
    entry("20f1", "A100 PCIe 40GB", "ampere", 40960, (8, 0), true),
    entry("20b7", "A30", "ampere", 24576, (8, 0), true),
    entry("2235", "A40", "ampere", 46068, (8, 6), false),
    entry("2236", "A10", "ampere", 23028, (8, 6), false),
    entry("2237", "A10G", "ampere", 23028, (8, 6), false),
    entry("25b6", "A16", "ampere", 15356, (8, 6), false),
    // Ada Lovelace
    entry("27b8", "L4", "ada-lovelace", 23034, (8, 9), false),
    entry("26b5", "L40", "ada-lovelace", 46068, (8, 9), false),
    entry("26b9", "L40S", "ada-lovelace", 46068, (8, 9), false),
    // Hopper
    entry("2330", "H100 SXM5 80GB", "hopper", 81559, (9, 0), true),
    entry("2331", "H100 PCIe 80GB", "hopper", 81559, (9, 0), true),
    entry("2321", "H100 NVL", "hopper", 95830, (9, 0), true),
    entry("2335", "H200 SXM 141GB", "hopper", 143771, (9, 0), true),
];

// =============================================================================
// Lookup
// =============================================================================

/// Look up a device id (any case, optional 0x prefix)
pub fn lookup(device_id: &str) -> Option<&'static CatalogEntry> {
    let id = device_id.trim().trim_start_matches("0x").to_ascii_lowercase();
    CATALOG.iter().find(|e| e.device_id == id)
}

/// Product name for a device id, if catalogued
pub fn product_name(device_id: &str) -> Option<&'static str> {
    lookup(device_id).map(|e| e.product)
}

/// All catalogued entries
pub fn entries() -> &'static [CatalogEntry] {
    CATALOG
}
