//! PCI identifiers
//!
//! Normalization helpers for PCI ids, addresses and device indexes as they
//! arrive from labels, feature data and the detection sidecar.

/// NVIDIA PCI vendor id
pub const NVIDIA_VENDOR_ID: &str = "10de";

/// Canonical PCI address: `dddd:bb:dd.f`, lowercase.
///
/// Accepts partial (`3b:00.0`) and over-long (`00000000:3b:00.0`) domains.
/// Input that does not look like an address is returned trimmed and lowercased.
pub fn canonical_pci_address(raw: &str) -> String {
    let addr = raw.trim().to_ascii_lowercase();
    if addr.is_empty() {
        return addr;
    }

    let parts: Vec<&str> = addr.split(':').collect();
    let (domain, bus, slot) = match parts.as_slice() {
        [bus, slot] => ("0", *bus, *slot),
        [domain, bus, slot] => (*domain, *bus, *slot),
        _ => return addr,
    };

    let Some((device, function)) = slot.split_once('.') else {
        return addr;
    };

    let (Ok(domain), Ok(bus), Ok(device), Ok(function)) = (
        u32::from_str_radix(domain, 16),
        u8::from_str_radix(bus, 16),
        u8::from_str_radix(device, 16),
        u8::from_str_radix(function, 16),
    ) else {
        return addr;
    };

    format!("{:04x}:{:02x}:{:02x}.{:x}", domain, bus, device, function)
}

/// Canonical device index: leading zeros stripped, empty becomes "0"
pub fn canonical_index(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Lowercase hex id without `0x`; `None` when the value is not hex
pub fn normalize_hex_id(raw: &str) -> Option<String> {
    let value = raw.trim();
    let value = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
        .to_ascii_lowercase();
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_pci_address() {
        assert_eq!(canonical_pci_address("3B:00.0"), "0000:3b:00.0");
        assert_eq!(canonical_pci_address("00000000:3B:00.0"), "0000:3b:00.0");
        assert_eq!(canonical_pci_address("0000:af:00.1"), "0000:af:00.1");
        assert_eq!(canonical_pci_address("1:3:0.0"), "0001:03:00.0");
        assert_eq!(canonical_pci_address("  Not-An-Address "), "not-an-address");
        assert_eq!(canonical_pci_address(""), "");
    }

    #[test]
    fn test_canonical_pci_address_is_stable() {
        let once = canonical_pci_address("3B:00.0");
        assert_eq!(canonical_pci_address(&once), once);
    }

    #[test]
    fn test_canonical_index() {
        assert_eq!(canonical_index("007"), "7");
        assert_eq!(canonical_index("0"), "0");
        assert_eq!(canonical_index("000"), "0");
        assert_eq!(canonical_index(""), "0");
        assert_eq!(canonical_index("10"), "10");
    }

    #[test]
    fn test_normalize_hex_id() {
        assert_eq!(normalize_hex_id("0x10DE").as_deref(), Some("10de"));
        assert_eq!(normalize_hex_id("1db6").as_deref(), Some("1db6"));
        assert_eq!(normalize_hex_id("nvidia"), None);
        assert_eq!(normalize_hex_id(""), None);
    }
}
