//! Built-in OUI prefix table for best-effort device classification

use crate::device::{normalize_mac, DeviceRecord, UNKNOWN};

/// (OUI prefix, manufacturer, device type)
const BUILTIN_OUI: &[(&str, &str, &str)] = &[
    ("00:17:F2", "Apple, Inc.", "computer"),
    ("00:1C:B3", "Apple, Inc.", "computer"),
    ("00:26:BB", "Apple, Inc.", "computer"),
    ("00:1A:11", "Google, Inc.", "mobile"),
    ("D8:27:27", "Samsung Electronics", "mobile"),
    ("B8:27:EB", "Raspberry Pi Foundation", "iot"),
    ("DC:A6:32", "Raspberry Pi Trading", "iot"),
    ("00:0C:29", "VMware, Inc.", "virtual_machine"),
    ("00:50:56", "VMware, Inc.", "virtual_machine"),
    ("00:15:5D", "Microsoft Corporation", "virtual_machine"),
    ("00:0F:FE", "Intel Corporate", "computer"),
    ("00:00:0C", "Cisco Systems, Inc", "network"),
    ("00:01:42", "Cisco Systems, Inc", "network"),
    ("00:18:0A", "Cisco Meraki", "network"),
    ("F0:9F:C2", "Ubiquiti Inc", "access_point"),
    ("50:C7:BF", "TP-Link Technologies", "router"),
    ("00:14:6C", "Netgear", "router"),
    ("00:80:77", "Brother Industries", "printer"),
    ("00:00:48", "Seiko Epson", "printer"),
    ("3C:D9:2B", "Hewlett Packard", "printer"),
    ("00:17:C8", "Kyocera", "printer"),
    ("44:19:B6", "Hangzhou Hikvision", "camera"),
    ("3C:EF:8C", "Zhejiang Dahua", "camera"),
    ("00:17:61", "ZKTeco", "attendance_terminal"),
    ("00:1F:9D", "Suprema", "attendance_terminal"),
];

/// Look up the manufacturer and device type for a MAC's OUI
pub fn lookup(mac: &str) -> Option<(&'static str, &'static str)> {
    let mac = normalize_mac(mac)?;
    let prefix = &mac[..8];
    BUILTIN_OUI
        .iter()
        .find(|(oui, _, _)| *oui == prefix)
        .map(|(_, vendor, kind)| (*vendor, *kind))
}

/// Fill `manufacturer` and `device_type` if they are still unknown
pub fn classify(record: &mut DeviceRecord) {
    if let Some((vendor, kind)) = lookup(&record.mac_address) {
        if record.manufacturer == UNKNOWN {
            record.manufacturer = vendor.to_string();
        }
        if record.device_type == UNKNOWN {
            record.device_type = kind.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DiscoveryMethod;
    use std::net::Ipv4Addr;

    #[test]
    fn test_lookup_known_prefix() {
        assert_eq!(lookup("b8:27:eb:01:02:03"), Some(("Raspberry Pi Foundation", "iot")));
        assert_eq!(lookup("AA:BB:CC:DD:EE:01"), None);
        assert_eq!(lookup("Unknown"), None);
    }

    #[test]
    fn test_classify_respects_existing_values() {
        let mut record = DeviceRecord::new(
            Ipv4Addr::new(10, 0, 0, 9),
            "00:17:61:00:00:01",
            DiscoveryMethod::NetworkScan,
        );
        record.device_type = "door_reader".to_string();
        classify(&mut record);
        assert_eq!(record.manufacturer, "ZKTeco");
        assert_eq!(record.device_type, "door_reader");
    }
}
