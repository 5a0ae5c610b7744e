//! Conversions between Flick's model and DNS-SD records.

use flick_core::substrate::FAILURE_INTERNAL_ERROR;
use flick_core::{Advertisement, Attributes, DiscoveredPeer, DiscoveryError};
use mdns_sd::ServiceInfo;
use std::collections::HashMap;
use std::net::IpAddr;

/// Fully qualified DNS-SD type for `service_type`, in the `local.` domain
///
/// `"_filetransfer._tcp."` becomes `"_filetransfer._tcp.local."`; a type that
/// already carries the domain is returned unchanged.
pub fn dns_sd_type(service_type: &str) -> String {
    let base = service_type.trim_end_matches('.');
    if base.ends_with(".local") {
        format!("{base}.")
    } else {
        format!("{base}.local.")
    }
}

/// Instance part of a fully qualified service name
pub fn instance_name(fullname: &str, ty_domain: &str) -> String {
    fullname
        .strip_suffix(ty_domain)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(fullname)
        .to_string()
}

/// mDNS host label derived from the instance name
fn host_label(service_name: &str) -> String {
    let label: String = service_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        "flick.local.".to_string()
    } else {
        format!("{label}.local.")
    }
}

/// Build the DNS-SD record for an advertisement
///
/// Addresses are filled in by the daemon from the host's interfaces.
///
/// # Errors
///
/// Returns [`DiscoveryError::Registration`] when the name or type is not a
/// valid DNS-SD label.
pub fn to_service_info(advertisement: &Advertisement) -> Result<ServiceInfo, DiscoveryError> {
    let ty_domain = dns_sd_type(&advertisement.service_type);
    let properties: HashMap<String, String> = advertisement
        .attributes
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

    let info = ServiceInfo::new(
        &ty_domain,
        &advertisement.service_name,
        &host_label(&advertisement.service_name),
        "",
        advertisement.port,
        properties,
    )
    .map_err(|e| DiscoveryError::Registration {
        code: FAILURE_INTERNAL_ERROR,
        reason: e.to_string(),
    })?;

    Ok(info.enable_addr_auto())
}

fn is_link_local_v6(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        IpAddr::V4(_) => false,
    }
}

/// Turn a resolved record into a connectable peer
///
/// IPv4 addresses are preferred, loopback and IPv6 link-local addresses are
/// used only as a last resort.
///
/// # Errors
///
/// Returns [`DiscoveryError::Resolve`] when the record carries no address.
pub fn peer_from_info(info: &ServiceInfo, ty_domain: &str) -> Result<DiscoveredPeer, DiscoveryError> {
    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    addresses.sort_by_key(|ip| (ip.is_loopback() || is_link_local_v6(ip), ip.is_ipv6(), *ip));

    let host = addresses
        .first()
        .copied()
        .ok_or_else(|| DiscoveryError::Resolve {
            code: FAILURE_INTERNAL_ERROR,
            reason: format!("{} has no address", info.get_fullname()),
        })?;

    let attributes: Attributes = info
        .get_properties()
        .iter()
        .map(|property| (property.key().to_string(), property.val_str().to_string()))
        .collect();

    Ok(DiscoveredPeer {
        service_name: instance_name(info.get_fullname(), ty_domain),
        host,
        port: info.get_port(),
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flick_core::SERVICE_TYPE;
    use std::net::Ipv4Addr;

    const TY: &str = "_filetransfer._tcp.local.";

    fn record(addresses: &str, properties: HashMap<String, String>) -> ServiceInfo {
        ServiceInfo::new(TY, "FlickShare_Pixel_1a2b", "pixel.local.", addresses, 24242, properties)
            .unwrap()
    }

    #[test]
    fn test_dns_sd_type() {
        assert_eq!(dns_sd_type(SERVICE_TYPE), TY);
        assert_eq!(dns_sd_type(TY), TY);
        assert_eq!(dns_sd_type("_filetransfer._tcp"), TY);
    }

    #[test]
    fn test_instance_name() {
        assert_eq!(
            instance_name("FlickShare_Pixel_1a2b._filetransfer._tcp.local.", TY),
            "FlickShare_Pixel_1a2b"
        );
        assert_eq!(instance_name("unrelated", TY), "unrelated");
    }

    #[test]
    fn test_host_label() {
        assert_eq!(host_label("FlickShare_Pixel 7_1a2b"), "flickshare-pixel-7-1a2b.local.");
        assert_eq!(host_label("__"), "flick.local.");
    }

    #[test]
    fn test_advertisement_record() {
        let advertisement = Advertisement::new("FlickShare_Laptop_00ff", 24242, "photo.jpg", 2048);
        let info = to_service_info(&advertisement).unwrap();

        assert_eq!(info.get_fullname(), "FlickShare_Laptop_00ff._filetransfer._tcp.local.");
        assert_eq!(info.get_port(), 24242);
        assert_eq!(info.get_property_val_str("Filename"), Some("photo.jpg"));
        assert_eq!(info.get_property_val_str("Filesize"), Some("2048"));
    }

    #[test]
    fn test_peer_from_record() {
        let properties = HashMap::from([
            ("Filename".to_string(), "report.pdf".to_string()),
            ("Filesize".to_string(), "2048000".to_string()),
        ]);
        let peer = peer_from_info(&record("192.168.1.20", properties), TY).unwrap();

        assert_eq!(peer.service_name, "FlickShare_Pixel_1a2b");
        assert_eq!(peer.host, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(peer.port, 24242);
        assert_eq!(peer.attributes.filename(), Some("report.pdf"));
        assert_eq!(peer.attributes.filesize(), 2_048_000);
    }

    #[test]
    fn test_peer_prefers_routable_ipv4() {
        let peer = peer_from_info(&record("fe80::1,127.0.0.1,10.0.0.7", HashMap::new()), TY).unwrap();
        assert_eq!(peer.host, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert!(peer.attributes.is_empty());
    }

    #[test]
    fn test_peer_without_address() {
        let err = peer_from_info(&record("", HashMap::new()), TY).unwrap_err();
        assert!(matches!(err, DiscoveryError::Resolve { code: 0, .. }));
    }
}
