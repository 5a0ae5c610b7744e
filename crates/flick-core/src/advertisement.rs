//! Discovery data model: advertisements, their attributes and resolved peers.
//!
//! Metadata about the offered file (name and size) travels exclusively in the
//! advertisement attributes. The data connection carries raw bytes only.

use crate::{ATTR_FILENAME, ATTR_FILESIZE, SERVICE_PREFIX, SERVICE_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Longest instance name a DNS-SD label can carry
const MAX_SERVICE_NAME: usize = 63;

/// Key/value attributes attached to an advertisement
///
/// Values are UTF-8 strings. `Filesize` is a decimal integer where `"0"`
/// means unknown; anything that does not parse is treated as unknown too.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    entries: BTreeMap<String, String>,
}

impl Attributes {
    /// Attributes describing a file offer
    pub fn for_file(filename: &str, filesize: u64) -> Self {
        let mut attributes = Self::default();
        attributes.insert(ATTR_FILENAME, filename);
        attributes.insert(ATTR_FILESIZE, filesize.to_string());
        attributes
    }

    /// Insert or replace an attribute
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Raw attribute value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Advertised file name, if present and non-empty
    pub fn filename(&self) -> Option<&str> {
        self.get(ATTR_FILENAME)
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Advertised size in bytes, 0 when missing or malformed
    pub fn filesize(&self) -> u64 {
        self.get(ATTR_FILESIZE)
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Advertised size when it is known
    pub fn known_size(&self) -> Option<u64> {
        Some(self.filesize()).filter(|size| *size > 0)
    }

    /// Iterate over all attributes in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no attribute is set
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A discoverable announcement of one file offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Advertisement {
    /// Instance name, unique on the local network
    pub service_name: String,
    /// Protocol family tag, always [`SERVICE_TYPE`] for Flick
    pub service_type: String,
    /// Port the Advertiser listens on
    pub port: u16,
    /// File metadata
    pub attributes: Attributes,
}

impl Advertisement {
    /// Build the advertisement for a file offer
    pub fn new(service_name: impl Into<String>, port: u16, filename: &str, filesize: u64) -> Self {
        Self {
            service_name: service_name.into(),
            service_type: SERVICE_TYPE.to_string(),
            port,
            attributes: Attributes::for_file(filename, filesize),
        }
    }
}

/// Device identity used to derive advertised service names
///
/// The tag disambiguates two processes advertising from the same device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    name: String,
    tag: String,
}

impl DeviceIdentity {
    /// Identity with a random 4-hex-digit instance tag
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_tag(name, format!("{:04x}", rand::random::<u16>()))
    }

    /// Identity with a fixed tag
    pub fn with_tag(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// Human-readable device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advertised instance name, `FlickShare_<device>_<tag>`
    pub fn service_name(&self) -> String {
        let device: String = self
            .name
            .chars()
            .map(|c| match c {
                c if c.is_alphanumeric() || c == '-' || c == '_' => c,
                _ => '_',
            })
            .collect();
        let suffix = format!("_{}", self.tag);
        let mut name = format!("{SERVICE_PREFIX}_{device}");

        let budget = MAX_SERVICE_NAME.saturating_sub(suffix.len());
        if name.len() > budget {
            let mut cut = budget;
            while !name.is_char_boundary(cut) {
                cut -= 1;
            }
            name.truncate(cut);
        }
        name.push_str(&suffix);
        name
    }
}

/// A connectable endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    /// Resolved host address
    pub host: IpAddr,
    /// Resolved port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    /// Socket address form
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

/// An advertisement resolved to a connectable endpoint
///
/// Transient: consumed by exactly one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredPeer {
    /// Advertised instance name
    pub service_name: String,
    /// Resolved IP address
    pub host: IpAddr,
    /// Resolved port
    pub port: u16,
    /// File metadata copied from the advertisement
    pub attributes: Attributes,
}

impl DiscoveredPeer {
    /// Endpoint the engine connects to
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host, self.port)
    }
}

/// Destination name used when a peer advertises no file name
pub fn fallback_filename(now: SystemTime) -> String {
    let millis = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("file_{millis}")
}
