//! Multicast DNS-SD discovery for Flick.
//!
//! [`MdnsSubstrate`] implements [`flick_core::DiscoverySubstrate`] on top of
//! the `mdns-sd` daemon. Advertisements are published as
//! `_filetransfer._tcp.local.` services whose TXT record carries the
//! `Filename` and `Filesize` attributes.
//!
//! The daemon resolves records while browsing, so a `Found` event is only
//! emitted once the service's address, port and TXT record are known.
//! `resolve` then answers from that cache.
//!
//! ```no_run
//! use flick_discovery::{MdnsConfig, MdnsSubstrate};
//!
//! let hub = MdnsSubstrate::hub(MdnsConfig::default());
//! // hand `hub` to an Advertiser or Acquirer
//! # drop(hub);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod records;
pub mod substrate;

pub use config::MdnsConfig;
pub use records::{dns_sd_type, instance_name, peer_from_info, to_service_info};
pub use substrate::MdnsSubstrate;
