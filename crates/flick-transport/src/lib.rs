//! TCP transfer engine for Flick.
//!
//! [`TcpEngine`] implements [`flick_core::TransferEngine`] over plain TCP:
//! the sender listens on the advertised port and accepts exactly one peer,
//! the receiver dials the resolved endpoint. The stream carries the raw file
//! bytes and nothing else; end of stream marks end of file.
//!
//! Both directions run on blocking sockets with short timeouts so the
//! caller's [`flick_core::CancellationToken`] is observed between reads and
//! writes. Socket setup goes through `socket2` so the listener can reuse its
//! address immediately after the previous share.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod tcp;

pub use config::{ConfigError, EngineConfig};
pub use tcp::TcpEngine;
