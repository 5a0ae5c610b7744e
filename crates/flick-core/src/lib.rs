//! Discovery-and-transfer orchestration for Flick.
//!
//! Two devices on the same local network exchange a single file without any
//! prior pairing: one side advertises the file, the other discovers the
//! advertisement, resolves it to an endpoint and pulls the bytes.
//!
//! This crate holds the orchestration only:
//!
//! - [`Advertiser`]: publishes an [`Advertisement`], waits for a peer and
//!   hands the source to a [`TransferEngine`], withdrawing the advertisement
//!   once the engine returns.
//! - [`Acquirer`]: browses for advertisements, takes the first one it sees,
//!   resolves it, allocates a destination through a [`ContentStore`] and hands
//!   the destination to the engine.
//! - [`StatusBridge`]: delivers progress and terminal events from engine
//!   worker threads to a single consumer, in order.
//! - [`SubstrateHub`]: reference-counted access to the process-wide
//!   [`DiscoverySubstrate`].
//!
//! The byte-level engine, the discovery protocol and file-system access are
//! collaborators behind traits. Concrete implementations live in
//! `flick-transport`, `flick-discovery` and `flick-files`.
//!
//! # Example
//!
//! ```ignore
//! let (events, mut consumer) = StatusBridge::channel(64);
//! let advertiser = Advertiser::new(hub, engine, DeviceIdentity::new("laptop"), events);
//! advertiser.begin(handle, "photo.jpg", DEFAULT_PORT).await?;
//! while let Some(event) = consumer.recv_latest().await {
//!     println!("{}", event.message());
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod acquirer;
pub mod advertisement;
pub mod advertiser;
pub mod bridge;
pub mod engine;
pub mod error;
pub mod handle;
pub mod hub;
pub mod session;
pub mod store;
pub mod substrate;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use acquirer::{Acquirer, AcquirerState};
pub use advertisement::{
    Advertisement, Attributes, DeviceIdentity, DiscoveredPeer, Endpoint, fallback_filename,
};
pub use advertiser::{Advertiser, AdvertiserState};
pub use bridge::{StatusBridge, StatusEvent, StatusReceiver, StatusSender};
pub use engine::{
    EngineError, EngineResult, NoProgress, ProgressSink, ProgressThrottle, TransferEngine,
    TransferReport,
};
pub use error::{FlickError, Result};
pub use handle::TransferHandle;
pub use hub::{SubstrateHub, SubstrateLease};
pub use session::{Role, SessionId, SessionStatus, TransferSession};
pub use store::{ContentStore, Destination, SourceFile};
pub use substrate::{
    Browse, BrowseEvent, BrowseId, DiscoveryError, DiscoverySubstrate, Registration, ServiceRef,
};

pub use tokio_util::sync::CancellationToken;

/// DNS-SD service type shared by every Flick advertisement
pub const SERVICE_TYPE: &str = "_filetransfer._tcp.";

/// Attribute key carrying the offered file's display name
pub const ATTR_FILENAME: &str = "Filename";

/// Attribute key carrying the offered file's size as a decimal string
pub const ATTR_FILESIZE: &str = "Filesize";

/// Prefix of every advertised service instance name
pub const SERVICE_PREFIX: &str = "FlickShare";

/// Port the Advertiser listens on unless configured otherwise
pub const DEFAULT_PORT: u16 = 24242;

/// Bytes between two progress reports from an engine
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 512 * 1024;

/// Copy buffer size used by engines
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Capacity of the status channel when nothing else is configured
pub const DEFAULT_STATUS_CAPACITY: usize = 64;
