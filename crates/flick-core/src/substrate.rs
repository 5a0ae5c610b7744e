//! Discovery substrate contract.
//!
//! The substrate publishes advertisements and finds other devices' ones.
//! Registration and resolution are asynchronous; browse results arrive as a
//! stream of found/lost events on a channel.

use crate::advertisement::{Advertisement, DiscoveredPeer};
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

/// Unspecified failure inside the substrate
pub const FAILURE_INTERNAL_ERROR: i32 = 0;

/// The operation is already running
pub const FAILURE_ALREADY_ACTIVE: i32 = 3;

/// The substrate refuses more registrations or browses
pub const FAILURE_MAX_LIMIT: i32 = 4;

/// A resolve did not complete in time
pub const FAILURE_TIMEOUT: i32 = 5;

/// Discovery substrate errors, carrying the numeric failure code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// Registration was refused
    #[error("registration failed with code {code}: {reason}")]
    Registration {
        /// Failure code
        code: i32,
        /// Substrate description
        reason: String,
    },

    /// Withdrawing a registration failed
    #[error("unregistration failed: {0}")]
    Unregister(String),

    /// Browsing could not start
    #[error("browse failed with code {code}: {reason}")]
    Browse {
        /// Failure code
        code: i32,
        /// Substrate description
        reason: String,
    },

    /// A found service could not be resolved
    #[error("resolve failed with code {code}: {reason}")]
    Resolve {
        /// Failure code
        code: i32,
        /// Substrate description
        reason: String,
    },

    /// The substrate could not be opened or is shut down
    #[error("discovery substrate unavailable: {0}")]
    Unavailable(String),
}

impl DiscoveryError {
    /// Numeric failure code
    pub fn code(&self) -> i32 {
        match self {
            Self::Registration { code, .. }
            | Self::Browse { code, .. }
            | Self::Resolve { code, .. } => *code,
            Self::Unregister(_) | Self::Unavailable(_) => FAILURE_INTERNAL_ERROR,
        }
    }
}

/// Proof of a successful registration, needed to withdraw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Registered instance name
    pub service_name: String,
    /// Substrate-specific key, e.g. the fully qualified DNS-SD name
    pub key: String,
}

/// Identifier of a running browse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BrowseId(pub u64);

/// Reference to a found but unresolved service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    /// Instance name
    pub service_name: String,
    /// Service type the browse was started for
    pub service_type: String,
    /// Substrate-specific key
    pub key: String,
}

/// Browse stream event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    /// A matching service appeared
    Found(ServiceRef),
    /// A previously found service went away
    Lost(ServiceRef),
}

/// A running browse
#[derive(Debug)]
pub struct Browse {
    /// Identifier to stop the browse with
    pub id: BrowseId,
    /// Event stream; ends when the browse stops
    pub events: mpsc::Receiver<BrowseEvent>,
}

/// Discovery and advertisement substrate
pub trait DiscoverySubstrate: Send + Sync + 'static {
    /// Publish an advertisement
    fn register(
        &self,
        advertisement: &Advertisement,
    ) -> impl Future<Output = Result<Registration, DiscoveryError>> + Send;

    /// Withdraw a registration
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Unregister`] when the substrate refuses.
    fn unregister(&self, registration: &Registration) -> Result<(), DiscoveryError>;

    /// Start looking for services of `service_type`
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Browse`] when the browse cannot start.
    fn browse(&self, service_type: &str) -> Result<Browse, DiscoveryError>;

    /// Stop a browse; unknown ids are ignored
    fn stop_browse(&self, id: BrowseId);

    /// Resolve a found service to a connectable peer
    fn resolve(
        &self,
        service: &ServiceRef,
    ) -> impl Future<Output = Result<DiscoveredPeer, DiscoveryError>> + Send;

    /// Release the substrate's process-wide resources
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Unavailable`] when the substrate fails to stop.
    fn shutdown(&self) -> Result<(), DiscoveryError>;
}
