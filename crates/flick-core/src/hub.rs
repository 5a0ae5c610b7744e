//! Reference-counted access to the process-wide discovery substrate.
//!
//! The substrate is opened by the first holder and shut down when the last
//! lease is dropped. Advertiser and Acquirer each hold a lease only while an
//! operation is outstanding, so the substrate is released whenever the
//! device is idle.

use crate::session::lock;
use crate::substrate::{DiscoveryError, DiscoverySubstrate};
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

type Opener<S> = dyn Fn() -> Result<S, DiscoveryError> + Send + Sync;

/// Shared guard around the discovery substrate
pub struct SubstrateHub<S: DiscoverySubstrate> {
    inner: Arc<HubInner<S>>,
}

impl<S: DiscoverySubstrate> Clone for SubstrateHub<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct HubInner<S> {
    open: Box<Opener<S>>,
    slot: Mutex<HubSlot<S>>,
}

struct HubSlot<S> {
    substrate: Option<Arc<S>>,
    holders: usize,
    opened: u64,
}

impl<S: DiscoverySubstrate> SubstrateHub<S> {
    /// Create a hub that opens the substrate with `open` on first use
    pub fn new(open: impl Fn() -> Result<S, DiscoveryError> + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(HubInner {
                open: Box::new(open),
                slot: Mutex::new(HubSlot {
                    substrate: None,
                    holders: 0,
                    opened: 0,
                }),
            }),
        }
    }

    /// Acquire a lease, opening the substrate if nobody holds it
    ///
    /// # Errors
    ///
    /// Propagates the opener's error; the holder count is left unchanged.
    pub fn acquire(&self) -> Result<SubstrateLease<S>, DiscoveryError> {
        let mut slot = lock(&self.inner.slot, "substrate hub");
        let substrate = match &slot.substrate {
            Some(substrate) => substrate.clone(),
            None => {
                let substrate = Arc::new((self.inner.open)()?);
                slot.substrate = Some(substrate.clone());
                slot.opened += 1;
                info!(generation = slot.opened, "Discovery substrate opened");
                substrate
            }
        };
        slot.holders += 1;
        debug!(holders = slot.holders, "Discovery substrate acquired");

        Ok(SubstrateLease {
            substrate,
            hub: self.inner.clone(),
        })
    }

    /// Number of outstanding leases
    pub fn holders(&self) -> usize {
        lock(&self.inner.slot, "substrate hub").holders
    }

    /// Whether the substrate is currently open
    pub fn is_open(&self) -> bool {
        lock(&self.inner.slot, "substrate hub").substrate.is_some()
    }

    /// How many times the substrate has been opened
    pub fn open_count(&self) -> u64 {
        lock(&self.inner.slot, "substrate hub").opened
    }
}

/// RAII hold on the substrate
///
/// Cloning takes an additional hold. Dropping the last hold shuts the
/// substrate down.
pub struct SubstrateLease<S: DiscoverySubstrate> {
    substrate: Arc<S>,
    hub: Arc<HubInner<S>>,
}

impl<S: DiscoverySubstrate> Clone for SubstrateLease<S> {
    fn clone(&self) -> Self {
        lock(&self.hub.slot, "substrate hub").holders += 1;
        Self {
            substrate: self.substrate.clone(),
            hub: self.hub.clone(),
        }
    }
}

impl<S: DiscoverySubstrate> Deref for SubstrateLease<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.substrate
    }
}

impl<S: DiscoverySubstrate> Drop for SubstrateLease<S> {
    fn drop(&mut self) {
        let released = {
            let mut slot = lock(&self.hub.slot, "substrate hub");
            slot.holders = slot.holders.saturating_sub(1);
            debug!(holders = slot.holders, "Discovery substrate released");
            if slot.holders == 0 {
                slot.substrate.take()
            } else {
                None
            }
        };

        if let Some(substrate) = released {
            match substrate.shutdown() {
                Ok(()) => info!("Discovery substrate shut down"),
                Err(e) => warn!(error = %e, "Discovery substrate shutdown failed"),
            }
        }
    }
}
