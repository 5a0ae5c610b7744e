//! `mdns-sd` backed discovery substrate.

use crate::config::MdnsConfig;
use crate::records::{dns_sd_type, instance_name, peer_from_info, to_service_info};
use flick_core::substrate::{FAILURE_ALREADY_ACTIVE, FAILURE_INTERNAL_ERROR, FAILURE_TIMEOUT};
use flick_core::{
    Advertisement, Browse, BrowseEvent, BrowseId, DiscoveredPeer, DiscoveryError,
    DiscoverySubstrate, Registration, ServiceRef, SubstrateHub,
};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Multicast DNS-SD substrate
///
/// Owns one `mdns-sd` daemon. Open it through [`MdnsSubstrate::hub`] so the
/// daemon runs only while an Advertiser or Acquirer needs it.
pub struct MdnsSubstrate {
    daemon: ServiceDaemon,
    config: MdnsConfig,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    /// Resolved records by full name, filled by the browse forwarders
    resolved: Mutex<HashMap<String, DiscoveredPeer>>,
    registrations: Mutex<HashSet<String>>,
    browses: Mutex<HashMap<u64, BrowseSlot>>,
    next_browse: AtomicU64,
}

struct BrowseSlot {
    ty_domain: String,
    stop: Arc<AtomicBool>,
}

/// State moved onto a browse forwarder thread
struct Forwarder {
    id: u64,
    service_type: String,
    ty_domain: String,
    tx: mpsc::Sender<BrowseEvent>,
    stop: Arc<AtomicBool>,
    shared: Arc<Shared>,
    config: MdnsConfig,
}

impl MdnsSubstrate {
    /// Start an mDNS daemon
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Unavailable`] when the daemon cannot bind its
    /// multicast sockets.
    pub fn new(config: MdnsConfig) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        info!("mDNS daemon started");
        Ok(Self {
            daemon,
            config,
            shared: Arc::new(Shared::default()),
        })
    }

    /// Hub that starts a fresh daemon on first use and stops it on last release
    pub fn hub(config: MdnsConfig) -> SubstrateHub<Self> {
        SubstrateHub::new(move || Self::new(config.clone()))
    }

    fn cached(&self, key: &str) -> Option<DiscoveredPeer> {
        lock(&self.shared.resolved).get(key).cloned()
    }
}

impl Forwarder {
    fn service_ref(&self, fullname: &str) -> ServiceRef {
        ServiceRef {
            service_name: instance_name(fullname, &self.ty_domain),
            service_type: self.service_type.clone(),
            key: fullname.to_string(),
        }
    }

    /// Pump daemon events into the browse channel until stopped
    fn run(self, receiver: mdns_sd::Receiver<ServiceEvent>) {
        let mut seen = HashSet::new();
        debug!(browse = self.id, ty = %self.ty_domain, "Browse forwarder started");

        while !self.stop.load(Ordering::Acquire) && !self.tx.is_closed() {
            let event = match receiver.recv_timeout(self.config.poll_interval) {
                Ok(event) => event,
                Err(_) if receiver.is_disconnected() => break,
                Err(_) => continue,
            };

            let forwarded = match event {
                ServiceEvent::ServiceResolved(info) => {
                    let fullname = info.get_fullname().to_string();
                    match peer_from_info(&info, &self.ty_domain) {
                        Ok(peer) => {
                            lock(&self.shared.resolved).insert(fullname.clone(), peer);
                            if seen.insert(fullname.clone()) {
                                Some(BrowseEvent::Found(self.service_ref(&fullname)))
                            } else {
                                None
                            }
                        }
                        Err(e) => {
                            debug!(service = %fullname, error = %e, "Skipping unusable record");
                            None
                        }
                    }
                }
                ServiceEvent::ServiceRemoved(_, fullname) => {
                    lock(&self.shared.resolved).remove(&fullname);
                    seen.remove(&fullname);
                    Some(BrowseEvent::Lost(self.service_ref(&fullname)))
                }
                ServiceEvent::SearchStopped(_) => break,
                other => {
                    trace!(event = ?other, "Ignoring mDNS event");
                    None
                }
            };

            if let Some(event) = forwarded
                && self.tx.blocking_send(event).is_err()
            {
                break;
            }
        }

        debug!(browse = self.id, "Browse forwarder stopped");
    }
}

impl DiscoverySubstrate for MdnsSubstrate {
    async fn register(&self, advertisement: &Advertisement) -> Result<Registration, DiscoveryError> {
        let record = to_service_info(advertisement)?;
        let key = record.get_fullname().to_string();

        if !lock(&self.shared.registrations).insert(key.clone()) {
            return Err(DiscoveryError::Registration {
                code: FAILURE_ALREADY_ACTIVE,
                reason: format!("{} is already registered", advertisement.service_name),
            });
        }

        if let Err(e) = self.daemon.register(record) {
            lock(&self.shared.registrations).remove(&key);
            return Err(DiscoveryError::Registration {
                code: FAILURE_INTERNAL_ERROR,
                reason: e.to_string(),
            });
        }

        info!(
            service = %advertisement.service_name,
            port = advertisement.port,
            "Service registered"
        );
        Ok(Registration {
            service_name: advertisement.service_name.clone(),
            key,
        })
    }

    fn unregister(&self, registration: &Registration) -> Result<(), DiscoveryError> {
        if !lock(&self.shared.registrations).remove(&registration.key) {
            return Err(DiscoveryError::Unregister(format!(
                "{} is not registered",
                registration.service_name
            )));
        }

        // The goodbye packets go out asynchronously; the status receiver is
        // not needed.
        self.daemon
            .unregister(&registration.key)
            .map_err(|e| DiscoveryError::Unregister(e.to_string()))?;
        info!(service = %registration.service_name, "Service unregistered");
        Ok(())
    }

    fn browse(&self, service_type: &str) -> Result<Browse, DiscoveryError> {
        let ty_domain = dns_sd_type(service_type);
        let stop = Arc::new(AtomicBool::new(false));
        let id = self.shared.next_browse.fetch_add(1, Ordering::Relaxed);

        {
            let mut browses = lock(&self.shared.browses);
            // The daemon keys browses by type, so a second one would share
            // and later stop the first.
            if browses.values().any(|slot| slot.ty_domain == ty_domain) {
                return Err(DiscoveryError::Browse {
                    code: FAILURE_ALREADY_ACTIVE,
                    reason: format!("already browsing {ty_domain}"),
                });
            }
            browses.insert(
                id,
                BrowseSlot {
                    ty_domain: ty_domain.clone(),
                    stop: stop.clone(),
                },
            );
        }

        let receiver = match self.daemon.browse(&ty_domain) {
            Ok(receiver) => receiver,
            Err(e) => {
                lock(&self.shared.browses).remove(&id);
                return Err(DiscoveryError::Browse {
                    code: FAILURE_INTERNAL_ERROR,
                    reason: e.to_string(),
                });
            }
        };

        let (tx, events) = mpsc::channel(self.config.event_capacity.max(1));
        let forwarder = Forwarder {
            id,
            service_type: service_type.to_string(),
            ty_domain: ty_domain.clone(),
            tx,
            stop,
            shared: self.shared.clone(),
            config: self.config.clone(),
        };

        let spawned = std::thread::Builder::new()
            .name(format!("flick-browse-{id}"))
            .spawn(move || forwarder.run(receiver));
        if let Err(e) = spawned {
            self.stop_browse(BrowseId(id));
            return Err(DiscoveryError::Browse {
                code: FAILURE_INTERNAL_ERROR,
                reason: e.to_string(),
            });
        }

        info!(browse = id, ty = %ty_domain, "Browse started");
        Ok(Browse {
            id: BrowseId(id),
            events,
        })
    }

    fn stop_browse(&self, id: BrowseId) {
        let Some(slot) = lock(&self.shared.browses).remove(&id.0) else {
            trace!(browse = id.0, "Browse already stopped");
            return;
        };
        slot.stop.store(true, Ordering::Release);
        if let Err(e) = self.daemon.stop_browse(&slot.ty_domain) {
            debug!(browse = id.0, error = %e, "Daemon browse stop failed");
        }
        info!(browse = id.0, "Browse stopped");
    }

    async fn resolve(&self, service: &ServiceRef) -> Result<DiscoveredPeer, DiscoveryError> {
        let deadline = tokio::time::Instant::now() + self.config.resolve_timeout;
        loop {
            let cached = self.cached(&service.key);
            if let Some(peer) = cached {
                debug!(service = %service.service_name, host = %peer.host, port = peer.port, "Service resolved");
                return Ok(peer);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DiscoveryError::Resolve {
                    code: FAILURE_TIMEOUT,
                    reason: format!(
                        "{} did not resolve within {:?}",
                        service.service_name, self.config.resolve_timeout
                    ),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    fn shutdown(&self) -> Result<(), DiscoveryError> {
        for (_, slot) in lock(&self.shared.browses).drain() {
            slot.stop.store(true, Ordering::Release);
        }
        let leftover = std::mem::take(&mut *lock(&self.shared.registrations));
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "Shutting down with live registrations");
        }
        lock(&self.shared.resolved).clear();

        self.daemon
            .shutdown()
            .map(|_| ())
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))
    }
}
