//! Advertiser: publish one file offer and stream it to the first peer.
//!
//! ```text
//! Idle -> Registering -> Waiting -> Transferring -> Withdrawing -> Idle
//!              |
//!              +-> Failed -> Idle
//! ```
//!
//! The engine call runs on a blocking worker. Whatever it returns, the
//! advertisement is withdrawn exactly once before the terminal event is
//! emitted. A cancelled session withdraws immediately; the engine sees its
//! token fire and the late result is discarded.

use crate::advertisement::{Advertisement, DeviceIdentity};
use crate::bridge::{Outcome, SessionReporter, StatusSender};
use crate::engine::{ProgressSink, TransferEngine};
use crate::error::{FlickError, Result};
use crate::handle::TransferHandle;
use crate::hub::{SubstrateHub, SubstrateLease};
use crate::session::{Role, SessionId, SessionStatus, TransferSession, lock};
use crate::substrate::{DiscoveryError, DiscoverySubstrate, Registration};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Advertiser state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiserState {
    /// No session
    Idle,
    /// Registration requested
    Registering,
    /// Advertised, engine waiting for a peer
    Waiting,
    /// Peer connected, bytes moving
    Transferring,
    /// Engine returned, advertisement being withdrawn
    Withdrawing,
    /// Registration failed
    Failed,
}

impl AdvertiserState {
    /// User-visible status for this state
    pub fn status(self) -> SessionStatus {
        match self {
            Self::Idle => SessionStatus::Idle,
            Self::Registering => SessionStatus::Announcing,
            Self::Waiting => SessionStatus::AwaitingPeer,
            Self::Transferring | Self::Withdrawing => SessionStatus::Transferring,
            Self::Failed => SessionStatus::Failed,
        }
    }
}

/// Sender role
pub struct Advertiser<S: DiscoverySubstrate, E: TransferEngine> {
    inner: Arc<Inner<S, E>>,
}

impl<S: DiscoverySubstrate, E: TransferEngine> Clone for Advertiser<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S: DiscoverySubstrate, E> {
    hub: SubstrateHub<S>,
    engine: Arc<E>,
    identity: DeviceIdentity,
    events: StatusSender,
    slot: Mutex<Slot<S>>,
}

impl<S: DiscoverySubstrate, E> Inner<S, E> {
    fn slot(&self) -> MutexGuard<'_, Slot<S>> {
        lock(&self.slot, "advertiser")
    }
}

struct Slot<S: DiscoverySubstrate> {
    state: AdvertiserState,
    session: Option<ActiveSession>,
    advertised: Option<Advertised<S>>,
}

impl<S: DiscoverySubstrate> Slot<S> {
    fn is_current(&self, id: SessionId) -> bool {
        self.session.as_ref().is_some_and(|session| session.id == id)
    }

    fn reset(&mut self) {
        self.state = AdvertiserState::Idle;
        self.session = None;
    }
}

struct ActiveSession {
    id: SessionId,
    port: u16,
    filename: String,
    reporter: Arc<SessionReporter>,
    cancel: CancellationToken,
}

/// A live registration together with the lease that keeps the substrate open
struct Advertised<S: DiscoverySubstrate> {
    registration: Registration,
    lease: SubstrateLease<S>,
}

impl<S: DiscoverySubstrate> Advertised<S> {
    fn withdraw(self, session: SessionId) {
        match self.lease.unregister(&self.registration) {
            Ok(()) => info!(
                session = %session,
                service = %self.registration.service_name,
                "Advertisement withdrawn"
            ),
            Err(e) => warn!(
                session = %session,
                service = %self.registration.service_name,
                error = %e,
                "Failed to withdraw advertisement"
            ),
        }
    }
}

impl<S: DiscoverySubstrate, E: TransferEngine> Advertiser<S, E> {
    /// Create an idle Advertiser
    pub fn new(
        hub: SubstrateHub<S>,
        engine: Arc<E>,
        identity: DeviceIdentity,
        events: StatusSender,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                hub,
                engine,
                identity,
                events,
                slot: Mutex::new(Slot {
                    state: AdvertiserState::Idle,
                    session: None,
                    advertised: None,
                }),
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> AdvertiserState {
        self.inner.slot().state
    }

    /// Snapshot of the running session
    pub fn session(&self) -> Option<TransferSession> {
        let slot = self.inner.slot();
        slot.session.as_ref().map(|session| TransferSession {
            id: session.id,
            role: Role::Advertiser,
            port: Some(session.port),
            bytes_reported: session.reporter.bytes_reported(),
            status: slot.state.status(),
        })
    }

    /// Identity used for advertised service names
    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    /// Advertise `handle` as `display_name` and serve it on `port`
    ///
    /// Returns once the advertisement is registered; the transfer continues
    /// on a worker and reports through the status bridge.
    ///
    /// # Errors
    ///
    /// - [`FlickError::AlreadyActive`] if a session is running. The handle is
    ///   dropped and nothing is emitted.
    /// - [`FlickError::RegistrationFailed`] if the substrate refused the
    ///   advertisement. A `Failed` event has been emitted and the engine was
    ///   never invoked.
    /// - [`FlickError::Cancelled`] if [`cancel`](Self::cancel) ran while
    ///   registering.
    pub async fn begin(
        &self,
        handle: TransferHandle,
        display_name: &str,
        port: u16,
    ) -> Result<SessionId> {
        let id = SessionId::next();
        let reporter = Arc::new(SessionReporter::new(
            id,
            Role::Advertiser,
            self.inner.events.clone(),
        ));
        let cancel = CancellationToken::new();

        {
            let mut slot = self.inner.slot();
            if slot.state != AdvertiserState::Idle {
                debug!(state = ?slot.state, "Advertiser busy, rejecting begin");
                return Err(FlickError::AlreadyActive(Role::Advertiser));
            }
            slot.state = AdvertiserState::Registering;
            slot.session = Some(ActiveSession {
                id,
                port,
                filename: display_name.to_string(),
                reporter: reporter.clone(),
                cancel: cancel.clone(),
            });
        }
        debug!(session = %id, "Advertiser Idle -> Registering");

        let filesize = handle.probe_size().unwrap_or_else(|e| {
            warn!(session = %id, error = %e, "Advertising without a size hint");
            0
        });
        reporter.describe(display_name, filesize);
        let advertisement = Advertisement::new(
            self.inner.identity.service_name(),
            port,
            display_name,
            filesize,
        );
        reporter
            .status(
                SessionStatus::Announcing,
                format!("Announcing {display_name}"),
            )
            .await;

        let lease = match self.inner.hub.acquire() {
            Ok(lease) => lease,
            Err(e) => return Err(self.registration_failed(id, &reporter, e).await),
        };
        let registration = match lease.register(&advertisement).await {
            Ok(registration) => registration,
            Err(e) => return Err(self.registration_failed(id, &reporter, e).await),
        };
        let advertised = Advertised {
            registration,
            lease,
        };

        let cancelled = {
            let mut slot = self.inner.slot();
            if slot.is_current(id) {
                slot.state = AdvertiserState::Waiting;
                slot.advertised = Some(advertised);
                None
            } else {
                Some(advertised)
            }
        };
        if let Some(advertised) = cancelled {
            advertised.withdraw(id);
            return Err(FlickError::Cancelled);
        }

        debug!(session = %id, "Advertiser Registering -> Waiting");
        info!(
            session = %id,
            service = %advertisement.service_name,
            port,
            file = display_name,
            filesize,
            "Advertisement registered"
        );
        reporter
            .status(SessionStatus::AwaitingPeer, "Waiting for connection...")
            .await;

        tokio::spawn(self.clone().run_transfer(
            id,
            port,
            handle,
            display_name.to_string(),
            reporter,
            cancel,
        ));
        Ok(id)
    }

    /// Abandon the running session
    ///
    /// Withdraws the advertisement at once, signals the engine's cancellation
    /// token and emits `Cancelled`. Returns `false` when nothing was running.
    pub async fn cancel(&self) -> bool {
        let (session, advertised) = {
            let mut slot = self.inner.slot();
            let Some(session) = slot.session.take() else {
                return false;
            };
            slot.state = AdvertiserState::Idle;
            (session, slot.advertised.take())
        };

        session.cancel.cancel();
        if let Some(advertised) = advertised {
            advertised.withdraw(session.id);
        }
        info!(session = %session.id, "Advertiser cancelled");
        session
            .reporter
            .finish(Outcome::Cancelled(format!(
                "Stopped sharing {}",
                session.filename
            )))
            .await;
        true
    }

    async fn registration_failed(
        &self,
        id: SessionId,
        reporter: &SessionReporter,
        error: DiscoveryError,
    ) -> FlickError {
        let current = {
            let mut slot = self.inner.slot();
            if slot.is_current(id) {
                slot.state = AdvertiserState::Failed;
                debug!(session = %id, "Advertiser Registering -> Failed");
                slot.reset();
                true
            } else {
                false
            }
        };

        if !current {
            return FlickError::Cancelled;
        }
        warn!(session = %id, code = error.code(), error = %error, "Advertisement registration failed");
        reporter
            .finish(Outcome::Failed(format!("Announcement failed: {error}")))
            .await;
        FlickError::RegistrationFailed(error)
    }

    async fn run_transfer(
        self,
        id: SessionId,
        port: u16,
        handle: TransferHandle,
        filename: String,
        reporter: Arc<SessionReporter>,
        cancel: CancellationToken,
    ) {
        let engine = self.inner.engine.clone();
        let sink = SendProgress {
            advertiser: self.clone(),
            session: id,
            reporter: reporter.clone(),
        };
        let outcome =
            tokio::task::spawn_blocking(move || engine.send(port, handle, &sink, &cancel)).await;

        let advertised = {
            let mut slot = self.inner.slot();
            if slot.is_current(id) {
                slot.state = AdvertiserState::Withdrawing;
                slot.advertised.take()
            } else {
                None
            }
        };
        if let Some(advertised) = advertised {
            debug!(session = %id, "Advertiser -> Withdrawing");
            advertised.withdraw(id);
        }

        let outcome = match outcome {
            Ok(Ok(report)) => {
                info!(session = %id, bytes = report.bytes, file = %filename, "Send finished");
                Outcome::Completed(format!("Finished sending {filename} ({report})"))
            }
            Ok(Err(e)) => {
                warn!(session = %id, error = %e, file = %filename, "Send failed");
                Outcome::Failed(format!("Sending {filename} failed: {e}"))
            }
            Err(e) => {
                error!(session = %id, error = %e, "Send worker stopped");
                Outcome::Failed(format!("Sending {filename} failed: worker stopped: {e}"))
            }
        };

        {
            let mut slot = self.inner.slot();
            if slot.is_current(id) {
                slot.reset();
                debug!(session = %id, "Advertiser Withdrawing -> Idle");
            }
        }
        if !reporter.finish(outcome).await {
            debug!(session = %id, "Discarding late engine result");
        }
    }
}

/// Progress sink handed to the engine for one send
struct SendProgress<S: DiscoverySubstrate, E: TransferEngine> {
    advertiser: Advertiser<S, E>,
    session: SessionId,
    reporter: Arc<SessionReporter>,
}

impl<S: DiscoverySubstrate, E: TransferEngine> ProgressSink for SendProgress<S, E> {
    fn on_progress(&self, bytes: u64) {
        self.reporter.progress(bytes);
    }

    fn on_connected(&self, peer: SocketAddr) {
        let connected = {
            let mut slot = self.advertiser.inner.slot();
            if slot.is_current(self.session) && slot.state == AdvertiserState::Waiting {
                slot.state = AdvertiserState::Transferring;
                true
            } else {
                false
            }
        };
        if connected {
            info!(session = %self.session, %peer, "Peer connected");
            self.reporter
                .status_blocking(SessionStatus::Transferring, format!("Connected to {peer}"));
        }
    }
}
