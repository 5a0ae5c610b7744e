//! Acquirer: find the first advertised file on the network and download it.
//!
//! ```text
//! Idle -> Browsing -> Resolving -> Preparing -> Transferring -> Finalizing -> Idle
//!                         |            |
//!                         +------------+-> Failed -> Idle
//! ```
//!
//! Discovery is single-shot: the browse stops on the first found service and
//! every later event of that browse is ignored. A resolution only starts a
//! transfer while the session is still `Resolving`, so duplicate resolutions
//! are no-ops.

use crate::advertisement::{DiscoveredPeer, Endpoint, fallback_filename};
use crate::bridge::{Outcome, SessionReporter, StatusSender};
use crate::engine::{ProgressSink, TransferEngine};
use crate::error::{FlickError, Result};
use crate::hub::{SubstrateHub, SubstrateLease};
use crate::session::{Role, SessionId, SessionStatus, TransferSession, lock};
use crate::store::{ContentStore, Destination};
use crate::substrate::{Browse, BrowseEvent, BrowseId, DiscoveryError, DiscoverySubstrate};
use crate::SERVICE_TYPE;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Acquirer state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirerState {
    /// No session
    Idle,
    /// Waiting for the first advertisement
    Browsing,
    /// Resolving the found service
    Resolving,
    /// Creating the destination
    Preparing,
    /// Engine receiving
    Transferring,
    /// Engine returned, reporting the outcome
    Finalizing,
    /// Setup failed
    Failed,
}

impl AcquirerState {
    /// User-visible status for this state
    pub fn status(self) -> SessionStatus {
        match self {
            Self::Idle => SessionStatus::Idle,
            Self::Browsing | Self::Resolving | Self::Preparing => SessionStatus::Discovering,
            Self::Transferring | Self::Finalizing => SessionStatus::Transferring,
            Self::Failed => SessionStatus::Failed,
        }
    }
}

/// Receiver role
pub struct Acquirer<S: DiscoverySubstrate, E: TransferEngine, C: ContentStore> {
    inner: Arc<Inner<S, E, C>>,
}

impl<S: DiscoverySubstrate, E: TransferEngine, C: ContentStore> Clone for Acquirer<S, E, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S: DiscoverySubstrate, E, C> {
    hub: SubstrateHub<S>,
    engine: Arc<E>,
    store: Arc<C>,
    events: StatusSender,
    slot: Mutex<Slot<S>>,
}

impl<S: DiscoverySubstrate, E, C> Inner<S, E, C> {
    fn slot(&self) -> MutexGuard<'_, Slot<S>> {
        lock(&self.slot, "acquirer")
    }
}

struct Slot<S: DiscoverySubstrate> {
    state: AcquirerState,
    session: Option<ActiveSession>,
    browse: Option<(BrowseId, SubstrateLease<S>)>,
}

impl<S: DiscoverySubstrate> Slot<S> {
    fn is_current(&self, id: SessionId) -> bool {
        self.session.as_ref().is_some_and(|session| session.id == id)
    }

    fn reset(&mut self) -> Option<(BrowseId, SubstrateLease<S>)> {
        self.state = AcquirerState::Idle;
        self.session = None;
        self.browse.take()
    }
}

struct ActiveSession {
    id: SessionId,
    port: Option<u16>,
    reporter: Arc<SessionReporter>,
    cancel: CancellationToken,
}

fn stop_browse<S: DiscoverySubstrate>(browse: Option<(BrowseId, SubstrateLease<S>)>) {
    if let Some((id, lease)) = browse {
        lease.stop_browse(id);
        debug!(browse = id.0, "Browse stopped");
    }
}

impl<S: DiscoverySubstrate, E: TransferEngine, C: ContentStore> Acquirer<S, E, C> {
    /// Create an idle Acquirer
    pub fn new(
        hub: SubstrateHub<S>,
        engine: Arc<E>,
        store: Arc<C>,
        events: StatusSender,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                hub,
                engine,
                store,
                events,
                slot: Mutex::new(Slot {
                    state: AcquirerState::Idle,
                    session: None,
                    browse: None,
                }),
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> AcquirerState {
        self.inner.slot().state
    }

    /// Snapshot of the running session
    pub fn session(&self) -> Option<TransferSession> {
        let slot = self.inner.slot();
        slot.session.as_ref().map(|session| TransferSession {
            id: session.id,
            role: Role::Acquirer,
            port: session.port,
            bytes_reported: session.reporter.bytes_reported(),
            status: slot.state.status(),
        })
    }

    /// Start browsing for an advertised file
    ///
    /// Returns once the browse runs; resolution and the transfer continue
    /// in the background and report through the status bridge.
    ///
    /// # Errors
    ///
    /// - [`FlickError::AlreadyActive`] if a session is running.
    /// - [`FlickError::Discovery`] if the substrate could not be opened or
    ///   the browse could not start. A `Failed` event has been emitted.
    /// - [`FlickError::Cancelled`] if [`cancel`](Self::cancel) ran meanwhile.
    pub async fn begin(&self) -> Result<SessionId> {
        let id = SessionId::next();
        let reporter = Arc::new(SessionReporter::new(
            id,
            Role::Acquirer,
            self.inner.events.clone(),
        ));
        let cancel = CancellationToken::new();

        {
            let mut slot = self.inner.slot();
            if slot.state != AcquirerState::Idle {
                debug!(state = ?slot.state, "Acquirer busy, rejecting begin");
                return Err(FlickError::AlreadyActive(Role::Acquirer));
            }
            slot.state = AcquirerState::Browsing;
            slot.session = Some(ActiveSession {
                id,
                port: None,
                reporter: reporter.clone(),
                cancel: cancel.clone(),
            });
        }
        debug!(session = %id, "Acquirer Idle -> Browsing");

        let lease = match self.inner.hub.acquire() {
            Ok(lease) => lease,
            Err(e) => return Err(self.discovery_failed(id, &reporter, e).await),
        };
        let Browse { id: browse_id, events } = match lease.browse(SERVICE_TYPE) {
            Ok(browse) => browse,
            Err(e) => return Err(self.discovery_failed(id, &reporter, e).await),
        };

        let current = {
            let mut slot = self.inner.slot();
            let current = slot.is_current(id);
            if current {
                slot.browse = Some((browse_id, lease.clone()));
            }
            current
        };
        if !current {
            lease.stop_browse(browse_id);
            return Err(FlickError::Cancelled);
        }

        info!(session = %id, service_type = SERVICE_TYPE, "Browsing for peers");
        reporter
            .status(SessionStatus::Discovering, "Looking for devices...")
            .await;

        tokio::spawn(
            self.clone()
                .run_discovery(id, events, lease, reporter, cancel),
        );
        Ok(id)
    }

    /// Abandon the running session
    ///
    /// Stops browsing, signals the engine's cancellation token and emits
    /// `Cancelled`. Returns `false` when nothing was running.
    pub async fn cancel(&self) -> bool {
        let (session, browse) = {
            let mut slot = self.inner.slot();
            let Some(session) = slot.session.take() else {
                return false;
            };
            slot.state = AcquirerState::Idle;
            (session, slot.browse.take())
        };

        session.cancel.cancel();
        stop_browse(browse);
        info!(session = %session.id, "Acquirer cancelled");
        session
            .reporter
            .finish(Outcome::Cancelled("Stopped receiving".to_string()))
            .await;
        true
    }

    async fn discovery_failed(
        &self,
        id: SessionId,
        reporter: &SessionReporter,
        error: DiscoveryError,
    ) -> FlickError {
        if !self.fail(id, reporter, format!("Discovery failed: {error}")).await {
            return FlickError::Cancelled;
        }
        FlickError::Discovery(error)
    }

    /// Move a current session through `Failed` back to `Idle` and emit the
    /// failure; returns `false` if the session was already replaced
    async fn fail(&self, id: SessionId, reporter: &SessionReporter, message: String) -> bool {
        let browse = {
            let mut slot = self.inner.slot();
            if !slot.is_current(id) {
                return false;
            }
            debug!(session = %id, from = ?slot.state, "Acquirer -> Failed");
            slot.state = AcquirerState::Failed;
            slot.reset()
        };
        stop_browse(browse);
        warn!(session = %id, "{message}");
        reporter.finish(Outcome::Failed(message)).await;
        true
    }

    async fn run_discovery(
        self,
        id: SessionId,
        mut events: mpsc::Receiver<BrowseEvent>,
        lease: SubstrateLease<S>,
        reporter: Arc<SessionReporter>,
        cancel: CancellationToken,
    ) {
        let found = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(BrowseEvent::Found(service)) => break service,
                    Some(BrowseEvent::Lost(service)) => {
                        debug!(session = %id, service = %service.service_name, "Service lost while browsing");
                    }
                    None => {
                        self.fail(id, &reporter, "Discovery stopped. Try again.".to_string())
                            .await;
                        return;
                    }
                },
            }
        };
        drop(events);

        let browse = {
            let mut slot = self.inner.slot();
            if !slot.is_current(id) || slot.state != AcquirerState::Browsing {
                return;
            }
            slot.state = AcquirerState::Resolving;
            slot.browse.take()
        };
        stop_browse(browse);
        debug!(session = %id, "Acquirer Browsing -> Resolving");
        info!(session = %id, service = %found.service_name, "Peer found, resolving");

        let resolved = tokio::select! {
            _ = cancel.cancelled() => return,
            resolved = lease.resolve(&found) => resolved,
        };
        drop(lease);

        match resolved {
            Ok(peer) => {
                self.accept_resolution(id, peer).await;
            }
            Err(e) => {
                warn!(session = %id, code = e.code(), error = %e, "Resolve failed");
                self.fail(id, &reporter, "Resolve failed. Try again.".to_string())
                    .await;
            }
        }
    }

    /// Turn a resolution into a transfer attempt
    ///
    /// Returns `false` without side effects unless session `id` is current
    /// and still `Resolving`.
    pub(crate) async fn accept_resolution(&self, id: SessionId, peer: DiscoveredPeer) -> bool {
        let accepted = {
            let mut slot = self.inner.slot();
            if slot.is_current(id) && slot.state == AcquirerState::Resolving {
                slot.state = AcquirerState::Preparing;
                slot.session.as_mut().map(|session| {
                    session.port = Some(peer.port);
                    (session.reporter.clone(), session.cancel.clone())
                })
            } else {
                None
            }
        };
        let Some((reporter, cancel)) = accepted else {
            debug!(session = %id, service = %peer.service_name, "Ignoring resolution, session not resolving");
            return false;
        };
        debug!(session = %id, "Acquirer Resolving -> Preparing");

        let filename = peer
            .attributes
            .filename()
            .map(str::to_owned)
            .unwrap_or_else(|| fallback_filename(SystemTime::now()));
        let expected = peer.attributes.filesize();
        reporter.describe(&filename, expected);

        let destination = match self.inner.store.create_destination(&filename) {
            Ok(destination) => destination,
            Err(e) => {
                self.fail(id, &reporter, format!("Could not save {filename}: {e}"))
                    .await;
                return true;
            }
        };

        let current = {
            let mut slot = self.inner.slot();
            let current = slot.is_current(id);
            if current {
                slot.state = AcquirerState::Transferring;
            }
            current
        };
        if !current {
            debug!(
                session = %id,
                location = %destination.location,
                "Session ended while preparing, leaving empty destination"
            );
            return false;
        }

        let endpoint = peer.endpoint();
        debug!(session = %id, "Acquirer Preparing -> Transferring");
        info!(
            session = %id,
            %endpoint,
            file = %filename,
            expected,
            location = %destination.location,
            "Receiving"
        );
        reporter
            .status(
                SessionStatus::Transferring,
                format!("Downloading {filename} from {endpoint}"),
            )
            .await;

        tokio::spawn(self.clone().run_transfer(
            id,
            endpoint,
            destination,
            filename,
            expected,
            reporter,
            cancel,
        ));
        true
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_transfer(
        self,
        id: SessionId,
        endpoint: Endpoint,
        destination: Destination,
        filename: String,
        expected: u64,
        reporter: Arc<SessionReporter>,
        cancel: CancellationToken,
    ) {
        let Destination { handle, location } = destination;
        let engine = self.inner.engine.clone();
        let sink = ReceiveProgress {
            session: id,
            reporter: reporter.clone(),
        };
        let outcome =
            tokio::task::spawn_blocking(move || engine.receive(endpoint, handle, &sink, &cancel))
                .await;

        {
            let mut slot = self.inner.slot();
            if slot.is_current(id) {
                slot.state = AcquirerState::Finalizing;
                debug!(session = %id, "Acquirer Transferring -> Finalizing");
            }
        }

        let outcome = match outcome {
            Ok(Ok(report)) if expected > 0 && report.bytes < expected => {
                warn!(session = %id, bytes = report.bytes, expected, "Short receive");
                Outcome::Failed(format!(
                    "Download of {filename} incomplete: received {} of {expected} bytes. \
                     Partial file kept at {location}",
                    report.bytes
                ))
            }
            Ok(Ok(report)) => {
                info!(session = %id, bytes = report.bytes, %location, "Receive finished");
                Outcome::Completed(format!("Download Complete!\nFile saved: {location}"))
            }
            Ok(Err(e)) => {
                warn!(session = %id, error = %e, %location, "Receive failed, keeping partial file");
                Outcome::Failed(format!(
                    "Download of {filename} failed: {e}. Partial file kept at {location}"
                ))
            }
            Err(e) => {
                error!(session = %id, error = %e, "Receive worker stopped");
                Outcome::Failed(format!(
                    "Download of {filename} failed: worker stopped: {e}"
                ))
            }
        };

        {
            let mut slot = self.inner.slot();
            if slot.is_current(id) {
                slot.reset();
                debug!(session = %id, "Acquirer Finalizing -> Idle");
            }
        }
        if !reporter.finish(outcome).await {
            debug!(session = %id, "Discarding late engine result");
        }
    }
}

/// Progress sink handed to the engine for one receive
struct ReceiveProgress {
    session: SessionId,
    reporter: Arc<SessionReporter>,
}

impl ProgressSink for ReceiveProgress {
    fn on_progress(&self, bytes: u64) {
        self.reporter.progress(bytes);
    }

    fn on_connected(&self, peer: SocketAddr) {
        debug!(session = %self.session, %peer, "Connected to sender");
    }
}
