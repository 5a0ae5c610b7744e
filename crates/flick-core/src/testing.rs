//! Deterministic collaborators for tests.
//!
//! - [`MemorySubstrate`]: an in-process "network". Registrations become
//!   visible to every browse on the same instance (clones share state) and
//!   resolve to `127.0.0.1`. Failures can be injected per operation.
//! - [`ScriptedEngine`]: replays a fixed sequence of progress counts, writes a
//!   fixed payload on receive and ends with a scripted outcome.
//! - [`ScratchStore`]: creates destinations in a caller-supplied directory.

use crate::advertisement::{Advertisement, DiscoveredPeer, Endpoint};
use crate::bridge::{StatusEvent, StatusReceiver};
use crate::engine::{EngineError, EngineResult, ProgressSink, TransferEngine, TransferReport};
use crate::error::{FlickError, Result};
use crate::handle::TransferHandle;
use crate::session::lock;
use crate::store::{ContentStore, Destination, SourceFile};
use crate::substrate::{
    Browse, BrowseEvent, BrowseId, DiscoveryError, DiscoverySubstrate, FAILURE_INTERNAL_ERROR,
    Registration, ServiceRef,
};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const BROWSE_CAPACITY: usize = 32;

/// Longest a helper waits for a session to end
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Collect events until the first terminal event
///
/// Stops early when the bridge closes or [`SESSION_TIMEOUT`] elapses, so
/// callers should assert on the last event.
pub async fn until_terminal(events: &mut StatusReceiver) -> Vec<StatusEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(SESSION_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            let done = event.is_terminal();
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    seen
}

fn service_key(service_name: &str, service_type: &str) -> String {
    format!("{service_name}.{service_type}")
}

/// In-process discovery substrate
#[derive(Clone, Default)]
pub struct MemorySubstrate {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    services: BTreeMap<String, DiscoveredPeer>,
    service_types: HashMap<String, String>,
    registrations: HashMap<String, Advertisement>,
    history: Vec<Advertisement>,
    browsers: HashMap<u64, (String, mpsc::Sender<BrowseEvent>)>,
    register_failure: Option<DiscoveryError>,
    browse_failure: Option<DiscoveryError>,
    resolve_failure: Option<DiscoveryError>,
    registers: usize,
    unregisters: usize,
    browses: usize,
    stopped_browses: usize,
    resolves: usize,
    shutdowns: usize,
    next_browse: u64,
}

impl MemoryState {
    fn announce(&self, service_type: &str, event: BrowseEvent) {
        for (browsed, tx) in self.browsers.values() {
            if browsed == service_type {
                let _ = tx.try_send(event.clone());
            }
        }
    }

    fn publish(&mut self, service_type: &str, peer: DiscoveredPeer) {
        let key = service_key(&peer.service_name, service_type);
        let service = ServiceRef {
            service_name: peer.service_name.clone(),
            service_type: service_type.to_string(),
            key: key.clone(),
        };
        self.services.insert(key.clone(), peer);
        self.service_types.insert(key, service_type.to_string());
        self.announce(service_type, BrowseEvent::Found(service));
    }

    fn retract(&mut self, key: &str) {
        if let (Some(peer), Some(service_type)) =
            (self.services.remove(key), self.service_types.remove(key))
        {
            let service = ServiceRef {
                service_name: peer.service_name,
                service_type: service_type.clone(),
                key: key.to_string(),
            };
            self.announce(&service_type, BrowseEvent::Lost(service));
        }
    }
}

impl MemorySubstrate {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        lock(&self.state, "memory substrate")
    }

    /// Make a foreign service visible to browses of `crate::SERVICE_TYPE`
    pub fn offer(&self, peer: DiscoveredPeer) {
        self.state().publish(crate::SERVICE_TYPE, peer);
    }

    /// Remove a foreign service by instance name
    pub fn withdraw_offer(&self, service_name: &str) {
        self.state()
            .retract(&service_key(service_name, crate::SERVICE_TYPE));
    }

    /// Fail every following registration with `error`
    pub fn fail_registrations(&self, error: DiscoveryError) {
        self.state().register_failure = Some(error);
    }

    /// Fail every following browse with `error`
    pub fn fail_browses(&self, error: DiscoveryError) {
        self.state().browse_failure = Some(error);
    }

    /// Fail every following resolve with `error`
    pub fn fail_resolves(&self, error: DiscoveryError) {
        self.state().resolve_failure = Some(error);
    }

    /// Clear injected failures
    pub fn heal(&self) {
        let mut state = self.state();
        state.register_failure = None;
        state.browse_failure = None;
        state.resolve_failure = None;
    }

    /// Successful registrations so far
    pub fn register_count(&self) -> usize {
        self.state().registers
    }

    /// Unregister calls so far
    pub fn unregister_count(&self) -> usize {
        self.state().unregisters
    }

    /// Registrations not yet withdrawn
    pub fn active_registrations(&self) -> Vec<Advertisement> {
        self.state().registrations.values().cloned().collect()
    }

    /// Every advertisement ever registered, in order
    pub fn registered(&self) -> Vec<Advertisement> {
        self.state().history.clone()
    }

    /// Browses started so far
    pub fn browse_count(&self) -> usize {
        self.state().browses
    }

    /// Browses stopped so far
    pub fn stopped_browse_count(&self) -> usize {
        self.state().stopped_browses
    }

    /// Browses still running
    pub fn active_browses(&self) -> usize {
        self.state().browsers.len()
    }

    /// Resolve calls so far
    pub fn resolve_count(&self) -> usize {
        self.state().resolves
    }

    /// Shutdown calls so far
    pub fn shutdown_count(&self) -> usize {
        self.state().shutdowns
    }
}

impl DiscoverySubstrate for MemorySubstrate {
    async fn register(
        &self,
        advertisement: &Advertisement,
    ) -> std::result::Result<Registration, DiscoveryError> {
        let mut state = self.state();
        if let Some(error) = state.register_failure.clone() {
            return Err(error);
        }

        let key = service_key(&advertisement.service_name, &advertisement.service_type);
        state.registers += 1;
        state
            .registrations
            .insert(key.clone(), advertisement.clone());
        state.history.push(advertisement.clone());
        let peer = DiscoveredPeer {
            service_name: advertisement.service_name.clone(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: advertisement.port,
            attributes: advertisement.attributes.clone(),
        };
        state.publish(&advertisement.service_type, peer);

        Ok(Registration {
            service_name: advertisement.service_name.clone(),
            key,
        })
    }

    fn unregister(&self, registration: &Registration) -> std::result::Result<(), DiscoveryError> {
        let mut state = self.state();
        state.unregisters += 1;
        if state.registrations.remove(&registration.key).is_none() {
            return Err(DiscoveryError::Unregister(format!(
                "{} is not registered",
                registration.service_name
            )));
        }
        state.retract(&registration.key);
        Ok(())
    }

    fn browse(&self, service_type: &str) -> std::result::Result<Browse, DiscoveryError> {
        let mut state = self.state();
        if let Some(error) = state.browse_failure.clone() {
            return Err(error);
        }

        let (tx, events) = mpsc::channel(BROWSE_CAPACITY);
        for (key, peer) in &state.services {
            if state.service_types.get(key).map(String::as_str) == Some(service_type) {
                let _ = tx.try_send(BrowseEvent::Found(ServiceRef {
                    service_name: peer.service_name.clone(),
                    service_type: service_type.to_string(),
                    key: key.clone(),
                }));
            }
        }

        state.next_browse += 1;
        state.browses += 1;
        let id = state.next_browse;
        state.browsers.insert(id, (service_type.to_string(), tx));
        Ok(Browse {
            id: BrowseId(id),
            events,
        })
    }

    fn stop_browse(&self, id: BrowseId) {
        let mut state = self.state();
        if state.browsers.remove(&id.0).is_some() {
            state.stopped_browses += 1;
        }
    }

    async fn resolve(
        &self,
        service: &ServiceRef,
    ) -> std::result::Result<DiscoveredPeer, DiscoveryError> {
        let mut state = self.state();
        state.resolves += 1;
        if let Some(error) = state.resolve_failure.clone() {
            return Err(error);
        }
        state
            .services
            .get(&service.key)
            .cloned()
            .ok_or_else(|| DiscoveryError::Resolve {
                code: FAILURE_INTERNAL_ERROR,
                reason: format!("{} is gone", service.service_name),
            })
    }

    fn shutdown(&self) -> std::result::Result<(), DiscoveryError> {
        let mut state = self.state();
        state.shutdowns += 1;
        state.browsers.clear();
        Ok(())
    }
}

/// Engine that replays a script instead of touching the network
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    steps: Vec<u64>,
    payload: Vec<u8>,
    failure: Option<String>,
    peer: Option<SocketAddr>,
    hold: bool,
    step_delay: Duration,
    calls: AtomicUsize,
    sends: Mutex<Vec<u16>>,
    receives: Mutex<Vec<Endpoint>>,
}

impl ScriptedEngine {
    /// Report `steps` and succeed
    pub fn succeeding(steps: impl Into<Vec<u64>>) -> Self {
        Self {
            steps: steps.into(),
            ..Self::default()
        }
    }

    /// Report `steps` and fail with a connection reset carrying `message`
    pub fn failing(steps: impl Into<Vec<u64>>, message: impl Into<String>) -> Self {
        Self {
            steps: steps.into(),
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    /// Bytes written to the destination on receive
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Report a connected peer before any progress
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// After the script, block until cancelled
    pub fn holding(mut self) -> Self {
        self.hold = true;
        self
    }

    /// Pause between progress steps
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Engine invocations so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Ports passed to `send`
    pub fn send_ports(&self) -> Vec<u16> {
        lock(&self.sends, "scripted sends").clone()
    }

    /// Endpoints passed to `receive`
    pub fn receive_endpoints(&self) -> Vec<Endpoint> {
        lock(&self.receives, "scripted receives").clone()
    }

    fn run(
        &self,
        destination: Option<File>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> EngineResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(peer) = self.peer {
            progress.on_connected(peer);
        }
        if let Some(mut file) = destination {
            file.write_all(&self.payload)
                .and_then(|()| file.flush())
                .map_err(|source| EngineError::Io { bytes: 0, source })?;
        }

        let mut moved = if self.steps.is_empty() {
            self.payload.len() as u64
        } else {
            0
        };
        for step in &self.steps {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled { bytes: moved });
            }
            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }
            progress.on_progress(*step);
            moved = *step;
        }

        if self.hold {
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            return Err(EngineError::Cancelled { bytes: moved });
        }

        match &self.failure {
            Some(message) => Err(EngineError::Io {
                bytes: moved,
                source: io::Error::new(io::ErrorKind::ConnectionReset, message.clone()),
            }),
            None => Ok(TransferReport {
                bytes: moved,
                peer: self.peer,
            }),
        }
    }
}

impl TransferEngine for ScriptedEngine {
    fn send(
        &self,
        port: u16,
        source: TransferHandle,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> EngineResult {
        lock(&self.sends, "scripted sends").push(port);
        drop(source);
        self.run(None, progress, cancel)
    }

    fn receive(
        &self,
        endpoint: Endpoint,
        destination: TransferHandle,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> EngineResult {
        lock(&self.receives, "scripted receives").push(endpoint);
        self.run(Some(destination.into_file()), progress, cancel)
    }
}

/// Store that creates destinations in a fixed directory
#[derive(Debug)]
pub struct ScratchStore {
    root: PathBuf,
    failure: Option<String>,
    created: Mutex<Vec<PathBuf>>,
}

impl ScratchStore {
    /// Store rooted at `root`, which must exist
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            failure: None,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Store whose destination creation always fails
    pub fn failing(root: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::new(root)
        }
    }

    /// Paths of destinations created so far
    pub fn created(&self) -> Vec<PathBuf> {
        lock(&self.created, "scratch store").clone()
    }
}

impl ContentStore for ScratchStore {
    fn open_source(&self, path: &Path) -> Result<SourceFile> {
        let file = File::open(path).map_err(|e| FlickError::SourceOpenFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let display_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(SourceFile {
            handle: TransferHandle::new(file),
            display_name,
        })
    }

    fn create_destination(&self, display_name: &str) -> Result<Destination> {
        if let Some(reason) = &self.failure {
            return Err(FlickError::DestinationCreateFailed {
                name: display_name.to_string(),
                reason: reason.clone(),
            });
        }
        let path = self.root.join(display_name);
        let file = File::create(&path).map_err(|e| FlickError::DestinationCreateFailed {
            name: display_name.to_string(),
            reason: e.to_string(),
        })?;
        lock(&self.created, "scratch store").push(path.clone());
        Ok(Destination {
            handle: TransferHandle::new(file),
            location: path.display().to_string(),
        })
    }
}
