//! Blocking TCP transfer engine.
//!
//! There is no framing on the data connection. The sender writes the file's
//! bytes and shuts down its write half; the receiver reads until end of
//! stream. File name and size travel in the discovery attributes only.
//!
//! ```text
//! sender                               receiver
//!   listen(port) ------------------------ connect(host, port)
//!   accept once, close listener
//!   write bytes ------------------------> read, append to destination
//!   shutdown(write) --------------------> EOF: flush + sync
//!   wait for close <--------------------- close
//! ```
//!
//! Every blocking call wakes up at `poll_interval` to check the cancellation
//! token and the idle deadline.

use crate::config::EngineConfig;
use flick_core::{
    CancellationToken, Endpoint, EngineError, EngineResult, ProgressSink, ProgressThrottle,
    TransferEngine, TransferHandle, TransferReport,
};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// How long the sender waits for the receiver to close after the last byte
const CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Single-connection TCP engine
///
/// # Examples
///
/// ```no_run
/// use flick_core::{CancellationToken, NoProgress, TransferEngine, TransferHandle};
/// use flick_transport::{EngineConfig, TcpEngine};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = TcpEngine::new(EngineConfig::default());
/// let file = std::fs::File::open("photo.jpg")?;
/// let report = engine.send(24242, TransferHandle::new(file), &NoProgress, &CancellationToken::new())?;
/// println!("{report}");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct TcpEngine {
    config: EngineConfig,
}

/// Tracks how long a stream has been silent
struct IdleClock {
    limit: Option<Duration>,
    since: Instant,
}

impl IdleClock {
    fn new(limit: Option<Duration>) -> Self {
        Self {
            limit,
            since: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.since = Instant::now();
    }

    fn check(&self, stage: &'static str, bytes: u64) -> Result<(), EngineError> {
        match self.limit {
            Some(limit) if self.since.elapsed() >= limit => {
                Err(EngineError::Timeout { stage, bytes })
            }
            _ => Ok(()),
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

impl TcpEngine {
    /// Create an engine
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open the listening socket for one send
    ///
    /// Port 0 picks a free port; read it back with `local_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Bind`] if the socket cannot be set up.
    pub fn listen(&self, port: u16) -> Result<TcpListener, EngineError> {
        let addr = SocketAddr::new(self.config.bind_host, port);
        let bind = |source: io::Error| EngineError::Bind { port, source };

        let socket =
            Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind)?;
        socket.set_reuse_address(true).map_err(bind)?;
        socket.bind(&addr.into()).map_err(bind)?;
        socket.listen(1).map_err(bind)?;
        socket.set_nonblocking(true).map_err(bind)?;

        let listener: TcpListener = socket.into();
        debug!(addr = %listener.local_addr().unwrap_or(addr), "Listening for one peer");
        Ok(listener)
    }

    /// Accept exactly one peer on `listener` and stream `source` to it
    ///
    /// The listener is closed right after the accept so no second peer can
    /// connect.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] carrying the bytes sent so far.
    pub fn serve(
        &self,
        listener: TcpListener,
        source: TransferHandle,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> EngineResult {
        let (mut stream, peer) = self.accept_one(&listener, cancel)?;
        drop(listener);
        info!(%peer, "Peer connected");
        progress.on_connected(peer);

        self.tune(&stream);
        stream
            .set_write_timeout(Some(self.config.poll_interval))
            .map_err(|source| EngineError::Io { bytes: 0, source })?;

        let mut file = source.into_file();
        let mut buffer = vec![0u8; self.config.buffer_size];
        let mut throttle = ProgressThrottle::new(self.config.progress_interval);
        let mut idle = IdleClock::new(self.config.idle_timeout);
        let mut sent = 0u64;
        throttle.advance(sent, progress);

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled { bytes: sent });
            }
            let n = match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => return Err(EngineError::Io { bytes: sent, source }),
            };
            write_chunk(&mut stream, &buffer[..n], sent, cancel, &mut idle)?;
            sent += n as u64;
            throttle.advance(sent, progress);
        }

        stream
            .flush()
            .and_then(|()| stream.shutdown(Shutdown::Write))
            .map_err(|source| EngineError::Io { bytes: sent, source })?;
        throttle.finish(sent, progress);
        self.await_close(&mut stream, cancel);

        info!(bytes = sent, %peer, "Send complete");
        Ok(TransferReport {
            bytes: sent,
            peer: Some(peer),
        })
    }

    fn accept_one(
        &self,
        listener: &TcpListener,
        cancel: &CancellationToken,
    ) -> Result<(TcpStream, SocketAddr), EngineError> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled { bytes: 0 });
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream
                        .set_nonblocking(false)
                        .map_err(|source| EngineError::Accept { source })?;
                    return Ok((stream, peer));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if let Some(limit) = self.config.accept_timeout
                        && started.elapsed() >= limit
                    {
                        return Err(EngineError::Timeout {
                            stage: "waiting for a peer",
                            bytes: 0,
                        });
                    }
                    std::thread::sleep(self.config.poll_interval);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(source) => return Err(EngineError::Accept { source }),
            }
        }
    }

    /// Read until the receiver closes, bounded by [`CLOSE_WAIT`]
    fn await_close(&self, stream: &mut TcpStream, cancel: &CancellationToken) {
        if let Err(e) = stream.set_read_timeout(Some(self.config.poll_interval)) {
            debug!(error = %e, "Skipping close wait");
            return;
        }
        let started = Instant::now();
        let mut scratch = [0u8; 512];
        while started.elapsed() < CLOSE_WAIT && !cancel.is_cancelled() {
            match stream.read(&mut scratch) {
                Ok(0) => return,
                Ok(n) => trace!(bytes = n, "Ignoring data from receiver"),
                Err(e) if is_timeout(&e) || e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return,
            }
        }
        debug!("Receiver did not close in time");
    }

    fn tune(&self, stream: &TcpStream) {
        let Some(size) = self.config.socket_buffer else {
            return;
        };
        let socket = SockRef::from(stream);
        if let Err(e) = socket.set_send_buffer_size(size) {
            debug!(error = %e, "Could not size send buffer");
        }
        if let Err(e) = socket.set_recv_buffer_size(size) {
            debug!(error = %e, "Could not size receive buffer");
        }
    }
}

/// Write all of `chunk`, waking up to check cancellation and idleness
fn write_chunk(
    stream: &mut TcpStream,
    mut chunk: &[u8],
    sent: u64,
    cancel: &CancellationToken,
    idle: &mut IdleClock,
) -> Result<(), EngineError> {
    while !chunk.is_empty() {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled { bytes: sent });
        }
        match stream.write(chunk) {
            Ok(0) => {
                return Err(EngineError::Io {
                    bytes: sent,
                    source: ErrorKind::WriteZero.into(),
                });
            }
            Ok(n) => {
                chunk = &chunk[n..];
                idle.touch();
            }
            Err(e) if is_timeout(&e) => idle.check("sending", sent)?,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(source) => return Err(EngineError::Io { bytes: sent, source }),
        }
    }
    Ok(())
}

impl TransferEngine for TcpEngine {
    fn send(
        &self,
        port: u16,
        source: TransferHandle,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> EngineResult {
        let listener = self.listen(port)?;
        info!(port, "Waiting for peer");
        self.serve(listener, source, progress, cancel)
    }

    fn receive(
        &self,
        endpoint: Endpoint,
        destination: TransferHandle,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> EngineResult {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled { bytes: 0 });
        }

        let addr = endpoint.socket_addr();
        let mut stream =
            TcpStream::connect_timeout(&addr, self.config.connect_timeout).map_err(|source| {
                if source.kind() == ErrorKind::TimedOut {
                    EngineError::Timeout {
                        stage: "connecting",
                        bytes: 0,
                    }
                } else {
                    EngineError::Connect { endpoint, source }
                }
            })?;
        info!(%endpoint, "Connected to sender");
        progress.on_connected(addr);

        self.tune(&stream);
        stream
            .set_read_timeout(Some(self.config.poll_interval))
            .map_err(|source| EngineError::Io { bytes: 0, source })?;

        let mut file = destination.into_file();
        let mut buffer = vec![0u8; self.config.buffer_size];
        let mut throttle = ProgressThrottle::new(self.config.progress_interval);
        let mut idle = IdleClock::new(self.config.idle_timeout);
        let mut received = 0u64;
        throttle.advance(received, progress);

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled { bytes: received });
            }
            match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    file.write_all(&buffer[..n]).map_err(|source| EngineError::Io {
                        bytes: received,
                        source,
                    })?;
                    received += n as u64;
                    idle.touch();
                    throttle.advance(received, progress);
                }
                Err(e) if is_timeout(&e) => idle.check("receiving", received)?,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(EngineError::Io {
                        bytes: received,
                        source,
                    });
                }
            }
        }

        file.flush().map_err(|source| EngineError::Io {
            bytes: received,
            source,
        })?;
        if let Err(e) = file.sync_data() {
            warn!(error = %e, "Destination does not support sync");
        }
        throttle.finish(received, progress);

        info!(bytes = received, %endpoint, "Receive complete");
        Ok(TransferReport {
            bytes: received,
            peer: Some(addr),
        })
    }
}
