//! Transfer engine contract.
//!
//! An engine performs the byte-level transfer of one file over one stream
//! connection. Both operations block the calling thread until the transfer
//! ends, so the orchestration always runs them on a dedicated worker thread.
//!
//! Both calls are single-shot: one handle, one peer, one pass, no internal
//! retries. Progress is reported as a cumulative byte count at a bounded
//! interval, and cancellation is cooperative through a [`CancellationToken`].

use crate::advertisement::Endpoint;
use crate::handle::TransferHandle;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Receiver of engine progress
///
/// Called on the engine's thread. Implementations must not block for long.
pub trait ProgressSink {
    /// Cumulative number of bytes moved so far
    fn on_progress(&self, bytes: u64);

    /// The stream connection to `peer` is established
    fn on_connected(&self, _peer: SocketAddr) {}
}

impl<F: Fn(u64)> ProgressSink for F {
    fn on_progress(&self, bytes: u64) {
        self(bytes)
    }
}

/// Sink that ignores every report
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _bytes: u64) {}
}

/// Successful engine outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Total bytes moved
    pub bytes: u64,
    /// Remote side of the stream
    pub peer: Option<SocketAddr>,
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transfer successful, {} bytes", self.bytes)?;
        if let Some(peer) = self.peer {
            write!(f, " with {peer}")?;
        }
        Ok(())
    }
}

/// Engine failure, rendered as the engine's status text
#[derive(Debug, Error)]
pub enum EngineError {
    /// Listening socket could not be opened
    #[error("Bind error on port {port}: {source}")]
    Bind {
        /// Requested port
        port: u16,
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// Waiting for the peer failed
    #[error("Accept error: {source}")]
    Accept {
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// Outbound connection failed
    #[error("Connect error to {endpoint}: {source}")]
    Connect {
        /// Endpoint that was dialed
        endpoint: Endpoint,
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// Reading or writing failed mid-transfer
    #[error("Transfer interrupted after {bytes} bytes: {source}")]
    Io {
        /// Bytes moved before the error
        bytes: u64,
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// A configured deadline elapsed
    #[error("Timed out {stage} after {bytes} bytes")]
    Timeout {
        /// What the engine was waiting for
        stage: &'static str,
        /// Bytes moved before the deadline
        bytes: u64,
    },

    /// The cancellation token fired
    #[error("Transfer cancelled after {bytes} bytes")]
    Cancelled {
        /// Bytes moved before cancellation
        bytes: u64,
    },
}

impl EngineError {
    /// Bytes moved before the failure
    pub fn bytes_transferred(&self) -> u64 {
        match self {
            Self::Io { bytes, .. } | Self::Timeout { bytes, .. } | Self::Cancelled { bytes } => {
                *bytes
            }
            Self::Bind { .. } | Self::Accept { .. } | Self::Connect { .. } => 0,
        }
    }

    /// Whether the failure was caused by cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Result of one engine call
pub type EngineResult = Result<TransferReport, EngineError>;

/// Blocking byte-level transfer of one file
pub trait TransferEngine: Send + Sync + 'static {
    /// Listen on `port`, accept exactly one connection and stream `source`
    /// from its current position to the end
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] describing where the transfer stopped.
    fn send(
        &self,
        port: u16,
        source: TransferHandle,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> EngineResult;

    /// Connect to `endpoint` and write every received byte to `destination`
    /// until the peer closes the stream
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] describing where the transfer stopped.
    /// Bytes already written stay in the destination.
    fn receive(
        &self,
        endpoint: Endpoint,
        destination: TransferHandle,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> EngineResult;
}

/// Rate limiter for progress reports
///
/// Reports when at least `interval` bytes accumulated since the previous
/// report. The first count and the final count are always reported.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: u64,
    last: Option<u64>,
}

impl ProgressThrottle {
    /// Create a throttle; an interval of zero reports every count
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Report `total` if enough bytes accumulated
    pub fn advance(&mut self, total: u64, sink: &dyn ProgressSink) {
        let due = match self.last {
            None => true,
            Some(last) => total >= last.saturating_add(self.interval.max(1)),
        };
        if due {
            self.emit(total, sink);
        }
    }

    /// Report `total` unless it was the last count reported
    pub fn finish(&mut self, total: u64, sink: &dyn ProgressSink) {
        if self.last != Some(total) {
            self.emit(total, sink);
        }
    }

    fn emit(&mut self, total: u64, sink: &dyn ProgressSink) {
        self.last = Some(total);
        sink.on_progress(total);
    }
}
