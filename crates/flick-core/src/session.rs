//! Session identity and status shared by both roles

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Which side of a transfer a session drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Publishes a file and sends it
    Advertiser,
    /// Discovers a file and receives it
    Acquirer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Advertiser => f.write_str("advertiser"),
            Self::Acquirer => f.write_str("acquirer"),
        }
    }
}

/// Process-unique session identifier
///
/// Late results from a worker are matched against the current session id and
/// discarded when the session has since been cancelled or replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// User-visible status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Nothing running
    Idle,
    /// Registering an advertisement
    Announcing,
    /// Browsing, resolving or preparing a destination
    Discovering,
    /// Advertised and waiting for a peer to connect
    AwaitingPeer,
    /// Bytes are moving
    Transferring,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Abandoned by the user
    Cancelled,
}

impl SessionStatus {
    /// Whether a session in this status has ended
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot of one role's current session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSession {
    /// Session identifier
    pub id: SessionId,
    /// Role driving the session
    pub role: Role,
    /// Listening port (Advertiser) or resolved peer port (Acquirer)
    pub port: Option<u16>,
    /// Highest cumulative byte count reported so far
    pub bytes_reported: u64,
    /// Current status
    pub status: SessionStatus,
}

/// Lock a mutex, recovering the data if a previous holder panicked
///
/// Session slots hold plain data that stays consistent across a panic.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, name: &'static str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(lock = name, "Recovering poisoned lock");
        poisoned.into_inner()
    })
}
