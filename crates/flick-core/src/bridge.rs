//! Status bridge between engine worker threads and the single consumer.
//!
//! Engine progress arrives on whatever thread runs the blocking engine call.
//! The bridge moves it onto a bounded channel that one consumer drains.
//!
//! # Guarantees
//!
//! - Events of one session arrive in emission order.
//! - Progress byte counts of one session never decrease.
//! - Every session ends with exactly one terminal event
//!   (`Completed`, `Failed` or `Cancelled`), and nothing follows it.
//! - When the consumer falls behind, intermediate progress events are
//!   dropped at the sender. Status and terminal events always wait for room.
//!   [`StatusReceiver::recv_latest`] additionally folds queued progress into
//!   the newest value for consumers that only render the latest number.

use crate::session::{Role, SessionId, SessionStatus};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// One event delivered to the consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Non-terminal state change
    Status {
        /// Session the event belongs to
        session: SessionId,
        /// Role of the session
        role: Role,
        /// New status
        status: SessionStatus,
        /// Rendered text
        message: String,
    },
    /// Cumulative byte count from the engine
    Progress {
        /// Session the event belongs to
        session: SessionId,
        /// Role of the session
        role: Role,
        /// Bytes moved so far
        bytes: u64,
        /// Expected total, when advertised
        total: Option<u64>,
        /// Rendered text
        message: String,
    },
    /// Session finished successfully
    Completed {
        /// Session the event belongs to
        session: SessionId,
        /// Role of the session
        role: Role,
        /// Final byte count
        bytes: u64,
        /// Rendered text
        message: String,
    },
    /// Session finished with an error
    Failed {
        /// Session the event belongs to
        session: SessionId,
        /// Role of the session
        role: Role,
        /// Bytes moved before the failure
        bytes: u64,
        /// Rendered text
        message: String,
    },
    /// Session abandoned by the user
    Cancelled {
        /// Session the event belongs to
        session: SessionId,
        /// Role of the session
        role: Role,
        /// Bytes reported before cancellation
        bytes: u64,
        /// Rendered text
        message: String,
    },
}

impl StatusEvent {
    /// Session the event belongs to
    pub fn session(&self) -> SessionId {
        match self {
            Self::Status { session, .. }
            | Self::Progress { session, .. }
            | Self::Completed { session, .. }
            | Self::Failed { session, .. }
            | Self::Cancelled { session, .. } => *session,
        }
    }

    /// Role of the session
    pub fn role(&self) -> Role {
        match self {
            Self::Status { role, .. }
            | Self::Progress { role, .. }
            | Self::Completed { role, .. }
            | Self::Failed { role, .. }
            | Self::Cancelled { role, .. } => *role,
        }
    }

    /// Human-readable text
    pub fn message(&self) -> &str {
        match self {
            Self::Status { message, .. }
            | Self::Progress { message, .. }
            | Self::Completed { message, .. }
            | Self::Failed { message, .. }
            | Self::Cancelled { message, .. } => message,
        }
    }

    /// Status the session is in after this event
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::Status { status, .. } => *status,
            Self::Progress { .. } => SessionStatus::Transferring,
            Self::Completed { .. } => SessionStatus::Completed,
            Self::Failed { .. } => SessionStatus::Failed,
            Self::Cancelled { .. } => SessionStatus::Cancelled,
        }
    }

    /// Whether this is the last event of its session
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Whether this is a progress event
    pub fn is_progress(&self) -> bool {
        matches!(self, Self::Progress { .. })
    }
}

/// Constructor for the bridge channel
pub struct StatusBridge;

impl StatusBridge {
    /// Create a bounded bridge
    ///
    /// A capacity of zero is raised to one.
    pub fn channel(capacity: usize) -> (StatusSender, StatusReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            StatusSender { tx },
            StatusReceiver { rx, stash: None },
        )
    }
}

/// Producer side, cloned into every session
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: mpsc::Sender<StatusEvent>,
}

impl StatusSender {
    /// Whether the consumer has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side
#[derive(Debug)]
pub struct StatusReceiver {
    rx: mpsc::Receiver<StatusEvent>,
    stash: Option<StatusEvent>,
}

impl StatusReceiver {
    /// Next event in emission order
    ///
    /// Returns `None` once every sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        if let Some(event) = self.stash.take() {
            return Some(event);
        }
        self.rx.recv().await
    }

    /// Next event, folding consecutive queued progress of the same session
    /// into the most recent one
    pub async fn recv_latest(&mut self) -> Option<StatusEvent> {
        let mut latest = self.recv().await?;
        if !latest.is_progress() {
            return Some(latest);
        }

        while let Ok(next) = self.rx.try_recv() {
            if next.is_progress() && next.session() == latest.session() {
                latest = next;
            } else {
                self.stash = Some(next);
                break;
            }
        }
        Some(latest)
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.stash.take().or_else(|| self.rx.try_recv().ok())
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed(String),
    Failed(String),
    Cancelled(String),
}

/// Per-session event emitter shared between the orchestration task and the
/// engine worker thread
#[derive(Debug)]
pub(crate) struct SessionReporter {
    session: SessionId,
    role: Role,
    sender: StatusSender,
    label: Mutex<String>,
    total: AtomicU64,
    // last emitted byte count plus one, zero before the first report
    emitted: AtomicU64,
    // set once the terminal event is queued; held across every enqueue so
    // nothing can land behind the terminal event
    ended: Mutex<bool>,
}

/// Pause before retrying a worker-thread status send into a full channel
const FULL_BACKOFF: Duration = Duration::from_millis(5);

impl SessionReporter {
    pub(crate) fn new(session: SessionId, role: Role, sender: StatusSender) -> Self {
        Self {
            session,
            role,
            sender,
            label: Mutex::new(String::new()),
            total: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            ended: Mutex::new(false),
        }
    }

    /// Set the file name and expected size used in progress events
    pub(crate) fn describe(&self, label: &str, total: u64) {
        *crate::session::lock(&self.label, "reporter label") = label.to_string();
        self.total.store(total, Ordering::Release);
    }

    pub(crate) fn bytes_reported(&self) -> u64 {
        self.emitted.load(Ordering::Acquire).saturating_sub(1)
    }

    fn gate(&self) -> MutexGuard<'_, bool> {
        crate::session::lock(&self.ended, "reporter gate")
    }

    pub(crate) fn is_terminated(&self) -> bool {
        *self.gate()
    }

    fn status_event(&self, status: SessionStatus, message: String) -> StatusEvent {
        StatusEvent::Status {
            session: self.session,
            role: self.role,
            status,
            message,
        }
    }

    /// Emit a non-terminal status from async context
    pub(crate) async fn status(&self, status: SessionStatus, message: impl Into<String>) {
        let Ok(permit) = self.sender.tx.reserve().await else {
            trace!(session = %self.session, "Status consumer gone");
            return;
        };
        let ended = self.gate();
        if !*ended {
            permit.send(self.status_event(status, message.into()));
        }
    }

    /// Emit a non-terminal status from an engine worker thread
    ///
    /// Waits for room without holding the gate, so a concurrent
    /// [`finish`](Self::finish) is never blocked by a slow consumer.
    pub(crate) fn status_blocking(&self, status: SessionStatus, message: impl Into<String>) {
        let mut event = self.status_event(status, message.into());
        loop {
            {
                let ended = self.gate();
                if *ended {
                    return;
                }
                match self.sender.tx.try_send(event) {
                    Ok(()) => return,
                    Err(TrySendError::Closed(_)) => {
                        trace!(session = %self.session, "Status consumer gone");
                        return;
                    }
                    Err(TrySendError::Full(back)) => event = back,
                }
            }
            std::thread::sleep(FULL_BACKOFF);
        }
    }

    /// Record a cumulative byte count from the engine
    ///
    /// Counts that do not exceed the last emitted one are ignored.
    pub(crate) fn progress(&self, bytes: u64) {
        let ended = self.gate();
        if *ended {
            return;
        }
        let marker = bytes.saturating_add(1);
        if self.emitted.fetch_max(marker, Ordering::AcqRel) >= marker {
            return;
        }

        let label = crate::session::lock(&self.label, "reporter label").clone();
        let verb = match self.role {
            Role::Advertiser => "Sending",
            Role::Acquirer => "Downloading",
        };
        let total = self.total.load(Ordering::Acquire);
        let event = StatusEvent::Progress {
            session: self.session,
            role: self.role,
            bytes,
            total: (total > 0).then_some(total),
            message: format!("{verb} {label}: {} KB", bytes / 1024),
        };

        match self.sender.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!(session = %self.session, bytes, "Status channel full, progress coalesced");
            }
            Err(TrySendError::Closed(_)) => {}
        }
        drop(ended);
    }

    /// Emit the terminal event
    ///
    /// Returns `false` when the session already ended, in which case nothing
    /// is sent.
    pub(crate) async fn finish(&self, outcome: Outcome) -> bool {
        if self.is_terminated() {
            return false;
        }
        // Room first, so the gate is never held across an await
        let permit = self.sender.tx.reserve().await.ok();
        let mut ended = self.gate();
        if *ended {
            return false;
        }
        *ended = true;
        let bytes = self.bytes_reported();
        let (session, role) = (self.session, self.role);
        let event = match outcome {
            Outcome::Completed(message) => StatusEvent::Completed {
                session,
                role,
                bytes,
                message,
            },
            Outcome::Failed(message) => StatusEvent::Failed {
                session,
                role,
                bytes,
                message,
            },
            Outcome::Cancelled(message) => StatusEvent::Cancelled {
                session,
                role,
                bytes,
                message,
            },
        };
        match permit {
            Some(permit) => permit.send(event),
            None => trace!(session = %session, "Status consumer gone before terminal event"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter(role: Role, capacity: usize) -> (SessionReporter, StatusReceiver) {
        let (tx, rx) = StatusBridge::channel(capacity);
        (SessionReporter::new(SessionId::next(), role, tx), rx)
    }

    #[tokio::test]
    async fn test_progress_is_non_decreasing() {
        let (reporter, mut rx) = reporter(Role::Advertiser, 16);
        reporter.describe("photo.jpg", 4096);

        for bytes in [0, 1024, 512, 1024, 4096] {
            reporter.progress(bytes);
        }
        assert!(reporter.finish(Outcome::Completed("done".into())).await);

        let mut seen = Vec::new();
        while let Some(event) = rx.try_recv() {
            if let StatusEvent::Progress { bytes, total, .. } = &event {
                assert_eq!(*total, Some(4096));
                seen.push(*bytes);
            }
            if event.is_terminal() {
                assert_eq!(event.message(), "done");
            }
        }
        assert_eq!(seen, vec![0, 1024, 4096]);
        assert_eq!(reporter.bytes_reported(), 4096);
    }

    #[tokio::test]
    async fn test_progress_text() {
        let (reporter, mut rx) = reporter(Role::Acquirer, 4);
        reporter.describe("clip.mp4", 0);
        reporter.progress(3 * 1024 + 100);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.message(), "Downloading clip.mp4: 3 KB");
        assert!(matches!(event, StatusEvent::Progress { total: None, .. }));
    }

    #[tokio::test]
    async fn test_single_terminal_event() {
        let (reporter, mut rx) = reporter(Role::Advertiser, 8);

        assert!(reporter.finish(Outcome::Cancelled("stopped".into())).await);
        assert!(!reporter.finish(Outcome::Completed("late".into())).await);
        reporter.progress(10);
        reporter.status(SessionStatus::Transferring, "late").await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.status(), SessionStatus::Cancelled);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_nothing_follows_terminal_under_concurrent_progress() {
        for _ in 0..50 {
            // Room for every event, so `finish` never waits on a consumer
            let (reporter, mut rx) = reporter(Role::Advertiser, 8192);
            let reporter = std::sync::Arc::new(reporter);
            let worker = reporter.clone();
            let start = std::sync::Arc::new(std::sync::Barrier::new(2));
            let go = start.clone();
            let handle = std::thread::spawn(move || {
                go.wait();
                for bytes in 1..=5000u64 {
                    worker.progress(bytes);
                    if bytes % 500 == 0 {
                        worker.status_blocking(SessionStatus::Transferring, "still going");
                    }
                }
            });

            start.wait();
            assert!(reporter.finish(Outcome::Cancelled("stopped".into())).await);
            handle.join().unwrap();

            let mut last_progress = 0;
            let mut terminal = None;
            while let Some(event) = rx.try_recv() {
                assert!(terminal.is_none(), "{event:?} arrived after the terminal event");
                match event {
                    StatusEvent::Progress { bytes, .. } => last_progress = bytes,
                    StatusEvent::Cancelled { bytes, .. } => terminal = Some(bytes),
                    _ => {}
                }
            }
            assert_eq!(terminal, Some(last_progress));
        }
    }

    #[tokio::test]
    async fn test_full_channel_drops_progress_not_terminal() {
        let (reporter, mut rx) = reporter(Role::Advertiser, 2);
        for bytes in 1..=10u64 {
            reporter.progress(bytes * 100);
        }

        let consumer = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                let done = event.is_terminal();
                events.push(event);
                if done {
                    break;
                }
            }
            events
        });
        reporter.finish(Outcome::Completed("ok".into())).await;

        let events = consumer.await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.last().unwrap().is_terminal());
        if let StatusEvent::Completed { bytes, .. } = events.last().unwrap() {
            assert_eq!(*bytes, 1000);
        }
    }

    #[tokio::test]
    async fn test_recv_latest_coalesces_progress() {
        let (reporter, mut rx) = reporter(Role::Acquirer, 16);
        reporter.status(SessionStatus::Transferring, "go").await;
        for bytes in [100, 200, 300] {
            reporter.progress(bytes);
        }
        reporter.finish(Outcome::Completed("ok".into())).await;

        assert_eq!(rx.recv_latest().await.unwrap().message(), "go");
        match rx.recv_latest().await.unwrap() {
            StatusEvent::Progress { bytes, .. } => assert_eq!(bytes, 300),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.recv_latest().await.unwrap().is_terminal());
    }

    #[test]
    fn test_status_blocking_from_worker_thread() {
        let (reporter, mut rx) = reporter(Role::Advertiser, 4);
        let reporter = std::sync::Arc::new(reporter);
        let worker = reporter.clone();
        std::thread::spawn(move || {
            worker.status_blocking(SessionStatus::Transferring, "Connected");
        })
        .join()
        .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.status(), SessionStatus::Transferring);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = StatusEvent::Progress {
            session: SessionId::next(),
            role: Role::Acquirer,
            bytes: 42,
            total: Some(100),
            message: "Downloading a: 0 KB".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "progress");
        assert_eq!(json["role"], "acquirer");
        assert_eq!(json["bytes"], 42);
        assert_eq!(json["total"], 100);
    }
}
