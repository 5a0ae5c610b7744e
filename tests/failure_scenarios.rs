//! Failure paths through both roles: refused registration, failed discovery,
//! unusable destination, short transfers and user cancellation.

use flick_core::substrate::{FAILURE_MAX_LIMIT, FAILURE_TIMEOUT};
use flick_core::{
    AcquirerState, AdvertiserState, Attributes, DiscoveredPeer, DiscoveryError, FlickError, Role,
    SessionStatus, StatusEvent, StatusReceiver,
};
use flick_integration_tests::{Network, free_port, pattern, port_is_free, until_terminal, write_file};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::time::Duration;
use tempfile::TempDir;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn failed_message(events: &[StatusEvent]) -> &str {
    match events.last() {
        Some(StatusEvent::Failed { message, .. }) => message.as_str(),
        other => panic!("expected failure, got {other:?}"),
    }
}

/// Collect events up to and including the first progress report
async fn until_progress(events: &mut StatusReceiver) -> Vec<StatusEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(TEST_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            let stop = event.is_terminal() || matches!(event, StatusEvent::Progress { .. });
            seen.push(event);
            if stop {
                break;
            }
        }
    })
    .await;
    assert!(
        matches!(seen.last(), Some(StatusEvent::Progress { .. })),
        "no progress before: {seen:?}"
    );
    seen
}

/// Drain a cancelled session and check it ended exactly once, with nothing
/// arriving after the cancellation
async fn cancelled_once(
    events: &mut StatusReceiver,
    mut seen: Vec<StatusEvent>,
) -> Vec<StatusEvent> {
    seen.extend(until_terminal(events).await);
    // Long enough for the engine worker to notice and return
    tokio::time::sleep(Duration::from_millis(500)).await;
    while let Some(late) = events.try_recv() {
        seen.push(late);
    }
    assert_eq!(seen.iter().filter(|e| e.is_terminal()).count(), 1, "{seen:?}");
    assert!(
        matches!(seen.last(), Some(StatusEvent::Cancelled { .. })),
        "cancellation was not last: {seen:?}"
    );
    seen
}

/// Wait until nothing listens on `port` any more
async fn wait_for_release(port: u16) -> bool {
    for _ in 0..40 {
        if port_is_free(port) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// ----------------------------------------------------------------------------
// Advertiser setup failures
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_registration_failure_never_starts_engine() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let path = write_file(outbox.path(), "clip.mp4", 1000);
    let mut net = Network::new(inbox.path());
    net.substrate.fail_registrations(DiscoveryError::Registration {
        code: FAILURE_MAX_LIMIT,
        reason: "too many services".into(),
    });
    let port = free_port();

    let err = net.offer(&path, port).await.unwrap_err();
    assert!(matches!(err, FlickError::RegistrationFailed(ref e) if e.code() == FAILURE_MAX_LIMIT));

    let events = until_terminal(&mut net.advertiser_events).await;
    assert_eq!(events[0].status(), SessionStatus::Announcing);
    assert_eq!(
        failed_message(&events),
        "Announcement failed: registration failed with code 4: too many services"
    );

    assert!(port_is_free(port));
    assert_eq!(net.advertiser.state(), AdvertiserState::Idle);
    assert_eq!(net.substrate.register_count(), 0);
    assert_eq!(net.hub.holders(), 0);
}

#[tokio::test]
async fn test_advertiser_recovers_after_registration_failure() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let path = write_file(outbox.path(), "retry.txt", 2048);
    let mut net = Network::new(inbox.path());
    net.substrate.fail_registrations(DiscoveryError::Registration {
        code: FAILURE_MAX_LIMIT,
        reason: "busy".into(),
    });
    assert!(net.offer(&path, free_port()).await.is_err());
    until_terminal(&mut net.advertiser_events).await;

    net.substrate.heal();
    let (sent, received) = tokio::time::timeout(TEST_TIMEOUT, async {
        net.offer(&path, free_port()).await.unwrap();
        net.pick_up().await
    })
    .await
    .expect("transfer timed out");

    assert!(matches!(sent.last(), Some(StatusEvent::Completed { .. })));
    assert!(matches!(received.last(), Some(StatusEvent::Completed { .. })));
    assert_eq!(fs::read(inbox.path().join("retry.txt")).unwrap(), pattern(2048));
}

// ----------------------------------------------------------------------------
// Acquirer discovery failures
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_browse_failure_reported() {
    let inbox = TempDir::new().unwrap();
    let mut net = Network::new(inbox.path());
    net.substrate.fail_browses(DiscoveryError::Browse {
        code: FAILURE_MAX_LIMIT,
        reason: "no multicast".into(),
    });

    let err = net.acquirer.begin().await.unwrap_err();
    assert!(matches!(err, FlickError::Discovery(_)));

    let events = until_terminal(&mut net.acquirer_events).await;
    assert_eq!(events.len(), 1);
    assert_eq!(
        failed_message(&events),
        "Discovery failed: browse failed with code 4: no multicast"
    );
    assert_eq!(net.acquirer.state(), AcquirerState::Idle);
    assert_eq!(net.hub.holders(), 0);
}

#[tokio::test]
async fn test_resolve_failure_then_retry() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let path = write_file(outbox.path(), "slides.pdf", 64_000);
    let mut net = Network::new(inbox.path());
    net.substrate.fail_resolves(DiscoveryError::Resolve {
        code: FAILURE_TIMEOUT,
        reason: "no answer".into(),
    });

    tokio::time::timeout(TEST_TIMEOUT, async {
        net.offer(&path, free_port()).await.unwrap();
        net.acquirer.begin().await.unwrap();
        let events = until_terminal(&mut net.acquirer_events).await;
        assert_eq!(failed_message(&events), "Resolve failed. Try again.");
        assert_eq!(net.acquirer.state(), AcquirerState::Idle);
        assert_eq!(net.advertiser.state(), AdvertiserState::Waiting);

        net.substrate.heal();
        let (sent, received) = net.pick_up().await;
        assert!(matches!(sent.last(), Some(StatusEvent::Completed { .. })));
        assert!(matches!(received.last(), Some(StatusEvent::Completed { .. })));
    })
    .await
    .expect("transfer timed out");

    assert_eq!(
        fs::read(inbox.path().join("slides.pdf")).unwrap(),
        pattern(64_000)
    );
}

// ----------------------------------------------------------------------------
// Destination and transfer failures
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_destination_failure_leaves_sender_waiting() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let blocked = inbox.path().join("blocked");
    fs::write(&blocked, b"not a directory").unwrap();
    let path = write_file(outbox.path(), "report.pdf", 1000);
    let mut net = Network::new(&blocked);
    let port = free_port();

    tokio::time::timeout(TEST_TIMEOUT, async {
        net.offer(&path, port).await.unwrap();
        net.acquirer.begin().await.unwrap();
        let events = until_terminal(&mut net.acquirer_events).await;
        assert!(
            failed_message(&events).starts_with("Could not save report.pdf: "),
            "unexpected failure: {:?}",
            events.last()
        );
    })
    .await
    .expect("scenario timed out");

    assert_eq!(net.acquirer.state(), AcquirerState::Idle);
    assert_eq!(net.advertiser.state(), AdvertiserState::Waiting);

    assert!(net.advertiser.cancel().await);
    let events = until_terminal(&mut net.advertiser_events).await;
    match events.last() {
        Some(StatusEvent::Cancelled { role, message, .. }) => {
            assert_eq!(*role, Role::Advertiser);
            assert_eq!(message, "Stopped sharing report.pdf");
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(wait_for_release(port).await);
    assert_eq!(net.substrate.unregister_count(), 1);
}

#[tokio::test]
async fn test_short_receive_keeps_partial_file() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let path = write_file(outbox.path(), "big.bin", 100_000);
    let mut net = Network::new(inbox.path());

    let (sent, received) = tokio::time::timeout(TEST_TIMEOUT, async {
        net.offer(&path, free_port()).await.unwrap();
        // The advertised size stays at 100000
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(40_000)
            .unwrap();
        net.pick_up().await
    })
    .await
    .expect("transfer timed out");

    let message = failed_message(&received);
    assert!(
        message.starts_with("Download of big.bin incomplete: received 40000 of 100000 bytes."),
        "unexpected failure: {message}"
    );
    assert!(message.ends_with("big.bin"));
    assert!(matches!(sent.last(), Some(StatusEvent::Completed { bytes: 40_000, .. })));
    assert_eq!(
        fs::read(inbox.path().join("big.bin")).unwrap(),
        pattern(40_000)
    );
}

// ----------------------------------------------------------------------------
// Busy roles and cancellation
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_second_begin_rejected_while_active() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let path = write_file(outbox.path(), "one.txt", 100);
    let mut net = Network::new(inbox.path());

    // Nothing offered yet, so the receiver stays in Browsing
    net.acquirer.begin().await.unwrap();
    let err = net.acquirer.begin().await.unwrap_err();
    assert!(matches!(err, FlickError::AlreadyActive(Role::Acquirer)));
    assert_eq!(net.substrate.browse_count(), 1);
    assert!(net.acquirer.cancel().await);
    until_terminal(&mut net.acquirer_events).await;

    net.offer(&path, free_port()).await.unwrap();
    let err = net.offer(&path, free_port()).await.unwrap_err();
    assert!(matches!(err, FlickError::AlreadyActive(Role::Advertiser)));
    assert_eq!(net.substrate.register_count(), 1);
    assert_eq!(net.advertiser.state(), AdvertiserState::Waiting);

    assert!(net.advertiser.cancel().await);
    let events = until_terminal(&mut net.advertiser_events).await;
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn test_cancel_while_browsing() {
    let inbox = TempDir::new().unwrap();
    let mut net = Network::new(inbox.path());

    net.acquirer.begin().await.unwrap();
    assert_eq!(net.acquirer.state(), AcquirerState::Browsing);
    assert_eq!(net.substrate.active_browses(), 1);

    assert!(net.acquirer.cancel().await);
    assert!(!net.acquirer.cancel().await);

    let events = until_terminal(&mut net.acquirer_events).await;
    match events.last() {
        Some(StatusEvent::Cancelled { message, .. }) => assert_eq!(message, "Stopped receiving"),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert_eq!(net.acquirer.state(), AcquirerState::Idle);
    assert_eq!(net.substrate.active_browses(), 0);

    // The discovery worker lets go of its lease once it sees the cancellation
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(net.hub.holders(), 0);
    assert!(fs::read_dir(inbox.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn test_cancel_while_waiting_withdraws_and_frees_port() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let path = write_file(outbox.path(), "draft.doc", 500);
    let mut net = Network::new(inbox.path());
    let port = free_port();

    net.offer(&path, port).await.unwrap();
    assert_eq!(net.substrate.active_registrations().len(), 1);

    assert!(net.advertiser.cancel().await);
    let events = until_terminal(&mut net.advertiser_events).await;
    assert!(matches!(events.last(), Some(StatusEvent::Cancelled { .. })));
    assert!(net.substrate.active_registrations().is_empty());
    assert_eq!(net.substrate.unregister_count(), net.substrate.register_count());
    assert!(wait_for_release(port).await);

    // Nothing is on offer any more, so a receiver keeps looking
    net.acquirer.begin().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(net.acquirer.state(), AcquirerState::Browsing);
    assert!(net.acquirer.cancel().await);
}

#[tokio::test]
async fn test_cancel_while_transferring_as_sender() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let path = write_file(outbox.path(), "movie.mkv", 32 * 1024 * 1024);
    let mut net = Network::new(inbox.path());
    let port = free_port();
    net.offer(&path, port).await.unwrap();

    // Takes one chunk, then stops reading so the sender stalls mid-stream
    let mut stalled = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
    let mut chunk = vec![0u8; 64 * 1024];
    stalled.read_exact(&mut chunk).unwrap();
    assert_eq!(chunk, pattern(64 * 1024));

    let seen = until_progress(&mut net.advertiser_events).await;
    assert_eq!(net.advertiser.state(), AdvertiserState::Transferring);

    assert!(net.advertiser.cancel().await);
    let seen = cancelled_once(&mut net.advertiser_events, seen).await;
    assert_eq!(seen.last().unwrap().message(), "Stopped sharing movie.mkv");
    assert_eq!(net.advertiser.state(), AdvertiserState::Idle);
    assert!(net.substrate.active_registrations().is_empty());

    drop(stalled);
    assert!(wait_for_release(port).await);
}

#[tokio::test]
async fn test_cancel_while_transferring_as_receiver() {
    let inbox = TempDir::new().unwrap();
    let mut net = Network::new(inbox.path());
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let announced = 64 * 1024 * 1024;

    // Trickles bytes until the receiver hangs up
    let sender = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let chunk = pattern(16 * 1024);
        let mut sent = 0u64;
        while stream.write_all(&chunk).is_ok() {
            sent += chunk.len() as u64;
            std::thread::sleep(Duration::from_millis(20));
        }
        sent
    });
    net.substrate.offer(DiscoveredPeer {
        service_name: "FlickShare_slow_0001".to_string(),
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port,
        attributes: Attributes::for_file("stream.bin", announced),
    });

    net.acquirer.begin().await.unwrap();
    let seen = until_progress(&mut net.acquirer_events).await;
    assert_eq!(net.acquirer.state(), AcquirerState::Transferring);

    assert!(net.acquirer.cancel().await);
    let seen = cancelled_once(&mut net.acquirer_events, seen).await;
    assert_eq!(seen.last().unwrap().message(), "Stopped receiving");
    assert_eq!(net.acquirer.state(), AcquirerState::Idle);

    let sent = sender.join().unwrap();
    assert!(sent < announced);
    let kept = fs::metadata(inbox.path().join("stream.bin")).unwrap().len();
    assert!(kept <= sent);
}
