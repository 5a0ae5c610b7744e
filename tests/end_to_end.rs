//! End-to-end transfers: Advertiser and Acquirer over the in-memory network,
//! bytes over real loopback TCP, files saved by `IncomingDir`.

use flick_core::{
    AcquirerState, AdvertiserState, Role, SessionStatus, StatusEvent, TransferHandle,
};
use flick_integration_tests::{
    LISTEN_GRACE, Network, free_port, pattern, progress_of, write_file,
};
use proptest::prelude::*;
use std::fs;
use std::io::{Seek, SeekFrom};
use std::time::Duration;
use tempfile::TempDir;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn assert_monotonic(progress: &[u64], limit: u64) {
    assert!(
        progress.windows(2).all(|w| w[0] <= w[1]),
        "progress went backwards: {progress:?}"
    );
    assert!(progress.iter().all(|&bytes| bytes <= limit));
}

// ----------------------------------------------------------------------------
// Successful handoff
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_file_reaches_receiver() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let len = 2 * 1024 * 1024;
    let path = write_file(outbox.path(), "holiday.jpg", len);
    let mut net = Network::new(inbox.path());

    let (sent, received) = tokio::time::timeout(TEST_TIMEOUT, async {
        net.offer(&path, free_port()).await.unwrap();
        net.pick_up().await
    })
    .await
    .expect("transfer timed out");

    let saved = inbox.path().join("holiday.jpg");
    match received.last() {
        Some(StatusEvent::Completed {
            role,
            bytes,
            message,
            ..
        }) => {
            assert_eq!(*role, Role::Acquirer);
            assert_eq!(*bytes, len as u64);
            assert_eq!(
                message,
                &format!("Download Complete!\nFile saved: {}", saved.display())
            );
        }
        other => panic!("expected completion, got {other:?}"),
    }
    match sent.last() {
        Some(StatusEvent::Completed { role, bytes, .. }) => {
            assert_eq!(*role, Role::Advertiser);
            assert_eq!(*bytes, len as u64);
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(fs::read(&saved).unwrap(), pattern(len));

    assert_eq!(received[0].status(), SessionStatus::Discovering);
    assert!(
        sent.iter()
            .any(|event| event.status() == SessionStatus::AwaitingPeer)
    );
    assert_monotonic(&progress_of(&sent), len as u64);
    assert_monotonic(&progress_of(&received), len as u64);
}

#[tokio::test]
async fn test_positioned_source_sends_remaining_bytes() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let path = write_file(outbox.path(), "tail.bin", 100_000);
    let mut net = Network::new(inbox.path());

    let mut file = fs::File::open(&path).unwrap();
    file.seek(SeekFrom::Start(40_000)).unwrap();

    let (sent, received) = tokio::time::timeout(TEST_TIMEOUT, async {
        net.advertiser
            .begin(TransferHandle::new(file), "tail.bin", free_port())
            .await
            .unwrap();
        tokio::time::sleep(LISTEN_GRACE).await;
        net.pick_up().await
    })
    .await
    .expect("transfer timed out");

    assert!(
        matches!(sent.last(), Some(StatusEvent::Completed { bytes: 60_000, .. })),
        "sender: {:?}",
        sent.last()
    );
    assert!(
        matches!(received.last(), Some(StatusEvent::Completed { bytes: 60_000, .. })),
        "receiver: {:?}",
        received.last()
    );
    let saved = fs::read(inbox.path().join("tail.bin")).unwrap();
    assert_eq!(saved, pattern(100_000)[40_000..]);
}

#[tokio::test]
async fn test_everything_released_after_transfer() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let path = write_file(outbox.path(), "notes.txt", 40_000);
    let mut net = Network::new(inbox.path());

    tokio::time::timeout(TEST_TIMEOUT, async {
        net.offer(&path, free_port()).await.unwrap();
        net.pick_up().await
    })
    .await
    .expect("transfer timed out");

    assert_eq!(net.advertiser.state(), AdvertiserState::Idle);
    assert_eq!(net.acquirer.state(), AcquirerState::Idle);
    assert!(net.advertiser.session().is_none());
    assert!(net.acquirer.session().is_none());

    assert_eq!(net.substrate.register_count(), 1);
    assert_eq!(net.substrate.unregister_count(), 1);
    assert!(net.substrate.active_registrations().is_empty());
    assert_eq!(net.substrate.active_browses(), 0);
    assert_eq!(net.hub.holders(), 0);
    assert!(!net.hub.is_open());
}

#[tokio::test]
async fn test_exactly_one_terminal_event_per_role() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let path = write_file(outbox.path(), "single.bin", 150_000);
    let mut net = Network::new(inbox.path());

    let (sent, received) = tokio::time::timeout(TEST_TIMEOUT, async {
        net.offer(&path, free_port()).await.unwrap();
        net.pick_up().await
    })
    .await
    .expect("transfer timed out");

    assert_eq!(sent.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(received.iter().filter(|e| e.is_terminal()).count(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Some(event) = net.advertiser_events.try_recv() {
        assert!(!event.is_terminal(), "late terminal event {event:?}");
    }
    while let Some(event) = net.acquirer_events.try_recv() {
        assert!(!event.is_terminal(), "late terminal event {event:?}");
    }
}

// ----------------------------------------------------------------------------
// Naming
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_existing_file_is_not_overwritten() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    fs::write(inbox.path().join("report.pdf"), b"keep me").unwrap();
    let path = write_file(outbox.path(), "report.pdf", 10_000);
    let mut net = Network::new(inbox.path());

    let (_, received) = tokio::time::timeout(TEST_TIMEOUT, async {
        net.offer(&path, free_port()).await.unwrap();
        net.pick_up().await
    })
    .await
    .expect("transfer timed out");

    assert!(matches!(received.last(), Some(StatusEvent::Completed { .. })));
    assert_eq!(
        fs::read(inbox.path().join("report.pdf")).unwrap(),
        b"keep me"
    );
    assert_eq!(
        fs::read(inbox.path().join("report (1).pdf")).unwrap(),
        pattern(10_000)
    );
}

#[tokio::test]
async fn test_incoming_directory_created_on_demand() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let root = inbox.path().join("Downloads").join("FlickShare");
    let path = write_file(outbox.path(), "song.ogg", 4096);
    let mut net = Network::new(&root);

    let (_, received) = tokio::time::timeout(TEST_TIMEOUT, async {
        net.offer(&path, free_port()).await.unwrap();
        net.pick_up().await
    })
    .await
    .expect("transfer timed out");

    assert!(matches!(received.last(), Some(StatusEvent::Completed { .. })));
    assert_eq!(fs::read(root.join("song.ogg")).unwrap(), pattern(4096));
}

// ----------------------------------------------------------------------------
// Reuse
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_roles_reusable_after_completion() {
    let outbox = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let first = write_file(outbox.path(), "first.txt", 5000);
    let second = write_file(outbox.path(), "second.txt", 7000);
    let mut net = Network::new(inbox.path());

    for path in [&first, &second] {
        let (sent, received) = tokio::time::timeout(TEST_TIMEOUT, async {
            net.offer(path, free_port()).await.unwrap();
            net.pick_up().await
        })
        .await
        .expect("transfer timed out");
        assert!(matches!(sent.last(), Some(StatusEvent::Completed { .. })));
        assert!(matches!(received.last(), Some(StatusEvent::Completed { .. })));
    }

    assert_eq!(fs::read(inbox.path().join("first.txt")).unwrap(), pattern(5000));
    assert_eq!(fs::read(inbox.path().join("second.txt")).unwrap(), pattern(7000));
    assert_eq!(net.substrate.register_count(), 2);
    assert_eq!(net.substrate.unregister_count(), 2);
    assert_eq!(net.hub.open_count(), 2);
}

// ----------------------------------------------------------------------------
// Property tests
// ----------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn prop_any_size_arrives_intact(len in 0usize..300_000) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let outbox = TempDir::new().unwrap();
        let inbox = TempDir::new().unwrap();
        let path = write_file(outbox.path(), "blob.bin", len);

        let (sent, received) = runtime.block_on(async {
            let mut net = Network::new(inbox.path());
            net.offer(&path, free_port()).await.unwrap();
            net.pick_up().await
        });

        let completed = matches!(received.last(), Some(StatusEvent::Completed { .. }));
        prop_assert!(completed, "receiver ended with {:?}", received.last());
        let completed = matches!(sent.last(), Some(StatusEvent::Completed { .. }));
        prop_assert!(completed, "sender ended with {:?}", sent.last());
        prop_assert_eq!(fs::read(inbox.path().join("blob.bin")).unwrap(), pattern(len));
    }
}
