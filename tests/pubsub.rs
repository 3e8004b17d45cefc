//! End-to-end pub/sub tests over loopback TCP.

mod common;

use std::sync::Arc;
use std::time::Duration;

use wirebus::{BusError, Publisher, Subscriber, TransientLocalConfig};

use common::{encoded_frame, started_executor, wait_for, RecordingCallback};

const TIMEOUT: Duration = Duration::from_secs(5);

fn loopback(port: u16) -> Vec<(String, u16)> {
    vec![("127.0.0.1".to_string(), port)]
}

// ============================================================================
// Smoke and framing
// ============================================================================

#[tokio::test]
async fn test_smoke_roundtrip_and_disconnect() {
    let executor = started_executor();
    let publisher = Publisher::new(executor.clone(), TransientLocalConfig::disabled());
    publisher.start("127.0.0.1", 0).unwrap();

    let port = publisher.port();
    assert!(port > 0);
    assert!(publisher.is_running());

    let callback = RecordingCallback::new();
    let subscriber = Subscriber::new(executor.clone());
    subscriber.add_session(loopback(port), callback.clone());

    assert!(wait_for(|| publisher.subscriber_count() == 1, TIMEOUT).await);

    publisher.send(b"hello").unwrap();
    assert!(wait_for(|| callback.count() == 1, TIMEOUT).await);
    assert_eq!(callback.frames()[0], b"hello");

    subscriber.cancel();
    assert!(wait_for(|| publisher.subscriber_count() == 0, TIMEOUT).await);

    publisher.cancel();
    executor.stop();
}

#[tokio::test]
async fn test_segmented_send_arrives_as_one_payload() {
    let executor = started_executor();
    let publisher = Publisher::new(executor.clone(), TransientLocalConfig::disabled());
    publisher.start("127.0.0.1", 0).unwrap();

    let callback = RecordingCallback::new();
    let subscriber = Subscriber::new(executor.clone());
    subscriber.add_session(loopback(publisher.port()), callback.clone());
    assert!(wait_for(|| publisher.subscriber_count() == 1, TIMEOUT).await);

    // 70000 bytes in three segments; the subscriber must observe a single
    // contiguous payload.
    let whole: Vec<u8> = (0..70000usize).map(|i| i as u8).collect();
    let (a, rest) = whole.split_at(10000);
    let (b, c) = rest.split_at(20000);
    publisher.send_segments(&[a, b, c]).unwrap();

    assert!(wait_for(|| callback.count() == 1, TIMEOUT).await);
    assert_eq!(callback.frames()[0], whole);

    publisher.cancel();
    executor.stop();
}

#[tokio::test]
async fn test_fan_out_delivers_identical_bytes_to_all_subscribers() {
    let executor = started_executor();
    let publisher = Publisher::new(executor.clone(), TransientLocalConfig::disabled());
    publisher.start("127.0.0.1", 0).unwrap();
    let port = publisher.port();

    let first = RecordingCallback::new();
    let second = RecordingCallback::new();
    let subscriber = Subscriber::new(executor.clone());
    subscriber.add_session(loopback(port), first.clone());
    subscriber.add_session(loopback(port), second.clone());
    assert!(wait_for(|| publisher.subscriber_count() == 2, TIMEOUT).await);

    publisher.send(b"broadcast").unwrap();

    assert!(wait_for(|| first.count() == 1 && second.count() == 1, TIMEOUT).await);
    assert_eq!(first.frames(), second.frames());
    assert_eq!(first.frames()[0], b"broadcast");

    publisher.cancel();
    executor.stop();
}

// ============================================================================
// Transient-local retention
// ============================================================================

#[tokio::test]
async fn test_count_eviction_replays_newest_frames_first() {
    let executor = started_executor();
    let publisher = Publisher::new(executor.clone(), TransientLocalConfig::with_max_count(3));
    publisher.start("127.0.0.1", 0).unwrap();

    // No subscriber yet; sends land in the retention buffer only.
    for payload in [&b"P1"[..], b"P2", b"P3", b"P4", b"P5"] {
        publisher.send(payload).unwrap();
    }

    let callback = RecordingCallback::new();
    let subscriber = Subscriber::new(executor.clone());
    subscriber.add_session(loopback(publisher.port()), callback.clone());

    assert!(wait_for(|| callback.count() >= 1, TIMEOUT).await);

    // The replay is one frame whose payload is the concatenated on-wire
    // encodings of the three surviving frames, oldest first.
    let mut expected = Vec::new();
    expected.extend_from_slice(&encoded_frame(b"P3"));
    expected.extend_from_slice(&encoded_frame(b"P4"));
    expected.extend_from_slice(&encoded_frame(b"P5"));
    assert_eq!(callback.frames()[0], expected);

    // Live frames follow the replay, never precede it.
    publisher.send(b"P6").unwrap();
    assert!(wait_for(|| callback.count() == 2, TIMEOUT).await);
    assert_eq!(callback.frames()[1], b"P6");

    publisher.cancel();
    executor.stop();
}

#[tokio::test]
async fn test_age_eviction_drops_expired_frames_from_replay() {
    let executor = started_executor();
    let config = TransientLocalConfig {
        buffer_max_count: 100,
        lifespan_ns: Duration::from_millis(50).as_nanos() as i64,
    };
    let publisher = Publisher::new(executor.clone(), config);
    publisher.start("127.0.0.1", 0).unwrap();

    publisher.send(b"old").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    publisher.send(b"fresh").unwrap();

    let callback = RecordingCallback::new();
    let subscriber = Subscriber::new(executor.clone());
    subscriber.add_session(loopback(publisher.port()), callback.clone());

    assert!(wait_for(|| callback.count() >= 1, TIMEOUT).await);
    assert_eq!(callback.frames()[0], encoded_frame(b"fresh"));

    publisher.cancel();
    executor.stop();
}

#[tokio::test]
async fn test_empty_retention_buffer_sends_no_replay() {
    let executor = started_executor();
    let publisher = Publisher::new(executor.clone(), TransientLocalConfig::with_max_count(3));
    publisher.start("127.0.0.1", 0).unwrap();

    let callback = RecordingCallback::new();
    let subscriber = Subscriber::new(executor.clone());
    subscriber.add_session(loopback(publisher.port()), callback.clone());
    assert!(wait_for(|| publisher.subscriber_count() == 1, TIMEOUT).await);

    publisher.send(b"live").unwrap();
    assert!(wait_for(|| callback.count() == 1, TIMEOUT).await);
    // First delivery is the live frame itself, not a replay wrapper.
    assert_eq!(callback.frames()[0], b"live");

    publisher.cancel();
    executor.stop();
}

// ============================================================================
// Failover and lifecycle
// ============================================================================

#[tokio::test]
async fn test_failover_rotates_to_reachable_peer() {
    let executor = started_executor();
    let publisher = Publisher::new(executor.clone(), TransientLocalConfig::disabled());
    publisher.start("127.0.0.1", 0).unwrap();

    // Port 1 refuses immediately; the rotation must move on to the live
    // publisher after backoff.
    let peers = vec![
        ("127.0.0.1".to_string(), 1),
        ("127.0.0.1".to_string(), publisher.port()),
    ];
    let callback = RecordingCallback::new();
    let subscriber = Subscriber::new(executor.clone());
    let session = subscriber.add_session(peers, callback.clone());

    assert!(wait_for(|| publisher.subscriber_count() == 1, Duration::from_secs(10)).await);
    assert!(session.is_connected());

    publisher.send(b"after failover").unwrap();
    assert!(wait_for(|| callback.count() == 1, TIMEOUT).await);

    publisher.cancel();
    executor.stop();
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_stops_sends() {
    let executor = started_executor();
    let publisher = Publisher::new(executor.clone(), TransientLocalConfig::disabled());
    publisher.start("127.0.0.1", 0).unwrap();

    let callback = RecordingCallback::new();
    let subscriber = Subscriber::new(executor.clone());
    subscriber.add_session(loopback(publisher.port()), callback.clone());
    assert!(wait_for(|| publisher.subscriber_count() == 1, TIMEOUT).await);

    publisher.cancel();
    publisher.cancel();

    assert!(!publisher.is_running());
    assert_eq!(publisher.port(), 0);
    assert!(wait_for(|| publisher.subscriber_count() == 0, TIMEOUT).await);
    assert!(matches!(publisher.send(b"too late"), Err(BusError::NotRunning)));

    executor.stop();
}

#[tokio::test]
async fn test_send_without_subscribers_short_circuits() {
    let executor = started_executor();
    let publisher = Publisher::new(executor.clone(), TransientLocalConfig::disabled());
    publisher.start("127.0.0.1", 0).unwrap();

    assert_eq!(publisher.subscriber_count(), 0);
    publisher.send(b"into the void").unwrap();

    publisher.cancel();
    executor.stop();
}

#[tokio::test]
async fn test_subscriber_reconnects_after_publisher_restart() {
    let executor = started_executor();
    let publisher = Publisher::new(executor.clone(), TransientLocalConfig::disabled());
    publisher.start("127.0.0.1", 0).unwrap();
    let port = publisher.port();

    let callback = RecordingCallback::new();
    let subscriber = Subscriber::new(executor.clone());
    subscriber.add_session(loopback(port), callback.clone());
    assert!(wait_for(|| publisher.subscriber_count() == 1, TIMEOUT).await);

    publisher.cancel();
    drop(publisher);

    // Same port, fresh publisher; the session's dial loop must find it.
    let revived = Publisher::new(executor.clone(), TransientLocalConfig::disabled());
    revived.start("127.0.0.1", port).unwrap();
    assert!(wait_for(|| revived.subscriber_count() == 1, Duration::from_secs(10)).await);

    revived.send(b"welcome back").unwrap();
    assert!(wait_for(|| callback.count() >= 1, TIMEOUT).await);
    assert_eq!(callback.frames().last().unwrap().as_slice(), b"welcome back");

    revived.cancel();
    executor.stop();
}
