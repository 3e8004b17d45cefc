//! Shared fixtures for the integration tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use wirebus::protocol::{ContentType, FrameHeader};
use wirebus::{Executor, MessageCallback};

/// Executor with two worker threads, started.
pub fn started_executor() -> Arc<Executor> {
    init_logging();
    let executor = Arc::new(Executor::new());
    executor.start(2);
    executor
}

pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Poll `condition` every 10 ms until it holds or `timeout` elapses.
pub async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Callback that records every received payload for later assertions.
#[derive(Clone, Default)]
pub struct RecordingCallback {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }
}

impl MessageCallback for RecordingCallback {
    fn on_message(&self, payload: &[u8]) {
        self.frames.lock().unwrap().push(payload.to_vec());
    }
}

/// The on-wire encoding of one regular frame carrying `payload`.
pub fn encoded_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = FrameHeader::new(ContentType::RegularPayload, payload.len() as u64)
        .encode()
        .to_vec();
    frame.extend_from_slice(payload);
    frame
}
