//! Per-peer-rotation session on the subscriber side.
//!
//! A session keeps one live connection to some publisher out of an ordered
//! peer rotation. On any failure it advances to the next peer and retries
//! with exponential backoff; the backoff resets once a connection reaches
//! the established state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::config::SubscriberSessionConfig;
use crate::protocol::{
    read_frame, read_handshake, ContentType, FrameError, Handshake, FLAG_TRANSIENT_LOCAL,
};
use crate::subscriber::MessageCallback;

/// Reconnect backoff: 100 ms doubling to a 5 s cap, with jitter so a fleet
/// of subscribers does not reconnect in lockstep.
fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_jitter()
        .without_max_times()
}

/// One subscription with failover across a peer rotation.
///
/// Created through [`Subscriber::add_session`](crate::Subscriber::add_session).
pub struct SubscriberSession {
    peers: Vec<(String, u16)>,
    config: SubscriberSessionConfig,
    callback: Arc<dyn MessageCallback>,
    connected: AtomicBool,
    cancelled: AtomicBool,
    cancel: Notify,
}

impl SubscriberSession {
    pub(crate) fn new(
        peers: Vec<(String, u16)>,
        config: SubscriberSessionConfig,
        callback: Arc<dyn MessageCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peers,
            config,
            callback,
            connected: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel: Notify::new(),
        })
    }

    /// The configured peer rotation.
    pub fn peers(&self) -> &[(String, u16)] {
        &self.peers
    }

    /// Whether the session currently holds an established connection.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stop the dial loop and close any open connection.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel.notify_one();
    }

    /// Dial/reconnect loop. Spawned by the owning subscriber; exits only on
    /// cancellation.
    pub(crate) async fn run(self: Arc<Self>) {
        if self.peers.is_empty() {
            warn!("Subscriber session has no peers configured");
            return;
        }

        let mut peer_index = 0usize;
        let mut backoff = reconnect_backoff().build();
        let mut payload = Vec::new();

        while !self.cancelled.load(Ordering::SeqCst) {
            let (host, port) = &self.peers[peer_index];
            {
                let attempt = self.attempt(host, *port, &mut backoff, &mut payload);
                tokio::pin!(attempt);
                tokio::select! {
                    result = &mut attempt => self.log_attempt_end(host, *port, result),
                    _ = self.cancel.notified() => {}
                }
            }
            self.connected.store(false, Ordering::SeqCst);
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }

            peer_index = (peer_index + 1) % self.peers.len();
            let delay = backoff.next().unwrap_or(Duration::from_secs(5));
            trace!(delay_ms = delay.as_millis() as u64, "Backing off before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.notified() => break,
            }
        }
        debug!("Subscriber session stopped");
    }

    /// One connection attempt: resolve, connect, handshake, then receive
    /// frames until the connection fails.
    async fn attempt(
        &self,
        host: &str,
        port: u16,
        backoff: &mut ExponentialBackoff,
        payload: &mut Vec<u8>,
    ) -> Result<(), FrameError> {
        trace!(host, port, "Resolving peer");
        let mut addrs = tokio::net::lookup_host((host, port)).await?;
        let addr = addrs.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "peer resolved to no addresses")
        })?;

        trace!(peer = %addr, "Connecting");
        let stream = TcpStream::connect(addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        // The write half stays open (but silent) for the lifetime of the
        // connection; dropping it would half-close the stream and the
        // publisher would hang up.
        let (mut reader, mut writer) = stream.into_split();

        let flags = if self.config.request_transient_local {
            FLAG_TRANSIENT_LOCAL
        } else {
            0
        };
        writer
            .write_all(&Handshake::new(flags).encode_frame())
            .await?;
        let handshake = read_handshake(&mut reader, payload).await?;

        info!(
            peer = %addr,
            version = handshake.version,
            "Connected to publisher"
        );
        self.connected.store(true, Ordering::SeqCst);
        *backoff = reconnect_backoff().build();

        self.receive_loop(&mut reader, payload).await
    }

    async fn receive_loop(
        &self,
        reader: &mut OwnedReadHalf,
        payload: &mut Vec<u8>,
    ) -> Result<(), FrameError> {
        loop {
            let header = read_frame(reader, payload).await?;
            match header.content_type {
                // The callback borrows the payload; the buffer is reused for
                // the next frame as soon as it returns.
                ContentType::RegularPayload => self.callback.on_message(payload),
                ContentType::ProtocolHandshake => {
                    trace!("Ignoring handshake frame on an established connection");
                }
                ContentType::Unknown(content_type) => {
                    trace!(content_type, "Skipping frame with unknown content type");
                }
            }
        }
    }

    fn log_attempt_end(&self, host: &str, port: u16, result: Result<(), FrameError>) {
        match result {
            Ok(()) => {}
            Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(host, port, "Publisher closed the connection");
            }
            Err(FrameError::Io(e)) => {
                debug!(host, port, error = %e, "Connection failed");
            }
            Err(e) => {
                warn!(host, port, error = %e, "Protocol error, dropping connection");
            }
        }
    }
}
