//! Publisher: listen, accept, fan out, retain.
//!
//! A publisher owns a listening socket and a set of per-subscriber
//! sessions. `send` serializes the payload into one pooled frame on the
//! caller's thread and enqueues it to every established session; sessions
//! that still have a write in flight drop the frame rather than queue it.
//! With transient-local retention enabled, sent frames are also kept (up to
//! a count and age limit) and replayed to new subscribers on connect.

mod retention;
pub(crate) mod session;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Notify;
use tracing::{debug, error, info, trace};

use crate::config::TransientLocalConfig;
use crate::error::{BusError, Result};
use crate::executor::Executor;
use crate::pool::{BufferPool, SharedFrame};
use crate::protocol::{ContentType, FrameHeader, FLAG_TRANSIENT_LOCAL, HEADER_SIZE};
use retention::TransientLocalBuffer;
use session::PublisherSession;

/// Listen backlog passed to the OS; the kernel clamps it to its own maximum.
const LISTEN_BACKLOG: u32 = 1024;

/// Fan-out publisher over TCP.
///
/// Construct with [`Publisher::new`], then [`start`](Publisher::start) to
/// bind and begin accepting subscribers. Dropping the publisher cancels it.
pub struct Publisher {
    executor: Arc<Executor>,
    config: TransientLocalConfig,
    pool: Arc<BufferPool>,
    sessions: Mutex<Vec<Arc<PublisherSession>>>,
    retained: Mutex<TransientLocalBuffer>,
    started: AtomicBool,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Arc<Notify>,
}

impl Publisher {
    /// Create a publisher on the given executor. The publisher shares
    /// ownership of the executor; sessions refer back to the publisher only
    /// weakly, so dropping the last user handle shuts everything down.
    pub fn new(executor: Arc<Executor>, config: TransientLocalConfig) -> Arc<Self> {
        Arc::new(Self {
            executor,
            retained: Mutex::new(TransientLocalBuffer::new(config.clone())),
            config,
            pool: BufferPool::new(),
            sessions: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Bind `address:port` and start accepting subscribers.
    ///
    /// Port 0 binds an ephemeral port; query it with [`port`](Publisher::port).
    /// Every setup step is fallible and logged; on failure the publisher is
    /// left non-running with no partial state.
    pub fn start(self: &Arc<Self>, address: &str, port: u16) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            error!("Publisher can only be started once");
            return Err(BusError::AlreadyRunning);
        }
        self.try_start(address, port).inspect_err(|_| {
            // Failed setup leaves no partial state; a corrected retry is fine.
            self.started.store(false, Ordering::SeqCst);
        })
    }

    fn try_start(self: &Arc<Self>, address: &str, port: u16) -> Result<()> {
        let ip: IpAddr = address.parse().map_err(|source| {
            error!(address, port, "Failed to parse publisher address");
            BusError::InvalidAddress {
                address: address.to_string(),
                source,
            }
        })?;
        let addr = SocketAddr::new(ip, port);

        let handle = self.executor.handle().ok_or_else(|| {
            error!(endpoint = %addr, "Publisher started on a stopped executor");
            BusError::ExecutorNotStarted
        })?;

        let listener = self.listen(addr, &handle)?;
        let local = listener.local_addr().map_err(|source| {
            error!(endpoint = %addr, error = %source, "Failed to query bound endpoint");
            BusError::Listen {
                step: "local_addr",
                source,
            }
        })?;

        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local);
        self.running.store(true, Ordering::SeqCst);
        info!(endpoint = %local, "Publisher created and waiting for subscribers");

        let publisher = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        handle.spawn(Self::accept_loop(publisher, listener, shutdown));

        Ok(())
    }

    /// open -> reuse-address -> bind -> listen, each step surfaced on its own.
    fn listen(&self, addr: SocketAddr, handle: &tokio::runtime::Handle) -> Result<TcpListener> {
        let fail = |step: &'static str, source: std::io::Error| {
            error!(endpoint = %addr, step, error = %source, "Failed to start publisher");
            BusError::Listen { step, source }
        };

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| fail("open", e))?;

        socket
            .set_reuseaddr(true)
            .map_err(|e| fail("reuse_address", e))?;
        socket.bind(addr).map_err(|e| fail("bind", e))?;

        // listen registers with the I/O driver, so it needs the runtime
        // context even on this non-worker thread.
        let _guard = handle.enter();
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| fail("listen", e))
    }

    async fn accept_loop(
        publisher: Weak<Publisher>,
        listener: TcpListener,
        shutdown: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Publisher shutting down, stopping accept loop");
                    return;
                }
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Error while waiting for subscriber");
                            return;
                        }
                    };
                    let Some(publisher) = publisher.upgrade() else {
                        return;
                    };
                    info!(remote = %remote, "Subscriber connected");

                    let flags = if publisher.config.enabled() {
                        FLAG_TRANSIENT_LOCAL
                    } else {
                        0
                    };
                    let session =
                        PublisherSession::new(remote, Arc::downgrade(&publisher), flags);
                    tokio::spawn(session.run(stream));
                }
            }
        }
    }

    /// Send one payload to every connected subscriber.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.send_segments(&[payload])
    }

    /// Send a payload assembled from several segments. The segments are
    /// serialized back-to-back into a single frame; subscribers observe one
    /// contiguous payload.
    pub fn send_segments(&self, segments: &[&[u8]]) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            error!("Tried to send data on a non-running publisher");
            return Err(BusError::NotRunning);
        }

        // Nothing to fan out and nothing to retain: skip serialization.
        if !self.config.enabled() {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if sessions.is_empty() {
                trace!("No connection to any subscriber, skipping send");
                return Ok(());
            }
        }

        let frame = self.encode_frame(segments);

        {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            trace!(
                subscribers = sessions.len(),
                bytes = frame.len(),
                "Dispatching frame"
            );
            for session in sessions.iter() {
                session.send_data_buffer(frame.clone());
            }
        }

        if self.config.enabled() {
            let mut retained = self.retained.lock().unwrap_or_else(|e| e.into_inner());
            retained.push(frame, Instant::now());
        }

        Ok(())
    }

    /// The bound port, or 0 when the publisher is not running.
    pub fn port(&self) -> u16 {
        if !self.running.load(Ordering::SeqCst) {
            return 0;
        }
        self.local_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// Number of subscribers with a completed handshake.
    pub fn subscriber_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting, close the listener, and cancel every session.
    /// Idempotent; also invoked on drop.
    pub fn cancel(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("Publisher shutting down");
        self.shutdown.notify_one();

        // Snapshot so session close callbacks can take the lock themselves.
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for session in sessions {
            session.cancel();
        }
    }

    fn encode_frame(&self, segments: &[&[u8]]) -> SharedFrame {
        let data_size: usize = segments.iter().map(|s| s.len()).sum();
        let mut buffer = self.pool.allocate();
        buffer.ensure_capacity(HEADER_SIZE + data_size);
        buffer.extend_from_slice(
            &FrameHeader::new(ContentType::RegularPayload, data_size as u64).encode(),
        );
        for segment in segments {
            buffer.extend_from_slice(segment);
        }
        Arc::new(buffer)
    }

    /// Ready hook: runs on the session's task once the subscriber's
    /// handshake record has arrived, before the session accepts regular
    /// payloads. Builds and queues the transient-local replay.
    pub(crate) fn session_ready(&self, session: &Arc<PublisherSession>, replay_requested: bool) {
        if !self.config.enabled() || !replay_requested {
            return;
        }

        let frames = {
            let mut retained = self.retained.lock().unwrap_or_else(|e| e.into_inner());
            retained.purge(Instant::now());
            retained.snapshot()
        };
        if frames.is_empty() {
            return;
        }

        // One outstanding write per session means per-frame replay would
        // drop everything after the first frame. Concatenating the retained
        // frames' encodings into a single frame delivers all of them.
        let total: usize = frames.iter().map(|f| f.len()).sum();
        let mut buffer = self.pool.allocate();
        buffer.ensure_capacity(HEADER_SIZE + total);
        buffer.extend_from_slice(
            &FrameHeader::new(ContentType::RegularPayload, total as u64).encode(),
        );
        for frame in &frames {
            buffer.extend_from_slice(frame.as_slice());
        }

        debug!(
            remote = %session.remote(),
            frames = frames.len(),
            bytes = total,
            "Replaying retained frames"
        );
        session.push_replay(Arc::new(buffer));
    }

    /// Add an established session to the active set. Returns false when the
    /// publisher has been cancelled in the meantime, in which case the
    /// session shuts itself down.
    pub(crate) fn register_session(&self, session: &Arc<PublisherSession>) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            debug!(remote = %session.remote(), "Publisher cancelled, rejecting session");
            return false;
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.push(session.clone());
        debug!(
            remote = %session.remote(),
            subscribers = sessions.len(),
            "Session established"
        );
        true
    }

    /// Close callback: fires exactly once per session.
    pub(crate) fn session_closed(&self, session: &Arc<PublisherSession>) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|s| !Arc::ptr_eq(s, session));
        if sessions.len() < before {
            debug!(
                remote = %session.remote(),
                subscribers = sessions.len(),
                "Removed session"
            );
        } else {
            debug!(remote = %session.remote(), "Session closed before establishment");
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped_publisher() -> Arc<Publisher> {
        Publisher::new(Arc::new(Executor::new()), TransientLocalConfig::disabled())
    }

    #[test]
    fn test_send_on_non_running_publisher_fails() {
        let publisher = stopped_publisher();
        assert!(matches!(
            publisher.send(b"data"),
            Err(BusError::NotRunning)
        ));
        assert_eq!(publisher.port(), 0);
        assert!(!publisher.is_running());
    }

    #[test]
    fn test_start_requires_running_executor() {
        let publisher = stopped_publisher();
        assert!(matches!(
            publisher.start("127.0.0.1", 0),
            Err(BusError::ExecutorNotStarted)
        ));
        assert!(!publisher.is_running());
    }

    #[test]
    fn test_start_rejects_malformed_address() {
        let publisher = stopped_publisher();
        assert!(matches!(
            publisher.start("not-an-address", 0),
            Err(BusError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_cancel_before_start_is_a_no_op() {
        let publisher = stopped_publisher();
        publisher.cancel();
        publisher.cancel();
        assert!(!publisher.is_running());
    }

    #[test]
    fn test_encode_frame_concatenates_segments() {
        let publisher = stopped_publisher();
        let frame = publisher.encode_frame(&[b"abc".as_slice(), b"defg".as_slice()]);

        let header = FrameHeader::parse(frame[..HEADER_SIZE].try_into().unwrap()).unwrap();
        assert_eq!(header.content_type, ContentType::RegularPayload);
        assert_eq!(header.data_size, 7);
        assert_eq!(&frame[HEADER_SIZE..], b"abcdefg");
    }
}
