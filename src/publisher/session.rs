//! Per-subscriber session on the publisher side.
//!
//! A session carries one subscriber from TCP accept to disconnect: it runs
//! the publisher side of the handshake, then services a send queue holding
//! at most one write in flight and one frame behind it. That pending slot
//! is the backpressure contract: while a write is in flight, a newly sent
//! frame replaces the still-pending one (drop-stale/keep-newest), so a slow
//! subscriber loses frames instead of stalling the publisher.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::pool::SharedFrame;
use crate::protocol::{read_handshake, FrameError, Handshake};
use crate::publisher::Publisher;

/// Send queue of a session: the frame committed to the in-flight write, at
/// most one pending frame behind it, and a priority slot for the
/// transient-local replay that must precede every regular payload.
///
/// `active` is set exactly when a send finds the session idle; once there, a
/// frame is committed and later sends can no longer displace it. `pending`
/// is the backpressure slot: it holds whatever arrived most recently while
/// the writer was busy.
struct SendSlot {
    replay: Option<SharedFrame>,
    active: Option<SharedFrame>,
    pending: Option<SharedFrame>,
    writing: bool,
}

pub(crate) struct PublisherSession {
    remote: SocketAddr,
    publisher: Weak<Publisher>,
    local_flags: u8,
    slot: Mutex<SendSlot>,
    wake: Notify,
    cancel: Notify,
    established: AtomicBool,
    closed: AtomicBool,
}

impl PublisherSession {
    pub(crate) fn new(
        remote: SocketAddr,
        publisher: Weak<Publisher>,
        local_flags: u8,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            publisher,
            local_flags,
            slot: Mutex::new(SendSlot {
                replay: None,
                active: None,
                pending: None,
                writing: false,
            }),
            wake: Notify::new(),
            cancel: Notify::new(),
            established: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Queue a frame for transmission.
    ///
    /// Frames arriving before the handshake has completed, and frames
    /// arriving while an earlier frame is still pending, are dropped.
    pub(crate) fn send_data_buffer(&self, frame: SharedFrame) {
        if !self.established.load(Ordering::SeqCst) {
            trace!(remote = %self.remote, "Dropping frame for session that is not established");
            return;
        }
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.writing {
            if slot.pending.replace(frame).is_some() {
                trace!(remote = %self.remote, "Write in flight, replacing pending frame");
            }
        } else {
            slot.writing = true;
            slot.active = Some(frame);
            self.wake.notify_one();
        }
    }

    /// Queue the transient-local replay. The replay takes priority over the
    /// regular slot and any concurrently queued regular frame is dropped, so
    /// the replay is the first payload frame this subscriber observes.
    pub(crate) fn push_replay(&self, frame: SharedFrame) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.replay = Some(frame);
        if slot.pending.take().is_some() {
            trace!(remote = %self.remote, "Dropping regular frame that raced the replay");
        }
        if !slot.writing {
            slot.writing = true;
            self.wake.notify_one();
        }
    }

    /// Close the socket and end the session. The close callback still fires
    /// exactly once.
    pub(crate) fn cancel(&self) {
        self.cancel.notify_one();
    }

    /// Drive the session to completion. Spawned by the publisher's accept
    /// loop; holds the only strong reference to the socket, so dropping out
    /// of this function closes the connection.
    pub(crate) async fn run(self: Arc<Self>, stream: TcpStream) {
        // Payloads are already batched into single frames; coalescing delay
        // only adds latency here.
        if let Err(e) = stream.set_nodelay(true) {
            debug!(remote = %self.remote, error = %e, "Failed to set TCP_NODELAY");
        }

        let (mut reader, mut writer) = stream.into_split();
        {
            let drive = Self::drive(&self, &mut reader, &mut writer);
            tokio::pin!(drive);
            tokio::select! {
                result = &mut drive => match result {
                    Ok(()) => debug!(remote = %self.remote, "Subscriber disconnected"),
                    Err(FrameError::Io(e)) => {
                        debug!(remote = %self.remote, error = %e, "Session I/O error")
                    }
                    Err(e) => {
                        warn!(remote = %self.remote, error = %e, "Session protocol error")
                    }
                },
                _ = self.cancel.notified() => {
                    info!(remote = %self.remote, "Session cancelled");
                }
            }
        }
        self.close();
    }

    async fn drive(
        self: &Arc<Self>,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), FrameError> {
        // Our handshake record goes out first, then exactly one handshake
        // frame is expected back before any regular traffic.
        writer
            .write_all(&Handshake::new(self.local_flags).encode_frame())
            .await?;

        let mut payload = Vec::new();
        let handshake = read_handshake(reader, &mut payload).await?;
        trace!(
            remote = %self.remote,
            version = handshake.version,
            flags = handshake.flags,
            "Handshake received"
        );

        if let Some(publisher) = self.publisher.upgrade() {
            publisher.session_ready(self, handshake.requests_transient_local());
        }
        self.established.store(true, Ordering::SeqCst);
        let registered = match self.publisher.upgrade() {
            Some(publisher) => publisher.register_session(self),
            None => false,
        };
        if !registered {
            return Ok(());
        }

        self.established_loop(reader, writer).await
    }

    async fn established_loop(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), FrameError> {
        // The read direction is only watched to detect disconnects; a
        // subscriber sends nothing after its handshake.
        let mut scratch = [0u8; 1024];
        loop {
            tokio::select! {
                _ = self.wake.notified() => {
                    self.drain_writes(writer).await?;
                }
                read = reader.read(&mut scratch) => {
                    match read {
                        Ok(0) => return Ok(()),
                        Ok(n) => {
                            trace!(remote = %self.remote, bytes = n, "Ignoring unexpected inbound data");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Write queued frames until the slot is empty, replay first. Frames
    /// queued while a write is in flight are picked up on the next pass;
    /// the slot returns to idle only under the lock, so a send racing the
    /// final check lands in a fresh write cycle.
    async fn drain_writes(&self, writer: &mut OwnedWriteHalf) -> Result<(), FrameError> {
        loop {
            let frame = {
                let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
                let next = slot
                    .replay
                    .take()
                    .or_else(|| slot.active.take())
                    .or_else(|| slot.pending.take());
                match next {
                    Some(frame) => frame,
                    None => {
                        slot.writing = false;
                        return Ok(());
                    }
                }
            };
            writer.write_all(frame.as_slice()).await?;
        }
    }

    fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.established.store(false, Ordering::SeqCst);
        if let Some(publisher) = self.publisher.upgrade() {
            publisher.session_closed(self);
        }
    }
}
