//! Subscriber: a fan-in holder over subscriber sessions.
//!
//! Each session dials one peer rotation; give a session several peers for
//! failover, or add several sessions to subscribe to multiple publishers
//! independently.

pub(crate) mod session;

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::SubscriberSessionConfig;
use crate::executor::Executor;
pub use session::SubscriberSession;

/// Receiver of decoded payloads.
///
/// Called on an executor worker thread with a borrowed view of the payload
/// bytes; the buffer is reused for the next frame as soon as the call
/// returns, so implementations must copy anything they keep.
pub trait MessageCallback: Send + Sync {
    fn on_message(&self, payload: &[u8]);
}

impl<F> MessageCallback for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_message(&self, payload: &[u8]) {
        self(payload)
    }
}

/// Holder of one or more [`SubscriberSession`]s.
pub struct Subscriber {
    executor: Arc<Executor>,
    sessions: Mutex<Vec<Arc<SubscriberSession>>>,
}

impl Subscriber {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self {
            executor,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to the publishers in `peers` (an ordered failover
    /// rotation) with the default session configuration.
    pub fn add_session(
        &self,
        peers: Vec<(String, u16)>,
        callback: impl MessageCallback + 'static,
    ) -> Arc<SubscriberSession> {
        self.add_session_with_config(peers, SubscriberSessionConfig::default(), callback)
    }

    /// Subscribe with explicit session configuration.
    pub fn add_session_with_config(
        &self,
        peers: Vec<(String, u16)>,
        config: SubscriberSessionConfig,
        callback: impl MessageCallback + 'static,
    ) -> Arc<SubscriberSession> {
        let session = SubscriberSession::new(peers, config, Arc::new(callback));
        debug!(peers = ?session.peers(), "Adding subscriber session");
        self.executor.spawn(session.clone().run());
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(session.clone());
        session
    }

    /// Sessions added so far.
    pub fn sessions(&self) -> Vec<Arc<SubscriberSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cancel every session. Also invoked on drop.
    pub fn cancel(&self) {
        let sessions = self.sessions();
        for session in sessions {
            session.cancel();
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel();
    }
}
