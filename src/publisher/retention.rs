//! Transient-local retention buffer.
//!
//! Holds the most recently sent frames, in enqueue order, for replay to new
//! subscribers. Two eviction policies apply together: a maximum count and a
//! maximum age (lifespan). Eviction runs on every enqueue and again when a
//! new subscriber's replay is assembled.

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::TransientLocalConfig;
use crate::pool::SharedFrame;

/// One retained frame and the instant it was enqueued.
pub(crate) struct RetainedFrame {
    pub frame: SharedFrame,
    pub enqueued_at: Instant,
}

/// Ordered retention buffer. Time is passed in by the caller so eviction is
/// testable without sleeping.
pub(crate) struct TransientLocalBuffer {
    config: TransientLocalConfig,
    entries: VecDeque<RetainedFrame>,
}

impl TransientLocalBuffer {
    pub fn new(config: TransientLocalConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
        }
    }

    /// Append a frame and apply both eviction policies.
    pub fn push(&mut self, frame: SharedFrame, now: Instant) {
        self.entries.push_back(RetainedFrame {
            frame,
            enqueued_at: now,
        });
        self.purge(now);
    }

    /// Evict entries over the count limit and entries older than the
    /// lifespan. Eviction is always from the front, so the remaining
    /// entries stay in enqueue order.
    pub fn purge(&mut self, now: Instant) {
        while self.entries.len() > self.config.buffer_max_count || self.front_expired(now) {
            if self.entries.pop_front().is_none() {
                break;
            }
        }
    }

    /// Clones of all retained frames, oldest first.
    pub fn snapshot(&self) -> Vec<SharedFrame> {
        self.entries.iter().map(|e| e.frame.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn front_expired(&self, now: Instant) -> bool {
        if self.config.lifespan_ns <= 0 {
            return false;
        }
        match self.entries.front() {
            Some(front) => {
                let age = now.saturating_duration_since(front.enqueued_at);
                age.as_nanos() as i64 > self.config.lifespan_ns
            }
            None => false,
        }
    }
}
