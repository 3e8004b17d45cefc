//! Configuration types for publishers and subscriber sessions.

use serde::Deserialize;

/// Default cap on idle buffers kept by a publisher's buffer pool.
pub const DEFAULT_POOL_IDLE_LIMIT: usize = 64;

/// Transient-local retention configuration.
///
/// When enabled, the publisher keeps the most recently sent frames and
/// replays them to every new subscriber that requests replay during the
/// handshake. Both limits are applied together on every send and on every
/// new-subscriber replay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransientLocalConfig {
    /// Maximum number of retained frames. 0 disables retention entirely.
    pub buffer_max_count: usize,

    /// Maximum age of a retained frame in nanoseconds. 0 disables age
    /// eviction (retained frames only rotate out by count).
    pub lifespan_ns: i64,
}

impl TransientLocalConfig {
    /// Retention disabled; new subscribers start from the live stream only.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Retain up to `buffer_max_count` frames with no age limit.
    pub fn with_max_count(buffer_max_count: usize) -> Self {
        Self {
            buffer_max_count,
            lifespan_ns: 0,
        }
    }

    /// Whether retention is enabled at all.
    pub fn enabled(&self) -> bool {
        self.buffer_max_count > 0
    }
}

/// Per-session subscriber configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriberSessionConfig {
    /// Ask the publisher to replay its retained frames on connect.
    ///
    /// Default: true. The publisher only honors the request when its own
    /// retention is enabled.
    pub request_transient_local: bool,
}

impl Default for SubscriberSessionConfig {
    fn default() -> Self {
        Self {
            request_transient_local: true,
        }
    }
}
