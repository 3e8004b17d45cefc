//! wirebus - TCP publish/subscribe fabric
//!
//! A lightweight, library-embedded pub/sub layer over plain TCP. A
//! [`Publisher`] binds a listening socket and fans framed byte payloads out
//! to every connected subscriber; a [`Subscriber`] dials a rotation of
//! publisher endpoints with reconnect/failover and hands each received
//! payload to a user callback. Payload contents are opaque to the library.
//!
//! All socket I/O runs on a shared [`Executor`]; `send` serializes into a
//! pooled buffer on the caller's thread and never blocks on the network.
//! Under write pressure a slow subscriber loses frames (drop-newest) rather
//! than stalling the publisher.

pub mod config;
pub mod error;
pub mod executor;
pub mod pool;
pub mod protocol;
pub mod publisher;
pub mod subscriber;

pub use config::{SubscriberSessionConfig, TransientLocalConfig};
pub use error::BusError;
pub use executor::Executor;
pub use pool::{BufferPool, PooledBuffer, SharedFrame};
pub use publisher::Publisher;
pub use subscriber::{MessageCallback, Subscriber, SubscriberSession};
