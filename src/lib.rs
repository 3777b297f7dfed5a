//! Bandwidth throttling for accepted TCP connections
//!
//! A [`LimitingListener`] enforces two caps at once: a byte rate per
//! connection and an aggregate byte rate shared by every connection the
//! listener accepted. Both are token buckets ([`RateLimiter`]) consulted on
//! every read and write, global bucket first.

pub mod config;
pub mod limiter;
pub mod listener;
pub mod metrics;
pub mod server;

pub use limiter::{BucketConfig, LimitError, RateLimiter};
pub use listener::{
    Acceptor, CloseHandle, ConnectionId, ConnectionRegistry, LimitedConnection, LimitingListener,
    Limits, ListenerError, ListenerOptions, Transport,
};
