//! Stack-wide and per-socket tunables.
//!
//! [`StackConfig`] sizes the fixed resources owned by a
//! [`crate::net::NetStack`]; [`SocketOptions`] carries the options a caller
//! can set on an individual [`crate::socket::Icmpv6Socket`].

use std::time::Duration;

/// Sizing parameters for a [`crate::net::NetStack`].
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Number of poll-bus callback slots shared by every socket.
    ///
    /// A send that finds the table full fails with
    /// [`crate::Error::AllocationFailed`].
    pub max_callbacks: usize,
    /// Number of reply buffers in the shared read-ahead pool.
    pub iob_buffers: usize,
    /// Maximum number of cached neighbor entries.
    pub neighbor_capacity: usize,
    /// Lifetime of a neighbor entry before it must be re-learned.
    pub neighbor_ttl: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_callbacks: 8,
            iob_buffers: 32,
            neighbor_capacity: 64,
            neighbor_ttl: Duration::from_secs(30),
        }
    }
}

/// Options settable on a single socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketOptions {
    /// Send timeout (`SO_SNDTIMEO`).  `None` waits forever.
    pub send_timeout: Option<Duration>,
}

impl SocketOptions {
    /// Build options with the given send timeout.
    ///
    /// A zero duration means "no timeout", matching `SO_SNDTIMEO` semantics.
    pub fn with_send_timeout(timeout: Duration) -> Self {
        Self {
            send_timeout: (!timeout.is_zero()).then_some(timeout),
        }
    }
}
