//! Crate-wide error type.
//!
//! Every failure the send path can report to a caller is a variant of
//! [`Error`].  All of them are terminal for the call that produced them; the
//! stack never retries on the caller's behalf.

use thiserror::Error;

/// Errors reported by the ICMPv6 socket layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed request: wrong address family or a payload shorter than
    /// an ICMPv6 header.
    #[error("invalid argument")]
    InvalidArgument,
    /// Payload does not fit the outgoing interface after the IPv6 header.
    #[error("message too long for interface MTU")]
    MessageTooLong,
    /// No route, neighbor resolution failed, interface down, or the deadline
    /// expired for an off-link destination.
    #[error("network is unreachable")]
    Unreachable,
    /// The deadline expired for an on-link destination.
    #[error("send timed out")]
    TimedOut,
    /// The blocked caller was interrupted before a verdict was reached.
    #[error("interrupted")]
    Interrupted,
    /// The poll-bus callback table is exhausted.
    #[error("no callback available")]
    AllocationFailed,
    /// The socket has already been closed.
    #[error("socket is closed")]
    NotConnected,
}

impl Error {
    /// POSIX errno equivalent, for callers bridging to a C ABI.
    pub fn errno(self) -> i32 {
        match self {
            Error::InvalidArgument => 22,  // EINVAL
            Error::MessageTooLong => 90,   // EMSGSIZE
            Error::Unreachable => 101,     // ENETUNREACH
            Error::TimedOut => 110,        // ETIMEDOUT
            Error::Interrupted => 4,       // EINTR
            Error::AllocationFailed => 12, // ENOMEM
            Error::NotConnected => 107,    // ENOTCONN
        }
    }

    /// `true` for failures that mean "this destination cannot be reached
    /// right now" rather than a caller mistake.
    pub fn is_unreachable_class(self) -> bool {
        matches!(self, Error::Unreachable | Error::AllocationFailed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
