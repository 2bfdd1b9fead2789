//! Per-socket conversation state.
//!
//! An [`Icmpv6Conn`] remembers which outstanding Echo Request the socket's
//! buffered replies belong to: the (identifier, interface) *affinity*.  The
//! read-ahead FIFO only ever holds replies matching the current affinity;
//! whenever the affinity changes the FIFO is flushed in the same critical
//! section.
//!
//! A flush happens when:
//! - a request starts whose identifier or interface differs from the current
//!   affinity (or which is not an Echo Request at all),
//! - a send ends with any non-success verdict,
//! - the socket is closed.

use crate::device::DeviceId;
use crate::packet::EchoHeader;
use crate::readahead::{IobPool, ReadAhead, ReplyFragment};

/// Handle to a connection record inside [`crate::net::NetState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) u64);

/// Conversation state for one ICMPv6 socket.
#[derive(Debug, Default)]
pub struct Icmpv6Conn {
    /// Identifier of the last Echo Request sent.
    pub(crate) id: u16,
    /// Outstanding requests for `id` (0 or 1).
    pub(crate) nreqs: u8,
    /// Interface that carried the last request.
    pub(crate) dev: Option<DeviceId>,
    pub(crate) readahead: ReadAhead,
}

impl Icmpv6Conn {
    /// The live (identifier, interface) pair, if any.
    pub fn affinity(&self) -> Option<(u16, DeviceId)> {
        self.dev.map(|dev| (self.id, dev))
    }

    /// `true` if a request described by `echo` on `dev` continues the current
    /// conversation, so buffered replies may be kept.
    pub fn continues(&self, echo: Option<EchoHeader>, dev: DeviceId) -> bool {
        match echo {
            Some(h) if h.is_request() => h.id == self.id && self.dev == Some(dev),
            _ => false,
        }
    }

    /// Clear the affinity and discard every buffered reply.
    ///
    /// Returns the number of fragments released to the pool.
    pub fn flush(&mut self, pool: &mut IobPool) -> usize {
        self.id = 0;
        self.nreqs = 0;
        self.dev = None;
        self.readahead.flush(pool)
    }

    /// Record the affinity of a request that is about to be sent.
    ///
    /// Identifier and request count only apply to Echo Requests; the
    /// interface is always recorded.
    pub fn record(&mut self, echo: Option<EchoHeader>, dev: DeviceId) {
        if let Some(h) = echo.filter(EchoHeader::is_request) {
            self.id = h.id;
            self.nreqs = 1;
        }
        self.dev = Some(dev);
    }

    /// `true` if a reply with `id` arriving on `dev` belongs to this socket.
    pub fn accepts(&self, id: u16, dev: DeviceId) -> bool {
        self.nreqs > 0 && self.id == id && self.dev == Some(dev)
    }

    /// Queue a matching reply.  Non-matching replies are refused so the FIFO
    /// never holds anything outside the current affinity.
    pub fn deliver(&mut self, pool: &mut IobPool, id: u16, dev: DeviceId, frag: ReplyFragment) -> bool {
        self.accepts(id, dev) && self.readahead.push(pool, frag)
    }

    pub fn pending(&self) -> usize {
        self.readahead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ICMPV6_ECHO_REPLY, ICMPV6_ECHO_REQUEST};
    use bytes::Bytes;
    use std::net::Ipv6Addr;

    fn req(id: u16) -> Option<EchoHeader> {
        Some(EchoHeader {
            kind: ICMPV6_ECHO_REQUEST,
            code: 0,
            id,
            seq: 0,
        })
    }

    fn frag() -> ReplyFragment {
        ReplyFragment {
            src: Ipv6Addr::LOCALHOST,
            data: Bytes::from_static(b"reply"),
        }
    }

    #[test]
    fn fresh_conn_has_no_affinity() {
        let c = Icmpv6Conn::default();
        assert_eq!(c.affinity(), None);
        assert!(!c.continues(req(0), DeviceId(0)));
    }

    #[test]
    fn same_id_and_device_continue() {
        let mut c = Icmpv6Conn::default();
        c.record(req(9), DeviceId(1));
        assert!(c.continues(req(9), DeviceId(1)));
        assert!(!c.continues(req(10), DeviceId(1)));
        assert!(!c.continues(req(9), DeviceId(2)));
    }

    #[test]
    fn non_request_never_continues() {
        let mut c = Icmpv6Conn::default();
        c.record(req(9), DeviceId(1));
        let reply = Some(EchoHeader {
            kind: ICMPV6_ECHO_REPLY,
            code: 0,
            id: 9,
            seq: 0,
        });
        assert!(!c.continues(reply, DeviceId(1)));
        assert!(!c.continues(None, DeviceId(1)));
    }

    #[test]
    fn non_echo_records_interface_only() {
        let mut c = Icmpv6Conn::default();
        c.record(None, DeviceId(3));
        assert_eq!(c.affinity(), Some((0, DeviceId(3))));
        assert!(!c.accepts(0, DeviceId(3)));
    }

    #[test]
    fn deliver_only_matching_replies() {
        let mut pool = IobPool::new(8);
        let mut c = Icmpv6Conn::default();
        c.record(req(5), DeviceId(0));
        assert!(c.deliver(&mut pool, 5, DeviceId(0), frag()));
        assert!(!c.deliver(&mut pool, 6, DeviceId(0), frag()));
        assert!(!c.deliver(&mut pool, 5, DeviceId(1), frag()));
        assert_eq!(c.pending(), 1);
    }

    #[test]
    fn flush_clears_affinity_and_queue() {
        let mut pool = IobPool::new(8);
        let mut c = Icmpv6Conn::default();
        c.record(req(5), DeviceId(0));
        c.deliver(&mut pool, 5, DeviceId(0), frag());
        c.deliver(&mut pool, 5, DeviceId(0), frag());

        assert_eq!(c.flush(&mut pool), 2);
        assert_eq!(c.affinity(), None);
        assert_eq!(c.pending(), 0);
        assert_eq!(pool.available(), 8);
        assert!(!c.accepts(5, DeviceId(0)));
    }
}
