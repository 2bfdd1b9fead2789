//! Network interface model.
//!
//! A [`NetDevice`] carries the interface configuration the send path reads
//! (address, prefix, MTU, link state) and owns the single [`TxBuffer`] into
//! which exactly one outgoing packet per poll cycle can be written.
//!
//! # Transmit buffer ownership
//!
//! ```text
//!   free ──try_claim()──▶ claimed ──take_frame()──▶ free
//!                          (one writer per cycle)   (link driver)
//! ```
//!
//! The buffer is lent out through [`TxBuffer::try_claim`], which tests and
//! claims in one step.  There is no separate "is it free?" query that a
//! caller could act on later.

use std::net::Ipv6Addr;

use crate::packet::IPV6_HDRLEN;

/// Event bits passed to poll-bus callbacks.
pub mod flags {
    /// The interface may transmit: the callback is being polled.
    pub const POLL: u16 = 0b0000_0001;
    /// The device buffer holds inbound data that has not been processed.
    pub const NEWDATA: u16 = 0b0000_0010;
    /// The interface has gone down.
    pub const DOWN: u16 = 0b0000_0100;
}

/// Default link MTU (IPv6 minimum).
pub const DEFAULT_MTU: usize = 1280;

/// Index of an interface within a [`crate::net::NetStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) usize);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TxBuffer
// ---------------------------------------------------------------------------

/// The single per-interface staging area for an outgoing packet.
#[derive(Debug)]
pub struct TxBuffer {
    buf: Vec<u8>,
    /// Room reserved in front of the IPv6 header for the link-layer header.
    ll_hdrlen: usize,
    /// Bytes queued after the link-layer header; 0 when free.
    len: usize,
}

impl TxBuffer {
    fn new(ll_hdrlen: usize, mtu: usize) -> Self {
        Self {
            buf: vec![0u8; ll_hdrlen + mtu],
            ll_hdrlen,
            len: 0,
        }
    }

    /// Claim the buffer if nobody has written to it this cycle.
    pub fn try_claim(&mut self) -> Option<TxClaim<'_>> {
        if self.len > 0 {
            return None;
        }
        Some(TxClaim { tx: self })
    }

    fn take(&mut self) -> Option<Vec<u8>> {
        if self.len == 0 {
            return None;
        }
        let frame = self.buf[self.ll_hdrlen..self.ll_hdrlen + self.len].to_vec();
        self.len = 0;
        Some(frame)
    }
}

/// Exclusive write access to a claimed [`TxBuffer`].
#[derive(Debug)]
pub struct TxClaim<'a> {
    tx: &'a mut TxBuffer,
}

impl TxClaim<'_> {
    /// Space available for the network-layer packet.
    pub fn capacity(&self) -> usize {
        self.tx.buf.len() - self.tx.ll_hdrlen
    }

    /// Write a packet through `fill`, which returns the number of bytes it
    /// produced.  The buffer stays claimed until the link driver drains it.
    pub fn commit<F>(self, fill: F) -> usize
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let start = self.tx.ll_hdrlen;
        let n = fill(&mut self.tx.buf[start..]);
        self.tx.len = n;
        n
    }
}

// ---------------------------------------------------------------------------
// NetDevice
// ---------------------------------------------------------------------------

/// One network interface.
#[derive(Debug)]
pub struct NetDevice {
    pub name: String,
    /// Assigned unicast address, used as the source of outgoing requests.
    pub addr: Ipv6Addr,
    /// On-link prefix length, at most 128.
    pub(crate) prefix_len: u8,
    /// Link MTU (IPv6 header included).  The transmit buffer is sized from
    /// it, so it only changes through [`NetDevice::with_mtu`].
    pub(crate) mtu: usize,
    /// Used for off-link destinations when no prefix matches.
    pub default_route: bool,
    pub(crate) up: bool,
    /// Inbound data is sitting in the device and has not been processed.
    pub(crate) rx_pending: bool,
    /// Outbound-pending notifications received from the stack.
    pub(crate) tx_notifications: u64,
    pub(crate) tx: TxBuffer,
}

impl NetDevice {
    /// Create an interface that is up, with no link-layer header and the
    /// default MTU.
    pub fn new(name: impl Into<String>, addr: Ipv6Addr, prefix_len: u8) -> Self {
        Self {
            name: name.into(),
            addr,
            prefix_len: prefix_len.min(128),
            mtu: DEFAULT_MTU,
            default_route: false,
            up: true,
            rx_pending: false,
            tx_notifications: 0,
            tx: TxBuffer::new(0, DEFAULT_MTU),
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(IPV6_HDRLEN);
        self.tx = TxBuffer::new(self.tx.ll_hdrlen, self.mtu);
        self
    }

    /// Reserve `len` bytes in front of every frame for a link-layer header.
    pub fn with_link_header(mut self, len: usize) -> Self {
        self.tx = TxBuffer::new(len, self.mtu);
        self
    }

    pub fn with_default_route(mut self) -> Self {
        self.default_route = true;
        self
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    /// `true` when `dst` shares this interface's on-link prefix.
    pub fn on_link(&self, dst: &Ipv6Addr) -> bool {
        let mask = match self.prefix_len {
            0 => 0,
            n => u128::MAX << (128 - u32::from(n)),
        };
        (u128::from(self.addr) & mask) == (u128::from(*dst) & mask)
    }

    /// Largest ICMPv6 message this interface can carry.
    pub fn max_message(&self) -> usize {
        self.mtu - IPV6_HDRLEN
    }

    /// Event bits presented to callbacks in a poll cycle.
    pub(crate) fn poll_flags(&self) -> u16 {
        if !self.up {
            return flags::DOWN;
        }
        let mut f = flags::POLL;
        if self.rx_pending {
            f |= flags::NEWDATA;
        }
        f
    }

    /// Hand the queued frame to the link layer, freeing the buffer.
    pub(crate) fn take_frame(&mut self) -> Option<Vec<u8>> {
        self.tx.take()
    }
}
