//! User-facing ICMPv6 socket.
//!
//! [`Icmpv6Socket`] is a thin handle onto a connection record inside the
//! stack.  All protocol logic lives in [`crate::sendto`] and
//! [`crate::conn`]; this module owns only the handle's lifetime and its
//! options.
//!
//! `send_to` takes `&mut self`, so a socket can have at most one send
//! registered with the poll bus at a time.

use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;

use crate::config::SocketOptions;
use crate::conn::ConnId;
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::net::{Interrupter, NetStack};
use crate::readahead::ReplyFragment;
use crate::sendto::icmpv6_sendto;

/// A datagram socket for ICMPv6 Echo traffic.
pub struct Icmpv6Socket {
    net: NetStack,
    conn: Option<ConnId>,
    opts: SocketOptions,
    intr: Interrupter,
}

impl Icmpv6Socket {
    /// Open a socket on `net` with default options (no send timeout).
    pub fn open(net: &NetStack) -> Self {
        let conn = net.open_conn();
        log::debug!("[socket] open {conn:?}");
        Self {
            net: net.clone(),
            conn: Some(conn),
            opts: SocketOptions::default(),
            intr: net.interrupter(),
        }
    }

    /// Send one ICMPv6 message (header + payload) to `to`, blocking until it
    /// has been handed to the interface or the send has failed.
    ///
    /// Returns the number of bytes of `buf` that were sent.
    pub fn send_to(&mut self, buf: impl Into<Bytes>, to: SocketAddr) -> Result<usize> {
        let conn = self.conn.ok_or(Error::NotConnected)?;
        icmpv6_sendto(&self.net, conn, &self.opts, &self.intr, buf.into(), to)
    }

    /// `None` (or a zero duration) means wait forever.
    pub fn set_send_timeout(&mut self, timeout: Option<Duration>) {
        self.opts = timeout.map_or_else(SocketOptions::default, SocketOptions::with_send_timeout);
    }

    pub fn options(&self) -> &SocketOptions {
        &self.opts
    }

    /// Handle that cancels a blocked [`send_to`](Self::send_to) from another
    /// thread.
    ///
    /// An interrupt raised before `send_to` starts is discarded, as is one
    /// that arrives after the send already has its verdict.
    pub fn interrupter(&self) -> Interrupter {
        self.intr.clone()
    }

    /// Pop the oldest buffered Echo Reply, if any.
    ///
    /// Returns the number of bytes copied into `buf` (the reply is truncated
    /// to fit) and the sender's address.
    pub fn try_recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, Ipv6Addr)>> {
        let conn = self.conn.ok_or(Error::NotConnected)?;
        let mut st = self.net.lock();
        let state = &mut *st;
        let c = state.conns.get_mut(&conn).ok_or(Error::NotConnected)?;

        Ok(c.readahead.pop(&mut state.iob).map(|ReplyFragment { src, data }| {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            (n, src)
        }))
    }

    /// Number of buffered replies.
    pub fn pending_replies(&self) -> usize {
        self.conn
            .and_then(|id| self.net.lock().conns.get(&id).map(|c| c.pending()))
            .unwrap_or(0)
    }

    /// The (identifier, interface) pair buffered replies are matched against.
    pub fn affinity(&self) -> Option<(u16, DeviceId)> {
        self.conn
            .and_then(|id| self.net.lock().conns.get(&id).and_then(|c| c.affinity()))
    }

    /// Flush conversation state and release the connection record.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            log::debug!("[socket] close {conn:?}");
            self.net.close_conn(conn);
        }
    }
}

impl Drop for Icmpv6Socket {
    fn drop(&mut self) {
        self.release();
    }
}
