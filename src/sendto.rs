//! Blocking ICMPv6 send.
//!
//! [`icmpv6_sendto`] is the entry point behind
//! [`crate::socket::Icmpv6Socket::send_to`].  It validates and routes the
//! request, resolves the neighbor, registers [`sendto_eventhandler`] on the
//! outgoing interface's poll bus and then sleeps until that handler reaches a
//! verdict.
//!
//! # Decision order (first match wins, once per poll cycle)
//!
//! 1. Interface down → `Unreachable`.
//! 2. Transmit buffer claimable and no unprocessed inbound data → build the
//!    packet into the buffer → success (or `MessageTooLong` if the buffer
//!    cannot hold it).
//! 3. Send timeout elapsed → `TimedOut` if the destination is on-link,
//!    `Unreachable` otherwise.
//! 4. Keep waiting.
//!
//! The request record is moved into the handler when it is registered.  The
//! handler is dropped by the poll bus in the cycle that produces a verdict,
//! and the slot itself is freed before `icmpv6_sendto` returns on every path,
//! so no poll cycle can observe a request whose caller has gone.

use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;

use crate::clock::expired;
use crate::config::SocketOptions;
use crate::conn::ConnId;
use crate::device::{flags, DeviceId};
use crate::devif::EventCx;
use crate::error::{Error, Result};
use crate::net::{Interrupter, NetStack, NetState};
use crate::packet::{write_request, EchoHeader, ICMPV6_HDRLEN, IPV6_HDRLEN};

/// State handed to the poll-bus handler for one send.
#[derive(Debug)]
pub(crate) struct SendRequest {
    /// The peer to send the request to.
    pub to: Ipv6Addr,
    /// ICMPv6 header + payload, as supplied by the caller.
    pub buf: Bytes,
    /// Clock reading when the handler was registered.
    pub start: Duration,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

/// Poll-bus handler for a pending send.  Runs with the stack lock held.
pub(crate) fn sendto_eventhandler(req: &SendRequest, cx: &mut EventCx<'_>, evt: u16) -> u16 {
    log::trace!("[sendto] flags: {evt:04x}");

    if evt & flags::DOWN != 0 {
        log::warn!("[sendto] {} is down", cx.dev.name);
        cx.finish(Err(Error::Unreachable));
        return evt;
    }

    // The buffer may already hold a packet from another sender this cycle,
    // or inbound data may still be waiting in the device.  Either way, wait
    // for the next cycle.
    if evt & flags::NEWDATA == 0 {
        let src = cx.dev.addr;
        if let Some(claim) = cx.dev.tx.try_claim() {
            if claim.capacity() < IPV6_HDRLEN + req.buf.len() {
                log::warn!("[sendto] {} byte message does not fit {}", req.buf.len(), cx.dev.name);
                cx.finish(Err(Error::MessageTooLong));
                return evt;
            }
            let len = claim.commit(|buf| write_request(buf, &src, &req.to, &req.buf));
            log::debug!(
                "[sendto] → {} bytes ({} icmpv6) to {}",
                len,
                len - IPV6_HDRLEN,
                req.to
            );
            cx.stats.icmpv6.sent += 1;
            cx.stats.ipv6.sent += 1;
            cx.finish(Ok(()));
            return evt;
        }
    }

    if let Some(timeout) = req.timeout {
        if expired(req.start, cx.now, timeout) {
            let verdict = if cx.dev.on_link(&req.to) {
                log::warn!("[sendto] timed out after {timeout:?}");
                Error::TimedOut
            } else {
                log::warn!("[sendto] {} not reachable via {}", req.to, cx.dev.name);
                Error::Unreachable
            };
            cx.finish(Err(verdict));
        }
    }

    evt
}

/// Send one ICMPv6 message and block until it has been handed to the
/// interface or has failed.
///
/// `buf` holds the ICMPv6 header followed by any payload.  Returns
/// `buf.len()` on success.  Every failure flushes the socket's conversation
/// state in the critical section that observes the failure.
///
/// Only an interruption raised after the call has started cancels it; one
/// left over from an earlier call is discarded here.
pub(crate) fn icmpv6_sendto(
    net: &NetStack,
    conn: ConnId,
    opts: &SocketOptions,
    intr: &Interrupter,
    buf: Bytes,
    to: SocketAddr,
) -> Result<usize> {
    intr.clear();

    let to = match to {
        SocketAddr::V6(addr) => *addr.ip(),
        SocketAddr::V4(_) => return Err(Error::InvalidArgument),
    };
    if buf.len() < ICMPV6_HDRLEN {
        return Err(Error::InvalidArgument);
    }
    let len = buf.len();

    let dev = match select_device(net, &buf, &to) {
        Ok(dev) => dev,
        Err(e) => return Err(fail(&mut net.lock(), conn, &to, e)),
    };

    let echo = EchoHeader::peek(&buf);

    let mut st = net.lock();
    {
        let state = &mut *st;
        let Some(c) = state.conns.get_mut(&conn) else {
            return Err(Error::NotConnected);
        };
        if !c.continues(echo, dev) {
            let dropped = c.flush(&mut state.iob);
            if dropped > 0 {
                log::debug!("[sendto] flushed {dropped} stale replies");
            }
        }
    }

    let start = st.now();
    let Some(cb) = st.callbacks.alloc(dev) else {
        return Err(fail(&mut st, conn, &to, Error::AllocationFailed));
    };

    let req = SendRequest {
        to,
        buf,
        start,
        timeout: opts.send_timeout,
    };
    st.callbacks.arm(
        cb,
        flags::POLL | flags::DOWN,
        Box::new(move |cx: &mut EventCx<'_>, evt: u16| sendto_eventhandler(&req, cx, evt)),
    );
    // Reported if the wait ends without a verdict.
    st.callbacks.set_result(cb, Err(Error::Interrupted));

    if let Some(c) = st.conns.get_mut(&conn) {
        c.record(echo, dev);
    }

    st.txnotify(dev);

    log::debug!("[sendto] waiting on {dev}, start {start:?}");
    let (mut st, _) = st.locked_wait(intr, |s| s.callbacks.sem_trywait(cb));

    match st.callbacks.free(cb).unwrap_or(Err(Error::Interrupted)) {
        Ok(()) => Ok(len),
        Err(e) => Err(fail(&mut st, conn, &to, e)),
    }
}

/// Route `to`, check the message fits the interface and resolve the
/// neighbor.  Nothing is registered yet.
fn select_device(net: &NetStack, buf: &[u8], to: &Ipv6Addr) -> Result<DeviceId> {
    let dev = {
        let st = net.lock();
        let dev = st.route(to).ok_or_else(|| {
            log::warn!("[sendto] no route to {to}");
            Error::Unreachable
        })?;
        let max = st.device(dev).map_or(0, |d| d.max_message());
        if buf.len() > max {
            return Err(Error::MessageTooLong);
        }
        dev
    };

    net.resolver().resolve(to).map_err(|_| {
        log::warn!("[sendto] neighbor {to} not reachable");
        Error::Unreachable
    })?;

    Ok(dev)
}

fn fail(st: &mut NetState, conn: ConnId, to: &Ipv6Addr, e: Error) -> Error {
    log::warn!("[sendto] send to {to} failed: {e}");
    st.flush_conn(conn);
    e
}
