//! Integration tests for the blocking send path.
//!
//! Each test opens sockets on a stack driven by a [`ManualClock`], runs the
//! blocking `send_to` on a real OS thread, and plays the poll driver from the
//! test thread: one `poll` call is one poll cycle.

use std::net::{Ipv6Addr, SocketAddr};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use netstack_icmpv6::clock::ManualClock;
use netstack_icmpv6::packet::{
    echo_reply_for, icmpv6_sum, EchoHeader, ECHO_HDRLEN, ICMPV6_ECHO_REQUEST, IPV6_HDRLEN,
    write_request,
};
use netstack_icmpv6::{DeviceId, Error, Icmpv6Socket, NetDevice, NetStack, Result, StackConfig};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const LOCAL: &str = "fd00::1";
const ON_LINK: &str = "fd00::2";
const OFF_LINK: &str = "2001:db8::2";

type Pending = JoinHandle<(Icmpv6Socket, Result<usize>)>;

fn addr(s: &str) -> SocketAddr {
    SocketAddr::new(s.parse::<Ipv6Addr>().unwrap().into(), 0)
}

fn echo(id: u16, seq: u16, data: &[u8]) -> Vec<u8> {
    EchoHeader {
        kind: ICMPV6_ECHO_REQUEST,
        code: 0,
        id,
        seq,
    }
    .to_message(data)
}

/// A stack with one interface that is also the default route.
fn stack() -> (NetStack, DeviceId, ManualClock) {
    stack_with(StackConfig::default())
}

fn stack_with(config: StackConfig) -> (NetStack, DeviceId, ManualClock) {
    let clock = ManualClock::new();
    let net = NetStack::builder().config(config).clock(clock.clone()).build();
    let dev = net.add_device(NetDevice::new("eth0", LOCAL.parse().unwrap(), 64).with_default_route());
    (net, dev, clock)
}

fn spawn_send(mut sock: Icmpv6Socket, msg: Vec<u8>, to: &str) -> Pending {
    let to = addr(to);
    thread::spawn(move || {
        let r = sock.send_to(msg, to);
        (sock, r)
    })
}

/// Block until `n` callbacks are registered on the stack.
fn wait_registered(net: &NetStack, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while net.callbacks_in_use() != n {
        assert!(Instant::now() < deadline, "never reached {n} registered callbacks");
        thread::sleep(Duration::from_millis(1));
    }
}

/// The Echo Reply the on-link peer sends for `request`.
fn reply_to(request: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; IPV6_HDRLEN + request.len()];
    write_request(&mut frame, &LOCAL.parse().unwrap(), &ON_LINK.parse().unwrap(), request);
    echo_reply_for(&frame).unwrap()
}

fn finish(send: Pending) -> (Icmpv6Socket, Result<usize>) {
    send.join().expect("send thread panicked")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// On-link destination, buffer free on the first cycle: success with the
/// caller's byte count, not the wire length.
#[test]
fn buffer_free_on_first_cycle_succeeds() {
    let (net, dev, _clock) = stack();
    let msg = echo(1, 0, b"abcdefgh");
    let len = msg.len();

    let send = spawn_send(Icmpv6Socket::open(&net), msg, ON_LINK);
    wait_registered(&net, 1);
    assert!(net.tx_notifications(dev) >= 1);

    net.poll(dev);
    let (_sock, r) = finish(send);
    assert_eq!(r, Ok(len));
    assert_eq!(net.callbacks_in_use(), 0);

    let frame = net.take_tx_frame(dev).expect("frame queued");
    assert_eq!(frame.len(), IPV6_HDRLEN + len);
    let src: Ipv6Addr = LOCAL.parse().unwrap();
    let dst: Ipv6Addr = ON_LINK.parse().unwrap();
    assert_eq!(icmpv6_sum(&src, &dst, &frame[IPV6_HDRLEN..]), 0xffff);
}

/// Off-link destination, buffer never frees: unreachable once the deadline
/// passes, never before.
#[test]
fn off_link_deadline_is_unreachable() {
    let (net, dev, clock) = stack();
    net.set_rx_pending(dev, true);

    let mut sock = Icmpv6Socket::open(&net);
    sock.set_send_timeout(Some(Duration::from_secs(2)));
    let send = spawn_send(sock, echo(1, 0, b""), OFF_LINK);
    wait_registered(&net, 1);

    clock.advance(Duration::from_millis(1999));
    net.poll(dev);
    thread::sleep(Duration::from_millis(20));
    assert!(!send.is_finished(), "verdict before the deadline");

    clock.advance(Duration::from_millis(1));
    net.poll(dev);
    let (sock, r) = finish(send);
    assert_eq!(r, Err(Error::Unreachable));
    assert_eq!(sock.affinity(), None);
}

/// On-link destination, buffer never frees: timed out once the deadline
/// passes.
#[test]
fn on_link_deadline_is_timed_out() {
    let (net, dev, clock) = stack();
    // An earlier frame that the link driver never drains.
    let first = spawn_send(Icmpv6Socket::open(&net), echo(1, 0, b""), ON_LINK);
    wait_registered(&net, 1);
    net.poll(dev);
    assert!(finish(first).1.is_ok());

    let mut sock = Icmpv6Socket::open(&net);
    sock.set_send_timeout(Some(Duration::from_secs(2)));
    let send = spawn_send(sock, echo(2, 0, b""), ON_LINK);
    wait_registered(&net, 1);

    for _ in 0..3 {
        net.poll(dev);
        clock.advance(Duration::from_millis(500));
    }
    thread::sleep(Duration::from_millis(20));
    assert!(!send.is_finished(), "verdict before the deadline");

    clock.advance(Duration::from_millis(500));
    net.poll(dev);
    let (_sock, r) = finish(send);
    assert_eq!(r, Err(Error::TimedOut));
    assert_eq!(net.stats().icmpv6.sent, 1);
}

/// Neighbor resolution failure returns at once: no callback, no
/// notification, no poll cycle needed.
#[test]
fn resolution_failure_fails_fast() {
    let net = NetStack::builder()
        .resolver(|_: &Ipv6Addr| -> Result<()> { Err(Error::Unreachable) })
        .build();
    let dev = net.add_device(NetDevice::new("eth0", LOCAL.parse().unwrap(), 64));

    let mut sock = Icmpv6Socket::open(&net);
    assert_eq!(sock.send_to(echo(1, 0, b""), addr(ON_LINK)), Err(Error::Unreachable));
    assert_eq!(net.callbacks_in_use(), 0);
    assert_eq!(net.tx_notifications(dev), 0);
}

/// The interface goes down before the buffer is ever free.
#[test]
fn interface_down_is_unreachable() {
    let (net, dev, _clock) = stack();
    net.set_rx_pending(dev, true);

    let send = spawn_send(Icmpv6Socket::open(&net), echo(1, 0, b""), ON_LINK);
    wait_registered(&net, 1);
    net.poll(dev);

    net.set_link_up(dev, false);
    net.poll(dev);
    let (_sock, r) = finish(send);
    assert_eq!(r, Err(Error::Unreachable));
    assert!(net.take_tx_frame(dev).is_none());
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

/// Further poll cycles after a verdict neither wake the caller again nor
/// build a second packet.
#[test]
fn verdict_is_delivered_once() {
    let (net, dev, _clock) = stack();
    let send = spawn_send(Icmpv6Socket::open(&net), echo(1, 0, b"x"), ON_LINK);
    wait_registered(&net, 1);

    net.poll(dev);
    let (_sock, r) = finish(send);
    assert!(r.is_ok());

    net.take_tx_frame(dev);
    for _ in 0..5 {
        net.poll(dev);
    }
    assert!(net.take_tx_frame(dev).is_none());
    assert_eq!(net.stats().icmpv6.sent, 1);
}

/// Two senders on the same interface: one buffer claim per cycle.
#[test]
fn one_claim_per_cycle() {
    let (net, dev, _clock) = stack();
    let a = spawn_send(Icmpv6Socket::open(&net), echo(1, 0, b"a"), ON_LINK);
    wait_registered(&net, 1);
    let b = spawn_send(Icmpv6Socket::open(&net), echo(2, 0, b"b"), ON_LINK);
    wait_registered(&net, 2);

    net.poll(dev);
    assert_eq!(net.stats().icmpv6.sent, 1);
    wait_registered(&net, 1);

    // Nothing more until the link driver drains the buffer.
    net.poll(dev);
    assert_eq!(net.stats().icmpv6.sent, 1);

    net.take_tx_frame(dev).expect("first frame");
    net.poll(dev);
    assert_eq!(net.stats().icmpv6.sent, 2);

    assert!(finish(a).1.is_ok());
    assert!(finish(b).1.is_ok());
    assert_eq!(net.callbacks_in_use(), 0);
}

/// Replies buffered for one identifier are discarded when a request with a
/// different identifier starts.
#[test]
fn new_identifier_flushes_buffered_replies() {
    let (net, dev, _clock) = stack();

    let send = spawn_send(Icmpv6Socket::open(&net), echo(7, 0, b"one"), ON_LINK);
    wait_registered(&net, 1);
    net.poll(dev);
    let (sock, r) = finish(send);
    assert!(r.is_ok());

    let frame = net.take_tx_frame(dev).unwrap();
    let reply = echo_reply_for(&frame).unwrap();
    assert!(net.input(dev, &reply));
    assert!(net.input(dev, &reply));
    assert_eq!(sock.pending_replies(), 2);
    assert_eq!(sock.affinity(), Some((7, dev)));

    // Same identifier: replies survive.
    let send = spawn_send(sock, echo(7, 1, b"two"), ON_LINK);
    wait_registered(&net, 1);
    net.poll(dev);
    let (sock, _) = finish(send);
    assert_eq!(sock.pending_replies(), 2);
    net.take_tx_frame(dev);

    // New identifier: flushed before the request is registered.
    let send = spawn_send(sock, echo(8, 0, b"three"), ON_LINK);
    wait_registered(&net, 1);
    assert_eq!(net.reply_buffers_available(), StackConfig::default().iob_buffers);
    net.poll(dev);
    let (sock, _) = finish(send);
    assert_eq!(sock.pending_replies(), 0);
    assert_eq!(sock.affinity(), Some((8, dev)));

    // A stale reply for the old identifier is no longer accepted.
    assert!(!net.input(dev, &reply));
}

// ---------------------------------------------------------------------------
// Cleanup and resource limits
// ---------------------------------------------------------------------------

/// Interrupting a blocked send reports `Interrupted` and leaves nothing
/// registered.
#[test]
fn interrupt_deregisters() {
    let (net, dev, _clock) = stack();
    net.set_rx_pending(dev, true);

    let sock = Icmpv6Socket::open(&net);
    let intr = sock.interrupter();
    let send = spawn_send(sock, echo(3, 0, b""), ON_LINK);
    wait_registered(&net, 1);

    intr.interrupt();
    let (sock, r) = finish(send);
    assert_eq!(r, Err(Error::Interrupted));
    assert_eq!(net.callbacks_in_use(), 0);
    assert_eq!(sock.affinity(), None);

    // A later cycle finds nothing to run.
    net.set_rx_pending(dev, false);
    net.poll(dev);
    assert!(net.take_tx_frame(dev).is_none());
}

/// An interruption raised while no send is blocked does not cancel the
/// socket's next send.
#[test]
fn stale_interrupt_does_not_cancel_next_send() {
    let (net, dev, _clock) = stack();
    let sock = Icmpv6Socket::open(&net);
    sock.interrupter().interrupt();

    let send = spawn_send(sock, echo(4, 0, b"late"), ON_LINK);
    wait_registered(&net, 1);
    net.poll(dev);
    let (_sock, r) = finish(send);
    assert_eq!(r, Ok(ECHO_HDRLEN + 4));
    assert!(net.take_tx_frame(dev).is_some());
}

/// An interruption that arrives after the verdict is consumed with that
/// send.
#[test]
fn interrupt_after_verdict_is_consumed() {
    let (net, dev, _clock) = stack();
    let sock = Icmpv6Socket::open(&net);
    let intr = sock.interrupter();

    let send = spawn_send(sock, echo(5, 0, b""), ON_LINK);
    wait_registered(&net, 1);
    net.poll(dev);
    intr.interrupt();
    let (sock, r) = finish(send);
    assert!(r.is_ok());
    net.take_tx_frame(dev);

    let send = spawn_send(sock, echo(5, 1, b""), ON_LINK);
    wait_registered(&net, 1);
    net.poll(dev);
    assert!(finish(send).1.is_ok());
}

/// A failed send drops replies buffered for the conversation it continued
/// and returns their buffers to the pool.
#[test]
fn failed_send_releases_buffered_replies() {
    let (net, dev, clock) = stack();
    let mut sock = Icmpv6Socket::open(&net);
    sock.set_send_timeout(Some(Duration::from_secs(1)));

    let send = spawn_send(sock, echo(6, 0, b""), ON_LINK);
    wait_registered(&net, 1);
    net.poll(dev);
    let (sock, r) = finish(send);
    assert!(r.is_ok());

    // The reply arrives, but the frame stays in the transmit buffer.
    let reply = reply_to(&echo(6, 0, b""));
    assert!(net.input(dev, &reply));
    assert_eq!(sock.pending_replies(), 1);

    let send = spawn_send(sock, echo(6, 1, b""), ON_LINK);
    wait_registered(&net, 1);
    clock.advance(Duration::from_secs(1));
    net.poll(dev);
    let (sock, r) = finish(send);
    assert_eq!(r, Err(Error::TimedOut));
    assert_eq!(sock.pending_replies(), 0);
    assert_eq!(net.reply_buffers_available(), StackConfig::default().iob_buffers);
}

#[test]
fn exhausted_callback_table_fails_immediately() {
    let (net, dev, _clock) = stack_with(StackConfig {
        max_callbacks: 1,
        ..StackConfig::default()
    });
    net.set_rx_pending(dev, true);

    let first = Icmpv6Socket::open(&net);
    let intr = first.interrupter();
    let send = spawn_send(first, echo(1, 0, b""), ON_LINK);
    wait_registered(&net, 1);

    let mut second = Icmpv6Socket::open(&net);
    let r = second.send_to(echo(2, 0, b""), addr(ON_LINK));
    assert_eq!(r, Err(Error::AllocationFailed));
    assert!(r.unwrap_err().is_unreachable_class());

    intr.interrupt();
    finish(send);
}

#[test]
fn off_link_without_default_route_is_unreachable() {
    let net = NetStack::default();
    net.add_device(NetDevice::new("eth0", LOCAL.parse().unwrap(), 64));
    let mut sock = Icmpv6Socket::open(&net);
    assert_eq!(sock.send_to(echo(1, 0, b""), addr(OFF_LINK)), Err(Error::Unreachable));
}

#[test]
fn closed_socket_drops_buffered_replies() {
    let (net, dev, _clock) = stack();
    let send = spawn_send(Icmpv6Socket::open(&net), echo(9, 0, b"z"), ON_LINK);
    wait_registered(&net, 1);
    net.poll(dev);
    let (sock, _) = finish(send);

    let reply = echo_reply_for(&net.take_tx_frame(dev).unwrap()).unwrap();
    assert!(net.input(dev, &reply));
    assert_eq!(net.reply_buffers_available(), StackConfig::default().iob_buffers - 1);

    sock.close();
    assert_eq!(net.reply_buffers_available(), StackConfig::default().iob_buffers);
    assert!(!net.input(dev, &reply));
}
