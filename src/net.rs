//! The stack lock and everything it protects.
//!
//! [`NetStack`] is the explicit mutual-exclusion context of the stack.  All
//! shared protocol state (interfaces and their transmit buffers, the
//! poll-bus callback table, per-socket conversation state, counters) lives in
//! one [`NetState`] behind one mutex.  Code reaches it only through a
//! [`NetGuard`].
//!
//! # Blocking under the lock
//!
//! A caller that must wait for the poll bus uses [`NetGuard::locked_wait`]:
//! the lock is released while the thread sleeps and re-acquired before it
//! returns, so poll cycles (which need the lock) keep running.  This is the
//! only suspension point in the send path.
//!
//! ```text
//!  caller thread                     poll driver
//!  ─────────────                     ───────────
//!  lock ─ register ─ locked_wait ┐
//!                      (unlocked)│   lock ─ poll(dev) ─ callback posts ─ notify ─ unlock
//!                 re-lock ◀──────┘
//!  free callback ─ unlock
//! ```

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::config::StackConfig;
use crate::conn::{ConnId, Icmpv6Conn};
use crate::device::{DeviceId, NetDevice};
use crate::devif::CallbackTable;
use crate::error::{Error, Result};
use crate::neighbor::{assume_reachable, NeighborResolver};
use crate::packet::parse_echo_reply;
use crate::readahead::{IobPool, ReplyFragment};
use crate::stats::NetStats;

/// Called (under the stack lock) when a send has data pending on an
/// interface.  Must not block.
pub type TxNotifier = Arc<dyn Fn(DeviceId) + Send + Sync>;

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// Counting semaphore whose count is protected by the stack lock.
///
/// Waiting is done through [`NetGuard::locked_wait`]; posting happens inside
/// a poll cycle, after which the poll driver wakes all sleepers.
#[derive(Debug)]
pub struct Semaphore {
    count: u32,
}

impl Semaphore {
    pub fn new(count: u32) -> Self {
        Self { count }
    }

    pub fn post(&mut self) {
        self.count += 1;
    }

    pub fn try_wait(&mut self) -> bool {
        if self.count == 0 {
            return false;
        }
        self.count -= 1;
        true
    }
}

// ---------------------------------------------------------------------------
// Interrupter
// ---------------------------------------------------------------------------

/// Delivers an interruption to a thread blocked in the stack.
///
/// An interruption raised while nobody waits stays pending and ends the
/// next wait immediately, unless the owner clears it first.  One that
/// arrives after the wait's condition is already met is consumed with it.
#[derive(Clone)]
pub struct Interrupter {
    flag: Arc<AtomicBool>,
    shared: Weak<Shared>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Some(shared) = self.shared.upgrade() {
            // Taking the lock orders this notify after the waiter's flag check.
            let _state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            shared.wake.notify_all();
        }
    }

    /// Drop any interruption that is still pending.
    pub(crate) fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// NetState
// ---------------------------------------------------------------------------

/// Everything protected by the stack lock.
pub struct NetState {
    pub(crate) devices: Vec<NetDevice>,
    pub(crate) callbacks: CallbackTable,
    pub(crate) conns: HashMap<ConnId, Icmpv6Conn>,
    pub(crate) iob: IobPool,
    pub(crate) stats: NetStats,
    next_conn: u64,
    tx_notifier: Option<TxNotifier>,
}

impl NetState {
    fn new(config: &StackConfig) -> Self {
        Self {
            devices: Vec::new(),
            callbacks: CallbackTable::with_capacity(config.max_callbacks),
            conns: HashMap::new(),
            iob: IobPool::new(config.iob_buffers),
            stats: NetStats::default(),
            next_conn: 0,
            tx_notifier: None,
        }
    }

    /// Pick the interface for `dst`: an up interface whose prefix contains
    /// it, else an up interface marked as default route.
    pub fn route(&self, dst: &Ipv6Addr) -> Option<DeviceId> {
        let up = || self.devices.iter().enumerate().filter(|(_, d)| d.is_up());
        up().find(|(_, d)| d.on_link(dst))
            .or_else(|| up().find(|(_, d)| d.default_route))
            .map(|(i, _)| DeviceId(i))
    }

    pub fn device(&self, id: DeviceId) -> Option<&NetDevice> {
        self.devices.get(id.0)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut NetDevice> {
        self.devices.get_mut(id.0)
    }

    /// Tell the driver of `dev` that outbound data is waiting.  Does not
    /// transmit.
    pub fn txnotify(&mut self, dev: DeviceId) {
        if let Some(d) = self.devices.get_mut(dev.0) {
            d.tx_notifications += 1;
        }
        if let Some(notify) = &self.tx_notifier {
            notify(dev);
        }
    }

    pub(crate) fn conn_mut(&mut self, id: ConnId) -> Result<&mut Icmpv6Conn> {
        self.conns.get_mut(&id).ok_or(Error::NotConnected)
    }

    /// Flush a socket's conversation state.  Returns fragments discarded.
    pub(crate) fn flush_conn(&mut self, id: ConnId) -> usize {
        match self.conns.get_mut(&id) {
            Some(conn) => conn.flush(&mut self.iob),
            None => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// NetGuard
// ---------------------------------------------------------------------------

struct Shared {
    state: Mutex<NetState>,
    wake: Condvar,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn NeighborResolver>,
}

/// Proof that the stack lock is held.
pub struct NetGuard<'a> {
    guard: MutexGuard<'a, NetState>,
    shared: &'a Shared,
}

impl<'a> NetGuard<'a> {
    /// Current time on the stack clock.
    pub fn now(&self) -> Duration {
        self.shared.clock.now()
    }

    /// Sleep with the lock released until `ready` returns `true` or `intr`
    /// fires.  `ready` is always evaluated with the lock held, and before the
    /// interruption check, so a result posted in the same cycle wins.
    pub fn locked_wait<F>(self, intr: &Interrupter, mut ready: F) -> (Self, Result<()>)
    where
        F: FnMut(&mut NetState) -> bool,
    {
        let NetGuard { mut guard, shared } = self;
        let result = loop {
            if ready(&mut *guard) {
                intr.take();
                break Ok(());
            }
            if intr.take() {
                break Err(Error::Interrupted);
            }
            guard = shared.wake.wait(guard).unwrap_or_else(PoisonError::into_inner);
        };
        (NetGuard { guard, shared }, result)
    }
}

impl Deref for NetGuard<'_> {
    type Target = NetState;

    fn deref(&self) -> &NetState {
        &self.guard
    }
}

impl DerefMut for NetGuard<'_> {
    fn deref_mut(&mut self) -> &mut NetState {
        &mut self.guard
    }
}

// ---------------------------------------------------------------------------
// NetStack
// ---------------------------------------------------------------------------

/// Handle to a network stack instance.  Clones share the same stack.
#[derive(Clone)]
pub struct NetStack {
    shared: Arc<Shared>,
}

impl Default for NetStack {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`NetStack`].
pub struct NetStackBuilder {
    config: StackConfig,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn NeighborResolver>,
}

impl NetStackBuilder {
    pub fn config(mut self, config: StackConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn resolver(mut self, resolver: impl NeighborResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn build(self) -> NetStack {
        NetStack {
            shared: Arc::new(Shared {
                state: Mutex::new(NetState::new(&self.config)),
                wake: Condvar::new(),
                clock: self.clock,
                resolver: self.resolver,
            }),
        }
    }
}

impl NetStack {
    /// Defaults: [`StackConfig::default`], a monotonic clock, and a resolver
    /// that treats every destination as reachable.
    pub fn builder() -> NetStackBuilder {
        NetStackBuilder {
            config: StackConfig::default(),
            clock: Arc::new(MonotonicClock::new()),
            resolver: Arc::new(assume_reachable),
        }
    }

    /// Acquire the stack lock.
    pub fn lock(&self) -> NetGuard<'_> {
        NetGuard {
            guard: self.shared.state.lock().unwrap_or_else(PoisonError::into_inner),
            shared: &self.shared,
        }
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            flag: Arc::new(AtomicBool::new(false)),
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub(crate) fn resolver(&self) -> &dyn NeighborResolver {
        self.shared.resolver.as_ref()
    }

    pub fn add_device(&self, dev: NetDevice) -> DeviceId {
        let mut st = self.lock();
        log::info!("[net] {} up: {}/{}", dev.name, dev.addr, dev.prefix_len());
        st.devices.push(dev);
        DeviceId(st.devices.len() - 1)
    }

    pub fn set_tx_notifier(&self, notifier: TxNotifier) {
        self.lock().tx_notifier = Some(notifier);
    }

    pub(crate) fn open_conn(&self) -> ConnId {
        let mut st = self.lock();
        let id = ConnId(st.next_conn);
        st.next_conn += 1;
        st.conns.insert(id, Icmpv6Conn::default());
        id
    }

    pub(crate) fn close_conn(&self, id: ConnId) {
        let mut st = self.lock();
        st.flush_conn(id);
        st.conns.remove(&id);
    }

    // -----------------------------------------------------------------------
    // Driver-facing operations
    // -----------------------------------------------------------------------

    /// Run one poll cycle on `dev`.
    ///
    /// Every callback registered on the interface is given the chance to act
    /// on the current event flags.  Threads waiting on a callback that
    /// reached a verdict are woken.  Returns the flags after all callbacks
    /// ran.
    pub fn poll(&self, dev: DeviceId) -> u16 {
        let mut st = self.lock();
        let now = st.now();
        let state = &mut *st;
        let Some(device) = state.devices.get_mut(dev.0) else {
            return 0;
        };
        let flags = device.poll_flags();
        let (flags, posted) = state
            .callbacks
            .dispatch(dev, device, &mut state.stats, now, flags);
        if posted {
            self.shared.wake.notify_all();
        }
        flags
    }

    /// Take the frame built in the last poll cycle, freeing the transmit
    /// buffer.  The returned bytes start at the IPv6 header.
    pub fn take_tx_frame(&self, dev: DeviceId) -> Option<Vec<u8>> {
        self.lock().device_mut(dev)?.take_frame()
    }

    pub fn set_link_up(&self, dev: DeviceId, up: bool) {
        if let Some(d) = self.lock().device_mut(dev) {
            if d.up != up {
                log::info!("[net] {} {}", d.name, if up { "up" } else { "down" });
            }
            d.up = up;
        }
    }

    /// Mark whether the interface holds unprocessed inbound data.
    pub fn set_rx_pending(&self, dev: DeviceId, pending: bool) {
        if let Some(d) = self.lock().device_mut(dev) {
            d.rx_pending = pending;
        }
    }

    /// Number of outbound-pending notifications `dev` has received.
    pub fn tx_notifications(&self, dev: DeviceId) -> u64 {
        self.lock().device(dev).map_or(0, |d| d.tx_notifications)
    }

    /// Deliver an inbound IPv6 packet.  Echo Replies are queued on the socket
    /// whose affinity matches; anything else is dropped.  Returns `true` if
    /// the packet was queued.
    pub fn input(&self, dev: DeviceId, packet: &[u8]) -> bool {
        let mut st = self.lock();
        let reply = match parse_echo_reply(packet) {
            Ok(r) => r,
            Err(e) => {
                log::debug!("[net] {dev} dropped inbound packet: {e}");
                st.stats.icmpv6.drop += 1;
                return false;
            }
        };
        st.stats.ipv6.recv += 1;

        let id = reply.header.id;
        let frag = ReplyFragment {
            src: reply.src,
            data: bytes::Bytes::copy_from_slice(reply.message),
        };
        let state = &mut *st;
        let queued = state
            .conns
            .values_mut()
            .find(|c| c.accepts(id, dev))
            .map_or(false, |c| c.deliver(&mut state.iob, id, dev, frag));

        if queued {
            state.stats.icmpv6.recv += 1;
            self.shared.wake.notify_all();
        } else {
            log::debug!("[net] {dev} no taker for echo reply id={id}");
            state.stats.icmpv6.drop += 1;
        }
        queued
    }

    pub fn stats(&self) -> NetStats {
        self.lock().stats
    }

    /// Free buffers in the shared read-ahead pool.
    pub fn reply_buffers_available(&self) -> usize {
        self.lock().iob.available()
    }

    /// Number of poll-bus callbacks currently allocated.
    pub fn callbacks_in_use(&self) -> usize {
        self.lock().callbacks.in_use()
    }

    pub fn now(&self) -> Duration {
        self.shared.clock.now()
    }
}
