//! Neighbor (link-layer address) resolution.
//!
//! The send path asks a [`NeighborResolver`] whether a destination can be
//! reached on the link before it registers anything with the poll bus.  A
//! failure there is an immediate `Unreachable` with no blocking.
//!
//! [`NeighborTable`] is the cache-backed implementation: entries expire after
//! a TTL and the least recently used entry is evicted when the table is full.
//! Any `Fn(&Ipv6Addr) -> Result<()>` closure is also a resolver, which is how
//! tests inject failures.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv6Addr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::error::{Error, Result};

/// Link-layer (MAC) address.
pub type LinkAddr = [u8; 6];

/// Decides whether a destination is reachable on the link.
pub trait NeighborResolver: Send + Sync {
    /// Must complete (or fail) before the caller registers for transmission.
    fn resolve(&self, addr: &Ipv6Addr) -> Result<()>;
}

impl<F> NeighborResolver for F
where
    F: Fn(&Ipv6Addr) -> Result<()> + Send + Sync,
{
    fn resolve(&self, addr: &Ipv6Addr) -> Result<()> {
        self(addr)
    }
}

/// Resolver for links without neighbor discovery (point-to-point, tun).
pub fn assume_reachable(_addr: &Ipv6Addr) -> Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// NeighborTable
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Entry {
    lladdr: LinkAddr,
    expires_at: Duration,
}

/// Thread-safe neighbor cache with TTL expiry and LRU eviction.
#[derive(Clone)]
pub struct NeighborTable {
    inner: Arc<RwLock<TableInner>>,
    clock: Arc<dyn Clock>,
}

struct TableInner {
    map: HashMap<Ipv6Addr, Entry>,
    lru: VecDeque<Ipv6Addr>,
    capacity: usize,
    ttl: Duration,

    hits: u64,
    misses: u64,
    evictions: u64,
}

impl NeighborTable {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self::with_clock(capacity, ttl, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TableInner {
                map: HashMap::new(),
                lru: VecDeque::new(),
                capacity: capacity.max(1),
                ttl,
                hits: 0,
                misses: 0,
                evictions: 0,
            })),
            clock,
        }
    }

    /// Learn (or refresh) a mapping.
    pub fn add(&self, addr: Ipv6Addr, lladdr: LinkAddr) {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let expires_at = now + inner.ttl;
        inner.insert(addr, Entry { lladdr, expires_at });
    }

    /// Look up the link-layer address for `addr`.
    pub fn lookup(&self, addr: &Ipv6Addr) -> Option<LinkAddr> {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        match inner.map.get(addr).copied() {
            Some(entry) if entry.expires_at > now => {
                inner.hits += 1;
                inner.touch(addr);
                Some(entry.lladdr)
            }
            Some(_) => {
                inner.misses += 1;
                inner.map.remove(addr);
                inner.lru.retain(|a| a != addr);
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn remove(&self, addr: &Ipv6Addr) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.map.remove(addr);
        inner.lru.retain(|a| a != addr);
    }

    /// (hits, misses, evictions)
    pub fn stats(&self) -> (u64, u64, u64) {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        (inner.hits, inner.misses, inner.evictions)
    }
}

impl NeighborResolver for NeighborTable {
    fn resolve(&self, addr: &Ipv6Addr) -> Result<()> {
        match self.lookup(addr) {
            Some(_) => Ok(()),
            None => {
                log::debug!("[neighbor] no entry for {addr}");
                Err(Error::Unreachable)
            }
        }
    }
}

impl TableInner {
    fn insert(&mut self, addr: Ipv6Addr, entry: Entry) {
        if !self.map.contains_key(&addr) && self.map.len() >= self.capacity {
            if let Some(oldest) = self.lru.pop_front() {
                self.map.remove(&oldest);
                self.evictions += 1;
            }
        }

        self.touch(&addr);
        self.map.insert(addr, entry);
    }

    fn touch(&mut self, addr: &Ipv6Addr) {
        self.lru.retain(|a| a != addr);
        self.lru.push_back(*addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const MAC: LinkAddr = [0x02, 0, 0, 0, 0, 1];

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    fn table(capacity: usize) -> (NeighborTable, ManualClock) {
        let clock = ManualClock::new();
        let t = NeighborTable::with_clock(capacity, Duration::from_secs(30), Arc::new(clock.clone()));
        (t, clock)
    }

    #[test]
    fn learned_entry_resolves() {
        let (t, _) = table(4);
        t.add(addr("fe80::2"), MAC);
        assert_eq!(t.lookup(&addr("fe80::2")), Some(MAC));
        assert!(t.resolve(&addr("fe80::2")).is_ok());
    }

    #[test]
    fn unknown_neighbor_is_unreachable() {
        let (t, _) = table(4);
        assert_eq!(t.resolve(&addr("fe80::9")), Err(Error::Unreachable));
    }

    #[test]
    fn removed_neighbor_is_unreachable() {
        let (t, _) = table(4);
        t.add(addr("fe80::2"), MAC);
        t.remove(&addr("fe80::2"));
        assert_eq!(t.lookup(&addr("fe80::2")), None);
        assert_eq!(t.resolve(&addr("fe80::2")), Err(Error::Unreachable));
    }

    #[test]
    fn ttl_expiry() {
        let (t, clock) = table(4);
        t.add(addr("fe80::2"), MAC);
        clock.advance(Duration::from_secs(31));
        assert!(t.lookup(&addr("fe80::2")).is_none());
    }

    #[test]
    fn lru_eviction() {
        let (t, _) = table(2);
        t.add(addr("fe80::a"), MAC);
        t.add(addr("fe80::b"), MAC);
        t.lookup(&addr("fe80::a"));
        t.add(addr("fe80::c"), MAC);

        assert!(t.lookup(&addr("fe80::b")).is_none());
        assert!(t.lookup(&addr("fe80::a")).is_some());
        assert!(t.lookup(&addr("fe80::c")).is_some());
        assert_eq!(t.stats().2, 1);
    }

    #[test]
    fn closures_are_resolvers() {
        let deny = |_: &Ipv6Addr| -> Result<()> { Err(Error::Unreachable) };
        assert!(deny.resolve(&Ipv6Addr::LOCALHOST).is_err());
        assert!(assume_reachable.resolve(&Ipv6Addr::LOCALHOST).is_ok());
    }
}
