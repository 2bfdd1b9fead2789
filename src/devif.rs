//! Device poll bus: event callbacks registered against an interface.
//!
//! A protocol that needs to act when an interface becomes able to transmit
//! allocates a callback slot, arms it with an interest mask and a handler,
//! and is then invoked once per poll cycle of that interface.  All of this
//! happens under the stack lock: [`CallbackTable`] lives inside
//! [`crate::net::NetState`] and is only reachable through a
//! [`crate::net::NetGuard`].
//!
//! # Slot lifecycle
//!
//! ```text
//!  alloc ──▶ armed ──handler calls EventCx::finish──▶ finished ──▶ free
//!    │         │                                    (flags = 0,
//!    │         └───────────── free ─────────────▶    handler dropped,
//!    └──────────────────────── free ─────────▶       semaphore posted)
//! ```
//!
//! A slot that has finished can never be invoked again: its interest mask
//! is cleared and its handler is dropped in the same critical section that
//! records the result and posts the semaphore.

use std::time::Duration;

use crate::device::{DeviceId, NetDevice};
use crate::error::{Error, Result};
use crate::net::Semaphore;
use crate::stats::NetStats;

/// Handler invoked on each poll cycle.  Returns the (possibly modified)
/// event flags.
pub type EventFn = Box<dyn FnMut(&mut EventCx<'_>, u16) -> u16 + Send>;

/// Handle to an allocated callback slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(usize);

// ---------------------------------------------------------------------------
// EventCx
// ---------------------------------------------------------------------------

/// What a handler may touch while it runs.
pub struct EventCx<'a> {
    /// The interface being polled.
    pub dev: &'a mut NetDevice,
    /// Stack counters.
    pub stats: &'a mut NetStats,
    /// Time of this poll cycle.
    pub now: Duration,
    verdict: Option<Result<()>>,
}

impl EventCx<'_> {
    /// Report the terminal result of this callback.
    ///
    /// After the handler returns, the slot stops receiving events, the
    /// handler is dropped and the waiter's semaphore is posted.  Only the
    /// first call in a cycle counts.
    pub fn finish(&mut self, result: Result<()>) {
        if self.verdict.is_none() {
            self.verdict = Some(result);
        }
    }
}

// ---------------------------------------------------------------------------
// CallbackTable
// ---------------------------------------------------------------------------

struct Callback {
    dev: DeviceId,
    /// Interest mask; zero means "never invoke".
    flags: u16,
    event: Option<EventFn>,
    result: Result<()>,
    sem: Semaphore,
}

/// Fixed-capacity table of poll-bus callbacks.
pub struct CallbackTable {
    slots: Vec<Option<Callback>>,
    /// Allocated slot indices in allocation order; dispatch walks this list.
    order: Vec<usize>,
}

impl CallbackTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            order: Vec::with_capacity(capacity),
        }
    }

    /// Allocate an unarmed slot bound to `dev`, or `None` if the table is full.
    ///
    /// The slot's result starts as [`Error::AllocationFailed`] until the owner
    /// overwrites it.
    pub fn alloc(&mut self, dev: DeviceId) -> Option<CallbackId> {
        let idx = self.slots.iter().position(Option::is_none)?;
        self.slots[idx] = Some(Callback {
            dev,
            flags: 0,
            event: None,
            result: Err(Error::AllocationFailed),
            sem: Semaphore::new(0),
        });
        self.order.push(idx);
        Some(CallbackId(idx))
    }

    /// Install the interest mask and handler on an allocated slot.
    pub fn arm(&mut self, id: CallbackId, flags: u16, event: EventFn) {
        if let Some(cb) = self.slot_mut(id) {
            cb.flags = flags;
            cb.event = Some(event);
        }
    }

    /// Overwrite the slot's result.
    pub fn set_result(&mut self, id: CallbackId, result: Result<()>) {
        if let Some(cb) = self.slot_mut(id) {
            cb.result = result;
        }
    }

    /// Consume one post of the slot's semaphore, if any is available.
    pub fn sem_trywait(&mut self, id: CallbackId) -> bool {
        self.slot_mut(id).map_or(false, |cb| cb.sem.try_wait())
    }

    /// Release a slot, returning its last recorded result.
    ///
    /// Freeing an already-free slot returns `None`.
    pub fn free(&mut self, id: CallbackId) -> Option<Result<()>> {
        let cb = self.slots.get_mut(id.0)?.take()?;
        self.order.retain(|&i| i != id.0);
        Some(cb.result)
    }

    /// Number of allocated slots.
    pub fn in_use(&self) -> usize {
        self.order.len()
    }

    /// `true` while a slot still holds a handler.
    pub fn is_armed(&self, id: CallbackId) -> bool {
        self.slot(id).map_or(false, |cb| cb.event.is_some() && cb.flags != 0)
    }

    /// Run one poll cycle for `dev_id`.
    ///
    /// Every armed slot on that device whose interest mask intersects
    /// `flags` is invoked in allocation order; each handler sees the flags
    /// returned by the previous one.  Returns the final flags and whether
    /// any semaphore was posted.
    pub(crate) fn dispatch(
        &mut self,
        dev_id: DeviceId,
        dev: &mut NetDevice,
        stats: &mut NetStats,
        now: Duration,
        mut flags: u16,
    ) -> (u16, bool) {
        let mut posted = false;
        let order = self.order.clone();

        for idx in order {
            let Some(cb) = self.slots[idx].as_mut() else {
                continue;
            };
            if cb.dev != dev_id || cb.flags & flags == 0 {
                continue;
            }
            // Taken out for the duration of the call so the slot cannot be
            // re-entered for the same request.
            let Some(mut event) = cb.event.take() else {
                continue;
            };

            let mut cx = EventCx {
                dev: &mut *dev,
                stats: &mut *stats,
                now,
                verdict: None,
            };
            flags = event(&mut cx, flags);

            match cx.verdict {
                Some(result) => {
                    log::debug!("[devif] {dev_id} callback {idx} finished: {result:?}");
                    cb.flags = 0;
                    cb.result = result;
                    cb.sem.post();
                    posted = true;
                    // `event` is dropped here.
                }
                None => cb.event = Some(event),
            }
        }

        (flags, posted)
    }

    fn slot(&self, id: CallbackId) -> Option<&Callback> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: CallbackId) -> Option<&mut Callback> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }
}
