//! Read-ahead FIFO for buffered Echo Replies.
//!
//! Replies that arrive before the application reads them are queued on the
//! socket.  Each queued fragment holds one buffer from the stack-wide
//! [`IobPool`]; the buffer goes back to the pool when the fragment is read
//! or flushed.

use std::collections::VecDeque;
use std::net::Ipv6Addr;

use bytes::Bytes;

/// Shared pool of reply buffers.
#[derive(Debug)]
pub struct IobPool {
    capacity: usize,
    in_use: usize,
}

impl IobPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: 0,
        }
    }

    fn try_alloc(&mut self) -> bool {
        if self.in_use == self.capacity {
            return false;
        }
        self.in_use += 1;
        true
    }

    fn release(&mut self, n: usize) {
        debug_assert!(n <= self.in_use, "releasing more buffers than allocated");
        self.in_use -= n.min(self.in_use);
    }

    pub fn available(&self) -> usize {
        self.capacity - self.in_use
    }
}

/// One buffered reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFragment {
    pub src: Ipv6Addr,
    /// ICMPv6 message, header included.
    pub data: Bytes,
}

/// Per-socket FIFO of buffered replies.
#[derive(Debug, Default)]
pub struct ReadAhead {
    queue: VecDeque<ReplyFragment>,
}

impl ReadAhead {
    /// Append a fragment.  Fails when the shared pool is exhausted.
    pub fn push(&mut self, pool: &mut IobPool, frag: ReplyFragment) -> bool {
        if !pool.try_alloc() {
            return false;
        }
        self.queue.push_back(frag);
        true
    }

    /// Remove the oldest fragment.
    pub fn pop(&mut self, pool: &mut IobPool) -> Option<ReplyFragment> {
        let frag = self.queue.pop_front()?;
        pool.release(1);
        Some(frag)
    }

    /// Discard every fragment, returning the number dropped.
    pub fn flush(&mut self, pool: &mut IobPool) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        pool.release(n);
        n
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
