//! The retired-descriptor done queue.
//!
//! The primary filter produces onto this queue from interrupt context; the
//! scavenger drains it from the gated context. The hand-off is a shadow head
//! pointer plus a monotonically increasing producer count, both mutated only
//! inside a short spin-lock critical section: the filter accumulates a local
//! chain during its walk and takes the lock once to splice it in, so lock
//! hold time is a few pointer writes regardless of how much was retired.
//!
//! Retired elements travel through their dedicated `done_link` field (never
//! `logical_next`), and always by ownership transfer, so an element can exist
//! on the schedule or on the done queue but never both.

use spin::Mutex;

use crate::schedule::PeriodicTd;

/// Chain of retirements accumulated locally by one filter pass, pushed LIFO.
#[derive(Default)]
pub(crate) struct RetiredChain {
    head: Option<Box<PeriodicTd>>,
    len: u32,
}

impl RetiredChain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, mut td: Box<PeriodicTd>) {
        debug_assert!(td.done_link.is_none() && td.logical_next.is_none());
        td.done_link = self.head.take();
        self.head = Some(td);
        self.len += 1;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

struct Shadow {
    head: Option<Box<PeriodicTd>>,
    producer_count: u32,
    consumer_count: u32,
}

pub struct DoneQueue {
    shadow: Mutex<Shadow>,
}

impl DoneQueue {
    pub fn new() -> Self {
        Self {
            shadow: Mutex::new(Shadow {
                head: None,
                producer_count: 0,
                consumer_count: 0,
            }),
        }
    }

    /// Splices a filter pass's retirements onto the shadow head.
    ///
    /// The completion cause latch must be set only after this returns, so the
    /// scavenger never observes the latch with a stale producer count.
    pub(crate) fn commit(&self, mut chain: RetiredChain) {
        if chain.is_empty() {
            return;
        }

        // Find the oldest element of the local chain so the previous shadow
        // head can hang off it; the walk is bounded by this pass's
        // retirement count.
        let mut tail = chain.head.as_mut().expect("non-empty chain");
        while tail.done_link.is_some() {
            tail = tail.done_link.as_mut().expect("checked above");
        }

        let mut shadow = self.shadow.lock();
        tail.done_link = shadow.head.take();
        shadow.head = chain.head;
        shadow.producer_count = shadow.producer_count.wrapping_add(chain.len);
    }

    /// Takes everything currently queued, newest first.
    pub fn drain(&self) -> DoneBatch {
        let mut shadow = self.shadow.lock();
        let head = shadow.head.take();
        let count = shadow.producer_count.wrapping_sub(shadow.consumer_count);
        shadow.consumer_count = shadow.producer_count;
        DoneBatch { head, count }
    }

    /// Total elements ever pushed; never decreases.
    pub fn producer_count(&self) -> u32 {
        self.shadow.lock().producer_count
    }

    /// Elements pushed but not yet drained.
    pub fn outstanding(&self) -> u32 {
        let shadow = self.shadow.lock();
        shadow.producer_count.wrapping_sub(shadow.consumer_count)
    }
}

impl Default for DoneQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// One drain of the done queue: an owning iterator over retired descriptors
/// in LIFO (newest-first) order.
pub struct DoneBatch {
    head: Option<Box<PeriodicTd>>,
    count: u32,
}

impl DoneBatch {
    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

impl Iterator for DoneBatch {
    type Item = Box<PeriodicTd>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut td = self.head.take()?;
        self.head = td.done_link.take();
        self.count = self.count.saturating_sub(1);
        Some(td)
    }
}
