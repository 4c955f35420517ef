//! Bounded per-agent event queue.
//!
//! A circular buffer of event handles with two producer ends: `put_fifo`
//! appends (normal sends) and `put_lifo` prepends (timer events and
//! other traffic that must be seen next without changing agent
//! priority). Consumption is always from the head.
//!
//! The queue records the low-water mark of free slots so sizing problems
//! show up in diagnostics instead of as silent `NoMemory` drops.

use crate::error::{Error, Result};
use crate::event::EventRef;

pub(crate) struct EventQueue {
    buf: Box<[Option<EventRef>]>,
    head: usize,
    len: usize,
    min_free: usize,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "queue capacity must be non-zero");
        let capacity = capacity.max(1);
        Self {
            buf: vec![None; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
            min_free: capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Smallest number of free slots ever observed.
    pub(crate) fn min_free(&self) -> usize {
        self.min_free
    }

    /// Append at the tail. Fails iff full.
    pub(crate) fn put_fifo(&mut self, event: EventRef) -> Result<()> {
        if self.is_full() {
            return Err(Error::NoMemory);
        }
        let tail = (self.head + self.len) % self.buf.len();
        self.buf[tail] = Some(event);
        self.len += 1;
        self.note_occupancy();
        Ok(())
    }

    /// Prepend at the head: the event is dequeued next. Fails iff full.
    pub(crate) fn put_lifo(&mut self, event: EventRef) -> Result<()> {
        if self.is_full() {
            return Err(Error::NoMemory);
        }
        self.head = (self.head + self.buf.len() - 1) % self.buf.len();
        self.buf[self.head] = Some(event);
        self.len += 1;
        self.note_occupancy();
        Ok(())
    }

    /// Dequeue from the head. `None` iff empty.
    pub(crate) fn get(&mut self) -> Option<EventRef> {
        if self.len == 0 {
            return None;
        }
        let event = self.buf[self.head].take();
        debug_assert!(event.is_some(), "occupied slot holds no event");
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        event
    }

    fn note_occupancy(&mut self) {
        let free = self.buf.len() - self.len;
        if free < self.min_free {
            self.min_free = free;
        }
    }
}
