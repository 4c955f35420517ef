//! Virtual timer wheel.
//!
//! All armed timers hang off one sentinel-anchored doubly linked list
//! ordered by *relative* ticks: each node stores only the tick delta to
//! its predecessor, so a tick touches exactly one counter no matter how
//! many timers are armed.
//!
//! ```text
//!  sentinel ─▶ [t=3] ─▶ [t=0] ─▶ [t=4] ─▶ (back to sentinel)
//!   (MAX)      fires     fires    fires
//!              at +3     at +3    at +7
//! ```
//!
//! Expiry processing removes the head while its delta is zero, re-arms
//! repeating timers *before* invoking their callback, and only then
//! fires — so a callback may cancel or restart any timer, including the
//! one that is firing. Timers with identical expiry fire in the order
//! they were armed.
//!
//! Timer nodes are arena slots addressed by generation-tagged
//! [`TimerHandle`]s; stale handles are rejected instead of dereferenced.

use crate::error::{Error, Result};
use crate::kernel::Kernel;

/// Sentinel slot index.
const SENTINEL: u16 = 0;

/// Reserved "not linked" index.
const NIL: u16 = u16::MAX;

/// Handle to a timer slot. Stale after [`Kernel::timer_destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    pub(crate) idx: u16,
    pub(crate) r#gen: u16,
}

/// One-shot timers disarm after firing; periodic timers re-arm with
/// their initial tick count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    Periodic,
}

/// Raw timer callback: invoked during tick processing with exclusive
/// kernel access and the argument given at start time. Must stay O(1);
/// it runs before any queued agent work.
pub type TimerFn = fn(&mut Kernel, u32);

#[derive(Clone, Copy)]
pub(crate) enum TimerCb {
    Fn(TimerFn, u32),
    /// Index of an event-timer binding; resolved by the kernel.
    Event(u16),
}

struct Slot {
    r#gen: u16,
    live: bool,
    prev: u16,
    next: u16,
    rtick: u32,
    itick: u32,
    cb: Option<TimerCb>,
    next_free: u16,
}

pub(crate) struct Wheel {
    slots: Vec<Slot>,
    free_head: u16,
}

impl Wheel {
    pub(crate) fn new() -> Self {
        Self {
            slots: vec![Slot {
                r#gen: 0,
                live: true,
                prev: SENTINEL,
                next: SENTINEL,
                rtick: u32::MAX,
                itick: 0,
                cb: None,
                next_free: NIL,
            }],
            free_head: NIL,
        }
    }

    // ── Slot management ───────────────────────────────────────

    pub(crate) fn create(&mut self) -> TimerHandle {
        let idx = if self.free_head != NIL {
            let idx = self.free_head;
            self.free_head = self.slots[idx as usize].next_free;
            idx
        } else {
            self.slots.push(Slot {
                r#gen: 0,
                live: false,
                prev: NIL,
                next: NIL,
                rtick: 0,
                itick: 0,
                cb: None,
                next_free: NIL,
            });
            (self.slots.len() - 1) as u16
        };
        let slot = &mut self.slots[idx as usize];
        slot.live = true;
        slot.prev = NIL;
        slot.next = NIL;
        slot.rtick = 0;
        slot.itick = 0;
        slot.cb = None;
        TimerHandle {
            idx,
            r#gen: slot.r#gen,
        }
    }

    pub(crate) fn destroy(&mut self, handle: TimerHandle) -> Result<()> {
        let idx = self.resolve(handle)?;
        if self.is_armed(idx) {
            self.cancel_idx(idx);
        }
        let slot = &mut self.slots[idx as usize];
        slot.live = false;
        slot.r#gen = slot.r#gen.wrapping_add(1);
        slot.next_free = self.free_head;
        self.free_head = idx;
        Ok(())
    }

    fn resolve(&self, handle: TimerHandle) -> Result<u16> {
        match self.slots.get(handle.idx as usize) {
            Some(slot) if slot.live && slot.r#gen == handle.r#gen && handle.idx != SENTINEL => {
                Ok(handle.idx)
            }
            Some(_) => Err(Error::ObjectInvalid),
            None => Err(Error::ObjectNotFound),
        }
    }

    fn is_armed(&self, idx: u16) -> bool {
        self.slots[idx as usize].next != NIL
    }

    // ── Protocol ──────────────────────────────────────────────

    pub(crate) fn start(
        &mut self,
        handle: TimerHandle,
        ticks: u32,
        cb: TimerCb,
        mode: TimerMode,
    ) -> Result<()> {
        let idx = self.resolve(handle)?;
        if ticks == 0 || ticks == u32::MAX {
            debug_assert!(false, "timer tick count out of range");
            return Err(Error::ArgOutOfRange);
        }
        if self.is_armed(idx) {
            debug_assert!(false, "start of a running timer");
            return Err(Error::ArgInvalid);
        }
        {
            let slot = &mut self.slots[idx as usize];
            slot.cb = Some(cb);
            slot.itick = match mode {
                TimerMode::OneShot => 0,
                TimerMode::Periodic => ticks,
            };
        }
        self.insert(idx, ticks);
        Ok(())
    }

    pub(crate) fn cancel(&mut self, handle: TimerHandle) -> Result<()> {
        let idx = self.resolve(handle)?;
        if self.is_armed(idx) {
            self.cancel_idx(idx);
        }
        Ok(())
    }

    pub(crate) fn is_running(&self, handle: TimerHandle) -> Result<bool> {
        let idx = self.resolve(handle)?;
        Ok(self.is_armed(idx))
    }

    /// Ticks until expiry: the sum of relative deltas from the list head
    /// through this timer. Zero when idle.
    pub(crate) fn remaining(&self, handle: TimerHandle) -> Result<u32> {
        let idx = self.resolve(handle)?;
        if !self.is_armed(idx) {
            return Ok(0);
        }
        let mut sum = 0u32;
        let mut cursor = idx;
        while cursor != SENTINEL {
            sum += self.slots[cursor as usize].rtick;
            cursor = self.slots[cursor as usize].prev;
        }
        Ok(sum)
    }

    // ── Tick processing ───────────────────────────────────────

    /// Advance the wheel by one tick: decrement the head delta.
    pub(crate) fn tick_begin(&mut self) {
        let first = self.slots[SENTINEL as usize].next;
        if first != SENTINEL {
            debug_assert!(self.slots[first as usize].rtick > 0);
            self.slots[first as usize].rtick -= 1;
        }
    }

    /// Pop the next expired timer, re-arming it first when periodic.
    /// Call repeatedly after [`Wheel::tick_begin`] until `None`; the
    /// caller invokes the returned callback between calls, so a callback
    /// can still cancel timers that expired on the same tick but have
    /// not fired yet.
    pub(crate) fn pop_fired(&mut self) -> Option<(u16, TimerCb)> {
        let first = self.slots[SENTINEL as usize].next;
        if first == SENTINEL || self.slots[first as usize].rtick != 0 {
            return None;
        }
        self.unlink(first);
        let itick = self.slots[first as usize].itick;
        if itick != 0 {
            self.insert(first, itick);
        }
        self.slots[first as usize].cb.map(|cb| (first, cb))
    }

    // ── List internals ────────────────────────────────────────

    fn insert(&mut self, idx: u16, ticks: u32) {
        let mut ticks = ticks;
        let mut cursor = self.slots[SENTINEL as usize].next;
        // Walk past every node expiring at or before us, keeping only the
        // delta to the insertion point; equal expiries stay ahead of us
        // so same-tick timers fire in arm order.
        while self.slots[cursor as usize].rtick <= ticks {
            ticks -= self.slots[cursor as usize].rtick;
            cursor = self.slots[cursor as usize].next;
        }
        let prev = self.slots[cursor as usize].prev;
        self.slots[idx as usize].prev = prev;
        self.slots[idx as usize].next = cursor;
        self.slots[idx as usize].rtick = ticks;
        self.slots[prev as usize].next = idx;
        self.slots[cursor as usize].prev = idx;

        if cursor != SENTINEL {
            self.slots[cursor as usize].rtick -= ticks;
        }
    }

    fn unlink(&mut self, idx: u16) {
        let slot = &self.slots[idx as usize];
        let (prev, next) = (slot.prev, slot.next);
        self.slots[prev as usize].next = next;
        self.slots[next as usize].prev = prev;
        let slot = &mut self.slots[idx as usize];
        slot.prev = NIL;
        slot.next = NIL;
    }

    fn cancel_idx(&mut self, idx: u16) {
        let next = self.slots[idx as usize].next;
        if next != SENTINEL {
            self.slots[next as usize].rtick += self.slots[idx as usize].rtick;
        }
        self.unlink(idx);
        self.slots[idx as usize].rtick = 0;
    }

    /// Delta-list invariant check used by the test suites: walking from
    /// the sentinel, the running delta sum of each node equals its
    /// absolute expiry.
    #[cfg(test)]
    pub(crate) fn absolute_expiry(&self, handle: TimerHandle) -> Option<u32> {
        let idx = self.resolve(handle).ok()?;
        if !self.is_armed(idx) {
            return None;
        }
        let mut sum = 0u32;
        let mut cursor = self.slots[SENTINEL as usize].next;
        loop {
            sum += self.slots[cursor as usize].rtick;
            if cursor == idx {
                return Some(sum);
            }
            cursor = self.slots[cursor as usize].next;
            if cursor == SENTINEL {
                return None;
            }
        }
    }
}
