//! Event objects: reference-counted, optionally reserved, pool-backed.
//!
//! An event is a slab header plus payload bytes living in-place inside a
//! block of the registered pool (or the adopted general heap) that
//! produced it. User code holds [`EventRef`]s — generation-tagged slab
//! indices — never the storage itself, so events can sit in several
//! agent queues at once while a single counter tracks when the storage
//! may be reclaimed.
//!
//! Attribute encoding (one `u16`, low byte dynamic / high byte reserved):
//!
//! | `attrib`      | meaning |
//! |---------------|---------|
//! | `0x0000`      | constant: refcounting is a no-op, never reclaimed |
//! | `0x00ff`      | dynamic: reclaimed when the refcount drops to zero |
//! | `0xffff`      | dynamic + reserved: storage pinned despite refcount |
//!
//! Pool selection: the registry is kept sorted by block size ascending
//! and `create` draws from the *first* pool whose blocks fit the
//! requested size. If that pool is empty the allocation fails with
//! `NoMemory` rather than spilling into larger pools; with no fitting
//! pool at all it falls back to the general heap when one was adopted,
//! otherwise `NoResource`.

use heapless::Vec as FixedVec;

use crate::config::{EVENT_POOL_SLOTS, REF_LIMIT};
use crate::epa::Agent;
use crate::error::{Error, Result};
use crate::mem::{Block, Mem, MemKind};

/// Event ids at or above this value are system pseudo-events; user
/// events must stay below it.
pub const SYSTEM_ID_FLOOR: u16 = 0x8000;

/// Pseudo-event: asks a state for its superstate.
pub const EV_SUPER: u16 = 0x8000;
/// Pseudo-event: state entry action.
pub const EV_ENTRY: u16 = 0x8001;
/// Pseudo-event: state exit action.
pub const EV_EXIT: u16 = 0x8002;
/// Pseudo-event: initial transition inside a state.
pub const EV_INIT: u16 = 0x8003;

/// Low byte of `attrib`: the event is dynamic (recyclable).
pub const ATTR_DYNAMIC: u16 = 0x00ff;
/// High byte of `attrib`: reclamation is suppressed while set.
pub const ATTR_RESERVED: u16 = 0xff00;

/// Reserved "no slot" index.
const NIL: u16 = u16::MAX;

/// Handle to an event. Copyable; stale handles are detected via the
/// generation tag and rejected with `ObjectInvalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRef {
    pub(crate) idx: u16,
    pub(crate) r#gen: u16,
}

impl EventRef {
    #[cfg(test)]
    pub(crate) fn test_handle(idx: u16, r#gen: u16) -> Self {
        Self { idx, r#gen }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Origin {
    Constant,
    Pool { pool: u8, block: Block },
    Heap(Block),
}

pub(crate) struct Hdr {
    pub id: u16,
    pub refc: u16,
    pub attrib: u16,
    pub len: u16,
    pub origin: Origin,
    /// Agent that was being dispatched when the event was created.
    pub producer: Option<Agent>,
}

struct EvSlot {
    r#gen: u16,
    hdr: Option<Hdr>,
    next_free: u16,
}

pub(crate) struct EventStore {
    slots: Vec<EvSlot>,
    free_head: u16,
    pools: Vec<Mem>,
    /// Pool ids ordered by block size ascending.
    order: FixedVec<u8, EVENT_POOL_SLOTS>,
    heap: Option<Mem>,
}

impl EventStore {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: NIL,
            pools: Vec::new(),
            order: FixedVec::new(),
            heap: None,
        }
    }

    // ── Storage registration ──────────────────────────────────

    pub(crate) fn register_pool(&mut self, mem: Mem) -> Result<()> {
        let Some(block_size) = mem.block_size() else {
            debug_assert!(false, "event pools must be pool allocators");
            return Err(Error::ArgInvalid);
        };
        if self.order.is_full() {
            return Err(Error::NotPermitted);
        }
        let id = self.pools.len() as u8;
        self.pools.push(mem);

        // Sorted insert, equal sizes after existing ones.
        let at = self
            .order
            .iter()
            .position(|&p| {
                self.pools[p as usize]
                    .block_size()
                    .is_some_and(|existing| existing > block_size)
            })
            .unwrap_or(self.order.len());
        self.order
            .insert(at, id)
            .map_err(|_| Error::NotPermitted)?;
        log::info!(
            "event: pool registered ({} byte blocks, {} pools total)",
            block_size,
            self.order.len()
        );
        Ok(())
    }

    pub(crate) fn set_heap(&mut self, mem: Mem) -> Result<()> {
        if !matches!(mem.kind(), MemKind::Heap | MemKind::Sys) {
            debug_assert!(false, "general event storage must support free()");
            return Err(Error::ArgInvalid);
        }
        self.heap = Some(mem);
        Ok(())
    }

    pub(crate) fn pool_count(&self) -> usize {
        self.order.len()
    }

    /// Block size of the i-th registered pool in registry (ascending)
    /// order.
    pub(crate) fn pool_block_size(&self, i: usize) -> Option<usize> {
        let id = *self.order.get(i)?;
        self.pools[id as usize].block_size()
    }

    // ── Creation / destruction ────────────────────────────────

    /// Create a dynamic event with `size` zeroed payload bytes.
    pub(crate) fn create(&mut self, id: u16, size: usize) -> Result<EventRef> {
        if size > u16::MAX as usize {
            debug_assert!(false, "event payload too large");
            return Err(Error::ArgOutOfRange);
        }
        let origin = self.alloc_storage(size)?;
        Ok(self.insert(Hdr {
            id,
            refc: 0,
            attrib: ATTR_DYNAMIC,
            len: size as u16,
            origin,
            producer: None,
        }))
    }

    /// Create a payloadless constant event. Reference operations are
    /// no-ops and it is never reclaimed.
    pub(crate) fn create_const(&mut self, id: u16) -> EventRef {
        self.insert(Hdr {
            id,
            refc: 0,
            attrib: 0,
            len: 0,
            origin: Origin::Constant,
            producer: None,
        })
    }

    fn alloc_storage(&mut self, size: usize) -> Result<Origin> {
        for &pid in &self.order {
            let pool = &mut self.pools[pid as usize];
            if pool.block_size().is_some_and(|bs| bs >= size) {
                // First fitting pool decides; an empty one is NoMemory,
                // not a license to spill into larger blocks.
                return match pool.alloc(size) {
                    Some(block) => {
                        pool.bytes_mut(block, size).fill(0);
                        Ok(Origin::Pool { pool: pid, block })
                    }
                    None => Err(Error::NoMemory),
                };
            }
        }
        match &mut self.heap {
            Some(heap) => match heap.alloc(size.max(1)) {
                Some(block) => {
                    heap.bytes_mut(block, size).fill(0);
                    Ok(Origin::Heap(block))
                }
                None => Err(Error::NoMemory),
            },
            None => Err(Error::NoResource),
        }
    }

    fn insert(&mut self, hdr: Hdr) -> EventRef {
        let idx = if self.free_head != NIL {
            let idx = self.free_head;
            self.free_head = self.slots[idx as usize].next_free;
            idx
        } else {
            self.slots.push(EvSlot {
                r#gen: 0,
                hdr: None,
                next_free: NIL,
            });
            (self.slots.len() - 1) as u16
        };
        let slot = &mut self.slots[idx as usize];
        slot.hdr = Some(hdr);
        EventRef {
            idx,
            r#gen: slot.r#gen,
        }
    }

    /// Drop one reference and reclaim the storage when the event became
    /// unreferenced, dynamic and unreserved. No-op for constants.
    pub(crate) fn destroy(&mut self, event: EventRef) -> Result<()> {
        let hdr = self.header_mut(event)?;
        if hdr.attrib == 0 {
            return Ok(());
        }
        hdr.refc = hdr.refc.saturating_sub(1);
        self.maybe_reclaim(event);
        Ok(())
    }

    fn maybe_reclaim(&mut self, event: EventRef) {
        let Ok(hdr) = self.header(event) else {
            return;
        };
        if hdr.attrib != ATTR_DYNAMIC || hdr.refc != 0 {
            return;
        }
        let slot = &mut self.slots[event.idx as usize];
        let Some(hdr) = slot.hdr.take() else {
            return;
        };
        slot.r#gen = slot.r#gen.wrapping_add(1);
        slot.next_free = self.free_head;
        self.free_head = event.idx;

        let freed = match hdr.origin {
            Origin::Constant => Ok(()),
            Origin::Pool { pool, block } => self.pools[pool as usize].free(block),
            Origin::Heap(block) => match &mut self.heap {
                Some(heap) => heap.free(block),
                None => Err(Error::ObjectInvalid),
            },
        };
        debug_assert!(freed.is_ok(), "event storage went back to a dead allocator");
    }

    /// Retire a constant event's slab entry (event-timer teardown).
    /// Queued copies of the handle turn stale and are dropped on fetch.
    pub(crate) fn remove_const(&mut self, event: EventRef) {
        let Ok(hdr) = self.header(event) else {
            return;
        };
        debug_assert!(hdr.attrib == 0, "remove_const on a dynamic event");
        if hdr.attrib != 0 {
            return;
        }
        let slot = &mut self.slots[event.idx as usize];
        slot.hdr = None;
        slot.r#gen = slot.r#gen.wrapping_add(1);
        slot.next_free = self.free_head;
        self.free_head = event.idx;
    }

    // ── Reference counting ────────────────────────────────────

    pub(crate) fn ref_up(&mut self, event: EventRef) -> Result<()> {
        let hdr = self.header_mut(event)?;
        if hdr.attrib == 0 {
            return Ok(());
        }
        if hdr.refc >= REF_LIMIT {
            return Err(Error::NoReference);
        }
        hdr.refc += 1;
        Ok(())
    }

    pub(crate) fn ref_down(&mut self, event: EventRef) -> Result<()> {
        let hdr = self.header_mut(event)?;
        if hdr.attrib != 0 {
            debug_assert!(hdr.refc > 0, "reference underflow");
            hdr.refc = hdr.refc.saturating_sub(1);
        }
        Ok(())
    }

    pub(crate) fn refc(&self, event: EventRef) -> Result<u16> {
        Ok(self.header(event)?.refc)
    }

    // ── Reservation ───────────────────────────────────────────

    /// Pin the storage: reclamation is suppressed until unlocked.
    pub(crate) fn lock(&mut self, event: EventRef) -> Result<()> {
        let hdr = self.header_mut(event)?;
        if hdr.attrib != 0 {
            hdr.attrib |= ATTR_RESERVED;
        }
        Ok(())
    }

    /// Release the pin; reclaims immediately if no references remain.
    pub(crate) fn unlock(&mut self, event: EventRef) -> Result<()> {
        let hdr = self.header_mut(event)?;
        if hdr.attrib != 0 {
            hdr.attrib &= ATTR_DYNAMIC;
        }
        self.maybe_reclaim(event);
        Ok(())
    }

    pub(crate) fn is_reserved(&self, event: EventRef) -> Result<bool> {
        Ok(self.header(event)?.attrib & ATTR_RESERVED != 0)
    }

    pub(crate) fn is_constant(&self, event: EventRef) -> Result<bool> {
        Ok(self.header(event)?.attrib == 0)
    }

    // ── Header access ─────────────────────────────────────────

    pub(crate) fn is_valid(&self, event: EventRef) -> bool {
        self.header(event).is_ok()
    }

    pub(crate) fn header(&self, event: EventRef) -> Result<&Hdr> {
        match self.slots.get(event.idx as usize) {
            Some(slot) if slot.r#gen == event.r#gen => {
                slot.hdr.as_ref().ok_or(Error::ObjectInvalid)
            }
            Some(_) => Err(Error::ObjectInvalid),
            None => Err(Error::ObjectNotFound),
        }
    }

    pub(crate) fn header_mut(&mut self, event: EventRef) -> Result<&mut Hdr> {
        match self.slots.get_mut(event.idx as usize) {
            Some(slot) if slot.r#gen == event.r#gen => {
                slot.hdr.as_mut().ok_or(Error::ObjectInvalid)
            }
            Some(_) => Err(Error::ObjectInvalid),
            None => Err(Error::ObjectNotFound),
        }
    }

    pub(crate) fn id(&self, event: EventRef) -> Result<u16> {
        Ok(self.header(event)?.id)
    }

    /// Re-label an event so it can be forwarded under a different id
    /// without copying the payload.
    pub(crate) fn set_id(&mut self, event: EventRef, id: u16) -> Result<()> {
        self.header_mut(event)?.id = id;
        Ok(())
    }

    // ── Payload access ────────────────────────────────────────

    pub(crate) fn payload(&self, event: EventRef) -> Result<&[u8]> {
        let hdr = self.header(event)?;
        Ok(match hdr.origin {
            Origin::Constant => &[],
            Origin::Pool { pool, block } => {
                self.pools[pool as usize].bytes(block, hdr.len as usize)
            }
            Origin::Heap(block) => match &self.heap {
                Some(heap) => heap.bytes(block, hdr.len as usize),
                None => &[],
            },
        })
    }

    pub(crate) fn payload_mut(&mut self, event: EventRef) -> Result<&mut [u8]> {
        let hdr = self.header(event)?;
        let (origin, len) = (hdr.origin, hdr.len as usize);
        Ok(match origin {
            Origin::Constant => &mut [],
            Origin::Pool { pool, block } => self.pools[pool as usize].bytes_mut(block, len),
            Origin::Heap(block) => match &mut self.heap {
                Some(heap) => heap.bytes_mut(block, len),
                None => &mut [],
            },
        })
    }

    pub(crate) fn copy_payload_into(&self, event: EventRef, buf: &mut Vec<u8>) {
        buf.clear();
        if let Ok(bytes) = self.payload(event) {
            buf.extend_from_slice(bytes);
        }
    }
}
