//! The kernel: agent registry, event storage, timer wheel and the
//! cooperative run-to-completion scheduler loop.
//!
//! ```text
//!  producers ── epa_send ──▶ ┌─────────────┐
//!  tick ISR ─── mailbox ───▶ │ event queue │──▶ run queue (by priority)
//!  event timers ──────────▶  └─────────────┘         │
//!                                                    ▼
//!                              step(): peek ▸ rotate ▸ fetch one event
//!                                      ▸ dispatch HSM/FSM ▸ release ref
//! ```
//!
//! All kernel state lives in this one value; `&mut Kernel` *is* the
//! critical section. Run-to-completion is structural: a dispatch borrows
//! the kernel exclusively, and state handlers get it back through their
//! [`crate::smp::Ctx`], so there is never a second dispatch in flight.
//!
//! Scheduling rules (enforced by [`Kernel::step`]):
//! - an agent is runnable iff its event queue is non-empty;
//! - strictly higher priority always dispatches first;
//! - equal priorities round-robin, one event per agent per pass;
//! - when only the idle thread remains the loop parks in the port.

use serde::Serialize;

use crate::config::{PRIORITY_BUCKETS, PRIORITY_LEVELS};
use crate::epa::{Agent, AgentDef, AgentInner, AgentSlot, AgentStats};
use crate::equeue::EventQueue;
use crate::error::{Error, Result};
use crate::etimer::{EtimerInner, EtimerSlot, EventTimer};
use crate::event::{EV_INIT, EventRef, EventStore, SYSTEM_ID_FLOOR};
use crate::mem::Mem;
use crate::port;
use crate::smp::{self, Action, Evt, Sm};
use crate::tmr::{TimerCb, TimerFn, TimerHandle, TimerMode, Wheel};

/// Run-queue node of the built-in idle thread.
const IDLE_NODE: u16 = 0;

fn node_of(idx: usize) -> u16 {
    idx as u16 + 1
}

#[derive(Clone, Copy)]
enum Order {
    Fifo,
    Lifo,
}

/// Counters exported for telemetry.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct KernelStats {
    pub ticks: u64,
    pub dispatched: u64,
    pub sends: u64,
    pub send_failures: u64,
    pub deferred: u64,
    pub timers_fired: u64,
}

pub struct Kernel {
    run_queue: crate::sched::RunQueue<PRIORITY_LEVELS, PRIORITY_BUCKETS>,
    agents: Vec<AgentSlot>,
    store: EventStore,
    timers: Wheel,
    etimers: Vec<EtimerSlot>,
    current: Option<Agent>,
    init_evt: EventRef,
    scratch: Vec<u8>,
    stats: KernelStats,
}

impl Kernel {
    pub fn new() -> Self {
        let mut run_queue = crate::sched::RunQueue::new();
        run_queue.insert(IDLE_NODE, 0);
        let mut store = EventStore::new();
        let init_evt = store.create_const(EV_INIT);
        log::info!(
            "kernel: initialized ({PRIORITY_LEVELS} priority levels, {PRIORITY_BUCKETS} buckets)"
        );
        Self {
            run_queue,
            agents: Vec::new(),
            store,
            timers: Wheel::new(),
            etimers: Vec::new(),
            current: None,
            init_evt,
            scratch: Vec::new(),
            stats: KernelStats::default(),
        }
    }

    // ── Event storage ─────────────────────────────────────────

    /// Register a pool allocator as event storage. The registry keeps
    /// pools sorted by block size; creation draws from the smallest
    /// fitting pool.
    pub fn register_event_pool(&mut self, mem: Mem) -> Result<()> {
        self.store.register_pool(mem)
    }

    /// Adopt a heap used when no registered pool fits an event.
    pub fn adopt_general_heap(&mut self, mem: Mem) -> Result<()> {
        self.store.set_heap(mem)
    }

    // ── Event lifecycle ───────────────────────────────────────

    /// Create a dynamic event with `size` zeroed payload bytes.
    /// `id` must be below the system pseudo-event range. When called
    /// from inside a state handler the dispatching agent is recorded as
    /// the event's producer.
    pub fn event_create(&mut self, id: u16, size: usize) -> Result<EventRef> {
        check_user_id(id)?;
        let event = self.store.create(id, size)?;
        if let Ok(hdr) = self.store.header_mut(event) {
            hdr.producer = self.current;
        }
        Ok(event)
    }

    /// Create a dynamic event carrying `payload`.
    pub fn event_create_with(&mut self, id: u16, payload: &[u8]) -> Result<EventRef> {
        let event = self.event_create(id, payload.len())?;
        self.store.payload_mut(event)?.copy_from_slice(payload);
        Ok(event)
    }

    /// Create a payloadless constant event: reference operations are
    /// no-ops and the event is never reclaimed.
    pub fn event_create_const(&mut self, id: u16) -> Result<EventRef> {
        check_user_id(id)?;
        Ok(self.store.create_const(id))
    }

    /// Drop one reference; reclaims the storage when the event became
    /// unreferenced, dynamic and unreserved.
    pub fn event_destroy(&mut self, event: EventRef) -> Result<()> {
        self.store.destroy(event)
    }

    /// Pin the event's storage regardless of its reference count.
    pub fn event_lock(&mut self, event: EventRef) -> Result<()> {
        self.store.lock(event)
    }

    /// Release the pin; reclaims immediately at zero references.
    pub fn event_unlock(&mut self, event: EventRef) -> Result<()> {
        self.store.unlock(event)
    }

    /// Re-label an event for forwarding without copying its payload.
    pub fn event_forward(&mut self, event: EventRef, id: u16) -> Result<()> {
        check_user_id(id)?;
        self.store.set_id(event, id)
    }

    pub fn event_id(&self, event: EventRef) -> Result<u16> {
        self.store.id(event)
    }

    /// Agent that was being dispatched when the event was created, if
    /// any.
    pub fn event_producer(&self, event: EventRef) -> Result<Option<Agent>> {
        Ok(self.store.header(event)?.producer)
    }

    pub fn event_refc(&self, event: EventRef) -> Result<u16> {
        self.store.refc(event)
    }

    pub fn event_is_reserved(&self, event: EventRef) -> Result<bool> {
        self.store.is_reserved(event)
    }

    pub fn event_is_valid(&self, event: EventRef) -> bool {
        self.store.is_valid(event)
    }

    pub fn event_payload(&self, event: EventRef) -> Result<&[u8]> {
        self.store.payload(event)
    }

    pub fn event_payload_mut(&mut self, event: EventRef) -> Result<&mut [u8]> {
        self.store.payload_mut(event)
    }

    // ── Agents ────────────────────────────────────────────────

    /// Register an agent. Its machine receives the init pseudo-event on
    /// the first scheduler pass, which runs the initial transition.
    pub fn epa_create(&mut self, def: AgentDef, sm: Sm) -> Result<Agent> {
        if def.priority == 0 || def.priority as usize >= PRIORITY_LEVELS {
            debug_assert!(false, "agent priority out of range");
            return Err(Error::ArgOutOfRange);
        }
        if def.queue_len == 0 {
            debug_assert!(false, "agent queue must hold at least one event");
            return Err(Error::ArgOutOfRange);
        }

        let idx = match self.agents.iter().position(|s| s.inner.is_none()) {
            Some(idx) => idx,
            None => {
                if self.agents.len() >= u8::MAX as usize {
                    return Err(Error::NoMemory);
                }
                self.agents.push(AgentSlot {
                    r#gen: 0,
                    inner: None,
                });
                self.agents.len() - 1
            }
        };
        self.agents[idx].inner = Some(AgentInner {
            name: def.name,
            prio: def.priority,
            thread_ref: 0,
            sm: Some(sm),
            queue: EventQueue::new(def.queue_len),
        });
        let agent = Agent {
            idx: idx as u8,
            r#gen: self.agents[idx].r#gen,
        };
        log::info!(
            "epa: created '{}' (priority {}, queue {})",
            def.name,
            def.priority,
            def.queue_len
        );
        // Kick-start the machine through the normal send path.
        let init = self.init_evt;
        self.send_ordered(agent, init, Order::Fifo)?;
        Ok(agent)
    }

    /// Tear an agent down: queued events are released, the thread record
    /// leaves the run queue, the handle goes stale. Rejected while the
    /// agent is being dispatched.
    pub fn epa_destroy(&mut self, agent: Agent) -> Result<()> {
        let idx = self.resolve_agent(agent)?;
        {
            let Some(inner) = self.agents[idx].inner.as_mut() else {
                return Err(Error::ObjectInvalid);
            };
            if inner.sm.is_none() {
                return Err(Error::NotPermitted);
            }
            let name = inner.name;
            while let Some(event) = inner.queue.get() {
                let _ = self.store.destroy(event);
            }
            if inner.thread_ref > 0 {
                self.run_queue.remove(node_of(idx));
            }
            log::info!("epa: destroyed '{name}'");
        }
        let slot = &mut self.agents[idx];
        slot.inner = None;
        slot.r#gen = slot.r#gen.wrapping_add(1);
        Ok(())
    }

    /// Name given at creation.
    pub fn epa_name(&self, agent: Agent) -> Result<&'static str> {
        let idx = self.resolve_agent(agent)?;
        self.agents[idx]
            .inner
            .as_ref()
            .map(|inner| inner.name)
            .ok_or(Error::ObjectInvalid)
    }

    /// Queue diagnostics for one agent.
    pub fn agent_stats(&self, agent: Agent) -> Result<AgentStats> {
        let idx = self.resolve_agent(agent)?;
        self.agents[idx]
            .inner
            .as_ref()
            .map(AgentInner::stats)
            .ok_or(Error::ObjectInvalid)
    }

    /// The agent currently being dispatched, if any.
    pub fn current(&self) -> Option<Agent> {
        self.current
    }

    // ── Sending ───────────────────────────────────────────────

    /// Send an event to the tail of an agent's queue.
    ///
    /// Fails with `NoReference` when the reference counter is exhausted
    /// (the count is unchanged) and `NoMemory` when the queue is full
    /// (the sender's claim on the event is released).
    pub fn epa_send(&mut self, agent: Agent, event: EventRef) -> Result<()> {
        self.send_ordered(agent, event, Order::Fifo)
    }

    /// Send an event to the *head* of an agent's queue: it will be the
    /// next event the agent sees. Same failure contract as
    /// [`Kernel::epa_send`].
    pub fn epa_send_ahead(&mut self, agent: Agent, event: EventRef) -> Result<()> {
        self.send_ordered(agent, event, Order::Lifo)
    }

    fn send_ordered(&mut self, agent: Agent, event: EventRef, order: Order) -> Result<()> {
        let idx = self.resolve_agent(agent)?;
        self.store.ref_up(event)?;
        match self.enqueue_raw(idx, event, order) {
            Ok(()) => {
                self.stats.sends += 1;
                Ok(())
            }
            Err(_) => {
                self.stats.send_failures += 1;
                log::warn!(
                    "epa: queue full, dropping event {:?}",
                    self.store.id(event).unwrap_or(0)
                );
                let _ = self.store.destroy(event);
                Err(Error::NoMemory)
            }
        }
    }

    /// Enqueue without touching the reference count; marks the agent
    /// runnable on the empty→non-empty transition — the only path that
    /// puts an agent on the run queue.
    fn enqueue_raw(&mut self, idx: usize, event: EventRef, order: Order) -> Result<()> {
        let Some(inner) = self.agents[idx].inner.as_mut() else {
            return Err(Error::ObjectInvalid);
        };
        let was_empty = inner.queue.is_empty();
        match order {
            Order::Fifo => inner.queue.put_fifo(event)?,
            Order::Lifo => inner.queue.put_lifo(event)?,
        }
        if was_empty {
            inner.thread_ref += 1;
            if inner.thread_ref == 1 {
                let prio = inner.prio;
                self.run_queue.insert(node_of(idx), prio);
            }
        }
        Ok(())
    }

    fn resolve_agent(&self, agent: Agent) -> Result<usize> {
        match self.agents.get(agent.idx as usize) {
            Some(slot) if slot.r#gen == agent.r#gen && slot.inner.is_some() => {
                Ok(agent.idx as usize)
            }
            Some(_) => Err(Error::ObjectInvalid),
            None => Err(Error::ObjectNotFound),
        }
    }

    // ── Raw timers ────────────────────────────────────────────

    pub fn timer_create(&mut self) -> TimerHandle {
        self.timers.create()
    }

    pub fn timer_destroy(&mut self, timer: TimerHandle) -> Result<()> {
        self.timers.destroy(timer)
    }

    /// Arm a timer for `ticks > 0` kernel ticks. The callback runs
    /// during tick processing with exclusive kernel access and must stay
    /// O(1).
    pub fn timer_start(
        &mut self,
        timer: TimerHandle,
        ticks: u32,
        f: TimerFn,
        arg: u32,
        mode: TimerMode,
    ) -> Result<()> {
        self.timers.start(timer, ticks, TimerCb::Fn(f, arg), mode)
    }

    pub fn timer_cancel(&mut self, timer: TimerHandle) -> Result<()> {
        self.timers.cancel(timer)
    }

    pub fn timer_is_running(&self, timer: TimerHandle) -> Result<bool> {
        self.timers.is_running(timer)
    }

    /// Ticks until expiry; zero when idle.
    pub fn timer_remaining(&self, timer: TimerHandle) -> Result<u32> {
        self.timers.remaining(timer)
    }

    // ── Event timers ──────────────────────────────────────────

    /// Create an event timer bound to `client`. The carried event is
    /// constant and reused across fires.
    pub fn etimer_create(&mut self, client: Agent) -> Result<EventTimer> {
        self.resolve_agent(client)?;
        let event = self.store.create_const(0);
        let timer = self.timers.create();
        let inner = EtimerInner {
            timer,
            event,
            client,
        };
        let idx = match self.etimers.iter().position(|s| s.inner.is_none()) {
            Some(idx) => {
                self.etimers[idx].inner = Some(inner);
                idx
            }
            None => {
                self.etimers.push(EtimerSlot {
                    r#gen: 0,
                    inner: Some(inner),
                });
                self.etimers.len() - 1
            }
        };
        Ok(EventTimer {
            idx: idx as u16,
            r#gen: self.etimers[idx].r#gen,
        })
    }

    /// Deliver `id` to the client once, `ticks` from now.
    pub fn etimer_after(&mut self, timer: EventTimer, ticks: u32, id: u16) -> Result<()> {
        self.etimer_arm(timer, ticks, id, TimerMode::OneShot)
    }

    /// Deliver `id` to the client every `ticks` ticks.
    pub fn etimer_every(&mut self, timer: EventTimer, ticks: u32, id: u16) -> Result<()> {
        self.etimer_arm(timer, ticks, id, TimerMode::Periodic)
    }

    fn etimer_arm(&mut self, timer: EventTimer, ticks: u32, id: u16, mode: TimerMode) -> Result<()> {
        check_user_id(id)?;
        let idx = self.resolve_etimer(timer)?;
        let Some(inner) = self.etimers[idx].inner.as_ref() else {
            return Err(Error::ObjectInvalid);
        };
        let (event, wheel_timer) = (inner.event, inner.timer);
        self.store.set_id(event, id)?;
        self.timers
            .start(wheel_timer, ticks, TimerCb::Event(idx as u16), mode)
    }

    pub fn etimer_cancel(&mut self, timer: EventTimer) -> Result<()> {
        let idx = self.resolve_etimer(timer)?;
        match self.etimers[idx].inner.as_ref() {
            Some(inner) => self.timers.cancel(inner.timer),
            None => Err(Error::ObjectInvalid),
        }
    }

    pub fn etimer_is_running(&self, timer: EventTimer) -> Result<bool> {
        let idx = self.resolve_etimer(timer)?;
        match self.etimers[idx].inner.as_ref() {
            Some(inner) => self.timers.is_running(inner.timer),
            None => Err(Error::ObjectInvalid),
        }
    }

    pub fn etimer_remaining(&self, timer: EventTimer) -> Result<u32> {
        let idx = self.resolve_etimer(timer)?;
        match self.etimers[idx].inner.as_ref() {
            Some(inner) => self.timers.remaining(inner.timer),
            None => Err(Error::ObjectInvalid),
        }
    }

    /// Disarm and release the binding and its carried event.
    pub fn etimer_destroy(&mut self, timer: EventTimer) -> Result<()> {
        let idx = self.resolve_etimer(timer)?;
        let Some(inner) = self.etimers[idx].inner.take() else {
            return Err(Error::ObjectInvalid);
        };
        self.etimers[idx].r#gen = self.etimers[idx].r#gen.wrapping_add(1);
        let _ = self.timers.destroy(inner.timer);
        self.store.remove_const(inner.event);
        Ok(())
    }

    fn resolve_etimer(&self, timer: EventTimer) -> Result<usize> {
        match self.etimers.get(timer.idx as usize) {
            Some(slot) if slot.r#gen == timer.r#gen && slot.inner.is_some() => {
                Ok(timer.idx as usize)
            }
            Some(_) => Err(Error::ObjectInvalid),
            None => Err(Error::ObjectNotFound),
        }
    }

    /// Expiry tail: runs during tick processing, O(1) — the constant
    /// event already exists, it only jumps to the head of the client's
    /// queue.
    fn etimer_fired(&mut self, slot: u16) {
        let Some(Some(inner)) = self.etimers.get(slot as usize).map(|s| s.inner.as_ref()) else {
            return;
        };
        let (client, event) = (inner.client, inner.event);
        let sent = self.send_ordered(client, event, Order::Lifo);
        if let Err(err) = sent {
            log::warn!("etimer: dropped timed event ({err})");
            debug_assert!(false, "timed event lost: {err}");
        }
    }

    // ── Tick processing ───────────────────────────────────────

    /// Advance the timer subsystem by one tick and run every expiry that
    /// became due, in arm order.
    pub fn tick(&mut self) {
        self.stats.ticks += 1;
        self.timers.tick_begin();
        while let Some((_, cb)) = self.timers.pop_fired() {
            self.stats.timers_fired += 1;
            match cb {
                TimerCb::Fn(f, arg) => f(self, arg),
                TimerCb::Event(slot) => self.etimer_fired(slot),
            }
        }
    }

    // ── Scheduler ─────────────────────────────────────────────

    /// Dispatch one event to the highest-priority runnable agent.
    /// Returns `false` when only the idle thread is runnable.
    pub fn step(&mut self) -> bool {
        if self.current.is_some() {
            debug_assert!(false, "reentrant step from a state handler");
            return false;
        }
        let node = self.run_queue.peek();
        self.run_queue.rotate(node);
        if node == IDLE_NODE {
            return false;
        }
        let idx = (node - 1) as usize;
        let r#gen = self.agents[idx].r#gen;
        let Some(inner) = self.agents[idx].inner.as_mut() else {
            debug_assert!(false, "runnable node without an agent");
            return false;
        };
        let Some(event) = inner.queue.get() else {
            debug_assert!(false, "runnable agent with an empty queue");
            return false;
        };
        if inner.queue.is_empty() {
            inner.thread_ref -= 1;
            if inner.thread_ref == 0 {
                self.run_queue.remove(node);
            }
        }
        let taken = inner.sm.take();
        let agent = Agent {
            idx: idx as u8,
            r#gen,
        };

        let Some(mut sm) = taken else {
            debug_assert!(false, "agent machine missing outside dispatch");
            let _ = self.store.destroy(event);
            return true;
        };
        if !self.store.is_valid(event) {
            log::warn!("kernel: dropping stale event handle");
            if let Some(inner) = self.agents[idx].inner.as_mut() {
                inner.sm = Some(sm);
            }
            return true;
        }

        // Dispatch outside any queue bookkeeping: the handler may send,
        // allocate and arm timers freely. The event keeps the reference
        // its queue slot held until we release it below.
        let id = self.store.id(event).unwrap_or(0);
        let mut scratch = core::mem::take(&mut self.scratch);
        self.store.copy_payload_into(event, &mut scratch);
        self.current = Some(agent);
        let view = Evt {
            id,
            payload: &scratch,
            source: Some(event),
        };
        let action = smp::dispatch(&mut sm, self, agent, &view);
        self.current = None;
        self.scratch = scratch;

        if let Some(inner) = self.agents[idx].inner.as_mut() {
            inner.sm = Some(sm);
        }

        match action {
            Action::Deferred => {
                // Re-queue with the reference carried over; a full queue
                // at this point drops the event like a failed send.
                self.stats.deferred += 1;
                if self.enqueue_raw(idx, event, Order::Fifo).is_err() {
                    log::warn!("kernel: queue full while deferring, dropping event {id}");
                    let _ = self.store.destroy(event);
                }
            }
            _ => {
                let _ = self.store.destroy(event);
            }
        }
        self.stats.dispatched += 1;
        true
    }

    /// Drain the port: pending ticks first, then ISR mailbox posts,
    /// each delivered through the normal producer path.
    pub fn drain_port(&mut self) {
        for _ in 0..port::take_ticks() {
            self.tick();
        }
        let mut posts: Vec<(Agent, u16)> = Vec::new();
        port::drain_mailbox(|agent, id| posts.push((agent, id)));
        for (agent, id) in posts {
            match self.event_create(id, 0) {
                Ok(event) => {
                    if let Err(err) = self.epa_send(agent, event) {
                        if err != Error::NoMemory {
                            let _ = self.event_destroy(event);
                        }
                        log::warn!("kernel: mailbox event {id} dropped ({err})");
                    }
                }
                Err(err) => log::warn!("kernel: mailbox event {id} not created ({err})"),
            }
        }
    }

    /// The scheduler loop: drain the port, dispatch while work exists,
    /// park in the port when idle. Returns when a shutdown is requested
    /// through [`port::request_shutdown`].
    pub fn run(&mut self) {
        log::info!("kernel: scheduler loop entered");
        loop {
            self.drain_port();
            if port::shutdown_requested() {
                break;
            }
            if !self.step() {
                port::idle_wait();
            }
        }
        log::info!("kernel: scheduler loop exited");
    }

    /// Test/bring-up helper: dispatch until no agent is runnable and no
    /// port work is pending.
    pub fn run_until_quiescent(&mut self) {
        loop {
            self.drain_port();
            if !self.step() {
                break;
            }
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> KernelStats {
        self.stats
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

fn check_user_id(id: u16) -> Result<()> {
    if id >= SYSTEM_ID_FLOOR {
        debug_assert!(false, "event id collides with the system range");
        return Err(Error::ArgOutOfRange);
    }
    Ok(())
}
