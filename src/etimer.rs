//! Event timers: virtual timers that deliver events to agents.
//!
//! An event timer binds a wheel timer, a pre-created constant event and
//! a client agent. Arming stamps the event with the requested id; expiry
//! runs inside tick processing and does O(1) work — it pushes the
//! already-existing event at the *head* of the client's queue so timed
//! events are seen next without changing the agent's priority.
//!
//! Because the carried event is constant it is never reclaimed and can
//! sit in the queue across repeated fires.

use crate::epa::Agent;
use crate::event::EventRef;
use crate::tmr::TimerHandle;

/// Handle to an event timer created by
/// [`crate::kernel::Kernel::etimer_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTimer {
    pub(crate) idx: u16,
    pub(crate) r#gen: u16,
}

pub(crate) struct EtimerSlot {
    pub(crate) r#gen: u16,
    pub(crate) inner: Option<EtimerInner>,
}

pub(crate) struct EtimerInner {
    pub(crate) timer: TimerHandle,
    pub(crate) event: EventRef,
    pub(crate) client: Agent,
}
