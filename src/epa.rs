//! Event Processing Agents: the unit of schedulable work.
//!
//! An agent binds three things: a state machine, a bounded event queue,
//! and a schedulable thread record (priority + runnable counter) living
//! in the kernel's agent arena. Agents never block — they are runnable
//! exactly while their queue is non-empty, and the scheduler hands them
//! one event per pass.
//!
//! The public face is the copyable [`Agent`] handle; all operations go
//! through [`crate::kernel::Kernel`] methods.

use serde::Serialize;

use crate::equeue::EventQueue;
use crate::smp::Sm;

/// Handle to a registered agent. Generation-tagged; handles to a
/// destroyed agent are rejected with `ObjectInvalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Agent {
    pub(crate) idx: u8,
    pub(crate) r#gen: u8,
}

impl Agent {
    #[cfg(test)]
    pub(crate) fn test_handle(idx: u8, r#gen: u8) -> Self {
        Self { idx, r#gen }
    }
}

/// Construction parameters for [`crate::kernel::Kernel::epa_create`].
#[derive(Debug, Clone, Copy)]
pub struct AgentDef {
    /// Name used in logs and diagnostics.
    pub name: &'static str,
    /// Scheduling priority, `1..PRIORITY_LEVELS`. Higher runs first;
    /// 0 belongs to the built-in idle thread.
    pub priority: u8,
    /// Event queue capacity in events.
    pub queue_len: usize,
}

/// Queue occupancy snapshot for one agent.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AgentStats {
    pub queue_len: usize,
    pub queue_capacity: usize,
    /// Low-water mark of free queue slots since creation.
    pub queue_min_free: usize,
}

pub(crate) struct AgentSlot {
    pub(crate) r#gen: u8,
    pub(crate) inner: Option<AgentInner>,
}

pub(crate) struct AgentInner {
    pub(crate) name: &'static str,
    pub(crate) prio: u8,
    /// Number of non-empty event sources; the agent sits on the run
    /// queue exactly while this is non-zero.
    pub(crate) thread_ref: u16,
    /// `None` while the machine is checked out for dispatch.
    pub(crate) sm: Option<Sm>,
    pub(crate) queue: EventQueue,
}

impl AgentInner {
    pub(crate) fn stats(&self) -> AgentStats {
        AgentStats {
            queue_len: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            queue_min_free: self.queue.min_free(),
        }
    }
}
