//! Evkern: a cooperative event-driven micro-kernel.
//!
//! Work is organised around *agents* — prioritized state machines fed by
//! bounded queues of reference-counted events. A single-threaded
//! run-to-completion scheduler dispatches one event at a time to the
//! highest-priority runnable agent; virtual timers, event pools and a
//! hosted POSIX mode round out the core.
//!
//! ```no_run
//! use evkern::{Action, AgentDef, Ctx, Evt, Kernel, Mem, Sm, top_state};
//! use evkern::event::EV_INIT;
//!
//! fn blink(_ctx: &mut Ctx<'_>, evt: &Evt<'_>) -> Action {
//!     match evt.id {
//!         EV_INIT => Action::Handled,
//!         _ => Action::Super(top_state),
//!     }
//! }
//!
//! let mut kernel = Kernel::new();
//! kernel.register_event_pool(Mem::new_pool(16, 32)).unwrap();
//! let agent = kernel
//!     .epa_create(
//!         AgentDef { name: "blinky", priority: 4, queue_len: 8 },
//!         Sm::hsm(blink, ()),
//!     )
//!     .unwrap();
//! let evt = kernel.event_create(1, 0).unwrap();
//! kernel.epa_send(agent, evt).unwrap();
//! kernel.run_until_quiescent();
//! ```
//!
//! All ESP-IDF-specific code is guarded by `#[cfg(target_os = "espidf")]`
//! inside the port module; everything else runs identically on the host.

#![deny(unused_must_use)]

pub mod config;
pub mod epa;
pub mod etimer;
pub mod event;
pub mod kernel;
pub mod mem;
pub mod port;
pub mod smp;
pub mod tmr;

mod equeue;
mod error;
mod sched;

pub use epa::{Agent, AgentDef, AgentStats};
pub use error::{Error, Result};
pub use etimer::EventTimer;
pub use event::EventRef;
pub use kernel::{Kernel, KernelStats};
pub use mem::{Block, Mem, MemInfo, MemKind};
pub use smp::{Action, Ctx, Evt, Sm, SmKind, State, top_state};
pub use tmr::{TimerFn, TimerHandle, TimerMode};
