//! State machine processor: hierarchical and flat dispatch over
//! function-pointer states.
//!
//! A state is a plain `fn` — no closures, no trait objects — that maps
//! `(context, event)` to an [`Action`]:
//!
//! ```text
//!               ┌────────────────────────────────────────────┐
//!               │ fn s11(ctx, evt) -> Action                 │
//!   event ────▶ │   match evt.id {                           │
//!               │     SIG_GO   => Action::TransitTo(s2),     │
//!               │     EV_ENTRY => { ...; Action::Handled }   │
//!               │     _        => Action::Super(s1),         │
//!               │   }                                        │
//!               └────────────────────────────────────────────┘
//! ```
//!
//! Hierarchy is expressed by each state answering unhandled events —
//! including the `EV_SUPER` probe — with `Super(parent)`; [`top_state`]
//! roots every hierarchy by ignoring everything. The hierarchical
//! dispatcher walks the `Super` chain to find a handler, executes
//! transitions through the least common ancestor with child-first exits
//! and parent-first entries, and then follows `EV_INIT` cascades until
//! the machine settles on a leaf. The flat dispatcher does the same
//! without following `Super`.
//!
//! Handlers run with full kernel access (send events, start timers,
//! allocate) through [`Ctx`]; the state machine bookkeeping itself is
//! owned by the dispatcher, so a handler changes state only by
//! *returning* a transition.

use core::any::Any;

use heapless::Vec as FixedVec;

use crate::config::HSM_PATH_DEPTH;
use crate::epa::Agent;
use crate::event::{EV_ENTRY, EV_EXIT, EV_INIT, EV_SUPER, EventRef};
use crate::kernel::Kernel;

/// Dispatch context handed to every state handler.
pub struct Ctx<'a> {
    /// Full kernel access: send, timers, allocation.
    pub kernel: &'a mut Kernel,
    /// The agent whose machine is being dispatched.
    pub agent: Agent,
    wspace: &'a mut (dyn Any + Send),
}

impl Ctx<'_> {
    /// Typed view of the machine's workspace, `None` on type mismatch.
    pub fn workspace<T: 'static>(&mut self) -> Option<&mut T> {
        self.wspace.downcast_mut::<T>()
    }
}

/// The event view a handler receives: id, in-place payload bytes, and —
/// for real (non-pseudo) events — the handle for re-sending, reserving
/// or forwarding.
pub struct Evt<'a> {
    pub id: u16,
    pub payload: &'a [u8],
    pub source: Option<EventRef>,
}

/// State handler signature.
pub type State = fn(&mut Ctx<'_>, &Evt<'_>) -> Action;

/// What a state handler decided about an event.
#[derive(Clone, Copy, Debug)]
pub enum Action {
    /// Not consumed here; retry at the given parent state.
    Super(State),
    /// Transition to the given state.
    TransitTo(State),
    /// Consumed.
    Handled,
    /// Not relevant; dispatch ends.
    Ignored,
    /// Re-queue this event instead of releasing it.
    Deferred,
}

/// Dispatch style of a machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmKind {
    Hsm,
    Fsm,
}

/// Root of every hierarchy: ignores all events, including the
/// superstate probe.
pub fn top_state(_ctx: &mut Ctx<'_>, _evt: &Evt<'_>) -> Action {
    Action::Ignored
}

/// A state machine: current state, dispatch style, opaque workspace.
pub struct Sm {
    kind: SmKind,
    state: State,
    wspace: Box<dyn Any + Send>,
}

impl Sm {
    /// Hierarchical machine starting in `init`.
    pub fn hsm(init: State, wspace: impl Any + Send) -> Self {
        Self {
            kind: SmKind::Hsm,
            state: init,
            wspace: Box::new(wspace),
        }
    }

    /// Flat machine starting in `init`.
    pub fn fsm(init: State, wspace: impl Any + Send) -> Self {
        Self {
            kind: SmKind::Fsm,
            state: init,
            wspace: Box::new(wspace),
        }
    }

    /// The current state handler.
    pub fn state(&self) -> State {
        self.state
    }

    /// Typed view of the workspace outside dispatch.
    pub fn workspace<T: 'static>(&mut self) -> Option<&mut T> {
        self.wspace.downcast_mut::<T>()
    }
}

fn same(a: State, b: State) -> bool {
    core::ptr::fn_addr_eq(a, b)
}

const fn pseudo(id: u16) -> Evt<'static> {
    Evt {
        id,
        payload: &[],
        source: None,
    }
}

static SUPER_EVT: Evt<'static> = pseudo(EV_SUPER);
static ENTRY_EVT: Evt<'static> = pseudo(EV_ENTRY);
static EXIT_EVT: Evt<'static> = pseudo(EV_EXIT);
static INIT_EVT: Evt<'static> = pseudo(EV_INIT);

type Path = FixedVec<State, HSM_PATH_DEPTH>;

/// Run one event through a machine. Returns the handler's terminal
/// action; the caller only inspects it for [`Action::Deferred`].
pub(crate) fn dispatch(sm: &mut Sm, kernel: &mut Kernel, agent: Agent, evt: &Evt<'_>) -> Action {
    match sm.kind {
        SmKind::Hsm => hsm_dispatch(sm, kernel, agent, evt),
        SmKind::Fsm => fsm_dispatch(sm, kernel, agent, evt),
    }
}

fn call(
    kernel: &mut Kernel,
    wspace: &mut Box<dyn Any + Send>,
    agent: Agent,
    state: State,
    evt: &Evt<'_>,
) -> Action {
    let mut ctx = Ctx {
        kernel,
        agent,
        wspace: wspace.as_mut(),
    };
    state(&mut ctx, evt)
}

// ── Flat dispatch ─────────────────────────────────────────────

fn fsm_dispatch(sm: &mut Sm, kernel: &mut Kernel, agent: Agent, evt: &Evt<'_>) -> Action {
    let Sm {
        state, wspace, ..
    } = sm;
    let action = call(kernel, wspace, agent, *state, evt);

    match action {
        Action::TransitTo(next) => {
            let mut current = *state;
            let mut next = next;
            loop {
                call(kernel, wspace, agent, current, &EXIT_EVT);
                call(kernel, wspace, agent, next, &ENTRY_EVT);
                current = next;
                match call(kernel, wspace, agent, current, &INIT_EVT) {
                    Action::TransitTo(deeper) => next = deeper,
                    _ => break,
                }
            }
            *state = current;
            Action::Handled
        }
        // A flat machine has no hierarchy to escalate into.
        Action::Super(_) => Action::Ignored,
        other => other,
    }
}

// ── Hierarchical dispatch ─────────────────────────────────────

fn hsm_dispatch(sm: &mut Sm, kernel: &mut Kernel, agent: Agent, evt: &Evt<'_>) -> Action {
    let Sm {
        state, wspace, ..
    } = sm;
    let leaf = *state;

    // Find a handler: walk the Super chain upward.
    let mut source = leaf;
    let mut action = call(kernel, wspace, agent, source, evt);
    let mut depth = 0usize;
    while let Action::Super(parent) = action {
        depth += 1;
        if depth > HSM_PATH_DEPTH {
            log::error!("smp: super chain exceeds HSM_PATH_DEPTH");
            debug_assert!(false, "state nesting too deep");
            return Action::Handled;
        }
        source = parent;
        action = call(kernel, wspace, agent, source, evt);
    }

    match action {
        Action::TransitTo(target) => {
            let deepest = transition(kernel, wspace, agent, leaf, source, target);
            *state = deepest;
            Action::Handled
        }
        other => other,
    }
}

/// Ask a state for its superstate. `None` for the hierarchy root.
fn probe_super(
    kernel: &mut Kernel,
    wspace: &mut Box<dyn Any + Send>,
    agent: Agent,
    state: State,
) -> Option<State> {
    match call(kernel, wspace, agent, state, &SUPER_EVT) {
        Action::Super(parent) => Some(parent),
        _ => None,
    }
}

/// States from `state` to the hierarchy root, both inclusive.
fn path_to_root(
    kernel: &mut Kernel,
    wspace: &mut Box<dyn Any + Send>,
    agent: Agent,
    state: State,
) -> Path {
    let mut path = Path::new();
    let mut cursor = state;
    loop {
        if path.push(cursor).is_err() {
            log::error!("smp: state path exceeds HSM_PATH_DEPTH");
            debug_assert!(false, "state nesting too deep");
            break;
        }
        match probe_super(kernel, wspace, agent, cursor) {
            Some(parent) => cursor = parent,
            None => break,
        }
    }
    path
}

/// Execute a transition requested by `source` while the machine stood in
/// `leaf`. Returns the deepest state entered after init cascades.
fn transition(
    kernel: &mut Kernel,
    wspace: &mut Box<dyn Any + Send>,
    agent: Agent,
    leaf: State,
    source: State,
    target: State,
) -> State {
    // States below the transition source always exit first.
    let mut cursor = leaf;
    let mut guard = 0usize;
    while !same(cursor, source) {
        guard += 1;
        if guard > HSM_PATH_DEPTH {
            log::error!("smp: exit chain exceeds HSM_PATH_DEPTH");
            debug_assert!(false, "state nesting too deep");
            break;
        }
        let parent = probe_super(kernel, wspace, agent, cursor);
        call(kernel, wspace, agent, cursor, &EXIT_EVT);
        match parent {
            Some(parent) => cursor = parent,
            None => break,
        }
    }

    if same(source, target) {
        // Self-transition: leave and re-enter.
        call(kernel, wspace, agent, source, &EXIT_EVT);
        call(kernel, wspace, agent, target, &ENTRY_EVT);
    } else {
        let source_path = path_to_root(kernel, wspace, agent, source);
        let target_path = path_to_root(kernel, wspace, agent, target);

        // Least common ancestor: first source ancestor on the target path.
        let mut lca = (source_path.len(), target_path.len());
        'outer: for (si, s) in source_path.iter().enumerate() {
            for (ti, t) in target_path.iter().enumerate() {
                if same(*s, *t) {
                    lca = (si, ti);
                    break 'outer;
                }
            }
        }
        let (si, ti) = lca;

        // Exit child-first from the source up to (excluding) the LCA.
        for s in &source_path[..si] {
            call(kernel, wspace, agent, *s, &EXIT_EVT);
        }
        // Enter parent-first from below the LCA down to the target.
        for t in target_path[..ti].iter().rev() {
            call(kernel, wspace, agent, *t, &ENTRY_EVT);
        }
    }

    // Init cascade: each init transition drills into a child.
    let mut current = target;
    let mut guard = 0usize;
    while let Action::TransitTo(child) = call(kernel, wspace, agent, current, &INIT_EVT) {
        guard += 1;
        if guard > HSM_PATH_DEPTH {
            log::error!("smp: init cascade exceeds HSM_PATH_DEPTH");
            debug_assert!(false, "state nesting too deep");
            break;
        }
        // Entry path from just below `current` down to the child.
        let mut entry_path = Path::new();
        let mut cursor = child;
        loop {
            if entry_path.push(cursor).is_err() {
                log::error!("smp: entry path exceeds HSM_PATH_DEPTH");
                debug_assert!(false, "state nesting too deep");
                break;
            }
            match probe_super(kernel, wspace, agent, cursor) {
                Some(parent) if !same(parent, current) => cursor = parent,
                _ => break,
            }
        }
        for s in entry_path.iter().rev() {
            call(kernel, wspace, agent, *s, &ENTRY_EVT);
        }
        current = child;
    }
    current
}
