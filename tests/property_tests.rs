//! Property tests for the public kernel API.
//!
//! Host-only; on device targets these are compiled out.

#![cfg(not(target_os = "espidf"))]

use std::sync::{Arc, Mutex};

use evkern::event::{EV_ENTRY, EV_EXIT, EV_INIT, SYSTEM_ID_FLOOR};
use evkern::{Action, AgentDef, Ctx, Evt, Kernel, Mem, Sm, top_state};
use proptest::prelude::*;

type Log = Arc<Mutex<Vec<(u8, u16)>>>;

struct Ws {
    tag: u8,
    log: Log,
}

fn recorder(ctx: &mut Ctx<'_>, evt: &Evt<'_>) -> Action {
    if evt.id < SYSTEM_ID_FLOOR {
        let ws = ctx.workspace::<Ws>().unwrap();
        let tag = ws.tag;
        ws.log.lock().unwrap().push((tag, evt.id));
        return Action::Handled;
    }
    match evt.id {
        EV_ENTRY | EV_EXIT | EV_INIT => Action::Handled,
        _ => Action::Super(top_state),
    }
}

fn spawn(kernel: &mut Kernel, tag: u8, priority: u8, log: &Log) -> evkern::Agent {
    let agent = kernel
        .epa_create(
            AgentDef {
                name: "prop",
                priority,
                queue_len: 32,
            },
            Sm::hsm(recorder, Ws {
                tag,
                log: Arc::clone(log),
            }),
        )
        .unwrap();
    kernel.run_until_quiescent();
    agent
}

// ── Reference counting ────────────────────────────────────────

#[test]
fn refcount_equals_queue_slots_holding_the_event() {
    let log: Log = Arc::default();
    let mut kernel = Kernel::new();
    kernel.register_event_pool(Mem::new_pool(8, 16)).unwrap();

    let agents: Vec<_> = (0..4).map(|i| spawn(&mut kernel, i, 4, &log)).collect();

    let evt = kernel.event_create(1, 0).unwrap();
    kernel.event_lock(evt).unwrap();
    for (i, agent) in agents.iter().enumerate() {
        kernel.epa_send(*agent, evt).unwrap();
        assert_eq!(kernel.event_refc(evt).unwrap(), i as u16 + 1);
    }

    // Each dispatch releases exactly one queue slot's reference.
    while kernel.step() {
        let queued: u16 = agents
            .iter()
            .map(|a| kernel.agent_stats(*a).unwrap().queue_len as u16)
            .sum();
        assert_eq!(kernel.event_refc(evt).unwrap(), queued);
    }
    assert_eq!(kernel.event_refc(evt).unwrap(), 0);
    assert_eq!(log.lock().unwrap().len(), 4);
}

proptest! {
    /// Events delivered to one agent always arrive in send order, for
    /// any mix of ids, and nothing is lost while the queue has room.
    #[test]
    fn single_agent_delivery_is_fifo(
        ids in proptest::collection::vec(1u16..1000, 1..=32),
    ) {
        let log: Log = Arc::default();
        let mut kernel = Kernel::new();
        kernel.register_event_pool(Mem::new_pool(64, 16)).unwrap();
        let agent = spawn(&mut kernel, 0, 4, &log);

        for &id in &ids {
            let evt = kernel.event_create(id, 0).unwrap();
            kernel.epa_send(agent, evt).unwrap();
        }
        kernel.run_until_quiescent();

        let seen: Vec<u16> = log.lock().unwrap().iter().map(|&(_, id)| id).collect();
        prop_assert_eq!(seen, ids);
    }

    /// With no sends during dispatch, every event of a higher-priority
    /// agent is delivered before any event of a lower-priority agent.
    #[test]
    fn priority_order_is_strict_across_agents(
        loads in proptest::collection::vec((1u8..8, 1usize..6), 2..=5),
    ) {
        let log: Log = Arc::default();
        let mut kernel = Kernel::new();
        kernel.register_event_pool(Mem::new_pool(64, 16)).unwrap();

        let mut plan: Vec<(u8, evkern::Agent, usize)> = Vec::new();
        for (tag, &(priority, count)) in loads.iter().enumerate() {
            let agent = spawn(&mut kernel, tag as u8, priority, &log);
            plan.push((priority, agent, count));
        }
        for &(_, agent, count) in &plan {
            for _ in 0..count {
                let evt = kernel.event_create(1, 0).unwrap();
                kernel.epa_send(agent, evt).unwrap();
            }
        }
        kernel.run_until_quiescent();

        // Map each delivery back to its agent's priority; the sequence
        // of priorities must be non-increasing.
        let seen = log.lock().unwrap().clone();
        let priorities: Vec<u8> = seen
            .iter()
            .map(|&(tag, _)| loads[tag as usize].0)
            .collect();
        for pair in priorities.windows(2) {
            prop_assert!(
                pair[0] >= pair[1],
                "delivery order violated priority: {:?}",
                priorities
            );
        }
        let total: usize = loads.iter().map(|&(_, c)| c).sum();
        prop_assert_eq!(seen.len(), total);
    }

    /// Create/send/dispatch/destroy cycles never leak pool blocks: the
    /// pool always refills to its full capacity.
    #[test]
    fn event_storage_never_leaks(
        rounds in proptest::collection::vec(0usize..4, 1..=40),
    ) {
        const BLOCKS: usize = 8;
        let log: Log = Arc::default();
        let mut kernel = Kernel::new();
        kernel.register_event_pool(Mem::new_pool(BLOCKS, 24)).unwrap();
        let agent = spawn(&mut kernel, 0, 4, &log);

        for round in rounds {
            match round {
                // Fire-and-forget send.
                0 => {
                    if let Ok(evt) = kernel.event_create(1, 8) {
                        let _ = kernel.epa_send(agent, evt);
                    }
                }
                // Create and immediately release.
                1 => {
                    if let Ok(evt) = kernel.event_create(2, 8) {
                        kernel.event_destroy(evt).unwrap();
                    }
                }
                // Dispatch whatever is queued.
                2 => kernel.run_until_quiescent(),
                // Reserve, send, dispatch, release.
                _ => {
                    if let Ok(evt) = kernel.event_create(3, 8) {
                        kernel.event_lock(evt).unwrap();
                        let _ = kernel.epa_send(agent, evt);
                        kernel.run_until_quiescent();
                        kernel.event_unlock(evt).unwrap();
                    }
                }
            }
        }
        kernel.run_until_quiescent();

        // Every block must be allocatable again.
        let mut events = Vec::new();
        for _ in 0..BLOCKS {
            events.push(kernel.event_create(9, 8).unwrap());
        }
        for evt in events {
            kernel.event_destroy(evt).unwrap();
        }
    }
}
