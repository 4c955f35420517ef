//! Hosted port integration: tick thread, ISR mailbox and shutdown.
//!
//! One test drives the full loop so the process-global port state
//! (mailbox, tick counter, stop flag) has a single owner.

use std::sync::{Arc, Mutex};

use evkern::event::{EV_ENTRY, EV_EXIT, EV_INIT, SYSTEM_ID_FLOOR};
use evkern::port;
use evkern::{Action, AgentDef, Ctx, Evt, Kernel, Mem, Sm, top_state};

const ID_PERIODIC: u16 = 5;
const ID_FROM_ISR: u16 = 9;

struct Ws {
    fires: Arc<Mutex<Vec<u16>>>,
}

fn driver(ctx: &mut Ctx<'_>, evt: &Evt<'_>) -> Action {
    if evt.id < SYSTEM_ID_FLOOR {
        let this = ctx.agent;
        let ws = ctx.workspace::<Ws>().unwrap();
        ws.fires.lock().unwrap().push(evt.id);
        let periodic = ws
            .fires
            .lock()
            .unwrap()
            .iter()
            .filter(|&&id| id == ID_PERIODIC)
            .count();

        match evt.id {
            // After three periodic fires, inject an event the way an
            // interrupt would and let it shut the loop down.
            ID_PERIODIC if periodic == 3 => {
                assert!(port::post_from_isr(this, ID_FROM_ISR));
            }
            ID_FROM_ISR => port::request_shutdown(),
            _ => {}
        }
        return Action::Handled;
    }
    match evt.id {
        EV_ENTRY | EV_EXIT | EV_INIT => Action::Handled,
        _ => Action::Super(top_state),
    }
}

#[test]
fn scheduler_loop_runs_on_the_hosted_tick_source() {
    port::reset_shutdown();

    let fires = Arc::new(Mutex::new(Vec::new()));
    let mut kernel = Kernel::new();
    kernel.register_event_pool(Mem::new_pool(16, 16)).unwrap();

    let agent = kernel
        .epa_create(
            AgentDef {
                name: "driver",
                priority: 4,
                queue_len: 32,
            },
            Sm::hsm(driver, Ws {
                fires: Arc::clone(&fires),
            }),
        )
        .unwrap();
    kernel.run_until_quiescent();

    let timer = kernel.etimer_create(agent).unwrap();
    kernel.etimer_every(timer, 2, ID_PERIODIC).unwrap();

    let _ticks = port::TickSource::start(100);
    kernel.run();

    let seen = fires.lock().unwrap().clone();
    let periodic = seen.iter().filter(|&&id| id == ID_PERIODIC).count();
    assert!(periodic >= 3, "periodic timer must fire at least 3 times");
    assert_eq!(
        seen.last(),
        Some(&ID_FROM_ISR),
        "the ISR-injected event must arrive and stop the loop"
    );

    port::reset_shutdown();
}
