//! Port facade: everything the kernel needs from the platform.
//!
//! The kernel itself is a plain value mutated by exactly one thread of
//! execution (see [`crate::kernel::Kernel`]). Interrupt context therefore
//! never touches kernel state directly; it talks to the scheduler loop
//! through the two structures here:
//!
//! ```text
//! ┌─────────────┐                       ┌───────────────────────┐
//! │ Tick ISR /  │── tick_isr() ───────▶ │ pending-tick counter  │
//! │ tick thread │                       ├───────────────────────┤
//! │ GPIO ISR    │── post_from_isr() ──▶ │ mailbox (agent, id)   │
//! └─────────────┘                       └──────────┬────────────┘
//!                                                  │ drained at the top of
//!                                                  ▼ every loop iteration
//!                                          Kernel::run() / step()
//! ```
//!
//! Both are guarded by `critical_section`, the one lock primitive shared
//! with interrupt context. On bare-metal ports that is an interrupt mask;
//! with the `std` implementation (hosted POSIX mode, tests) it is a
//! process-global mutex.
//!
//! The module also provides the O(1) log2/exp2 pair used by the run-queue
//! bitmap, the idle/park primitive, and the tick sources: a background
//! thread on hosted builds, a periodic `esp_timer` on ESP-IDF.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use critical_section::Mutex;
use heapless::Deque;

use crate::config::MAILBOX_DEPTH;
use crate::epa::Agent;

// ── O(1) bit math ─────────────────────────────────────────────

/// Index of the highest set bit. O(1) via the CLZ instruction.
///
/// `x` must be non-zero; zero is a contract violation.
#[inline]
pub fn log2(x: u32) -> u8 {
    debug_assert!(x != 0, "log2 of zero");
    (31 - x.leading_zeros()) as u8
}

/// `1 << n` for `n < 32`.
#[inline]
pub fn exp2(n: u8) -> u32 {
    debug_assert!(n < 32, "exp2 shift out of range");
    1u32 << n
}

// ── Critical section bookkeeping ──────────────────────────────

static CS_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Run `f` inside the platform critical section, tracking nesting depth
/// so [`in_critical`] can back assertions in ISR-shared paths.
pub(crate) fn with_cs<R>(f: impl FnOnce(critical_section::CriticalSection<'_>) -> R) -> R {
    critical_section::with(|cs| {
        CS_DEPTH.fetch_add(1, Ordering::Relaxed);
        let r = f(cs);
        CS_DEPTH.fetch_sub(1, Ordering::Relaxed);
        r
    })
}

/// Debug predicate: is any critical section currently held?
pub fn in_critical() -> bool {
    CS_DEPTH.load(Ordering::Relaxed) > 0
}

// ── Pending ticks ─────────────────────────────────────────────

static PENDING_TICKS: AtomicU32 = AtomicU32::new(0);

/// Record one kernel tick. Callable from interrupt context; the tick is
/// processed the next time the scheduler loop runs.
pub fn tick_isr() {
    PENDING_TICKS.fetch_add(1, Ordering::Release);
    wake();
}

/// Take all ticks accumulated since the last call.
pub(crate) fn take_ticks() -> u32 {
    PENDING_TICKS.swap(0, Ordering::AcqRel)
}

// ── ISR → kernel mailbox ──────────────────────────────────────

type MailEntry = (Agent, u16);

static MAILBOX: Mutex<RefCell<Deque<MailEntry, MAILBOX_DEPTH>>> =
    Mutex::new(RefCell::new(Deque::new()));

/// Post an event id to an agent from interrupt context.
///
/// The kernel materialises a zero-payload event and delivers it through
/// the normal send path when the loop next drains the mailbox. Returns
/// `false` if the mailbox is full (the notification is dropped).
pub fn post_from_isr(agent: Agent, event_id: u16) -> bool {
    let ok = with_cs(|cs| {
        MAILBOX
            .borrow_ref_mut(cs)
            .push_back((agent, event_id))
            .is_ok()
    });
    if ok {
        wake();
    }
    ok
}

/// Drain the mailbox, one entry per critical section so interrupt latency
/// stays bounded.
pub(crate) fn drain_mailbox(mut f: impl FnMut(Agent, u16)) {
    loop {
        let entry = with_cs(|cs| MAILBOX.borrow_ref_mut(cs).pop_front());
        match entry {
            Some((agent, id)) => f(agent, id),
            None => break,
        }
    }
}

#[cfg(test)]
pub(crate) fn mailbox_reset() {
    with_cs(|cs| MAILBOX.borrow_ref_mut(cs).clear());
}

// ── Shutdown ──────────────────────────────────────────────────

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Ask the scheduler loop to exit (hosted mode). Callable from any thread
/// or interrupt context.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Release);
    wake();
}

/// Clear a previous shutdown request so the loop can be entered again.
pub fn reset_shutdown() {
    SHUTDOWN.store(false, Ordering::Release);
}

pub(crate) fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Acquire)
}

// ── Idle / wake ───────────────────────────────────────────────

static WAKER: Mutex<RefCell<Option<std::thread::Thread>>> = Mutex::new(RefCell::new(None));

fn wake() {
    let parked = with_cs(|cs| WAKER.borrow_ref_mut(cs).take());
    if let Some(thread) = parked {
        thread.unpark();
    }
}

/// Park the calling thread until a tick, a mailbox post or a shutdown
/// request arrives. Called by the scheduler loop when only the idle
/// thread is runnable; does not return before at least one wake source
/// has been serviced (or the park timeout elapses as a safety net).
pub fn idle_wait() {
    with_cs(|cs| *WAKER.borrow_ref_mut(cs) = Some(std::thread::current()));

    // Re-check after registering: a wake between the caller's last poll
    // and the registration above must not be lost.
    if PENDING_TICKS.load(Ordering::Acquire) > 0
        || SHUTDOWN.load(Ordering::Acquire)
        || with_cs(|cs| !MAILBOX.borrow_ref(cs).is_empty())
    {
        with_cs(|cs| *WAKER.borrow_ref_mut(cs) = None);
        return;
    }
    std::thread::park_timeout(std::time::Duration::from_millis(10));
    with_cs(|cs| *WAKER.borrow_ref_mut(cs) = None);
}

// ── Hosted tick source ────────────────────────────────────────

/// Background thread driving [`tick_isr`] at a fixed rate — the hosted
/// stand-in for a core-timer interrupt.
#[cfg(not(target_os = "espidf"))]
pub struct TickSource {
    stop: std::sync::Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

#[cfg(not(target_os = "espidf"))]
impl TickSource {
    /// Start ticking at `hz`. The thread stops when the value is dropped.
    pub fn start(hz: u32) -> Self {
        assert!(hz > 0, "tick rate must be non-zero");
        let stop = std::sync::Arc::new(AtomicBool::new(false));
        let stop2 = std::sync::Arc::clone(&stop);
        let period = std::time::Duration::from_micros(1_000_000 / u64::from(hz));
        let handle = std::thread::spawn(move || {
            while !stop2.load(Ordering::Acquire) {
                std::thread::sleep(period);
                tick_isr();
            }
        });
        log::info!("port: hosted tick source running at {hz} Hz");
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

#[cfg(not(target_os = "espidf"))]
impl Drop for TickSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ── ESP-IDF tick source ───────────────────────────────────────

#[cfg(target_os = "espidf")]
mod esp {
    use esp_idf_svc::sys::*;

    use super::tick_isr;
    use crate::config::TICK_HZ;

    static mut TICK_TIMER: esp_timer_handle_t = core::ptr::null_mut();

    unsafe extern "C" fn tick_cb(_arg: *mut core::ffi::c_void) {
        tick_isr();
    }

    /// Start the periodic tick timer at [`TICK_HZ`].
    ///
    /// Runs in the ESP timer task context (not a hard ISR), which is
    /// allowed to take the critical section.
    pub fn start_tick_timer() {
        // SAFETY: TICK_TIMER is written once here, from the single main
        // task, before the callback can fire. The callback only calls
        // tick_isr(), which is interrupt-safe.
        unsafe {
            let args = esp_timer_create_args_t {
                callback: Some(tick_cb),
                arg: core::ptr::null_mut(),
                dispatch_method: esp_timer_dispatch_t_ESP_TIMER_TASK,
                name: c"kernel-tick".as_ptr(),
                skip_unhandled_events: false,
            };
            let ret = esp_timer_create(&args, &raw mut TICK_TIMER);
            if ret != ESP_OK {
                log::error!("port: tick timer create failed (rc={ret})");
                return;
            }
            let period_us = 1_000_000u64 / u64::from(TICK_HZ);
            let ret = esp_timer_start_periodic(TICK_TIMER, period_us);
            if ret != ESP_OK {
                log::error!("port: tick timer start failed (rc={ret})");
                return;
            }
        }
        log::info!("port: tick timer running at {TICK_HZ} Hz");
    }

    /// Stop the tick timer if it is running.
    pub fn stop_tick_timer() {
        // SAFETY: TICK_TIMER is a valid handle if start_tick_timer()
        // succeeded; the null check prevents a double stop.
        unsafe {
            let timer = TICK_TIMER;
            if !timer.is_null() {
                esp_timer_stop(timer);
            }
        }
    }
}

#[cfg(target_os = "espidf")]
pub use esp::{start_tick_timer, stop_tick_timer};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log2_matches_highest_bit() {
        assert_eq!(log2(1), 0);
        assert_eq!(log2(2), 1);
        assert_eq!(log2(3), 1);
        assert_eq!(log2(0x8000_0000), 31);
        for n in 0..32u8 {
            assert_eq!(log2(exp2(n)), n);
        }
    }

    #[test]
    fn ticks_accumulate_and_drain() {
        let _ = take_ticks();
        tick_isr();
        tick_isr();
        tick_isr();
        assert_eq!(take_ticks(), 3);
        assert_eq!(take_ticks(), 0);
    }

    #[test]
    fn mailbox_is_fifo_and_bounded() {
        mailbox_reset();
        let agent = Agent::test_handle(1, 0);
        for i in 0..MAILBOX_DEPTH as u16 {
            assert!(post_from_isr(agent, i));
        }
        assert!(!post_from_isr(agent, 999), "mailbox must reject when full");

        let mut seen = Vec::new();
        drain_mailbox(|_, id| seen.push(id));
        assert_eq!(seen.len(), MAILBOX_DEPTH);
        assert_eq!(seen[0], 0);
        assert_eq!(*seen.last().unwrap(), MAILBOX_DEPTH as u16 - 1);
    }

    #[test]
    fn critical_depth_tracks_nesting() {
        // Other tests may hold the section concurrently; only the
        // inside-view is deterministic.
        with_cs(|_| {
            assert!(in_critical());
        });
    }
}
