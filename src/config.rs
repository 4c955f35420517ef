//! Compile-time kernel configuration.
//!
//! All tunables are plain constants so that array sizes, bitmap widths and
//! path bounds are fixed at build time. The `const` blocks at the bottom
//! reject inconsistent combinations during compilation rather than at boot.

/// Number of distinct agent priority levels (0 is reserved for the idle
/// thread). Higher value = higher priority.
pub const PRIORITY_LEVELS: usize = 32;

/// Number of run-queue buckets. Must divide `PRIORITY_LEVELS`.
///
/// When equal to `PRIORITY_LEVELS` every priority has its own bucket and
/// in-bucket order is plain FIFO; when smaller, several priorities share a
/// bucket and insertion is sorted by priority.
pub const PRIORITY_BUCKETS: usize = 32;

/// Upper bound on state-machine nesting. Transition paths deeper than this
/// are a fatal contract violation.
pub const HSM_PATH_DEPTH: usize = 8;

/// Capacity of the event pool registry.
pub const EVENT_POOL_SLOTS: usize = 4;

/// Saturation limit for the per-event reference counter.
pub const REF_LIMIT: u16 = u16::MAX;

/// Nominal kernel tick frequency in Hz. The hosted tick thread and the
/// ESP-IDF tick timer both derive their period from this.
pub const TICK_HZ: u32 = 100;

/// Depth of the interrupt-to-kernel event mailbox.
pub const MAILBOX_DEPTH: usize = 32;

// Configuration sanity checks — evaluated at compile time.
const _: () = assert!(PRIORITY_LEVELS >= 2, "need at least idle + one agent level");
const _: () = assert!(PRIORITY_LEVELS <= 256, "priorities are stored in a u8");
const _: () = assert!(PRIORITY_BUCKETS >= 1);
const _: () = assert!(PRIORITY_BUCKETS <= PRIORITY_LEVELS);
const _: () = assert!(
    PRIORITY_LEVELS % PRIORITY_BUCKETS == 0,
    "bucket count must divide priority count"
);
const _: () = assert!(HSM_PATH_DEPTH >= 2);
const _: () = assert!(TICK_HZ > 0);
