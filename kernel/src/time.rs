/// Monotonic clock and timer wheel.
///
/// The kernel clock is TSC-backed; on the host test target it is a plain
/// counter that tests advance explicitly. Timers are serviced from the
/// kernel poll loop, not from an interrupt, so callbacks may take locks
/// freely.
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

pub const NANOS_PER_MS: u64 = 1_000_000;

/// Current monotonic time in nanoseconds.
#[cfg(not(test))]
pub fn now_ns() -> u64 {
    crate::arch::x86_64::timer::monotonic_ns()
}

#[cfg(test)]
static TEST_CLOCK_NS: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
pub fn now_ns() -> u64 {
    TEST_CLOCK_NS.load(Ordering::Relaxed)
}

/// Advance the test clock. Callers still need `service_timers` to fire
/// anything that became due.
#[cfg(test)]
pub fn test_advance_ns(ns: u64) {
    TEST_CLOCK_NS.fetch_add(ns, Ordering::Relaxed);
}

pub type TimerCallback = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerId(u64);

struct TimerEntry {
    id: u64,
    deadline_ns: u64,
    callback: TimerCallback,
}

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);
static TIMERS: Mutex<Vec<TimerEntry>> = Mutex::new(Vec::new());

/// Arm a one-shot timer at an absolute deadline.
pub fn register_timer(deadline_ns: u64, callback: TimerCallback) -> TimerId {
    let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
    TIMERS.lock().push(TimerEntry { id, deadline_ns, callback });
    TimerId(id)
}

/// Cancel a pending timer. Returns false if it already fired or was
/// cancelled.
pub fn cancel_timer(id: TimerId) -> bool {
    let mut timers = TIMERS.lock();
    match timers.iter().position(|t| t.id == id.0) {
        Some(pos) => {
            timers.swap_remove(pos);
            true
        }
        None => false,
    }
}

/// Fire every timer whose deadline has passed. Callbacks run outside the
/// timer lock.
pub fn service_timers() {
    let now = now_ns();
    let mut due = Vec::new();
    {
        let mut timers = TIMERS.lock();
        let mut i = 0;
        while i < timers.len() {
            if timers[i].deadline_ns <= now {
                due.push(timers.swap_remove(i));
            } else {
                i += 1;
            }
        }
    }
    due.sort_by_key(|t| t.deadline_ns);
    for t in due {
        (t.callback)();
    }
}

/// Number of pending timers (diagnostics).
pub fn pending_timers() -> usize {
    TIMERS.lock().len()
}
