/// Blockq: the wait primitive pairing thread suspension with timed,
/// cancellable wakeup.
///
/// A waiter is a re-entrant action. The first invocation runs inline
/// from `check_timeout`; returning `None` parks the waiter. Wakeups,
/// timeouts, and nullification (signal delivery) re-run the action with
/// the corresponding flags until it produces a result. The action owns
/// the syscall completion and applies it exactly once, when it returns
/// `Some`.
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use bitflags::bitflags;
use spin::Mutex;

use super::Sysreturn;
use crate::time::{self, TimerId};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct BqFlags: u32 {
        /// Re-entry after the waiter blocked (not the inline first run).
        const BLOCKED = 1 << 0;
        /// The wait was nullified (signal); the action must resolve now.
        const NULLIFY = 1 << 1;
        /// The timeout fired; the action must resolve now.
        const TIMEDOUT = 1 << 2;
    }
}

/// `Some(rv)` resolves the wait; `None` keeps (or starts) blocking.
pub type BqAction = Box<dyn FnMut(BqFlags) -> Option<Sysreturn> + Send>;

struct Waiter {
    id: u64,
    action: BqAction,
    timer: Option<TimerId>,
}

struct BqInner {
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

pub struct Blockq {
    inner: Mutex<BqInner>,
}

impl Blockq {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BqInner { waiters: VecDeque::new(), next_id: 1 }),
        })
    }

    /// Run `action` inline; on `None` park it as a waiter, arming a
    /// timeout when one is given. Returns the synchronous result, or
    /// `None` when the caller blocked (the action delivers the result
    /// through its completion later).
    pub fn check_timeout(
        self: &Arc<Self>,
        mut action: BqAction,
        timeout_ns: Option<u64>,
    ) -> Option<Sysreturn> {
        if let Some(rv) = action(BqFlags::empty()) {
            return Some(rv);
        }

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let timer = timeout_ns.map(|ns| {
            let bq = self.clone();
            time::register_timer(
                time::now_ns() + ns,
                Box::new(move || bq.timeout_waiter(id)),
            )
        });
        inner.waiters.push_back(Waiter { id, action, timer });
        None
    }

    /// Wake the frontmost waiter. If its action still does not resolve
    /// it goes back to the front of the queue.
    pub fn wake_one(self: &Arc<Self>) {
        let mut waiter = match self.inner.lock().waiters.pop_front() {
            Some(w) => w,
            None => return,
        };
        match (waiter.action)(BqFlags::BLOCKED) {
            Some(_) => {
                if let Some(t) = waiter.timer {
                    time::cancel_timer(t);
                }
            }
            None => {
                self.inner.lock().waiters.push_front(waiter);
            }
        }
    }

    /// Timeout delivery: the action is required to resolve when it sees
    /// TIMEDOUT.
    fn timeout_waiter(self: &Arc<Self>, id: u64) {
        let mut waiter = {
            let mut inner = self.inner.lock();
            match inner.waiters.iter().position(|w| w.id == id) {
                Some(pos) => inner.waiters.remove(pos).unwrap(),
                None => return, // already resolved
            }
        };
        waiter.timer = None;
        if (waiter.action)(BqFlags::BLOCKED | BqFlags::TIMEDOUT).is_none() {
            log::warn!("blockq: action ignored TIMEDOUT");
        }
    }

    /// Nullify every waiter (signal delivery): each action resolves with
    /// its interrupted status.
    pub fn nullify_all(self: &Arc<Self>) {
        loop {
            let mut waiter = match self.inner.lock().waiters.pop_front() {
                Some(w) => w,
                None => break,
            };
            if let Some(t) = waiter.timer.take() {
                time::cancel_timer(t);
            }
            if (waiter.action)(BqFlags::BLOCKED | BqFlags::NULLIFY).is_none() {
                log::warn!("blockq: action ignored NULLIFY");
            }
        }
    }

    pub fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}
