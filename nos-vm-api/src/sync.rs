//! Synchronization primitives for the virtual memory subsystem
//!
//! Short critical sections use the spinlocks re-exported here. State that
//! must stay consistent across a suspension point is guarded by the async
//! primitives of the submodules, which park the waiting future instead of
//! spinning.

pub use spin::Mutex;
pub use spin::RwLock;
pub use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

pub mod completion;
pub mod event;
pub mod mutex;

pub use completion::{Completion, CompletionWait};
pub use event::{CancellationEvent, EventWait, OneshotEvent, RecurringEvent, RecurringWait};
pub use mutex::{AsyncMutex, AsyncMutexGuard, AsyncMutexLock};

use alloc::vec::Vec;
use core::task::Waker;

/// List of parked wakers
///
/// Owners keep it behind their own spinlock and wake the taken wakers only
/// after the lock has been released.
#[derive(Default)]
pub(crate) struct WaitList {
    wakers: Vec<Waker>,
}

impl WaitList {
    pub(crate) const fn new() -> Self {
        Self { wakers: Vec::new() }
    }

    pub(crate) fn register(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|w| w.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }

    pub(crate) fn take(&mut self) -> Vec<Waker> {
        core::mem::take(&mut self.wakers)
    }
}

pub(crate) fn wake_all(wakers: Vec<Waker>) {
    for waker in wakers {
        waker.wake();
    }
}
