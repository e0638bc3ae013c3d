//! Asynchronous mutex
//!
//! Unlike a spinlock, the guard of an [`AsyncMutex`] may be held across a
//! suspension point. Contending lockers are parked and re-polled on unlock.

use core::cell::UnsafeCell;
use core::future::Future;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::pin::Pin;
use core::task::{Context, Poll};

use spin::Mutex;

use super::{wake_all, WaitList};

struct LockState {
    locked: bool,
    waiters: WaitList,
}

/// A mutex whose lock operation suspends instead of spinning
pub struct AsyncMutex<T: ?Sized> {
    state: Mutex<LockState>,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by the `locked` flag.
unsafe impl<T: ?Sized + Send> Send for AsyncMutex<T> {}
// SAFETY: see above; only one guard exists at a time.
unsafe impl<T: ?Sized + Send> Sync for AsyncMutex<T> {}

impl<T> AsyncMutex<T> {
    /// Creates an unlocked mutex
    pub const fn new(value: T) -> Self {
        Self {
            state: Mutex::new(LockState { locked: false, waiters: WaitList::new() }),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> AsyncMutex<T> {
    /// Acquires the mutex, suspending while it is held elsewhere
    pub fn lock(&self) -> AsyncMutexLock<'_, T> {
        AsyncMutexLock { mutex: self }
    }

    /// Acquires the mutex if it is free
    pub fn try_lock(&self) -> Option<AsyncMutexGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(AsyncMutexGuard { mutex: self, _marker: PhantomData })
    }

    /// Checks whether the mutex is currently held
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    fn unlock(&self) {
        let wakers = {
            let mut state = self.state.lock();
            state.locked = false;
            state.waiters.take()
        };
        wake_all(wakers);
    }
}

/// Future returned by [`AsyncMutex::lock`]
pub struct AsyncMutexLock<'a, T: ?Sized> {
    mutex: &'a AsyncMutex<T>,
}

impl<'a, T: ?Sized> Future for AsyncMutexLock<'a, T> {
    type Output = AsyncMutexGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mutex = self.mutex;
        let mut state = mutex.state.lock();
        if !state.locked {
            state.locked = true;
            return Poll::Ready(AsyncMutexGuard { mutex, _marker: PhantomData });
        }
        state.waiters.register(cx.waker());
        Poll::Pending
    }
}

/// Guard of an [`AsyncMutex`]; unlocks on drop
pub struct AsyncMutexGuard<'a, T: ?Sized> {
    mutex: &'a AsyncMutex<T>,
    _marker: PhantomData<&'a mut T>,
}

impl<T: ?Sized> Deref for AsyncMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> DerefMut for AsyncMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: ?Sized> Drop for AsyncMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::OneshotEvent;
    use crate::task::WorkQueue;
    use alloc::sync::Arc;

    #[test]
    fn test_mutex_serializes_across_suspension() {
        let wq = WorkQueue::new();
        let mutex = Arc::new(AsyncMutex::new(0u32));
        let gate = Arc::new(OneshotEvent::new());

        let first = {
            let (mutex, gate) = (mutex.clone(), gate.clone());
            wq.spawn(async move {
                let mut guard = mutex.lock().await;
                gate.wait().await;
                *guard += 1;
            })
        };
        let second = {
            let mutex = mutex.clone();
            wq.spawn(async move {
                let mut guard = mutex.lock().await;
                *guard *= 10;
                *guard
            })
        };

        wq.run();
        assert!(mutex.is_locked());
        assert!(!second.is_finished());

        gate.raise();
        wq.run();
        assert!(first.is_finished());
        assert_eq!(second.try_take(), Some(10));
        assert!(mutex.try_lock().is_some());
    }
}
