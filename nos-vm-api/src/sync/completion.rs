//! Single-value completion slot

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use spin::Mutex;

use super::{wake_all, WaitList};

struct CompletionState<T> {
    value: Option<T>,
    completed: bool,
    waiters: WaitList,
}

/// A slot that is filled once and consumed once
///
/// Used for request/response handshakes where the responder runs on another
/// task, e.g. a manager request or a page monitor.
pub struct Completion<T> {
    state: Mutex<CompletionState<T>>,
}

impl<T> Completion<T> {
    /// Creates an empty slot
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState { value: None, completed: false, waiters: WaitList::new() }),
        }
    }

    /// Fills the slot; returns `false` if it had already been completed
    pub fn complete(&self, value: T) -> bool {
        let wakers = {
            let mut state = self.state.lock();
            if state.completed {
                return false;
            }
            state.completed = true;
            state.value = Some(value);
            state.waiters.take()
        };
        wake_all(wakers);
        true
    }

    /// Checks whether the slot has been filled
    pub fn is_complete(&self) -> bool {
        self.state.lock().completed
    }

    /// Takes the value if it is available
    pub fn try_take(&self) -> Option<T> {
        self.state.lock().value.take()
    }

    /// Polls for the value, registering `cx`'s waker while it is missing
    pub fn poll_take(&self, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.lock();
        if let Some(value) = state.value.take() {
            return Poll::Ready(value);
        }
        state.waiters.register(cx.waker());
        Poll::Pending
    }

    /// Waits for the value
    pub fn wait(&self) -> CompletionWait<'_, T> {
        CompletionWait { completion: self }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Completion::wait`]
pub struct CompletionWait<'a, T> {
    completion: &'a Completion<T>,
}

impl<T> Future for CompletionWait<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.completion.poll_take(cx)
    }
}
