//! Event primitives: one-shot, recurring and cancellation events

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use spin::Mutex;

use super::{wake_all, WaitList};

struct EventState {
    raised: bool,
    waiters: WaitList,
}

/// An event that is raised exactly once and stays raised
pub struct OneshotEvent {
    state: Mutex<EventState>,
}

impl OneshotEvent {
    /// Creates an event that has not been raised
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(EventState { raised: false, waiters: WaitList::new() }),
        }
    }

    /// Raises the event and wakes every waiter; later raises are no-ops
    pub fn raise(&self) {
        let wakers = {
            let mut state = self.state.lock();
            if state.raised {
                return;
            }
            state.raised = true;
            state.waiters.take()
        };
        wake_all(wakers);
    }

    /// Checks whether the event was raised
    pub fn is_raised(&self) -> bool {
        self.state.lock().raised
    }

    /// Polls the event, registering `cx`'s waker if it is not raised yet
    pub fn poll_raised(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.lock();
        if state.raised {
            return Poll::Ready(());
        }
        state.waiters.register(cx.waker());
        Poll::Pending
    }

    /// Waits until the event is raised
    pub fn wait(&self) -> EventWait<'_> {
        EventWait { event: self }
    }
}

impl Default for OneshotEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`OneshotEvent::wait`]
pub struct EventWait<'a> {
    event: &'a OneshotEvent,
}

impl Future for EventWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.event.poll_raised(cx)
    }
}

struct RecurringState {
    sequence: u64,
    waiters: WaitList,
}

/// An event that can be raised any number of times
///
/// Waiters capture the current sequence number (normally while holding the
/// lock that protects the state they are waiting on) and complete once the
/// sequence has moved past it. This makes wake-ups impossible to lose.
pub struct RecurringEvent {
    state: Mutex<RecurringState>,
}

impl RecurringEvent {
    /// Creates an event with sequence number zero
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RecurringState { sequence: 0, waiters: WaitList::new() }),
        }
    }

    /// Current sequence number
    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    /// Raises the event, waking everybody that waits on an older sequence
    pub fn raise(&self) {
        let wakers = {
            let mut state = self.state.lock();
            state.sequence += 1;
            state.waiters.take()
        };
        wake_all(wakers);
    }

    /// Waits until the event is raised after `sequence` was observed
    pub fn wait_past(&self, sequence: u64) -> RecurringWait<'_> {
        RecurringWait { event: self, sequence }
    }

    /// Waits for the next raise
    pub fn wait(&self) -> RecurringWait<'_> {
        let sequence = self.sequence();
        self.wait_past(sequence)
    }
}

impl Default for RecurringEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`RecurringEvent::wait_past`]
pub struct RecurringWait<'a> {
    event: &'a RecurringEvent,
    sequence: u64,
}

impl Future for RecurringWait<'_> {
    type Output = u64;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u64> {
        let mut state = self.event.state.lock();
        if state.sequence > self.sequence {
            return Poll::Ready(state.sequence);
        }
        state.waiters.register(cx.waker());
        Poll::Pending
    }
}

/// Cancellation token for long-running loops
pub struct CancellationEvent {
    event: OneshotEvent,
}

impl CancellationEvent {
    /// Creates a token that is not cancelled
    pub const fn new() -> Self {
        Self { event: OneshotEvent::new() }
    }

    /// Requests cancellation
    pub fn cancel(&self) {
        self.event.raise();
    }

    /// Checks whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.event.is_raised()
    }

    /// Polls for cancellation, registering `cx`'s waker otherwise
    pub fn poll_cancelled(&self, cx: &mut Context<'_>) -> Poll<()> {
        self.event.poll_raised(cx)
    }

    /// Waits until cancellation is requested
    pub fn cancelled(&self) -> EventWait<'_> {
        self.event.wait()
    }
}

impl Default for CancellationEvent {
    fn default() -> Self {
        Self::new()
    }
}
