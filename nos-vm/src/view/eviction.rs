//! Eviction queue: broadcast of "unmap this range" from a view to its mappings
//!
//! [`EvictionQueue::evict_range`] posts a range to every attached observer
//! and completes once each of them has acknowledged it. Observers receive
//! posts through [`MemoryObserver::next_eviction`] and acknowledge by
//! dropping (or calling [`Eviction::done`] on) the returned handle, which
//! they only do after their translations for the range are gone.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::task::{Context, Poll, Waker};

use nos_vm_api::sync::{CancellationEvent, Mutex, OneshotEvent};

/// Identifier of an attached observer
pub type ObserverId = u64;

struct PendingEviction {
    offset: usize,
    size: usize,
    remaining: AtomicUsize,
    done: OneshotEvent,
}

impl PendingEviction {
    fn ack(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.raise();
        }
    }
}

struct ObserverState {
    posts: VecDeque<Arc<PendingEviction>>,
    waker: Option<Waker>,
    attached: bool,
}

struct ObserverSlot {
    id: ObserverId,
    state: Mutex<ObserverState>,
}

impl ObserverSlot {
    fn post(&self, pending: &Arc<PendingEviction>) -> Option<Waker> {
        let mut state = self.state.lock();
        state.posts.push_back(pending.clone());
        state.waker.take()
    }

    fn detach(&self) -> (Vec<Arc<PendingEviction>>, Option<Waker>) {
        let mut state = self.state.lock();
        state.attached = false;
        (state.posts.drain(..).collect(), state.waker.take())
    }
}

struct QueueInner {
    observers: Vec<Arc<ObserverSlot>>,
    next_id: ObserverId,
}

/// Post/acknowledge broadcast of evicted ranges
pub struct EvictionQueue {
    inner: Mutex<QueueInner>,
}

impl EvictionQueue {
    /// Creates a queue without observers
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner { observers: Vec::new(), next_id: 1 }),
        }
    }

    /// Attaches a new observer; it receives every range posted from now on
    pub fn add_observer(&self) -> MemoryObserver {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let slot = Arc::new(ObserverSlot {
            id,
            state: Mutex::new(ObserverState { posts: VecDeque::new(), waker: None, attached: true }),
        });
        inner.observers.push(slot.clone());
        MemoryObserver { slot }
    }

    /// Detaches an observer, acknowledging everything it has not handled yet
    pub fn remove_observer(&self, id: ObserverId) {
        let slot = {
            let mut inner = self.inner.lock();
            let Some(position) = inner.observers.iter().position(|slot| slot.id == id) else {
                return;
            };
            inner.observers.swap_remove(position)
        };
        let (orphans, waker) = slot.detach();
        for pending in orphans {
            pending.ack();
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Number of attached observers
    pub fn num_observers(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// Posts `[offset, offset + size)` and waits until every observer acknowledged it
    pub async fn evict_range(&self, offset: usize, size: usize) {
        let pending = {
            let inner = self.inner.lock();
            if inner.observers.is_empty() {
                return;
            }
            let pending = Arc::new(PendingEviction {
                offset,
                size,
                remaining: AtomicUsize::new(inner.observers.len()),
                done: OneshotEvent::new(),
            });
            let wakers: Vec<Waker> = inner.observers.iter().filter_map(|slot| slot.post(&pending)).collect();
            drop(inner);
            for waker in wakers {
                waker.wake();
            }
            pending
        };
        pending.done.wait().await;
    }
}

impl Default for EvictionQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription of one mapping to an [`EvictionQueue`]
pub struct MemoryObserver {
    slot: Arc<ObserverSlot>,
}

impl MemoryObserver {
    /// Identifier to pass to [`EvictionQueue::remove_observer`]
    pub fn id(&self) -> ObserverId {
        self.slot.id
    }

    /// Waits for the next posted range
    ///
    /// Resolves to `None` once `cancel` is raised or the observer was detached.
    pub fn next_eviction<'a>(&'a self, cancel: &'a CancellationEvent) -> NextEviction<'a> {
        NextEviction { observer: self, cancel }
    }
}

/// Future returned by [`MemoryObserver::next_eviction`]
pub struct NextEviction<'a> {
    observer: &'a MemoryObserver,
    cancel: &'a CancellationEvent,
}

impl Future for NextEviction<'_> {
    type Output = Option<Eviction>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Eviction>> {
        {
            let mut state = self.observer.slot.state.lock();
            if let Some(pending) = state.posts.pop_front() {
                return Poll::Ready(Some(Eviction { pending: Some(pending) }));
            }
            if !state.attached {
                return Poll::Ready(None);
            }
            state.waker = Some(cx.waker().clone());
        }
        match self.cancel.poll_cancelled(cx) {
            Poll::Ready(()) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A posted range; acknowledged when dropped
pub struct Eviction {
    pending: Option<Arc<PendingEviction>>,
}

impl Eviction {
    /// First byte of the evicted range
    pub fn offset(&self) -> usize {
        self.pending.as_ref().map_or(0, |p| p.offset)
    }

    /// Length of the evicted range
    pub fn size(&self) -> usize {
        self.pending.as_ref().map_or(0, |p| p.size)
    }

    /// Acknowledges the eviction
    pub fn done(mut self) {
        if let Some(pending) = self.pending.take() {
            pending.ack();
        }
    }
}

impl Drop for Eviction {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.ack();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nos_vm_api::WorkQueue;

    #[test]
    fn test_evict_without_observers_completes() {
        let wq = WorkQueue::new();
        let queue = Arc::new(EvictionQueue::new());
        let handle = {
            let queue = queue.clone();
            wq.spawn(async move { queue.evict_range(0, 4096).await })
        };
        wq.run();
        assert!(handle.is_finished());
    }

    #[test]
    fn test_evict_waits_for_every_ack() {
        let wq = WorkQueue::new();
        let queue = Arc::new(EvictionQueue::new());
        let first = queue.add_observer();
        let second = queue.add_observer();
        let cancel = CancellationEvent::new();

        let eviction = {
            let queue = queue.clone();
            wq.spawn(async move { queue.evict_range(0x2000, 0x1000).await })
        };
        wq.run();
        assert!(!eviction.is_finished());

        let mut cx = Context::from_waker(Waker::noop());
        let mut poll = core::pin::pin!(first.next_eviction(&cancel));
        let Poll::Ready(Some(posted)) = poll.as_mut().poll(&mut cx) else {
            panic!("eviction was not delivered");
        };
        assert_eq!((posted.offset(), posted.size()), (0x2000, 0x1000));
        posted.done();
        wq.run();
        assert!(!eviction.is_finished());

        // Detaching the second observer acknowledges on its behalf.
        queue.remove_observer(second.id());
        wq.run();
        assert!(eviction.is_finished());
        assert_eq!(queue.num_observers(), 1);
    }

    #[test]
    fn test_cancellation_ends_polling() {
        let queue = EvictionQueue::new();
        let observer = queue.add_observer();
        let cancel = CancellationEvent::new();
        let mut cx = Context::from_waker(Waker::noop());

        let mut poll = core::pin::pin!(observer.next_eviction(&cancel));
        assert!(poll.as_mut().poll(&mut cx).is_pending());
        cancel.cancel();
        assert!(matches!(poll.as_mut().poll(&mut cx), Poll::Ready(None)));
    }
}
