//! Cooperative work queue
//!
//! Every asynchronous operation of the virtual memory subsystem is a plain
//! future. The kernel drives those futures on work queues: each CPU owns a
//! queue and calls [`WorkQueue::run`] from its idle loop or after an
//! interrupt. A woken task is pushed back onto the queue it was spawned on.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::task::Wake;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll, Waker};

use spin::Mutex;

use crate::sync::Completion;

/// A boxed, sendable future
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

struct Task {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    queue: Weak<WorkQueue>,
    queued: AtomicBool,
}

impl Task {
    fn schedule(self: &Arc<Self>) {
        if self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.ready.lock().push_back(self.clone());
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

/// A queue of runnable tasks
pub struct WorkQueue {
    ready: Mutex<VecDeque<Arc<Task>>>,
}

impl WorkQueue {
    /// Creates an empty queue
    pub fn new() -> Arc<Self> {
        Arc::new(Self { ready: Mutex::new(VecDeque::new()) })
    }

    /// Spawns a future and returns a handle to its output
    pub fn spawn<F>(self: &Arc<Self>, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let completion = Arc::new(Completion::new());
        let slot = completion.clone();
        self.detach(async move {
            let output = future.await;
            slot.complete(output);
        });
        JoinHandle { completion }
    }

    /// Spawns a future whose output nobody waits for
    pub fn detach<F>(self: &Arc<Self>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(Task {
            future: Mutex::new(Some(Box::pin(future))),
            queue: Arc::downgrade(self),
            queued: AtomicBool::new(false),
        });
        task.schedule();
    }

    /// Polls one runnable task; returns `false` if none was runnable
    pub fn run_one(&self) -> bool {
        let Some(task) = self.ready.lock().pop_front() else {
            return false;
        };
        task.queued.store(false, Ordering::Release);

        let waker = Waker::from(task.clone());
        let mut cx = Context::from_waker(&waker);
        let mut slot = task.future.lock();
        if let Some(future) = slot.as_mut() {
            if future.as_mut().poll(&mut cx).is_ready() {
                *slot = None;
            }
        }
        true
    }

    /// Polls tasks until none is runnable; returns the number of polls
    pub fn run(&self) -> usize {
        let mut polls = 0;
        while self.run_one() {
            polls += 1;
        }
        polls
    }

    /// Checks whether no task is runnable
    pub fn is_idle(&self) -> bool {
        self.ready.lock().is_empty()
    }
}

/// Handle to the output of a spawned task
pub struct JoinHandle<T> {
    completion: Arc<Completion<T>>,
}

impl<T> JoinHandle<T> {
    /// Checks whether the task has produced its output
    pub fn is_finished(&self) -> bool {
        self.completion.is_complete()
    }

    /// Takes the output if the task has finished
    pub fn try_take(&self) -> Option<T> {
        self.completion.try_take()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.completion.poll_take(cx)
    }
}
