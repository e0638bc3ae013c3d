//! Copy-on-write memory
//!
//! A [`CopyOnWriteMemory`] is a private copy of a range of another view.
//! Pages are copied lazily: a write fault allocates a fresh frame and fills
//! it from the nearest [`CowChain`] generation that holds the page, or from
//! the root view if none does. Read faults on a page that a chain still
//! holds map the chain's frame read-only.
//!
//! Forking hands every unlocked private page to a new chain generation that
//! both siblings share, so neither of them owns those pages afterwards.
//! Locked pages cannot change owner while they are pinned; they stay with
//! the forking view and the sibling gets an eager copy.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use nos_vm_api::sync::{Mutex, RecurringEvent};
use nos_vm_api::{
    is_page_aligned, BoxFuture, CachingMode, Error, PhysicalAddr, PhysicalMemory, PhysicalRange, Result,
    PAGE_SHIFT, PAGE_SIZE,
};

use super::{allocate_frames, object_identity, AddressIdentity, EvictionQueue, FetchFlags, MemoryView};

/// One generation of pages shared by the views descended from a fork
///
/// Pages enter a chain when a fork happens and are never modified
/// afterwards; they are freed when the chain is dropped.
pub struct CowChain {
    super_chain: Option<Arc<CowChain>>,
    pages: Mutex<BTreeMap<usize, PhysicalAddr>>,
    physical: Arc<dyn PhysicalMemory>,
}

impl CowChain {
    fn new(super_chain: Option<Arc<CowChain>>, physical: Arc<dyn PhysicalMemory>) -> Self {
        Self { super_chain, pages: Mutex::new(BTreeMap::new()), physical }
    }

    /// Looks a page up in this generation and its ancestors
    pub fn find(&self, identity: usize) -> Option<PhysicalAddr> {
        let mut chain = Some(self);
        while let Some(current) = chain {
            if let Some(&physical) = current.pages.lock().get(&identity) {
                return Some(physical);
            }
            chain = current.super_chain.as_deref();
        }
        None
    }

    /// Number of pages held by this generation alone
    pub fn num_pages(&self) -> usize {
        self.pages.lock().len()
    }
}

impl Drop for CowChain {
    fn drop(&mut self) {
        for (_, physical) in core::mem::take(self.pages.get_mut()) {
            self.physical.free(physical, PAGE_SIZE);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CowState {
    InProgress,
    HasCopy,
}

struct CowPage {
    physical: PhysicalAddr,
    state: CowState,
}

struct CowInner {
    chain: Option<Arc<CowChain>>,
    pages: BTreeMap<usize, CowPage>,
    locks: BTreeMap<usize, usize>,
}

enum Step {
    Done(PhysicalAddr, bool),
    Wait(u64),
    Copy(PhysicalAddr, Option<PhysicalAddr>),
}

/// Private, forkable copy of a range of another view
pub struct CopyOnWriteMemory {
    view: Arc<dyn MemoryView>,
    view_offset: usize,
    length: usize,
    inner: Mutex<CowInner>,
    copy_event: RecurringEvent,
    evict_queue: EvictionQueue,
    physical: Arc<dyn PhysicalMemory>,
}

impl CopyOnWriteMemory {
    /// Creates a copy of `[view_offset, view_offset + length)` of `view`
    pub fn new(view: Arc<dyn MemoryView>, view_offset: usize, length: usize, physical: Arc<dyn PhysicalMemory>) -> Self {
        debug_assert!(is_page_aligned(view_offset) && is_page_aligned(length));
        vm_debug!("vm: copy-on-write view of {:#x}+{:#x}", view_offset, length);
        Self::with_chain(view, view_offset, length, physical, None, BTreeMap::new())
    }

    fn with_chain(
        view: Arc<dyn MemoryView>,
        view_offset: usize,
        length: usize,
        physical: Arc<dyn PhysicalMemory>,
        chain: Option<Arc<CowChain>>,
        pages: BTreeMap<usize, CowPage>,
    ) -> Self {
        Self {
            view,
            view_offset,
            length,
            inner: Mutex::new(CowInner { chain, pages, locks: BTreeMap::new() }),
            copy_event: RecurringEvent::new(),
            evict_queue: EvictionQueue::new(),
            physical,
        }
    }

    /// Number of pages this view owns privately
    pub fn owned_pages(&self) -> usize {
        self.inner.lock().pages.values().filter(|page| page.state == CowState::HasCopy).count()
    }

    /// Current chain generation, if the view was ever forked
    pub fn chain(&self) -> Option<Arc<CowChain>> {
        self.inner.lock().chain.clone()
    }

    fn identity(&self, index: usize) -> usize {
        (self.view_offset >> PAGE_SHIFT) + index
    }

    /// Resolves a page, copying it privately unless a read can share it
    ///
    /// Returns the frame and whether it may be mapped writable.
    async fn resolve(&self, index: usize, write: bool, flags: FetchFlags) -> Result<(PhysicalAddr, bool)> {
        loop {
            let step = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                match inner.pages.get(&index) {
                    Some(page) if page.state == CowState::HasCopy => Step::Done(page.physical, true),
                    Some(_) => Step::Wait(self.copy_event.sequence()),
                    None => {
                        let source = inner.chain.as_ref().and_then(|chain| chain.find(self.identity(index)));
                        match source {
                            Some(shared) if !write => Step::Done(shared, false),
                            _ => {
                                let copy = allocate_frames(self.physical.as_ref(), PAGE_SIZE, PAGE_SIZE);
                                inner.pages.insert(index, CowPage { physical: copy, state: CowState::InProgress });
                                Step::Copy(copy, source)
                            }
                        }
                    }
                }
            };

            let (copy, source) = match step {
                Step::Done(physical, writable) => return Ok((physical, writable)),
                Step::Wait(sequence) => {
                    self.copy_event.wait_past(sequence).await;
                    continue;
                }
                Step::Copy(copy, source) => (copy, source),
            };

            let filled = match source {
                Some(shared) => {
                    self.physical.copy_page(copy, shared);
                    Ok(())
                }
                None => self.copy_from_root(index, copy, flags).await,
            };
            if let Err(error) = filled {
                self.inner.lock().pages.remove(&index);
                self.physical.free(copy, PAGE_SIZE);
                self.copy_event.raise();
                return Err(error);
            }

            // Drop read-only translations of the shared frame.
            self.evict_queue.evict_range(index << PAGE_SHIFT, PAGE_SIZE).await;

            if let Some(page) = self.inner.lock().pages.get_mut(&index) {
                page.state = CowState::HasCopy;
            }
            self.copy_event.raise();
            return Ok((copy, true));
        }
    }

    async fn copy_from_root(&self, index: usize, copy: PhysicalAddr, flags: FetchFlags) -> Result<()> {
        let offset = self.view_offset + (index << PAGE_SHIFT);
        self.view.async_lock_range(offset, PAGE_SIZE).await?;
        let fetched = self.view.fetch_range(offset, flags & FetchFlags::DISALLOW_BACKING).await;
        if let Ok(range) = &fetched {
            self.physical.copy_page(copy, range.physical);
        }
        self.view.unlock_range(offset, PAGE_SIZE);
        fetched.map(|_| ())
    }

    async fn lock_pages(&self, offset: usize, size: usize) -> Result<()> {
        if offset.saturating_add(size) > self.length {
            return Err(Error::BufferTooSmall);
        }
        let first = offset >> PAGE_SHIFT;
        let end = (offset + size).div_ceil(PAGE_SIZE);
        for index in first..end {
            if let Err(error) = self.resolve(index, false, FetchFlags::empty()).await {
                self.unlock_pages(first << PAGE_SHIFT, (index - first) << PAGE_SHIFT);
                return Err(error);
            }
            *self.inner.lock().locks.entry(index).or_insert(0) += 1;
        }
        Ok(())
    }

    fn unlock_pages(&self, offset: usize, size: usize) {
        let mut inner = self.inner.lock();
        for index in offset >> PAGE_SHIFT..(offset + size).div_ceil(PAGE_SIZE) {
            let Some(count) = inner.locks.get_mut(&index) else {
                debug_assert!(false, "unlocking page {} that was never locked", index);
                continue;
            };
            *count -= 1;
            if *count == 0 {
                inner.locks.remove(&index);
            }
        }
    }

    async fn fork_view(&self) -> Result<Arc<dyn MemoryView>> {
        let forked = loop {
            let sequence = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if inner.pages.values().any(|page| page.state == CowState::InProgress) {
                    self.copy_event.sequence()
                } else {
                    let chain = Arc::new(CowChain::new(inner.chain.clone(), self.physical.clone()));
                    let mut sibling_pages = BTreeMap::new();
                    {
                        let mut shared = chain.pages.lock();
                        for (index, page) in core::mem::take(&mut inner.pages) {
                            if inner.locks.contains_key(&index) {
                                let copy = allocate_frames(self.physical.as_ref(), PAGE_SIZE, PAGE_SIZE);
                                self.physical.copy_page(copy, page.physical);
                                sibling_pages.insert(index, CowPage { physical: copy, state: CowState::HasCopy });
                                inner.pages.insert(index, page);
                            } else {
                                shared.insert(self.identity(index), page.physical);
                            }
                        }
                    }
                    vm_debug!(
                        "vm: fork moved {} pages into a new chain, copied {} locked pages",
                        chain.num_pages(),
                        sibling_pages.len()
                    );
                    inner.chain = Some(chain.clone());
                    break Self::with_chain(
                        self.view.clone(),
                        self.view_offset,
                        self.length,
                        self.physical.clone(),
                        Some(chain),
                        sibling_pages,
                    );
                }
            };
            self.copy_event.wait_past(sequence).await;
        };

        // Our writable translations now point at chain pages.
        self.evict_queue.evict_range(0, self.length).await;
        Ok(Arc::new(forked))
    }
}

impl Drop for CopyOnWriteMemory {
    fn drop(&mut self) {
        for (_, page) in core::mem::take(&mut self.inner.get_mut().pages) {
            self.physical.free(page.physical, PAGE_SIZE);
        }
    }
}

impl MemoryView for CopyOnWriteMemory {
    fn length(&self) -> usize {
        self.length
    }

    fn eviction_queue(&self) -> Option<&EvictionQueue> {
        Some(&self.evict_queue)
    }

    /// Succeeds only if every page is already private or held by a chain
    fn lock_range(&self, offset: usize, size: usize) -> Result<()> {
        if offset.saturating_add(size) > self.length {
            return Err(Error::BufferTooSmall);
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let range = offset >> PAGE_SHIFT..(offset + size).div_ceil(PAGE_SIZE);
        let stable = range.clone().all(|index| match inner.pages.get(&index) {
            Some(page) => page.state == CowState::HasCopy,
            None => inner.chain.as_ref().is_some_and(|chain| chain.find(self.identity(index)).is_some()),
        });
        if !stable {
            return Err(Error::IllegalObject);
        }
        for index in range {
            *inner.locks.entry(index).or_insert(0) += 1;
        }
        Ok(())
    }

    fn async_lock_range(&self, offset: usize, size: usize) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.lock_pages(offset, size))
    }

    fn unlock_range(&self, offset: usize, size: usize) {
        self.unlock_pages(offset, size);
    }

    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        let inner = self.inner.lock();
        let page = inner.pages.get(&(offset >> PAGE_SHIFT))?;
        (page.state == CowState::HasCopy).then(|| (page.physical + (offset & (PAGE_SIZE - 1)), CachingMode::Null))
    }

    fn fetch_range(&self, offset: usize, flags: FetchFlags) -> BoxFuture<'_, Result<PhysicalRange>> {
        Box::pin(async move {
            if offset >= self.length {
                return Err(Error::Fault);
            }
            let misalign = offset & (PAGE_SIZE - 1);
            let (physical, writable) =
                self.resolve(offset >> PAGE_SHIFT, flags.contains(FetchFlags::WRITE), flags).await?;
            let size = PAGE_SIZE - misalign;
            Ok(if writable {
                PhysicalRange::new(physical + misalign, size, CachingMode::Null)
            } else {
                PhysicalRange::read_only(physical + misalign, size, CachingMode::Null)
            })
        })
    }

    fn mark_dirty(&self, _offset: usize, _size: usize) {}

    fn fork(&self) -> BoxFuture<'_, Result<Arc<dyn MemoryView>>> {
        Box::pin(self.fork_view())
    }

    fn address_identity(&self, offset: usize) -> Result<AddressIdentity> {
        if offset >= self.length {
            return Err(Error::Fault);
        }
        Ok(AddressIdentity { object: object_identity(self), offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::allocated::AllocatedMemory;
    use core::task::{Context, Poll, Waker};
    use nos_vm_api::sync::CancellationEvent;
    use nos_vm_api::testing::SimulatedPhysicalMemory;
    use nos_vm_api::{PageAccessor, PhysicalAllocator, WorkQueue};

    fn block_on<T: Send + 'static>(wq: &Arc<WorkQueue>, future: impl core::future::Future<Output = T> + Send + 'static) -> T {
        let handle = wq.spawn(future);
        wq.run();
        handle.try_take().expect("future did not complete")
    }

    fn setup(pages: usize) -> (Arc<WorkQueue>, Arc<SimulatedPhysicalMemory>, Arc<AllocatedMemory>, Arc<CopyOnWriteMemory>) {
        let memory = Arc::new(SimulatedPhysicalMemory::new(64));
        let root = Arc::new(AllocatedMemory::new(memory.clone(), pages * PAGE_SIZE));
        for index in 0..pages {
            root.copy_kernel_to_this(index * PAGE_SIZE, &[index as u8 + 1]).unwrap();
        }
        let cow = Arc::new(CopyOnWriteMemory::new(root.clone(), 0, pages * PAGE_SIZE, memory.clone()));
        (WorkQueue::new(), memory, root, cow)
    }

    fn fetch(wq: &Arc<WorkQueue>, view: &Arc<dyn MemoryView>, offset: usize, flags: FetchFlags) -> PhysicalRange {
        let view = view.clone();
        block_on(wq, async move { view.fetch_range(offset, flags).await }).unwrap()
    }

    #[test]
    fn test_write_fault_copies_from_root() {
        let (wq, memory, root, cow) = setup(2);
        let view: Arc<dyn MemoryView> = cow.clone();
        let range = fetch(&wq, &view, PAGE_SIZE, FetchFlags::WRITE);
        assert!(range.writable);
        assert_ne!(Some(range.physical), root.peek_range(PAGE_SIZE).map(|(p, _)| p));
        assert_eq!(memory.page_bytes(range.physical)[0], 2);
        assert_eq!(cow.owned_pages(), 1);
        assert_eq!(cow.peek_range(PAGE_SIZE).map(|(p, _)| p), Some(range.physical));
    }

    #[test]
    fn test_fork_eagerly_copies_locked_pages() {
        let (wq, memory, _root, cow) = setup(2);
        let parent: Arc<dyn MemoryView> = cow.clone();
        let page0 = fetch(&wq, &parent, 0, FetchFlags::WRITE).physical;
        let page1 = fetch(&wq, &parent, PAGE_SIZE, FetchFlags::WRITE).physical;
        parent.lock_range(0, PAGE_SIZE).unwrap();

        let child = {
            let parent = parent.clone();
            block_on(&wq, async move { parent.fork().await }).unwrap()
        };

        // The locked page stays with the parent, the child owns a copy.
        assert_eq!(parent.peek_range(0).map(|(p, _)| p), Some(page0));
        let child0 = child.peek_range(0).map(|(p, _)| p).unwrap();
        assert_ne!(child0, page0);
        assert_eq!(memory.page_bytes(child0)[0], 1);

        // The unlocked page moved into the chain and is shared read-only.
        assert_eq!(parent.peek_range(PAGE_SIZE), None);
        assert_eq!(child.peek_range(PAGE_SIZE), None);
        let shared_parent = fetch(&wq, &parent, PAGE_SIZE, FetchFlags::empty());
        let shared_child = fetch(&wq, &child, PAGE_SIZE, FetchFlags::empty());
        assert_eq!(shared_parent.physical, page1);
        assert_eq!(shared_child.physical, page1);
        assert!(!shared_child.writable);
        assert_eq!(cow.chain().unwrap().num_pages(), 1);

        // The first write gives the child a private frame.
        let private = fetch(&wq, &child, PAGE_SIZE, FetchFlags::WRITE);
        assert_ne!(private.physical, page1);
        assert!(private.writable);
        parent.unlock_range(0, PAGE_SIZE);
    }

    #[test]
    fn test_writes_after_fork_are_private() {
        let (wq, memory, _root, cow) = setup(1);
        let parent: Arc<dyn MemoryView> = cow.clone();
        let child = {
            let parent = parent.clone();
            block_on(&wq, async move { parent.fork().await }).unwrap()
        };

        let theirs = fetch(&wq, &child, 0, FetchFlags::WRITE);
        memory.write(theirs.physical, &[0xee]);
        let ours = fetch(&wq, &parent, 0, FetchFlags::empty());
        assert_eq!(memory.page_bytes(ours.physical)[0], 1);
        assert_eq!(memory.page_bytes(theirs.physical)[0], 0xee);
    }

    #[test]
    fn test_sync_lock_requires_stable_pages() {
        let (wq, _memory, _root, cow) = setup(2);
        let view: Arc<dyn MemoryView> = cow.clone();
        assert_eq!(view.lock_range(0, PAGE_SIZE), Err(Error::IllegalObject));
        {
            let view = view.clone();
            block_on(&wq, async move { view.async_lock_range(0, 2 * PAGE_SIZE).await }).unwrap();
        }
        assert_eq!(cow.owned_pages(), 2);
        assert!(view.lock_range(0, 2 * PAGE_SIZE).is_ok());
        view.unlock_range(0, 2 * PAGE_SIZE);
        view.unlock_range(0, 2 * PAGE_SIZE);
        assert_eq!(view.lock_range(0, 3 * PAGE_SIZE), Err(Error::BufferTooSmall));
    }

    #[test]
    fn test_second_faulter_waits_for_copy_in_flight() {
        let (wq, memory, _root, cow) = setup(1);
        let view: Arc<dyn MemoryView> = cow.clone();
        // An unacknowledged observer keeps the first copy in progress.
        let observer = cow.eviction_queue().unwrap().add_observer();

        let spawn_fetch = |flags| {
            let view = view.clone();
            wq.spawn(async move { view.fetch_range(0, flags).await })
        };
        let first = spawn_fetch(FetchFlags::WRITE);
        wq.run();
        assert!(!first.is_finished());
        assert_eq!(cow.peek_range(0), None);

        let second = spawn_fetch(FetchFlags::empty());
        wq.run();
        assert!(!second.is_finished());

        let cancel = CancellationEvent::new();
        let mut cx = Context::from_waker(Waker::noop());
        let mut next = core::pin::pin!(observer.next_eviction(&cancel));
        let Poll::Ready(Some(eviction)) = next.as_mut().poll(&mut cx) else {
            panic!("copy did not evict the shared page");
        };
        assert_eq!((eviction.offset(), eviction.size()), (0, PAGE_SIZE));
        eviction.done();
        wq.run();

        let first = first.try_take().unwrap().unwrap();
        let second = second.try_take().unwrap().unwrap();
        assert_eq!(first.physical, second.physical);
        assert!(second.writable);
        assert_eq!(memory.page_bytes(second.physical)[0], 1);
        assert_eq!(cow.owned_pages(), 1);
    }

    #[test]
    fn test_fork_waits_for_copy_in_flight() {
        let (wq, memory, _root, cow) = setup(1);
        let parent: Arc<dyn MemoryView> = cow.clone();
        let queue = cow.eviction_queue().unwrap();
        let observer = queue.add_observer();

        let write = {
            let parent = parent.clone();
            wq.spawn(async move { parent.fetch_range(0, FetchFlags::WRITE).await })
        };
        wq.run();
        let fork = {
            let parent = parent.clone();
            wq.spawn(async move { parent.fork().await })
        };
        wq.run();
        assert!(!write.is_finished());
        assert!(!fork.is_finished());

        // Detaching acknowledges the pending eviction and lets the copy finish.
        queue.remove_observer(observer.id());
        wq.run();
        let copied = write.try_take().unwrap().unwrap().physical;
        let child = fork.try_take().unwrap().unwrap();

        // The finished copy moved into the shared chain.
        assert_eq!(cow.owned_pages(), 0);
        assert_eq!(cow.chain().unwrap().num_pages(), 1);
        let shared = fetch(&wq, &child, 0, FetchFlags::empty());
        assert_eq!(shared.physical, copied);
        assert!(!shared.writable);
        assert_eq!(memory.page_bytes(shared.physical)[0], 1);
    }

    #[test]
    fn test_frames_released() {
        let (wq, memory, root, cow) = setup(2);
        let parent: Arc<dyn MemoryView> = cow;
        fetch(&wq, &parent, 0, FetchFlags::WRITE);
        let child = {
            let parent = parent.clone();
            block_on(&wq, async move { parent.fork().await }).unwrap()
        };
        fetch(&wq, &child, 0, FetchFlags::WRITE);
        fetch(&wq, &parent, PAGE_SIZE, FetchFlags::WRITE);
        drop(parent);
        drop(child);
        drop(root);
        assert_eq!(memory.used_pages(), 0);
    }
}
