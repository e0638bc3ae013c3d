//! Indirect memory: rebindable slots that forward to other views
//!
//! Offsets are split into a slot number (`offset >> SLOT_SHIFT`) and an
//! offset inside the slot. Every operation is forwarded to whatever view
//! the slot is currently bound to. Evictions of the bound view are
//! translated into this view's offset space by a forwarder task, so
//! mappings of the indirect view learn about them too.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use nos_vm_api::sync::{CancellationEvent, Mutex};
use nos_vm_api::{
    is_page_aligned, BoxFuture, CachingMode, Error, PhysicalAddr, PhysicalRange, Result, WorkQueue, PAGE_SHIFT,
};
use static_assertions::const_assert;

use super::{AddressIdentity, EvictionQueue, FetchFlags, MemoryView};

/// Shift that separates the slot number from the in-slot offset
pub const SLOT_SHIFT: usize = 32;

const IN_SLOT_MASK: usize = (1 << SLOT_SHIFT) - 1;

const_assert!(SLOT_SHIFT >= PAGE_SHIFT);
const_assert!(usize::BITS as usize > SLOT_SHIFT);

#[derive(Clone)]
struct Binding {
    view: Arc<dyn MemoryView>,
    offset: usize,
    size: usize,
    cancel: Arc<CancellationEvent>,
}

/// Fixed array of slots bound to ranges of other views
pub struct IndirectMemory {
    slots: Mutex<Vec<Option<Binding>>>,
    evict_queue: Arc<EvictionQueue>,
    wq: Arc<WorkQueue>,
}

impl IndirectMemory {
    /// Creates `num_slots` unbound slots; forwarder tasks run on `wq`
    pub fn new(num_slots: usize, wq: Arc<WorkQueue>) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(num_slots, || None);
        Self { slots: Mutex::new(slots), evict_queue: Arc::new(EvictionQueue::new()), wq }
    }

    /// Number of slots
    pub fn num_slots(&self) -> usize {
        self.slots.lock().len()
    }

    /// Translates an offset into the bound view and the offset inside it
    fn translate(&self, offset: usize) -> Result<(Binding, usize)> {
        let slot = offset >> SLOT_SHIFT;
        let in_slot = offset & IN_SLOT_MASK;
        let slots = self.slots.lock();
        let Some(binding) = slots.get(slot).and_then(Option::as_ref) else {
            vm_warn!("vm: access to unbound indirect slot {}", slot);
            return Err(Error::Fault);
        };
        if in_slot >= binding.size {
            return Err(Error::Fault);
        }
        Ok((binding.clone(), binding.offset + in_slot))
    }
}

async fn forward_evictions(
    target: Arc<dyn MemoryView>,
    queue: Arc<EvictionQueue>,
    base: usize,
    offset: usize,
    size: usize,
    cancel: Arc<CancellationEvent>,
) {
    let Some(source) = target.eviction_queue() else {
        return;
    };
    let observer = source.add_observer();
    while let Some(eviction) = observer.next_eviction(&cancel).await {
        let start = core::cmp::max(eviction.offset(), offset);
        let end = core::cmp::min(eviction.offset() + eviction.size(), offset + size);
        if start < end {
            queue.evict_range(base + (start - offset), end - start).await;
        }
        eviction.done();
    }
    source.remove_observer(observer.id());
}

impl Drop for IndirectMemory {
    fn drop(&mut self) {
        for binding in self.slots.get_mut().iter().flatten() {
            binding.cancel.cancel();
        }
    }
}

impl MemoryView for IndirectMemory {
    fn length(&self) -> usize {
        self.num_slots() << SLOT_SHIFT
    }

    fn eviction_queue(&self) -> Option<&EvictionQueue> {
        Some(&self.evict_queue)
    }

    fn lock_range(&self, offset: usize, size: usize) -> Result<()> {
        let (binding, target) = self.translate(offset)?;
        if (offset & IN_SLOT_MASK) + size > binding.size {
            return Err(Error::Fault);
        }
        binding.view.lock_range(target, size)
    }

    fn async_lock_range(&self, offset: usize, size: usize) -> BoxFuture<'_, Result<()>> {
        let translated = self.translate(offset);
        Box::pin(async move {
            let (binding, target) = translated?;
            if (offset & IN_SLOT_MASK) + size > binding.size {
                return Err(Error::Fault);
            }
            binding.view.async_lock_range(target, size).await
        })
    }

    fn unlock_range(&self, offset: usize, size: usize) {
        if let Ok((binding, target)) = self.translate(offset) {
            binding.view.unlock_range(target, size);
        }
    }

    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        let (binding, target) = self.translate(offset).ok()?;
        binding.view.peek_range(target)
    }

    fn fetch_range(&self, offset: usize, flags: FetchFlags) -> BoxFuture<'_, Result<PhysicalRange>> {
        let translated = self.translate(offset);
        Box::pin(async move {
            let (binding, target) = translated?;
            let mut range = binding.view.fetch_range(target, flags).await?;
            range.size = core::cmp::min(range.size, binding.offset + binding.size - target);
            Ok(range)
        })
    }

    fn mark_dirty(&self, offset: usize, size: usize) {
        if let Ok((binding, target)) = self.translate(offset) {
            binding.view.mark_dirty(target, size);
        }
    }

    fn address_identity(&self, offset: usize) -> Result<AddressIdentity> {
        let (binding, target) = self.translate(offset)?;
        binding.view.address_identity(target)
    }

    fn set_indirection(&self, slot: usize, view: Arc<dyn MemoryView>, offset: usize, size: usize) -> Result<()> {
        if !is_page_aligned(offset) || !is_page_aligned(size) || size > IN_SLOT_MASK {
            return Err(Error::IllegalArgs);
        }
        if offset.checked_add(size).is_none_or(|end| end > view.length()) {
            return Err(Error::BufferTooSmall);
        }

        let binding = Binding { view: view.clone(), offset, size, cancel: Arc::new(CancellationEvent::new()) };
        let previous = {
            let mut slots = self.slots.lock();
            let entry = slots.get_mut(slot).ok_or(Error::OutOfBounds)?;
            entry.replace(binding.clone())
        };
        let base = slot << SLOT_SHIFT;
        vm_debug!("vm: indirect slot {} bound to {:#x}+{:#x}", slot, offset, size);

        if let Some(previous) = previous {
            previous.cancel.cancel();
            // Mappings must drop translations of the old binding.
            let queue = self.evict_queue.clone();
            self.wq.detach(async move { queue.evict_range(base, previous.size).await });
        }
        self.wq.detach(forward_evictions(view, self.evict_queue.clone(), base, offset, size, binding.cancel));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::allocated::AllocatedMemory;
    use crate::view::cow::CopyOnWriteMemory;
    use crate::view::hardware::HardwareMemory;
    use core::future::Future;
    use core::task::{Context, Poll, Waker};
    use nos_vm_api::testing::SimulatedPhysicalMemory;
    use nos_vm_api::PAGE_SIZE;

    #[test]
    fn test_unbound_and_invalid_slots() {
        let wq = WorkQueue::new();
        let indirect = IndirectMemory::new(2, wq.clone());
        let window: Arc<dyn MemoryView> = Arc::new(HardwareMemory::new(0x9000_0000, 4 * PAGE_SIZE, CachingMode::Uncached));

        assert_eq!(indirect.length(), 2 << SLOT_SHIFT);
        assert_eq!(indirect.peek_range(0), None);
        assert_eq!(indirect.lock_range(0, PAGE_SIZE), Err(Error::Fault));
        assert_eq!(indirect.set_indirection(2, window.clone(), 0, PAGE_SIZE), Err(Error::OutOfBounds));
        assert_eq!(indirect.set_indirection(0, window.clone(), 1, PAGE_SIZE), Err(Error::IllegalArgs));
        assert_eq!(indirect.set_indirection(0, window, PAGE_SIZE, 4 * PAGE_SIZE), Err(Error::BufferTooSmall));
    }

    #[test]
    fn test_operations_forward_to_binding() {
        let wq = WorkQueue::new();
        let indirect = Arc::new(IndirectMemory::new(2, wq.clone()));
        let window: Arc<dyn MemoryView> = Arc::new(HardwareMemory::new(0x9000_0000, 4 * PAGE_SIZE, CachingMode::Uncached));
        indirect.set_indirection(1, window.clone(), PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
        wq.run();

        let base = 1 << SLOT_SHIFT;
        assert_eq!(indirect.peek_range(base + PAGE_SIZE), Some((0x9000_0000 + 2 * PAGE_SIZE, CachingMode::Uncached)));
        assert_eq!(indirect.peek_range(base + 2 * PAGE_SIZE), None);
        assert_eq!(indirect.address_identity(base + 8), window.address_identity(PAGE_SIZE + 8));

        let fetch = {
            let indirect = indirect.clone();
            wq.spawn(async move { indirect.fetch_range(base, FetchFlags::empty()).await })
        };
        wq.run();
        let range = fetch.try_take().unwrap().unwrap();
        assert_eq!(range.physical, 0x9000_0000 + PAGE_SIZE);
        assert_eq!(range.size, 2 * PAGE_SIZE);
    }

    #[test]
    fn test_lock_pins_the_bound_view() {
        let wq = WorkQueue::new();
        let memory = Arc::new(SimulatedPhysicalMemory::new(16));
        let root = Arc::new(AllocatedMemory::new(memory.clone(), 2 * PAGE_SIZE));
        let target = Arc::new(CopyOnWriteMemory::new(root, 0, 2 * PAGE_SIZE, memory));
        let indirect = Arc::new(IndirectMemory::new(1, wq.clone()));
        indirect.set_indirection(0, target.clone(), 0, 2 * PAGE_SIZE).unwrap();

        let write = {
            let indirect = indirect.clone();
            wq.spawn(async move { indirect.fetch_range(0, FetchFlags::WRITE).await })
        };
        wq.run();
        assert!(write.try_take().unwrap().is_ok());
        assert_eq!(target.owned_pages(), 1);

        let fork = || {
            let target = target.clone();
            let handle = wq.spawn(async move { target.fork().await.map(|_| ()) });
            wq.run();
            handle.try_take()
        };

        // A pinned page stays private across a fork.
        indirect.lock_range(0, PAGE_SIZE).unwrap();
        assert_eq!(fork(), Some(Ok(())));
        assert_eq!(target.owned_pages(), 1);

        indirect.unlock_range(0, PAGE_SIZE);
        assert_eq!(fork(), Some(Ok(())));
        assert_eq!(target.owned_pages(), 0);
    }

    #[test]
    fn test_evictions_are_translated_and_rebinding_detaches() {
        let wq = WorkQueue::new();
        let memory = Arc::new(SimulatedPhysicalMemory::new(16));
        let root = Arc::new(AllocatedMemory::new(memory.clone(), 4 * PAGE_SIZE));
        let target = Arc::new(CopyOnWriteMemory::new(root, 0, 4 * PAGE_SIZE, memory));
        let indirect = Arc::new(IndirectMemory::new(2, wq.clone()));

        indirect.set_indirection(1, target.clone(), PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
        wq.run();
        assert_eq!(target.eviction_queue().unwrap().num_observers(), 1);

        let observer = indirect.eviction_queue().unwrap().add_observer();
        let cancel = CancellationEvent::new();
        let evict = {
            let target = target.clone();
            wq.spawn(async move { target.eviction_queue().unwrap().evict_range(0, 2 * PAGE_SIZE).await })
        };
        wq.run();
        assert!(!evict.is_finished());

        let mut cx = Context::from_waker(Waker::noop());
        {
            let mut next = core::pin::pin!(observer.next_eviction(&cancel));
            let Poll::Ready(Some(posted)) = next.as_mut().poll(&mut cx) else {
                panic!("eviction was not forwarded");
            };
            assert_eq!((posted.offset(), posted.size()), (1 << SLOT_SHIFT, PAGE_SIZE));
        }
        wq.run();
        assert!(evict.is_finished());

        indirect.set_indirection(1, target.clone(), 0, PAGE_SIZE).unwrap();
        wq.run();
        assert_eq!(target.eviction_queue().unwrap().num_observers(), 1);
        {
            // The old binding is evicted from the indirect view.
            let mut next = core::pin::pin!(observer.next_eviction(&cancel));
            let Poll::Ready(Some(posted)) = next.as_mut().poll(&mut cx) else {
                panic!("rebinding did not evict the slot");
            };
            assert_eq!((posted.offset(), posted.size()), (1 << SLOT_SHIFT, 2 * PAGE_SIZE));
        }
    }
}
