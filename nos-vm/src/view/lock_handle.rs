//! RAII pin of a view range

use alloc::sync::Arc;

use nos_vm_api::Result;

use super::MemoryView;

/// Keeps `[offset, offset + size)` of a view locked until dropped
pub struct MemoryViewLockHandle {
    view: Arc<dyn MemoryView>,
    offset: usize,
    size: usize,
}

impl MemoryViewLockHandle {
    /// Locks the range, waiting for the view if necessary
    pub async fn acquire(view: Arc<dyn MemoryView>, offset: usize, size: usize) -> Result<Self> {
        view.async_lock_range(offset, size).await?;
        Ok(Self { view, offset, size })
    }

    pub fn view(&self) -> &Arc<dyn MemoryView> {
        &self.view
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MemoryViewLockHandle {
    fn drop(&mut self) {
        self.view.unlock_range(self.offset, self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ManagedConfig, ReclaimConfig};
    use crate::reclaim::MemoryReclaimer;
    use crate::view::managed::ManagedSpace;
    use crate::view::ManageRequest;
    use nos_vm_api::testing::SimulatedPhysicalMemory;
    use nos_vm_api::{Error, WorkQueue, PAGE_SIZE};

    #[test]
    fn test_handle_pins_until_dropped() {
        let wq = WorkQueue::new();
        let memory = Arc::new(SimulatedPhysicalMemory::new(16));
        let reclaimer = MemoryReclaimer::new(memory.clone(), ReclaimConfig { cache_floor: 0, ..ReclaimConfig::new() });
        let (backing, frontal) = ManagedSpace::create(2 * PAGE_SIZE, memory, reclaimer.clone(), ManagedConfig::new());
        backing.update_range(ManageRequest::Initialize, 0, 2 * PAGE_SIZE).unwrap();
        assert_eq!(reclaimer.stats().cached_pages, 2);

        let acquire = {
            let view: Arc<dyn MemoryView> = frontal.clone();
            wq.spawn(MemoryViewLockHandle::acquire(view, 0, PAGE_SIZE))
        };
        wq.run();
        let handle = acquire.try_take().unwrap().unwrap();
        assert_eq!((handle.offset(), handle.size()), (0, PAGE_SIZE));
        assert_eq!(reclaimer.stats().cached_pages, 1);

        drop(handle);
        assert_eq!(reclaimer.stats().cached_pages, 2);

        let failed = {
            let view: Arc<dyn MemoryView> = frontal.clone();
            wq.spawn(async move { MemoryViewLockHandle::acquire(view, 0, 4 * PAGE_SIZE).await.err() })
        };
        wq.run();
        assert_eq!(failed.try_take(), Some(Some(Error::BufferTooSmall)));
    }
}
