//! Mappings: the binding of a virtual range to a range of a memory view
//!
//! A mapping goes through four states:
//!
//! ```text
//! Null --install--> Active --uninstall--> Zombie --retire--> Retired
//! ```
//!
//! While it is `Active` it serves faults ([`Mapping::touch_virtual_page`])
//! and reacts to evictions of its view: a per-mapping task waits on the
//! view's [`EvictionQueue`](crate::view::EvictionQueue), unmaps every
//! affected page, shoots down the TLB and only then acknowledges. Faults
//! and eviction handling serialize on the eviction mutex; page-table
//! writes of a single mapping serialize on its paging lock.

use alloc::sync::Arc;

use bitflags::bitflags;
use nos_vm_api::sync::{AsyncMutex, AtomicU64, AtomicUsize, CancellationEvent, Mutex, OneshotEvent, Ordering};
use nos_vm_api::{
    page_round_down, page_round_up, Error, PageAccess, PageStatus, PageTableOps, Result, VirtualAddr, WorkQueue,
    PAGE_SIZE,
};

use crate::view::{FetchFlags, MemoryObserver, MemorySlice, MemoryView, ObserverId};

bitflags! {
    /// Permissions and options of a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MappingFlags: u32 {
        /// Pages may be read
        const PROT_READ = 1 << 0;
        /// Pages may be written
        const PROT_WRITE = 1 << 1;
        /// Pages may be executed
        const PROT_EXECUTE = 1 << 2;
        /// Faults must not ask a manager for missing pages
        const DONT_REQUIRE_BACKING = 1 << 3;
    }
}

impl MappingFlags {
    const PROT_MASK: Self = Self::PROT_READ.union(Self::PROT_WRITE).union(Self::PROT_EXECUTE);

    /// Smallest permission set the hardware can express that contains `self`
    ///
    /// Write and execute imply read: `W` becomes `RW`, `X` becomes `RX` and
    /// `WX` becomes `RWX`.
    pub fn upgraded(self) -> Self {
        if self.intersects(Self::PROT_WRITE | Self::PROT_EXECUTE) {
            self | Self::PROT_READ
        } else {
            self
        }
    }

    /// Checks whether any access is allowed
    pub fn is_accessible(self) -> bool {
        self.intersects(Self::PROT_MASK)
    }

    /// Hardware permissions of a page; `writable` is what the view allows
    pub fn page_access(self, writable: bool) -> PageAccess {
        let mut access = PageAccess::empty();
        if writable && self.contains(Self::PROT_WRITE) {
            access |= PageAccess::WRITE;
        }
        if self.contains(Self::PROT_EXECUTE) {
            access |= PageAccess::EXECUTE;
        }
        access
    }
}

/// Lifecycle state of a [`Mapping`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    /// Constructed, not yet installed
    Null,
    /// Serving faults
    Active,
    /// Torn down; evictions are still being drained
    Zombie,
    /// Detached from its view
    Retired,
}

/// A virtual range bound to a range of a memory view
pub struct Mapping {
    address: VirtualAddr,
    length: usize,
    flags: Mutex<MappingFlags>,
    state: Mutex<MappingState>,
    slice: MemorySlice,
    view_offset: usize,
    ops: Arc<dyn PageTableOps>,
    rss: Arc<AtomicUsize>,
    eviction_mutex: AsyncMutex<()>,
    paging_lock: Mutex<()>,
    cancel_eviction: CancellationEvent,
    eviction_done: OneshotEvent,
    evictions_seen: AtomicU64,
    observer: Mutex<Option<ObserverId>>,
}

impl Mapping {
    /// Creates a mapping of `length` bytes at `offset` into `slice`
    ///
    /// The caller validated alignment and bounds. `rss` is the resident
    /// counter of the owning space.
    pub fn new(
        address: VirtualAddr,
        length: usize,
        slice: MemorySlice,
        offset: usize,
        flags: MappingFlags,
        ops: Arc<dyn PageTableOps>,
        rss: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        debug_assert!(offset + length <= slice.length());
        let view_offset = slice.offset() + offset;
        Arc::new(Self {
            address,
            length,
            flags: Mutex::new(flags.upgraded()),
            state: Mutex::new(MappingState::Null),
            slice,
            view_offset,
            ops,
            rss,
            eviction_mutex: AsyncMutex::new(()),
            paging_lock: Mutex::new(()),
            cancel_eviction: CancellationEvent::new(),
            eviction_done: OneshotEvent::new(),
            evictions_seen: AtomicU64::new(0),
            observer: Mutex::new(None),
        })
    }

    /// First virtual address
    pub fn address(&self) -> VirtualAddr {
        self.address
    }

    /// Length in bytes
    pub fn length(&self) -> usize {
        self.length
    }

    /// End of the range (exclusive)
    pub fn end(&self) -> VirtualAddr {
        self.address + self.length
    }

    pub fn contains(&self, address: VirtualAddr) -> bool {
        address >= self.address && address < self.end()
    }

    pub fn flags(&self) -> MappingFlags {
        *self.flags.lock()
    }

    pub fn state(&self) -> MappingState {
        *self.state.lock()
    }

    /// The view this mapping points at
    pub fn view(&self) -> &Arc<dyn MemoryView> {
        self.slice.view()
    }

    /// Offset into the view that corresponds to [`address`](Self::address)
    pub fn view_offset(&self) -> usize {
        self.view_offset
    }

    /// Activates the mapping and installs every page the view has at hand
    pub async fn install(self: &Arc<Self>, wq: &Arc<WorkQueue>) {
        {
            let mut state = self.state.lock();
            debug_assert_eq!(*state, MappingState::Null);
            *state = MappingState::Active;
        }

        match self.view().eviction_queue() {
            Some(queue) => {
                let observer = queue.add_observer();
                *self.observer.lock() = Some(observer.id());
                wq.detach(self.clone().handle_evictions(observer));
            }
            None => self.eviction_done.raise(),
        }

        let flags = self.flags();
        if flags.contains(MappingFlags::DONT_REQUIRE_BACKING) || !flags.is_accessible() {
            return;
        }

        let _eviction = self.eviction_mutex.lock().await;
        let _paging = self.paging_lock.lock();
        let mut installed = 0;
        for progress in (0..self.length).step_by(PAGE_SIZE) {
            let offset = self.view_offset + progress;
            // Pinned so the page cannot be evicted between peek and map.
            if self.view().lock_range(offset, PAGE_SIZE).is_err() {
                continue;
            }
            if let Some((physical, caching)) = self.view().peek_range(offset) {
                self.ops
                    .map_single(self.address + progress, page_round_down(physical), flags.page_access(true), caching);
                installed += PAGE_SIZE;
            }
            self.view().unlock_range(offset, PAGE_SIZE);
        }
        self.rss.fetch_add(installed, Ordering::Relaxed);
    }

    async fn handle_evictions(self: Arc<Self>, observer: MemoryObserver) {
        while let Some(eviction) = observer.next_eviction(&self.cancel_eviction).await {
            let _eviction = self.eviction_mutex.lock().await;
            self.evictions_seen.fetch_add(1, Ordering::AcqRel);
            if self.state() != MappingState::Active {
                continue;
            }

            let start = core::cmp::max(eviction.offset(), self.view_offset);
            let end = core::cmp::min(eviction.offset() + eviction.size(), self.view_offset + self.length);
            if start >= end {
                continue;
            }
            let first = self.address + (page_round_down(start) - self.view_offset);
            let last = self.address + (page_round_up(end) - self.view_offset);
            self.clear_pages(first, last);
            self.ops.shootdown(first, last - first).await;
            eviction.done();
        }
        vm_trace!("vm: eviction handler of mapping {:#x} exits", self.address);
        self.eviction_done.raise();
    }

    /// Unmaps `[first, last)`, forwarding dirty bits to the view
    fn clear_pages(&self, first: VirtualAddr, last: VirtualAddr) {
        let _paging = self.paging_lock.lock();
        let mut cleared = 0;
        for va in (first..last).step_by(PAGE_SIZE) {
            let status = self.ops.unmap_single(va);
            if !status.contains(PageStatus::PRESENT) {
                continue;
            }
            cleared += PAGE_SIZE;
            if status.contains(PageStatus::DIRTY) {
                self.view().mark_dirty(self.view_offset + (va - self.address), PAGE_SIZE);
            }
        }
        self.rss.fetch_sub(cleared, Ordering::Relaxed);
    }

    /// Faults in the page containing `offset` (relative to the mapping)
    ///
    /// Returns `true` if the fault was spurious, i.e. the page was already
    /// mapped with sufficient permissions.
    pub async fn touch_virtual_page(&self, offset: usize, write: bool) -> Result<bool> {
        if offset >= self.length {
            return Err(Error::Fault);
        }
        let page = page_round_down(offset);
        let view_offset = self.view_offset + page;
        self.view().async_lock_range(view_offset, PAGE_SIZE).await?;
        let touched = self.touch_locked(page, view_offset, write).await;
        self.view().unlock_range(view_offset, PAGE_SIZE);
        touched
    }

    async fn touch_locked(&self, page: usize, view_offset: usize, write: bool) -> Result<bool> {
        let mut fetch_flags = FetchFlags::empty();
        if write {
            fetch_flags |= FetchFlags::WRITE;
        }
        if self.flags().contains(MappingFlags::DONT_REQUIRE_BACKING) {
            fetch_flags |= FetchFlags::DISALLOW_BACKING;
        }

        loop {
            let seen = self.evictions_seen.load(Ordering::Acquire);
            let range = self.view().fetch_range(view_offset, fetch_flags).await?;
            let _eviction = self.eviction_mutex.lock().await;
            // The page may have been evicted between fetch and lock.
            if self.evictions_seen.load(Ordering::Acquire) != seen {
                continue;
            }
            if self.state() != MappingState::Active {
                return Err(Error::Fault);
            }

            let va = self.address + page;
            let status = {
                let _paging = self.paging_lock.lock();
                let status = self.ops.unmap_single(va);
                let access = self.flags().page_access(range.writable);
                self.ops.map_single(va, page_round_down(range.physical), access, range.caching);
                status
            };

            if status.contains(PageStatus::DIRTY) {
                self.view().mark_dirty(view_offset, PAGE_SIZE);
            }
            if status.contains(PageStatus::PRESENT) {
                self.ops.shootdown(va, PAGE_SIZE).await;
            } else {
                self.rss.fetch_add(PAGE_SIZE, Ordering::Relaxed);
            }
            return Ok(status.contains(PageStatus::PRESENT) && (!write || status.contains(PageStatus::WRITABLE)));
        }
    }

    /// Faults in every page of the mapping
    pub async fn populate(&self) -> Result<()> {
        let write = self.flags().contains(MappingFlags::PROT_WRITE);
        for offset in (0..self.length).step_by(PAGE_SIZE) {
            self.touch_virtual_page(offset, write).await?;
        }
        Ok(())
    }

    /// Changes permissions and remaps every resident page accordingly
    pub async fn protect(&self, flags: MappingFlags) {
        let _eviction = self.eviction_mutex.lock().await;
        let flags = {
            let mut current = self.flags.lock();
            *current = flags.upgraded() | (*current & MappingFlags::DONT_REQUIRE_BACKING);
            *current
        };

        {
            let _paging = self.paging_lock.lock();
            let mut dropped = 0;
            for progress in (0..self.length).step_by(PAGE_SIZE) {
                let va = self.address + progress;
                let status = self.ops.unmap_single(va);
                if !status.contains(PageStatus::PRESENT) {
                    continue;
                }
                if status.contains(PageStatus::DIRTY) {
                    self.view().mark_dirty(self.view_offset + progress, PAGE_SIZE);
                }
                match self.view().peek_range(self.view_offset + progress) {
                    Some((physical, caching)) if flags.is_accessible() => {
                        self.ops.map_single(va, page_round_down(physical), flags.page_access(true), caching);
                    }
                    _ => dropped += PAGE_SIZE,
                }
            }
            self.rss.fetch_sub(dropped, Ordering::Relaxed);
        }
        self.ops.shootdown(self.address, self.length).await;
    }

    /// Writes hardware dirty bits of `[offset, offset + size)` back to the view
    pub async fn synchronize(&self, offset: usize, size: usize) {
        let first = page_round_down(offset);
        let last = core::cmp::min(page_round_up(offset + size), self.length);
        if first >= last {
            return;
        }
        let _eviction = self.eviction_mutex.lock().await;
        {
            let _paging = self.paging_lock.lock();
            for progress in (first..last).step_by(PAGE_SIZE) {
                let status = self.ops.clean_single(self.address + progress);
                if status.contains(PageStatus::DIRTY) {
                    self.view().mark_dirty(self.view_offset + progress, PAGE_SIZE);
                }
            }
        }
        self.ops.shootdown(self.address + first, last - first).await;
    }

    /// Moves the mapping to `Zombie` and removes all of its translations
    pub async fn uninstall(&self) {
        {
            let mut state = self.state.lock();
            debug_assert_eq!(*state, MappingState::Active);
            *state = MappingState::Zombie;
        }
        let _eviction = self.eviction_mutex.lock().await;
        self.clear_pages(self.address, self.end());
        self.ops.shootdown(self.address, self.length).await;
    }

    /// Stops the eviction handler and detaches from the view
    pub async fn retire(&self) {
        self.cancel_eviction.cancel();
        self.eviction_done.wait().await;
        if let Some(id) = self.observer.lock().take() {
            if let Some(queue) = self.view().eviction_queue() {
                queue.remove_observer(id);
            }
        }
        *self.state.lock() = MappingState::Retired;
    }
}
