//! Managed memory: a page cache whose contents are supplied by a manager
//!
//! A [`ManagedSpace`] has two faces. The [`FrontalMemory`] is what clients
//! map; faulting a missing page there suspends until the manager has filled
//! it. The [`BackingMemory`] is what the manager maps: it writes page
//! contents through it, then reports completion with
//! [`update_range`](MemoryView::update_range). Requests travel the other
//! way through [`submit_manage`](MemoryView::submit_manage).
//!
//! Per-page load states:
//!
//! ```text
//! Missing -> WantInitialization -> Initialization -> Present
//! Present -> WantWriteback -> Writeback -> Present
//!                              Writeback -> AnotherWriteback -> WantWriteback
//! Present <-> Evicting -> Missing
//! ```
//!
//! Present pages that are not locked are tracked by the
//! [`MemoryReclaimer`], which may uncache them under memory pressure.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use nos_vm_api::sync::{Completion, Mutex};
use nos_vm_api::{
    is_page_aligned, page_round_up, BoxFuture, CachingMode, Error, PhysicalAddr, PhysicalMemory, PhysicalRange,
    Result, PAGE_SHIFT, PAGE_SIZE,
};

use super::{
    allocate_frames, object_identity, AddressIdentity, EvictionQueue, FetchFlags, ManageRequest, ManagementRequest,
    MemoryView,
};
use crate::config::ManagedConfig;
use crate::reclaim::{BundleId, CacheBundle, MemoryReclaimer, PageKey};

/// Load state of a managed page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// No contents
    Missing,
    /// Queued for an initialize request
    WantInitialization,
    /// Handed to the manager for initialization
    Initialization,
    /// Resident and clean
    Present,
    /// Dirty, queued for a writeback request
    WantWriteback,
    /// Handed to the manager for writeback
    Writeback,
    /// Dirtied again while a writeback was in flight
    AnotherWriteback,
    /// Being unmapped by the reclaimer; can still be rescued
    Evicting,
}

impl LoadState {
    fn is_resident(self) -> bool {
        matches!(self, Self::Present | Self::WantWriteback | Self::Writeback | Self::AnotherWriteback)
    }
}

struct ManagedPage {
    physical: Option<PhysicalAddr>,
    state: LoadState,
    lock_count: usize,
}

impl ManagedPage {
    const fn missing() -> Self {
        Self { physical: None, state: LoadState::Missing, lock_count: 0 }
    }
}

/// Waiter for a range to finish initialization
struct Monitor {
    offset: usize,
    length: usize,
    progress: usize,
    completion: Arc<Completion<Result<()>>>,
}

struct ManagedInner {
    pages: BTreeMap<usize, ManagedPage>,
    num_pages: usize,
    initialization_list: VecDeque<usize>,
    writeback_list: VecDeque<usize>,
    management_queue: VecDeque<Arc<Completion<Result<ManagementRequest>>>>,
    monitors: Vec<Monitor>,
}

/// Page cache shared by a [`BackingMemory`] and a [`FrontalMemory`]
pub struct ManagedSpace {
    inner: Mutex<ManagedInner>,
    evict_queue: EvictionQueue,
    physical: Arc<dyn PhysicalMemory>,
    reclaimer: Arc<MemoryReclaimer>,
    bundle: BundleId,
    config: ManagedConfig,
}

fn page_span(offset: usize, size: usize) -> (usize, usize) {
    (offset >> PAGE_SHIFT, page_round_up(offset + size) >> PAGE_SHIFT)
}

/// Pops the first page of `list` that is in state `from`, plus every
/// directly following page in that state, and moves them to `to`
fn take_run(
    list: &mut VecDeque<usize>,
    pages: &mut BTreeMap<usize, ManagedPage>,
    from: LoadState,
    to: LoadState,
) -> Option<(usize, usize)> {
    let first = loop {
        let index = list.pop_front()?;
        match pages.get_mut(&index) {
            Some(page) if page.state == from => {
                page.state = to;
                break index;
            }
            _ => continue,
        }
    };
    let mut count = 1;
    while list.front() == Some(&(first + count)) {
        match pages.get_mut(&(first + count)) {
            Some(page) if page.state == from => page.state = to,
            _ => break,
        }
        list.pop_front();
        count += 1;
    }
    Some((first, count))
}

impl ManagedSpace {
    /// Creates a space of `length` bytes and returns its two faces
    pub fn create(
        length: usize,
        physical: Arc<dyn PhysicalMemory>,
        reclaimer: Arc<MemoryReclaimer>,
        config: ManagedConfig,
    ) -> (Arc<BackingMemory>, Arc<FrontalMemory>) {
        let space = Self::new(length, physical, reclaimer, config);
        (Arc::new(BackingMemory { space: space.clone() }), Arc::new(FrontalMemory { space }))
    }

    /// Creates a space of `length` bytes, registered with `reclaimer`
    pub fn new(
        length: usize,
        physical: Arc<dyn PhysicalMemory>,
        reclaimer: Arc<MemoryReclaimer>,
        config: ManagedConfig,
    ) -> Arc<Self> {
        let num_pages = page_round_up(length) >> PAGE_SHIFT;
        vm_debug!("vm: managed space of {} pages, read-ahead {}", num_pages, config.read_ahead);
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let bundle: Weak<dyn CacheBundle> = weak.clone();
            let bundle = reclaimer.register_bundle(bundle);
            Self {
                inner: Mutex::new(ManagedInner {
                    pages: BTreeMap::new(),
                    num_pages,
                    initialization_list: VecDeque::new(),
                    writeback_list: VecDeque::new(),
                    management_queue: VecDeque::new(),
                    monitors: Vec::new(),
                }),
                evict_queue: EvictionQueue::new(),
                physical,
                reclaimer,
                bundle,
                config,
            }
        })
    }

    /// Length in bytes
    pub fn length(&self) -> usize {
        self.inner.lock().num_pages << PAGE_SHIFT
    }

    /// Load state of a page; `None` beyond the end
    pub fn page_state(&self, index: usize) -> Option<LoadState> {
        let inner = self.inner.lock();
        if index >= inner.num_pages {
            return None;
        }
        Some(inner.pages.get(&index).map_or(LoadState::Missing, |page| page.state))
    }

    /// Queue through which mappings of either face are told about evictions
    pub fn eviction_queue(&self) -> &EvictionQueue {
        &self.evict_queue
    }

    fn key(&self, index: usize) -> PageKey {
        PageKey { bundle: self.bundle, identity: index }
    }

    /// Pins the pages of a byte range
    pub fn lock_pages(&self, offset: usize, size: usize) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (first, end) = page_span(offset, size);
        if end > inner.num_pages {
            return Err(Error::BufferTooSmall);
        }
        for index in first..end {
            let page = inner.pages.entry(index).or_insert_with(ManagedPage::missing);
            page.lock_count += 1;
            if page.lock_count == 1 {
                match page.state {
                    LoadState::Present => self.reclaimer.remove_page(self.key(index)),
                    LoadState::Evicting => page.state = LoadState::Present,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Releases pins taken by [`lock_pages`](Self::lock_pages)
    pub fn unlock_pages(&self, offset: usize, size: usize) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (first, end) = page_span(offset, size);
        for index in first..end {
            let Some(page) = inner.pages.get_mut(&index) else {
                debug_assert!(false, "unlocking page {} that was never locked", index);
                continue;
            };
            debug_assert!(page.lock_count > 0);
            page.lock_count = page.lock_count.saturating_sub(1);
            if page.lock_count > 0 {
                continue;
            }
            if index >= inner.num_pages {
                // Truncated while pinned.
                if let Some(physical) = inner.pages.remove(&index).and_then(|page| page.physical) {
                    self.physical.free(physical, PAGE_SIZE);
                }
            } else if page.state == LoadState::Present {
                self.reclaimer.add_page(self.key(index), PAGE_SIZE);
            }
        }
    }

    /// Hands pending work to waiting manager requests, writebacks first
    fn progress_management(inner: &mut ManagedInner) {
        loop {
            let abandoned = match inner.management_queue.front() {
                None => return,
                Some(waiter) => Arc::strong_count(waiter) == 1,
            };
            // The manager stopped waiting for this request.
            if abandoned {
                inner.management_queue.pop_front();
                continue;
            }

            let request = if let Some((index, count)) = take_run(
                &mut inner.writeback_list,
                &mut inner.pages,
                LoadState::WantWriteback,
                LoadState::Writeback,
            ) {
                ManagementRequest { kind: ManageRequest::Writeback, offset: index << PAGE_SHIFT, length: count << PAGE_SHIFT }
            } else if let Some((index, count)) = take_run(
                &mut inner.initialization_list,
                &mut inner.pages,
                LoadState::WantInitialization,
                LoadState::Initialization,
            ) {
                ManagementRequest {
                    kind: ManageRequest::Initialize,
                    offset: index << PAGE_SHIFT,
                    length: count << PAGE_SHIFT,
                }
            } else {
                return;
            };

            vm_debug!("vm: manage request {:?} {:#x}+{:#x}", request.kind, request.offset, request.length);
            if let Some(waiter) = inner.management_queue.pop_front() {
                waiter.complete(Ok(request));
            }
        }
    }

    /// Completes monitors whose range left the initialization states
    fn progress_monitors(inner: &mut ManagedInner) {
        let ManagedInner { monitors, pages, num_pages, .. } = inner;
        monitors.retain_mut(|monitor| {
            if Arc::strong_count(&monitor.completion) == 1 {
                return false;
            }
            while monitor.progress < monitor.length {
                let index = (monitor.offset + monitor.progress) >> PAGE_SHIFT;
                if index >= *num_pages {
                    monitor.completion.complete(Err(Error::Fault));
                    return false;
                }
                let state = pages.get(&index).map_or(LoadState::Missing, |page| page.state);
                if matches!(state, LoadState::WantInitialization | LoadState::Initialization) {
                    return true;
                }
                monitor.progress += PAGE_SIZE;
            }
            monitor.completion.complete(Ok(()));
            false
        });
    }

    /// Queues a missing page for initialization
    fn request_initialization(inner: &mut ManagedInner, index: usize) {
        let page = inner.pages.entry(index).or_insert_with(ManagedPage::missing);
        if page.state == LoadState::Missing {
            page.state = LoadState::WantInitialization;
            inner.initialization_list.push_back(index);
        }
    }

    /// Registers a monitor for `[offset, offset + length)`
    fn monitor(inner: &mut ManagedInner, offset: usize, length: usize) -> Arc<Completion<Result<()>>> {
        let completion = Arc::new(Completion::new());
        inner.monitors.push(Monitor { offset, length, progress: 0, completion: completion.clone() });
        Self::progress_monitors(inner);
        completion
    }

    async fn fetch_frontal(&self, offset: usize, flags: FetchFlags) -> Result<PhysicalRange> {
        let index = offset >> PAGE_SHIFT;
        let misalign = offset & (PAGE_SIZE - 1);
        loop {
            let monitor = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if index >= inner.num_pages {
                    return Err(Error::Fault);
                }
                let page = inner.pages.entry(index).or_insert_with(ManagedPage::missing);
                if page.state.is_resident() || page.state == LoadState::Evicting {
                    let physical = page.physical.ok_or(Error::Fault)?;
                    match page.state {
                        LoadState::Evicting => {
                            page.state = LoadState::Present;
                            if page.lock_count == 0 {
                                self.reclaimer.add_page(self.key(index), PAGE_SIZE);
                            }
                        }
                        LoadState::Present if page.lock_count == 0 => self.reclaimer.bump_page(self.key(index)),
                        _ => {}
                    }
                    return Ok(PhysicalRange::new(physical + misalign, PAGE_SIZE - misalign, CachingMode::Null));
                }

                if flags.contains(FetchFlags::DISALLOW_BACKING) {
                    vm_info!("vm: page {} of a managed space is missing and backing is disallowed", index);
                    return Err(Error::Fault);
                }

                if page.state == LoadState::Missing {
                    Self::request_initialization(inner, index);
                    let last = core::cmp::min(index + self.config.read_ahead, inner.num_pages - 1);
                    for ahead in index + 1..=last {
                        Self::request_initialization(inner, ahead);
                    }
                }
                Self::progress_management(inner);
                Self::monitor(inner, index << PAGE_SHIFT, PAGE_SIZE)
            };
            monitor.wait().await?;
        }
    }

    fn peek_frontal(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        let inner = self.inner.lock();
        let page = inner.pages.get(&(offset >> PAGE_SHIFT))?;
        if !page.state.is_resident() {
            return None;
        }
        Some((page.physical? + (offset & (PAGE_SIZE - 1)), CachingMode::Null))
    }

    fn mark_dirty_frontal(&self, offset: usize, size: usize) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (first, end) = page_span(offset, size);
        for index in first..end {
            let Some(page) = inner.pages.get_mut(&index) else {
                continue;
            };
            match page.state {
                LoadState::Present => {
                    page.state = LoadState::WantWriteback;
                    if page.lock_count == 0 {
                        self.reclaimer.remove_page(self.key(index));
                    }
                    inner.writeback_list.push_back(index);
                }
                LoadState::Evicting => {
                    page.state = LoadState::WantWriteback;
                    inner.writeback_list.push_back(index);
                }
                LoadState::Writeback => page.state = LoadState::AnotherWriteback,
                _ => {}
            }
        }
        Self::progress_management(inner);
    }

    async fn initiate_load(&self, offset: usize, length: usize) -> Result<()> {
        if !is_page_aligned(offset) || !is_page_aligned(length) {
            return Err(Error::IllegalArgs);
        }
        let monitor = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let (first, end) = page_span(offset, length);
            if end > inner.num_pages {
                return Err(Error::BufferTooSmall);
            }
            for index in first..end {
                Self::request_initialization(inner, index);
            }
            Self::progress_management(inner);
            Self::monitor(inner, offset, length)
        };
        monitor.wait().await
    }

    async fn fetch_backing(&self, offset: usize) -> Result<PhysicalRange> {
        let index = offset >> PAGE_SHIFT;
        let misalign = offset & (PAGE_SIZE - 1);
        let mut inner = self.inner.lock();
        if index >= inner.num_pages {
            return Err(Error::Fault);
        }
        let page = inner.pages.entry(index).or_insert_with(ManagedPage::missing);
        let physical = match page.physical {
            Some(physical) => physical,
            None => {
                let physical = allocate_frames(self.physical.as_ref(), PAGE_SIZE, PAGE_SIZE);
                self.physical.zero(physical, PAGE_SIZE);
                page.physical = Some(physical);
                physical
            }
        };
        Ok(PhysicalRange::new(physical + misalign, PAGE_SIZE - misalign, CachingMode::Null))
    }

    fn peek_backing(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        let inner = self.inner.lock();
        let physical = inner.pages.get(&(offset >> PAGE_SHIFT))?.physical?;
        Some((physical + (offset & (PAGE_SIZE - 1)), CachingMode::Null))
    }

    async fn submit_manage(&self) -> Result<ManagementRequest> {
        let waiter = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let waiter = Arc::new(Completion::new());
            inner.management_queue.push_back(waiter.clone());
            Self::progress_management(inner);
            waiter
        };
        waiter.wait().await
    }

    fn update_range(&self, kind: ManageRequest, offset: usize, length: usize) -> Result<()> {
        if !is_page_aligned(offset) || !is_page_aligned(length) {
            return Err(Error::IllegalArgs);
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (first, end) = page_span(offset, length);
        if end > inner.num_pages {
            return Err(Error::BufferTooSmall);
        }

        for index in first..end {
            let page = inner.pages.entry(index).or_insert_with(ManagedPage::missing);
            match kind {
                ManageRequest::Initialize => {
                    match page.state {
                        LoadState::Missing | LoadState::Initialization => {}
                        LoadState::WantInitialization => inner.initialization_list.retain(|&queued| queued != index),
                        _ => continue,
                    }
                    if page.physical.is_none() {
                        let physical = allocate_frames(self.physical.as_ref(), PAGE_SIZE, PAGE_SIZE);
                        self.physical.zero(physical, PAGE_SIZE);
                        page.physical = Some(physical);
                    }
                    page.state = LoadState::Present;
                    if page.lock_count == 0 {
                        self.reclaimer.add_page(self.key(index), PAGE_SIZE);
                    }
                }
                ManageRequest::Writeback => match page.state {
                    LoadState::Writeback => {
                        page.state = LoadState::Present;
                        if page.lock_count == 0 {
                            self.reclaimer.add_page(self.key(index), PAGE_SIZE);
                        }
                    }
                    LoadState::AnotherWriteback => {
                        page.state = LoadState::WantWriteback;
                        inner.writeback_list.push_back(index);
                    }
                    _ => {}
                },
            }
        }

        Self::progress_monitors(inner);
        Self::progress_management(inner);
        Ok(())
    }

    async fn resize(&self, new_length: usize) -> Result<()> {
        if !is_page_aligned(new_length) {
            return Err(Error::IllegalArgs);
        }
        let new_pages = new_length >> PAGE_SHIFT;
        let old_pages = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let old_pages = core::mem::replace(&mut inner.num_pages, new_pages);
            Self::progress_monitors(inner);
            old_pages
        };
        vm_debug!("vm: managed space resized from {} to {} pages", old_pages, new_pages);
        if new_pages >= old_pages {
            return Ok(());
        }

        self.evict_queue.evict_range(new_length, (old_pages - new_pages) << PAGE_SHIFT).await;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        // A concurrent resize may have grown the space again.
        let end = inner.num_pages;
        let doomed: Vec<usize> = inner
            .pages
            .range(end..)
            .filter(|(_, page)| page.lock_count == 0)
            .map(|(&index, _)| index)
            .collect();
        for index in doomed {
            if let Some(page) = inner.pages.remove(&index) {
                if let Some(physical) = page.physical {
                    self.physical.free(physical, PAGE_SIZE);
                }
                self.reclaimer.remove_page(self.key(index));
            }
        }
        inner.initialization_list.retain(|&index| index < end);
        inner.writeback_list.retain(|&index| index < end);
        Ok(())
    }

    async fn uncache(&self, index: usize) -> bool {
        {
            let mut inner = self.inner.lock();
            if !self.reclaimer.finish_uncaching(self.key(index)) {
                return false;
            }
            let Some(page) = inner.pages.get_mut(&index) else {
                return false;
            };
            if page.state != LoadState::Present || page.lock_count > 0 {
                return false;
            }
            page.state = LoadState::Evicting;
        }

        self.evict_queue.evict_range(index << PAGE_SHIFT, PAGE_SIZE).await;

        let mut inner = self.inner.lock();
        let Some(page) = inner.pages.get_mut(&index) else {
            return false;
        };
        if page.state != LoadState::Evicting {
            return false;
        }
        debug_assert!(page.lock_count == 0);
        page.state = LoadState::Missing;
        if let Some(physical) = page.physical.take() {
            self.physical.free(physical, PAGE_SIZE);
        }
        vm_trace!("vm: uncached page {} of managed space {:?}", index, self.bundle);
        true
    }
}

impl CacheBundle for ManagedSpace {
    fn uncache_page(self: Arc<Self>, identity: usize) -> BoxFuture<'static, bool> {
        Box::pin(async move { self.uncache(identity).await })
    }
}

impl Drop for ManagedSpace {
    fn drop(&mut self) {
        self.reclaimer.forget_bundle(self.bundle);
        let inner = self.inner.get_mut();
        for page in inner.pages.values_mut() {
            if let Some(physical) = page.physical.take() {
                self.physical.free(physical, PAGE_SIZE);
            }
        }
        for waiter in inner.management_queue.drain(..) {
            waiter.complete(Err(Error::IllegalObject));
        }
    }
}

/// Manager-facing side of a [`ManagedSpace`]
pub struct BackingMemory {
    space: Arc<ManagedSpace>,
}

impl BackingMemory {
    /// The shared page cache
    pub fn space(&self) -> &Arc<ManagedSpace> {
        &self.space
    }
}

impl MemoryView for BackingMemory {
    fn length(&self) -> usize {
        self.space.length()
    }

    fn eviction_queue(&self) -> Option<&EvictionQueue> {
        Some(&self.space.evict_queue)
    }

    fn lock_range(&self, offset: usize, size: usize) -> Result<()> {
        self.space.lock_pages(offset, size)
    }

    fn unlock_range(&self, offset: usize, size: usize) {
        self.space.unlock_pages(offset, size);
    }

    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        self.space.peek_backing(offset)
    }

    fn fetch_range(&self, offset: usize, _flags: FetchFlags) -> BoxFuture<'_, Result<PhysicalRange>> {
        Box::pin(self.space.fetch_backing(offset))
    }

    fn mark_dirty(&self, _offset: usize, _size: usize) {}

    fn resize(&self, new_length: usize) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.space.resize(new_length))
    }

    fn address_identity(&self, offset: usize) -> Result<AddressIdentity> {
        if offset >= self.length() {
            return Err(Error::Fault);
        }
        Ok(AddressIdentity { object: object_identity(self.space.as_ref()), offset })
    }

    fn update_range(&self, kind: ManageRequest, offset: usize, length: usize) -> Result<()> {
        self.space.update_range(kind, offset, length)
    }

    fn submit_manage(&self) -> BoxFuture<'_, Result<ManagementRequest>> {
        Box::pin(self.space.submit_manage())
    }
}

/// Client-facing side of a [`ManagedSpace`]
pub struct FrontalMemory {
    space: Arc<ManagedSpace>,
}

impl FrontalMemory {
    /// The shared page cache
    pub fn space(&self) -> &Arc<ManagedSpace> {
        &self.space
    }
}

impl MemoryView for FrontalMemory {
    fn length(&self) -> usize {
        self.space.length()
    }

    fn eviction_queue(&self) -> Option<&EvictionQueue> {
        Some(&self.space.evict_queue)
    }

    fn lock_range(&self, offset: usize, size: usize) -> Result<()> {
        self.space.lock_pages(offset, size)
    }

    fn unlock_range(&self, offset: usize, size: usize) {
        self.space.unlock_pages(offset, size);
    }

    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        self.space.peek_frontal(offset)
    }

    fn fetch_range(&self, offset: usize, flags: FetchFlags) -> BoxFuture<'_, Result<PhysicalRange>> {
        Box::pin(self.space.fetch_frontal(offset, flags))
    }

    fn mark_dirty(&self, offset: usize, size: usize) {
        self.space.mark_dirty_frontal(offset, size);
    }

    fn address_identity(&self, offset: usize) -> Result<AddressIdentity> {
        if offset >= self.length() {
            return Err(Error::Fault);
        }
        Ok(AddressIdentity { object: object_identity(self.space.as_ref()), offset })
    }

    fn submit_initiate_load(&self, offset: usize, length: usize) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.space.initiate_load(offset, length))
    }
}
