//! Memory views: the backing stores that mappings point at
//!
//! A [`MemoryView`] is a byte-addressed object whose pages can be pinned
//! ([`lock_range`](MemoryView::lock_range)), inspected without blocking
//! ([`peek_range`](MemoryView::peek_range)) and faulted in
//! ([`fetch_range`](MemoryView::fetch_range)). Views that can take pages
//! away again expose an [`EvictionQueue`]; every mapping of such a view
//! listens on it and unmaps the affected pages before acknowledging.
//!
//! Variants:
//!
//! - [`HardwareMemory`](hardware::HardwareMemory): fixed physical window, never evicted
//! - [`AllocatedMemory`](allocated::AllocatedMemory): lazily allocated anonymous memory
//! - [`BackingMemory`](managed::BackingMemory) / [`FrontalMemory`](managed::FrontalMemory):
//!   the manager-facing and the client-facing side of a user-space page cache
//! - [`CopyOnWriteMemory`](cow::CopyOnWriteMemory): forkable private copy of another view
//! - [`IndirectMemory`](indirect::IndirectMemory): slots that forward to rebindable views

pub mod allocated;
pub mod copy;
pub mod cow;
pub mod eviction;
pub mod hardware;
pub mod indirect;
pub mod lock_handle;
pub mod managed;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::future::ready;

use bitflags::bitflags;
use nos_vm_api::{
    is_page_aligned, BoxFuture, CachingMode, Error, PhysicalAddr, PhysicalMemory, PhysicalRange, Result,
};

pub use eviction::{Eviction, EvictionQueue, MemoryObserver, ObserverId};

bitflags! {
    /// Options of a [`MemoryView::fetch_range`] call
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FetchFlags: u32 {
        /// Fail with [`Error::Fault`] instead of asking a manager for the page
        const DISALLOW_BACKING = 1 << 0;
        /// The caller intends to write the page
        const WRITE = 1 << 1;
    }
}

/// Kind of request exchanged with the manager of a managed space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManageRequest {
    /// Fill the range with its contents
    Initialize,
    /// Persist the (dirty) range
    Writeback,
}

/// A request handed to the manager by [`MemoryView::submit_manage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagementRequest {
    /// What the manager has to do
    pub kind: ManageRequest,
    /// Page-aligned byte offset
    pub offset: usize,
    /// Page-aligned byte length; adjacent pending pages are fused
    pub length: usize,
}

/// Stable identity of a byte of a view (futex keys and the like)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressIdentity {
    /// Identity of the object that owns the byte
    pub object: usize,
    /// Offset inside that object
    pub offset: usize,
}

/// Common interface of all backing stores
///
/// Synchronous methods only take spinlocks. Methods that may have to wait
/// for another party (a copy in progress, a manager, an eviction
/// handshake) return a boxed future and never hold a spinlock across a
/// suspension point.
pub trait MemoryView: Send + Sync {
    /// Length of the view in bytes
    fn length(&self) -> usize;

    /// Queue on which the view announces evictions, if it ever evicts
    fn eviction_queue(&self) -> Option<&EvictionQueue> {
        None
    }

    /// Pins `[offset, offset + size)` so that peeked pages stay valid
    fn lock_range(&self, offset: usize, size: usize) -> Result<()>;

    /// Like [`lock_range`](MemoryView::lock_range), but may wait (e.g. for a copy)
    fn async_lock_range(&self, offset: usize, size: usize) -> BoxFuture<'_, Result<()>> {
        Box::pin(ready(self.lock_range(offset, size)))
    }

    /// Releases a pin taken by one of the lock methods
    ///
    /// Views that forward to another view resolve the target again here, so
    /// the forwarding must not change while a pin is held.
    fn unlock_range(&self, offset: usize, size: usize);

    /// Returns the page at `offset` if it is resident, without blocking
    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)>;

    /// Makes the page at `offset` resident and returns it
    fn fetch_range(&self, offset: usize, flags: FetchFlags) -> BoxFuture<'_, Result<PhysicalRange>>;

    /// Records that `[offset, offset + size)` was written through a mapping
    fn mark_dirty(&self, offset: usize, size: usize);

    /// Changes the length of the view
    fn resize(&self, _new_length: usize) -> BoxFuture<'_, Result<()>> {
        Box::pin(ready(Err(Error::IllegalObject)))
    }

    /// Creates a copy-on-write sibling of the view
    fn fork(&self) -> BoxFuture<'_, Result<Arc<dyn MemoryView>>> {
        Box::pin(ready(Err(Error::IllegalObject)))
    }

    /// Identity of the byte at `offset`
    fn address_identity(&self, offset: usize) -> Result<AddressIdentity>;

    /// Completes a management request (manager side)
    fn update_range(&self, _kind: ManageRequest, _offset: usize, _length: usize) -> Result<()> {
        Err(Error::IllegalObject)
    }

    /// Waits for the next management request (manager side)
    fn submit_manage(&self) -> BoxFuture<'_, Result<ManagementRequest>> {
        Box::pin(ready(Err(Error::IllegalObject)))
    }

    /// Starts loading a range and completes once all of it is resident
    fn submit_initiate_load(&self, _offset: usize, _length: usize) -> BoxFuture<'_, Result<()>> {
        Box::pin(ready(Ok(())))
    }

    /// Binds an indirection slot to a range of another view
    ///
    /// Callers must not rebind a slot while they hold a lock on it; the
    /// unlock would reach the new binding.
    fn set_indirection(&self, _slot: usize, _view: Arc<dyn MemoryView>, _offset: usize, _size: usize) -> Result<()> {
        Err(Error::IllegalObject)
    }
}

/// A page-aligned window into a view
#[derive(Clone)]
pub struct MemorySlice {
    view: Arc<dyn MemoryView>,
    offset: usize,
    length: usize,
}

impl MemorySlice {
    /// Creates a slice; offset and length must be page aligned and in bounds
    pub fn new(view: Arc<dyn MemoryView>, offset: usize, length: usize) -> Result<Self> {
        if !is_page_aligned(offset) || !is_page_aligned(length) {
            return Err(Error::IllegalArgs);
        }
        match offset.checked_add(length) {
            Some(end) if end <= view.length() => Ok(Self { view, offset, length }),
            _ => Err(Error::BufferTooSmall),
        }
    }

    /// Slice covering the whole view
    pub fn whole(view: Arc<dyn MemoryView>) -> Self {
        let length = view.length();
        Self { view, offset: 0, length }
    }

    /// Underlying view
    pub fn view(&self) -> &Arc<dyn MemoryView> {
        &self.view
    }

    /// Offset of the slice inside the view
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the slice
    pub fn length(&self) -> usize {
        self.length
    }
}

/// Allocates physical memory; running out of it is fatal
pub(crate) fn allocate_frames(physical: &dyn PhysicalMemory, size: usize, alignment: usize) -> PhysicalAddr {
    match physical.allocate(size, alignment) {
        Some(frame) => frame,
        None => {
            vm_error!("vm: out of physical memory allocating {:#x} bytes", size);
            panic!("out of physical memory");
        }
    }
}

/// Identity of an object for [`AddressIdentity`]
pub(crate) fn object_identity<T>(object: &T) -> usize {
    object as *const T as usize
}
