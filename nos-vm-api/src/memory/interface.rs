//! Interfaces of the collaborators the virtual memory subsystem depends on
//!
//! The physical frame allocator, the direct-map accessor and the
//! architecture page-table writer are provided by the kernel. The subsystem
//! only ever talks to them through these traits.

use crate::core::types::{PhysicalAddr, VirtualAddr};
use crate::memory::types::{CachingMode, PageAccess, PageStatus};
use crate::task::BoxFuture;

/// Physical frame allocator
pub trait PhysicalAllocator: Send + Sync {
    /// Allocates `size` bytes aligned to `alignment`, or `None` if memory is exhausted
    fn allocate(&self, size: usize, alignment: usize) -> Option<PhysicalAddr>;

    /// Returns a range obtained from [`PhysicalAllocator::allocate`]
    fn free(&self, physical: PhysicalAddr, size: usize);

    /// Number of pages currently handed out
    fn used_pages(&self) -> usize;

    /// Number of pages managed by the allocator
    fn total_pages(&self) -> usize;
}

/// Access to the contents of physical memory (the kernel's direct map)
pub trait PageAccessor: Send + Sync {
    /// Fills `size` bytes at `physical` with zeros
    fn zero(&self, physical: PhysicalAddr, size: usize);

    /// Copies one page from `src` to `dest`
    fn copy_page(&self, dest: PhysicalAddr, src: PhysicalAddr);

    /// Reads `buffer.len()` bytes starting at `physical`
    fn read(&self, physical: PhysicalAddr, buffer: &mut [u8]);

    /// Writes `buffer` starting at `physical`
    fn write(&self, physical: PhysicalAddr, buffer: &[u8]);
}

/// Everything the views need from physical memory
pub trait PhysicalMemory: PhysicalAllocator + PageAccessor {}

impl<T: PhysicalAllocator + PageAccessor + ?Sized> PhysicalMemory for T {}

/// Per-space page-table operations
///
/// Implementations must be safe to call concurrently for distinct pages. The
/// virtual memory subsystem serializes operations on the same page.
pub trait PageTableOps: Send + Sync {
    /// Installs a translation for a single page
    fn map_single(&self, va: VirtualAddr, pa: PhysicalAddr, access: PageAccess, caching: CachingMode);

    /// Removes the translation of a single page and reports its prior status
    fn unmap_single(&self, va: VirtualAddr) -> PageStatus;

    /// Clears the dirty and accessed bits of a single page and reports its prior status
    fn clean_single(&self, va: VirtualAddr) -> PageStatus;

    /// Checks whether a translation is present
    fn is_mapped(&self, va: VirtualAddr) -> bool;

    /// Invalidates stale TLB entries for a range on every CPU that uses this space
    fn shootdown(&self, va: VirtualAddr, size: usize) -> BoxFuture<'static, ()>;
}
