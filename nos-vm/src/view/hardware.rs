//! Fixed window onto physical memory (device registers, framebuffers)

use alloc::boxed::Box;
use core::future::ready;

use nos_vm_api::{
    is_page_aligned, BoxFuture, CachingMode, Error, PhysicalAddr, PhysicalRange, Result,
};

use super::{object_identity, AddressIdentity, FetchFlags, MemoryView};

/// Identity window over a fixed physical range; never evicted
pub struct HardwareMemory {
    base: PhysicalAddr,
    length: usize,
    caching: CachingMode,
}

impl HardwareMemory {
    /// Creates a window over `[base, base + length)`
    pub fn new(base: PhysicalAddr, length: usize, caching: CachingMode) -> Self {
        debug_assert!(is_page_aligned(base) && is_page_aligned(length));
        vm_debug!("vm: hardware window {:#x}+{:#x} ({:?})", base, length, caching);
        Self { base, length, caching }
    }
}

impl MemoryView for HardwareMemory {
    fn length(&self) -> usize {
        self.length
    }

    fn lock_range(&self, _offset: usize, _size: usize) -> Result<()> {
        Ok(())
    }

    fn unlock_range(&self, _offset: usize, _size: usize) {}

    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        (offset < self.length).then(|| (self.base + offset, self.caching))
    }

    fn fetch_range(&self, offset: usize, _flags: FetchFlags) -> BoxFuture<'_, Result<PhysicalRange>> {
        let result = if offset < self.length {
            Ok(PhysicalRange::new(self.base + offset, self.length - offset, self.caching))
        } else {
            Err(Error::Fault)
        };
        Box::pin(ready(result))
    }

    fn mark_dirty(&self, _offset: usize, _size: usize) {}

    fn address_identity(&self, offset: usize) -> Result<AddressIdentity> {
        if offset >= self.length {
            return Err(Error::Fault);
        }
        Ok(AddressIdentity { object: object_identity(self), offset })
    }
}
