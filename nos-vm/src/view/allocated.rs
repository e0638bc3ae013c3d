//! Anonymous memory allocated on first use
//!
//! Memory is handed out in chunks: a chunk is a power-of-two multiple of the
//! page size, allocated and zeroed the first time any byte of it is
//! fetched, and returned to the allocator when the view is dropped.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::ready;

use nos_vm_api::sync::Mutex;
use nos_vm_api::{
    BoxFuture, CachingMode, Error, PhysicalAddr, PhysicalMemory, PhysicalRange, Result, PAGE_SIZE,
};

use super::{allocate_frames, object_identity, AddressIdentity, FetchFlags, MemoryView};

/// Lazily allocated anonymous memory; never evicted
pub struct AllocatedMemory {
    physical: Arc<dyn PhysicalMemory>,
    chunk_size: usize,
    chunk_align: usize,
    chunks: Mutex<Vec<Option<PhysicalAddr>>>,
}

impl AllocatedMemory {
    /// Creates a view of at least `length` bytes using page-sized chunks
    pub fn new(physical: Arc<dyn PhysicalMemory>, length: usize) -> Self {
        Self::with_chunks(physical, length, PAGE_SIZE, PAGE_SIZE)
    }

    /// Creates a view with a custom chunk size and chunk alignment
    ///
    /// The chunk size is rounded up to a power of two and the length to a
    /// multiple of the chunk size.
    pub fn with_chunks(
        physical: Arc<dyn PhysicalMemory>,
        length: usize,
        desired_chunk_size: usize,
        chunk_align: usize,
    ) -> Self {
        let chunk_size = desired_chunk_size.max(PAGE_SIZE).next_power_of_two();
        if chunk_size != desired_chunk_size {
            vm_info!("vm: chunk size {:#x} rounded up to {:#x}", desired_chunk_size, chunk_size);
        }
        let rounded = length.div_ceil(chunk_size) * chunk_size;
        if rounded != length {
            vm_info!("vm: memory length {:#x} rounded up to {:#x}", length, rounded);
        }
        let chunk_align = chunk_align.max(PAGE_SIZE);
        debug_assert!(chunk_align % PAGE_SIZE == 0 && chunk_size % chunk_align == 0);

        let mut chunks = Vec::new();
        chunks.resize(rounded / chunk_size, None);
        Self { physical, chunk_size, chunk_align, chunks: Mutex::new(chunks) }
    }

    /// Size of one allocation unit
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Writes kernel data into the view, allocating the chunk if needed
    ///
    /// Only naturally aligned accesses of at most a page are supported.
    pub fn copy_kernel_to_this(&self, offset: usize, data: &[u8]) -> Result<()> {
        if data.len() > PAGE_SIZE || (!data.is_empty() && offset % data.len() != 0) {
            return Err(Error::IllegalArgs);
        }
        let chunk = self.ensure_chunk(offset / self.chunk_size)?;
        self.physical.write(chunk + offset % self.chunk_size, data);
        Ok(())
    }

    fn ensure_chunk(&self, index: usize) -> Result<PhysicalAddr> {
        let mut chunks = self.chunks.lock();
        let slot = chunks.get_mut(index).ok_or(Error::Fault)?;
        if let Some(chunk) = *slot {
            return Ok(chunk);
        }
        let chunk = allocate_frames(self.physical.as_ref(), self.chunk_size, self.chunk_align);
        debug_assert!(chunk % self.chunk_align == 0);
        self.physical.zero(chunk, self.chunk_size);
        *slot = Some(chunk);
        Ok(chunk)
    }
}

impl Drop for AllocatedMemory {
    fn drop(&mut self) {
        let chunks = self.chunks.get_mut();
        let mut _released = 0;
        for chunk in chunks.iter_mut().filter_map(Option::take) {
            self.physical.free(chunk, self.chunk_size);
            _released += 1;
        }
        vm_debug!("vm: released {} chunks of anonymous memory", _released);
    }
}

impl MemoryView for AllocatedMemory {
    fn length(&self) -> usize {
        self.chunks.lock().len() * self.chunk_size
    }

    fn lock_range(&self, offset: usize, size: usize) -> Result<()> {
        if offset.saturating_add(size) > self.length() {
            return Err(Error::BufferTooSmall);
        }
        Ok(())
    }

    fn unlock_range(&self, _offset: usize, _size: usize) {}

    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        let chunks = self.chunks.lock();
        let chunk = (*chunks.get(offset / self.chunk_size)?)?;
        Some((chunk + offset % self.chunk_size, CachingMode::Null))
    }

    fn fetch_range(&self, offset: usize, _flags: FetchFlags) -> BoxFuture<'_, Result<PhysicalRange>> {
        let disp = offset % self.chunk_size;
        let result = self
            .ensure_chunk(offset / self.chunk_size)
            .map(|chunk| PhysicalRange::new(chunk + disp, self.chunk_size - disp, CachingMode::Null));
        Box::pin(ready(result))
    }

    fn mark_dirty(&self, _offset: usize, _size: usize) {}

    fn resize(&self, new_length: usize) -> BoxFuture<'_, Result<()>> {
        let result = (|| {
            if new_length % self.chunk_size != 0 {
                return Err(Error::IllegalArgs);
            }
            let mut chunks = self.chunks.lock();
            let wanted = new_length / self.chunk_size;
            if wanted < chunks.len() {
                return Err(Error::IllegalArgs);
            }
            chunks.resize(wanted, None);
            Ok(())
        })();
        Box::pin(ready(result))
    }

    fn address_identity(&self, offset: usize) -> Result<AddressIdentity> {
        if offset >= self.length() {
            return Err(Error::Fault);
        }
        Ok(AddressIdentity { object: object_identity(self), offset })
    }
}
