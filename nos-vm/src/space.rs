//! Virtual address spaces
//!
//! A [`VirtualSpace`] owns the free ranges of an address space (a
//! [`HoleTree`]) and the mappings placed into it. Holes and mappings
//! together tile the layout exactly; every operation keeps that true while
//! holding the space lock, and performs the (possibly suspending) page
//! table work only after dropping it.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use nos_vm_api::sync::{AtomicUsize, Mutex, Ordering};
use nos_vm_api::{
    is_page_aligned, page_offset, Error, PageAccessor, PageTableOps, Result, VirtualAddr, WorkQueue,
};

use crate::config::SpaceLayout;
use crate::hole::{Hole, HoleTree};
use crate::mapping::{Mapping, MappingFlags};
use crate::view::copy::{copy_from_view, copy_to_view};
use crate::view::MemorySlice;

bitflags! {
    /// Flags of [`VirtualSpace::map`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u32 {
        /// Place the mapping exactly at the given address
        const FIXED = 0x01;
        /// Search for a hole from the bottom of the space (default)
        const PREFER_BOTTOM = 0x02;
        /// Search for a hole from the top of the space
        const PREFER_TOP = 0x04;
        const PROT_READ = 0x08;
        const PROT_WRITE = 0x10;
        const PROT_EXECUTE = 0x20;
        /// Fault in every page before returning
        const POPULATE = 0x200;
        /// Never ask a manager for missing pages
        const DONT_REQUIRE_BACKING = 0x400;
    }
}

impl MapFlags {
    /// Permission and backing part of the flags
    pub fn mapping_flags(self) -> MappingFlags {
        let mut flags = MappingFlags::empty();
        if self.contains(Self::PROT_READ) {
            flags |= MappingFlags::PROT_READ;
        }
        if self.contains(Self::PROT_WRITE) {
            flags |= MappingFlags::PROT_WRITE;
        }
        if self.contains(Self::PROT_EXECUTE) {
            flags |= MappingFlags::PROT_EXECUTE;
        }
        if self.contains(Self::DONT_REQUIRE_BACKING) {
            flags |= MappingFlags::DONT_REQUIRE_BACKING;
        }
        flags
    }
}

bitflags! {
    /// Kind of access that caused a page fault
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FaultFlags: u32 {
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Why a fault could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No mapping covers the address
    NoMapping,
    /// The mapping does not allow the access
    ProtectionViolation,
    /// The view could not provide the page
    Backing(Error),
}

/// Result of [`VirtualSpace::handle_fault`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A translation was installed
    Resolved,
    /// The page was already mapped with sufficient permissions
    Spurious,
    /// The fault must be reported to the faulting thread
    Unresolved(FaultError),
}

impl FaultOutcome {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved(_))
    }
}

struct SpaceInner {
    holes: HoleTree,
    mappings: BTreeMap<VirtualAddr, Arc<Mapping>>,
}

impl SpaceInner {
    fn mapping_containing(&self, address: VirtualAddr) -> Option<Arc<Mapping>> {
        self.mappings
            .range(..=address)
            .next_back()
            .filter(|(_, mapping)| mapping.contains(address))
            .map(|(_, mapping)| mapping.clone())
    }

    /// Finds the mapping that is exactly `[address, address + length)`
    fn exact_mapping(&self, address: VirtualAddr, length: usize) -> Result<Arc<Mapping>> {
        let mapping = self.mapping_containing(address).ok_or(Error::NotMapped)?;
        if mapping.address() != address || mapping.length() != length {
            return Err(Error::IllegalArgs);
        }
        Ok(mapping)
    }
}

/// An address space
pub struct VirtualSpace {
    ops: Arc<dyn PageTableOps>,
    wq: Arc<WorkQueue>,
    layout: SpaceLayout,
    inner: Mutex<SpaceInner>,
    rss: Arc<AtomicUsize>,
}

impl VirtualSpace {
    /// Creates an empty space covering `layout`
    pub fn new(ops: Arc<dyn PageTableOps>, wq: Arc<WorkQueue>, layout: SpaceLayout) -> Result<Arc<Self>> {
        if !layout.is_valid() {
            return Err(Error::IllegalArgs);
        }
        let inner = SpaceInner { holes: HoleTree::with_hole(layout.base, layout.length), mappings: BTreeMap::new() };
        Ok(Arc::new(Self { ops, wq, layout, inner: Mutex::new(inner), rss: Arc::new(AtomicUsize::new(0)) }))
    }

    pub fn layout(&self) -> SpaceLayout {
        self.layout
    }

    /// Bytes currently mapped into the page table
    pub fn resident_bytes(&self) -> usize {
        self.rss.load(Ordering::Relaxed)
    }

    /// Maps `length` bytes at `offset` into `slice`
    ///
    /// With [`MapFlags::FIXED`], `address` is the exact placement; otherwise
    /// it is ignored and the first fitting hole is used. Returns the address
    /// of the new mapping.
    pub async fn map(
        &self,
        slice: MemorySlice,
        address: VirtualAddr,
        offset: usize,
        length: usize,
        flags: MapFlags,
    ) -> Result<VirtualAddr> {
        if length == 0 || !is_page_aligned(length) || !is_page_aligned(offset) {
            return Err(Error::IllegalArgs);
        }
        if offset.checked_add(length).is_none_or(|end| end > slice.length()) {
            return Err(Error::BufferTooSmall);
        }

        let mapping = {
            let mut inner = self.inner.lock();
            let address = if flags.contains(MapFlags::FIXED) {
                if !is_page_aligned(address) {
                    return Err(Error::IllegalArgs);
                }
                inner.holes.allocate_fixed(address, length)?;
                address
            } else if flags.contains(MapFlags::PREFER_TOP) {
                inner.holes.allocate_top(length)?
            } else {
                inner.holes.allocate_bottom(length)?
            };
            let mapping =
                Mapping::new(address, length, slice, offset, flags.mapping_flags(), self.ops.clone(), self.rss.clone());
            inner.mappings.insert(address, mapping.clone());
            mapping
        };
        vm_debug!("vm: mapped {:#x}+{:#x} ({:?})", mapping.address(), length, flags);

        mapping.install(&self.wq).await;
        if flags.contains(MapFlags::POPULATE) {
            if let Err(error) = mapping.populate().await {
                vm_warn!("vm: populating {:#x} failed: {:?}", mapping.address(), error);
                self.unmap(mapping.address(), length).await?;
                return Err(error);
            }
        }
        Ok(mapping.address())
    }

    /// Changes the permissions of the mapping `[address, address + length)`
    pub async fn protect(&self, address: VirtualAddr, length: usize, flags: MapFlags) -> Result<()> {
        let mapping = self.inner.lock().exact_mapping(address, length)?;
        mapping.protect(flags.mapping_flags()).await;
        Ok(())
    }

    /// Removes the mapping `[address, address + length)`
    pub async fn unmap(&self, address: VirtualAddr, length: usize) -> Result<()> {
        let mapping = {
            let mut inner = self.inner.lock();
            let mapping = inner.exact_mapping(address, length)?;
            inner.mappings.remove(&address);
            mapping
        };
        self.tear_down(mapping).await;
        vm_debug!("vm: unmapped {:#x}+{:#x}", address, length);
        Ok(())
    }

    async fn tear_down(&self, mapping: Arc<Mapping>) {
        mapping.uninstall().await;
        self.inner.lock().holes.release(mapping.address(), mapping.length());
        mapping.retire().await;
    }

    /// Unmaps every mapping; the space stays usable but empty
    ///
    /// Dropping a space with mappings left schedules the same teardown on
    /// its work queue instead of waiting for it.
    pub async fn retire(&self) {
        let mappings = core::mem::take(&mut self.inner.lock().mappings);
        for mapping in mappings.into_values() {
            self.tear_down(mapping).await;
        }
    }

    /// Resolves a page fault at `address`
    pub async fn handle_fault(&self, address: VirtualAddr, flags: FaultFlags) -> FaultOutcome {
        let Some(mapping) = self.inner.lock().mapping_containing(address) else {
            vm_debug!("vm: fault at {:#x} outside of any mapping", address);
            return FaultOutcome::Unresolved(FaultError::NoMapping);
        };

        let permissions = mapping.flags();
        let allowed = permissions.is_accessible()
            && (!flags.contains(FaultFlags::WRITE) || permissions.contains(MappingFlags::PROT_WRITE))
            && (!flags.contains(FaultFlags::EXECUTE) || permissions.contains(MappingFlags::PROT_EXECUTE));
        if !allowed {
            vm_debug!("vm: protection fault at {:#x} ({:?} vs {:?})", address, flags, permissions);
            return FaultOutcome::Unresolved(FaultError::ProtectionViolation);
        }

        match mapping.touch_virtual_page(address - mapping.address(), flags.contains(FaultFlags::WRITE)).await {
            Ok(true) => FaultOutcome::Spurious,
            Ok(false) => FaultOutcome::Resolved,
            Err(error) => {
                vm_warn!("vm: could not resolve fault at {:#x}: {:?}", address, error);
                FaultOutcome::Unresolved(FaultError::Backing(error))
            }
        }
    }

    /// Pushes hardware dirty bits of `[address, address + size)` to the views
    pub async fn synchronize(&self, address: VirtualAddr, size: usize) -> Result<()> {
        let end = address.checked_add(size).ok_or(Error::IllegalArgs)?;
        let mut cursor = address;
        while cursor < end {
            let mapping = self.inner.lock().mapping_containing(cursor).ok_or(Error::NotMapped)?;
            let local = cursor - mapping.address();
            let chunk = core::cmp::min(end, mapping.end()) - cursor;
            mapping.synchronize(local, chunk).await;
            cursor += chunk;
        }
        Ok(())
    }

    /// Copies bytes out of the space, faulting pages in as needed
    pub async fn read_bytes(&self, address: VirtualAddr, buffer: &mut [u8], memory: &dyn PageAccessor) -> Result<()> {
        let mut progress = 0;
        while progress < buffer.len() {
            let cursor = address + progress;
            let mapping = self.inner.lock().mapping_containing(cursor).ok_or(Error::NotMapped)?;
            let chunk = core::cmp::min(buffer.len() - progress, mapping.end() - cursor);
            let offset = mapping.view_offset() + (cursor - mapping.address());
            copy_from_view(mapping.view().as_ref(), offset, &mut buffer[progress..progress + chunk], memory).await?;
            progress += chunk;
        }
        Ok(())
    }

    /// Copies bytes into the space, faulting pages in as needed
    pub async fn write_bytes(&self, address: VirtualAddr, data: &[u8], memory: &dyn PageAccessor) -> Result<()> {
        let mut progress = 0;
        while progress < data.len() {
            let cursor = address + progress;
            let mapping = self.inner.lock().mapping_containing(cursor).ok_or(Error::NotMapped)?;
            let chunk = core::cmp::min(data.len() - progress, mapping.end() - cursor);
            let offset = mapping.view_offset() + (cursor - mapping.address());
            copy_to_view(mapping.view().as_ref(), offset, &data[progress..progress + chunk], memory).await?;
            progress += chunk;
        }
        Ok(())
    }

    /// Mapping that contains `address`
    pub fn mapping_at(&self, address: VirtualAddr) -> Option<Arc<Mapping>> {
        self.inner.lock().mapping_containing(address)
    }

    /// Snapshot of the free ranges
    pub fn holes(&self) -> Vec<Hole> {
        self.inner.lock().holes.holes()
    }

    /// Snapshot of the mapped ranges as `(address, length)`
    pub fn mappings(&self) -> Vec<(VirtualAddr, usize)> {
        self.inner.lock().mappings.values().map(|m| (m.address(), m.length())).collect()
    }

    /// Checks that holes and mappings tile the layout without overlap
    pub fn check_tiling(&self) -> bool {
        let inner = self.inner.lock();
        if !inner.holes.check_invariants() {
            return false;
        }

        let mut ranges: Vec<(VirtualAddr, usize)> =
            inner.holes.holes().iter().map(|hole| (hole.address, hole.length)).collect();
        ranges.extend(inner.mappings.values().map(|m| (m.address(), m.length())));
        ranges.sort_unstable();

        let mut cursor = self.layout.base;
        for (address, length) in ranges {
            if address != cursor || length == 0 || page_offset(length) != 0 {
                return false;
            }
            cursor += length;
        }
        cursor == self.layout.end()
    }
}

impl Drop for VirtualSpace {
    /// Tears down mappings left behind without [`retire`](VirtualSpace::retire)
    ///
    /// The teardown runs on the work queue after the space is gone.
    fn drop(&mut self) {
        let mappings = core::mem::take(&mut self.inner.get_mut().mappings);
        if mappings.is_empty() {
            return;
        }
        vm_debug!("vm: space dropped with {} mappings", mappings.len());
        for mapping in mappings.into_values() {
            self.wq.detach(async move {
                mapping.uninstall().await;
                mapping.retire().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::allocated::AllocatedMemory;
    use crate::view::hardware::HardwareMemory;
    use nos_vm_api::testing::{SimulatedPhysicalMemory, SoftPageTable};
    use nos_vm_api::{CachingMode, PAGE_SIZE};

    const LAYOUT: SpaceLayout = SpaceLayout { base: 0x10_0000, length: 0x100_0000 };

    fn space() -> (Arc<WorkQueue>, Arc<SoftPageTable>, Arc<VirtualSpace>) {
        let wq = WorkQueue::new();
        let table = Arc::new(SoftPageTable::new());
        let space = VirtualSpace::new(table.clone(), wq.clone(), LAYOUT).unwrap();
        (wq, table, space)
    }

    fn window(pages: usize) -> MemorySlice {
        MemorySlice::whole(Arc::new(HardwareMemory::new(0x8000_0000, pages * PAGE_SIZE, CachingMode::Uncached)))
    }

    fn block_on<T: Send + 'static>(wq: &Arc<WorkQueue>, future: impl core::future::Future<Output = T> + Send + 'static) -> T {
        let handle = wq.spawn(future);
        wq.run();
        handle.try_take().expect("operation did not complete")
    }

    #[test]
    fn test_invalid_layout_rejected() {
        let wq = WorkQueue::new();
        let table = Arc::new(SoftPageTable::new());
        let layout = SpaceLayout { base: 0x1001, length: PAGE_SIZE };
        assert_eq!(VirtualSpace::new(table, wq, layout).err(), Some(Error::IllegalArgs));
    }

    #[test]
    fn test_placement_policies() {
        let (wq, _, space) = space();
        let s = space.clone();
        let (bottom, top, fixed) = block_on(&wq, async move {
            let flags = MapFlags::PROT_READ;
            let bottom = s.map(window(2), 0, 0, 2 * PAGE_SIZE, flags).await.unwrap();
            let top = s.map(window(1), 0, 0, PAGE_SIZE, flags | MapFlags::PREFER_TOP).await.unwrap();
            let fixed = s.map(window(1), 0x20_0000, 0, PAGE_SIZE, flags | MapFlags::FIXED).await.unwrap();
            (bottom, top, fixed)
        });
        assert_eq!(bottom, LAYOUT.base);
        assert_eq!(top, LAYOUT.end() - PAGE_SIZE);
        assert_eq!(fixed, 0x20_0000);
        assert!(space.check_tiling());

        let s = space.clone();
        let clash = block_on(&wq, async move {
            s.map(window(1), LAYOUT.base + PAGE_SIZE, 0, PAGE_SIZE, MapFlags::FIXED).await
        });
        assert_eq!(clash, Err(Error::AddressInUse));
    }

    #[test]
    fn test_map_validates_arguments() {
        let (wq, _, space) = space();
        let s = space.clone();
        let (too_long, unaligned) = block_on(&wq, async move {
            (
                s.map(window(2), 0, PAGE_SIZE, 2 * PAGE_SIZE, MapFlags::PROT_READ).await,
                s.map(window(2), 0, 0, 100, MapFlags::PROT_READ).await,
            )
        });
        assert_eq!(too_long, Err(Error::BufferTooSmall));
        assert_eq!(unaligned, Err(Error::IllegalArgs));
        assert_eq!(space.holes(), alloc::vec![Hole::new(LAYOUT.base, LAYOUT.length)]);
    }

    #[test]
    fn test_hardware_pages_installed_eagerly() {
        let (wq, table, space) = space();
        let s = space.clone();
        let address = block_on(&wq, async move {
            s.map(window(3), 0, 0, 3 * PAGE_SIZE, MapFlags::PROT_READ | MapFlags::PROT_WRITE).await.unwrap()
        });
        assert_eq!(table.mapped_pages(), 3);
        assert_eq!(table.lookup(address + 2 * PAGE_SIZE).unwrap().physical, 0x8000_0000 + 2 * PAGE_SIZE);
        assert_eq!(space.resident_bytes(), 3 * PAGE_SIZE);

        let s = space.clone();
        let outcome = block_on(&wq, async move { s.handle_fault(address, FaultFlags::WRITE).await });
        assert_eq!(outcome, FaultOutcome::Spurious);
    }

    #[test]
    fn test_fault_classification() {
        let (wq, _, space) = space();
        let memory = Arc::new(SimulatedPhysicalMemory::new(8));
        let view = Arc::new(AllocatedMemory::new(memory, 2 * PAGE_SIZE));
        let s = space.clone();
        let outcomes = block_on(&wq, async move {
            let address = s.map(MemorySlice::whole(view), 0, 0, 2 * PAGE_SIZE, MapFlags::PROT_READ).await.unwrap();
            [
                s.handle_fault(address, FaultFlags::empty()).await,
                s.handle_fault(address, FaultFlags::empty()).await,
                s.handle_fault(address + PAGE_SIZE, FaultFlags::WRITE).await,
                s.handle_fault(address + PAGE_SIZE, FaultFlags::EXECUTE).await,
                s.handle_fault(address + 2 * PAGE_SIZE, FaultFlags::empty()).await,
            ]
        });
        assert_eq!(outcomes[0], FaultOutcome::Resolved);
        assert_eq!(outcomes[1], FaultOutcome::Spurious);
        assert_eq!(outcomes[2], FaultOutcome::Unresolved(FaultError::ProtectionViolation));
        assert_eq!(outcomes[3], FaultOutcome::Unresolved(FaultError::ProtectionViolation));
        assert_eq!(outcomes[4], FaultOutcome::Unresolved(FaultError::NoMapping));
    }

    #[test]
    fn test_unmap_requires_exact_range() {
        let (wq, table, space) = space();
        let s = space.clone();
        let (partial, missing, exact) = block_on(&wq, async move {
            let address = s.map(window(2), 0, 0, 2 * PAGE_SIZE, MapFlags::PROT_READ).await.unwrap();
            (
                s.unmap(address, PAGE_SIZE).await,
                s.unmap(address + 4 * PAGE_SIZE, PAGE_SIZE).await,
                s.unmap(address, 2 * PAGE_SIZE).await,
            )
        });
        assert_eq!(partial, Err(Error::IllegalArgs));
        assert_eq!(missing, Err(Error::NotMapped));
        assert_eq!(exact, Ok(()));
        assert_eq!(table.mapped_pages(), 0);
        assert_eq!(space.resident_bytes(), 0);
        assert_eq!(space.holes(), alloc::vec![Hole::new(LAYOUT.base, LAYOUT.length)]);
    }

    #[test]
    fn test_retire_unmaps_everything() {
        let (wq, table, space) = space();
        let s = space.clone();
        block_on(&wq, async move {
            s.map(window(1), 0, 0, PAGE_SIZE, MapFlags::PROT_READ).await.unwrap();
            s.map(window(2), 0, 0, 2 * PAGE_SIZE, MapFlags::PROT_READ | MapFlags::PREFER_TOP).await.unwrap();
            s.retire().await;
        });
        assert!(space.mappings().is_empty());
        assert_eq!(table.mapped_pages(), 0);
        assert!(space.check_tiling());
    }
}
