//! Software page table

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::core::types::{page_offset, page_round_down, PhysicalAddr, VirtualAddr, PAGE_SIZE};
use crate::memory::{CachingMode, PageAccess, PageAccessor, PageStatus, PageTableOps};
use crate::task::BoxFuture;

/// One translation of a [`SoftPageTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftEntry {
    /// Target frame
    pub physical: PhysicalAddr,
    /// Hardware permissions
    pub access: PageAccess,
    /// Cache attributes
    pub caching: CachingMode,
    /// Dirty bit, set by [`SoftPageTable::cpu_write`]
    pub dirty: bool,
}

/// A page table kept in a host map
///
/// Besides implementing [`PageTableOps`], it can emulate CPU loads and stores
/// so tests observe exactly what a process would see.
#[derive(Default)]
pub struct SoftPageTable {
    entries: Mutex<BTreeMap<VirtualAddr, SoftEntry>>,
    shootdowns: Mutex<Vec<(VirtualAddr, usize)>>,
    maps: AtomicUsize,
}

impl SoftPageTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the translation of the page containing `va`
    pub fn lookup(&self, va: VirtualAddr) -> Option<SoftEntry> {
        self.entries.lock().get(&page_round_down(va)).copied()
    }

    /// Number of present translations
    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }

    /// Number of `map_single` calls so far
    pub fn map_calls(&self) -> usize {
        self.maps.load(Ordering::Relaxed)
    }

    /// Shootdowns issued so far
    pub fn shootdowns(&self) -> Vec<(VirtualAddr, usize)> {
        self.shootdowns.lock().clone()
    }

    /// Emulates a store; returns `false` where the CPU would fault
    pub fn cpu_write(&self, memory: &dyn PageAccessor, va: VirtualAddr, bytes: &[u8]) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&page_round_down(va)) else {
            return false;
        };
        if !entry.access.contains(PageAccess::WRITE) || page_offset(va) + bytes.len() > PAGE_SIZE {
            return false;
        }
        entry.dirty = true;
        memory.write(entry.physical + page_offset(va), bytes);
        true
    }

    /// Emulates a load; returns `false` where the CPU would fault
    pub fn cpu_read(&self, memory: &dyn PageAccessor, va: VirtualAddr, buffer: &mut [u8]) -> bool {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(&page_round_down(va)) else {
            return false;
        };
        if page_offset(va) + buffer.len() > PAGE_SIZE {
            return false;
        }
        memory.read(entry.physical + page_offset(va), buffer);
        true
    }
}

fn status_of(entry: &SoftEntry) -> PageStatus {
    let mut status = PageStatus::PRESENT;
    if entry.dirty {
        status |= PageStatus::DIRTY;
    }
    if entry.access.contains(PageAccess::WRITE) {
        status |= PageStatus::WRITABLE;
    }
    status
}

impl PageTableOps for SoftPageTable {
    fn map_single(&self, va: VirtualAddr, pa: PhysicalAddr, access: PageAccess, caching: CachingMode) {
        assert!(page_offset(va) == 0 && page_offset(pa) == 0, "unaligned translation");
        self.maps.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .entries
            .lock()
            .insert(va, SoftEntry { physical: pa, access, caching, dirty: false });
        assert!(previous.is_none(), "translation for {:#x} installed twice", va);
    }

    fn unmap_single(&self, va: VirtualAddr) -> PageStatus {
        self.entries
            .lock()
            .remove(&va)
            .map(|entry| status_of(&entry))
            .unwrap_or_default()
    }

    fn clean_single(&self, va: VirtualAddr) -> PageStatus {
        let mut entries = self.entries.lock();
        match entries.get_mut(&va) {
            Some(entry) => {
                let status = status_of(entry);
                entry.dirty = false;
                status
            }
            None => PageStatus::empty(),
        }
    }

    fn is_mapped(&self, va: VirtualAddr) -> bool {
        self.entries.lock().contains_key(&va)
    }

    fn shootdown(&self, va: VirtualAddr, size: usize) -> BoxFuture<'static, ()> {
        self.shootdowns.lock().push((va, size));
        alloc::boxed::Box::pin(core::future::ready(()))
    }
}
