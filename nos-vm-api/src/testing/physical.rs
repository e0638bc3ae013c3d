//! Simulated physical memory

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;

use crate::core::types::{page_round_down, PhysicalAddr, PAGE_SIZE};
use crate::memory::{PageAccessor, PhysicalAllocator};

/// Fill pattern of freshly allocated frames; real frames are not zeroed either.
pub const STALE_BYTE: u8 = 0xa5;

const BASE: PhysicalAddr = 0x1000_0000;

struct SimState {
    next: PhysicalAddr,
    free: BTreeMap<usize, Vec<PhysicalAddr>>,
    live: HashMap<PhysicalAddr, usize>,
    frames: HashMap<PhysicalAddr, Box<[u8; PAGE_SIZE]>>,
    used_pages: usize,
}

/// Physical memory backed by host allocations
///
/// Allocation fails once `total_pages` pages are in use, which lets tests
/// create memory pressure deterministically.
pub struct SimulatedPhysicalMemory {
    total_pages: usize,
    state: Mutex<SimState>,
}

impl SimulatedPhysicalMemory {
    /// Creates a memory with room for `total_pages` pages
    pub fn new(total_pages: usize) -> Self {
        Self {
            total_pages,
            state: Mutex::new(SimState {
                next: BASE,
                free: BTreeMap::new(),
                live: HashMap::new(),
                frames: HashMap::new(),
                used_pages: 0,
            }),
        }
    }

    /// Checks whether `physical` is the start of a live allocation
    pub fn is_allocated(&self, physical: PhysicalAddr) -> bool {
        self.state.lock().live.contains_key(&physical)
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Reads a whole page (test convenience)
    pub fn page_bytes(&self, physical: PhysicalAddr) -> Vec<u8> {
        let mut buffer = alloc::vec![0u8; PAGE_SIZE];
        self.read(page_round_down(physical), &mut buffer);
        buffer
    }

    fn with_bytes(&self, physical: PhysicalAddr, len: usize, mut f: impl FnMut(&mut [u8], usize)) {
        let mut state = self.state.lock();
        let mut progress = 0;
        while progress < len {
            let addr = physical + progress;
            let page = page_round_down(addr);
            let disp = addr - page;
            let chunk = core::cmp::min(PAGE_SIZE - disp, len - progress);
            let frame = state
                .frames
                .entry(page)
                .or_insert_with(|| Box::new([STALE_BYTE; PAGE_SIZE]));
            f(&mut frame[disp..disp + chunk], progress);
            progress += chunk;
        }
    }
}

impl PhysicalAllocator for SimulatedPhysicalMemory {
    fn allocate(&self, size: usize, alignment: usize) -> Option<PhysicalAddr> {
        assert!(size % PAGE_SIZE == 0, "allocation of {:#x} bytes is not page granular", size);
        let alignment = alignment.max(PAGE_SIZE);
        let pages = size / PAGE_SIZE;

        let mut state = self.state.lock();
        if state.used_pages + pages > self.total_pages {
            return None;
        }

        let reused = state.free.get_mut(&size).and_then(|list| {
            let position = list.iter().position(|addr| addr % alignment == 0)?;
            Some(list.swap_remove(position))
        });
        let physical = match reused {
            Some(physical) => physical,
            None => {
                let physical = (state.next + alignment - 1) & !(alignment - 1);
                state.next = physical + size;
                physical
            }
        };

        for page in (physical..physical + size).step_by(PAGE_SIZE) {
            state.frames.insert(page, Box::new([STALE_BYTE; PAGE_SIZE]));
        }
        state.live.insert(physical, size);
        state.used_pages += pages;
        Some(physical)
    }

    fn free(&self, physical: PhysicalAddr, size: usize) {
        let mut state = self.state.lock();
        let recorded = state.live.remove(&physical);
        assert_eq!(recorded, Some(size), "bad free of {:#x} ({:#x} bytes)", physical, size);
        state.used_pages -= size / PAGE_SIZE;
        state.free.entry(size).or_default().push(physical);
    }

    fn used_pages(&self) -> usize {
        self.state.lock().used_pages
    }

    fn total_pages(&self) -> usize {
        self.total_pages
    }
}

impl PageAccessor for SimulatedPhysicalMemory {
    fn zero(&self, physical: PhysicalAddr, size: usize) {
        self.with_bytes(physical, size, |bytes, _| bytes.fill(0));
    }

    fn copy_page(&self, dest: PhysicalAddr, src: PhysicalAddr) {
        let mut page = [0u8; PAGE_SIZE];
        self.read(src, &mut page);
        self.write(dest, &page);
    }

    fn read(&self, physical: PhysicalAddr, buffer: &mut [u8]) {
        let len = buffer.len();
        self.with_bytes(physical, len, |bytes, progress| {
            buffer[progress..progress + bytes.len()].copy_from_slice(bytes);
        });
    }

    fn write(&self, physical: PhysicalAddr, buffer: &[u8]) {
        self.with_bytes(physical, buffer.len(), |bytes, progress| {
            let len = bytes.len();
            bytes.copy_from_slice(&buffer[progress..progress + len]);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_limit_and_reuse() {
        let memory = SimulatedPhysicalMemory::new(2);
        let a = memory.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        let b = memory.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_ne!(a, b);
        assert!(memory.allocate(PAGE_SIZE, PAGE_SIZE).is_none());

        memory.free(a, PAGE_SIZE);
        assert_eq!(memory.used_pages(), 1);
        assert_eq!(memory.allocate(PAGE_SIZE, PAGE_SIZE), Some(a));
    }

    #[test]
    fn test_frames_start_stale() {
        let memory = SimulatedPhysicalMemory::new(4);
        let frame = memory.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert!(memory.page_bytes(frame).iter().all(|&b| b == STALE_BYTE));

        memory.zero(frame, PAGE_SIZE);
        memory.write(frame + 10, b"abc");
        let mut out = [0u8; 4];
        memory.read(frame + 9, &mut out);
        assert_eq!(&out, b"\0abc");
    }

    #[test]
    fn test_aligned_chunks() {
        let memory = SimulatedPhysicalMemory::new(64);
        memory.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        let chunk = memory.allocate(4 * PAGE_SIZE, 4 * PAGE_SIZE).unwrap();
        assert_eq!(chunk % (4 * PAGE_SIZE), 0);
        assert_eq!(memory.used_pages(), 5);
    }
}
