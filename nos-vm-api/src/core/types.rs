//! Core types used throughout the virtual memory subsystem

use static_assertions::const_assert;

/// Physical address type
pub type PhysicalAddr = usize;

/// Virtual address type
pub type VirtualAddr = usize;

/// Page number type
pub type PageNum = usize;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Align address up to page boundary
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Offset of `addr` within its page
#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

/// Checks whether `addr` sits on a page boundary
#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

/// Page index of a byte offset
#[inline]
pub const fn page_index(offset: usize) -> PageNum {
    offset >> PAGE_SHIFT
}
