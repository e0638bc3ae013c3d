//! Page-level memory types shared by the page-table writer and the views

use bitflags::bitflags;

use crate::core::types::PhysicalAddr;

bitflags! {
    /// Hardware permissions of a single page translation
    ///
    /// Read access is implied by every present translation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageAccess: u32 {
        /// Writes are allowed
        const WRITE = 1 << 0;
        /// Instruction fetches are allowed
        const EXECUTE = 1 << 1;
    }
}

bitflags! {
    /// Status of a translation before it was cleared or cleaned
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageStatus: u32 {
        /// A translation was present
        const PRESENT = 1 << 0;
        /// The hardware dirty bit was set
        const DIRTY = 1 << 1;
        /// The translation allowed writes
        const WRITABLE = 1 << 2;
    }
}

/// Cache attributes of a physical range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CachingMode {
    /// Architecture default (normally write-back)
    #[default]
    Null,
    /// Uncached, strongly ordered
    Uncached,
    /// Write-combining
    WriteCombine,
    /// Write-through
    WriteThrough,
    /// Write-back
    WriteBack,
}

/// A physical range handed out by a memory view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalRange {
    /// First physical byte of the range
    pub physical: PhysicalAddr,
    /// Number of bytes that are contiguous from `physical`
    pub size: usize,
    /// Cache attributes
    pub caching: CachingMode,
    /// Whether the range may be mapped writable
    pub writable: bool,
}

impl PhysicalRange {
    /// Creates a writable range
    pub const fn new(physical: PhysicalAddr, size: usize, caching: CachingMode) -> Self {
        Self { physical, size, caching, writable: true }
    }

    /// Creates a range that must only be mapped read-only
    pub const fn read_only(physical: PhysicalAddr, size: usize, caching: CachingMode) -> Self {
        Self { physical, size, caching, writable: false }
    }
}
