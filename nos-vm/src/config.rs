//! Run-time configuration of the virtual memory subsystem
//!
//! Kernel start-up builds one [`VmConfig`] (usually the default) and hands
//! its parts to the objects that need them: the layout to every new
//! [`VirtualSpace`](crate::space::VirtualSpace), the reclaim policy to the
//! [`MemoryReclaimer`](crate::reclaim::MemoryReclaimer) and the paging
//! policy to every [`ManagedSpace`](crate::view::managed::ManagedSpace).

use nos_vm_api::{is_page_aligned, VirtualAddr};

/// Default bottom of the user address range
pub const DEFAULT_SPACE_BASE: VirtualAddr = 0x10_0000;

/// Default length of the user address range
pub const DEFAULT_SPACE_LENGTH: usize = 0x7fff_fff0_0000;

/// Address range a new [`VirtualSpace`](crate::space::VirtualSpace) hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceLayout {
    /// First allocatable address
    pub base: VirtualAddr,
    /// Length of the allocatable range
    pub length: usize,
}

impl SpaceLayout {
    /// Layout of a user address space
    pub const fn user() -> Self {
        Self { base: DEFAULT_SPACE_BASE, length: DEFAULT_SPACE_LENGTH }
    }

    /// Checks that the range is non-empty, page aligned and does not wrap
    pub fn is_valid(&self) -> bool {
        self.length > 0
            && is_page_aligned(self.base)
            && is_page_aligned(self.length)
            && self.base.checked_add(self.length).is_some()
    }

    /// End of the allocatable range (exclusive)
    pub const fn end(&self) -> VirtualAddr {
        self.base + self.length
    }
}

impl Default for SpaceLayout {
    fn default() -> Self {
        Self::user()
    }
}

/// Policy of the page reclaimer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimConfig {
    /// Sleep between reclaim rounds under normal load (nanoseconds)
    pub interval_ns: u64,
    /// Sleep between reclaim rounds while memory is under pressure (nanoseconds)
    pub pressure_interval_ns: u64,
    /// Percentage of used physical pages above which memory is under pressure
    pub watermark_percent: usize,
    /// Cached bytes that are kept even without pressure
    pub cache_floor: usize,
    /// Disables uncaching altogether (debugging aid)
    pub disabled: bool,
}

impl ReclaimConfig {
    /// Default policy: 1s rounds, 10ms under pressure, 75% watermark, 1 MiB floor
    pub const fn new() -> Self {
        Self {
            interval_ns: 1_000_000_000,
            pressure_interval_ns: 10_000_000,
            watermark_percent: 75,
            cache_floor: 1 << 20,
            disabled: false,
        }
    }

    /// Checks whether `used` out of `total` pages is above the watermark
    pub fn under_pressure(&self, used: usize, total: usize) -> bool {
        total > 0 && used * 100 > total * self.watermark_percent
    }
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Paging policy of a managed space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedConfig {
    /// Number of pages following a missing page that are initialized with it
    pub read_ahead: usize,
}

impl ManagedConfig {
    /// Default policy: read ahead three pages
    pub const fn new() -> Self {
        Self { read_ahead: 3 }
    }

    /// Policy without read-ahead
    pub const fn without_read_ahead() -> Self {
        Self { read_ahead: 0 }
    }
}

impl Default for ManagedConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of the whole subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmConfig {
    /// Address range of new spaces
    pub layout: SpaceLayout,
    /// Reclaimer policy
    pub reclaim: ReclaimConfig,
    /// Managed space policy
    pub managed: ManagedConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let layout = SpaceLayout::default();
        assert!(layout.is_valid());
        assert_eq!(layout.base, 0x100000);
        assert_eq!(layout.end(), 0x7fff_fff0_0000 + 0x100000);
    }

    #[test]
    fn test_pressure_watermark() {
        let config = ReclaimConfig::default();
        assert!(!config.under_pressure(75, 100));
        assert!(config.under_pressure(76, 100));
        assert!(!config.under_pressure(0, 0));
    }

    #[test]
    fn test_invalid_layout() {
        assert!(!SpaceLayout { base: 0x1001, length: 0x1000 }.is_valid());
        assert!(!SpaceLayout { base: 0x1000, length: 0 }.is_valid());
        assert!(!SpaceLayout { base: usize::MAX & !0xfff, length: 0x2000 }.is_valid());
    }
}
