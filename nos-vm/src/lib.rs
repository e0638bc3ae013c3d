//! NOS VM - Address spaces and memory views
//!
//! This crate is the virtual memory manager of the NOS microkernel:
//!
//! - **Space**: [`VirtualSpace`] places mappings into an address space,
//!   resolves page faults and tears mappings down again
//! - **Mapping**: [`Mapping`] binds a virtual range to a view range and
//!   answers evictions of that view
//! - **View**: the [`MemoryView`] backing stores (hardware windows,
//!   anonymous memory, manager-driven page caches, copy-on-write memory
//!   and indirection slots)
//! - **Reclaim**: [`MemoryReclaimer`] evicts least recently used cache
//!   pages under memory pressure
//! - **Hole**: [`HoleTree`], the free-range allocator of a space
//!
//! Physical frames, the architecture page table and the scheduler are
//! collaborators described by the traits of `nos_vm_api`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use nos_vm::{MapFlags, MemorySlice, VirtualSpace};
//!
//! let space = VirtualSpace::new(page_table, wq.clone(), SpaceLayout::user())?;
//! let address = space.map(MemorySlice::whole(view), 0, 0, length, MapFlags::PROT_READ).await?;
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(clippy::all)]

extern crate alloc;

#[macro_use]
mod logging;

pub mod config;
pub mod hole;
pub mod mapping;
pub mod reclaim;
pub mod space;
pub mod view;

pub use config::{ManagedConfig, ReclaimConfig, SpaceLayout, VmConfig};
pub use hole::{Hole, HoleTree};
pub use mapping::{Mapping, MappingFlags, MappingState};
pub use reclaim::{CacheBundle, MemoryReclaimer, ReclaimStats};
pub use space::{FaultError, FaultFlags, FaultOutcome, MapFlags, VirtualSpace};
pub use view::allocated::AllocatedMemory;
pub use view::cow::{CopyOnWriteMemory, CowChain};
pub use view::hardware::HardwareMemory;
pub use view::indirect::IndirectMemory;
pub use view::lock_handle::MemoryViewLockHandle;
pub use view::managed::{BackingMemory, FrontalMemory, LoadState, ManagedSpace};
pub use view::{
    AddressIdentity, EvictionQueue, FetchFlags, ManageRequest, ManagementRequest, MemoryObserver, MemorySlice,
    MemoryView,
};

pub use nos_vm_api::{Error, Result};
