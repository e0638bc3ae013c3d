//! NOS VM API - Interfaces and primitives for the NOS virtual memory subsystem
//!
//! This crate holds everything the virtual memory manager shares with the
//! rest of the kernel:
//!
//! - **Core**: address types, page constants and alignment helpers
//! - **Error**: the error taxonomy of the subsystem
//! - **Memory**: interfaces of the physical allocator, the direct-map
//!   accessor and the architecture page-table writer
//! - **Sync**: spinlocks plus async mutexes and events for state that must
//!   stay consistent across suspension points
//! - **Task**: the cooperative work queue that drives asynchronous operations
//! - **Testing** (feature `testing`): simulated physical memory and a
//!   software page table
//!
//! # Usage
//!
//! ```rust
//! use nos_vm_api::task::WorkQueue;
//!
//! let wq = WorkQueue::new();
//! let handle = wq.spawn(async { 1 + 1 });
//! wq.run();
//! assert_eq!(handle.try_take(), Some(2));
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

extern crate alloc;

// Core modules
pub mod core;
pub mod error;
pub mod memory;
pub mod sync;
pub mod task;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used items
pub use crate::core::types::*;
pub use crate::error::{Error, Result};
pub use crate::memory::{
    CachingMode, PageAccess, PageAccessor, PageStatus, PageTableOps, PhysicalAllocator, PhysicalMemory,
    PhysicalRange,
};
pub use crate::task::{BoxFuture, JoinHandle, WorkQueue};
