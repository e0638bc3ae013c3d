//! Test doubles for the collaborator traits
//!
//! Enabled with the `testing` feature. They model physical memory and a
//! page table in host memory so that the whole subsystem can be exercised
//! without hardware.

pub mod page_table;
pub mod physical;

pub use page_table::{SoftEntry, SoftPageTable};
pub use physical::SimulatedPhysicalMemory;
