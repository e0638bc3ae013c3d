//! Memory module: collaborator interfaces and page-level types

pub mod interface;
pub mod types;

// Re-export commonly used items
pub use interface::*;
pub use types::*;
