//! Error handling for the virtual memory subsystem
//!
//! Every fallible operation of the subsystem reports one of the variants
//! below. Errors are plain values without heap payloads so that they can be
//! produced in any context, including while a spinlock is held.

use core::fmt;

/// Common error type used throughout the virtual memory subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The requested range exceeds the length of the underlying view
    BufferTooSmall,
    /// The access cannot be satisfied (unbound slot, disallowed backing, dead mapping)
    Fault,
    /// An index (e.g. an indirection slot) is out of bounds
    OutOfBounds,
    /// The object does not support the requested operation
    IllegalObject,
    /// Misaligned or otherwise malformed arguments
    IllegalArgs,
    /// No free virtual range is large enough
    NoMemory,
    /// A fixed allocation overlaps an existing mapping
    AddressInUse,
    /// No mapping exists at the given address
    NotMapped,
}

impl Error {
    /// Short, stable name of the error (used in log records)
    pub const fn as_str(&self) -> &'static str {
        match self {
            Error::BufferTooSmall => "buffer too small",
            Error::Fault => "fault",
            Error::OutOfBounds => "out of bounds",
            Error::IllegalObject => "illegal object",
            Error::IllegalArgs => "illegal arguments",
            Error::NoMemory => "no memory",
            Error::AddressInUse => "address in use",
            Error::NotMapped => "not mapped",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BufferTooSmall => write!(f, "Range exceeds the length of the view"),
            Error::Fault => write!(f, "Access cannot be satisfied"),
            Error::OutOfBounds => write!(f, "Index out of bounds"),
            Error::IllegalObject => write!(f, "Operation not supported by this object"),
            Error::IllegalArgs => write!(f, "Invalid arguments"),
            Error::NoMemory => write!(f, "No free virtual range is large enough"),
            Error::AddressInUse => write!(f, "Address range is already in use"),
            Error::NotMapped => write!(f, "No mapping at this address"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;
